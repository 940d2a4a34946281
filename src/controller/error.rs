use crate::{datatypes::camera_id::CameraId, mediamtx::api::ApiError};
use anyhow::Error;
use std::fmt;

/// One snapshot tier's failure, in attempt order.
#[derive(Clone, Debug)]
pub struct TierFailure {
    pub tier: u8,
    pub message: String,
}
impl fmt::Display for TierFailure {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "tier {}: {}", self.tier, self.message)
    }
}

/// Typed failure of a public controller operation. Every variant carries a
/// stable code and a short human message (`Display`).
#[derive(Debug)]
pub enum OperationError {
    CameraUnknown { camera_id: CameraId },
    AlreadyRecording { camera_id: CameraId },
    NotRecording { camera_id: CameraId },
    NotReady,
    NotConfigured,
    ServerUnavailable { message: String },
    InvalidFormat { message: String },
    InvalidOptions { message: String },
    AllTiersFailed { failures: Vec<TierFailure> },
    Filesystem { message: String },
    Hardware { message: String },
    Cancelled,
    Internal { source: Error },
}
impl OperationError {
    pub fn code(&self) -> &'static str {
        match self {
            OperationError::CameraUnknown { .. } => "CAMERA_UNKNOWN",
            OperationError::AlreadyRecording { .. } => "ALREADY_RECORDING",
            OperationError::NotRecording { .. } => "NOT_RECORDING",
            OperationError::NotReady => "NOT_READY",
            OperationError::NotConfigured => "NOT_CONFIGURED",
            OperationError::ServerUnavailable { .. } => "SERVER_UNAVAILABLE",
            OperationError::InvalidFormat { .. } => "INVALID_FORMAT",
            OperationError::InvalidOptions { .. } => "INVALID_OPTIONS",
            OperationError::AllTiersFailed { .. } => "ALL_TIERS_FAILED",
            OperationError::Filesystem { .. } => "FILESYSTEM",
            OperationError::Hardware { .. } => "HARDWARE",
            OperationError::Cancelled => "CANCELLED",
            OperationError::Internal { .. } => "INTERNAL",
        }
    }

    /// Maps a server call failure that reached a public operation. Retries
    /// happened below; anything transient left over means the server is
    /// effectively unavailable.
    pub fn from_api(error: ApiError) -> Self {
        match error {
            error @ (ApiError::Server { .. } | ApiError::Transport { .. }) => {
                OperationError::ServerUnavailable {
                    message: error.to_string(),
                }
            }
            error => OperationError::Internal {
                source: Error::new(error),
            },
        }
    }
}
impl fmt::Display for OperationError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            OperationError::CameraUnknown { camera_id } => {
                write!(f, "camera does not exist: {camera_id}")
            }
            OperationError::AlreadyRecording { camera_id } => {
                write!(f, "recording already active: {camera_id}")
            }
            OperationError::NotRecording { camera_id } => {
                write!(f, "no recording active: {camera_id}")
            }
            OperationError::NotReady => write!(f, "orchestrator is not ready yet"),
            OperationError::NotConfigured => write!(f, "subsystem is not configured"),
            OperationError::ServerUnavailable { message } => {
                write!(f, "media server unavailable: {message}")
            }
            OperationError::InvalidFormat { message } => {
                write!(f, "invalid recording format: {message}")
            }
            OperationError::InvalidOptions { message } => {
                write!(f, "invalid options: {message}")
            }
            OperationError::AllTiersFailed { failures } => {
                write!(f, "all snapshot tiers failed: ")?;
                for (index, failure) in failures.iter().enumerate() {
                    if index > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{failure}")?;
                }
                Ok(())
            }
            OperationError::Filesystem { message } => write!(f, "filesystem error: {message}"),
            OperationError::Hardware { message } => write!(f, "hardware error: {message}"),
            OperationError::Cancelled => write!(f, "operation cancelled"),
            OperationError::Internal { source } => write!(f, "internal error: {source:#}"),
        }
    }
}
impl std::error::Error for OperationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OperationError::Internal { source } => Some(source.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::OperationError;
    use crate::{datatypes::camera_id::CameraId, mediamtx::api::ApiError};
    use http::StatusCode;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            OperationError::CameraUnknown {
                camera_id: CameraId::new(0),
            }
            .code(),
            "CAMERA_UNKNOWN"
        );
        assert_eq!(OperationError::NotReady.code(), "NOT_READY");
        assert_eq!(OperationError::Cancelled.code(), "CANCELLED");
    }

    #[test]
    fn api_errors_map_by_transience() {
        let mapped = OperationError::from_api(ApiError::Server {
            status: StatusCode::BAD_GATEWAY,
            body: String::new(),
        });
        assert!(matches!(mapped, OperationError::ServerUnavailable { .. }));

        let mapped = OperationError::from_api(ApiError::NotFound);
        assert!(matches!(mapped, OperationError::Internal { .. }));
    }
}
