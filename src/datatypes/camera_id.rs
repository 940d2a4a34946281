use anyhow::{Error, bail, ensure};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// External camera identifier, canonical string form `camera<N>`.
///
/// The identifier is stable across hardware re-plug and is the only form
/// leaked to upper layers. The numeric index is used to derive the media
/// server path name, which is identical to the string form.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[serde(try_from = "CameraIdSerde")]
#[serde(into = "CameraIdSerde")]
pub struct CameraId {
    index: usize,
}
impl CameraId {
    pub const PREFIX: &'static str = "camera";

    pub fn new(index: usize) -> Self {
        Self { index }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Media server path name for this camera. One-to-one, same canonical
    /// form as the identifier itself.
    pub fn path_name(&self) -> String {
        self.to_string()
    }
}
impl FromStr for CameraId {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let index = match value.strip_prefix(Self::PREFIX) {
            Some(index) => index,
            None => bail!("missing {:?} prefix: {:?}", Self::PREFIX, value),
        };
        ensure!(!index.is_empty(), "missing index: {:?}", value);
        ensure!(
            index == "0" || !index.starts_with('0'),
            "non-canonical index: {:?}",
            value
        );

        let index = index.parse::<usize>()?;

        Ok(Self { index })
    }
}
impl fmt::Display for CameraId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, self.index)
    }
}

impl TryFrom<CameraIdSerde> for CameraId {
    type Error = Error;

    fn try_from(value: CameraIdSerde) -> Result<Self, Self::Error> {
        value.inner.parse()
    }
}
impl From<CameraId> for CameraIdSerde {
    fn from(value: CameraId) -> Self {
        Self {
            inner: value.to_string(),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(transparent)]
struct CameraIdSerde {
    inner: String,
}

#[cfg(test)]
mod tests {
    use super::CameraId;

    #[test]
    fn parses_canonical() {
        let camera_id: CameraId = "camera0".parse().unwrap();
        assert_eq!(camera_id.index(), 0);

        let camera_id: CameraId = "camera17".parse().unwrap();
        assert_eq!(camera_id.index(), 17);
        assert_eq!(camera_id.to_string(), "camera17");
        assert_eq!(camera_id.path_name(), "camera17");
    }

    #[test]
    fn rejects_malformed() {
        assert!("camera".parse::<CameraId>().is_err());
        assert!("camera01".parse::<CameraId>().is_err());
        assert!("camera-1".parse::<CameraId>().is_err());
        assert!("cam0".parse::<CameraId>().is_err());
        assert!("camera0x".parse::<CameraId>().is_err());
        assert!("".parse::<CameraId>().is_err());
    }

    #[test]
    fn roundtrips_serde() {
        let camera_id = CameraId::new(3);
        let serialized = serde_json::to_string(&camera_id).unwrap();
        assert_eq!(serialized, "\"camera3\"");
        let deserialized: CameraId = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized, camera_id);
    }
}
