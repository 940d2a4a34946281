use super::path::{ItemsPage, PathConfiguration, PathRuntimeState, runtime_state_parse};
use crate::util::backoff::Backoff;
use anyhow::{Context as _, Error, ensure};
use http::StatusCode;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde::de::DeserializeOwned;
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

/// Failure of one logical server call, after retries.
#[derive(Debug)]
pub enum ApiError {
    /// 404 on a named resource.
    NotFound,
    /// The server refused a create because the path already exists.
    AlreadyExists,
    /// Any other 4xx. Terminal, never retried.
    Client { status: StatusCode, body: String },
    /// 5xx. Transient, retried with backoff.
    Server { status: StatusCode, body: String },
    /// Connection, timeout or protocol failure below HTTP semantics.
    Transport { source: reqwest::Error },
    /// 2xx carrying a body this client could not decode.
    Decode { source: Error },
}
impl ApiError {
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Server { .. } => true,
            ApiError::Transport { .. } => true,
            _ => false,
        }
    }
}
impl fmt::Display for ApiError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            ApiError::NotFound => write!(f, "not found"),
            ApiError::AlreadyExists => write!(f, "already exists"),
            ApiError::Client { status, body } => write!(f, "client error {status}: {body}"),
            ApiError::Server { status, body } => write!(f, "server error {status}: {body}"),
            ApiError::Transport { source } => write!(f, "transport error: {source}"),
            ApiError::Decode { source } => write!(f, "decode error: {source}"),
        }
    }
}
impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ApiError::Transport { source } => Some(source),
            ApiError::Decode { source } => Some(source.as_ref()),
            _ => None,
        }
    }
}

/// REST client for the media server control plane (`/v3` API). One logical
/// call = the request plus jittered exponential retries on transient
/// failures; 4xx are surfaced immediately.
#[derive(Debug)]
pub struct Client {
    base_url: String,
    health_path: String,

    reqwest_client: reqwest::Client,

    retry_attempts: u32,
    retry_backoff: Backoff,

    retries_total: AtomicU64,
}
impl Client {
    pub fn new(
        base_url: String,
        health_path: String,
        request_timeout: Duration,
        retry_attempts: u32,
        retry_backoff: Backoff,
    ) -> Result<Self, Error> {
        ensure!(
            base_url.starts_with("http://") || base_url.starts_with("https://"),
            "base url must be http(s): {:?}",
            base_url
        );
        let base_url = base_url.trim_end_matches('/').to_owned();

        let reqwest_client = reqwest::ClientBuilder::new()
            .timeout(request_timeout)
            .build()
            .context("reqwest_client")?;

        let retries_total = AtomicU64::new(0);

        Ok(Self {
            base_url,
            health_path,

            reqwest_client,

            retry_attempts,
            retry_backoff,

            retries_total,
        })
    }

    fn url_build(
        &self,
        endpoint: &str,
        name: Option<&str>,
    ) -> String {
        match name {
            Some(name) => format!(
                "{}{}{}",
                self.base_url,
                endpoint,
                utf8_percent_encode(name, NON_ALPHANUMERIC)
            ),
            None => format!("{}{}", self.base_url, endpoint),
        }
    }

    async fn execute_once(
        &self,
        request: reqwest::Request,
    ) -> Result<reqwest::Response, ApiError> {
        let response = self
            .reqwest_client
            .execute(request)
            .await
            .map_err(|source| ApiError::Transport { source })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let error = match status {
            StatusCode::NOT_FOUND => ApiError::NotFound,
            status if status == StatusCode::BAD_REQUEST && body.contains("already exist") => {
                ApiError::AlreadyExists
            }
            status if status.is_client_error() => ApiError::Client { status, body },
            status => ApiError::Server { status, body },
        };

        Err(error)
    }
    async fn execute(
        &self,
        request: reqwest::Request,
    ) -> Result<reqwest::Response, ApiError> {
        let mut attempt = 0u32;
        loop {
            // try_clone never fails here, request bodies are buffered json
            let error = match self.execute_once(request.try_clone().unwrap()).await {
                Ok(response) => break Ok(response),
                Err(error) => error,
            };

            if !error.is_transient() || attempt >= self.retry_attempts {
                break Err(error);
            }

            self.retries_total.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "{}: transient failure (attempt {}): {}",
                self,
                attempt,
                error
            );
            tokio::time::sleep(self.retry_backoff.delay(attempt)).await;
            attempt += 1;
        }
    }

    async fn get_json<T>(
        &self,
        url: String,
    ) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let request = self
            .reqwest_client
            .get(url)
            .build()
            .map_err(|source| ApiError::Transport { source })?;

        let response = self.execute(request).await?;
        let value = response
            .json::<T>()
            .await
            .map_err(|source| ApiError::Decode {
                source: Error::new(source),
            })?;

        Ok(value)
    }

    // health
    pub async fn healthcheck(&self) -> Result<(), ApiError> {
        let request = self
            .reqwest_client
            .get(self.url_build(&self.health_path, None))
            .build()
            .map_err(|source| ApiError::Transport { source })?;

        // single shot, the prober owns its own schedule
        self.execute_once(request).await?;

        Ok(())
    }

    // runtime views
    pub async fn paths_runtime_list(&self) -> Result<Vec<PathRuntimeState>, ApiError> {
        let page = self
            .get_json::<ItemsPage<serde_json::Value>>(self.url_build("/v3/paths/list", None))
            .await?;

        let items = page
            .items
            .into_iter()
            .map(runtime_state_parse)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| ApiError::Decode { source })?;

        Ok(items)
    }
    pub async fn path_runtime_get(
        &self,
        name: &str,
    ) -> Result<PathRuntimeState, ApiError> {
        let value = self
            .get_json::<serde_json::Value>(self.url_build("/v3/paths/get/", Some(name)))
            .await?;

        let state = runtime_state_parse(value).map_err(|source| ApiError::Decode { source })?;

        Ok(state)
    }

    // configuration views
    pub async fn config_paths_list(&self) -> Result<Vec<PathConfiguration>, ApiError> {
        let page = self
            .get_json::<ItemsPage<PathConfiguration>>(
                self.url_build("/v3/config/paths/list", None),
            )
            .await?;

        Ok(page.items)
    }
    pub async fn config_path_get(
        &self,
        name: &str,
    ) -> Result<PathConfiguration, ApiError> {
        self.get_json::<PathConfiguration>(self.url_build("/v3/config/paths/get/", Some(name)))
            .await
    }

    // configuration mutations
    pub async fn config_path_add(
        &self,
        name: &str,
        configuration: &PathConfiguration,
    ) -> Result<(), ApiError> {
        let request = self
            .reqwest_client
            .post(self.url_build("/v3/config/paths/add/", Some(name)))
            .json(configuration)
            .build()
            .map_err(|source| ApiError::Transport { source })?;

        self.execute(request).await?;

        Ok(())
    }
    pub async fn config_path_patch(
        &self,
        name: &str,
        configuration: &PathConfiguration,
    ) -> Result<(), ApiError> {
        let request = self
            .reqwest_client
            .patch(self.url_build("/v3/config/paths/patch/", Some(name)))
            .json(configuration)
            .build()
            .map_err(|source| ApiError::Transport { source })?;

        self.execute(request).await?;

        Ok(())
    }
    pub async fn config_path_delete(
        &self,
        name: &str,
    ) -> Result<(), ApiError> {
        let request = self
            .reqwest_client
            .delete(self.url_build("/v3/config/paths/delete/", Some(name)))
            .build()
            .map_err(|source| ApiError::Transport { source })?;

        self.execute(request).await?;

        Ok(())
    }

    pub fn retries_total(&self) -> u64 {
        self.retries_total.load(Ordering::Relaxed)
    }
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}
impl fmt::Display for Client {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "Client ({})", self.base_url)
    }
}

#[cfg(test)]
mod tests {
    use super::{ApiError, Client};
    use crate::util::backoff::Backoff;
    use http::StatusCode;
    use std::time::Duration;

    fn client_build() -> Client {
        Client::new(
            "http://127.0.0.1:9997/".to_owned(),
            "/v3/paths/list".to_owned(),
            Duration::from_secs(5),
            3,
            Backoff::with_base(Duration::from_millis(100)),
        )
        .unwrap()
    }

    #[test]
    fn url_build_encodes_names() {
        let client = client_build();

        assert_eq!(
            client.url_build("/v3/paths/list", None),
            "http://127.0.0.1:9997/v3/paths/list"
        );
        assert_eq!(
            client.url_build("/v3/config/paths/get/", Some("camera0")),
            "http://127.0.0.1:9997/v3/config/paths/get/camera0"
        );
        assert_eq!(
            client.url_build("/v3/config/paths/get/", Some("a b/c")),
            "http://127.0.0.1:9997/v3/config/paths/get/a%20b%2Fc"
        );
    }

    #[test]
    fn rejects_non_http_base() {
        assert!(
            Client::new(
                "rtsp://127.0.0.1:8554".to_owned(),
                "/v3/paths/list".to_owned(),
                Duration::from_secs(5),
                3,
                Backoff::with_base(Duration::from_millis(100)),
            )
            .is_err()
        );
    }

    #[test]
    fn transience_classification() {
        assert!(
            ApiError::Server {
                status: StatusCode::BAD_GATEWAY,
                body: String::new(),
            }
            .is_transient()
        );
        assert!(
            !ApiError::Client {
                status: StatusCode::BAD_REQUEST,
                body: String::new(),
            }
            .is_transient()
        );
        assert!(!ApiError::NotFound.is_transient());
        assert!(!ApiError::AlreadyExists.is_transient());
    }
}
