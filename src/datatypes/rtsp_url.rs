use anyhow::{Error, ensure};
use http::uri::Uri;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Validated RTSP source locator. Internal only, never exposed through the
/// camera-identifier API.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Hash, Debug)]
#[serde(try_from = "RtspUrlSerde")]
#[serde(into = "RtspUrlSerde")]
pub struct RtspUrl {
    uri: Uri,
}
impl RtspUrl {
    pub fn new(uri: Uri) -> Result<Self, Error> {
        let scheme = uri.scheme_str().unwrap_or_default();
        ensure!(
            scheme == "rtsp" || scheme == "rtsps",
            "not an rtsp uri: {:?}",
            uri
        );
        ensure!(uri.host().is_some(), "missing host: {:?}", uri);

        Ok(Self { uri })
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }
    pub fn host(&self) -> &str {
        self.uri.host().unwrap()
    }
}
impl FromStr for RtspUrl {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let uri: Uri = value.parse()?;
        Self::new(uri)
    }
}
impl fmt::Display for RtspUrl {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}", self.uri)
    }
}

impl TryFrom<RtspUrlSerde> for RtspUrl {
    type Error = Error;

    fn try_from(value: RtspUrlSerde) -> Result<Self, Self::Error> {
        value.uri.parse()
    }
}
impl From<RtspUrl> for RtspUrlSerde {
    fn from(value: RtspUrl) -> Self {
        Self {
            uri: value.uri.to_string(),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(transparent)]
struct RtspUrlSerde {
    uri: String,
}

#[cfg(test)]
mod tests {
    use super::RtspUrl;

    #[test]
    fn accepts_rtsp() {
        let url: RtspUrl = "rtsp://192.168.1.10:554/stream1".parse().unwrap();
        assert_eq!(url.host(), "192.168.1.10");

        let url: RtspUrl = "rtsps://camera.local/live".parse().unwrap();
        assert_eq!(url.host(), "camera.local");
    }

    #[test]
    fn rejects_other_schemes() {
        assert!("http://192.168.1.10/stream".parse::<RtspUrl>().is_err());
        assert!("rtsp:///pathonly".parse::<RtspUrl>().is_err());
        assert!("not a url".parse::<RtspUrl>().is_err());
    }
}
