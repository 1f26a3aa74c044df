use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

/// Configuration of an [`crate::HttpTransport`].
///
/// Can be deserialized, for example from YAML:
///
/// ```yaml
/// url: https://rpc.example.com/v1
/// headers:
///   X-Api-Key: secret
/// timeout: 5s
/// log_on_error: true
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HttpTransportConfig {
    /// Endpoint every batch is POSTed to.  Must be `http` or `https`.
    pub url: Url,

    /// Headers added to every request, on top of `Accept` and `Content-Type`
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Give up on an exchange that takes longer than this.  No limit if not set.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,

    /// Log every request at debug level, rendered as an equivalent `curl` command
    #[serde(default)]
    pub log_requests: bool,

    /// Log the requests of failed exchanges at error level, rendered as an equivalent `curl`
    /// command
    #[serde(default)]
    pub log_on_error: bool,
}

impl HttpTransportConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            headers: BTreeMap::new(),
            timeout: None,
            log_requests: false,
            log_on_error: false,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
