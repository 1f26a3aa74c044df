use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use rpcbatch_jsonrpc::{Payload, Request, Response, Transport};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, field::Empty, instrument};
use url::Url;

use crate::headers::parse_headers;
use crate::{HeaderProvider, HttpTransportConfig, HttpTransportError, Result};

const APPLICATION_JSON: &str = "application/json";

/// [`Transport`] that POSTs each payload to a JSON-RPC endpoint over HTTP.
///
/// Cheap to clone; clones share the same connection pool.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: Url,
    static_headers: HeaderMap,
    header_provider: Option<Arc<dyn HeaderProvider>>,
    timeout: Option<Duration>,
    log_requests: bool,
    log_on_error: bool,
}

impl HttpTransport {
    /// Create a transport with its own HTTP client.
    ///
    /// Fails if the URL isn't `http` or `https`, or if one of the configured headers isn't a valid
    /// HTTP header.
    pub fn new(config: HttpTransportConfig) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;

        Self::with_client(config, client)
    }

    /// Create a transport that sends its requests with an existing `client`.
    pub fn with_client(config: HttpTransportConfig, client: reqwest::Client) -> Result<Self> {
        if !matches!(config.url.scheme(), "http" | "https") {
            return Err(HttpTransportError::UnsupportedScheme {
                scheme: config.url.scheme().to_string(),
            });
        }

        let static_headers = parse_headers(&config.headers)?;

        Ok(Self {
            client,
            url: config.url,
            static_headers,
            header_provider: None,
            timeout: config.timeout,
            log_requests: config.log_requests,
            log_on_error: config.log_on_error,
        })
    }

    /// Ask `provider` for additional headers before every request.
    pub fn with_header_provider(mut self, provider: impl HeaderProvider) -> Self {
        self.header_provider = Some(Arc::new(provider));
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    #[instrument(skip_all, fields(url = %self.url, batch_size = payload.len(), method = Empty))]
    async fn exchange(&self, payload: Payload<Request>) -> Result<Payload<Response>> {
        // Batches are logged as a whole, like a single call named "batch"
        let method = match &payload {
            Payload::Single(request) => request.method.to_string(),
            Payload::Batch(_) => "batch".to_string(),
        };
        tracing::Span::current().record("method", method.as_str());

        let body = serde_json::to_vec(&payload).map_err(|source| HttpTransportError::Encode { source })?;
        let headers = self.request_headers().await?;

        let curl = (self.log_requests || self.log_on_error).then(|| curl_command(&self.url, &headers, &body));
        if let (true, Some(curl)) = (self.log_requests, &curl) {
            debug!(%method, count = payload.len(), %curl, "Sending JSON-RPC payload");
        }

        let result = self.post(headers, body).await;

        if let (Err(e), true, Some(curl)) = (&result, self.log_on_error, &curl) {
            error!(%method, count = payload.len(), %curl, error = %e, "JSON-RPC exchange failed");
        }

        result
    }

    /// All headers of the next request: the JSON content headers, then the static headers, then
    /// whatever the provider supplies.  Later ones replace earlier ones with the same name.
    async fn request_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(APPLICATION_JSON));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));
        headers.extend(self.static_headers.clone());

        if let Some(provider) = &self.header_provider {
            headers.extend(provider.headers().await?);
        }

        Ok(headers)
    }

    async fn post(&self, headers: HeaderMap, body: Vec<u8>) -> Result<Payload<Response>> {
        let mut request = self.client.post(self.url.clone()).headers(headers).body(body);
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(HttpTransportError::Status {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("Unknown Status").to_string(),
            });
        }

        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|source| HttpTransportError::Decode { source })
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("url", &self.url)
            .field("timeout", &self.timeout)
            .field("has_header_provider", &self.header_provider.is_some())
            .finish_non_exhaustive()
    }
}

impl Transport for HttpTransport {
    type Error = HttpTransportError;

    async fn send(&self, payload: Payload<Request>, cancel: CancellationToken) -> Result<Payload<Response>> {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(url = %self.url, "Exchange cancelled; abandoning HTTP request");
                Err(HttpTransportError::Cancelled)
            }
            result = self.exchange(payload) => result,
        }
    }

    fn error_code(error: &Self::Error) -> i32 {
        error.code()
    }
}

/// Render a request as a `curl` command that reproduces it, for logging.
///
/// The value of the `Authorization` header is redacted.
fn curl_command(url: &Url, headers: &HeaderMap, body: &[u8]) -> String {
    let header_args = headers.iter().map(|(name, value)| {
        let value = if *name == AUTHORIZATION {
            "<redacted>"
        } else {
            value.to_str().unwrap_or("<binary>")
        };
        format!("-H {}", shell_quote(&format!("{name}: {value}")))
    });

    ["curl".to_string(), "-X POST".to_string()]
        .into_iter()
        .chain(header_args)
        .chain([
            format!("-d {}", shell_quote(&String::from_utf8_lossy(body))),
            shell_quote(url.as_str()),
        ])
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
