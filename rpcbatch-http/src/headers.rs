use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::{HttpTransportError, Result};

/// Supplies headers that have to be computed for each request, such as credentials that expire.
///
/// The provider is asked once per batch, right before the request is sent.  The headers it returns
/// are added on top of the static headers from [`crate::HttpTransportConfig::headers`],
/// replacing any static header with the same name.
///
/// ```
/// use rpcbatch_http::{HeaderProvider, HttpTransportError, async_trait};
/// use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
///
/// struct BearerToken(String);
///
/// #[async_trait]
/// impl HeaderProvider for BearerToken {
///     async fn headers(&self) -> Result<HeaderMap, HttpTransportError> {
///         let mut headers = HeaderMap::new();
///         let value = HeaderValue::from_str(&format!("Bearer {}", self.0))
///             .map_err(HttpTransportError::header_provider)?;
///         headers.insert(AUTHORIZATION, value);
///         Ok(headers)
///     }
/// }
/// ```
#[async_trait]
pub trait HeaderProvider: Send + Sync + 'static {
    async fn headers(&self) -> Result<HeaderMap>;
}

/// Turn name/value pairs from the configuration into a header map
pub(crate) fn parse_headers<'a>(
    headers: impl IntoIterator<Item = (&'a String, &'a String)>,
) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();

    for (name, value) in headers {
        let invalid = |source: Box<dyn std::error::Error + Send + Sync>| HttpTransportError::InvalidHeader {
            name: name.clone(),
            source,
        };
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(e.into()))?;
        let header_value = HeaderValue::from_str(value).map_err(|e| invalid(e.into()))?;
        map.insert(header_name, header_value);
    }

    Ok(map)
}
