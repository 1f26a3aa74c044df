//! HTTP transport for the `rpcbatch` JSON-RPC client.
//!
//! Every batch the scheduler flushes becomes one `POST` of a JSON body to a single endpoint, and
//! the response body is parsed as the JSON-RPC reply.  Anything that prevents a reply from being
//! obtained (a connection failure, a non-2xx status, a body that isn't JSON-RPC) fails the whole
//! batch, with a synthetic error code so that it can go through the client's error mapping like
//! any error reported by the server:
//!
//! | Failure | Code |
//! |---------|------|
//! | Non-2xx HTTP status | the status, e.g. `503` |
//! | Unparseable response body | `-32700` (parse error) |
//! | Anything else | `-32603` (internal error) |
mod config;
mod error;
mod headers;
#[cfg(test)]
pub mod testing;
mod transport;

pub use config::HttpTransportConfig;
pub use error::{HttpTransportError, Result};
pub use headers::HeaderProvider;
pub use transport::HttpTransport;

/// Re-export the exact async-trait macro we use, for implementing [`HeaderProvider`]
#[doc(hidden)]
pub use async_trait::async_trait;
