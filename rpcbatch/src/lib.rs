//! Batching JSON-RPC 2.0 client.
//!
//! This is a convenience crate that re-exports the client runtime from `rpcbatch-jsonrpc` and,
//! with the `http` feature (on by default), the HTTP transport from `rpcbatch-http`.
pub use rpcbatch_jsonrpc::*;

#[cfg(feature = "http")]
pub mod http {
    pub use rpcbatch_http::*;
}
