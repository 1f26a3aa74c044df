//! A JSON-RPC 2.0 client runtime that batches calls.
//!
//! Calls made through a [`Client`] don't go straight to the wire.  They are collected by a
//! [`Scheduler`] into a batch window, and once no new calls have arrived for the debounce period
//! the whole window goes out as a single JSON-RPC batch through a [`Transport`].  Responses are
//! correlated back to their calls by request ID, so the order the remote peer answers in doesn't
//! matter, and each call can be cancelled on its own without disturbing the rest of its batch.
//!
//! This crate has no opinion on how payloads actually reach the remote peer; see the
//! `rpcbatch-http` crate for an HTTP transport, or [`transport_fn`] to plug in anything else.
//!
//! The wire types owe a debt to the [`jsonrpsee`](https://github.com/paritytech/jsonrpsee)
//! project, from which the error code and version types are borrowed.

mod client;
mod error;
mod error_mapper;
mod scheduler;
#[cfg(test)]
pub mod testing;
mod transport;
mod types;

pub use client::{Client, ClientBuilder, MethodProxy, is_reserved_method_name};
pub use error::{JsonRpcError, Result, TransportError, TypedError, UNKNOWN_ERROR_NAME};
pub use error_mapper::{
    CodeTableMapper, DefaultErrorMapper, ErrorMapper, ErrorMappers, StandardError, StandardErrorMapper,
};
pub use scheduler::{
    BeforeRequestHook, CallHandle, CancelHandle, IdGenerator, RawCallHandle, Scheduler, SchedulerConfig,
};
pub use transport::{FnTransport, Transport, transport_fn};
pub use types::{
    ErrorCode, ErrorDetails, ErrorResponse, Id, JsonValue, Method, Payload, Request, Response, ResponsePayload,
    SuccessResponse, TwoPointZero,
};
