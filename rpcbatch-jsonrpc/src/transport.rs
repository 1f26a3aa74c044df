//! In this crate, the concept of a "transport" abstracts away the details of how a JSON-RPC
//! request (or batch of them) is delivered to the remote peer and how the reply comes back.
//!
//! From the scheduler's perspective a transport is a single async function: hand it a
//! [`Payload`] of requests plus a cancellation token, get back a [`Payload`] of responses or an
//! error.  Whether that happens over an HTTP POST, a websocket, or a function call in the same
//! process is entirely up to the implementation.
//!
//! The HTTP implementation lives in the `rpcbatch-http` crate.  This crate only provides the
//! trait and an adapter that turns an async closure into a transport, which is handy for tests and
//! in-process peers.
use std::pin::Pin;

use futures::{FutureExt, TryFutureExt};
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::types::{ErrorCode, Payload, Request, Response};

/// A transport delivers outgoing request payloads to the remote peer and returns the reply.
///
/// Several batches can be in flight at once, so unlike a connection-oriented transport this takes
/// `&self`; implementations that need mutable state must synchronize it themselves.
pub trait Transport: Send + Sync + Sized + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send a request or batch of requests, and wait for the corresponding reply.
    ///
    /// Implementations must fail if no reply at all could be obtained (network error, non-success
    /// status, unparseable body) and must pass request IDs through verbatim so responses can be
    /// correlated with the calls that caused them.
    ///
    /// `cancel` is triggered when nobody is interested in the reply anymore.  Implementations
    /// should abort the exchange when that happens, if the underlying mechanism allows it.  The
    /// result of a cancelled exchange is discarded, so it doesn't matter much what is returned.
    fn send(
        &self,
        payload: Payload<Request>,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<Payload<Response>, Self::Error>> + Send + '_;

    /// The synthetic JSON-RPC error code that represents `error` when it is reported to callers.
    ///
    /// The default classifies every failure as an internal error.  Transports that can tell
    /// failures apart (an HTTP status, a malformed payload) should override this.
    fn error_code(error: &Self::Error) -> i32 {
        let _ = error;
        ErrorCode::InternalError.code()
    }
}

/// Internal dyn-compatible wrapper trait around [`Transport`] to erase the types and allow dynamic
/// dispatch, hopefully without dire performance consequences
pub(crate) trait BoxedTransport: Send + Sync + 'static {
    fn boxed_send(
        &self,
        payload: Payload<Request>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<Payload<Response>, TransportError>> + Send + '_>>;
}

impl<T> BoxedTransport for T
where
    T: Transport,
{
    fn boxed_send(
        &self,
        payload: Payload<Request>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<Payload<Response>, TransportError>> + Send + '_>> {
        <Self as Transport>::send(self, payload, cancel)
            .map_err(|e| TransportError::new(T::error_code(&e), e))
            .boxed()
    }
}

/// A [`Transport`] implemented by an async closure.  See [`transport_fn`].
#[derive(Clone)]
pub struct FnTransport<F> {
    f: F,
}

/// Make a transport out of an async function or closure.
///
/// ```
/// # use rpcbatch_jsonrpc::{Payload, Response, transport_fn};
/// let transport = transport_fn(|payload, _cancel| async move {
///     // Answer every request with its own params
///     let responses = payload
///         .into_iter()
///         .map(|req| Response::success(req.id, req.params.unwrap_or_default()))
///         .collect();
///     Ok::<_, std::io::Error>(Payload::Batch(responses))
/// });
/// ```
pub fn transport_fn<F, Fut, E>(f: F) -> FnTransport<F>
where
    F: Fn(Payload<Request>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload<Response>, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    FnTransport { f }
}

impl<F, Fut, E> Transport for FnTransport<F>
where
    F: Fn(Payload<Request>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload<Response>, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    type Error = E;

    fn send(
        &self,
        payload: Payload<Request>,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<Payload<Response>, Self::Error>> + Send + '_ {
        (self.f)(payload, cancel)
    }
}
