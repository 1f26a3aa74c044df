use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use pin_project::pin_project;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};

use super::event_loop::{CallResult, Command};
use crate::error::TransportError;
use crate::error_mapper::{DefaultErrorMapper, ErrorMapper};
use crate::{JsonRpcError, Result, types};

/// Why the event loop settled a call without a response.
///
/// This is converted into a [`JsonRpcError`] by the call handle, which knows the method name and
/// which error mapper applies.
#[derive(Debug)]
pub(crate) enum CallFailure {
    /// The batch the call went out in failed as a whole.  Shared by every call in that batch.
    Transport(Arc<TransportError>),
    Cancelled,
    MissingResponse,
    DuplicateRequestId,
    SchedulerClosed,
    /// Failed before it ever reached the scheduler, or for some reason that has no wire
    /// representation at all
    Local(JsonRpcError),
}

/// Cheaply-clonable handle that cancels one call.
///
/// Obtained from [`RawCallHandle::cancel_handle`] or [`CallHandle::cancel_handle`], for when the
/// code that decides to cancel is not the code that awaits the result (a timeout, a UI action).
#[derive(Clone, Debug)]
pub struct CancelHandle {
    request_id: types::Id,
    commands: Option<mpsc::UnboundedSender<Command>>,
}

impl CancelHandle {
    pub(crate) fn new(request_id: types::Id, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            request_id,
            commands: Some(commands),
        }
    }

    /// Handle for a call that settled before reaching the scheduler, so there's nothing to cancel
    fn detached(request_id: types::Id) -> Self {
        Self {
            request_id,
            commands: None,
        }
    }

    /// Cancel the call.
    ///
    /// If the call is still waiting in the batch window it's taken out and never sent.  If it's in
    /// flight, it settles right away as cancelled and the reply for it will be ignored; other calls
    /// in the same batch are not affected.  Either way, the call's handle resolves to
    /// [`JsonRpcError::Cancelled`].
    ///
    /// Cancelling a call that already settled does nothing.
    pub fn cancel(&self) {
        if let Some(commands) = &self.commands {
            // Fails only if the scheduler is gone, in which case the call is settled already
            let _ = commands.send(Command::Cancel {
                request_id: self.request_id.clone(),
            });
        }
    }

    pub fn request_id(&self) -> &types::Id {
        &self.request_id
    }
}

/// Handle to a scheduled call that produces untyped JSON.
///
/// Most code should use [`CallHandle`] instead, which deserializes the result.
#[pin_project]
pub struct RawCallHandle {
    #[pin]
    receiver: oneshot::Receiver<CallResult>,
    request_id: types::Id,
    method: types::Method,
    error_mapper: Arc<dyn ErrorMapper>,
    cancel_handle: CancelHandle,
}

impl RawCallHandle {
    pub(crate) fn new(
        receiver: oneshot::Receiver<CallResult>,
        request_id: types::Id,
        method: types::Method,
        cancel_handle: CancelHandle,
    ) -> Self {
        Self {
            receiver,
            request_id,
            method,
            error_mapper: Arc::new(DefaultErrorMapper),
            cancel_handle,
        }
    }

    /// A handle that is already settled with `error`, for calls that were rejected before they
    /// could be enqueued.
    pub(crate) fn failed(method: types::Method, error: JsonRpcError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(CallFailure::Local(error)));

        Self::new(rx, types::Id::Null, method, CancelHandle::detached(types::Id::Null))
    }

    /// Use `mapper` to turn error responses and transport failures into typed errors.
    pub fn with_error_mapper(mut self, mapper: Arc<dyn ErrorMapper>) -> Self {
        self.error_mapper = mapper;
        self
    }

    /// The request ID assigned to this call.
    ///
    /// This is `null` for calls that were rejected without ever being enqueued.
    pub fn request_id(&self) -> &types::Id {
        &self.request_id
    }

    pub fn method(&self) -> &types::Method {
        &self.method
    }

    /// Cancel the call, and wait until the scheduler has settled it.
    ///
    /// See [`CancelHandle::cancel`] for the details.  If the call settled some other way before the
    /// cancellation took effect, that outcome is discarded.
    pub async fn cancel(self) {
        self.cancel_handle.cancel();

        // The scheduler answers the cancellation by settling the call; that's the signal that it's
        // done.
        let _ = self.receiver.await;
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel_handle.clone()
    }
}

impl Future for RawCallHandle {
    type Output = Result<JsonValue>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        let result = match futures::ready!(this.receiver.poll(cx)) {
            Ok(Ok(response)) => match response.payload {
                types::ResponsePayload::Success(success) => Ok(success.result),
                types::ResponsePayload::Error(error_response) => {
                    let details = error_response.error;
                    Err(JsonRpcError::Rpc {
                        method: this.method.clone(),
                        error: this.error_mapper.map_error(
                            details.code.code(),
                            details.message,
                            details.data,
                        ),
                    })
                }
            },
            Ok(Err(failure)) => Err(match failure {
                CallFailure::Transport(source) => JsonRpcError::Transport {
                    method: this.method.clone(),
                    error: this
                        .error_mapper
                        .map_error(source.code, source.to_string(), None),
                    source,
                },
                CallFailure::Cancelled => JsonRpcError::Cancelled {
                    method: this.method.clone(),
                    request_id: this.request_id.clone(),
                },
                CallFailure::MissingResponse => JsonRpcError::MissingResponse {
                    method: this.method.clone(),
                    request_id: this.request_id.clone(),
                },
                CallFailure::DuplicateRequestId => JsonRpcError::DuplicateRequestId {
                    method: this.method.clone(),
                    request_id: this.request_id.clone(),
                },
                CallFailure::SchedulerClosed => JsonRpcError::SchedulerClosed,
                CallFailure::Local(e) => e,
            }),
            Err(_) => {
                // The event loop settles every call before it exits, even on shutdown, so the only
                // way to get here is if the loop task panicked.
                tracing::error!(
                    request_id = %this.request_id,
                    method = %this.method,
                    "BUG: One-shot channel was dropped before the event loop settled the call"
                );
                Err(JsonRpcError::SchedulerClosed)
            }
        };

        Poll::Ready(result)
    }
}

/// Handle to a scheduled call whose result is deserialized into `T`.
///
/// Await it to get the outcome of the call, or cancel it with [`Self::cancel`] (or a
/// [`CancelHandle`] obtained from [`Self::cancel_handle`]).
///
/// Dropping the handle does not cancel the call; it's still sent and its reply is discarded.
#[pin_project]
pub struct CallHandle<T> {
    #[pin]
    raw_handle: RawCallHandle,

    _type: PhantomData<fn() -> T>,
}

impl<T> CallHandle<T>
where
    T: DeserializeOwned,
{
    pub(crate) fn new(raw_handle: RawCallHandle) -> Self {
        Self {
            raw_handle,
            _type: PhantomData,
        }
    }

    /// Cancel the call, and wait until the scheduler has settled it.
    ///
    /// See [`CancelHandle::cancel`] for what that means for the call and its batch.
    pub async fn cancel(self) {
        self.raw_handle.cancel().await;
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.raw_handle.cancel_handle()
    }

    /// The request ID assigned to this call.
    pub fn request_id(&self) -> &types::Id {
        self.raw_handle.request_id()
    }

    pub fn method(&self) -> &types::Method {
        self.raw_handle.method()
    }

    /// Give up the typed result and get the raw JSON handle back
    pub fn into_raw(self) -> RawCallHandle {
        self.raw_handle
    }
}

impl<T> Future for CallHandle<T>
where
    T: DeserializeOwned,
{
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        match futures::ready!(this.raw_handle.poll(cx)) {
            Ok(json_response) => {
                // Response was successful and got JSON back.  Deserialize it and return
                Poll::Ready(
                    serde_json::from_value(json_response.clone()).map_err(|e| JsonRpcError::DeserResponse {
                        source: e,
                        type_name: std::any::type_name::<T>(),
                        response: json_response,
                    }),
                )
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}
