//! A scriptable in-process transport, used to exercise the client end-to-end without a network.
//!
//! Every payload the scheduler sends is recorded, and the reply is computed by a responder
//! function supplied by the test.  A transport can optionally be "gated", in which case each
//! exchange blocks until the test releases it, which is how tests hold a batch in flight.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rpcbatch_jsonrpc::{ErrorCode, Id, JsonValue, Payload, Request, Response, Transport};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, thiserror::Error)]
pub enum MockTransportError {
    /// Imitates an HTTP error status
    #[error("{reason}")]
    Status { status: u16, reason: String },

    #[error("reply was not valid JSON-RPC")]
    Malformed,

    #[error("{0}")]
    Failed(String),

    #[error("exchange aborted")]
    Aborted,
}

type Responder = dyn Fn(Payload<Request>) -> Result<Payload<Response>, MockTransportError> + Send + Sync;

#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<Inner>,
}

struct Inner {
    responder: Box<Responder>,
    sent: Mutex<Vec<Payload<Request>>>,
    gate: Option<Semaphore>,
    aborted: AtomicUsize,
}

impl MockTransport {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(Payload<Request>) -> Result<Payload<Response>, MockTransportError> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                responder: Box::new(responder),
                sent: Mutex::new(Vec::new()),
                gate: None,
                aborted: AtomicUsize::new(0),
            }),
        }
    }

    /// Answer every request with a result computed from the request alone.  The reply is always
    /// framed the same way as the payload was.
    pub fn per_request<F>(f: F) -> Self
    where
        F: Fn(&Request) -> Option<Response> + Send + Sync + 'static,
    {
        Self::new(move |payload| {
            Ok(match payload {
                Payload::Single(request) => match f(&request) {
                    Some(response) => Payload::Single(response),
                    None => Payload::Batch(vec![]),
                },
                Payload::Batch(requests) => Payload::Batch(requests.iter().filter_map(&f).collect()),
            })
        })
    }

    /// Answer every request with its own params, or `null` if it had none
    pub fn echo() -> Self {
        Self::per_request(|request| {
            Some(Response::success(
                request.id.clone(),
                request.params.clone().unwrap_or(JsonValue::Null),
            ))
        })
    }

    /// Fail every exchange with `error`
    pub fn failing(error: MockTransportError) -> Self {
        Self::new(move |_payload| Err(error.clone()))
    }

    /// Make every exchange wait for [`Self::release`] before replying.
    ///
    /// Must be called before the transport is cloned or bound to a client.
    pub fn gated(self) -> Self {
        let inner = Arc::into_inner(self.inner).expect("gated() must be called on a fresh transport");
        Self {
            inner: Arc::new(Inner {
                gate: Some(Semaphore::new(0)),
                ..inner
            }),
        }
    }

    /// Let `count` gated exchanges proceed
    pub fn release(&self, count: usize) {
        self.inner
            .gate
            .as_ref()
            .expect("release() only makes sense for gated transports")
            .add_permits(count);
    }

    /// Every payload sent so far, in the order they were sent
    pub fn sent(&self) -> Vec<Payload<Request>> {
        self.inner.sent.lock().unwrap().clone()
    }

    pub fn exchange_count(&self) -> usize {
        self.inner.sent.lock().unwrap().len()
    }

    /// Request IDs of each exchange, in order
    pub fn sent_ids(&self) -> Vec<Vec<Id>> {
        self.sent()
            .into_iter()
            .map(|payload| payload.into_iter().map(|request| request.id).collect())
            .collect()
    }

    /// Method names of each exchange, in order
    pub fn sent_methods(&self) -> Vec<Vec<String>> {
        self.sent()
            .into_iter()
            .map(|payload| {
                payload
                    .into_iter()
                    .map(|request| request.method.to_string())
                    .collect()
            })
            .collect()
    }

    /// How many gated exchanges saw their cancellation token fire while waiting
    pub fn aborted_count(&self) -> usize {
        self.inner.aborted.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    type Error = MockTransportError;

    async fn send(
        &self,
        payload: Payload<Request>,
        cancel: CancellationToken,
    ) -> Result<Payload<Response>, Self::Error> {
        self.inner.sent.lock().unwrap().push(payload.clone());

        if let Some(gate) = &self.inner.gate {
            tokio::select! {
                permit = gate.acquire() => {
                    permit.expect("semaphore is never closed").forget();
                }
                _ = cancel.cancelled() => {
                    self.inner.aborted.fetch_add(1, Ordering::SeqCst);
                    return Err(MockTransportError::Aborted);
                }
            }
        }

        (self.inner.responder)(payload)
    }

    fn error_code(error: &Self::Error) -> i32 {
        match error {
            MockTransportError::Status { status, .. } => i32::from(*status),
            MockTransportError::Malformed => ErrorCode::ParseError.code(),
            _ => ErrorCode::InternalError.code(),
        }
    }
}
