//! The call scheduler, which turns individual method calls into as few batched transport
//! exchanges as possible.
//!
//! See the [`Scheduler`] struct for more details and usage.
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::field::Empty;
use tracing::instrument;
use uuid::Uuid;

use crate::transport::{BoxedTransport, Transport};
use crate::types::{self, Payload, Request};

mod call_handle;
mod event_loop;

pub use call_handle::{CallHandle, CancelHandle, RawCallHandle};
pub(crate) use call_handle::CallFailure;
use event_loop::{Command, EventLoop};

/// The future used to represent the running event loop of a scheduler.
///
/// This is boxed and wrapped in [`futures::future::Shared`] to make it clonable, so that every
/// clone of a [`Scheduler`] can wait for the loop to finish.
type EventLoopFuture = futures::future::Shared<Pin<Box<dyn Future<Output = Result<(), String>> + Send>>>;

/// Hook invoked on every outgoing payload right before it's handed to the transport.
///
/// It may inspect or modify the payload, but must not change request IDs or drop requests,
/// otherwise the affected calls will fail with [`crate::JsonRpcError::MissingResponse`].
pub type BeforeRequestHook = Arc<dyn Fn(&mut Payload<Request>) + Send + Sync + 'static>;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// How long the scheduler waits after the most recent call before flushing the batch window.
    ///
    /// Every new call restarts the wait, so a burst of calls made one after another goes out as a
    /// single batch once the burst is over.  A zero debounce flushes as soon as the scheduler has
    /// no more calls queued up, which on a multi-threaded runtime may split bursts that a small
    /// non-zero debounce would have kept together.
    #[serde(with = "humantime_serde")]
    pub debounce: Duration,

    /// Flush the batch window as soon as it holds this many calls, without waiting for the
    /// debounce period to elapse.
    ///
    /// `None` indicates no limit.
    pub max_batch_size: Option<usize>,

    /// Send a window containing a single call as a one-element JSON array rather than as a bare
    /// request object.
    pub always_batch: bool,

    /// How request IDs are generated.
    pub id_generator: IdGenerator,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1),
            max_batch_size: None,
            always_batch: false,
            id_generator: IdGenerator::default(),
        }
    }
}

/// Strategy for assigning request IDs to calls.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IdGenerator {
    /// Monotonically increasing integers starting at 1
    #[default]
    Sequential,
    /// UUIDv7 strings, which are also unique across scheduler instances
    Uuid,
}

/// Source of request IDs for one scheduler.  IDs are never reused for the life of the scheduler.
#[derive(Debug)]
enum IdSource {
    Sequential(AtomicU64),
    Uuid,
}

impl IdSource {
    fn new(generator: IdGenerator) -> Self {
        match generator {
            IdGenerator::Sequential => IdSource::Sequential(AtomicU64::new(1)),
            IdGenerator::Uuid => IdSource::Uuid,
        }
    }

    fn next_id(&self) -> types::Id {
        match self {
            IdSource::Sequential(next) => types::Id::Number(next.fetch_add(1, Ordering::Relaxed)),
            IdSource::Uuid => types::Id::Str(Uuid::now_v7().to_string()),
        }
    }
}

/// Lightweight and cheaply-clonable handle to a call scheduler and its event loop task.
///
/// The scheduler owns all pending-call bookkeeping: the current batch window, the debounce timer,
/// and the calls that are in flight.  All of that lives in a single background task; this handle
/// and the [`RawCallHandle`]s it hands out only talk to that task through a channel, so the
/// bookkeeping is never mutated from two places at once.
///
/// Most code should use [`crate::Client`], which adds typed params and results, error mapping,
/// and reserved name checks on top of this.
#[derive(Clone)]
pub struct Scheduler {
    commands: mpsc::UnboundedSender<Command>,
    ids: Arc<IdSource>,
    cancellation_token: CancellationToken,
    event_loop_fut: EventLoopFuture,
}

impl Scheduler {
    /// Start a scheduler that sends its batches through `transport`.
    ///
    /// This spawns the event loop into a new tokio task, so it must be called from within a tokio
    /// runtime.
    pub fn spawn(transport: impl Transport, config: SchedulerConfig) -> Self {
        Self::spawn_with_hook(transport, config, None)
    }

    /// Start a scheduler like [`Self::spawn`], with a hook that sees every payload before it is
    /// sent.
    pub fn spawn_with_hook(
        transport: impl Transport,
        config: SchedulerConfig,
        before_request: Option<BeforeRequestHook>,
    ) -> Self {
        let transport: Arc<dyn BoxedTransport> = Arc::new(transport);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let cancellation_token = CancellationToken::new();
        let ids = Arc::new(IdSource::new(config.id_generator));

        let event_loop = EventLoop::new(
            config,
            transport,
            before_request,
            command_rx,
            cancellation_token.clone(),
        );

        // Preserve the tracing context in the event loop
        let join_handle = tokio::spawn(event_loop.run(tracing::Span::current()));

        // Make the loop's outcome clonable so every handle can wait on it.  That rules out
        // `JoinError` as an error type, so it's flattened into a string.
        let event_loop_fut = async move {
            join_handle.await.map_err(|e| {
                if e.is_panic() {
                    crate::error::panic_err_to_string(e.into_panic())
                } else {
                    e.to_string()
                }
            })
        }
        .boxed()
        .shared();

        Self {
            commands: command_tx,
            ids,
            cancellation_token,
            event_loop_fut,
        }
    }

    /// Schedule a call to `method`, to be sent with the next batch.
    ///
    /// This never blocks and never fails synchronously.  If the scheduler is already shut down,
    /// the returned handle resolves immediately with [`crate::JsonRpcError::SchedulerClosed`].
    #[instrument(skip_all, fields(method = Empty, request_id = Empty))]
    pub fn enqueue(&self, method: impl Into<types::Method>, params: Option<JsonValue>) -> RawCallHandle {
        let method = method.into();
        let request_id = self.ids.next_id();
        let span = tracing::Span::current();
        span.record("method", tracing::field::display(&method));
        span.record("request_id", tracing::field::display(&request_id));

        let (tx, rx) = oneshot::channel();
        let request = Request::new(request_id.clone(), method.clone(), params);

        if let Err(mpsc::error::SendError(command)) = self.commands.send(Command::Enqueue {
            request,
            response_tx: tx,
        }) {
            // The event loop is no longer running, so settle the call right here
            tracing::debug!("Command channel closed when enqueuing call; scheduler is shut down");
            if let Command::Enqueue { response_tx, .. } = command {
                let _ = response_tx.send(Err(CallFailure::SchedulerClosed));
            }
        }

        let cancel_handle = CancelHandle::new(request_id.clone(), self.commands.clone());
        RawCallHandle::new(rx, request_id, method, cancel_handle)
    }

    /// Flush the current batch window right away instead of waiting for the debounce period.
    pub fn flush_now(&self) {
        let _ = self.commands.send(Command::Flush);
    }

    /// Stop the event loop and wait until it has finished.
    ///
    /// Every call that has not settled yet, whether still in the batch window or in flight,
    /// resolves with [`crate::JsonRpcError::SchedulerClosed`], and in-flight transport exchanges
    /// are signaled to abort.  This affects all clones of this handle.
    pub async fn shutdown(self) -> Result<(), String> {
        self.cancellation_token.cancel();
        self.event_loop_fut.await
    }

    /// `true` once the event loop has stopped, for whatever reason.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_ids_are_monotonic() {
        let ids = IdSource::new(IdGenerator::Sequential);

        assert_eq!(ids.next_id(), types::Id::Number(1));
        assert_eq!(ids.next_id(), types::Id::Number(2));
        assert_eq!(ids.next_id(), types::Id::Number(3));
    }

    #[test]
    fn uuid_ids_are_unique_strings() {
        let ids = IdSource::new(IdGenerator::Uuid);

        let first = ids.next_id();
        let second = ids.next_id();
        assert!(matches!(first, types::Id::Str(_)));
        assert_ne!(first, second);
    }

    #[test]
    fn default_config() {
        let config = SchedulerConfig::default();

        assert_eq!(config.debounce, Duration::from_millis(1));
        assert_eq!(config.max_batch_size, None);
        assert!(!config.always_batch);
        assert_eq!(config.id_generator, IdGenerator::Sequential);
    }

    #[test]
    fn config_from_yaml() {
        let yaml = r#"
debounce: 5ms
max_batch_size: 20
id_generator: uuid
"#;
        let config: SchedulerConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.debounce, Duration::from_millis(5));
        assert_eq!(config.max_batch_size, Some(20));
        assert!(!config.always_batch);
        assert_eq!(config.id_generator, IdGenerator::Uuid);
        assert_eq!(config.id_generator.to_string(), "uuid");
    }

    #[test]
    fn config_rejects_unknown_fields() {
        let yaml = "debounce: 5ms\nflush_interval: 1s\n";
        assert!(serde_yaml::from_str::<SchedulerConfig>(yaml).is_err());
    }
}
