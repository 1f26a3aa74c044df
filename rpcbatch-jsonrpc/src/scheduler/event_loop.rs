//! The scheduler's state lives in an event loop, in this module as part of [`EventLoop`].
//!
//! Nothing outside of this module touches the batch window, the flush timer, or the table of
//! in-flight calls.  [`super::Scheduler`] and the call handles only send [`Command`]s over a
//! channel, and the event loop settles calls by sending on the oneshot channel that came with each
//! call.  That is what makes the flush-time window swap atomic with respect to new enqueues: both
//! happen on this one task, one command at a time.
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Instant, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{BeforeRequestHook, SchedulerConfig, call_handle::CallFailure};
use crate::error::{self, TransportError};
use crate::transport::BoxedTransport;
use crate::types::{self, ErrorCode, Payload, Request, Response};
use crate::JsonRpcError;

/// What the event loop eventually sends back for every call.
///
/// A response with an `error` payload is still `Ok` here; it's up to the call handle to turn that
/// into an error, since that's where the error mapper lives.
pub(crate) type CallResult = Result<Response, CallFailure>;

/// Commands sent to the event loop over its command channel.
#[derive(Debug)]
pub(crate) enum Command {
    /// See [`super::Scheduler::enqueue`]
    Enqueue {
        request: Request,
        response_tx: oneshot::Sender<CallResult>,
    },
    /// See [`super::CancelHandle::cancel`]
    Cancel { request_id: types::Id },
    /// See [`super::Scheduler::flush_now`]
    Flush,
}

/// Identifies one flushed batch for as long as its transport exchange is running.
type BatchId = u64;

/// A call that's in the batch window, waiting for the flush.
#[derive(Debug)]
struct PendingCall {
    request: Request,
    response_tx: oneshot::Sender<CallResult>,
}

/// A call that went out with a batch and whose response hasn't arrived yet.
#[derive(Debug)]
struct InFlightCall {
    method: types::Method,
    batch_id: BatchId,
    response_tx: oneshot::Sender<CallResult>,
}

/// Bookkeeping for one running transport exchange
#[derive(Debug)]
struct InFlightBatch {
    /// Passed to the transport; signaled once no call in the batch is waiting for the reply.
    cancellation_token: CancellationToken,

    /// Request IDs of all calls that went out in the batch, in order
    members: Vec<types::Id>,

    /// How many of the members are still waiting for the reply
    outstanding: usize,
}

type ExchangeResult = (BatchId, Result<Payload<Response>, TransportError>);

pub(super) struct EventLoop {
    config: SchedulerConfig,

    transport: Arc<dyn BoxedTransport>,

    before_request: Option<BeforeRequestHook>,

    commands: mpsc::UnboundedReceiver<Command>,

    cancellation_token: CancellationToken,

    /// Calls enqueued since the last flush, in enqueue order
    window: Vec<PendingCall>,

    /// The debounce timer.  There is only ever this one; re-arming it just moves its deadline.
    flush_timer: Pin<Box<Sleep>>,

    timer_armed: bool,

    /// Calls that were flushed and are waiting for the reply, keyed by request ID
    in_flight: HashMap<types::Id, InFlightCall>,

    batches: HashMap<BatchId, InFlightBatch>,

    next_batch_id: BatchId,

    /// Transport exchanges that are running now.  Each one yields the ID of its batch along with
    /// whatever the transport returned.
    exchanges: JoinSet<ExchangeResult>,
}

impl EventLoop {
    pub(super) fn new(
        config: SchedulerConfig,
        transport: Arc<dyn BoxedTransport>,
        before_request: Option<BeforeRequestHook>,
        commands: mpsc::UnboundedReceiver<Command>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            config,
            transport,
            before_request,
            commands,
            cancellation_token,
            window: Vec::new(),
            flush_timer: Box::pin(tokio::time::sleep(std::time::Duration::ZERO)),
            timer_armed: false,
            in_flight: HashMap::new(),
            batches: HashMap::new(),
            next_batch_id: 0,
            exchanges: JoinSet::new(),
        }
    }

    /// Entry point for the event loop running in a dedicated async task
    pub(super) async fn run(self, span: tracing::Span) {
        self.event_loop().instrument(span).await
    }

    async fn event_loop(mut self) {
        tracing::debug!(
            debounce = ?self.config.debounce,
            max_batch_size = ?self.config.max_batch_size,
            "Scheduler event loop is starting"
        );

        let termination_reason = loop {
            tokio::select! {
                biased;

                _ = self.cancellation_token.cancelled() => {
                    tracing::debug!("Cancellation signal received, shutting down scheduler");
                    break "shutdown";
                },
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => {
                            // Every scheduler and call handle is gone, so there is nobody left who
                            // could ever see the outcome of a call
                            tracing::debug!("All scheduler handles dropped");
                            break "handles_dropped";
                        }
                    }
                },
                next = self.exchanges.join_next(), if !self.exchanges.is_empty() => {
                    match next {
                        Some(Ok((batch_id, result))) => self.handle_exchange_completion(batch_id, result),
                        Some(Err(join_err)) => {
                            // Exchanges catch their own panics, and they are only aborted after
                            // the loop exits
                            tracing::error!(%join_err, "BUG: Transport exchange task failed");
                        }
                        None => {}
                    }
                },
                () = &mut self.flush_timer, if self.timer_armed => {
                    tracing::trace!("Debounce period elapsed");
                    self.flush();
                },
            }
        };

        // Nobody can enqueue or cancel anything from here on
        self.commands.close();
        if !self.cancellation_token.is_cancelled() {
            // Batch cancellation tokens are children of this one, so this also tells all running
            // exchanges to abort
            self.cancellation_token.cancel();
        }

        // Commands that were already queued still carry calls that must be settled
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Enqueue { request, response_tx } => {
                    tracing::debug!(request_id = %request.id,
                        method = %request.method,
                        "Rejecting call enqueued during shutdown");
                    let _ = response_tx.send(Err(CallFailure::SchedulerClosed));
                }
                command => {
                    tracing::debug!(?command, "Command is ignored due to shutdown");
                }
            }
        }

        tracing::debug!(
            window_size = self.window.len(),
            in_flight = self.in_flight.len(),
            "Rejecting all outstanding calls due to shutdown"
        );
        for call in self.window.drain(..) {
            let _ = call.response_tx.send(Err(CallFailure::SchedulerClosed));
        }
        for (_, call) in self.in_flight.drain() {
            let _ = call.response_tx.send(Err(CallFailure::SchedulerClosed));
        }
        self.batches.clear();

        // The transports were already asked to abort, this makes sure they actually stop
        self.exchanges.shutdown().await;

        tracing::debug!(termination_reason, "Scheduler event loop is exiting");
    }

    /// Handle a command sent from a scheduler or call handle.
    ///
    /// This is infallible because there is no mechanism to report errors back to senders of
    /// commands.  Anything that can go wrong is reported through the affected call's channel.
    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Enqueue { request, response_tx } => self.enqueue(request, response_tx),
            Command::Cancel { request_id } => self.cancel(request_id),
            Command::Flush => {
                tracing::trace!("Forced flush");
                self.flush();
            }
        }
    }

    fn enqueue(&mut self, request: Request, response_tx: oneshot::Sender<CallResult>) {
        tracing::trace!(request_id = %request.id,
            method = %request.method,
            "Call added to batch window");
        self.window.push(PendingCall { request, response_tx });

        match self.config.max_batch_size {
            Some(max_batch_size) if self.window.len() >= max_batch_size => {
                tracing::trace!(max_batch_size, "Batch window is full");
                self.flush();
            }
            _ => self.arm_timer(),
        }
    }

    /// Arm the debounce timer, or push its deadline out if it's already armed.
    fn arm_timer(&mut self) {
        let deadline = Instant::now() + self.config.debounce;
        self.flush_timer.as_mut().reset(deadline);
        self.timer_armed = true;
    }

    fn cancel(&mut self, request_id: types::Id) {
        if let Some(position) = self.window.iter().position(|call| call.request.id == request_id) {
            // Not sent yet, so it's enough to leave it out of the batch
            let call = self.window.remove(position);
            tracing::debug!(%request_id,
                method = %call.request.method,
                "Cancelling call before it was sent");
            let _ = call.response_tx.send(Err(CallFailure::Cancelled));

            if self.window.is_empty() {
                // Nothing left to flush
                self.timer_armed = false;
            }
        } else if let Some(call) = self.in_flight.remove(&request_id) {
            tracing::debug!(%request_id,
                method = %call.method,
                batch_id = call.batch_id,
                "Cancelling in-flight call");
            let _ = call.response_tx.send(Err(CallFailure::Cancelled));
            self.detach_from_batch(call.batch_id);
        } else {
            tracing::debug!(%request_id, "Tried to cancel a call that already settled");
        }
    }

    /// A member of a running batch is no longer waiting for the reply.  If that was the last one,
    /// tell the transport to give up on the exchange.
    fn detach_from_batch(&mut self, batch_id: BatchId) {
        if let Some(batch) = self.batches.get_mut(&batch_id) {
            batch.outstanding = batch.outstanding.saturating_sub(1);
            if batch.outstanding == 0 {
                tracing::debug!(batch_id,
                    batch_size = batch.members.len(),
                    "No call is waiting for this batch anymore; signaling the transport to abort");
                batch.cancellation_token.cancel();
            }
        }
    }

    /// Swap out the batch window and hand its calls to the transport.
    fn flush(&mut self) {
        self.timer_armed = false;
        if self.window.is_empty() {
            return;
        }

        let window = std::mem::take(&mut self.window);
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;

        self.batches.insert(
            batch_id,
            InFlightBatch {
                cancellation_token: self.cancellation_token.child_token(),
                members: Vec::with_capacity(window.len()),
                outstanding: 0,
            },
        );

        let mut requests = Vec::with_capacity(window.len());
        for PendingCall { request, response_tx } in window {
            if let Some(batch) = self.batches.get_mut(&batch_id) {
                batch.members.push(request.id.clone());
                batch.outstanding += 1;
            }

            let displaced = self.in_flight.insert(
                request.id.clone(),
                InFlightCall {
                    method: request.method.clone(),
                    batch_id,
                    response_tx,
                },
            );

            if let Some(displaced) = displaced {
                // Last one registered wins; the response can only go to one of them
                tracing::warn!(request_id = %request.id,
                    displaced_method = %displaced.method,
                    method = %request.method,
                    "Duplicate request ID; the earlier call will not receive a response");
                let _ = displaced.response_tx.send(Err(CallFailure::DuplicateRequestId));
                self.detach_from_batch(displaced.batch_id);
                if displaced.batch_id == batch_id {
                    // Its caller was already told it failed, so it mustn't reach the server either
                    requests.retain(|sent: &Request| sent.id != request.id);
                    if let Some(batch) = self.batches.get_mut(&batch_id) {
                        if let Some(position) = batch.members.iter().position(|id| *id == request.id) {
                            batch.members.remove(position);
                        }
                    }
                }
            }

            requests.push(request);
        }

        let mut payload = if requests.len() == 1 && !self.config.always_batch {
            Payload::Single(requests.remove(0))
        } else {
            Payload::Batch(requests)
        };

        let hook_result = match &self.before_request {
            Some(hook) => std::panic::catch_unwind(AssertUnwindSafe(|| hook(&mut payload))),
            None => Ok(()),
        };
        if let Err(e) = hook_result {
            let message = format!("before-request hook panicked: {}", error::panic_err_to_string(e));
            tracing::error!(batch_id, %message, "Batch will not be sent");
            self.fail_batch(batch_id, |_| {
                CallFailure::Local(JsonRpcError::Bug {
                    message: message.clone(),
                })
            });
            return;
        }

        let Some(batch) = self.batches.get(&batch_id) else {
            return;
        };
        tracing::debug!(
            batch_id,
            batch_size = payload.len(),
            is_batch = payload.is_batch(),
            "Flushing batch window"
        );

        let transport = self.transport.clone();
        let cancellation_token = batch.cancellation_token.clone();
        self.exchanges.spawn(
            async move {
                let result = AssertUnwindSafe(async { transport.boxed_send(payload, cancellation_token).await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|e| {
                        Err(TransportError::new(
                            ErrorCode::InternalError.code(),
                            format!("transport panicked: {}", error::panic_err_to_string(e)),
                        ))
                    });
                (batch_id, result)
            }
            .in_current_span(),
        );
    }

    /// A transport exchange finished.  Settle every call of the batch that is still waiting.
    fn handle_exchange_completion(
        &mut self,
        batch_id: BatchId,
        result: Result<Payload<Response>, TransportError>,
    ) {
        let Some(batch) = self.batches.remove(&batch_id) else {
            tracing::error!(batch_id, "BUG: Exchange completed for unknown batch");
            return;
        };

        match result {
            Ok(reply) => {
                tracing::debug!(batch_id,
                    batch_size = batch.members.len(),
                    reply_size = reply.len(),
                    "Batch reply received");

                // A server that rejects the batch as a whole answers with one error that has a null ID
                let mut batch_error = None;

                for response in reply {
                    if response.id == types::Id::Null
                        && matches!(response.payload, types::ResponsePayload::Error(_))
                    {
                        tracing::warn!(batch_id, "Server rejected the batch with an error that has no request ID");
                        batch_error = Some(response);
                        continue;
                    }

                    match self.in_flight.get(&response.id) {
                        Some(call) if call.batch_id == batch_id => {
                            if let Some(call) = self.in_flight.remove(&response.id) {
                                let _ = call.response_tx.send(Ok(response));
                            }
                        }
                        _ => {
                            // Already cancelled, or never asked for
                            tracing::debug!(request_id = %response.id,
                                batch_id,
                                "Ignoring response that doesn't match any waiting call in the batch");
                        }
                    }
                }

                match batch_error {
                    Some(batch_error) => {
                        self.reject_batch_members(batch_id, &batch.members, &batch_error)
                    }
                    None => self.fail_batch_members(batch_id, &batch.members, |_| CallFailure::MissingResponse),
                }
            }
            Err(e) => {
                if batch.outstanding > 0 {
                    tracing::warn!(batch_id,
                        batch_size = batch.members.len(),
                        code = e.code,
                        err = %e,
                        "Transport failed; rejecting every call in the batch");
                } else {
                    tracing::debug!(batch_id, err = %e, "Abandoned batch ended with transport error");
                }

                let e = Arc::new(e);
                self.fail_batch_members(batch_id, &batch.members, |_| CallFailure::Transport(e.clone()));
            }
        }
    }

    /// Settle any call in `members` still waiting on the batch with a failure.
    fn fail_batch_members(
        &mut self,
        batch_id: BatchId,
        members: &[types::Id],
        failure: impl Fn(&types::Id) -> CallFailure,
    ) {
        for request_id in members {
            if self
                .in_flight
                .get(request_id)
                .is_some_and(|call| call.batch_id == batch_id)
            {
                if let Some(call) = self.in_flight.remove(request_id) {
                    let failure = failure(request_id);
                    if matches!(failure, CallFailure::MissingResponse) {
                        tracing::warn!(%request_id,
                            method = %call.method,
                            batch_id,
                            "Batch reply did not include a response for this call");
                    }
                    let _ = call.response_tx.send(Err(failure));
                }
            }
        }
    }

    /// Answer every call in `members` still waiting on the batch with the same error response, which
    /// each call's error mapper then turns into its own error.
    fn reject_batch_members(&mut self, batch_id: BatchId, members: &[types::Id], batch_error: &Response) {
        for request_id in members {
            if self
                .in_flight
                .get(request_id)
                .is_some_and(|call| call.batch_id == batch_id)
            {
                if let Some(call) = self.in_flight.remove(request_id) {
                    let _ = call.response_tx.send(Ok(batch_error.clone()));
                }
            }
        }
    }

    /// Fail a batch that was never sent, and forget about it
    fn fail_batch(&mut self, batch_id: BatchId, failure: impl Fn(&types::Id) -> CallFailure) {
        if let Some(batch) = self.batches.remove(&batch_id) {
            self.fail_batch_members(batch_id, &batch.members, failure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use crate::transport::transport_fn;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Transport that records every payload and answers each request with its own method name
    fn recording_transport() -> (impl crate::Transport, Arc<Mutex<Vec<Payload<Request>>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let transport = transport_fn({
            let sent = sent.clone();
            move |payload: Payload<Request>, _cancel| {
                sent.lock().unwrap().push(payload.clone());
                async move {
                    let responses = payload
                        .into_iter()
                        .map(|request| Response::success(request.id, json!(request.method.as_str())))
                        .collect();
                    Ok::<_, std::io::Error>(Payload::Batch(responses))
                }
            }
        });

        (transport, sent)
    }

    /// Start an event loop and return the raw command channel to it
    fn start_event_loop(
        transport: impl crate::Transport,
        config: SchedulerConfig,
    ) -> (mpsc::UnboundedSender<Command>, CancellationToken) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let cancellation_token = CancellationToken::new();
        let event_loop = EventLoop::new(
            config,
            Arc::new(transport),
            None,
            command_rx,
            cancellation_token.clone(),
        );
        tokio::spawn(event_loop.run(tracing::Span::current()));

        (command_tx, cancellation_token)
    }

    fn enqueue(
        commands: &mpsc::UnboundedSender<Command>,
        id: u64,
        method: &str,
    ) -> oneshot::Receiver<CallResult> {
        let (response_tx, response_rx) = oneshot::channel();
        commands
            .send(Command::Enqueue {
                request: Request::new(types::Id::Number(id), method, None),
                response_tx,
            })
            .unwrap();
        response_rx
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_restarts_on_every_enqueue() {
        testing::init_test_logging();

        let (transport, sent) = recording_transport();
        let config = SchedulerConfig {
            debounce: Duration::from_millis(10),
            ..Default::default()
        };
        let (commands, _token) = start_event_loop(transport, config);

        let first = enqueue(&commands, 1, "a");
        tokio::time::sleep(Duration::from_millis(8)).await;
        let second = enqueue(&commands, 2, "b");
        tokio::time::sleep(Duration::from_millis(8)).await;

        // 16ms since the first call, but only 8ms since the most recent one
        assert!(sent.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(sent.lock().unwrap().len(), 1);
        assert_eq!(sent.lock().unwrap()[0].len(), 2);

        assert_matches!(first.await.unwrap(), Ok(response) if response.id == types::Id::Number(1));
        assert_matches!(second.await.unwrap(), Ok(response) if response.id == types::Id::Number(2));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_request_id_last_registered_wins() {
        testing::init_test_logging();

        let (transport, sent) = recording_transport();
        let (commands, _token) = start_event_loop(transport, SchedulerConfig::default());

        let earlier = enqueue(&commands, 7, "earlier");
        let later = enqueue(&commands, 7, "later");

        assert_matches!(earlier.await.unwrap(), Err(CallFailure::DuplicateRequestId));
        let response = later.await.unwrap().unwrap();
        assert_eq!(response.id, types::Id::Number(7));

        // Only the call still waiting for it goes to the server
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_matches!(&sent[0], Payload::Single(request) if request.method == "later");
    }

    #[tokio::test(start_paused = true)]
    async fn zero_max_batch_size_sends_every_call_alone() {
        testing::init_test_logging();

        let (transport, sent) = recording_transport();
        let config = SchedulerConfig {
            debounce: Duration::from_secs(60),
            max_batch_size: Some(0),
            ..Default::default()
        };
        let (commands, _token) = start_event_loop(transport, config);

        let first = enqueue(&commands, 1, "a");
        let second = enqueue(&commands, 2, "b");

        assert_matches!(first.await.unwrap(), Ok(_));
        assert_matches!(second.await.unwrap(), Ok(_));

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|payload| matches!(payload, Payload::Single(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_unknown_id_is_ignored() {
        testing::init_test_logging();

        let (transport, sent) = recording_transport();
        let (commands, _token) = start_event_loop(transport, SchedulerConfig::default());

        commands
            .send(Command::Cancel {
                request_id: types::Id::Number(99),
            })
            .unwrap();
        let call = enqueue(&commands, 1, "still_works");

        assert_matches!(call.await.unwrap(), Ok(_));
        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_whole_window_disarms_timer() {
        testing::init_test_logging();

        let (transport, sent) = recording_transport();
        let (commands, _token) = start_event_loop(transport, SchedulerConfig::default());

        let call = enqueue(&commands, 1, "never_sent");
        commands
            .send(Command::Cancel {
                request_id: types::Id::Number(1),
            })
            .unwrap();

        assert_matches!(call.await.unwrap(), Err(CallFailure::Cancelled));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sent.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_transport_fails_the_batch() {
        testing::init_test_logging();

        let transport = transport_fn(|_payload: Payload<Request>, _cancel| async move {
            if true {
                panic!("transport exploded");
            }
            Ok::<_, std::io::Error>(Payload::Batch(vec![]))
        });
        let (commands, _token) = start_event_loop(transport, SchedulerConfig::default());

        let call = enqueue(&commands, 1, "boom");
        let failure = assert_matches!(call.await.unwrap(), Err(CallFailure::Transport(e)) => e);
        assert_eq!(failure.code, ErrorCode::InternalError.code());
        assert!(failure.to_string().contains("transport exploded"));

        // The scheduler survives
        let call = enqueue(&commands, 2, "boom_again");
        assert_matches!(call.await.unwrap(), Err(CallFailure::Transport(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_rejects_queued_and_windowed_calls() {
        testing::init_test_logging();

        let (transport, sent) = recording_transport();
        let config = SchedulerConfig {
            debounce: Duration::from_secs(60),
            ..Default::default()
        };
        let (commands, token) = start_event_loop(transport, config);

        let windowed = enqueue(&commands, 1, "windowed");
        tokio::task::yield_now().await;
        token.cancel();
        let queued = enqueue(&commands, 2, "queued");

        assert_matches!(windowed.await.unwrap(), Err(CallFailure::SchedulerClosed));
        assert_matches!(queued.await.unwrap(), Err(CallFailure::SchedulerClosed));
        assert!(sent.lock().unwrap().is_empty());
    }
}
