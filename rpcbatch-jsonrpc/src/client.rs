use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::instrument;

use crate::error_mapper::{ErrorMapper, ErrorMappers};
use crate::scheduler::{BeforeRequestHook, CallHandle, RawCallHandle, Scheduler, SchedulerConfig};
use crate::types::{self, Payload, Request};
use crate::{JsonRpcError, transport};

/// Prefix of names that are reserved for client-side controls and never sent as method calls
const CONTROL_PREFIX: &str = "$";

/// Prefix the JSON-RPC 2.0 protocol reserves for its own internal methods
const RPC_INTERNAL_PREFIX: &str = "rpc.";

/// `true` if `method` can't be invoked as a remote method.
pub fn is_reserved_method_name(method: &str) -> bool {
    method.is_empty() || method.starts_with(CONTROL_PREFIX) || method.starts_with(RPC_INTERNAL_PREFIX)
}

#[derive(Default)]
pub struct ClientBuilder {
    config: SchedulerConfig,
    error_mappers: ErrorMappers,
    before_request: Option<BeforeRequestHook>,
}

impl ClientBuilder {
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// See [`SchedulerConfig::debounce`]
    pub fn with_debounce(mut self, debounce: std::time::Duration) -> Self {
        self.config.debounce = debounce;
        self
    }

    /// See [`SchedulerConfig::max_batch_size`]
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.config.max_batch_size = Some(max_batch_size);
        self
    }

    /// See [`SchedulerConfig::always_batch`]
    pub fn always_batch(mut self) -> Self {
        self.config.always_batch = true;
        self
    }

    /// Map the errors of all methods without a method-specific mapper with `mapper`.
    pub fn with_default_error_mapper(mut self, mapper: impl ErrorMapper) -> Self {
        self.error_mappers.set_default(mapper);
        self
    }

    /// Map the errors of `method` with `mapper` instead of the default.
    pub fn with_error_mapper(mut self, method: impl Into<types::Method>, mapper: impl ErrorMapper) -> Self {
        self.error_mappers.set_for_method(method, mapper);
        self
    }

    /// Inspect or modify every outgoing payload before it's passed to the transport.
    ///
    /// See [`BeforeRequestHook`] for restrictions.
    pub fn before_request<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut Payload<Request>) + Send + Sync + 'static,
    {
        self.before_request = Some(Arc::new(hook));
        self
    }

    /// Start the client's scheduler on top of `transport`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(self, transport: impl transport::Transport) -> Client {
        let scheduler = Scheduler::spawn_with_hook(transport, self.config, self.before_request);

        Client {
            scheduler,
            error_mappers: Arc::new(self.error_mappers),
        }
    }
}

/// JSON-RPC client that batches calls made close together into a single transport exchange.
///
/// Calls return immediately with a [`CallHandle`]; nothing goes over the wire until the
/// scheduler's debounce period passes without new calls, at which point everything called so far
/// is sent together.  Await the handle to get the result.
///
/// Cheap to clone; all clones share the same scheduler.
///
/// ```no_run
/// # use rpcbatch_jsonrpc::{Client, Payload, Response, transport_fn};
/// # async fn example() -> rpcbatch_jsonrpc::Result<()> {
/// # let transport = transport_fn(|payload, _cancel| async move {
/// #     Ok::<_, std::io::Error>(Payload::Batch(
/// #         payload.into_iter().map(|req| Response::success(req.id, 1.into())).collect()))
/// # });
/// let client = Client::builder().bind(transport);
///
/// // Both calls travel in the same batch
/// let first = client.call::<_, u32>("counter.get", ["first"]);
/// let second = client.call::<_, u32>("counter.get", ["second"]);
/// let (first, second) = (first.await?, second.await?);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    scheduler: Scheduler,
    error_mappers: Arc<ErrorMappers>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Call `method` with `params`, expecting a result that deserializes to `Resp`.
    ///
    /// Never fails synchronously: if the params can't be serialized, or `method` is a reserved
    /// name, the returned handle resolves to the corresponding error.  Params that serialize to
    /// `null` (like `()`) are left out of the request.
    pub fn call<Req, Resp>(&self, method: impl Into<types::Method>, params: Req) -> CallHandle<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let method = method.into();
        let raw_handle = match serde_json::to_value(&params) {
            Ok(JsonValue::Null) => self.call_raw(method, None),
            Ok(params) => self.call_raw(method, Some(params)),
            Err(e) => RawCallHandle::failed(
                method,
                JsonRpcError::SerRequest {
                    source: e,
                    type_name: std::any::type_name::<Req>(),
                },
            ),
        };

        CallHandle::new(raw_handle)
    }

    /// Call `method` without any params
    pub fn call_without_params<Resp>(&self, method: impl Into<types::Method>) -> CallHandle<Resp>
    where
        Resp: DeserializeOwned,
    {
        CallHandle::new(self.call_raw(method, None))
    }

    /// Call `method` with params that are already JSON, and get the result as JSON.
    #[instrument(skip_all, fields(method = tracing::field::Empty))]
    pub fn call_raw(&self, method: impl Into<types::Method>, params: Option<JsonValue>) -> RawCallHandle {
        let method = method.into();
        tracing::Span::current().record("method", tracing::field::display(&method));

        if is_reserved_method_name(method.as_str()) {
            tracing::debug!(%method, "Refusing to call reserved name");
            return RawCallHandle::failed(method.clone(), JsonRpcError::ReservedMethodName { method });
        }

        let mapper = self.error_mappers.for_method(&method);
        self.scheduler.enqueue(method, params).with_error_mapper(mapper)
    }

    /// A reusable proxy for calls to `method`.
    pub fn method(&self, method: impl Into<types::Method>) -> MethodProxy {
        MethodProxy {
            client: self.clone(),
            method: method.into(),
        }
    }

    /// Send whatever calls are waiting in the batch window now, without waiting for the debounce
    /// period to elapse.
    pub fn flush(&self) {
        self.scheduler.flush_now();
    }

    /// Stop the scheduler.
    ///
    /// Every call that hasn't settled yet fails with [`JsonRpcError::SchedulerClosed`], as will any
    /// calls made afterwards through this client or any of its clones.
    pub async fn shutdown(self) -> Result<(), String> {
        self.scheduler.shutdown().await
    }

    /// The scheduler behind this client
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}

/// A remote method, bound to the client that calls it.
///
/// Obtained with [`Client::method`].
#[derive(Clone)]
pub struct MethodProxy {
    client: Client,
    method: types::Method,
}

impl MethodProxy {
    pub fn call<Req, Resp>(&self, params: Req) -> CallHandle<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.client.call(&self.method, params)
    }

    pub fn name(&self) -> &types::Method {
        &self.method
    }
}
