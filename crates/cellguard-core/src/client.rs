use crate::BoxFuture;
use crate::error::ChannelError;
use crate::protocol::{
    EventMessage, JsonRpcRequest, JsonRpcResponse, RequestId, RequestIdGenerator, RpcMethod,
    event_topic,
};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Writes one request to the wire
pub type RequestSink =
    Arc<dyn Fn(JsonRpcRequest) -> BoxFuture<'static, Result<(), ChannelError>> + Send + Sync>;

type EventCallback = Arc<dyn Fn(&EventMessage) -> Result<(), ChannelError> + Send + Sync>;
type PendingSlot = oneshot::Sender<Result<JsonRpcResponse, ChannelError>>;

/// Request/response correlation on top of a one-way request sink.
///
/// Every outgoing request is registered by id before it is written; inbound responses
/// are fed back through [`MessagingClient::publish_response`] and complete the matching
/// call. Inbound events are routed by topic to subscribers.
pub struct MessagingClient {
    sink: RequestSink,
    ids: Arc<RequestIdGenerator>,
    pending: Arc<Mutex<HashMap<RequestId, PendingSlot>>>,
    subscribers: RwLock<HashMap<String, Vec<EventCallback>>>,
    closed: AtomicBool,
}

/// Removes the pending entry of a call that is abandoned before its response arrives
struct PendingGuard {
    pending: Arc<Mutex<HashMap<RequestId, PendingSlot>>>,
    id: RequestId,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut pending = self.pending.lock();
        if pending.get(&self.id).is_some_and(|slot| slot.is_closed()) {
            pending.remove(&self.id);
        }
    }
}

impl MessagingClient {
    pub fn new<F, Fut>(ids: Arc<RequestIdGenerator>, sink: F) -> Self
    where
        F: Fn(JsonRpcRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ChannelError>> + Send + 'static,
    {
        let sink: RequestSink =
            Arc::new(move |request| -> BoxFuture<'static, Result<(), ChannelError>> {
                Box::pin(sink(request))
            });
        Self {
            sink,
            ids,
            pending: Arc::new(Mutex::new(HashMap::new())),
            subscribers: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn next_request_id(&self) -> RequestId {
        self.ids.next_id()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send `request` and wait for the response carrying its id.
    ///
    /// Fails with [`ChannelError::DuplicateRequestId`] without writing anything when a
    /// call with the same id is still pending.
    pub async fn send_message(
        &self,
        request: JsonRpcRequest,
    ) -> Result<JsonRpcResponse, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Cancelled);
        }

        let id = request.id.clone();
        // declared before the receiver so it runs after the receiver is dropped
        let _guard = PendingGuard {
            pending: self.pending.clone(),
            id: id.clone(),
        };
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&id) {
                return Err(ChannelError::DuplicateRequestId(id));
            }
            pending.insert(id.clone(), tx);
        }

        if let Err(e) = (self.sink)(request).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ChannelError::Cancelled),
        }
    }

    /// Like [`send_message`](Self::send_message) but gives up after `timeout`
    pub async fn send_message_with_timeout(
        &self,
        request: JsonRpcRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, ChannelError> {
        let method = request.method.clone();
        tokio::time::timeout(timeout, self.send_message(request))
            .await
            .map_err(|_| ChannelError::Timeout(format!("no response to '{method}' within {timeout:?}")))?
    }

    /// Call `M` and decode its result; error responses become [`ChannelError::Remote`]
    pub async fn call<M: RpcMethod>(&self, params: M::Params) -> Result<M::Output, ChannelError> {
        let request = self.request_for::<M>(params)?;
        self.send_message(request).await?.into_result()
    }

    pub async fn call_with_timeout<M: RpcMethod>(
        &self,
        params: M::Params,
        timeout: Duration,
    ) -> Result<M::Output, ChannelError> {
        let request = self.request_for::<M>(params)?;
        self.send_message_with_timeout(request, timeout)
            .await?
            .into_result()
    }

    fn request_for<M: RpcMethod>(&self, params: M::Params) -> Result<JsonRpcRequest, ChannelError> {
        Ok(JsonRpcRequest::new(
            self.next_request_id(),
            M::NAME,
            serde_json::to_value(params)?,
        ))
    }

    /// Complete the pending call matching `response.id`
    pub fn publish_response(&self, response: JsonRpcResponse) -> Result<(), ChannelError> {
        let slot = self
            .pending
            .lock()
            .remove(&response.id)
            .ok_or_else(|| ChannelError::UnmatchedResponse(response.id.clone()))?;
        if slot.send(Ok(response)).is_err() {
            debug!("Caller stopped waiting before the response arrived");
        }
        Ok(())
    }

    /// Subscribe to raw events published under `topic`
    pub fn subscribe_event<F>(&self, topic: &str, callback: F)
    where
        F: Fn(&EventMessage) -> Result<(), ChannelError> + Send + Sync + 'static,
    {
        self.subscribers
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(Arc::new(callback));
    }

    /// Subscribe to events under `topic`, decoded into `T`
    pub fn subscribe<T, F>(&self, topic: &str, callback: F)
    where
        T: DeserializeOwned,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.subscribe_event(topic, move |event| {
            let payload = serde_json::from_value(Value::Object(event.clone()))?;
            callback(payload);
            Ok(())
        });
    }

    /// Route an inbound event to the subscribers of its topic, in registration order.
    ///
    /// Every subscriber runs; the first failure is returned.
    pub fn publish_event(&self, event: &EventMessage) -> Result<(), ChannelError> {
        let topic = event_topic(event).ok_or_else(|| {
            ChannelError::ProtocolViolation("Event does not contain topic".into())
        })?;
        let callbacks = self
            .subscribers
            .read()
            .get(topic)
            .cloned()
            .unwrap_or_default();

        let mut first_error = None;
        for callback in callbacks {
            if let Err(e) = callback(event) {
                warn!(topic, "Event subscriber failed: {e}");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Fail every pending call with [`ChannelError::Cancelled`] and refuse new ones
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let drained: Vec<PendingSlot> = self.pending.lock().drain().map(|(_, slot)| slot).collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "Cancelling pending calls");
        }
        for slot in drained {
            let _ = slot.send(Err(ChannelError::Cancelled));
        }
    }
}

impl Drop for MessagingClient {
    fn drop(&mut self) {
        self.close();
    }
}
