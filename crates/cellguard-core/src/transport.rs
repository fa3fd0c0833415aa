use crate::config::DEFAULT_MAX_LINE_LENGTH;
use crate::error::ChannelError;
use crate::protocol::{
    self, ContentType, EventMessage, InboundMessage, JsonRpcRequest, JsonRpcResponse,
};
use crate::stdio::LineWriter;
use crate::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Asynchronous subscriber for one kind of inbound message
pub type MessageCallback<T> =
    Arc<dyn Fn(T) -> BoxFuture<'static, Result<(), ChannelError>> + Send + Sync>;

/// Synchronous observer for errors raised while reading or delivering
pub type ErrorObserver = Arc<dyn Fn(&ChannelError) + Send + Sync>;

type LineReader = FramedRead<Box<dyn AsyncRead + Unpin + Send>, LinesCodec>;

fn boxed<T, F, Fut>(callback: F) -> MessageCallback<T>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ChannelError>> + Send + 'static,
{
    Arc::new(move |message| -> BoxFuture<'static, Result<(), ChannelError>> {
        Box::pin(callback(message))
    })
}

#[derive(Default)]
struct Subscribers {
    requests: Vec<MessageCallback<JsonRpcRequest>>,
    responses: Vec<MessageCallback<JsonRpcResponse>>,
    events: Vec<MessageCallback<EventMessage>>,
    errors: Vec<ErrorObserver>,
}

struct Shared {
    reader: tokio::sync::Mutex<LineReader>,
    writer: LineWriter,
    subscribers: RwLock<Subscribers>,
    closed: watch::Sender<bool>,
}

enum ReadLoop {
    Idle,
    Running {
        token: CancellationToken,
        task: JoinHandle<()>,
    },
    Stopped,
}

/// Bidirectional line-delimited JSON channel over a byte stream pair.
///
/// Inbound lines are classified by their envelope and fanned out to subscribers.
/// The read loop never waits on a subscriber: every request and every response is
/// delivered on its own task, and events are handed to a delivery task that keeps
/// their wire order. Outbound messages are written as whole lines under one lock.
pub struct MessageTransport {
    shared: Arc<Shared>,
    read_loop: Mutex<ReadLoop>,
}

impl MessageTransport {
    pub fn new(
        reader: impl AsyncRead + Unpin + Send + 'static,
        writer: impl AsyncWrite + Unpin + Send + 'static,
    ) -> Self {
        Self::with_max_line_length(reader, writer, DEFAULT_MAX_LINE_LENGTH)
    }

    pub fn with_max_line_length(
        reader: impl AsyncRead + Unpin + Send + 'static,
        writer: impl AsyncWrite + Unpin + Send + 'static,
        max_line_length: usize,
    ) -> Self {
        let reader: Box<dyn AsyncRead + Unpin + Send> = Box::new(reader);
        let (closed, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                reader: tokio::sync::Mutex::new(FramedRead::new(
                    reader,
                    LinesCodec::new_with_max_length(max_line_length),
                )),
                writer: LineWriter::new(writer),
                subscribers: RwLock::new(Subscribers::default()),
                closed,
            }),
            read_loop: Mutex::new(ReadLoop::Idle),
        }
    }

    /// Begin (or resume) reading. Must be called from within a tokio runtime.
    ///
    /// Lines that arrived while the transport was stopped and are already readable
    /// are discarded. Calling `start` on a running transport replaces its read loop.
    pub fn start(&self) {
        let mut read_loop = self.read_loop.lock();
        match &*read_loop {
            ReadLoop::Running { token, .. } => token.cancel(),
            ReadLoop::Stopped => {
                let discarded = self.discard_buffered_lines();
                if discarded > 0 {
                    debug!(discarded, "Discarded lines received while stopped");
                }
            }
            ReadLoop::Idle => {}
        }

        let token = CancellationToken::new();
        let task = tokio::spawn(read_lines(self.shared.clone(), token.clone()));
        *read_loop = ReadLoop::Running { token, task };
    }

    /// Stop reading and wait for the read loop to wind down. Idempotent.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.read_loop.lock(), ReadLoop::Stopped);
        if let ReadLoop::Running { token, task } = previous {
            token.cancel();
            if let Err(e) = task.await {
                warn!("Read loop ended abnormally: {e}");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(&*self.read_loop.lock(), ReadLoop::Running { token, .. } if !token.is_cancelled())
    }

    /// Resolves once the inbound stream has reached end of file
    pub async fn closed(&self) {
        let mut closed = self.shared.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    fn discard_buffered_lines(&self) -> usize {
        let Ok(mut reader) = self.shared.reader.try_lock() else {
            return 0;
        };
        let mut cx = Context::from_waker(Waker::noop());
        let mut discarded = 0;
        loop {
            match Pin::new(&mut *reader).poll_next(&mut cx) {
                Poll::Ready(Some(Ok(_))) => discarded += 1,
                Poll::Ready(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => discarded += 1,
                Poll::Ready(Some(Err(LinesCodecError::Io(_)))) | Poll::Ready(None) => break,
                Poll::Pending => break,
            }
        }
        discarded
    }

    pub fn subscribe_request<F, Fut>(&self, callback: F)
    where
        F: Fn(JsonRpcRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ChannelError>> + Send + 'static,
    {
        self.shared.subscribers.write().requests.push(boxed(callback));
    }

    pub fn subscribe_response<F, Fut>(&self, callback: F)
    where
        F: Fn(JsonRpcResponse) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ChannelError>> + Send + 'static,
    {
        self.shared.subscribers.write().responses.push(boxed(callback));
    }

    pub fn subscribe_event<F, Fut>(&self, callback: F)
    where
        F: Fn(EventMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ChannelError>> + Send + 'static,
    {
        self.shared.subscribers.write().events.push(boxed(callback));
    }

    pub fn subscribe_error<F>(&self, observer: F)
    where
        F: Fn(&ChannelError) + Send + Sync + 'static,
    {
        self.shared.subscribers.write().errors.push(Arc::new(observer));
    }

    pub async fn publish_request(&self, request: &JsonRpcRequest) -> Result<(), ChannelError> {
        self.publish(ContentType::Request, request).await
    }

    pub async fn publish_response(&self, response: &JsonRpcResponse) -> Result<(), ChannelError> {
        self.publish(ContentType::Response, response).await
    }

    /// Publish `event` under `topic`; the payload must serialize to a JSON object
    pub async fn publish_event<T: Serialize>(
        &self,
        topic: &str,
        event: &T,
    ) -> Result<(), ChannelError> {
        let body = protocol::event_body(topic, event)?;
        self.publish(ContentType::Event, &body).await
    }

    async fn publish<T: Serialize>(
        &self,
        content_type: ContentType,
        body: &T,
    ) -> Result<(), ChannelError> {
        let line = protocol::wrap(content_type, body)?;
        trace!(%content_type, "Publishing message");
        self.shared.writer.write_line(&line).await?;
        Ok(())
    }
}

impl Drop for MessageTransport {
    fn drop(&mut self) {
        if let ReadLoop::Running { token, .. } = &*self.read_loop.lock() {
            token.cancel();
        }
    }
}

async fn read_lines(shared: Arc<Shared>, token: CancellationToken) {
    let mut reader = tokio::select! {
        _ = token.cancelled() => return,
        reader = shared.reader.lock() => reader,
    };
    debug!("Read loop started");
    let events = event_lane(shared.clone());

    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("Read loop cancelled");
                return;
            }
            next = reader.next() => next,
        };

        match next {
            Some(Ok(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                shared.handle_line(line, &events);
            }
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                shared.report_error(&ChannelError::Framing(
                    "line exceeds the maximum length and was skipped".into(),
                ));
            }
            Some(Err(LinesCodecError::Io(e))) => {
                shared.report_error(&ChannelError::Transport(e));
                shared.closed.send_replace(true);
                return;
            }
            None => {
                debug!("Inbound stream reached end of file");
                shared.closed.send_replace(true);
                return;
            }
        }
    }
}

/// Delivery task for events; it drains what was queued and ends once the read loop
/// drops the sender
fn event_lane(shared: Arc<Shared>) -> mpsc::UnboundedSender<EventMessage> {
    let (tx, mut rx) = mpsc::unbounded_channel::<EventMessage>();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let callbacks = shared.subscribers.read().events.clone();
            shared.deliver(callbacks, event).await;
        }
    });
    tx
}

impl Shared {
    fn handle_line(
        self: &Arc<Self>,
        line: String,
        events: &mpsc::UnboundedSender<EventMessage>,
    ) {
        let message = match InboundMessage::parse_line(&line) {
            Ok(message) => message,
            Err(e) => {
                self.report_error(&e);
                return;
            }
        };

        match message {
            InboundMessage::Request(request) => {
                let callbacks = self.subscribers.read().requests.clone();
                let shared = self.clone();
                tokio::spawn(async move { shared.deliver(callbacks, request).await });
            }
            InboundMessage::Response(response) => {
                let callbacks = self.subscribers.read().responses.clone();
                let shared = self.clone();
                tokio::spawn(async move { shared.deliver(callbacks, response).await });
            }
            InboundMessage::Event(event) => {
                if events.send(event).is_err() {
                    warn!("Event delivery task is gone; event dropped");
                }
            }
        }
    }

    async fn deliver<T: Clone>(&self, callbacks: Vec<MessageCallback<T>>, message: T) {
        for callback in callbacks {
            if let Err(e) = callback(message.clone()).await {
                self.report_error(&e);
            }
        }
    }

    fn report_error(&self, error: &ChannelError) {
        warn!(code = error.code(), "Transport error: {error}");
        let observers = self.subscribers.read().errors.clone();
        for observer in observers {
            if std::panic::catch_unwind(AssertUnwindSafe(|| observer(error))).is_err() {
                warn!("Error observer panicked");
            }
        }
    }
}
