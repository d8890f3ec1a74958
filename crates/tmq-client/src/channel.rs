//! Correlated request/response channel over a single WebSocket connection
//!
//! Many logical requests share one physical connection:
//! - A write pump owns the sink and drains a bounded send queue, bounding
//!   every write by the configured write deadline and sending keepalive pings
//! - A read pump owns the stream, extracts the request id of every inbound
//!   frame (`req_id` for text, bytes 8..16 for binary) and hands the frame to
//!   the single caller waiting on that id
//! - Frames nobody is waiting for are dropped
//!
//! Any read or write failure is terminal: the reason is recorded once and
//! every blocked or future request fails with it.

use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::protocol;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tracing::{debug, error, info, warn};

/// Stand-in period when keepalive is disabled
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365);

/// An inbound frame routed to its caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn into_text(self, action: &str) -> Result<String> {
        match self {
            Frame::Text(text) => Ok(text),
            Frame::Binary(_) => Err(Error::decode(format!(
                "expected a text response to {}, got binary",
                action
            ))),
        }
    }

    pub fn into_binary(self, action: &str) -> Result<Vec<u8>> {
        match self {
            Frame::Binary(data) => Ok(data),
            Frame::Text(text) => {
                // Failures on binary actions come back as JSON
                protocol::decode_response::<protocol::AckResp>(&text)?;
                Err(Error::decode(format!(
                    "expected a binary response to {}, got text",
                    action
                )))
            }
        }
    }
}

#[derive(Debug, Clone)]
enum CloseReason {
    Closed,
    Transport(String),
}

impl CloseReason {
    fn to_error(&self) -> Error {
        match self {
            CloseReason::Closed => Error::Closed,
            CloseReason::Transport(msg) => Error::Transport(msg.clone()),
        }
    }
}

#[derive(Default)]
struct Registry {
    pending: HashMap<u64, oneshot::Sender<Frame>>,
    closed: Option<CloseReason>,
}

/// Pending-request registry shared by callers and the read pump
#[derive(Default)]
struct Shared {
    registry: Mutex<Registry>,
}

impl Shared {
    fn register(&self, req_id: u64, tx: oneshot::Sender<Frame>) -> Result<()> {
        let mut registry = self.registry.lock();
        if let Some(reason) = &registry.closed {
            return Err(reason.to_error());
        }
        if registry.pending.contains_key(&req_id) {
            return Err(Error::Transport(format!(
                "request id {} is already in flight",
                req_id
            )));
        }
        registry.pending.insert(req_id, tx);
        Ok(())
    }

    fn cancel(&self, req_id: u64) {
        self.registry.lock().pending.remove(&req_id);
    }

    /// Hand a frame to its waiting caller; false when nobody is waiting
    fn deliver(&self, req_id: u64, frame: Frame) -> bool {
        let waiter = self.registry.lock().pending.remove(&req_id);
        match waiter {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Record the terminal reason and fail every pending request.
    /// Only the first reason sticks; returns whether this call set it.
    fn shut(&self, reason: CloseReason) -> bool {
        let drained = {
            let mut registry = self.registry.lock();
            if registry.closed.is_some() {
                return false;
            }
            registry.closed = Some(reason);
            std::mem::take(&mut registry.pending)
        };
        // Dropping the senders wakes every waiter
        drop(drained);
        true
    }

    fn close_error(&self) -> Error {
        match &self.registry.lock().closed {
            Some(reason) => reason.to_error(),
            None => Error::Transport("response channel dropped".to_string()),
        }
    }

    fn transport_error(&self) -> Option<String> {
        match &self.registry.lock().closed {
            Some(CloseReason::Transport(msg)) => Some(msg.clone()),
            _ => None,
        }
    }

    fn is_closed(&self) -> bool {
        self.registry.lock().closed.is_some()
    }

    fn pending_len(&self) -> usize {
        self.registry.lock().pending.len()
    }
}

struct Pumps {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// Multiplexes request/response pairs over one connection
pub struct Channel {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<WsMessage>,
    pumps: Mutex<Option<Pumps>>,
    message_timeout: Duration,
    write_wait: Duration,
}

impl Channel {
    /// Dial the configured endpoint and start the pumps
    ///
    /// With `auto_reconnect` set, a failed dial is retried
    /// `reconnect_retry_count` times. There is no reconnect once connected.
    pub async fn connect(config: &TransportConfig) -> Result<Self> {
        let endpoint = config.endpoint();
        let attempts = if config.auto_reconnect {
            config.reconnect_retry_count + 1
        } else {
            1
        };

        let mut last_error = String::new();
        for attempt in 1..=attempts {
            info!("Connecting to TMQ endpoint {} (attempt {})", endpoint, attempt);
            match timeout(
                config.message_timeout,
                tokio_tungstenite::connect_async(endpoint.as_str()),
            )
            .await
            {
                Ok(Ok((stream, _response))) => {
                    info!("Connected to {}", endpoint);
                    return Ok(Self::from_stream(stream, config));
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!("dial timed out after {:?}", config.message_timeout)
                }
            }
            warn!("Failed to connect to {}: {}", endpoint, last_error);
            if attempt < attempts {
                tokio::time::sleep(config.reconnect_interval).await;
            }
        }

        Err(Error::Connection(format!("{}: {}", endpoint, last_error)))
    }

    /// Start the pumps over an already established WebSocket
    pub fn from_stream<S>(stream: S, config: &TransportConfig) -> Self
    where
        S: Stream<Item = std::result::Result<WsMessage, WsError>>
            + Sink<WsMessage, Error = WsError>
            + Send
            + Unpin
            + 'static,
    {
        let (sink, stream) = stream.split();
        let (outbound, rx) = mpsc::channel(config.channel_len.max(1));
        let shared = Arc::new(Shared::default());

        let writer = tokio::spawn(write_pump(
            sink,
            rx,
            shared.clone(),
            config.write_wait,
            config.keepalive_interval,
        ));
        let reader = tokio::spawn(read_pump(stream, shared.clone()));

        Self {
            shared,
            outbound,
            pumps: Mutex::new(Some(Pumps { reader, writer })),
            message_timeout: config.message_timeout,
            write_wait: config.write_wait,
        }
    }

    pub fn message_timeout(&self) -> Duration {
        self.message_timeout
    }

    /// Send one request and wait for the frame carrying the same id
    ///
    /// Resolves with the response, `Error::Timeout` once `budget` elapses
    /// (the pending entry is removed), or the channel's terminal error.
    pub async fn request(
        &self,
        req_id: u64,
        action: &'static str,
        message: WsMessage,
        budget: Duration,
    ) -> Result<Frame> {
        let (tx, rx) = oneshot::channel();
        self.shared.register(req_id, tx)?;
        debug!("Sending {} request {}", action, req_id);

        let exchange = async {
            if self.outbound.send(message).await.is_err() {
                return Err(self.shared.close_error());
            }
            rx.await.map_err(|_| self.shared.close_error())
        };

        match timeout(budget, exchange).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(e)) => {
                self.shared.cancel(req_id);
                Err(e)
            }
            Err(_) => {
                self.shared.cancel(req_id);
                debug!("{} request {} timed out after {:?}", action, req_id, budget);
                Err(Error::Timeout {
                    req_id,
                    action,
                    timeout: budget,
                })
            }
        }
    }

    /// Whether close was called or the transport failed
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// The terminal transport failure, if one occurred
    pub fn transport_error(&self) -> Option<String> {
        self.shared.transport_error()
    }

    /// Number of requests currently waiting for a response
    pub fn pending_requests(&self) -> usize {
        self.shared.pending_len()
    }

    /// Fail outstanding requests, send a Close frame and stop both pumps
    ///
    /// Safe to call repeatedly; only the first call does any work. Bounded
    /// by the write deadline.
    pub async fn close(&self) {
        let Some(pumps) = self.pumps.lock().take() else {
            return;
        };
        self.shared.shut(CloseReason::Closed);

        let Pumps { reader, mut writer } = pumps;
        reader.abort();
        if self.outbound.try_send(WsMessage::Close(None)).is_ok() {
            if timeout(self.write_wait, &mut writer).await.is_err() {
                writer.abort();
            }
        } else {
            writer.abort();
        }
        info!("TMQ channel closed");
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(pumps) = self.pumps.lock().take() {
            self.shared.shut(CloseReason::Closed);
            pumps.reader.abort();
            pumps.writer.abort();
        }
    }
}

async fn write_pump<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<WsMessage>,
    shared: Arc<Shared>,
    write_wait: Duration,
    keepalive: Duration,
) where
    S: Sink<WsMessage, Error = WsError> + Unpin,
{
    let period = if keepalive.is_zero() { FAR_FUTURE } else { keepalive };
    let mut ping = interval_at(Instant::now() + period, period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let message = tokio::select! {
            next = rx.recv() => match next {
                Some(message) => message,
                None => break,
            },
            _ = ping.tick() => WsMessage::Ping(Vec::new()),
        };
        let closing = matches!(message, WsMessage::Close(_));

        match timeout(write_wait, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if shared.shut(CloseReason::Transport(format!("write failed: {}", e))) {
                    error!("TMQ write pump stopped: {}", e);
                }
                break;
            }
            Err(_) => {
                let reason = format!("write timed out after {:?}", write_wait);
                if shared.shut(CloseReason::Transport(reason.clone())) {
                    error!("TMQ write pump stopped: {}", reason);
                }
                break;
            }
        }

        if closing {
            break;
        }
    }
    debug!("Write pump exited");
}

/// Pings are answered by tungstenite while the stream is read
async fn read_pump<St>(mut stream: St, shared: Arc<Shared>)
where
    St: Stream<Item = std::result::Result<WsMessage, WsError>> + Unpin,
{
    let reason = loop {
        match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => match protocol::text_req_id(&text) {
                Ok(req_id) => route(&shared, req_id, Frame::Text(text)),
                Err(e) => debug!("Dropping text frame: {}", e),
            },
            Some(Ok(WsMessage::Binary(data))) => match protocol::binary_req_id(&data) {
                Ok(req_id) => route(&shared, req_id, Frame::Binary(data)),
                Err(e) => debug!("Dropping binary frame: {}", e),
            },
            Some(Ok(WsMessage::Close(frame))) => {
                break match frame {
                    Some(f) => format!("server closed connection ({}): {}", f.code, f.reason),
                    None => "server closed connection".to_string(),
                };
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => break format!("read failed: {}", e),
            None => break "connection closed by peer".to_string(),
        }
    };

    if shared.shut(CloseReason::Transport(reason.clone())) {
        warn!("TMQ read pump stopped: {}", reason);
    }
}

fn route(shared: &Shared, req_id: u64, frame: Frame) {
    if !shared.deliver(req_id, frame) {
        debug!("No caller waiting for request {}, frame dropped", req_id);
    }
}
