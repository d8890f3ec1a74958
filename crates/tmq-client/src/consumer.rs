//! Consumer session
//!
//! A [`Consumer`] owns one connection and one consumer-group session on it.
//! Every operation is a correlated round trip over the shared [`Channel`], so
//! a consumer can be shared behind an `Arc` and queried from several tasks
//! while another task polls.

use crate::block::decode_block;
use crate::channel::{Channel, Frame};
use crate::config::ConsumerConfig;
use crate::error::{Error, Result};
use crate::message::{
    parse_meta, DataMessage, Message, MessageInfo, Meta, MetaDataMessage, MetaMessage, TableBlock,
};
use crate::offsets::{reassemble, to_wire_ids, Assignment, Offset, TopicPartition};
use crate::protocol::{self, BinaryFrame, TmqResponse};
use crate::types::{DataType, Field, Precision};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

/// Lifecycle of a consumer session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, not subscribed
    Created,
    Subscribed,
    /// Waiting on or between polls
    Polling,
    /// Draining the blocks of a polled message
    Fetching,
    Closed,
    /// The transport failed; only `close` is meaningful
    Errored,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Created => "created",
            SessionState::Subscribed => "subscribed",
            SessionState::Polling => "polling",
            SessionState::Fetching => "fetching",
            SessionState::Closed => "closed",
            SessionState::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// Hook invoked when the subscription changes
pub trait RebalanceListener: Send + Sync {
    fn on_assigned(&self, topics: &[String]);
    fn on_revoked(&self, topics: &[String]);
}

struct Session {
    state: SessionState,
    topics: Vec<String>,
    last_message_id: Option<u64>,
    listener: Option<Arc<dyn RebalanceListener>>,
}

/// A TMQ consumer bound to one WebSocket connection
pub struct Consumer {
    config: ConsumerConfig,
    channel: Channel,
    next_req_id: AtomicU64,
    session: Mutex<Session>,
}

impl Consumer {
    /// Validate the configuration and open the connection
    pub async fn new(config: ConsumerConfig) -> Result<Self> {
        config.validate()?;
        let channel = Channel::connect(&config.transport).await?;
        Ok(Self::with_channel(config, channel))
    }

    /// Build a consumer over an already running channel
    pub fn with_channel(config: ConsumerConfig, channel: Channel) -> Self {
        Self {
            config,
            channel,
            next_req_id: AtomicU64::new(1),
            session: Mutex::new(Session {
                state: SessionState::Created,
                topics: Vec::new(),
                last_message_id: None,
                listener: None,
            }),
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        let state = self.session.lock().state;
        if state != SessionState::Closed && self.channel.transport_error().is_some() {
            return SessionState::Errored;
        }
        state
    }

    /// Topics recorded by the last successful subscribe
    pub fn topics(&self) -> Vec<String> {
        self.session.lock().topics.clone()
    }

    /// Handle of the most recently polled message
    pub fn last_message_id(&self) -> Option<u64> {
        self.session.lock().last_message_id
    }

    fn req_id(&self) -> u64 {
        self.next_req_id.fetch_add(1, Ordering::Relaxed)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.session.lock().state == SessionState::Closed {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn set_state(&self, state: SessionState) {
        let mut session = self.session.lock();
        if session.state != SessionState::Closed {
            session.state = state;
        }
    }

    async fn send(
        &self,
        action: &'static str,
        req_id: u64,
        body: &impl Serialize,
        budget: Duration,
    ) -> Result<Frame> {
        self.ensure_open()?;
        let text = protocol::encode_request(action, body)?;
        self.channel
            .request(req_id, action, WsMessage::Text(text), budget)
            .await
    }

    /// Text round trip decoded into `T`, with non-zero codes mapped to errors
    async fn call<T>(
        &self,
        action: &'static str,
        req_id: u64,
        body: &impl Serialize,
        budget: Duration,
    ) -> Result<T>
    where
        T: DeserializeOwned + TmqResponse,
    {
        let frame = self.send(action, req_id, body, budget).await?;
        protocol::decode_response(&frame.into_text(action)?)
    }

    fn timeout(&self) -> Duration {
        self.channel.message_timeout()
    }

    /// Subscribe the group to `topics`
    pub async fn subscribe<I, S>(
        &self,
        topics: I,
        listener: Option<Arc<dyn RebalanceListener>>,
    ) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        let c = &self.config;
        let req_id = self.req_id();
        let req = protocol::SubscribeReq {
            req_id,
            user: c.user.clone(),
            password: c.password.clone(),
            db: c.db.clone(),
            group_id: c.group_id.clone(),
            client_id: c.client_id.clone(),
            offset_rest: c.auto_offset_reset.to_string(),
            topics: topics.clone(),
            auto_commit: c.enable_auto_commit.to_string(),
            auto_commit_interval_ms: c.auto_commit_interval_ms.to_string(),
            snapshot_enable: c.snapshot_enable.to_string(),
            with_table_name: c.with_table_name.to_string(),
            enable_batch_meta: c.enable_batch_meta.to_string(),
            session_timeout_ms: c.session_timeout_ms.map(|v| v.to_string()),
            max_poll_interval_ms: c.max_poll_interval_ms.map(|v| v.to_string()),
        };
        let _: protocol::AckResp = self
            .call(protocol::SUBSCRIBE, req_id, &req, self.timeout())
            .await?;

        info!("Subscribed group {} to {:?}", c.group_id, topics);
        {
            let mut session = self.session.lock();
            session.topics = topics.clone();
            session.state = SessionState::Subscribed;
            session.listener = listener.clone();
        }
        if let Some(listener) = listener {
            listener.on_assigned(&topics);
        }
        Ok(())
    }

    /// Poll for the next message, waiting on the server up to `timeout`
    ///
    /// `Ok(None)` means nothing was available. A returned message has been
    /// fully fetched.
    pub async fn poll(&self, timeout: Duration) -> Result<Option<Message>> {
        let req_id = self.req_id();
        let req = protocol::PollReq {
            req_id,
            blocking_time: i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX),
        };
        self.set_state(SessionState::Polling);
        let resp: protocol::PollResp = self
            .call(protocol::POLL, req_id, &req, self.timeout().saturating_add(timeout))
            .await?;

        if !resp.have_message {
            return Ok(None);
        }

        self.session.lock().last_message_id = Some(resp.message_id);
        debug!(
            "Polled message {} (type {}) from {} vgroup {} at offset {}",
            resp.message_id, resp.message_type, resp.topic, resp.vgroup_id, resp.offset
        );
        let info = MessageInfo {
            topic: resp.topic,
            database: resp.database,
            vgroup_id: resp.vgroup_id,
            offset: Offset(resp.offset),
            message_id: resp.message_id,
        };

        self.set_state(SessionState::Fetching);
        let message = self.materialize(resp.message_type, info).await;
        self.set_state(SessionState::Polling);
        message.map(Some)
    }

    async fn materialize(&self, message_type: i32, info: MessageInfo) -> Result<Message> {
        match message_type {
            protocol::MESSAGE_TYPE_DATA => {
                let blocks = self.fetch_blocks(info.message_id).await?;
                Ok(Message::Data(DataMessage { info, blocks }))
            }
            protocol::MESSAGE_TYPE_TABLE_META => {
                let meta = self.fetch_meta(info.message_id).await?;
                Ok(Message::Meta(MetaMessage { info, meta }))
            }
            protocol::MESSAGE_TYPE_METADATA => {
                let meta = self.fetch_meta(info.message_id).await?;
                let blocks = self.fetch_blocks(info.message_id).await?;
                Ok(Message::MetaData(MetaDataMessage { info, meta, blocks }))
            }
            other => Err(Error::UnknownMessageType(other)),
        }
    }

    /// Fetch and decode every block of a message, in receipt order
    async fn fetch_blocks(&self, message_id: u64) -> Result<Vec<TableBlock>> {
        let mut blocks = Vec::new();
        loop {
            let req_id = self.req_id();
            let req = protocol::MessageReq { req_id, message_id };
            let fetch: protocol::FetchResp = self
                .call(protocol::FETCH, req_id, &req, self.timeout())
                .await?;
            if fetch.completed {
                break;
            }

            let fields = fields_from_fetch(&fetch)?;
            let precision = Precision::from_code(fetch.precision).ok_or_else(|| {
                Error::decode(format!("unknown timestamp precision {}", fetch.precision))
            })?;

            let req_id = self.req_id();
            let req = protocol::MessageReq { req_id, message_id };
            let data = self
                .send(protocol::FETCH_BLOCK, req_id, &req, self.timeout())
                .await?
                .into_binary(protocol::FETCH_BLOCK)?;
            let frame = BinaryFrame::parse(&data)?;
            let rows = decode_block(frame.block, &fields, precision)?;
            if fetch.rows >= 0 && rows.len() != fetch.rows as usize {
                return Err(Error::decode(format!(
                    "fetch announced {} rows for {} but the block holds {}",
                    fetch.rows,
                    fetch.table_name,
                    rows.len()
                )));
            }

            debug!("Fetched {} rows of {}", rows.len(), fetch.table_name);
            blocks.push(TableBlock {
                table_name: fetch.table_name,
                fields,
                rows,
            });
        }
        Ok(blocks)
    }

    async fn fetch_meta(&self, message_id: u64) -> Result<Vec<Meta>> {
        let req_id = self.req_id();
        let req = protocol::MessageReq { req_id, message_id };
        let resp: protocol::FetchJsonMetaResp = self
            .call(protocol::FETCH_JSON_META, req_id, &req, self.timeout())
            .await?;
        match resp.data {
            Some(data) => parse_meta(data),
            None => Err(Error::decode("fetch_json_meta returned no data")),
        }
    }

    /// Commit the most recently polled message
    pub async fn commit(&self) -> Result<Vec<TopicPartition>> {
        let message_id = self.last_message_id().ok_or(Error::NoMessage)?;
        self.commit_id(message_id).await
    }

    /// Commit a specific polled message
    pub async fn commit_message(&self, message: &Message) -> Result<Vec<TopicPartition>> {
        self.commit_id(message.info().message_id).await
    }

    async fn commit_id(&self, message_id: u64) -> Result<Vec<TopicPartition>> {
        let req_id = self.req_id();
        let req = protocol::MessageReq { req_id, message_id };
        let _: protocol::AckResp = self
            .call(protocol::COMMIT, req_id, &req, self.timeout())
            .await?;
        debug!("Committed message {}", message_id);

        let assigned = self.assignment().await?;
        self.committed(&assigned, Duration::ZERO).await
    }

    /// Commit explicit offsets one partition at a time, then read them back
    pub async fn commit_offsets(&self, offsets: &[TopicPartition]) -> Result<Vec<TopicPartition>> {
        for tp in offsets {
            let req_id = self.req_id();
            let req = tp.offset_request(req_id);
            let _: protocol::AckResp = self
                .call(protocol::COMMIT_OFFSET, req_id, &req, self.timeout())
                .await?;
            debug!("Committed offset {}", tp);
        }
        self.committed(offsets, Duration::ZERO).await
    }

    /// Drop the subscription; the connection stays open
    pub async fn unsubscribe(&self) -> Result<()> {
        let req_id = self.req_id();
        let req = protocol::ReqIdOnly { req_id };
        let _: protocol::AckResp = self
            .call(protocol::UNSUBSCRIBE, req_id, &req, self.timeout())
            .await?;

        let (topics, listener) = {
            let mut session = self.session.lock();
            let topics = std::mem::take(&mut session.topics);
            session.last_message_id = None;
            if session.state != SessionState::Closed {
                session.state = SessionState::Created;
            }
            (topics, session.listener.take())
        };
        info!("Unsubscribed from {:?}", topics);
        if let Some(listener) = listener {
            listener.on_revoked(&topics);
        }
        Ok(())
    }

    /// Partitions assigned to this member, with their readable offset range
    pub async fn assignment_ranges(&self) -> Result<Vec<Assignment>> {
        let topics = self.topics();
        let mut out = Vec::new();
        for topic in &topics {
            let req_id = self.req_id();
            let req = protocol::AssignmentReq {
                req_id,
                topic: topic.clone(),
            };
            let resp: protocol::AssignmentResp = self
                .call(protocol::ASSIGNMENT, req_id, &req, self.timeout())
                .await?;
            out.extend(resp.assignment.iter().map(|a| Assignment::from_wire(topic, a)));
        }
        Ok(out)
    }

    /// Partitions assigned to this member, in subscription order
    pub async fn assignment(&self) -> Result<Vec<TopicPartition>> {
        Ok(self
            .assignment_ranges()
            .await?
            .into_iter()
            .map(|a| a.partition)
            .collect())
    }

    /// Committed offsets for `partitions`, in the same order
    ///
    /// A zero `timeout` uses the configured message timeout.
    pub async fn committed(
        &self,
        partitions: &[TopicPartition],
        timeout: Duration,
    ) -> Result<Vec<TopicPartition>> {
        let budget = if timeout.is_zero() { self.timeout() } else { timeout };
        let req_id = self.req_id();
        let req = protocol::PartitionsReq {
            req_id,
            topic_vgroup_ids: to_wire_ids(partitions),
        };
        let resp: protocol::CommittedResp = self
            .call(protocol::COMMITTED, req_id, &req, budget)
            .await?;
        reassemble(partitions, &resp.committed)
    }

    /// Current read positions for `partitions`, in the same order
    pub async fn position(&self, partitions: &[TopicPartition]) -> Result<Vec<TopicPartition>> {
        let req_id = self.req_id();
        let req = protocol::PartitionsReq {
            req_id,
            topic_vgroup_ids: to_wire_ids(partitions),
        };
        let resp: protocol::PositionResp = self
            .call(protocol::POSITION, req_id, &req, self.timeout())
            .await?;
        reassemble(partitions, &resp.position)
    }

    /// Move the read position of one partition
    ///
    /// The server applies the seek immediately; `_timeout` is accepted for
    /// interface parity and not used.
    pub async fn seek(&self, partition: &TopicPartition, _timeout: Duration) -> Result<()> {
        if !partition.offset.is_valid() {
            warn!("Seeking {} to the invalid offset sentinel", partition);
        }
        let req_id = self.req_id();
        let req = partition.offset_request(req_id);
        let _: protocol::AckResp = self
            .call(protocol::SEEK, req_id, &req, self.timeout())
            .await?;
        info!("Seeked {}", partition);
        Ok(())
    }

    /// Topics the server considers this member subscribed to
    pub async fn subscription(&self) -> Result<Vec<String>> {
        let req_id = self.req_id();
        let req = protocol::ReqIdOnly { req_id };
        let resp: protocol::ListTopicsResp = self
            .call(protocol::LIST_TOPICS, req_id, &req, self.timeout())
            .await?;
        Ok(resp.topics)
    }

    /// Release the connection; later calls fail with [`Error::Closed`]
    pub async fn close(&self) {
        {
            let mut session = self.session.lock();
            if session.state == SessionState::Closed {
                return;
            }
            session.state = SessionState::Closed;
        }
        if let Some(reason) = self.channel.transport_error() {
            debug!("Closing consumer after transport failure: {}", reason);
        }
        self.channel.close().await;
        info!("Consumer for group {} closed", self.config.group_id);
    }
}

/// Build the column schema announced by a fetch response
fn fields_from_fetch(fetch: &protocol::FetchResp) -> Result<Vec<Field>> {
    let count = fetch.fields_count.max(0) as usize;
    if fetch.fields_names.len() != count || fetch.fields_types.len() != count {
        return Err(Error::decode(format!(
            "fetch announced {} fields but sent {} names and {} types",
            count,
            fetch.fields_names.len(),
            fetch.fields_types.len()
        )));
    }

    fetch
        .fields_names
        .iter()
        .zip(&fetch.fields_types)
        .enumerate()
        .map(|(idx, (name, tag))| {
            let data_type = DataType::from_tag(*tag).ok_or_else(|| {
                Error::decode(format!("unknown type tag {} for column {}", tag, name))
            })?;
            let scale = fetch.fields_scales.get(idx).copied().unwrap_or(0);
            let scale = u8::try_from(scale).map_err(|_| {
                Error::decode(format!("scale {} out of range for column {}", scale, name))
            })?;
            Ok(Field {
                name: name.clone(),
                data_type,
                length: fetch.fields_lengths.get(idx).copied().unwrap_or(0),
                scale,
            })
        })
        .collect()
}
