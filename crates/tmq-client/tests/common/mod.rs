//! In-process TMQ server for integration tests
//!
//! `MockServer` accepts WebSocket connections on a loopback port and answers
//! every request through a handler. `Broker` is a stateful handler that acts
//! like a single-member consumer group over a queue of scripted messages.
#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value as Json};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tmq_client::block::BlockWriter;
use tmq_client::{ConsumerConfig, DataType, Field, Precision, Timestamp, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;

pub const INVALID_OFFSET: i64 = -2147467247;

/// One request as received by the server
#[derive(Debug, Clone)]
pub struct Request {
    pub action: String,
    pub args: Json,
}

impl Request {
    pub fn req_id(&self) -> u64 {
        self.args["req_id"].as_u64().unwrap_or(0)
    }
}

/// What the server does with one request
pub enum Reply {
    Json(Json),
    Binary(Vec<u8>),
    /// Send the inner reply after a pause, without holding up other requests
    Delayed(Duration, Box<Reply>),
    /// Never answer
    Ignore,
    /// Drop the connection
    Hangup,
}

pub type Handler = Arc<dyn Fn(&Request) -> Reply + Send + Sync>;

pub struct MockServer {
    pub url: String,
    requests: Arc<Mutex<Vec<Request>>>,
    accept: JoinHandle<()>,
}

impl MockServer {
    pub async fn start<H>(handler: H) -> Self
    where
        H: Fn(&Request) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock server");
        let addr = listener.local_addr().expect("local addr");
        let handler: Handler = Arc::new(handler);
        let requests = Arc::new(Mutex::new(Vec::new()));

        let log = requests.clone();
        let accept = tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let handler = handler.clone();
                let log = log.clone();
                tokio::spawn(async move {
                    if let Ok(ws) = tokio_tungstenite::accept_async(tcp).await {
                        serve(ws, handler, log).await;
                    }
                });
            }
        });

        Self {
            url: format!("ws://{}", addr),
            requests,
            accept,
        }
    }

    pub async fn start_broker(broker: Arc<Broker>) -> Self {
        Self::start(move |req| broker.handle(req)).await
    }

    /// Consumer configuration pointing at this server
    pub fn config(&self) -> ConsumerConfig {
        let mut config = ConsumerConfig::new(self.url.clone(), "g1");
        config.client_id = "c1".to_string();
        config.transport.message_timeout = Duration::from_secs(5);
        config.transport.keepalive_interval = Duration::ZERO;
        config
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    pub fn actions(&self) -> Vec<String> {
        self.requests.lock().iter().map(|r| r.action.clone()).collect()
    }

    pub fn requests_for(&self, action: &str) -> Vec<Json> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.action == action)
            .map(|r| r.args.clone())
            .collect()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

async fn serve<S>(ws: S, handler: Handler, log: Arc<Mutex<Vec<Request>>>)
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + Unpin
        + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        let text = match msg {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };
        let envelope: Json = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let request = Request {
            action: envelope["action"].as_str().unwrap_or_default().to_string(),
            args: envelope["args"].clone(),
        };
        log.lock().push(request.clone());

        match handler(&request) {
            Reply::Hangup => break,
            reply => dispatch(&tx, reply),
        }
    }

    writer.abort();
}

fn dispatch(tx: &mpsc::UnboundedSender<WsMessage>, reply: Reply) {
    match reply {
        Reply::Json(v) => {
            let _ = tx.send(WsMessage::Text(v.to_string()));
        }
        Reply::Binary(b) => {
            let _ = tx.send(WsMessage::Binary(b));
        }
        Reply::Delayed(pause, inner) => {
            let tx = tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(pause).await;
                dispatch(&tx, *inner);
            });
        }
        Reply::Ignore | Reply::Hangup => {}
    }
}

/// Successful response envelope for `req`, merged with `extra`
pub fn ok(req: &Request, extra: Json) -> Json {
    let mut body = json!({
        "code": 0,
        "message": "",
        "action": req.action,
        "req_id": req.req_id(),
        "timing": 1,
    });
    if let (Some(body), Json::Object(extra)) = (body.as_object_mut(), extra) {
        body.extend(extra);
    }
    body
}

pub fn error(req: &Request, code: i32, message: &str) -> Json {
    json!({
        "code": code,
        "message": message,
        "action": req.action,
        "req_id": req.req_id(),
    })
}

/// Binary frame: timing, req_id, message_id, then the raw block
pub fn binary_frame(req_id: u64, message_id: u64, block: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(24 + block.len());
    out.extend_from_slice(&7u64.to_le_bytes());
    out.extend_from_slice(&req_id.to_le_bytes());
    out.extend_from_slice(&message_id.to_le_bytes());
    out.extend_from_slice(block);
    out
}

pub fn field(name: &str, data_type: DataType) -> Field {
    Field {
        name: name.to_string(),
        data_type,
        length: data_type.fixed_width().unwrap_or(64) as i64,
        scale: 0,
    }
}

/// A table's rows as the server would ship them
#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
    pub fields: Vec<Field>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(name: &str, fields: Vec<Field>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            name: name.to_string(),
            fields,
            rows,
        }
    }

    /// The `(ts=1700000000000, v=1)` single-row table
    pub fn sample(name: &str) -> Self {
        Self::new(
            name,
            vec![field("ts", DataType::Timestamp), field("v", DataType::Int)],
            vec![vec![
                Value::Timestamp(Timestamp::new(1_700_000_000_000, Precision::Millisecond)),
                Value::Int(1),
            ]],
        )
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = BlockWriter::new(self.rows.len());
        for (idx, field) in self.fields.iter().enumerate() {
            let column = self.rows.iter().map(|r| r[idx].clone()).collect();
            writer = writer.column(field.clone(), column);
        }
        writer.finish().expect("encode block")
    }

    fn fetch_body(&self) -> Json {
        json!({
            "completed": false,
            "table_name": self.name,
            "rows": self.rows.len(),
            "fields_count": self.fields.len(),
            "fields_names": self.fields.iter().map(|f| f.name.clone()).collect::<Vec<_>>(),
            "fields_types": self.fields.iter().map(|f| f.data_type.tag()).collect::<Vec<_>>(),
            "fields_lengths": self.fields.iter().map(|f| f.length).collect::<Vec<_>>(),
            "fields_scales": self.fields.iter().map(|f| f.scale).collect::<Vec<_>>(),
            "precision": 0,
        })
    }
}

/// A message waiting to be polled
#[derive(Debug, Clone)]
pub struct Queued {
    pub message_type: i32,
    pub topic: String,
    pub database: String,
    pub vgroup_id: i32,
    pub offset: i64,
    pub message_id: u64,
    pub tables: Vec<Table>,
    pub meta: Option<Json>,
}

impl Queued {
    pub fn data(message_id: u64, topic: &str, vgroup_id: i32, offset: i64, tables: Vec<Table>) -> Self {
        Self {
            message_type: 1,
            topic: topic.to_string(),
            database: "power".to_string(),
            vgroup_id,
            offset,
            message_id,
            tables,
            meta: None,
        }
    }

    pub fn meta(message_id: u64, topic: &str, vgroup_id: i32, offset: i64, meta: Json) -> Self {
        Self {
            message_type: 2,
            meta: Some(meta),
            ..Self::data(message_id, topic, vgroup_id, offset, Vec::new())
        }
    }
}

#[derive(Default)]
struct BrokerState {
    queue: VecDeque<Queued>,
    /// Messages handed out, by message id, with how many blocks were fetched
    polled: HashMap<u64, (Queued, usize)>,
    topics: Vec<String>,
    vgroups: Vec<i32>,
    committed: HashMap<(String, i32), i64>,
    positions: HashMap<(String, i32), i64>,
}

/// A single-member consumer group over scripted messages
pub struct Broker {
    state: Mutex<BrokerState>,
}

impl Broker {
    pub fn new(vgroups: Vec<i32>, messages: Vec<Queued>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BrokerState {
                queue: messages.into(),
                vgroups,
                ..BrokerState::default()
            }),
        })
    }

    pub fn committed(&self, topic: &str, vgroup_id: i32) -> Option<i64> {
        self.state.lock().committed.get(&(topic.to_string(), vgroup_id)).copied()
    }

    pub fn handle(&self, req: &Request) -> Reply {
        let mut st = self.state.lock();
        let args = &req.args;
        let body = match req.action.as_str() {
            "subscribe" => {
                let topics: Vec<String> = args["topics"]
                    .as_array()
                    .map(|a| a.iter().filter_map(|t| t.as_str().map(String::from)).collect())
                    .unwrap_or_default();
                if topics.iter().any(|t| t == "missing") {
                    return Reply::Json(error(req, 0x2603, "Topic not exist"));
                }
                st.topics = topics;
                ok(req, json!({}))
            }
            "poll" => match st.queue.pop_front() {
                None => ok(req, json!({"have_message": false})),
                Some(q) => {
                    let body = ok(
                        req,
                        json!({
                            "have_message": true,
                            "topic": q.topic,
                            "database": q.database,
                            "vgroup_id": q.vgroup_id,
                            "message_type": q.message_type,
                            "message_id": q.message_id,
                            "offset": q.offset,
                        }),
                    );
                    st.positions.insert((q.topic.clone(), q.vgroup_id), q.offset + 1);
                    st.polled.insert(q.message_id, (q, 0));
                    body
                }
            },
            "fetch" => {
                let message_id = args["message_id"].as_u64().unwrap_or(0);
                match st.polled.get(&message_id) {
                    None => error(req, 0x2606, "message not found"),
                    Some((q, cursor)) => match q.tables.get(*cursor) {
                        Some(table) => ok(req, table.fetch_body()),
                        None => ok(req, json!({"completed": true})),
                    },
                }
            }
            "fetch_block" => {
                let message_id = args["message_id"].as_u64().unwrap_or(0);
                let Some((q, cursor)) = st.polled.get_mut(&message_id) else {
                    return Reply::Json(error(req, 0x2606, "message not found"));
                };
                let Some(table) = q.tables.get(*cursor) else {
                    return Reply::Json(error(req, 0x2607, "no block to fetch"));
                };
                let frame = binary_frame(req.req_id(), message_id, &table.encode());
                *cursor += 1;
                return Reply::Binary(frame);
            }
            "fetch_json_meta" => {
                let message_id = args["message_id"].as_u64().unwrap_or(0);
                match st.polled.get(&message_id).and_then(|(q, _)| q.meta.clone()) {
                    Some(meta) => ok(req, json!({"message_id": message_id, "data": meta})),
                    None => error(req, 0x2606, "no meta for message"),
                }
            }
            "commit" => {
                let message_id = args["message_id"].as_u64().unwrap_or(0);
                let Some((q, _)) = st.polled.get(&message_id) else {
                    return Reply::Json(error(req, 0x2606, "message not found"));
                };
                let key = (q.topic.clone(), q.vgroup_id);
                let offset = q.offset;
                st.committed.insert(key, offset);
                ok(req, json!({}))
            }
            "commit_offset" | "seek" => {
                let key = (
                    args["topic"].as_str().unwrap_or_default().to_string(),
                    args["vgroup_id"].as_i64().unwrap_or(0) as i32,
                );
                let offset = args["offset"].as_i64().unwrap_or(INVALID_OFFSET);
                if req.action == "seek" {
                    st.positions.insert(key, offset);
                } else {
                    st.committed.insert(key, offset);
                }
                ok(req, json!({}))
            }
            "unsubscribe" => {
                st.topics.clear();
                ok(req, json!({}))
            }
            "assignment" => {
                let topic = args["topic"].as_str().unwrap_or_default().to_string();
                let assignment: Vec<Json> = st
                    .vgroups
                    .iter()
                    .map(|vg| {
                        let pos = st.positions.get(&(topic.clone(), *vg)).copied().unwrap_or(0);
                        json!({"vgroup_id": vg, "offset": pos, "begin": 0, "end": 100})
                    })
                    .collect();
                ok(req, json!({"assignment": assignment}))
            }
            "committed" | "position" => {
                let map = if req.action == "committed" {
                    &st.committed
                } else {
                    &st.positions
                };
                let offsets: Vec<i64> = args["topic_vgroup_ids"]
                    .as_array()
                    .map(|ids| {
                        ids.iter()
                            .map(|id| {
                                let key = (
                                    id["topic"].as_str().unwrap_or_default().to_string(),
                                    id["vgroup_id"].as_i64().unwrap_or(0) as i32,
                                );
                                map.get(&key).copied().unwrap_or(INVALID_OFFSET)
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                let mut extra = serde_json::Map::new();
                extra.insert(req.action.clone(), json!(offsets));
                ok(req, Json::Object(extra))
            }
            "list_topics" => ok(req, json!({"topics": st.topics})),
            other => error(req, 0xffff, &format!("unknown action {}", other)),
        };
        Reply::Json(body)
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tmq_client=debug")
        .with_test_writer()
        .try_init();
}
