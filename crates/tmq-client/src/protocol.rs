//! TMQ wire protocol: JSON action envelopes, typed responses, binary preamble

use crate::error::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const SUBSCRIBE: &str = "subscribe";
pub const POLL: &str = "poll";
pub const FETCH: &str = "fetch";
pub const FETCH_BLOCK: &str = "fetch_block";
pub const FETCH_JSON_META: &str = "fetch_json_meta";
pub const COMMIT: &str = "commit";
pub const UNSUBSCRIBE: &str = "unsubscribe";
pub const ASSIGNMENT: &str = "assignment";
pub const SEEK: &str = "seek";
pub const COMMIT_OFFSET: &str = "commit_offset";
pub const COMMITTED: &str = "committed";
pub const POSITION: &str = "position";
pub const LIST_TOPICS: &str = "list_topics";

/// Size of the preamble in front of every binary frame
pub const BINARY_PREAMBLE_LEN: usize = 24;
const REQ_ID_OFFSET: usize = 8;
const MESSAGE_ID_OFFSET: usize = 16;

/// Message kinds reported by poll
pub const MESSAGE_TYPE_DATA: i32 = 1;
pub const MESSAGE_TYPE_TABLE_META: i32 = 2;
pub const MESSAGE_TYPE_METADATA: i32 = 3;

/// Outbound action envelope
#[derive(Debug, Serialize)]
pub struct Envelope<'a, T: Serialize> {
    pub action: &'a str,
    pub args: &'a T,
}

/// Serialize a request body into its action envelope
pub fn encode_request<T: Serialize>(action: &str, args: &T) -> Result<String> {
    Ok(serde_json::to_string(&Envelope { action, args })?)
}

/// Fields shared by every text response
pub trait TmqResponse {
    fn code(&self) -> i32;
    fn message(&self) -> &str;
}

macro_rules! tmq_response {
    ($($ty:ty),* $(,)?) => {
        $(
            impl TmqResponse for $ty {
                fn code(&self) -> i32 {
                    self.code
                }
                fn message(&self) -> &str {
                    &self.message
                }
            }
        )*
    };
}

/// Parse a text response and turn a non-zero code into a protocol error
pub fn decode_response<T>(text: &str) -> Result<T>
where
    T: DeserializeOwned + TmqResponse,
{
    let resp: T = serde_json::from_str(text)
        .map_err(|e| Error::decode(format!("malformed response: {}", e)))?;
    if resp.code() != 0 {
        return Err(Error::Protocol {
            code: resp.code(),
            message: resp.message().to_string(),
        });
    }
    Ok(resp)
}

/// Just enough of a text frame to route it
#[derive(Debug, Deserialize)]
struct Routing {
    #[serde(default)]
    req_id: u64,
}

/// Extract the correlation id of a text frame
pub fn text_req_id(text: &str) -> Result<u64> {
    let routing: Routing = serde_json::from_str(text)
        .map_err(|e| Error::decode(format!("unroutable text frame: {}", e)))?;
    Ok(routing.req_id)
}

/// Extract the correlation id of a binary frame from its fixed offset
pub fn binary_req_id(frame: &[u8]) -> Result<u64> {
    if frame.len() < BINARY_PREAMBLE_LEN {
        return Err(Error::decode(format!(
            "binary frame of {} bytes is shorter than the {}-byte preamble",
            frame.len(),
            BINARY_PREAMBLE_LEN
        )));
    }
    Ok(LittleEndian::read_u64(&frame[REQ_ID_OFFSET..MESSAGE_ID_OFFSET]))
}

/// Parsed binary preamble plus the raw block that follows it
#[derive(Debug)]
pub struct BinaryFrame<'a> {
    pub timing: u64,
    pub req_id: u64,
    pub message_id: u64,
    pub block: &'a [u8],
}

impl<'a> BinaryFrame<'a> {
    pub fn parse(frame: &'a [u8]) -> Result<Self> {
        let req_id = binary_req_id(frame)?;
        Ok(Self {
            timing: LittleEndian::read_u64(&frame[..REQ_ID_OFFSET]),
            req_id,
            message_id: LittleEndian::read_u64(&frame[MESSAGE_ID_OFFSET..BINARY_PREAMBLE_LEN]),
            block: &frame[BINARY_PREAMBLE_LEN..],
        })
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SubscribeReq {
    pub req_id: u64,
    pub user: String,
    pub password: String,
    pub db: String,
    pub group_id: String,
    pub client_id: String,
    pub offset_rest: String,
    pub topics: Vec<String>,
    pub auto_commit: String,
    pub auto_commit_interval_ms: String,
    pub snapshot_enable: String,
    pub with_table_name: String,
    pub enable_batch_meta: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_timeout_ms: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_poll_interval_ms: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollReq {
    pub req_id: u64,
    pub blocking_time: i64,
}

/// Body shared by fetch, fetch_block, fetch_json_meta and commit
#[derive(Debug, Clone, Serialize)]
pub struct MessageReq {
    pub req_id: u64,
    pub message_id: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReqIdOnly {
    pub req_id: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssignmentReq {
    pub req_id: u64,
    pub topic: String,
}

/// Body shared by seek and commit_offset
#[derive(Debug, Clone, Serialize)]
pub struct OffsetReq {
    pub req_id: u64,
    pub topic: String,
    pub vgroup_id: i32,
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicVgroupId {
    pub topic: String,
    pub vgroup_id: i32,
}

/// Body shared by committed and position
#[derive(Debug, Clone, Serialize)]
pub struct PartitionsReq {
    pub req_id: u64,
    pub topic_vgroup_ids: Vec<TopicVgroupId>,
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Acknowledgement with no payload (subscribe, commit, seek, ...)
#[derive(Debug, Clone, Deserialize)]
pub struct AckResp {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub req_id: u64,
    #[serde(default)]
    pub timing: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollResp {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub req_id: u64,
    #[serde(default)]
    pub have_message: bool,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub vgroup_id: i32,
    #[serde(default)]
    pub message_type: i32,
    #[serde(default)]
    pub message_id: u64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchResp {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub req_id: u64,
    #[serde(default)]
    pub message_id: u64,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub table_name: String,
    #[serde(default)]
    pub rows: i32,
    #[serde(default)]
    pub fields_count: i32,
    #[serde(default)]
    pub fields_names: Vec<String>,
    #[serde(default)]
    pub fields_types: Vec<i8>,
    #[serde(default)]
    pub fields_lengths: Vec<i64>,
    #[serde(default)]
    pub fields_scales: Vec<i64>,
    #[serde(default)]
    pub precision: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchJsonMetaResp {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub req_id: u64,
    #[serde(default)]
    pub message_id: u64,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireAssignment {
    pub vgroup_id: i32,
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub begin: i64,
    #[serde(default)]
    pub end: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssignmentResp {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub req_id: u64,
    #[serde(default)]
    pub assignment: Vec<WireAssignment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommittedResp {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub req_id: u64,
    #[serde(default)]
    pub committed: Vec<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PositionResp {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub req_id: u64,
    #[serde(default)]
    pub position: Vec<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListTopicsResp {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub req_id: u64,
    #[serde(default)]
    pub topics: Vec<String>,
}

tmq_response!(
    AckResp,
    PollResp,
    FetchResp,
    FetchJsonMetaResp,
    AssignmentResp,
    CommittedResp,
    PositionResp,
    ListTopicsResp,
);
