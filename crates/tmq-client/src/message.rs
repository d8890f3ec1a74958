//! Messages materialized from a poll

use crate::error::{Error, Result};
use crate::offsets::{Offset, TopicPartition};
use crate::types::{Field, Value};
use serde::{Deserialize, Serialize};

/// Where a polled message came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageInfo {
    pub topic: String,
    pub database: String,
    pub vgroup_id: i32,
    pub offset: Offset,
    /// Server handle used for follow-up fetch and commit calls
    pub message_id: u64,
}

impl MessageInfo {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.vgroup_id).with_offset(self.offset)
    }
}

/// Rows of one source table from one block fetch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableBlock {
    pub table_name: String,
    pub fields: Vec<Field>,
    pub rows: Vec<Vec<Value>>,
}

impl TableBlock {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Cell by row index and column name
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MetaColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MetaTag {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: i32,
    #[serde(default)]
    pub value: serde_json::Value,
}

/// Child table entry of a batched create
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildTable {
    pub table_name: String,
    #[serde(default)]
    pub using: String,
    #[serde(default)]
    pub tag_num: i32,
    #[serde(default)]
    pub tags: Vec<MetaTag>,
}

/// Schema-change descriptor delivered by `fetch_json_meta`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Meta {
    #[serde(rename_all = "camelCase")]
    Create {
        table_type: String,
        table_name: String,
        #[serde(default)]
        using: Option<String>,
        #[serde(default)]
        columns: Vec<MetaColumn>,
        #[serde(default)]
        tags: Vec<serde_json::Value>,
        #[serde(default)]
        create_list: Vec<ChildTable>,
    },
    #[serde(rename_all = "camelCase")]
    Alter {
        table_type: String,
        table_name: String,
        alter_type: i32,
        #[serde(default)]
        col_name: Option<String>,
        #[serde(default)]
        col_new_name: Option<String>,
        #[serde(default)]
        col_type: Option<i32>,
        #[serde(default)]
        col_length: Option<i32>,
        #[serde(default)]
        col_value: Option<String>,
        #[serde(default)]
        col_value_null: Option<bool>,
    },
    #[serde(rename_all = "camelCase")]
    Drop {
        #[serde(default)]
        table_type: Option<String>,
        #[serde(default)]
        table_name: Option<String>,
        #[serde(default)]
        table_name_list: Vec<String>,
    },
    Delete {
        sql: String,
    },
}

/// Parse the `data` payload of a `fetch_json_meta` response
///
/// Accepts a single descriptor or the batched `{"metas": [...]}` form.
pub fn parse_meta(data: serde_json::Value) -> Result<Vec<Meta>> {
    #[derive(Deserialize)]
    struct Batch {
        metas: Vec<Meta>,
    }

    if data.get("metas").is_some() {
        let batch: Batch = serde_json::from_value(data)
            .map_err(|e| Error::decode(format!("malformed batch meta: {}", e)))?;
        return Ok(batch.metas);
    }
    let meta: Meta = serde_json::from_value(data)
        .map_err(|e| Error::decode(format!("malformed meta: {}", e)))?;
    Ok(vec![meta])
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataMessage {
    pub info: MessageInfo,
    pub blocks: Vec<TableBlock>,
}

impl DataMessage {
    /// Row batches in the order they were fetched
    pub fn value(&self) -> &[TableBlock] {
        &self.blocks
    }

    pub fn row_count(&self) -> usize {
        self.blocks.iter().map(|b| b.rows.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetaMessage {
    pub info: MessageInfo,
    pub meta: Vec<Meta>,
}

impl MetaMessage {
    pub fn value(&self) -> &[Meta] {
        &self.meta
    }
}

/// Schema change plus the rows created with it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetaDataMessage {
    pub info: MessageInfo,
    pub meta: Vec<Meta>,
    pub blocks: Vec<TableBlock>,
}

/// One polled message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    Data(DataMessage),
    Meta(MetaMessage),
    MetaData(MetaDataMessage),
}

impl Message {
    pub fn info(&self) -> &MessageInfo {
        match self {
            Message::Data(m) => &m.info,
            Message::Meta(m) => &m.info,
            Message::MetaData(m) => &m.info,
        }
    }

    pub fn topic(&self) -> &str {
        &self.info().topic
    }

    pub fn database(&self) -> &str {
        &self.info().database
    }

    pub fn offset(&self) -> Offset {
        self.info().offset
    }

    pub fn topic_partition(&self) -> TopicPartition {
        self.info().topic_partition()
    }

    /// Row batches carried by this message, empty for pure schema changes
    pub fn blocks(&self) -> &[TableBlock] {
        match self {
            Message::Data(m) => &m.blocks,
            Message::Meta(_) => &[],
            Message::MetaData(m) => &m.blocks,
        }
    }

    /// Schema changes carried by this message, empty for pure data
    pub fn metas(&self) -> &[Meta] {
        match self {
            Message::Data(_) => &[],
            Message::Meta(m) => &m.meta,
            Message::MetaData(m) => &m.meta,
        }
    }
}
