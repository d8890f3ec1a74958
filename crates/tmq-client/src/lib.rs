//! TMQ WebSocket Consumer Client
//!
//! Subscribes to time-series database topics over the TMQ WebSocket endpoint
//! and materializes polled change batches into typed rows.
//!
//! # Features
//!
//! - **Async/await API** - Built on tokio; one connection serves concurrent callers
//! - **Typed rows** - Raw columnar blocks are decoded into [`Value`]s per column type
//! - **Schema changes** - Create/alter/drop/delete descriptors arrive as [`Meta`]
//! - **Offset control** - Commit, seek, assignment, committed and position queries
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use tmq_client::{Consumer, ConsumerConfig, Message};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConsumerConfig::new("ws://localhost:6041", "group1");
//!     let consumer = Consumer::new(config).await?;
//!     consumer.subscribe(["meters_topic"], None).await?;
//!
//!     while let Some(message) = consumer.poll(Duration::from_millis(500)).await? {
//!         if let Message::Data(data) = &message {
//!             for block in data.value() {
//!                 println!("{}: {} rows", block.table_name, block.rows.len());
//!             }
//!         }
//!         consumer.commit_message(&message).await?;
//!     }
//!
//!     consumer.close().await;
//!     Ok(())
//! }
//! ```

pub mod block;
pub mod channel;
pub mod config;
pub mod consumer;
pub mod error;
pub mod message;
pub mod offsets;
pub mod protocol;
pub mod types;

pub use config::{ConsumerConfig, OffsetReset, TransportConfig};
pub use consumer::{Consumer, RebalanceListener, SessionState};
pub use error::{Error, Result};
pub use message::{DataMessage, Message, MessageInfo, Meta, MetaDataMessage, MetaMessage, TableBlock};
pub use offsets::{Assignment, Offset, TopicPartition};
pub use types::{DataType, Field, Precision, Timestamp, Value};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_api_exists() {
        let _: Option<Consumer> = None;
        let _: Option<Message> = None;
        assert_eq!(Offset::default(), Offset::INVALID);
    }
}
