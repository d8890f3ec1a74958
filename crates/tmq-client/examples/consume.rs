//! Subscribe to a topic and print every change batch
//!
//! Run with:
//! ```bash
//! cargo run --example consume -- ws://localhost:6041 meters_topic
//! ```

use std::time::Duration;
use tmq_client::{Consumer, ConsumerConfig, Message, Result};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let url = args.next().unwrap_or_else(|| "ws://localhost:6041".to_string());
    let topic = args.next().unwrap_or_else(|| "meters_topic".to_string());

    let mut config = ConsumerConfig::new(url, "example_group");
    config.set("client.id", "example_consumer")?;
    config.set("auto.offset.reset", "earliest")?;
    config.set("enable.auto.commit", "false")?;

    let consumer = Consumer::new(config).await?;
    consumer.subscribe([topic.as_str()], None).await?;
    println!("Subscribed to {}", topic);

    let mut empty_polls = 0;
    while empty_polls < 3 {
        let Some(message) = consumer.poll(Duration::from_millis(500)).await? else {
            empty_polls += 1;
            continue;
        };
        empty_polls = 0;

        let info = message.info();
        println!(
            "[{} vgroup {} offset {}] database {}",
            info.topic, info.vgroup_id, info.offset, info.database
        );
        match &message {
            Message::Data(data) => {
                for block in data.value() {
                    println!("  {} ({} rows)", block.table_name, block.rows.len());
                    for row in &block.rows {
                        println!("    {}", serde_json::to_string(row)?);
                    }
                }
            }
            Message::Meta(meta) => {
                for m in meta.value() {
                    println!("  schema change: {}", serde_json::to_string(m)?);
                }
            }
            Message::MetaData(md) => {
                println!("  {} schema changes, {} blocks", md.meta.len(), md.blocks.len());
            }
        }

        for tp in consumer.commit_message(&message).await? {
            println!("  committed {}", tp);
        }
    }

    let assigned = consumer.assignment().await?;
    for tp in consumer.position(&assigned).await? {
        println!("position {}", tp);
    }

    consumer.unsubscribe().await?;
    consumer.close().await;
    Ok(())
}
