use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tmq_client::{Consumer, Message, TopicPartition};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod settings;

#[derive(Parser)]
#[command(name = "tmq")]
#[command(version)]
#[command(about = "TMQ consumer - subscribe to time-series topics over WebSocket")]
struct Cli {
    /// YAML file with consumer settings (flat `key: value` map)
    #[arg(short, long, global = true, env = "TMQ_CONFIG")]
    config: Option<PathBuf>,
    /// WebSocket URL of the server (ws.url)
    #[arg(long, global = true, env = "TMQ_URL")]
    url: Option<String>,
    /// Consumer group (group.id)
    #[arg(short, long, global = true)]
    group: Option<String>,
    /// Client id within the group (client.id)
    #[arg(long, global = true)]
    client_id: Option<String>,
    /// User name (td.connect.user)
    #[arg(short, long, global = true)]
    user: Option<String>,
    /// Password (td.connect.pass)
    #[arg(short, long, global = true, env = "TMQ_PASSWORD", hide_env_values = true)]
    password: Option<String>,
    /// Extra consumer setting as key=value, may be repeated
    #[arg(short = 'X', long = "set", global = true, value_name = "KEY=VALUE")]
    overrides: Vec<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct TopicArgs {
    /// Topic to subscribe to, may be repeated
    #[arg(short, long = "topic", required = true)]
    topics: Vec<String>,
}

#[derive(Args)]
struct PartitionArgs {
    /// Topic the partition belongs to
    #[arg(short, long)]
    topic: String,
    /// Vgroup ids to query; all assigned vgroups when omitted
    #[arg(long = "vgroup", value_delimiter = ',')]
    vgroups: Vec<i32>,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll messages and print them
    Consume {
        #[command(flatten)]
        topics: TopicArgs,
        /// Stop after this many messages
        #[arg(short = 'n', long)]
        max_messages: Option<usize>,
        /// Server-side blocking time per poll
        #[arg(long, default_value = "500ms", value_parser = humantime::parse_duration)]
        poll_timeout: Duration,
        /// Stop after this many consecutive empty polls (0 polls forever)
        #[arg(long, default_value_t = 3)]
        idle_polls: u32,
        /// Commit each message after printing it
        #[arg(long)]
        commit: bool,
        /// Print each message as one JSON line
        #[arg(long)]
        json: bool,
    },
    /// Show assigned partitions and their offset ranges
    Assignment {
        #[command(flatten)]
        topics: TopicArgs,
    },
    /// Show committed offsets
    Committed {
        #[command(flatten)]
        partitions: PartitionArgs,
        /// Timeout for the query (defaults to ws.message.timeout)
        #[arg(long, value_parser = humantime::parse_duration)]
        timeout: Option<Duration>,
    },
    /// Show current read positions
    Position {
        #[command(flatten)]
        partitions: PartitionArgs,
    },
    /// Move the read position of one partition
    Seek {
        /// Topic the partition belongs to
        #[arg(short, long)]
        topic: String,
        /// Vgroup id
        #[arg(long)]
        vgroup: i32,
        /// New offset
        #[arg(long, allow_hyphen_values = true)]
        offset: i64,
    },
    /// Commit an explicit offset for one partition
    CommitOffset {
        /// Topic the partition belongs to
        #[arg(short, long)]
        topic: String,
        /// Vgroup id
        #[arg(long)]
        vgroup: i32,
        /// Offset to commit
        #[arg(long, allow_hyphen_values = true)]
        offset: i64,
    },
    /// List the topics the server has recorded for this consumer
    Topics {
        #[command(flatten)]
        topics: TopicArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tmq=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let flags = settings::Flags {
        url: cli.url,
        group: cli.group,
        client_id: cli.client_id,
        user: cli.user,
        password: cli.password,
    };
    let config = settings::resolve(cli.config.as_deref(), &cli.overrides, &flags)
        .context("Invalid consumer configuration")?;

    let consumer = Consumer::new(config)
        .await
        .context("Failed to connect")?;
    let result = run(&consumer, cli.command).await;
    consumer.close().await;
    result
}

async fn run(consumer: &Consumer, command: Commands) -> Result<()> {
    match command {
        Commands::Consume {
            topics,
            max_messages,
            poll_timeout,
            idle_polls,
            commit,
            json,
        } => {
            subscribe(consumer, &topics.topics).await?;
            let mut received = 0usize;
            let mut idle = 0u32;

            while max_messages.map_or(true, |max| received < max) {
                let Some(message) = consumer.poll(poll_timeout).await.context("Poll failed")? else {
                    idle += 1;
                    if idle_polls > 0 && idle >= idle_polls {
                        break;
                    }
                    continue;
                };
                idle = 0;
                received += 1;

                if json {
                    println!("{}", serde_json::to_string(&message)?);
                } else {
                    print_message(&message);
                }
                if commit {
                    consumer
                        .commit_message(&message)
                        .await
                        .context("Commit failed")?;
                }
            }
            info!("Consumed {} messages", received);
            println!("{} messages", received);
        }
        Commands::Assignment { topics } => {
            subscribe(consumer, &topics.topics).await?;
            let ranges = consumer
                .assignment_ranges()
                .await
                .context("Failed to fetch assignment")?;
            for a in ranges {
                println!(
                    "{}\tvgroup {}\toffset {}\tbegin {}\tend {}",
                    a.partition.topic, a.partition.partition, a.partition.offset, a.begin, a.end
                );
            }
        }
        Commands::Committed {
            partitions,
            timeout,
        } => {
            let parts = partitions_for(consumer, &partitions).await?;
            let committed = consumer
                .committed(&parts, timeout.unwrap_or(Duration::ZERO))
                .await
                .context("Failed to fetch committed offsets")?;
            print_partitions(&committed);
        }
        Commands::Position { partitions } => {
            let parts = partitions_for(consumer, &partitions).await?;
            let positions = consumer
                .position(&parts)
                .await
                .context("Failed to fetch positions")?;
            print_partitions(&positions);
        }
        Commands::Seek {
            topic,
            vgroup,
            offset,
        } => {
            subscribe(consumer, std::slice::from_ref(&topic)).await?;
            let tp = TopicPartition::new(topic, vgroup).with_offset(offset);
            consumer
                .seek(&tp, Duration::ZERO)
                .await
                .context("Seek failed")?;
            println!("Seeked {}", tp);
        }
        Commands::CommitOffset {
            topic,
            vgroup,
            offset,
        } => {
            subscribe(consumer, std::slice::from_ref(&topic)).await?;
            let tp = TopicPartition::new(topic, vgroup).with_offset(offset);
            let committed = consumer
                .commit_offsets(&[tp])
                .await
                .context("Commit failed")?;
            print_partitions(&committed);
        }
        Commands::Topics { topics } => {
            subscribe(consumer, &topics.topics).await?;
            for topic in consumer
                .subscription()
                .await
                .context("Failed to list topics")?
            {
                println!("{}", topic);
            }
        }
    }
    Ok(())
}

async fn subscribe(consumer: &Consumer, topics: &[String]) -> Result<()> {
    consumer
        .subscribe(topics.iter().cloned(), None)
        .await
        .with_context(|| format!("Failed to subscribe to {}", topics.join(", ")))
}

/// The requested vgroups of a topic, or every vgroup assigned to this member
async fn partitions_for(consumer: &Consumer, args: &PartitionArgs) -> Result<Vec<TopicPartition>> {
    subscribe(consumer, std::slice::from_ref(&args.topic)).await?;
    if !args.vgroups.is_empty() {
        return Ok(args
            .vgroups
            .iter()
            .map(|vg| TopicPartition::new(args.topic.clone(), *vg))
            .collect());
    }
    let assigned = consumer
        .assignment()
        .await
        .context("Failed to fetch assignment")?;
    if assigned.is_empty() {
        warn!("No vgroups of {} are assigned to this consumer", args.topic);
    }
    Ok(assigned)
}

fn print_partitions(partitions: &[TopicPartition]) {
    for tp in partitions {
        println!("{}\tvgroup {}\toffset {}", tp.topic, tp.partition, tp.offset);
    }
}

fn print_message(message: &Message) {
    let info = message.info();
    println!(
        "{} vgroup {} offset {} ({})",
        info.topic, info.vgroup_id, info.offset, info.database
    );
    for meta in message.metas() {
        match serde_json::to_string(meta) {
            Ok(text) => println!("  meta {}", text),
            Err(e) => warn!("Failed to render schema change: {}", e),
        }
    }
    for block in message.blocks() {
        let names: Vec<&str> = block.fields.iter().map(|f| f.name.as_str()).collect();
        println!("  {} [{}] {} rows", block.table_name, names.join(", "), block.rows.len());
        for row in &block.rows {
            match serde_json::to_string(row) {
                Ok(text) => println!("    {}", text),
                Err(e) => warn!("Failed to render row: {}", e),
            }
        }
    }
}
