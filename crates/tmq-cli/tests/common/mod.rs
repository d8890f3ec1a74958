#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio_tungstenite::tungstenite::Message;

/// A TMQ server on a background runtime that never has messages to hand out
///
/// Tracks subscribed topics, seek positions and committed offsets so the
/// offset subcommands can be exercised end to end.
pub struct TestServer {
    pub url: String,
    _runtime: Runtime,
}

#[derive(Default)]
struct State {
    topics: Vec<String>,
    committed: HashMap<(String, i64), i64>,
    positions: HashMap<(String, i64), i64>,
}

impl TestServer {
    pub fn start() -> Self {
        let runtime = Runtime::new().expect("Failed to start runtime");
        let listener = runtime
            .block_on(TcpListener::bind("127.0.0.1:0"))
            .expect("Failed to bind");
        let addr = listener.local_addr().expect("No local addr");
        let state = Arc::new(Mutex::new(State::default()));

        runtime.spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let state = state.clone();
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else {
                        return;
                    };
                    while let Some(Ok(Message::Text(text))) = ws.next().await {
                        let Ok(req) = serde_json::from_str::<Value>(&text) else {
                            continue;
                        };
                        let reply = respond(&state, &req);
                        if ws.send(Message::Text(reply.to_string())).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        Self {
            url: format!("ws://{}", addr),
            _runtime: runtime,
        }
    }
}

fn respond(state: &Mutex<State>, req: &Value) -> Value {
    let action = req["action"].as_str().unwrap_or_default();
    let args = &req["args"];
    let mut st = state.lock().expect("state lock");
    let mut body = json!({
        "code": 0,
        "message": "",
        "action": action,
        "req_id": args["req_id"],
    });
    let key = |v: &Value| {
        (
            v["topic"].as_str().unwrap_or_default().to_string(),
            v["vgroup_id"].as_i64().unwrap_or(0),
        )
    };

    match action {
        "subscribe" => {
            st.topics = args["topics"]
                .as_array()
                .map(|a| a.iter().filter_map(|t| t.as_str().map(String::from)).collect())
                .unwrap_or_default();
        }
        "poll" => body["have_message"] = json!(false),
        "list_topics" => body["topics"] = json!(st.topics),
        "assignment" => {
            let topic = args["topic"].as_str().unwrap_or_default().to_string();
            let pos = |vg: i64| st.positions.get(&(topic.clone(), vg)).copied().unwrap_or(0);
            body["assignment"] = json!([
                {"vgroup_id": 2, "offset": pos(2), "begin": 0, "end": 50},
                {"vgroup_id": 5, "offset": pos(5), "begin": 10, "end": 60},
            ]);
        }
        "seek" => {
            st.positions.insert(key(args), args["offset"].as_i64().unwrap_or(0));
        }
        "commit_offset" => {
            st.committed.insert(key(args), args["offset"].as_i64().unwrap_or(0));
        }
        "committed" | "position" => {
            let map = if action == "committed" { &st.committed } else { &st.positions };
            let offsets: Vec<i64> = args["topic_vgroup_ids"]
                .as_array()
                .map(|ids| {
                    ids.iter()
                        .map(|id| map.get(&key(id)).copied().unwrap_or(-2147467247))
                        .collect()
                })
                .unwrap_or_default();
            body[action] = json!(offsets);
        }
        "unsubscribe" => st.topics.clear(),
        _ => {
            body["code"] = json!(1);
            body["message"] = json!(format!("unsupported action {}", action));
        }
    }
    body
}

/// Write a YAML settings file into `dir`
pub fn create_config_file(dir: &TempDir, filename: &str, lines: &[&str]) -> PathBuf {
    let path = dir.path().join(filename);
    let mut file = File::create(&path).expect("Failed to create config file");
    for line in lines {
        writeln!(file, "{}", line).expect("Failed to write config line");
    }
    path
}

/// A loopback address with nothing listening on it
pub fn closed_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
    let addr = listener.local_addr().expect("No local addr");
    drop(listener);
    thread::yield_now();
    format!("ws://{}", addr)
}
