#![allow(dead_code)]

//! In-process fakes: an SDCP printer on a WebSocket and a push-upload HTTP endpoint.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::{http, Message};

/// How the fake printer answers.
#[derive(Clone)]
pub struct Behavior {
    /// Mainboard id reported in responses.
    pub mainboard_id: String,
    /// Command codes that never get a response.
    pub silent_codes: Vec<u64>,
    /// `FileTransferInfo.Status` reported after pulling a file.
    pub transfer_status: u64,
    /// Send a malformed frame and a stray response before each real one.
    pub noise: bool,
    /// Follow the attributes reply with a finished transfer of `plate_1.gcode`.
    pub stale_transfer: bool,
    /// Wait this long after a pull request before fetching the URL.
    pub fetch_delay: Duration,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            mainboard_id: "BOARD-123".into(),
            silent_codes: vec![],
            transfer_status: 2,
            noise: false,
            stale_transfer: false,
            fetch_delay: Duration::ZERO,
        }
    }
}

/// A fake SDCP printer accepting WebSocket upgrades on one path only.
pub struct MockPrinter {
    pub addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<Value>>>,
    downloads: Arc<Mutex<Vec<Vec<u8>>>>,
    task: JoinHandle<()>,
}

impl MockPrinter {
    pub async fn start(path: &'static str, behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));
        let downloads = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let connections = Arc::clone(&connections);
            let received = Arc::clone(&received);
            let downloads = Arc::clone(&downloads);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(
                        stream,
                        path,
                        behavior.clone(),
                        Arc::clone(&received),
                        Arc::clone(&downloads),
                    ));
                }
            })
        };

        Self {
            addr,
            connections,
            received,
            downloads,
            task,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// TCP connections accepted, including rejected upgrades.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Request frames received, in order.
    pub fn received(&self) -> Vec<Value> {
        self.received.lock().clone()
    }

    /// Bodies fetched from pull-upload URLs.
    pub fn downloads(&self) -> Vec<Vec<u8>> {
        self.downloads.lock().clone()
    }
}

impl Drop for MockPrinter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    stream: TcpStream,
    path: &'static str,
    behavior: Behavior,
    received: Arc<Mutex<Vec<Value>>>,
    downloads: Arc<Mutex<Vec<Vec<u8>>>>,
) {
    let check_path = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if req.uri().path() == path {
            Ok(resp)
        } else {
            Err(http::Response::builder()
                .status(http::StatusCode::NOT_FOUND)
                .body(None)
                .unwrap())
        }
    };
    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, check_path).await else {
        return;
    };
    let (mut tx, mut rx) = ws.split();

    while let Some(Ok(message)) = rx.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let frame: Value = serde_json::from_str(&text).unwrap();
        received.lock().push(frame.clone());

        let cmd = frame["Data"]["Cmd"].as_u64().unwrap();
        if behavior.silent_codes.contains(&cmd) {
            continue;
        }
        if behavior.noise {
            tx.send(Message::Text("{not json".into())).await.unwrap();
            let stray = response(&behavior, cmd, "0000", json!({"Ack": 0}));
            tx.send(Message::Text(stray.to_string())).await.unwrap();
        }

        let request_id = frame["Data"]["RequestID"].as_str().unwrap().to_string();
        let data = match cmd {
            1 => json!({"Ack": 0, "MainboardID": behavior.mainboard_id, "MainboardIP": "127.0.0.1"}),
            _ => json!({"Ack": 0}),
        };
        let reply = response(&behavior, cmd, &request_id, data);
        tx.send(Message::Text(reply.to_string())).await.unwrap();

        match cmd {
            1 if behavior.stale_transfer => {
                let status = status_frame(
                    &behavior,
                    json!({"FileTransferInfo": {"Status": 2, "Filename": "plate_1.gcode"}}),
                );
                tx.send(Message::Text(status.to_string())).await.unwrap();
            }
            0 => {
                let status = status_frame(&behavior, json!({"CurrentStatus": [0]}));
                tx.send(Message::Text(status.to_string())).await.unwrap();
            }
            256 => {
                let url = frame["Data"]["Data"]["URL"].as_str().unwrap();
                let filename = frame["Data"]["Data"]["Filename"].as_str().unwrap();
                tokio::time::sleep(behavior.fetch_delay).await;
                if let Ok(resp) = reqwest::get(url).await {
                    if let Ok(body) = resp.bytes().await {
                        downloads.lock().push(body.to_vec());
                    }
                }
                for (name, code) in [("someone_else.gcode", 2), (filename, 1), (filename, behavior.transfer_status)] {
                    let status = status_frame(
                        &behavior,
                        json!({
                            "CurrentStatus": [2],
                            "FileTransferInfo": {"Status": code, "Filename": name, "DownloadOffset": 0, "FileTotalSize": 0}
                        }),
                    );
                    tx.send(Message::Text(status.to_string())).await.unwrap();
                }
            }
            _ => {}
        }
    }
}

fn response(behavior: &Behavior, cmd: u64, request_id: &str, data: Value) -> Value {
    json!({
        "Id": "",
        "Topic": format!("sdcp/response/{}", behavior.mainboard_id),
        "Data": {
            "Cmd": cmd,
            "Data": data,
            "RequestID": request_id,
            "MainboardID": behavior.mainboard_id,
            "TimeStamp": 0
        }
    })
}

fn status_frame(behavior: &Behavior, status: Value) -> Value {
    json!({
        "Id": "",
        "Topic": format!("sdcp/status/{}", behavior.mainboard_id),
        "Status": status,
        "MainboardID": behavior.mainboard_id,
        "TimeStamp": 0
    })
}

/// An HTTP endpoint answering every request with one status code.
pub struct MockPushServer {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl MockPushServer {
    pub async fn start(status: StatusCode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let app = {
            let hits = Arc::clone(&hits);
            Router::new().fallback(move || {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    (status, "ok")
                }
            })
        };
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, hits, task }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for MockPushServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A port with nothing listening on it.
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
