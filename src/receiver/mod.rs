//! Local stand-in for the embedded receiver.
//!
//! Speaks the receiver side of the wire protocol on `/ws`: `START` begins
//! streaming and issues the first `ready`, every binary frame is recorded
//! and answered with the next `ready` (no faster than the minimum
//! interval), `STOP` ends streaming. In manual mode no tokens are issued
//! automatically; the owner hands them out through [`ReceiverHandle`].

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

use crate::protocol::{Control, READY_TOKEN, WS_PATH};

/// The display firmware caps itself at roughly 30 fps
pub const DEFAULT_MIN_READY_INTERVAL: Duration = Duration::from_millis(1000 / 30);

/// How long [`ReceiverHandle::next_event`] waits before giving up
const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

type ClientMap = Arc<RwLock<HashMap<u64, mpsc::UnboundedSender<WsMessage>>>>;

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Answer START and every frame with a ready token
    pub auto_ready: bool,
    pub min_ready_interval: Duration,
    /// Write every received frame here as `frame_NNNNNN.jpg`
    pub save_dir: Option<PathBuf>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            auto_ready: true,
            min_ready_interval: DEFAULT_MIN_READY_INTERVAL,
            save_dir: None,
        }
    }
}

impl ReceiverConfig {
    /// Tokens are only issued through [`ReceiverHandle::send_ready`]
    pub fn manual() -> Self {
        Self {
            auto_ready: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverEvent {
    ClientConnected,
    Control(Control),
    Frame(Vec<u8>),
    ClientDisconnected,
}

pub struct MockReceiver {
    listener: TcpListener,
    config: ReceiverConfig,
}

impl MockReceiver {
    pub async fn bind(addr: &str, config: ReceiverConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        if let Some(dir) = &config.save_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the accept loop in the background
    pub fn spawn(self) -> ReceiverHandle {
        let addr = self
            .listener
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let clients: ClientMap = Arc::new(RwLock::new(HashMap::new()));
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(accept_loop(
            self.listener,
            Arc::new(self.config),
            clients.clone(),
            event_tx,
        ));

        ReceiverHandle {
            addr,
            clients,
            events: event_rx,
            task,
        }
    }
}

pub struct ReceiverHandle {
    addr: SocketAddr,
    clients: ClientMap,
    events: mpsc::UnboundedReceiver<ReceiverEvent>,
    task: JoinHandle<()>,
}

impl ReceiverHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Next event, or `None` if nothing arrives for a few seconds
    pub async fn next_event(&mut self) -> Option<ReceiverEvent> {
        timeout(EVENT_TIMEOUT, self.events.recv()).await.ok().flatten()
    }

    /// Like [`ReceiverHandle::next_event`] but never times out
    pub async fn recv(&mut self) -> Option<ReceiverEvent> {
        self.events.recv().await
    }

    /// Issue one ready token to every connected client. Returns how many
    /// clients it went to.
    pub async fn send_ready(&self) -> usize {
        let clients = self.clients.read().await;
        clients
            .values()
            .filter(|tx| tx.send(WsMessage::Text(READY_TOKEN.to_string())).is_ok())
            .count()
    }

    /// Close every client connection
    pub async fn disconnect_all(&self) {
        let mut clients = self.clients.write().await;
        for (_, tx) in clients.drain() {
            let _ = tx.send(WsMessage::Close(None));
        }
    }
}

impl Drop for ReceiverHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<ReceiverConfig>,
    clients: ClientMap,
    events: mpsc::UnboundedSender<ReceiverEvent>,
) {
    let next_id = Arc::new(AtomicU64::new(0));
    let frames_received = Arc::new(AtomicU64::new(0));

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept failed: {}", e);
                continue;
            }
        };

        let id = next_id.fetch_add(1, Ordering::Relaxed);
        let config = config.clone();
        let clients = clients.clone();
        let events = events.clone();
        let frames_received = frames_received.clone();
        tokio::spawn(async move {
            if let Err(e) =
                handle_connection(id, stream, config, clients.clone(), events, frames_received).await
            {
                debug!(%peer, "connection error: {:#}", e);
            }
            clients.write().await.remove(&id);
        });
    }
}

async fn handle_connection(
    id: u64,
    stream: TcpStream,
    config: Arc<ReceiverConfig>,
    clients: ClientMap,
    events: mpsc::UnboundedSender<ReceiverEvent>,
    frames_received: Arc<AtomicU64>,
) -> Result<()> {
    let ws_stream = accept_hdr_async(stream, check_path)
        .await
        .context("WebSocket handshake failed")?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    clients.write().await.insert(id, tx.clone());
    info!(client = id, "client connected");
    let _ = events.send(ReceiverEvent::ClientConnected);

    // Spawn task to send messages to this client
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, WsMessage::Close(_));
            if ws_sender.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    let mut streaming = false;
    let mut last_ready: Option<Instant> = None;

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => match Control::parse(&text) {
                Some(control) => {
                    info!(client = id, command = control.as_str(), "received control");
                    let _ = events.send(ReceiverEvent::Control(control));
                    streaming = control == Control::Start;
                    if streaming && config.auto_ready {
                        last_ready = Some(Instant::now());
                        let _ = tx.send(WsMessage::Text(READY_TOKEN.to_string()));
                    }
                }
                None => debug!(client = id, message = %text, "ignoring unknown text"),
            },
            Ok(WsMessage::Binary(data)) => {
                let seq = frames_received.fetch_add(1, Ordering::Relaxed);
                debug!(client = id, seq, bytes = data.len(), "frame received");
                if let Some(dir) = &config.save_dir {
                    let path = dir.join(format!("frame_{:06}.jpg", seq));
                    if let Err(e) = tokio::fs::write(&path, &data).await {
                        warn!("Failed to save {}: {}", path.display(), e);
                    }
                }
                let _ = events.send(ReceiverEvent::Frame(data));

                if streaming && config.auto_ready {
                    if let Some(last) = last_ready {
                        sleep_until(last + config.min_ready_interval).await;
                    }
                    last_ready = Some(Instant::now());
                    let _ = tx.send(WsMessage::Text(READY_TOKEN.to_string()));
                }
            }
            Ok(WsMessage::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    send_task.abort();
    info!(client = id, "client disconnected");
    let _ = events.send(ReceiverEvent::ClientDisconnected);
    Ok(())
}

fn check_path(request: &Request, response: Response) -> Result<Response, ErrorResponse> {
    if request.uri().path() == WS_PATH {
        Ok(response)
    } else {
        let mut error = ErrorResponse::new(Some(format!("no such endpoint: {}", request.uri().path())));
        *error.status_mut() = StatusCode::NOT_FOUND;
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::connect_async;

    async fn spawn(config: ReceiverConfig) -> ReceiverHandle {
        MockReceiver::bind("127.0.0.1:0", config).await.unwrap().spawn()
    }

    async fn next_text<S>(stream: &mut S) -> String
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = timeout(EVENT_TIMEOUT, stream.next()).await.unwrap().unwrap().unwrap();
            if let WsMessage::Text(text) = msg {
                return text;
            }
        }
    }

    #[tokio::test]
    async fn test_rejects_other_paths() {
        let receiver = spawn(ReceiverConfig::manual()).await;
        let url = format!("ws://{}/video", receiver.addr());
        assert!(connect_async(url).await.is_err());
    }

    #[tokio::test]
    async fn test_auto_ready_flow() {
        let mut receiver = spawn(ReceiverConfig::default()).await;
        let url = format!("ws://{}/ws", receiver.addr());
        let (ws, _) = connect_async(url).await.unwrap();
        let (mut tx, mut rx) = ws.split();
        assert_eq!(receiver.next_event().await, Some(ReceiverEvent::ClientConnected));

        tx.send(WsMessage::Text("START".into())).await.unwrap();
        assert_eq!(next_text(&mut rx).await, "ready");
        assert_eq!(receiver.next_event().await, Some(ReceiverEvent::Control(Control::Start)));

        let started = Instant::now();
        tx.send(WsMessage::Binary(vec![1, 2, 3])).await.unwrap();
        assert_eq!(next_text(&mut rx).await, "ready");
        assert!(started.elapsed() >= DEFAULT_MIN_READY_INTERVAL / 2);
        assert_eq!(receiver.next_event().await, Some(ReceiverEvent::Frame(vec![1, 2, 3])));

        tx.send(WsMessage::Text("STOP".into())).await.unwrap();
        assert_eq!(receiver.next_event().await, Some(ReceiverEvent::Control(Control::Stop)));

        // No token once stopped
        tx.send(WsMessage::Binary(vec![4])).await.unwrap();
        assert_eq!(receiver.next_event().await, Some(ReceiverEvent::Frame(vec![4])));
        assert!(timeout(Duration::from_millis(200), rx.next()).await.is_err());
    }

    #[tokio::test]
    async fn test_saves_frames() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = ReceiverConfig {
            save_dir: Some(dir.path().to_path_buf()),
            ..ReceiverConfig::manual()
        };
        let mut receiver = spawn(config).await;
        let (mut ws, _) = connect_async(format!("ws://{}/ws", receiver.addr())).await.unwrap();
        ws.send(WsMessage::Binary(vec![0xFF, 0xD8])).await.unwrap();

        loop {
            if let Some(ReceiverEvent::Frame(_)) = receiver.next_event().await {
                break;
            }
        }
        let saved = std::fs::read(dir.path().join("frame_000000.jpg")).unwrap();
        assert_eq!(saved, vec![0xFF, 0xD8]);
    }

    #[tokio::test]
    async fn test_manual_tokens_and_disconnect() {
        let mut receiver = spawn(ReceiverConfig::manual()).await;
        let (ws, _) = connect_async(format!("ws://{}/ws", receiver.addr())).await.unwrap();
        let (_tx, mut rx) = ws.split();
        assert_eq!(receiver.next_event().await, Some(ReceiverEvent::ClientConnected));

        assert_eq!(receiver.send_ready().await, 1);
        assert_eq!(next_text(&mut rx).await, "ready");

        receiver.disconnect_all().await;
        let closed = timeout(EVENT_TIMEOUT, async {
            while let Some(msg) = rx.next().await {
                if matches!(msg, Ok(WsMessage::Close(_)) | Err(_)) {
                    break;
                }
            }
        })
        .await;
        assert!(closed.is_ok());
        assert_eq!(receiver.send_ready().await, 0);
    }
}
