//! WebSocket link to the receiver.
//!
//! A single connection to `ws://{host}/ws`, re-established after every
//! close or failure on a flat [`RECONNECT_DELAY`]. Outbound messages only go
//! out while the link is open; anything sent otherwise is dropped, never
//! queued for the next connection.

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

use crate::protocol::{self, Control, Inbound, RECONNECT_DELAY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// Link activity reported to the owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A connection attempt has started (1-based, counting every attempt)
    Connecting { attempt: u64 },
    /// Handshake completed
    Opened,
    /// Receiver sent a flow-control token
    Ready,
    /// Connection closed or the attempt failed. `was_open` tells whether
    /// this attempt ever reached the open state.
    Closed { was_open: bool, reason: String },
}

/// Link state shared between the handle and the connection task.
/// The open state carries the queue into the live socket.
enum Link {
    Disconnected,
    Connecting,
    Open(mpsc::UnboundedSender<WsMessage>),
    Closing,
}

impl Link {
    fn state(&self) -> ConnectionState {
        match self {
            Link::Disconnected => ConnectionState::Disconnected,
            Link::Connecting => ConnectionState::Connecting,
            Link::Open(_) => ConnectionState::Open,
            Link::Closing => ConnectionState::Closing,
        }
    }
}

pub struct Transport {
    url: String,
    link: watch::Receiver<Link>,
    task: JoinHandle<()>,
}

impl Transport {
    /// Start connecting to `host` and keep reconnecting until dropped
    pub fn connect(host: &str) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        Self::connect_with_delay(host, RECONNECT_DELAY)
    }

    pub fn connect_with_delay(
        host: &str,
        reconnect_delay: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let url = protocol::ws_url(host);
        let (link_tx, link_rx) = watch::channel(Link::Disconnected);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(run_link(url.clone(), link_tx, event_tx, reconnect_delay));

        (
            Self {
                url,
                link: link_rx,
                task,
            },
            event_rx,
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        self.link.borrow().state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Send one binary frame. Returns false (and drops the frame) unless
    /// the link is open.
    pub fn send(&self, frame: Vec<u8>) -> bool {
        self.send_message(WsMessage::Binary(frame))
    }

    /// Send an out-of-band text command. Same drop rule as [`Transport::send`].
    pub fn send_control(&self, control: Control) -> bool {
        self.send_message(WsMessage::Text(control.as_str().to_string()))
    }

    fn send_message(&self, message: WsMessage) -> bool {
        match &*self.link.borrow() {
            Link::Open(tx) => tx.send(message).is_ok(),
            other => {
                debug!(state = ?other.state(), "transport not open, dropping outbound message");
                false
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_link(
    url: String,
    link: watch::Sender<Link>,
    events: mpsc::UnboundedSender<TransportEvent>,
    reconnect_delay: Duration,
) {
    let mut attempt = 0u64;

    loop {
        attempt += 1;
        link.send_replace(Link::Connecting);
        debug!(%url, attempt, "connecting");
        if events.send(TransportEvent::Connecting { attempt }).is_err() {
            // Owner is gone
            break;
        }

        let (was_open, reason) = session(&url, &link, &events).await;
        link.send_replace(Link::Disconnected);

        if was_open {
            warn!(%url, %reason, "connection to receiver closed, retrying in {:?}", reconnect_delay);
        } else {
            warn!(%url, %reason, "connection attempt failed, retrying in {:?}", reconnect_delay);
        }
        if events
            .send(TransportEvent::Closed { was_open, reason })
            .is_err()
        {
            break;
        }

        sleep(reconnect_delay).await;
    }

    link.send_replace(Link::Disconnected);
}

/// One connection lifetime. Returns whether it opened and why it ended.
async fn session(
    url: &str,
    link: &watch::Sender<Link>,
    events: &mpsc::UnboundedSender<TransportEvent>,
) -> (bool, String) {
    let ws_stream = match connect_async(url).await {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => return (false, e.to_string()),
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<WsMessage>();
    link.send_replace(Link::Open(outgoing_tx));
    info!(%url, "connected to receiver");
    let _ = events.send(TransportEvent::Opened);

    let reason = loop {
        tokio::select! {
            outgoing = outgoing_rx.recv() => match outgoing {
                Some(message) => {
                    if let Err(e) = ws_sender.send(message).await {
                        break format!("send failed: {}", e);
                    }
                }
                None => break "link dropped".to_string(),
            },
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => match Inbound::parse(&text) {
                    Inbound::Ready => {
                        let _ = events.send(TransportEvent::Ready);
                    }
                    Inbound::Other(other) => debug!(message = %other, "ignoring text from receiver"),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    link.send_replace(Link::Closing);
                    break match frame {
                        Some(frame) => format!("closed by receiver: {}", frame.reason),
                        None => "closed by receiver".to_string(),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break e.to_string(),
                None => break "stream ended".to_string(),
            },
        }
    };

    (true, reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::{MockReceiver, ReceiverConfig, ReceiverEvent};
    use tokio::time::{timeout, Instant};

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("transport event channel closed")
    }

    async fn wait_for(
        rx: &mut mpsc::UnboundedReceiver<TransportEvent>,
        wanted: impl Fn(&TransportEvent) -> bool,
    ) -> TransportEvent {
        loop {
            let event = next_event(rx).await;
            if wanted(&event) {
                return event;
            }
        }
    }

    /// An address nothing listens on
    async fn dead_address() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr.to_string()
    }

    #[tokio::test]
    async fn test_send_dropped_when_not_open() {
        let (transport, _events) = Transport::connect(&dead_address().await);
        assert_ne!(transport.state(), ConnectionState::Open);
        assert!(!transport.send(vec![1, 2, 3]));
        assert!(!transport.send_control(Control::Start));
    }

    #[tokio::test]
    async fn test_open_ready_and_send() {
        let mut receiver = MockReceiver::bind("127.0.0.1:0", ReceiverConfig::manual())
            .await
            .unwrap()
            .spawn();
        let (transport, mut events) = Transport::connect(&receiver.addr().to_string());

        assert_eq!(next_event(&mut events).await, TransportEvent::Connecting { attempt: 1 });
        assert_eq!(next_event(&mut events).await, TransportEvent::Opened);
        assert_eq!(transport.state(), ConnectionState::Open);
        assert_eq!(transport.url(), format!("ws://{}/ws", receiver.addr()));
        assert_eq!(receiver.next_event().await, Some(ReceiverEvent::ClientConnected));

        assert!(transport.send_control(Control::Start));
        assert_eq!(receiver.next_event().await, Some(ReceiverEvent::Control(Control::Start)));

        receiver.send_ready().await;
        assert_eq!(next_event(&mut events).await, TransportEvent::Ready);

        assert!(transport.send(vec![0xFF, 0xD8, 0xFF]));
        assert_eq!(
            receiver.next_event().await,
            Some(ReceiverEvent::Frame(vec![0xFF, 0xD8, 0xFF]))
        );
    }

    #[tokio::test]
    async fn test_failed_attempts_retry_on_flat_interval() {
        let delay = Duration::from_millis(200);
        let (transport, mut events) = Transport::connect_with_delay(&dead_address().await, delay);

        let mut last_close = None;
        for attempt in 1..=4u64 {
            let event = next_event(&mut events).await;
            assert_eq!(event, TransportEvent::Connecting { attempt });
            if let Some(closed_at) = last_close {
                let waited = Instant::now().duration_since(closed_at);
                assert!(waited >= delay / 2, "retried after {:?}", waited);
                assert!(waited < delay * 5, "retried after {:?}", waited);
            }
            let event = next_event(&mut events).await;
            assert!(matches!(event, TransportEvent::Closed { was_open: false, .. }));
            last_close = Some(Instant::now());
        }
        assert_ne!(transport.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_reconnects_after_receiver_drops_connection() {
        let mut receiver = MockReceiver::bind("127.0.0.1:0", ReceiverConfig::manual())
            .await
            .unwrap()
            .spawn();
        let (transport, mut events) = Transport::connect(&receiver.addr().to_string());
        wait_for(&mut events, |e| *e == TransportEvent::Opened).await;
        assert_eq!(receiver.next_event().await, Some(ReceiverEvent::ClientConnected));

        receiver.disconnect_all().await;
        let closed = wait_for(&mut events, |e| matches!(e, TransportEvent::Closed { .. })).await;
        assert!(matches!(closed, TransportEvent::Closed { was_open: true, .. }));
        let closed_at = Instant::now();
        assert!(!transport.send(vec![1]));

        let event = wait_for(&mut events, |e| matches!(e, TransportEvent::Connecting { .. })).await;
        assert_eq!(event, TransportEvent::Connecting { attempt: 2 });
        let waited = closed_at.elapsed();
        assert!(waited >= Duration::from_millis(500), "retried after {:?}", waited);
        assert!(waited < Duration::from_secs(3), "retried after {:?}", waited);

        wait_for(&mut events, |e| *e == TransportEvent::Opened).await;
        assert!(transport.is_open());
    }

    #[tokio::test]
    async fn test_drop_stops_reconnecting() {
        let (transport, mut events) =
            Transport::connect_with_delay(&dead_address().await, Duration::from_millis(50));
        wait_for(&mut events, |e| matches!(e, TransportEvent::Closed { .. })).await;
        drop(transport);

        // The task is aborted, so the channel closes instead of producing
        // further attempts
        let drained = timeout(Duration::from_secs(2), async {
            while events.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok());
    }
}
