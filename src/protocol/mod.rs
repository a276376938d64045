use std::time::Duration;

/// Path the receiver serves its WebSocket on
pub const WS_PATH: &str = "/ws";

/// Fixed output canvas. The receiver decodes a fixed-size JPEG stream and
/// cannot negotiate resolution.
pub const CANVAS_WIDTH: u32 = 288;
pub const CANVAS_HEIGHT: u32 = 240;

/// Flow-control token sent by the receiver, one per frame it can accept
pub const READY_TOKEN: &str = "ready";

/// Flat delay between reconnect attempts (no backoff, no cap)
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Telemetry reporting period
pub const TELEMETRY_PERIOD: Duration = Duration::from_secs(1);

/// Host used when the caller doesn't name one
pub const DEFAULT_HOST: &str = "localhost";

/// Out-of-band text commands sent to the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Receiver should start its decode/display loop
    Start,
    /// Receiver should halt its decode/display loop
    Stop,
}

impl Control {
    pub fn as_str(&self) -> &'static str {
        match self {
            Control::Start => "START",
            Control::Stop => "STOP",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "START" => Some(Control::Start),
            "STOP" => Some(Control::Stop),
            _ => None,
        }
    }
}

/// Text message received from the receiver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Ready,
    Other(String),
}

impl Inbound {
    pub fn parse(text: &str) -> Self {
        if text == READY_TOKEN {
            Inbound::Ready
        } else {
            Inbound::Other(text.to_string())
        }
    }
}

/// Build the receiver URL for `host` (`host` or `host:port`).
/// A scheme or trailing slash typed by the user is tolerated.
pub fn ws_url(host: &str) -> String {
    let host = host.trim();
    let host = host
        .strip_prefix("ws://")
        .or_else(|| host.strip_prefix("http://"))
        .unwrap_or(host)
        .trim_end_matches('/');
    let host = if host.is_empty() { DEFAULT_HOST } else { host };
    format!("ws://{}{}", host, WS_PATH)
}
