//! Streamer: drives capture, encode and send from the receiver's ready
//! tokens.
//!
//! All state lives in one task. The [`Streamer`] handle talks to it over a
//! command channel, and progress is reported back on a
//! [`StreamerEvent`] channel. One ready token buys exactly one frame; the
//! next capture is armed only after the previous frame's send attempt, so
//! frames go out in capture order and never overlap.

use futures_util::future::BoxFuture;
use std::future::pending;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, info, warn};

use crate::compose::{compute_rects, ScalingMode};
use crate::encode::{EncodedFrame, Encoder, Quality};
use crate::error::{EncodeError, StreamError};
use crate::protocol::{Control, DEFAULT_HOST, TELEMETRY_PERIOD};
use crate::source::{CaptureTrigger, FrameSource};
use crate::telemetry::Telemetry;
use crate::transport::{ConnectionState, Transport, TransportEvent};

/// Time given to a final STOP to reach the socket before teardown
const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingState {
    Idle,
    Streaming,
}

/// Settings that can change at any time and apply from the next frame
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StreamerConfig {
    pub scaling_mode: ScalingMode,
    pub quality: Quality,
}

/// Notifications for whoever drives the streamer
#[derive(Debug, Clone, PartialEq)]
pub enum StreamerEvent {
    /// The link to the receiver opened (every successful connect)
    Connected,
    /// The first connection attempt failed before the link ever opened
    ConnectionFailed(String),
    /// An open link was lost; reconnecting
    Disconnected,
    Started,
    Stopped,
    /// Frames per second over the last period; `None` when not streaming
    Fps(Option<f64>),
    /// Size of the last frame sent; `None` when not streaming
    FrameSize(Option<usize>),
    /// Copy of the frame about to be sent
    Preview(EncodedFrame),
    /// Something worth surfacing that isn't an error
    Diagnostic(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamerStatus {
    pub connection: ConnectionState,
    pub streaming: StreamingState,
    pub config: StreamerConfig,
    pub has_source: bool,
}

enum Command {
    Connect(String),
    Start(oneshot::Sender<Result<(), StreamError>>),
    Stop(oneshot::Sender<()>),
    SetSource(FrameSource, oneshot::Sender<()>),
    SetScalingMode(ScalingMode),
    SetScalingModeNamed(String),
    SetQuality(Quality),
    Status(oneshot::Sender<StreamerStatus>),
}

/// Handle to a running streamer. Dropping it tears the streamer down,
/// including its reconnect loop and telemetry timer.
pub struct Streamer {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl Streamer {
    pub fn spawn(
        encoder: Encoder,
        config: StreamerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<StreamerEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let pipeline = Pipeline::new(encoder, config, event_tx);
        let task = tokio::spawn(pipeline.run(command_rx));
        (
            Self {
                commands: command_tx,
                task,
            },
            event_rx,
        )
    }

    /// Connect to the receiver at `host` (default `localhost`). Repeating
    /// the call for the same host does nothing; a different host replaces
    /// the connection.
    pub fn connect_websocket(&self, host: Option<&str>) -> Result<(), StreamError> {
        let host = host.unwrap_or(DEFAULT_HOST).to_string();
        self.send(Command::Connect(host))
    }

    /// Begin streaming. Rejected unless the link is open and a source is set.
    pub async fn start(&self) -> Result<(), StreamError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Start(tx))?;
        rx.await.map_err(|_| StreamError::Shutdown)?
    }

    /// Stop streaming. A no-op when already idle.
    pub async fn stop(&self) -> Result<(), StreamError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Stop(tx))?;
        rx.await.map_err(|_| StreamError::Shutdown)
    }

    /// Switch to another source. An active stream is stopped first.
    pub async fn set_source(&self, source: FrameSource) -> Result<(), StreamError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::SetSource(source, tx))?;
        rx.await.map_err(|_| StreamError::Shutdown)
    }

    pub fn set_scaling_mode(&self, mode: ScalingMode) -> Result<(), StreamError> {
        self.send(Command::SetScalingMode(mode))
    }

    /// Set the scaling mode by name. Unknown names fall back to letterbox
    /// and raise a [`StreamerEvent::Diagnostic`].
    pub fn set_scaling_mode_named(&self, name: &str) -> Result<(), StreamError> {
        self.send(Command::SetScalingModeNamed(name.to_string()))
    }

    /// Set compression quality; the clamped value actually applied is returned
    pub fn set_quality(&self, quality: f32) -> Result<Quality, StreamError> {
        let quality = Quality::new(quality);
        self.send(Command::SetQuality(quality))?;
        Ok(quality)
    }

    pub async fn status(&self) -> Result<StreamerStatus, StreamError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Status(tx))?;
        rx.await.map_err(|_| StreamError::Shutdown)
    }

    /// Stop streaming (telling the receiver) and wait for the task to end
    pub async fn shutdown(self) {
        let Streamer { commands, task } = self;
        drop(commands);
        let _ = task.await;
    }

    fn send(&self, command: Command) -> Result<(), StreamError> {
        self.commands
            .send(command)
            .map_err(|_| StreamError::Shutdown)
    }
}

/// An encode started for streaming session `generation`
struct InFlight {
    generation: u64,
    encode: BoxFuture<'static, Result<EncodedFrame, EncodeError>>,
}

/// The state owned by the streamer task
struct Pipeline {
    encoder: Encoder,
    config: StreamerConfig,
    events: mpsc::UnboundedSender<StreamerEvent>,
    source: Option<FrameSource>,

    host: Option<String>,
    transport: Option<Transport>,
    transport_events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    ever_opened: bool,
    failure_reported: bool,

    state: StreamingState,
    /// Bumped on every start so late encodes from an old session are dropped
    generation: u64,
    telemetry: Telemetry,
    ticker: Option<Interval>,
    /// Capture waiting for the source's next frame
    armed: Option<Pin<Box<Sleep>>>,
    in_flight: Option<InFlight>,
    /// Tokens that arrived while a cycle was already running
    pending_tokens: u32,
}

impl Pipeline {
    fn new(encoder: Encoder, config: StreamerConfig, events: mpsc::UnboundedSender<StreamerEvent>) -> Self {
        Self {
            encoder,
            config,
            events,
            source: None,
            host: None,
            transport: None,
            transport_events: None,
            ever_opened: false,
            failure_reported: false,
            state: StreamingState::Idle,
            generation: 0,
            telemetry: Telemetry::new(),
            ticker: None,
            armed: None,
            in_flight: None,
            pending_tokens: 0,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = next_transport_event(&mut self.transport_events) => {
                    self.handle_transport_event(event);
                }
                _ = fire(&mut self.armed) => {
                    self.armed = None;
                    self.capture();
                }
                (generation, result) = finish(&mut self.in_flight) => {
                    self.in_flight = None;
                    self.complete(generation, result);
                }
                _ = tick(&mut self.ticker) => {
                    let fps = self.telemetry.tick();
                    debug!(fps, "telemetry tick");
                    self.emit(StreamerEvent::Fps(Some(fps)));
                }
            }
        }

        if self.state == StreamingState::Streaming {
            self.go_idle(true);
            sleep(SHUTDOWN_GRACE).await;
        }
        debug!("streamer shut down");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(host) => self.connect(host),
            Command::Start(reply) => {
                let _ = reply.send(self.start());
            }
            Command::Stop(reply) => {
                self.stop();
                let _ = reply.send(());
            }
            Command::SetSource(source, reply) => {
                self.set_source(source);
                let _ = reply.send(());
            }
            Command::SetScalingMode(mode) => {
                debug!(mode = %mode, "scaling mode set");
                self.config.scaling_mode = mode;
            }
            Command::SetScalingModeNamed(name) => {
                let mode = match ScalingMode::from_name(&name) {
                    Some(mode) => mode,
                    None => {
                        let message = format!("Unknown scaling mode: {}, defaulting to 'letterbox'", name);
                        warn!("{}", message);
                        self.emit(StreamerEvent::Diagnostic(message));
                        ScalingMode::Letterbox
                    }
                };
                self.config.scaling_mode = mode;
            }
            Command::SetQuality(quality) => {
                debug!(quality = quality.value(), "quality set");
                self.config.quality = quality;
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn connect(&mut self, host: String) {
        if self.transport.is_some() && self.host.as_deref() == Some(host.as_str()) {
            debug!(%host, "already connected to this receiver");
            return;
        }
        if self.transport.is_some() {
            info!(%host, "switching receiver");
            self.go_idle(true);
        }
        if let Some(old) = self.transport.take() {
            // Keep the old link alive long enough to flush a queued STOP
            tokio::spawn(async move {
                sleep(SHUTDOWN_GRACE).await;
                drop(old);
            });
        }

        let (transport, events) = Transport::connect(&host);
        info!(url = transport.url(), "connecting to receiver");
        self.transport = Some(transport);
        self.transport_events = Some(events);
        self.host = Some(host);
        self.ever_opened = false;
        self.failure_reported = false;
    }

    fn connection_state(&self) -> ConnectionState {
        self.transport
            .as_ref()
            .map(|t| t.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn start(&mut self) -> Result<(), StreamError> {
        if self.connection_state() != ConnectionState::Open {
            warn!("Start rejected: receiver connection is not open");
            return Err(StreamError::NotConnected);
        }
        let Some(source) = self.source.as_mut() else {
            warn!("Start rejected: no source selected");
            return Err(StreamError::NoSource);
        };
        if self.state == StreamingState::Streaming {
            return Ok(());
        }

        self.state = StreamingState::Streaming;
        self.generation += 1;
        self.pending_tokens = 0;

        let now = Instant::now();
        self.telemetry.begin(now);
        source.resume();
        if let Some(transport) = &self.transport {
            transport.send_control(Control::Start);
        }
        let mut ticker = interval_at(now + TELEMETRY_PERIOD, TELEMETRY_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);

        info!(
            source = ?self.source,
            mode = %self.config.scaling_mode,
            quality = self.config.quality.value(),
            "streaming started"
        );
        self.emit(StreamerEvent::Started);
        Ok(())
    }

    fn stop(&mut self) {
        if self.state == StreamingState::Idle {
            return;
        }
        self.go_idle(true);
    }

    /// Leave the streaming state. `notify_receiver` sends STOP when the link
    /// is still open; a failed send is fine, the receiver times out alone.
    fn go_idle(&mut self, notify_receiver: bool) {
        if self.state == StreamingState::Idle {
            return;
        }
        self.armed = None;
        self.pending_tokens = 0;
        // An encode still running is left to finish and discarded then
        self.state = StreamingState::Idle;

        if let Some(source) = self.source.as_mut() {
            source.pause();
        }
        if notify_receiver {
            if let Some(transport) = self.transport.as_ref().filter(|t| t.is_open()) {
                transport.send_control(Control::Stop);
            }
        }

        self.ticker = None;
        self.telemetry.reset();
        self.emit(StreamerEvent::Fps(None));
        self.emit(StreamerEvent::FrameSize(None));
        self.emit(StreamerEvent::Stopped);
        info!("streaming stopped");
    }

    fn set_source(&mut self, mut source: FrameSource) {
        if self.state == StreamingState::Streaming {
            info!("switching source, stopping the active stream first");
            self.go_idle(true);
        }
        source.pause();
        debug!(?source, "source selected");
        self.source = Some(source);
    }

    fn status(&self) -> StreamerStatus {
        StreamerStatus {
            connection: self.connection_state(),
            streaming: self.state,
            config: self.config,
            has_source: self.source.is_some(),
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connecting { attempt } => debug!(attempt, "connecting to receiver"),
            TransportEvent::Opened => {
                self.ever_opened = true;
                self.emit(StreamerEvent::Connected);
            }
            TransportEvent::Ready => self.on_ready(),
            TransportEvent::Closed { was_open, reason } => {
                if self.state == StreamingState::Streaming {
                    self.go_idle(false);
                }
                if was_open {
                    self.emit(StreamerEvent::Disconnected);
                } else if !self.ever_opened && !self.failure_reported {
                    self.failure_reported = true;
                    self.emit(StreamerEvent::ConnectionFailed(reason));
                }
            }
        }
    }

    fn on_ready(&mut self) {
        if self.state != StreamingState::Streaming {
            debug!("ready token while idle, ignoring");
            return;
        }
        if self.armed.is_some() || self.in_flight.is_some() {
            self.pending_tokens += 1;
            debug!(pending = self.pending_tokens, "cycle busy, token queued");
            return;
        }
        self.arm();
    }

    /// Start one capture cycle for a ready token
    fn arm(&mut self) {
        let Some(source) = self.source.as_ref() else {
            return;
        };
        match source.trigger() {
            Ok(CaptureTrigger::Immediate) => self.capture(),
            Ok(CaptureTrigger::NextFrame(delay)) => {
                self.armed = Some(Box::pin(sleep(delay)));
            }
            Err(e) => {
                debug!(reason = %e, "source not ready, skipping cycle");
                self.next_pending();
            }
        }
    }

    fn capture(&mut self) {
        if self.state != StreamingState::Streaming {
            return;
        }
        let Some(source) = self.source.as_mut() else {
            return;
        };
        let frame = match source.capture() {
            Ok(frame) => frame,
            Err(e) => {
                debug!(reason = %e, "source not ready, skipping cycle");
                self.next_pending();
                return;
            }
        };

        let (width, height) = frame.dimensions();
        let (canvas_w, canvas_h) = self.encoder.canvas_size();
        let rects = match compute_rects(width, height, canvas_w, canvas_h, self.config.scaling_mode) {
            Ok(rects) => rects,
            Err(e) => {
                debug!(reason = %e, "cannot composite frame, skipping cycle");
                self.next_pending();
                return;
            }
        };

        let encoder = self.encoder.clone();
        let quality = self.config.quality;
        self.in_flight = Some(InFlight {
            generation: self.generation,
            encode: Box::pin(async move { encoder.encode(frame, rects, quality).await }),
        });
    }

    fn complete(&mut self, generation: u64, result: Result<EncodedFrame, EncodeError>) {
        if generation != self.generation || self.state != StreamingState::Streaming {
            debug!("stream stopped during encode, discarding frame");
        } else {
            match result {
                Ok(frame) => self.deliver(frame),
                Err(e) => warn!("Encode failed, skipping frame: {}", e),
            }
        }
        self.next_pending();
    }

    fn deliver(&mut self, frame: EncodedFrame) {
        let size = frame.len();
        self.telemetry.on_frame_sent(size);
        self.emit(StreamerEvent::FrameSize(Some(size)));
        self.emit(StreamerEvent::Preview(frame.clone()));

        let sent = self
            .transport
            .as_ref()
            .map(|t| t.send(frame.into_bytes()))
            .unwrap_or(false);
        if sent {
            debug!(bytes = size, "frame sent");
        } else {
            debug!(bytes = size, "transport not open, frame dropped");
        }
    }

    fn next_pending(&mut self) {
        if self.pending_tokens > 0 && self.state == StreamingState::Streaming {
            self.pending_tokens -= 1;
            self.arm();
        }
    }

    fn emit(&self, event: StreamerEvent) {
        let _ = self.events.send(event);
    }
}

async fn next_transport_event(
    events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> TransportEvent {
    if let Some(events) = events {
        if let Some(event) = events.recv().await {
            return event;
        }
    }
    pending().await
}

async fn fire(armed: &mut Option<Pin<Box<Sleep>>>) {
    match armed {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

async fn finish(in_flight: &mut Option<InFlight>) -> (u64, Result<EncodedFrame, EncodeError>) {
    match in_flight {
        Some(job) => (job.generation, (&mut job.encode).await),
        None => pending().await,
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => pending().await,
    }
}
