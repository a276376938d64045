use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use framecast::cli::{Cli, Commands, ControlCommand, SourceCommand, CONTROL_HELP};
use framecast::compose::ScalingMode;
use framecast::encode::{Encoder, Quality};
use framecast::protocol;
use framecast::receiver::{MockReceiver, ReceiverConfig, ReceiverEvent};
use framecast::source::{FrameSource, ImageSequence, TestPattern};
use framecast::streamer::{Streamer, StreamerConfig, StreamerEvent};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Stream {
            host,
            scaling,
            quality,
            json,
            source,
        } => {
            let source = open_source(source)?;
            run_stream(host, &scaling, quality, json, source).await?;
        }
        Commands::Receiver {
            addr,
            save_dir,
            min_interval_ms,
        } => {
            run_receiver(&addr, save_dir, Duration::from_millis(min_interval_ms)).await?;
        }
    }

    Ok(())
}

/// Logs go to stderr so `--json` output on stdout stays clean
fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("framecast=info")),
        1 => EnvFilter::new("framecast=debug"),
        _ => EnvFilter::new("framecast=trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_source(source: SourceCommand) -> Result<FrameSource> {
    match source {
        SourceCommand::Images { paths, fps, looping } => {
            let clip = match paths.as_slice() {
                [dir] if dir.is_dir() => ImageSequence::from_dir(dir, fps)?,
                _ => ImageSequence::open(paths, fps)?,
            };
            info!(frames = clip.len(), fps, looping, "image sequence loaded");
            Ok(FrameSource::playback(clip.looping(looping)))
        }
        SourceCommand::Pattern { width, height } => Ok(FrameSource::live(TestPattern::new(width, height))),
        SourceCommand::Screen => open_screen(),
    }
}

#[cfg(feature = "screen-capture")]
fn open_screen() -> Result<FrameSource> {
    let capture = framecast::source::ScreenCapture::start().context("Failed to start screen capture")?;
    Ok(FrameSource::live(capture))
}

#[cfg(not(feature = "screen-capture"))]
fn open_screen() -> Result<FrameSource> {
    anyhow::bail!("framecast was built without the screen-capture feature")
}

#[derive(Debug, Default, Serialize)]
struct Stats {
    timestamp: String,
    fps: Option<f64>,
    frame_size: Option<usize>,
    frames_sent: u64,
}

impl Stats {
    fn print(&mut self, json: bool) {
        self.timestamp = chrono::Utc::now().to_rfc3339();
        if json {
            match serde_json::to_string(self) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Failed to serialize stats: {}", e),
            }
        } else {
            let fps = self.fps.map(|f| format!("{:.1}", f)).unwrap_or_else(|| "-".to_string());
            let size = self
                .frame_size
                .map(|s| format!("{:.1} KB", s as f64 / 1024.0))
                .unwrap_or_else(|| "-".to_string());
            info!("FPS: {} | Frame: {} | Sent: {}", fps, size, self.frames_sent);
        }
    }
}

async fn run_stream(host: Option<String>, scaling: &str, quality: f32, json: bool, source: FrameSource) -> Result<()> {
    let config = StreamerConfig {
        scaling_mode: ScalingMode::default(),
        quality: Quality::new(quality),
    };
    let (streamer, mut events) = Streamer::spawn(Encoder::jpeg(), config);
    streamer.set_scaling_mode_named(scaling)?;
    streamer.set_source(source).await?;
    streamer.connect_websocket(host.as_deref())?;

    println!("{}", CONTROL_HELP);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    // Cleared by `stop` so a reconnect doesn't resume a stream the user ended
    let mut auto_start = true;
    let mut stats = Stats::default();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    StreamerEvent::Connected => {
                        info!("Connected to receiver");
                        if auto_start {
                            if let Err(e) = streamer.start().await {
                                warn!("Could not start streaming: {}", e);
                            }
                        }
                    }
                    StreamerEvent::ConnectionFailed(reason) => {
                        warn!("Could not reach receiver ({}), still retrying", reason);
                    }
                    StreamerEvent::Disconnected => warn!("Lost connection to receiver, reconnecting"),
                    StreamerEvent::Started => info!("Streaming"),
                    StreamerEvent::Stopped => info!("Stopped"),
                    StreamerEvent::Fps(fps) => {
                        stats.fps = fps;
                        if fps.is_some() {
                            stats.print(json);
                        }
                    }
                    StreamerEvent::FrameSize(size) => stats.frame_size = size,
                    StreamerEvent::Preview(_) => stats.frames_sent += 1,
                    StreamerEvent::Diagnostic(message) => println!("{}", message),
                }
            }
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if !handle_control(&streamer, &line, &mut auto_start).await? {
                        break;
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    debug!("stdin closed: {}", e);
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    streamer.shutdown().await;
    Ok(())
}

/// Apply one stdin command. Returns false when the user asked to quit.
async fn handle_control(streamer: &Streamer, line: &str, auto_start: &mut bool) -> Result<bool> {
    let command = match ControlCommand::parse(line) {
        Ok(Some(command)) => command,
        Ok(None) => return Ok(true),
        Err(message) => {
            println!("{}", message);
            return Ok(true);
        }
    };

    match command {
        ControlCommand::Start => {
            *auto_start = true;
            if let Err(e) = streamer.start().await {
                println!("Cannot start: {}", e);
            }
        }
        ControlCommand::Stop => {
            *auto_start = false;
            streamer.stop().await?;
        }
        ControlCommand::Mode(name) => {
            streamer.set_scaling_mode_named(&name)?;
            let status = streamer.status().await?;
            println!("Scaling: {}", status.config.scaling_mode);
        }
        ControlCommand::Quality(value) => {
            let applied = streamer.set_quality(value)?;
            println!("Quality: {:.2}", applied.value());
        }
        ControlCommand::Status => {
            let status = streamer.status().await?;
            println!(
                "Connection: {:?} | Streaming: {:?} | Scaling: {} | Quality: {:.2}",
                status.connection,
                status.streaming,
                status.config.scaling_mode,
                status.config.quality.value()
            );
        }
        ControlCommand::Help => println!("{}", CONTROL_HELP),
        ControlCommand::Quit => return Ok(false),
    }
    Ok(true)
}

async fn run_receiver(addr: &str, save_dir: Option<PathBuf>, min_interval: Duration) -> Result<()> {
    let config = ReceiverConfig {
        min_ready_interval: min_interval,
        save_dir,
        ..ReceiverConfig::default()
    };
    let receiver = MockReceiver::bind(addr, config)
        .await
        .context("Failed to start mock receiver")?;
    info!(
        "Mock receiver listening on ws://{}{}",
        receiver.local_addr()?,
        protocol::WS_PATH
    );

    let mut handle = receiver.spawn();
    let mut frames = 0u64;
    let mut bytes = 0usize;
    loop {
        tokio::select! {
            event = handle.recv() => match event {
                Some(ReceiverEvent::Frame(data)) => {
                    frames += 1;
                    bytes += data.len();
                }
                Some(ReceiverEvent::ClientDisconnected) => {
                    info!(frames, bytes, "session totals");
                    frames = 0;
                    bytes = 0;
                }
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }
    Ok(())
}
