use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "framecast")]
#[command(about = "📺 Flow-controlled JPEG streaming to small embedded displays", long_about = None)]
#[command(version)]
pub struct Cli {
    /// More log output (-v debug, -vv trace). RUST_LOG is used when absent.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Stream a source to a receiver
    Stream {
        /// Receiver host, optionally with port
        #[arg(long)]
        host: Option<String>,

        /// stretch, letterbox or crop
        #[arg(short, long, default_value = "letterbox")]
        scaling: String,

        /// JPEG quality in (0, 1]
        #[arg(short, long, default_value_t = 0.5)]
        quality: f32,

        /// Print telemetry as JSON lines on stdout
        #[arg(long)]
        json: bool,

        #[command(subcommand)]
        source: SourceCommand,
    },

    /// Run a local mock receiver
    Receiver {
        /// Address to bind to
        #[arg(short, long, default_value = "0.0.0.0:8080")]
        addr: String,

        /// Write received frames into this directory
        #[arg(long)]
        save_dir: Option<PathBuf>,

        /// Minimum time between ready tokens
        #[arg(long, default_value_t = 33)]
        min_interval_ms: u64,
    },
}

#[derive(Subcommand)]
pub enum SourceCommand {
    /// Play a directory of images (or a list of files) as a clip
    Images {
        /// A directory, or one or more image files in playback order
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Playback rate of the clip
        #[arg(long, default_value_t = 15.0)]
        fps: f64,

        /// Start over after the last image
        #[arg(long = "loop")]
        looping: bool,
    },

    /// Synthetic colour bars
    Pattern {
        #[arg(long, default_value_t = 640)]
        width: u32,

        #[arg(long, default_value_t = 480)]
        height: u32,
    },

    /// Capture the primary display (needs the screen-capture feature)
    Screen,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

pub const CONTROL_HELP: &str = "Commands: start | stop | mode <stretch|letterbox|crop> | quality <0-1> | status | quit";

/// A line typed on stdin while streaming
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    Start,
    Stop,
    Mode(String),
    Quality(f32),
    Status,
    Help,
    Quit,
}

impl ControlCommand {
    /// Parse one input line. `Ok(None)` for a blank line, `Err` carries a
    /// message for the user.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(command) = parts.first() else {
            return Ok(None);
        };

        let command = match command.to_ascii_lowercase().as_str() {
            "start" => ControlCommand::Start,
            "stop" => ControlCommand::Stop,
            "mode" | "scaling" => {
                if parts.len() < 2 {
                    return Err("Usage: mode <stretch|letterbox|crop>".to_string());
                }
                ControlCommand::Mode(parts[1].to_string())
            }
            "quality" | "q" => {
                if parts.len() < 2 {
                    return Err("Usage: quality <0-1>".to_string());
                }
                let value = parts[1]
                    .parse::<f32>()
                    .map_err(|_| format!("Not a number: {}", parts[1]))?;
                ControlCommand::Quality(value)
            }
            "status" => ControlCommand::Status,
            "help" | "?" => ControlCommand::Help,
            "quit" | "exit" => ControlCommand::Quit,
            other => return Err(format!("Unknown command: {}. {}", other, CONTROL_HELP)),
        };
        Ok(Some(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_control_commands() {
        assert_eq!(ControlCommand::parse("start"), Ok(Some(ControlCommand::Start)));
        assert_eq!(ControlCommand::parse("  STOP \n"), Ok(Some(ControlCommand::Stop)));
        assert_eq!(
            ControlCommand::parse("mode crop"),
            Ok(Some(ControlCommand::Mode("crop".to_string())))
        );
        assert_eq!(
            ControlCommand::parse("quality 0.8"),
            Ok(Some(ControlCommand::Quality(0.8)))
        );
        assert_eq!(ControlCommand::parse("exit"), Ok(Some(ControlCommand::Quit)));
        assert_eq!(ControlCommand::parse("   "), Ok(None));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(ControlCommand::parse("mode").is_err());
        assert!(ControlCommand::parse("quality high").is_err());
        let err = ControlCommand::parse("rewind").unwrap_err();
        assert!(err.contains("rewind"));
    }

    #[test]
    fn test_stream_args() {
        let cli = Cli::try_parse_from([
            "framecast", "-v", "stream", "--host", "esp.local", "--scaling", "crop", "images", "clip", "--fps", "24",
            "--loop",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Commands::Stream {
                host,
                scaling,
                quality,
                json,
                source: SourceCommand::Images { paths, fps, looping },
            } => {
                assert_eq!(host.as_deref(), Some("esp.local"));
                assert_eq!(scaling, "crop");
                assert_eq!(quality, 0.5);
                assert!(!json);
                assert_eq!(paths, vec![PathBuf::from("clip")]);
                assert_eq!(fps, 24.0);
                assert!(looping);
            }
            _ => panic!("expected stream with images"),
        }
    }

    #[test]
    fn test_receiver_defaults() {
        let cli = Cli::try_parse_from(["framecast", "receiver"]).unwrap();
        match cli.command {
            Commands::Receiver {
                addr,
                save_dir,
                min_interval_ms,
            } => {
                assert_eq!(addr, "0.0.0.0:8080");
                assert!(save_dir.is_none());
                assert_eq!(min_interval_ms, 33);
            }
            _ => panic!("expected receiver"),
        }
    }
}
