use std::path::PathBuf;
use std::time::Duration;

use audio_engine::config::AnalysisMode;
use clap::{Parser, ValueEnum};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("PEACHY_GIT_SHA"),
    ", ",
    env!("PEACHY_BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "peachy", version = VERSION, about = "Headless audio player")]
pub struct Args {
    /// Audio files or directories to queue (directories expand to their audio files)
    pub paths: Vec<PathBuf>,

    /// Engine config file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Initial volume in percent
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
    pub volume: Option<u8>,

    /// Visualization shown under the progress line
    #[arg(long, value_enum)]
    pub analysis: Option<VisualArg>,

    /// Ring buffer size in seconds of audio
    #[arg(long)]
    pub buffer_seconds: Option<f32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum VisualArg {
    Spectrum,
    Waveform,
}

impl From<VisualArg> for AnalysisMode {
    fn from(v: VisualArg) -> Self {
        match v {
            VisualArg::Spectrum => AnalysisMode::Spectrum,
            VisualArg::Waveform => AnalysisMode::Waveform,
        }
    }
}

/// One line typed on stdin.
#[derive(Clone, Debug, PartialEq)]
pub enum UserCommand {
    Toggle,
    Stop,
    Next,
    Previous,
    Seek(Duration),
    Volume(u8),
    Quit,
}

/// Parse a stdin command; `None` for blank or unknown input.
pub fn parse_command(line: &str) -> Option<UserCommand> {
    let mut parts = line.split_whitespace();
    let cmd = parts.next()?;
    let arg = parts.next();
    match (cmd, arg) {
        ("p", None) => Some(UserCommand::Toggle),
        ("s", None) => Some(UserCommand::Stop),
        ("n", None) => Some(UserCommand::Next),
        ("b", None) => Some(UserCommand::Previous),
        ("q", None) => Some(UserCommand::Quit),
        ("seek", Some(secs)) => {
            let secs: f64 = secs.parse().ok()?;
            (secs.is_finite() && secs >= 0.0).then(|| UserCommand::Seek(Duration::from_secs_f64(secs)))
        }
        ("vol", Some(pct)) => pct.parse::<u8>().ok().filter(|v| *v <= 100).map(UserCommand::Volume),
        _ => None,
    }
}

pub const HELP: &str = "commands: p (play/pause)  s (stop)  n (next)  b (previous)  seek <secs>  vol <0-100>  q (quit)";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_letter_commands() {
        assert_eq!(parse_command("p"), Some(UserCommand::Toggle));
        assert_eq!(parse_command("  n  "), Some(UserCommand::Next));
        assert_eq!(parse_command("b"), Some(UserCommand::Previous));
        assert_eq!(parse_command("q"), Some(UserCommand::Quit));
        assert_eq!(parse_command(""), None);
        assert_eq!(parse_command("x"), None);
    }

    #[test]
    fn parses_arguments() {
        assert_eq!(
            parse_command("seek 12.5"),
            Some(UserCommand::Seek(Duration::from_millis(12_500)))
        );
        assert_eq!(parse_command("seek -1"), None);
        assert_eq!(parse_command("vol 40"), Some(UserCommand::Volume(40)));
        assert_eq!(parse_command("vol 140"), None);
        assert_eq!(parse_command("p extra"), None);
    }

    #[test]
    fn args_parse_paths_and_flags() {
        let args = Args::parse_from([
            "peachy",
            "--volume",
            "30",
            "--analysis",
            "waveform",
            "a.flac",
            "music",
        ]);
        assert_eq!(args.volume, Some(30));
        assert_eq!(args.analysis, Some(VisualArg::Waveform));
        assert_eq!(args.paths.len(), 2);
        assert!(Args::try_parse_from(["peachy", "--volume", "101"]).is_err());
    }
}
