//! Peachy: a headless terminal player on top of `audio-engine`.
//!
//! Paths on the command line become the queue. Transport commands are read line by line
//! from stdin while a progress line and a small visualization are redrawn in place.

mod cli;
mod library;
mod render;

use std::io::{BufRead, Write};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use audio_engine::types::{AnalysisFrame, EngineEvent, EventKind, Track, TransportState};
use audio_engine::{EngineConfig, EngineError, PlaybackEngine};
use clap::Parser;
use crossbeam_channel::{Receiver, select};
use tracing_subscriber::EnvFilter;

use cli::UserCommand;

const REDRAW_INTERVAL: Duration = Duration::from_millis(100);

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,audio_engine=info,peachy=info")
        }))
        .init();

    if args.list_devices {
        for d in audio_engine::output::list_devices()? {
            let marker = if d.is_default { " (default)" } else { "" };
            println!("{}{marker}  {}-{} Hz", d.name, d.min_rate, d.max_rate);
        }
        return Ok(());
    }

    let config = load_config(&args)?;
    let files = library::expand_paths(&args.paths)?;
    if files.is_empty() {
        anyhow::bail!("nothing to play; pass audio files or directories");
    }

    let engine = PlaybackEngine::with_defaults(config).context("start playback engine")?;
    if let Some(volume) = args.volume {
        engine.set_volume(volume as f32 / 100.0);
    }
    for path in files {
        engine.queue().enqueue(Track::from_path(path));
    }
    tracing::info!(tracks = engine.queue().len(), "queued");
    eprintln!("{}", cli::HELP);

    let (quit_tx, quit_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = quit_tx.try_send(());
    })
    .context("install Ctrl-C handler")?;

    start_queue(&engine);
    run(&engine, spawn_stdin_reader()?, quit_rx);

    println!();
    engine.shutdown();
    Ok(())
}

fn load_config(args: &cli::Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(device) = &args.device {
        config.device.name = Some(device.clone());
    }
    if let Some(seconds) = args.buffer_seconds {
        config.buffer_seconds = seconds;
    }
    if let Some(mode) = args.analysis {
        config.analysis.mode = mode.into();
    }
    Ok(config)
}

/// Play the queue head, moving past entries that fail to open.
fn start_queue(engine: &PlaybackEngine) {
    while !engine.queue().is_empty() {
        match engine.play() {
            Ok(()) => return,
            Err(e) => tracing::warn!(error = %e, "skipping track"),
        }
    }
}

fn spawn_stdin_reader() -> Result<Receiver<UserCommand>> {
    let (tx, rx) = crossbeam_channel::unbounded();
    thread::Builder::new()
        .name("peachy-stdin".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                match cli::parse_command(&line) {
                    Some(cmd) => {
                        if tx.send(cmd).is_err() {
                            break;
                        }
                    }
                    None if line.trim().is_empty() => {}
                    None => eprintln!("{}", cli::HELP),
                }
            }
        })
        .context("spawn stdin reader")?;
    Ok(rx)
}

fn run(engine: &PlaybackEngine, mut commands: Receiver<UserCommand>, quit: Receiver<()>) {
    let events = engine.subscribe_to(&[EventKind::Analysis, EventKind::Error]);
    let ticker = crossbeam_channel::tick(REDRAW_INTERVAL);
    let mut last_frame: Option<AnalysisFrame> = None;

    loop {
        let mut stdin_closed = false;
        select! {
            recv(quit) -> _ => {
                tracing::info!("interrupted");
                return;
            }
            recv(commands) -> cmd => match cmd {
                Ok(UserCommand::Quit) => return,
                Ok(cmd) => apply(engine, cmd),
                Err(_) => stdin_closed = true,
            },
            recv(ticker) -> _ => {
                for event in events.drain() {
                    match event {
                        EngineEvent::AnalysisFrameReady { frame } => last_frame = Some(frame),
                        EngineEvent::Error { kind, message } => {
                            eprintln!();
                            tracing::warn!(?kind, %message, "playback error");
                        }
                        _ => {}
                    }
                }
                let status = engine.status();
                if status.state != TransportState::Playing {
                    last_frame = None;
                }
                draw(&render::progress_line(&status), last_frame.as_ref());
                if status.state == TransportState::Stopped
                    && status.track.is_none()
                    && engine.queue().is_empty()
                {
                    tracing::info!("queue finished");
                    return;
                }
            }
        }
        if stdin_closed {
            // Piped input ran out; keep playing until the queue does.
            commands = crossbeam_channel::never();
        }
    }
}

fn apply(engine: &PlaybackEngine, cmd: UserCommand) {
    let result = match &cmd {
        UserCommand::Toggle => engine.toggle(),
        UserCommand::Stop => engine.stop(),
        UserCommand::Next => engine.next(),
        UserCommand::Previous => engine.previous(),
        UserCommand::Seek(to) => engine.seek_to(*to),
        UserCommand::Volume(pct) => {
            engine.set_volume(*pct as f32 / 100.0);
            Ok(())
        }
        UserCommand::Quit => Ok(()),
    };
    match result {
        Ok(()) => {}
        Err(EngineError::EmptyQueue) => eprintln!("\nnothing queued"),
        Err(e) => {
            eprintln!();
            tracing::warn!(error = %e, command = ?cmd, "command failed");
        }
    }
}

fn draw(line: &str, frame: Option<&AnalysisFrame>) {
    let bars = frame
        .map(|f| render::bars(f, render::BAR_WIDTH))
        .unwrap_or_default();
    let mut out = std::io::stdout().lock();
    let _ = write!(out, "\r\x1b[2K{line}  {bars}");
    let _ = out.flush();
}
