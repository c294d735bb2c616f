use audio_engine::types::{AnalysisFrame, EngineStatus, TransportState};

const BAR_GLYPHS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

/// Width of the bar strip in characters.
pub const BAR_WIDTH: usize = 32;

pub fn format_duration_ms(ms: u64) -> String {
    let total_secs = ms / 1000;
    let mins = total_secs / 60;
    let secs = total_secs % 60;
    format!("{mins}:{secs:02}")
}

fn state_label(state: TransportState) -> &'static str {
    match state {
        TransportState::Stopped => "stopped",
        TransportState::Playing => "playing",
        TransportState::Paused => "paused",
        TransportState::Seeking => "seeking",
        TransportState::TrackEnded => "ended",
    }
}

/// One-line summary: title, elapsed / total, state, volume, signal path.
pub fn progress_line(status: &EngineStatus) -> String {
    let state = state_label(status.state);
    let Some(track) = &status.track else {
        return format!("[{state}] queue: {}", status.queue_len);
    };
    let title = track.display_name();
    let elapsed_ms = status.elapsed_ms.unwrap_or(0);
    let time = match status.duration_ms {
        Some(total_ms) if total_ms > 0 => {
            let pct = (elapsed_ms as f64 / total_ms as f64 * 100.0).clamp(0.0, 100.0);
            format!(
                "{} / {} ({pct:.0}%)",
                format_duration_ms(elapsed_ms),
                format_duration_ms(total_ms)
            )
        }
        _ => format_duration_ms(elapsed_ms),
    };
    let mut line = format!(
        "{title}  {time} [{state}] vol {:.0}%",
        status.volume * 100.0
    );
    if let (Some(src), Some(out)) = (track.sample_rate, status.output_sample_rate) {
        if status.resampling == Some(true) {
            line.push_str(&format!(" | {src} -> {out} Hz"));
        } else {
            line.push_str(&format!(" | {out} Hz"));
        }
    }
    if status.underrun_events > 0 {
        line.push_str(&format!(" | underruns {}", status.underrun_events));
    }
    line
}

/// Squash an analysis frame into `width` bar glyphs.
pub fn bars(frame: &AnalysisFrame, width: usize) -> String {
    let values = match frame {
        AnalysisFrame::Waveform { points } => points,
        AnalysisFrame::Spectrum { bars, .. } => bars,
    };
    if values.is_empty() || width == 0 {
        return String::new();
    }
    (0..width)
        .map(|i| {
            let start = i * values.len() / width;
            let end = ((i + 1) * values.len() / width).max(start + 1).min(values.len());
            let level = values[start..end].iter().copied().fold(0.0f32, f32::max);
            glyph(level)
        })
        .collect()
}

fn glyph(level: f32) -> char {
    let level = if level.is_finite() { level.clamp(0.0, 1.0) } else { 0.0 };
    let idx = (level * (BAR_GLYPHS.len() - 1) as f32).round() as usize;
    BAR_GLYPHS[idx]
}
