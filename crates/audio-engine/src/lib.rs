//! Real-time playback core for the peachy player.
//!
//! ## Threads
//! - **Render**: the device callback drains the [`ring::RingBuffer`] and applies gain. It never
//!   allocates, locks or logs.
//! - **Decode-ahead**: one thread per active track reads the [`decode::Decoder`], normalizes
//!   the PCM to the device format and keeps the ring filled.
//! - **Control**: the engine thread applies transport commands, watches for end-of-stream and
//!   publishes position telemetry.
//! - **Analysis**: ticks on its own timer and turns a mono copy of recent output into
//!   waveform or spectrum frames.
//!
//! Everything observable leaves through the [`events::EventBus`].

pub mod analysis;
pub mod config;
pub mod decode;
pub mod engine;
pub mod error;
pub mod events;
pub mod normalize;
pub mod output;
pub mod queue;
pub mod ring;
mod session;
mod status;

#[cfg(test)]
mod testing;

pub use audio_engine_types as types;
pub use config::EngineConfig;
pub use engine::PlaybackEngine;
pub use error::{EngineError, EngineResult};
