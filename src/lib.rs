//! Host-side playback engine for a virtual microphone (spec §1/§2).
//!
//! Producer-supplied raw PCM frames are pushed into a [`queue::RawAudioQueue`],
//! drained by a [`stream::PlaybackStream`] writer thread, and replayed into
//! the audio server as a null sink ([`device::VirtualSink`]) whose monitor is
//! re-exposed as a remap source ([`device::VirtualSource`]) — the virtual
//! microphone. [`context::Context`] composes the whole chain behind a single
//! `uniffi`-exported façade, mirroring the teacher's top-level module layout
//! (shared definitions, then the exported object).

mod config;
mod context;
mod device;
mod error;
mod queue;
mod raw_audio;
mod refcount;
mod server;
mod stream;

uniffi::setup_scaffolding!("ffone_virtual_mic");

pub use config::EngineConfig;
pub use context::Context;
pub use error::EngineError;
pub use queue::{QueueReadResult, QueueReadWithPropsResult, RawAudioQueue};
pub use raw_audio::RawAudioFormat;

/// Installs `env_logger` as the process-wide log sink. Analogous to the
/// teacher's `init_logger` (which wires up `android_logger` on its Android
/// target); this crate targets the desktop PulseAudio client, so it wires up
/// `env_logger` instead. Safe to call more than once — later calls are a
/// no-op, since `env_logger::try_init` only ever installs the first logger.
#[uniffi::export]
pub fn init_logger() {
    let _ = env_logger::try_init();
}

#[cfg(test)]
mod tests {
    #[test]
    fn init_logger_is_idempotent() {
        super::init_logger();
        super::init_logger();
    }
}
