//! Centralized configuration (mirrors the teacher's `AudioConfig`).

/// Default sample rate the stream starts at before any buffer has been
/// queued (spec §6).
pub const DEFAULT_SAMPLE_RATE: u32 = 8000;

/// Sample rate the virtual sink/source modules are loaded at (spec §4.4/§6).
pub const DEFAULT_SERVER_RATE: u32 = 48_000;

/// Target fill level of the playback stream's server-side buffer
/// (`tlength`, spec §4.5.1), low-latency mode.
pub const MAX_BYTES_BUFFER_LOW_LATENCY: u32 = 600;

/// Target fill level of the playback stream's server-side buffer
/// (`tlength`, spec §4.5.1), default mode.
pub const MAX_BYTES_BUFFER_DEFAULT: u32 = 6000;

/// Engine-wide tuning knobs, analogous to the teacher's `AudioConfig`
/// record.
#[derive(Debug, Clone, uniffi::Record)]
pub struct EngineConfig {
    /// Upper bound, in microseconds, on the amount of audio the
    /// [`crate::queue::RawAudioQueue`] is allowed to hold (spec §3).
    pub max_queue_duration_usec: u64,
    /// Selects `tlength` = 600 bytes (tight latency, more underrun risk)
    /// vs. 6000 bytes (spec §4.5.1).
    pub low_latency: bool,
    /// `device.description` property advertised for the null sink.
    pub sink_description: String,
    /// `device.description` property advertised for the remap source.
    pub source_description: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            // 2 seconds of headroom by default.
            max_queue_duration_usec: 2_000_000,
            low_latency: false,
            sink_description: "FFone_Output".to_string(),
            source_description: "FFone_Virtual_Microphone".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn tlength(&self) -> u32 {
        if self.low_latency {
            MAX_BYTES_BUFFER_LOW_LATENCY
        } else {
            MAX_BYTES_BUFFER_DEFAULT
        }
    }
}
