//! Top-level composition root: `Core -> Sink -> Source -> Stream` (spec §4.6).
//!
//! Grounded on
//! `examples/original_source/virtual_microphones/pulseaudio/src/context.c`
//! (construction order, teardown order, the `update` pump), generalized to
//! the self-driving writer-thread design the rest of the crate uses instead
//! of that file's manual iterate loop.
use crate::config::EngineConfig;
use crate::device::{DeviceNamer, VirtualSink, VirtualSource};
use crate::error::EngineError;
use crate::queue::RawAudioQueue;
use crate::server::AudioServerCore;
use crate::stream::PlaybackStream;

/// Owns the whole dependency chain for one virtual microphone instance.
///
/// Field order doubles as teardown order: Rust drops struct fields
/// top-to-bottom, so `stream` (the leaf, bound to everything below it)
/// is torn down first, then `source`, then `sink`, and finally `core` —
/// the reverse of construction order, matching spec §4.6.
#[derive(uniffi::Object)]
pub struct Context {
    stream: PlaybackStream,
    source: VirtualSource,
    sink: VirtualSink,
    core: AudioServerCore,
    queue: RawAudioQueue,
    config: EngineConfig,
}

#[uniffi::export]
impl Context {
    /// Brings up the whole chain: connects to the audio server, loads the
    /// null sink, loads the remap source over its monitor, then opens the
    /// playback stream. Any failure partway through unwinds the
    /// already-constructed pieces via their own `Drop` impls.
    #[uniffi::constructor]
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let core = AudioServerCore::new(&config).map_err(|outcome| {
            Result::<(), EngineError>::from(outcome).unwrap_err()
        })?;

        let mut namer = DeviceNamer::new();
        let sink = VirtualSink::new(core.clone(), &mut namer, &config)?;
        let source = VirtualSource::new(core.clone(), sink.clone(), &mut namer, &config)?;
        let queue = RawAudioQueue::new(config.max_queue_duration_usec);
        let stream = PlaybackStream::new(core.clone(), sink.clone(), source.clone(), queue.clone(), &config)?;

        Ok(Self {
            stream,
            source,
            sink,
            core,
            queue,
            config,
        })
    }

    pub fn config(&self) -> EngineConfig {
        self.config.clone()
    }

    pub fn queue(&self) -> std::sync::Arc<RawAudioQueue> {
        std::sync::Arc::new(self.queue.clone())
    }

    pub fn play(&self) -> Result<(), EngineError> {
        self.stream.play()
    }

    pub fn drain(&self) -> Result<(), EngineError> {
        self.stream.drain()
    }

    pub fn current_time_usec(&self) -> u64 {
        self.stream.get_time()
    }

    /// Nudges the writer thread to pick up newly queued audio (or a
    /// pending format/rate change) without waiting for the server's next
    /// write-request callback (spec §4.6).
    pub fn update(&self) {
        self.stream.update()
    }

    /// Explicit shutdown ahead of `Drop`, useful when the caller wants to
    /// observe teardown completing synchronously rather than on scope
    /// exit. Tears down in the same reverse-of-construction order as field
    /// `Drop` would (stream, then source, then sink) so the source is never
    /// unloaded while the stream is still connected to it. Safe to call
    /// more than once; `Drop` (and a repeat call here) finds everything
    /// already idle and is a no-op.
    pub fn shutdown(&self) {
        self.stream.shutdown();
        let _ = self.source.unload();
        let _ = self.sink.unload();
    }
}
