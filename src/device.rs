//! Virtual sink/source lifecycle (spec §3/§4.4).
//!
//! Grounded on
//! `examples/original_source/virtual_microphones/pulseaudio/src/virtual_device.c`
//! (module argument strings, `Created -> Loaded -> Unloaded` state machine,
//! source-owns-sink).
use std::time::{SystemTime, UNIX_EPOCH};

use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{EngineConfig, DEFAULT_SERVER_RATE};
use crate::error::EngineError;
use crate::refcount::Shared;
use crate::server::AudioServerCore;

/// Sentinel "no module loaded" index (`UINT32_MAX` in the C source).
pub const NONE_INDEX: u32 = u32::MAX;

const ROLE_SINK: &str = "ffone_pa_virtual_sink";
const ROLE_SOURCE: &str = "ffone_pa_virtual_source";

/// Process-lifetime unique device-name generator, seeded once at
/// [`crate::context::Context`] construction from `time() XOR pid`
/// (spec §6).
pub struct DeviceNamer {
    rng: StdRng,
}

impl DeviceNamer {
    pub fn new() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let pid = std::process::id() as u64;
        Self {
            rng: StdRng::seed_from_u64(now ^ pid),
        }
    }

    fn next_name(&mut self, role: &str) -> String {
        let id: u32 = self.rng.gen();
        format!("{}-{}-{}", id, role, std::process::id())
    }
}

impl Default for DeviceNamer {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DevicePhase {
    Created,
    Loaded,
    Unloaded,
}

struct SinkInner {
    core: AudioServerCore,
    name: String,
    description: String,
    phase: DevicePhase,
    idx: u32,
}

/// A null sink loaded via `module-null-sink`; other applications never see
/// it directly, only its monitor (exposed as [`VirtualSource`]).
#[derive(Clone)]
pub struct VirtualSink(Shared<SinkInner>);

impl VirtualSink {
    pub fn new(
        core: AudioServerCore,
        namer: &mut DeviceNamer,
        config: &EngineConfig,
    ) -> Result<Self, EngineError> {
        let name = namer.next_name(ROLE_SINK);
        let sink = Self(Shared::new(SinkInner {
            core,
            name,
            description: config.sink_description.clone(),
            phase: DevicePhase::Created,
            idx: NONE_INDEX,
        }));
        sink.load()?;
        Ok(sink)
    }

    pub fn name(&self) -> String {
        self.0.lock().name.clone()
    }

    pub fn monitor_source_name(&self) -> String {
        format!("{}.monitor", self.name())
    }

    pub fn index(&self) -> u32 {
        self.0.lock().idx
    }

    /// Explicit unload ahead of `Drop` (spec §4.4: "no-op unless `Loaded`").
    /// Idempotent — calling this twice, or after `Drop` has already run it,
    /// is a no-op returning `Ok`.
    pub(crate) fn unload(&self) -> Result<(), EngineError> {
        let (core, args) = {
            let inner = self.0.lock();
            if inner.phase != DevicePhase::Created {
                return Err(EngineError::BadState);
            }
            let args = format!(
                "sink_name={} sink_properties=device.description={} rate={} channels=1 channel_map=mono",
                inner.name, inner.description, DEFAULT_SERVER_RATE
            );
            (inner.core.clone(), args)
        };

        let handle = self.0.clone();
        let outcome = core.load_virtual_device("module-null-sink", &args, move |idx| {
            info!("virtual sink loaded at module index {idx}");
            let mut inner = handle.lock();
            inner.phase = DevicePhase::Loaded;
            inner.idx = idx;
        });
        Result::<(), EngineError>::from(outcome)
    }

    fn unload(&self) -> Result<(), EngineError> {
        let (core, idx, loaded) = {
            let inner = self.0.lock();
            (inner.core.clone(), inner.idx, inner.phase == DevicePhase::Loaded)
        };
        if !loaded {
            return Ok(());
        }

        let handle = self.0.clone();
        let outcome = core.unload_virtual_device(idx, move |success| {
            info!("virtual sink unloaded: {success}");
            if success {
                let mut inner = handle.lock();
                inner.phase = DevicePhase::Unloaded;
                inner.idx = NONE_INDEX;
            }
        });
        Result::<(), EngineError>::from(outcome)
    }
}

impl Drop for SinkInner {
    fn drop(&mut self) {
        if self.phase == DevicePhase::Loaded {
            let core = self.core.clone();
            let idx = self.idx;
            let name = self.name.clone();
            let _ = core.unload_virtual_device(idx, move |success| {
                info!("virtual sink '{name}' unloaded on drop: {success}");
            });
        }
    }
}

struct SourceInner {
    core: AudioServerCore,
    master: VirtualSink,
    name: String,
    description: String,
    phase: DevicePhase,
    idx: u32,
}

/// A `module-remap-source` republishing the master sink's monitor under a
/// new name, so other applications can select it as their microphone.
#[derive(Clone)]
pub struct VirtualSource(Shared<SourceInner>);

impl VirtualSource {
    pub fn new(
        core: AudioServerCore,
        master: VirtualSink,
        namer: &mut DeviceNamer,
        config: &EngineConfig,
    ) -> Result<Self, EngineError> {
        let name = namer.next_name(ROLE_SOURCE);
        let source = Self(Shared::new(SourceInner {
            core,
            master,
            name,
            description: config.source_description.clone(),
            phase: DevicePhase::Created,
            idx: NONE_INDEX,
        }));
        source.load()?;
        Ok(source)
    }

    pub fn name(&self) -> String {
        self.0.lock().name.clone()
    }

    fn load(&self) -> Result<(), EngineError> {
        let (core, args) = {
            let inner = self.0.lock();
            if inner.phase != DevicePhase::Created {
                return Err(EngineError::BadState);
            }
            let args = format!(
                "source_name={} source_properties=device.description={} master={} master_channel_map=mono rate={} channels=1 channel_map=mono",
                inner.name,
                inner.description,
                inner.master.monitor_source_name(),
                DEFAULT_SERVER_RATE
            );
            (inner.core.clone(), args)
        };

        let handle = self.0.clone();
        let outcome = core.load_virtual_device("module-remap-source", &args, move |idx| {
            info!("virtual source loaded at module index {idx}");
            let mut inner = handle.lock();
            inner.phase = DevicePhase::Loaded;
            inner.idx = idx;
        });
        Result::<(), EngineError>::from(outcome)
    }

    /// Explicit unload ahead of `Drop` (spec §4.4: "no-op unless `Loaded`").
    pub(crate) fn unload(&self) -> Result<(), EngineError> {
        let (core, idx, loaded) = {
            let inner = self.0.lock();
            (inner.core.clone(), inner.idx, inner.phase == DevicePhase::Loaded)
        };
        if !loaded {
            return Ok(());
        }

        let handle = self.0.clone();
        let outcome = core.unload_virtual_device(idx, move |success| {
            info!("virtual source unloaded: {success}");
            if success {
                let mut inner = handle.lock();
                inner.phase = DevicePhase::Unloaded;
                inner.idx = NONE_INDEX;
            }
        });
        Result::<(), EngineError>::from(outcome)
    }
}

impl Drop for SourceInner {
    fn drop(&mut self) {
        if self.phase == DevicePhase::Loaded {
            let core = self.core.clone();
            let idx = self.idx;
            let name = self.name.clone();
            let _ = core.unload_virtual_device(idx, move |success| {
                info!("virtual source '{name}' unloaded on drop: {success}");
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_namer_produces_deterministic_pattern() {
        let mut namer = DeviceNamer::new();
        let name = namer.next_name(ROLE_SINK);
        let pid = std::process::id();
        assert!(name.ends_with(&format!("-{ROLE_SINK}-{pid}")));
    }

    #[test]
    fn module_arg_determinism_matches_spec_example() {
        // spec §8 scenario 6: rand=42, pid=1234.
        let name = format!("{}-{}-{}", 42, ROLE_SINK, 1234);
        let descr = "FFone_Output";
        let args = format!(
            "sink_name={} sink_properties=device.description={} rate={} channels=1 channel_map=mono",
            name, descr, DEFAULT_SERVER_RATE
        );
        assert_eq!(
            args,
            "sink_name=42-ffone_pa_virtual_sink-1234 sink_properties=device.description=FFone_Output rate=48000 channels=1 channel_map=mono"
        );
    }
}
