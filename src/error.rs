//! Error kinds shared across the engine (spec §7).

/// Top-level, FFI-visible error. Mirrors the teacher's `AudioError`: a flat,
/// `thiserror`-derived enum exported to `uniffi` callers as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error, uniffi::Error)]
#[uniffi(flat_error)]
pub enum EngineError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("component is in the wrong state for this operation")]
    BadState,
    #[error("allocation or resource creation failed")]
    BadAlloc,
    #[error("audio server operation did not complete successfully")]
    Custom,
}

/// Result of an async audio-server operation (spec §4.3/§7).
///
/// Distinct from [`EngineError`]: this is the internal vocabulary used by
/// [`crate::server::AudioServerCore::execute_operation`] and friends, which
/// never abort the core on a per-operation failure — only propagate it to
/// the caller as data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationOutcome {
    Success,
    Custom,
    InvalidArgument,
    BadState,
    BadAlloc,
}

impl OperationOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, OperationOutcome::Success)
    }
}

impl From<OperationOutcome> for Result<(), EngineError> {
    fn from(outcome: OperationOutcome) -> Self {
        match outcome {
            OperationOutcome::Success => Ok(()),
            OperationOutcome::Custom => Err(EngineError::Custom),
            OperationOutcome::InvalidArgument => Err(EngineError::InvalidArgument),
            OperationOutcome::BadState => Err(EngineError::BadState),
            OperationOutcome::BadAlloc => Err(EngineError::BadAlloc),
        }
    }
}
