//! Threaded mainloop + client context wrapper (spec §4.3).
//!
//! Grounded on `examples/original_source/virtual_microphones/pulseaudio/src/core.c`
//! (`ffone_pa_core_new`/`execute_operation`/`load_virtual_device`), mapped
//! onto `libpulse-binding`'s threaded mainloop module — the real Rust
//! binding to the same `pa_threaded_mainloop`/`pa_context`/`pa_operation`
//! the C source drives directly.
use std::cell::UnsafeCell;

use libpulse_binding as pulse;
use pulse::context::{Context, FlagSet as ContextFlagSet, State as ContextState};
use pulse::mainloop::threaded::Mainloop;
use pulse::operation::{Operation, State as OperationState};
use pulse::proplist::{properties, Proplist};

use crate::config::EngineConfig;
use crate::error::OperationOutcome;

const CLIENT_APP_NAME: &str = "ffone_pa_virtual_microphone";

/// `UnsafeCell`-wrapped `Mainloop`/`Context`: every access is required
/// (by convention, same as the C source) to happen with the mainloop's
/// own lock held, which is the synchronization the spec's lock order
/// (spec §5, item 2) names as "the mainloop lock". Neither type is `Sync`
/// by default since they wrap non-atomic C handles; we assert the
/// stronger guarantee manually, exactly as the original `pa_threaded_mainloop_lock`-guarded
/// raw pointer did in C.
struct CoreState {
    mainloop: UnsafeCell<Mainloop>,
    context: UnsafeCell<Context>,
}

unsafe impl Send for CoreState {}
unsafe impl Sync for CoreState {}

/// Owns the background mainloop thread and the client connection;
/// executes async operations; provides lock/unlock/signal/wait (spec §4.3).
#[derive(Clone)]
pub struct AudioServerCore {
    core: std::sync::Arc<CoreState>,
}

impl AudioServerCore {
    /// Starts the mainloop thread, creates a client context, and connects
    /// in `NO_AUTOSPAWN` mode, blocking until the context reaches `Ready`
    /// or fails.
    pub fn new(config: &EngineConfig) -> Result<Self, OperationOutcome> {
        let _ = config;
        let mut mainloop = Mainloop::new().ok_or(OperationOutcome::BadAlloc)?;

        let mut proplist = Proplist::new().ok_or(OperationOutcome::BadAlloc)?;
        let _ = proplist.set_str(properties::APPLICATION_NAME, CLIENT_APP_NAME);

        let mut context = Context::new_with_proplist(&mainloop, CLIENT_APP_NAME, &proplist)
            .ok_or(OperationOutcome::BadAlloc)?;

        context.connect(None, ContextFlagSet::NOAUTOSPAWN, None).map_err(|_| OperationOutcome::Custom)?;

        mainloop.start().map_err(|_| OperationOutcome::Custom)?;

        mainloop.lock();
        let ready = wait_for_context_ready(&mut mainloop, &mut context);
        mainloop.unlock();

        if !ready {
            mainloop.stop();
            return Err(OperationOutcome::Custom);
        }

        Ok(Self {
            core: std::sync::Arc::new(CoreState {
                mainloop: UnsafeCell::new(mainloop),
                context: UnsafeCell::new(context),
            }),
        })
    }

    /// Caller must hold `loop_lock` for the duration the returned
    /// reference is used.
    #[allow(clippy::mut_from_ref)]
    fn mainloop_mut(&self) -> &mut Mainloop {
        unsafe { &mut *self.core.mainloop.get() }
    }

    #[allow(clippy::mut_from_ref)]
    pub(crate) fn context_mut(&self) -> &mut Context {
        unsafe { &mut *self.core.context.get() }
    }

    pub fn loop_lock(&self) {
        self.mainloop_mut().lock();
    }

    pub fn loop_unlock(&self) {
        self.mainloop_mut().unlock();
    }

    pub fn loop_signal(&self) {
        self.mainloop_mut().signal(false);
    }

    pub fn loop_wait(&self) {
        self.mainloop_mut().wait();
    }

    /// Waits, with the loop lock held, until `op` leaves the `Running`
    /// state, then releases it. Returns `Success` iff the terminal state
    /// was `Done` (spec §4.3).
    pub fn execute_operation<T: ?Sized>(&self, op: Operation<T>) -> OperationOutcome {
        loop {
            match op.get_state() {
                OperationState::Running => self.loop_wait(),
                OperationState::Done => return OperationOutcome::Success,
                OperationState::Cancelled => return OperationOutcome::Custom,
            }
        }
    }

    /// `load_module` wrapped with `execute_operation`; `BadAlloc` if the
    /// operation could not even be created.
    pub fn load_virtual_device<F>(&self, module: &str, args: &str, on_index: F) -> OperationOutcome
    where
        F: FnMut(u32) + 'static,
    {
        let op = self
            .context_mut()
            .introspect()
            .load_module(module, args, on_index);
        self.execute_operation(op)
    }

    /// `unload_module` wrapped with `execute_operation`; no-op success
    /// when `idx` is `NONE` (spec §4.3).
    pub fn unload_virtual_device<F>(&self, idx: u32, on_success: F) -> OperationOutcome
    where
        F: FnMut(bool) + 'static,
    {
        if idx == crate::device::NONE_INDEX {
            return OperationOutcome::Success;
        }
        let op = self.context_mut().introspect().unload_module(idx, on_success);
        self.execute_operation(op)
    }
}

impl Drop for CoreState {
    fn drop(&mut self) {
        let mainloop = self.mainloop.get_mut();
        mainloop.lock();
        self.context.get_mut().disconnect();
        mainloop.unlock();
        mainloop.stop();
    }
}

fn wait_for_context_ready(mainloop: &mut Mainloop, context: &mut Context) -> bool {
    loop {
        match context.get_state() {
            ContextState::Ready => return true,
            ContextState::Failed | ContextState::Terminated => return false,
            _ => mainloop.wait(),
        }
    }
}
