//! stimuli
//!
//! a stimulus simulates the peripheral's half of a register handshake: a
//! background worker polls a predicate against a watched address and, when
//! it fires, applies an action to another address. firmware under test
//! writes a command register; the stimulus answers in a status register.

pub(crate) mod engine;

use std::mem::size_of;
use std::panic::Location;
use std::ptr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytemuck::Pod;

use crate::error::Error;

/// Lifecycle of a stimulus.
///
/// `Idle` until activated; `Active` while the worker polls it; `Running`
/// while its closures execute; `Done` once the action has fired. `Done` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Active,
    Running,
    Done,
}

const IDLE: u8 = 0;
const ACTIVE: u8 = 1;
const RUNNING: u8 = 2;
const DONE: u8 = 3;

impl Status {
    fn from_u8(raw: u8) -> Self {
        match raw {
            ACTIVE => Status::Active,
            RUNNING => Status::Running,
            DONE => Status::Done,
            _ => Status::Idle,
        }
    }
}

/// Type-erased shared state of one stimulus. The engine's active list and
/// every handle reference the same core.
pub(crate) struct Core {
    pub(crate) watch_span: (usize, usize),
    pub(crate) modify_span: (usize, usize),
    tick: Arc<dyn Fn() -> bool + Send + Sync>,
    pub(crate) location: &'static Location<'static>,
    status: AtomicU8,
}

impl Core {
    pub(crate) fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: u8) {
        self.status.store(status, Ordering::Release);
    }

    pub(crate) fn set_active(&self) {
        self.set_status(ACTIVE);
    }

    /// Deactivation returns to `Idle` but never forgets completion.
    pub(crate) fn set_inactive(&self) {
        let _ = self
            .status
            .compare_exchange(ACTIVE, IDLE, Ordering::AcqRel, Ordering::Relaxed);
        let _ = self
            .status
            .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Relaxed);
    }

    pub(crate) fn spans(&self) -> [(usize, usize); 2] {
        [self.watch_span, self.modify_span]
    }

    /// One engine tick: evaluate the predicate and, when it fires, run the
    /// action. Returns whether the stimulus completed.
    pub(crate) fn running(&self) -> bool {
        self.set_status(RUNNING);
        let done = (self.tick)();
        if done {
            self.set_status(DONE);
        }
        done
    }
}

/// An autonomous `(predicate, action)` pair evaluated by the background
/// worker.
///
/// The handle owns the registration: dropping it deactivates the stimulus.
/// Moving a handle preserves its state. Duplication is explicit:
/// [`Stimulus::duplicate`] yields an activated copy,
/// [`Stimulus::duplicate_inactive`] a dormant one.
pub struct Stimulus {
    core: Arc<Core>,
}

impl Stimulus {
    /// Builds and activates a stimulus on absolute addresses. The watched
    /// value is loaded volatile and handed to `predicate`; once it returns
    /// true, `action` maps the current value at `modify` to its
    /// replacement, written back volatile, and the stimulus completes.
    ///
    /// Fails when either address lies below the arena cap without backing
    /// pages.
    #[track_caller]
    pub fn new<W, M, P, A>(watch: usize, predicate: P, modify: usize, action: A) -> Result<Self, Error>
    where
        W: Pod,
        M: Pod,
        P: Fn(W) -> bool + Send + Sync + 'static,
        A: Fn(M) -> M + Send + Sync + 'static,
    {
        let stimulus = Self::inactive(watch, predicate, modify, action);
        stimulus.activate()?;
        Ok(stimulus)
    }

    /// Builds a dormant stimulus on absolute addresses; activate it later
    /// with [`Stimulus::activate`]. No page checks run until then.
    #[track_caller]
    pub fn inactive<W, M, P, A>(watch: usize, predicate: P, modify: usize, action: A) -> Self
    where
        W: Pod,
        M: Pod,
        P: Fn(W) -> bool + Send + Sync + 'static,
        A: Fn(M) -> M + Send + Sync + 'static,
    {
        let location = Location::caller();
        let tick = move || {
            // SAFETY: activation verified the spans are backed (or they lie
            // above the cap and refer to memory the test owns); Pod types
            // tolerate any bit pattern
            let value = unsafe { ptr::read_volatile(watch as *const W) };
            if predicate(value) {
                unsafe {
                    let current = ptr::read_volatile(modify as *const M);
                    ptr::write_volatile(modify as *mut M, action(current));
                }
                true
            } else {
                false
            }
        };
        Self {
            core: Arc::new(Core {
                watch_span: (watch, size_of::<W>()),
                modify_span: (modify, size_of::<M>()),
                tick: Arc::new(tick),
                location,
                status: AtomicU8::new(IDLE),
            }),
        }
    }

    /// Pointer form of [`Stimulus::new`], for watching memory the test owns.
    #[track_caller]
    pub fn at<W, M, P, A>(
        watch: *const W,
        predicate: P,
        modify: *mut M,
        action: A,
    ) -> Result<Self, Error>
    where
        W: Pod,
        M: Pod,
        P: Fn(W) -> bool + Send + Sync + 'static,
        A: Fn(M) -> M + Send + Sync + 'static,
    {
        Self::new(watch as usize, predicate, modify as usize, action)
    }

    /// Pointer form of [`Stimulus::inactive`].
    #[track_caller]
    pub fn inactive_at<W, M, P, A>(
        watch: *const W,
        predicate: P,
        modify: *mut M,
        action: A,
    ) -> Self
    where
        W: Pod,
        M: Pod,
        P: Fn(W) -> bool + Send + Sync + 'static,
        A: Fn(M) -> M + Send + Sync + 'static,
    {
        Self::inactive(watch as usize, predicate, modify as usize, action)
    }

    /// Registers the stimulus with the engine. Re-activating a registered
    /// stimulus is a no-op. Fails when a span below the arena cap is not
    /// backed by an allocation.
    pub fn activate(&self) -> Result<(), Error> {
        engine::activate(&self.core)
    }

    /// Unregisters the stimulus. Returns whether it was registered.
    pub fn deactivate(&self) -> bool {
        engine::deactivate(&self.core)
    }

    pub fn status(&self) -> Status {
        self.core.status()
    }

    pub fn location(&self) -> &'static Location<'static> {
        self.core.location
    }

    /// Activated copy sharing the closures but nothing else; the original's
    /// state is untouched.
    pub fn duplicate(&self) -> Result<Self, Error> {
        let copy = self.duplicate_inactive();
        copy.activate()?;
        Ok(copy)
    }

    /// Dormant copy sharing the closures but nothing else.
    pub fn duplicate_inactive(&self) -> Self {
        Self {
            core: Arc::new(Core {
                watch_span: self.core.watch_span,
                modify_span: self.core.modify_span,
                tick: self.core.tick.clone(),
                location: self.core.location,
                status: AtomicU8::new(IDLE),
            }),
        }
    }

    /// Count of stimuli currently registered with the engine.
    pub fn count() -> usize {
        engine::count()
    }

    /// Requests engine shutdown, joins the worker, and logs any stimuli
    /// that never completed. Terminal: the engine does not restart.
    pub fn terminate() {
        engine::terminate()
    }
}

impl Drop for Stimulus {
    fn drop(&mut self) {
        engine::deactivate(&self.core);
    }
}
