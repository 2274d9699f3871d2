//! the stimulus engine
//!
//! one background worker cooperatively schedules every active stimulus:
//! a round-robin cursor walks the list, each tick evaluates one predicate
//! under the engine lock. the engine listens for arena unmap events and
//! culls stimuli whose memory is about to disappear.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe, Location};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::arena::{self, UnmapListener};
use crate::error::Error;
use crate::logcat;
use crate::stimulus::Core;

struct State {
    stimuli: Vec<Arc<Core>>,
    cursor: usize,
    ready: bool,
    terminate: bool,
}

impl State {
    /// Keeps the cursor on the same logical entry when one before it is
    /// removed.
    fn adjust_cursor(&mut self, removed: usize) {
        if !self.stimuli.is_empty() && removed < self.cursor % self.stimuli.len() {
            self.cursor -= 1;
        }
    }

    fn remove(&mut self, core: &Arc<Core>) {
        if let Some(index) = self.stimuli.iter().position(|s| Arc::ptr_eq(s, core)) {
            self.adjust_cursor(index);
            self.stimuli.remove(index);
        }
        self.ready = !self.stimuli.is_empty();
    }
}

struct Engine {
    state: Mutex<State>,
    worker: Mutex<Option<JoinHandle<()>>>,
    listener: Arc<dyn UnmapListener>,
}

static ENGINE: OnceLock<Engine> = OnceLock::new();

/// Culls stimuli whose memory a stub deallocation is about to unmap.
struct Evictor;

impl UnmapListener for Evictor {
    fn unmapping(&self, span: (usize, usize), location: &'static Location<'static>) {
        if let Some(engine) = ENGINE.get() {
            engine.evict(span, location);
        }
    }
}

/// Boots the engine on first use: spawns the worker and subscribes to the
/// arena's unmap events.
fn instance() -> &'static Engine {
    ENGINE.get_or_init(|| {
        let listener: Arc<dyn UnmapListener> = Arc::new(Evictor);
        arena::registry().subscribe(listener.clone());
        let worker = thread::Builder::new()
            .name("regstub-stimulus".into())
            .spawn(worker_loop)
            .expect("spawning the stimulus worker");
        Engine {
            state: Mutex::new(State {
                stimuli: Vec::new(),
                cursor: 0,
                ready: false,
                terminate: false,
            }),
            worker: Mutex::new(Some(worker)),
            listener,
        }
    })
}

/// True iff the endpoints of `span` touch the byte range; inclusive, so a
/// span bordering the range still counts.
fn touches(range: (usize, usize), span: (usize, usize)) -> bool {
    let (range_begin, range_end) = (range.0, range.0 + range.1);
    let (span_begin, span_end) = (span.0, span.0 + span.1);
    (range_begin <= span_begin && span_begin <= range_end)
        || (range_begin <= span_end && span_end <= range_end)
}

fn check_spans(core: &Core) -> Result<(), Error> {
    let cap = arena::size();
    let mmio = arena::registry();
    for (addr, len) in core.spans() {
        if addr < cap && !mmio.contains_span(addr, len) {
            return Err(Error::PageIsNotAllocated {
                location: core.location,
            });
        }
    }
    Ok(())
}

pub(crate) fn activate(core: &Arc<Core>) -> Result<(), Error> {
    check_spans(core)?;
    let engine = instance();
    let mut state = engine.state.lock();
    if state.stimuli.iter().any(|s| Arc::ptr_eq(s, core)) {
        return Ok(());
    }
    state.stimuli.push(core.clone());
    core.set_active();
    state.ready = true;
    Ok(())
}

pub(crate) fn deactivate(core: &Arc<Core>) -> bool {
    // a never-booted engine has nothing registered; do not boot it here
    let Some(engine) = ENGINE.get() else {
        return false;
    };
    let mut state = engine.state.lock();
    let Some(index) = state.stimuli.iter().position(|s| Arc::ptr_eq(s, core)) else {
        return false;
    };
    state.adjust_cursor(index);
    state.stimuli.remove(index);
    core.set_inactive();
    state.ready = !state.stimuli.is_empty();
    true
}

pub(crate) fn count() -> usize {
    match ENGINE.get() {
        Some(engine) => engine.state.lock().stimuli.len(),
        None => 0,
    }
}

pub(crate) fn terminate() {
    let Some(engine) = ENGINE.get() else {
        return;
    };
    engine.state.lock().terminate = true;
    if let Some(worker) = engine.worker.lock().take() {
        let _ = worker.join();
    }
    // a dead engine must not hear further unmap events
    arena::registry().unsubscribe(&engine.listener);
    engine.log_stalls();
}

impl Engine {
    fn evict(&self, span: (usize, usize), location: &'static Location<'static>) {
        let mut state = self.state.lock();
        if state.stimuli.is_empty() {
            return;
        }
        let len = state.stimuli.len();
        let stimuli = std::mem::take(&mut state.stimuli);
        let mut kept = Vec::with_capacity(len);
        for (index, core) in stimuli.into_iter().enumerate() {
            if core.spans().iter().any(|s| touches(span, *s)) {
                if index < state.cursor % len {
                    state.cursor -= 1;
                }
                log::error!(
                    target: logcat::STIMULUS,
                    "removing stimulus declared at {} because it uses a page of the \
                     stub declared at {location} being deallocated",
                    core.location,
                );
            } else {
                kept.push(core);
            }
        }
        state.ready = !kept.is_empty();
        state.stimuli = kept;
    }

    fn log_stalls(&self) {
        let state = self.state.lock();
        if state.stimuli.is_empty() {
            return;
        }
        log::error!(
            target: logcat::STIMULUS,
            "{} stalled stimuli have not finished:",
            state.stimuli.len()
        );
        for core in &state.stimuli {
            log::error!(
                target: logcat::STIMULUS,
                "stimulus declared at {}",
                core.location
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("opaque panic payload")
}

fn worker_loop() {
    // the engine static completes initialization right after the spawn
    let engine = loop {
        match ENGINE.get() {
            Some(engine) => break engine,
            None => thread::yield_now(),
        }
    };
    loop {
        let mut state = engine.state.lock();
        if state.terminate {
            break;
        }
        if !state.ready || state.stimuli.is_empty() {
            drop(state);
            thread::yield_now();
            continue;
        }
        let index = state.cursor % state.stimuli.len();
        let core = state.stimuli[index].clone();
        // ticks run under the lock, like every other list mutation
        match catch_unwind(AssertUnwindSafe(|| core.running())) {
            Ok(true) => state.remove(&core),
            Ok(false) => state.cursor += 1,
            Err(payload) => {
                log::error!(
                    target: logcat::STIMULUS,
                    "panic in stimulus declared at {}: {}",
                    core.location,
                    panic_message(payload.as_ref())
                );
                state.remove(&core);
            }
        }
        drop(state);
        thread::yield_now();
    }
}
