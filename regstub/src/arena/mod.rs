//! the arena
//!
//! a process-wide registry of faked page mappings. stubs ask it to back
//! fixed virtual-address page ranges with real memory; it tracks which stub
//! owns which pages, rejects conflicting requests, publishes unmap events
//! before memory disappears, and rewrites ownership when a stub is merged
//! into another.
//!
//! only addresses below the configurable cap ([`size`]) are ever backed;
//! anything above it is assumed to be real host memory (locals, statics)
//! and is left alone.

use std::collections::BTreeMap;
use std::io;
use std::mem::size_of;
use std::panic::Location;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use regstub_region::{PageRange, PAGE_SIZE};

use crate::error::Error;
use crate::logcat;

/// Upper bound of the address range the arena will ever back with pages.
pub const MAX_SIZE: usize = 0x1_0000_0000;

static SIZE: AtomicUsize = AtomicUsize::new(MAX_SIZE);

/// What a configuration check does when it fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnFail {
    /// Return `Ok(false)`.
    Returns,
    /// Surface the failure as `Err`.
    Errors,
    /// Log at error level and return `Ok(false)`.
    Logs,
}

fn failed(on_fail: OnFail, error: Error) -> Result<bool, Error> {
    match on_fail {
        OnFail::Errors => Err(error),
        OnFail::Logs => {
            log::error!(target: logcat::ARENA, "{error}");
            Ok(false)
        }
        OnFail::Returns => Ok(false),
    }
}

/// Current cap on backed addresses.
pub fn size() -> usize {
    SIZE.load(Ordering::Relaxed)
}

/// Lowers or raises the cap after checking it against the executable's load
/// address.
pub fn set_size(requested: usize, on_fail: OnFail) -> Result<bool, Error> {
    if check_boundary(requested, on_fail)? {
        SIZE.store(requested, Ordering::Relaxed);
        return Ok(true);
    }
    Ok(false)
}

#[cfg(target_os = "linux")]
fn executable_start() -> usize {
    extern "C" {
        // provided by the default GNU linker script; marks the lowest
        // address occupied by the executable image
        static __executable_start: libc::c_char;
    }
    unsafe { &__executable_start as *const _ as usize }
}

#[cfg(not(target_os = "linux"))]
fn executable_start() -> usize {
    usize::MAX
}

/// Verifies that the executable is loaded above the requested arena range,
/// so faked low addresses cannot collide with program code.
pub fn check_boundary(requested: usize, on_fail: OnFail) -> Result<bool, Error> {
    let available = executable_start();
    if available < requested {
        return failed(
            on_fail,
            Error::ArenaIsNotFullyAvailable {
                requested,
                available,
            },
        );
    }
    Ok(true)
}

/// Verifies that the host page size matches the compiled-in [`PAGE_SIZE`].
pub fn check_pagesize(actual: usize, on_fail: OnFail) -> Result<bool, Error> {
    if actual != PAGE_SIZE {
        return failed(
            on_fail,
            Error::PageSizeMismatch {
                actual,
                expected: PAGE_SIZE,
            },
        );
    }
    Ok(true)
}

/// Page size reported by the host, for feeding [`check_pagesize`].
pub fn host_page_size() -> usize {
    // sysconf cannot fail for _SC_PAGESIZE on any supported platform
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Sets the value freshly mapped pages are filled with, as repeated 64-bit
/// copies.
pub fn set_page_fill(value: u64) {
    registry().fill = Some(value);
}

/// Clears the page fill; fresh mappings keep their OS-provided contents.
pub fn set_page_nofill() {
    registry().fill = None;
}

/// Total bytes currently backed by the arena.
pub fn allocation_size() -> usize {
    registry().allocation_size()
}

/// Listener notified synchronously before a page range is unmapped, while
/// the memory is still readable as an identifier.
pub(crate) trait UnmapListener: Send + Sync {
    fn unmapping(&self, span: (usize, usize), location: &'static Location<'static>);
}

struct Allocation {
    range: PageRange,
    owner: u64,
    location: &'static Location<'static>,
}

pub(crate) struct Mmio {
    allocations: BTreeMap<usize, Allocation>,
    listeners: Vec<Arc<dyn UnmapListener>>,
    fill: Option<u64>,
}

static MMIO: Mutex<Mmio> = Mutex::new(Mmio::new());

/// The process-global registry, behind its lock.
pub(crate) fn registry() -> MutexGuard<'static, Mmio> {
    MMIO.lock()
}

fn map_range(range: PageRange) -> Result<(), Error> {
    const PROT: libc::c_int = libc::PROT_READ | libc::PROT_WRITE;
    const FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED;
    let ptr = unsafe {
        libc::mmap(
            range.base_ptr() as *mut libc::c_void,
            range.size_bytes(),
            PROT,
            FLAGS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        let source = io::Error::last_os_error();
        log::error!(
            target: logcat::ARENA,
            "mmap({:#x}, {}) failed: {source}",
            range.base_addr(),
            range.size_bytes(),
        );
        return Err(Error::MapFailed {
            address: range.base_addr(),
            size: range.size_bytes(),
            source,
        });
    }
    Ok(())
}

fn unmap_range(range: PageRange) {
    unsafe {
        libc::munmap(range.base_ptr() as *mut libc::c_void, range.size_bytes());
    }
}

impl Mmio {
    const fn new() -> Self {
        Self {
            allocations: BTreeMap::new(),
            listeners: Vec::new(),
            fill: None,
        }
    }

    fn validate(
        &self,
        requested: PageRange,
        owner: u64,
        location: &'static Location<'static>,
    ) -> Result<bool, Error> {
        if let Some(previous) = self.allocations.get(&requested.begin()) {
            if previous.owner == owner && previous.range == requested {
                return Ok(true); // exact range already mapped by this owner
            }
            return Err(Error::ConflictingAllocation {
                requested,
                owner: location,
                previous: previous.range,
                previous_owner: previous.location,
            });
        }
        if let Some(found) = self
            .allocations
            .values()
            .find(|a| a.owner != owner && requested.overlapping(&a.range))
        {
            return Err(Error::ConflictingAllocation {
                requested,
                owner: location,
                previous: found.range,
                previous_owner: found.location,
            });
        }
        Ok(false)
    }

    /// Backs `requested` with anonymous pages mapped at its exact address
    /// and records the owning stub.
    pub(crate) fn allocate(
        &mut self,
        requested: PageRange,
        owner: u64,
        location: &'static Location<'static>,
    ) -> Result<(), Error> {
        if self.validate(requested, owner, location)? {
            return Ok(());
        }
        map_range(requested)?;
        self.allocations.insert(
            requested.begin(),
            Allocation {
                range: requested,
                owner,
                location,
            },
        );
        if let Some(value) = self.fill {
            let mut at = requested.base_ptr() as *mut u64;
            // SAFETY: the range was just mapped read/write and its length is
            // a whole number of pages, hence a multiple of eight
            unsafe {
                for _ in 0..requested.size_bytes() / size_of::<u64>() {
                    at.write(value);
                    at = at.add(1);
                }
            }
        }
        Ok(())
    }

    fn notify(&self, range: PageRange, location: &'static Location<'static>) {
        let span = (range.base_addr(), range.size_bytes());
        for listener in &self.listeners {
            listener.unmapping(span, location);
        }
    }

    /// Releases every allocation owned by `owner`. Listeners observe the
    /// unmap before the pages disappear, so dependent state can be culled
    /// while the addresses are still meaningful.
    pub(crate) fn deallocate(&mut self, owner: u64) {
        let released: Vec<usize> = self
            .allocations
            .iter()
            .filter(|(_, a)| a.owner == owner)
            .map(|(&page, _)| page)
            .collect();
        for page in released {
            let (range, location) = {
                let a = &self.allocations[&page];
                (a.range, a.location)
            };
            self.notify(range, location);
            unmap_range(range);
            self.allocations.remove(&page);
        }
    }

    /// Rewrites every allocation owned by `loser` to belong to `claimer`.
    /// Used when one stub absorbs another.
    pub(crate) fn claim(&mut self, loser: u64, claimer: u64) {
        for allocation in self.allocations.values_mut() {
            if allocation.owner == loser {
                allocation.owner = claimer;
            }
        }
    }

    /// True iff some single allocation fully contains `requested`.
    pub(crate) fn contains(&self, requested: PageRange) -> bool {
        if let Some(found) = self.allocations.get(&requested.begin()) {
            return found.range.contains(&requested);
        }
        self.allocations
            .values()
            .find(|a| requested.overlapping(&a.range))
            .map(|a| a.range.contains(&requested))
            .unwrap_or(false)
    }

    /// True iff the byte span is fully backed.
    pub(crate) fn contains_span(&self, addr: usize, len: usize) -> bool {
        self.contains(PageRange::from_span(addr, addr + len))
    }

    pub(crate) fn allocation_size(&self) -> usize {
        self.allocations
            .values()
            .map(|a| a.range.size())
            .sum::<usize>()
            * PAGE_SIZE
    }

    pub(crate) fn subscribe(&mut self, listener: Arc<dyn UnmapListener>) {
        self.listeners.push(listener);
    }

    pub(crate) fn unsubscribe(&mut self, listener: &Arc<dyn UnmapListener>) {
        self.listeners.retain(|l| !Arc::ptr_eq(l, listener));
    }
}
