//! verify construction, preconditions, and the expectation hook

use std::panic::Location;
use std::ptr::write_volatile;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use regstub::verify::{default_expect, ExpectGuard};
use regstub::{Comparator, Control, Element, Error, Operation, Region, Stub, Verify};

// the expectation hook and the arena are process-global; tests touching
// either serialize here
static GLOBAL_LOCK: Mutex<()> = Mutex::new(());

fn lock() -> std::sync::MutexGuard<'static, ()> {
    GLOBAL_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

const FILL: u32 = 0xa5a5a5a5;

#[test]
fn construction_from_elements() {
    let sut = Verify::new([
        Element::new(Region::new(0x1000, 8), Comparator::all(FILL)),
        Element::new(Region::new(0x1010, 16), Comparator::all(FILL)),
    ])
    .unwrap();
    assert_eq!(sut.element_count(), 2);
}

#[test]
fn construction_rejects_duplicate_address() {
    let result = Verify::new([
        Element::value(0x1004, FILL),
        Element::value(0x1004, FILL),
    ]);
    assert!(matches!(
        result,
        Err(Error::DuplicateAddress {
            address: 0x1004,
            ..
        })
    ));
}

#[test]
fn construction_permits_overlap() {
    let sut = Verify::new([
        Element::value(0x1010, 0x5a5a5a5a5a5a5a5au64),
        Element::value(0x1012, 0x5a5a5a5a5a5a5a5au64),
    ]);
    assert!(sut.is_ok());
}

#[test]
fn union_combines_element_sets() {
    let lhs = Verify::new([Element::value(0x1000, FILL)]).unwrap();
    let rhs = Verify::new([Element::value(0x1008, FILL)]).unwrap();
    let sut = lhs.union(&rhs).unwrap();
    assert_eq!(sut.element_count(), 2);
    assert_eq!(sut.location().line(), lhs.location().line());
}

#[test]
fn merge_absorbs_element_set() {
    let mut sut = Verify::new([Element::value(0x1000, FILL)]).unwrap();
    let other = Verify::new([Element::value(0x1008, FILL)]).unwrap();
    sut.merge(other).unwrap();
    assert_eq!(sut.element_count(), 2);
}

#[test]
fn local_memory_comparator() {
    let variable = 0u32;
    let sut = Verify::new([Element::check(&variable, 0u32)]).unwrap();
    assert!(sut.apply().unwrap());
}

#[test]
fn unallocated_page_fails_the_precondition() {
    let _guard = lock();
    let sut = Verify::new([Element::value(0x40000, FILL)]).unwrap();
    assert!(matches!(
        sut.apply(),
        Err(Error::PageIsNotAllocated { .. })
    ));
}

#[test]
fn round_trip_single_value() {
    let _guard = lock();
    let setup = Stub::new([Element::value(0x44000, 0x1e2d3c4bu32)]).unwrap();
    setup.apply().unwrap();
    let sut = Verify::new([Element::value(0x44000, 0x1e2d3c4bu32)]).unwrap();
    assert!(sut.apply().unwrap());
    let miss = Verify::new([Element::value(0x44000, 0u32)]).unwrap();
    assert!(!miss.apply().unwrap());
}

#[test]
fn round_trip_filled_array() {
    let _guard = lock();
    let setup = Stub::new([Element::array(0x48000, 4, FILL)]).unwrap();
    setup.apply().unwrap();
    let sut = Verify::new([Element::array(0x48000, 4, FILL)]).unwrap();
    assert!(sut.apply().unwrap());
    // altering any single aligned slice must be caught
    unsafe { write_volatile(0x48008 as *mut u32, !FILL) };
    assert!(!sut.apply().unwrap());
}

static STOP_CALLS: AtomicUsize = AtomicUsize::new(0);

fn stop_after_first(_success: bool, _location: &'static Location<'static>) -> Control {
    STOP_CALLS.fetch_add(1, Ordering::Relaxed);
    Control::Stop
}

#[test]
fn stop_verdict_ends_the_pass_after_one_element() {
    let _guard = lock();
    let _hook = ExpectGuard::new(stop_after_first);
    STOP_CALLS.store(0, Ordering::Relaxed);
    let first = 0u32;
    let second = 0u32;
    let sut = Verify::new([
        Element::check(&first, FILL),
        Element::check(&second, FILL),
    ])
    .unwrap();
    assert!(!sut.apply().unwrap());
    assert_eq!(STOP_CALLS.load(Ordering::Relaxed), 1);
}

static RUN_CALLS: AtomicUsize = AtomicUsize::new(0);

fn count_and_run(success: bool, location: &'static Location<'static>) -> Control {
    RUN_CALLS.fetch_add(1, Ordering::Relaxed);
    default_expect(success, location)
}

#[test]
fn run_verdict_visits_every_element() {
    let _guard = lock();
    let _hook = ExpectGuard::new(count_and_run);
    RUN_CALLS.store(0, Ordering::Relaxed);
    let first = FILL;
    let second = 0u32;
    let sut = Verify::new([
        Element::check(&first, FILL),
        Element::check(&second, FILL),
    ])
    .unwrap();
    assert!(!sut.apply().unwrap());
    assert_eq!(RUN_CALLS.load(Ordering::Relaxed), 2);
}
