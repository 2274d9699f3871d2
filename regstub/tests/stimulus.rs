//! stimulus lifecycle and engine behavior
//!
//! the engine worker is asynchronous; tests drive a register write and wait
//! for the status transitions with a bounded spin

use std::ptr::{read_volatile, write_volatile};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use regstub::{Element, Error, Status, Stimulus, Stub};

// the engine's active list is process-global; every test serializes here
static ENGINE_LOCK: Mutex<()> = Mutex::new(());

fn lock() -> std::sync::MutexGuard<'static, ()> {
    let _ = env_logger::builder().is_test(true).try_init();
    ENGINE_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

const TIMEOUT: Duration = Duration::from_millis(1000);

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        thread::yield_now();
    }
}

fn registers(base: usize) -> Stub {
    Stub::new([
        Element::value(base, 0u32),
        Element::value(base + 4, 0u32),
    ])
    .unwrap()
}

fn handshake(sut: &Stimulus, command: usize, status: usize) {
    wait_until("activation", || sut.status() != Status::Idle);
    unsafe { write_volatile(command as *mut u32, 1) };
    wait_until("completion", || sut.status() == Status::Done);
    assert_eq!(unsafe { read_volatile(status as *const u32) } & 2, 2);
}

#[test]
fn active_constructor_runs_the_handshake() {
    let _guard = lock();
    let setup = registers(0x60000);
    setup.apply().unwrap();
    let sut = Stimulus::new(
        0x60000,
        |command: u32| command & 1 != 0,
        0x60004,
        |status: u32| status | 2,
    )
    .unwrap();
    assert_eq!(Stimulus::count(), 1);
    handshake(&sut, 0x60000, 0x60004);
    assert_eq!(Stimulus::count(), 0);
}

#[test]
fn inactive_constructor_waits_for_activation() {
    let _guard = lock();
    let setup = registers(0x62000);
    setup.apply().unwrap();
    let sut = Stimulus::inactive(
        0x62000,
        |command: u32| command & 1 != 0,
        0x62004,
        |status: u32| status | 2,
    );
    assert_eq!(Stimulus::count(), 0);
    assert_eq!(sut.status(), Status::Idle);
    sut.activate().unwrap();
    assert_eq!(Stimulus::count(), 1);
    handshake(&sut, 0x62000, 0x62004);
    assert_eq!(Stimulus::count(), 0);
}

#[test]
fn pointer_form_watches_host_memory() {
    let _guard = lock();
    let mut command = 0u32;
    let mut response = 0u32;
    let command_ptr = &mut command as *mut u32;
    let response_ptr = &mut response as *mut u32;
    let sut = Stimulus::at(
        command_ptr as *const u32,
        |value: u32| value != 0,
        response_ptr,
        |value: u32| value | 2,
    )
    .unwrap();
    wait_until("activation", || sut.status() != Status::Idle);
    unsafe { write_volatile(command_ptr, 1) };
    wait_until("completion", || sut.status() == Status::Done);
    assert_eq!(unsafe { read_volatile(response_ptr) }, 2);
    assert_eq!(Stimulus::count(), 0);
}

#[test]
fn activation_fails_without_backing_pages() {
    let _guard = lock();
    let sut = Stimulus::inactive(
        0x64000,
        |command: u32| command & 1 != 0,
        0x64004,
        |status: u32| status | 2,
    );
    assert!(matches!(
        sut.activate(),
        Err(Error::PageIsNotAllocated { .. })
    ));
    assert_eq!(Stimulus::count(), 0);
}

#[test]
fn drop_deactivates() {
    let _guard = lock();
    let setup = registers(0x66000);
    setup.apply().unwrap();
    {
        let sut = Stimulus::new(
            0x66000,
            |command: u32| command & 1 != 0,
            0x66004,
            |status: u32| status | 2,
        )
        .unwrap();
        assert_eq!(Stimulus::count(), 1);
        drop(sut);
    }
    assert_eq!(Stimulus::count(), 0);
}

#[test]
fn deallocated_pages_evict_their_stimuli() {
    let _guard = lock();
    let setup = registers(0x68000);
    setup.apply().unwrap();
    let kept = Stimulus::new(
        0x68000,
        |command: u32| command & 1 != 0,
        0x68004,
        |status: u32| status | 2,
    )
    .unwrap();
    let evicted = {
        let local = registers(0x6a000);
        local.apply().unwrap();
        Stimulus::new(
            0x6a000,
            |command: u32| command & 1 != 0,
            0x6a004,
            |status: u32| status | 2,
        )
        .unwrap()
        // the local stub unmaps here; its stimulus must go with it
    };
    assert_eq!(Stimulus::count(), 1);
    assert_ne!(evicted.status(), Status::Done);
    handshake(&kept, 0x68000, 0x68004);
    assert_eq!(Stimulus::count(), 0);
}

#[test]
fn duplicate_of_an_active_stimulus_is_active() {
    let _guard = lock();
    let setup = registers(0x6c000);
    setup.apply().unwrap();
    let original = Stimulus::inactive(
        0x6c000,
        |command: u32| command & 1 != 0,
        0x6c004,
        |status: u32| status | 2,
    );
    let sut = original.duplicate().unwrap();
    assert_eq!(Stimulus::count(), 1);
    assert_eq!(original.status(), Status::Idle);
    handshake(&sut, 0x6c000, 0x6c004);
    assert_eq!(Stimulus::count(), 0);
}

#[test]
fn inactive_duplicate_stays_dormant() {
    let _guard = lock();
    let setup = registers(0x6e000);
    setup.apply().unwrap();
    let original = Stimulus::new(
        0x6e000,
        |command: u32| command & 1 != 0,
        0x6e004,
        |status: u32| status | 2,
    )
    .unwrap();
    let sut = original.duplicate_inactive();
    assert_eq!(Stimulus::count(), 1);
    assert_eq!(sut.status(), Status::Idle);
    sut.activate().unwrap();
    assert_eq!(Stimulus::count(), 2);
    unsafe { write_volatile(0x6e000 as *mut u32, 1) };
    wait_until("both completions", || Stimulus::count() == 0);
}

#[test]
fn moving_a_handle_preserves_registration() {
    let _guard = lock();
    let setup = registers(0x70000);
    setup.apply().unwrap();
    let original = Stimulus::new(
        0x70000,
        |command: u32| command & 1 != 0,
        0x70004,
        |status: u32| status | 2,
    )
    .unwrap();
    assert_eq!(Stimulus::count(), 1);
    let sut = original; // move does not deactivate
    assert_eq!(Stimulus::count(), 1);
    handshake(&sut, 0x70000, 0x70004);
    assert_eq!(Stimulus::count(), 0);
}

#[test]
fn explicit_deactivation_unregisters_and_can_be_undone() {
    let _guard = lock();
    let setup = registers(0x74000);
    setup.apply().unwrap();
    let sut = Stimulus::new(
        0x74000,
        |command: u32| command & 1 != 0,
        0x74004,
        |status: u32| status | 2,
    )
    .unwrap();
    assert_eq!(Stimulus::count(), 1);
    assert!(sut.deactivate());
    assert_eq!(Stimulus::count(), 0);
    assert_eq!(sut.status(), Status::Idle);
    assert!(!sut.deactivate());
    sut.activate().unwrap();
    assert_eq!(Stimulus::count(), 1);
}

#[test]
fn panicking_predicate_is_removed() {
    let _guard = lock();
    let setup = registers(0x72000);
    setup.apply().unwrap();
    let sut = Stimulus::new(
        0x72000,
        |_: u32| -> bool { panic!("defective stimulus") },
        0x72004,
        |status: u32| status,
    )
    .unwrap();
    wait_until("removal of the offender", || Stimulus::count() == 0);
    assert_ne!(sut.status(), Status::Done);
}
