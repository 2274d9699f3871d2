//! fault conversion
//!
//! a fault on an unallocated address would normally kill the test process.
//! installing the handler turns it into an unwind carrying
//! [`Error::AccessToUnallocatedAddress`], which a test catches with
//! `std::panic::catch_unwind`.
//!
//! this leans on the platform allowing an unwind to cross a signal frame
//! raised by a synchronous user-mode access. that holds on linux-gnu and is
//! the design's portability constraint; the handler is not installed
//! elsewhere.

#[cfg(target_os = "linux")]
use std::io;
#[cfg(target_os = "linux")]
use std::mem;
#[cfg(target_os = "linux")]
use std::panic::panic_any;

#[cfg(target_os = "linux")]
use crate::error::Error;
use crate::logcat;

#[cfg(target_os = "linux")]
extern "C-unwind" fn on_sigsegv(
    _signo: libc::c_int,
    info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    let address = unsafe { (*info).si_addr() } as usize;
    log::error!(
        target: logcat::FAULT,
        "access to unallocated address {address:#x}"
    );
    panic_any(Error::AccessToUnallocatedAddress { address });
}

/// Installs the fault handler on the segmentation-violation signal.
/// Idempotent; safe to call from every test that wants the conversion.
#[cfg(target_os = "linux")]
pub fn handle_sigsegv() {
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = on_sigsegv as usize;
        // SA_NODEFER: the handler never returns through sigreturn, so the
        // kernel would otherwise leave the signal blocked after the unwind
        action.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER;
        if libc::sigaction(libc::SIGSEGV, &action, std::ptr::null_mut()) != 0 {
            let error = io::Error::last_os_error();
            log::error!(target: logcat::FAULT, "sigaction failed: {error}");
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn handle_sigsegv() {
    log::warn!(
        target: logcat::FAULT,
        "fault conversion is only supported on linux; faults will terminate the process"
    );
}
