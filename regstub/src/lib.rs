//! regstub
//!
//! a host-side test harness for firmware that talks to memory-mapped I/O
//! registers at fixed absolute addresses. a [`Stub`] maps real pages at
//! those addresses inside the test process and seeds them; the code under
//! test then reads and writes them as if they were hardware. a [`Verify`]
//! checks the aftermath, and a [`Stimulus`] plays the peripheral's side of
//! a register handshake from a background worker.
//!
//! ```ignore
//! use regstub::{Element, Stub, Verify};
//!
//! let setup = Stub::new([Element::value(0x4000_0000, 0x1e2d_3c4bu32)])?;
//! setup.apply()?;
//!
//! firmware::command(0x4000_0000 as *mut u32);
//!
//! let check = Verify::new([Element::value(0x4000_0000, 0x2d_3c4bu32)])?;
//! assert!(check.apply()?);
//! ```

pub mod arena;
pub mod element;
pub mod error;
pub mod fault;
pub mod operator;
pub mod stimulus;
pub mod stub;
pub mod verify;

pub use regstub_region::{overlapping, PageRange, Region, PAGE_SIZE};

pub use arena::{set_page_fill, set_page_nofill, OnFail};
pub use element::Element;
pub use error::Error;
pub use operator::{Comparator, Generator, Operation};
pub use stimulus::{Status, Stimulus};
pub use stub::Stub;
pub use verify::{Control, Verify};

/// Log targets used by the harness, one per subsystem, so a host can filter
/// or redirect each independently.
pub mod logcat {
    pub const ARENA: &str = "regstub::arena";
    pub const STIMULUS: &str = "regstub::stimulus";
    pub const VERIFY: &str = "regstub::verify";
    pub const FAULT: &str = "regstub::fault";
}
