use std::io;
use std::panic::Location;

use thiserror::Error;

use regstub_region::PageRange;

/// Errors raised by the harness. All of them are programmer errors: the
/// declaration that caused the problem is named by its source location.
#[derive(Debug, Error)]
pub enum Error {
    #[error(
        "duplicate address {address:#x} in the element declared at {duplicate}\n    \
         used in the collection declared at {collection}\n    \
         original element declared at {original}"
    )]
    DuplicateAddress {
        address: usize,
        duplicate: &'static Location<'static>,
        collection: &'static Location<'static>,
        original: &'static Location<'static>,
    },

    #[error(
        "stub declared at {collection} has overlapping elements:\n\
         element  {first_addr:#x}[{first_size}] declared at {first}\n\
         overlaps {second_addr:#x}[{second_size}] declared at {second}"
    )]
    OverlappingElements {
        collection: &'static Location<'static>,
        first_addr: usize,
        first_size: usize,
        first: &'static Location<'static>,
        second_addr: usize,
        second_size: usize,
        second: &'static Location<'static>,
    },

    #[error(transparent)]
    Region(#[from] regstub_region::Error),

    #[error(
        "page range {requested} requested by the stub at {owner} conflicts \
         with allocation {previous} owned by the stub at {previous_owner}"
    )]
    ConflictingAllocation {
        requested: PageRange,
        owner: &'static Location<'static>,
        previous: PageRange,
        previous_owner: &'static Location<'static>,
    },

    #[error("host page size {actual} differs from the compiled-in page size {expected}")]
    PageSizeMismatch { actual: usize, expected: usize },

    #[error("page is not allocated for the element declared at {location}")]
    PageIsNotAllocated {
        location: &'static Location<'static>,
    },

    #[error(
        "requested arena size {requested:#x} is not available, only {available:#x} \
         bytes are below the executable; check PIE build options"
    )]
    ArenaIsNotFullyAvailable { requested: usize, available: usize },

    #[error("access to unallocated address {address:#x}")]
    AccessToUnallocatedAddress { address: usize },

    #[error(
        "span of {actual} bytes does not fit the operator declared at {location} \
         (expected {expected})"
    )]
    SizeMismatch {
        expected: usize,
        actual: usize,
        location: &'static Location<'static>,
    },

    #[error("mmap of {size} bytes at {address:#x} failed")]
    MapFailed {
        address: usize,
        size: usize,
        #[source]
        source: io::Error,
    },
}
