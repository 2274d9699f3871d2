//! operator closures
//!
//! the two operator families applied to a byte span: [`Generator`] writes
//! bytes into it, [`Comparator`] reads it back and reports success. both are
//! type-erased at construction: the closure keeps a byte image of the value,
//! not the value's type, so elements of any pod type coexist in one
//! collection.

use std::panic::Location;
use std::ptr;
use std::slice;
use std::sync::Arc;

use bytemuck::Pod;

use crate::error::Error;

type GenFn = dyn Fn(*mut u8, *mut u8) -> Result<(), Error> + Send + Sync;
type CmpFn = dyn Fn(*const u8, *const u8) -> Result<bool, Error> + Send + Sync;

/// Common construction surface of the operator families.
///
/// `one` produces an operator for exactly one instance of the value; `all`
/// for a span filled with repeated instances. Span-length violations are
/// reported against the operator's declaration site, not the call site.
pub trait Operation: Clone {
    type Output;

    #[track_caller]
    fn one<T: Pod>(value: T) -> Self;

    #[track_caller]
    fn all<T: Pod>(value: T) -> Self;

    /// Applies the operator to the byte span `[begin, end)`.
    ///
    /// # Safety
    ///
    /// The span must be valid for the operator's access (writable for
    /// generators, readable for comparators) and `end >= begin`.
    unsafe fn run(&self, begin: *mut u8, end: *mut u8) -> Result<Self::Output, Error>;
}

fn span_len(begin: *const u8, end: *const u8) -> usize {
    end as usize - begin as usize
}

/// Writes bytes into a span.
#[derive(Clone)]
pub struct Generator {
    run: Arc<GenFn>,
}

impl Generator {
    /// Generator that leaves the span untouched. Used by elements that only
    /// reserve pages.
    pub fn none() -> Self {
        Self {
            run: Arc::new(|_, _| Ok(())),
        }
    }
}

impl Operation for Generator {
    type Output = ();

    #[track_caller]
    fn one<T: Pod>(value: T) -> Self {
        let location = Location::caller();
        let image: Box<[u8]> = bytemuck::bytes_of(&value).into();
        Self {
            run: Arc::new(move |begin, end| {
                let len = span_len(begin, end);
                if len != image.len() {
                    return Err(Error::SizeMismatch {
                        expected: image.len(),
                        actual: len,
                        location,
                    });
                }
                unsafe { ptr::copy_nonoverlapping(image.as_ptr(), begin, len) };
                Ok(())
            }),
        }
    }

    #[track_caller]
    fn all<T: Pod>(value: T) -> Self {
        let location = Location::caller();
        let image: Box<[u8]> = bytemuck::bytes_of(&value).into();
        Self {
            run: Arc::new(move |begin, end| {
                if image.is_empty() {
                    return Ok(());
                }
                let len = span_len(begin, end);
                if len % image.len() != 0 {
                    return Err(Error::SizeMismatch {
                        expected: image.len(),
                        actual: len,
                        location,
                    });
                }
                let mut at = begin;
                for _ in 0..len / image.len() {
                    unsafe {
                        ptr::copy_nonoverlapping(image.as_ptr(), at, image.len());
                        at = at.add(image.len());
                    }
                }
                Ok(())
            }),
        }
    }

    unsafe fn run(&self, begin: *mut u8, end: *mut u8) -> Result<(), Error> {
        (self.run)(begin, end)
    }
}

/// Reads a span back and compares it against the captured value.
#[derive(Clone)]
pub struct Comparator {
    run: Arc<CmpFn>,
}

impl Operation for Comparator {
    type Output = bool;

    #[track_caller]
    fn one<T: Pod>(value: T) -> Self {
        let location = Location::caller();
        let image: Box<[u8]> = bytemuck::bytes_of(&value).into();
        Self {
            run: Arc::new(move |begin, end| {
                let len = span_len(begin, end);
                if len != image.len() {
                    return Err(Error::SizeMismatch {
                        expected: image.len(),
                        actual: len,
                        location,
                    });
                }
                let actual = unsafe { slice::from_raw_parts(begin, len) };
                Ok(actual == &image[..])
            }),
        }
    }

    #[track_caller]
    fn all<T: Pod>(value: T) -> Self {
        let location = Location::caller();
        let image: Box<[u8]> = bytemuck::bytes_of(&value).into();
        Self {
            run: Arc::new(move |begin, end| {
                if image.is_empty() {
                    return Ok(true);
                }
                let len = span_len(begin, end);
                if len % image.len() != 0 {
                    return Err(Error::SizeMismatch {
                        expected: image.len(),
                        actual: len,
                        location,
                    });
                }
                let actual = unsafe { slice::from_raw_parts(begin, len) };
                Ok(actual.chunks_exact(image.len()).all(|chunk| chunk == &image[..]))
            }),
        }
    }

    unsafe fn run(&self, begin: *mut u8, end: *mut u8) -> Result<bool, Error> {
        (self.run)(begin, end)
    }
}
