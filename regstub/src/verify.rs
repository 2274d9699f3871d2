//! verification
//!
//! a verify is the read-side twin of a stub: an ordered collection of
//! comparator elements. applying it checks that every element's pages are
//! backed, then routes each comparison result through the process-wide
//! [`expect`] hook, which decides whether to keep going.

use std::collections::BTreeMap;
use std::mem;
use std::panic::Location;

use parking_lot::RwLock;

use regstub_region::PageRange;

use crate::arena;
use crate::element::Element;
use crate::error::Error;
use crate::logcat;
use crate::operator::Comparator;
use crate::stub::append;

/// Verdict of the [`expect`] hook: keep checking or stop at this element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Run,
    Stop,
}

/// Signature of the expectation hook: the element's comparison result and
/// its declaration site.
pub type ExpectFn = fn(bool, &'static Location<'static>) -> Control;

/// Logs failures at error level and keeps going.
pub fn default_expect(success: bool, location: &'static Location<'static>) -> Control {
    if !success {
        log::error!(
            target: logcat::VERIFY,
            "verify condition failed for element declared at {location}"
        );
    }
    Control::Run
}

static EXPECT: RwLock<ExpectFn> = RwLock::new(default_expect);

/// Current expectation hook.
pub fn expect() -> ExpectFn {
    *EXPECT.read()
}

/// Replaces the expectation hook, returning the previous one. Tests swap in
/// a hook that reports into their framework.
pub fn set_expect(hook: ExpectFn) -> ExpectFn {
    mem::replace(&mut *EXPECT.write(), hook)
}

/// Scoped replacement of the expectation hook; the previous hook is
/// restored on every exit path.
pub struct ExpectGuard {
    previous: ExpectFn,
}

impl ExpectGuard {
    pub fn new(hook: ExpectFn) -> Self {
        Self {
            previous: set_expect(hook),
        }
    }
}

impl Drop for ExpectGuard {
    fn drop(&mut self) {
        set_expect(self.previous);
    }
}

/// Checks data in regions of MMIO memory.
#[derive(Clone)]
pub struct Verify {
    elements: BTreeMap<usize, Element<Comparator>>,
    location: &'static Location<'static>,
}

impl Verify {
    /// Builds a verify from elements. Duplicate base addresses are
    /// rejected; overlapping regions are allowed, unlike in a stub.
    #[track_caller]
    pub fn new<I>(elements: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = Element<Comparator>>,
    {
        let location = Location::caller();
        let mut map = BTreeMap::new();
        append(&mut map, elements, location)?;
        Ok(Self {
            elements: map,
            location,
        })
    }

    /// Empty verify, a target for [`Verify::merge`].
    #[track_caller]
    pub fn empty() -> Self {
        Self {
            elements: BTreeMap::new(),
            location: Location::caller(),
        }
    }

    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// New verify holding the union of both element sets.
    pub fn union(&self, other: &Verify) -> Result<Verify, Error> {
        let mut result = self.clone();
        append(
            &mut result.elements,
            other.elements.values().cloned(),
            result.location,
        )?;
        Ok(result)
    }

    /// Absorbs another verify's elements.
    pub fn merge(&mut self, other: Verify) -> Result<(), Error> {
        append(&mut self.elements, other.elements.into_values(), self.location)
    }

    /// Runs the verification.
    ///
    /// Every element below the arena cap must be fully backed, otherwise
    /// the apply fails before any comparison runs. Each comparison result
    /// is handed to the [`expect`] hook; a [`Control::Stop`] verdict ends
    /// the pass early. Returns whether every element compared equal.
    pub fn apply(&self) -> Result<bool, Error> {
        let cap = arena::size();
        {
            let mmio = arena::registry();
            for element in self.elements.values() {
                if element.addr() >= cap {
                    break;
                }
                if !mmio.contains(PageRange::from_region(element.region())) {
                    return Err(Error::PageIsNotAllocated {
                        location: element.location(),
                    });
                }
            }
        }
        let hook = expect();
        let mut fail = false;
        for element in self.elements.values() {
            let success = element.invoke()?;
            fail |= !success;
            if hook(success, element.location()) == Control::Stop {
                break;
            }
        }
        Ok(!fail)
    }
}
