//! stubs
//!
//! a stub is a declarative collection of generator elements. invoking
//! [`Stub::apply`] materializes it: the covering pages are mapped at their
//! exact addresses by the arena and every element seeds its region. the
//! pages live until the stub is dropped.

use std::collections::btree_map::{BTreeMap, Entry};
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};

use itertools::Itertools;

use regstub_region::PageRange;

use crate::arena;
use crate::element::{overlapping, Element};
use crate::error::Error;
use crate::operator::Generator;

/// Identities are drawn from a process-wide counter: unique among coexisting
/// stubs, stable across moves (the field travels with the value), never
/// reused.
fn next_identity() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Inserts elements into an address-keyed map, rejecting duplicates with a
/// diagnostic that names all three involved declaration sites.
pub(crate) fn append<Op>(
    dst: &mut BTreeMap<usize, Element<Op>>,
    src: impl IntoIterator<Item = Element<Op>>,
    collection: &'static Location<'static>,
) -> Result<(), Error> {
    for element in src {
        match dst.entry(element.addr()) {
            Entry::Vacant(slot) => {
                slot.insert(element);
            }
            Entry::Occupied(occupied) => {
                return Err(Error::DuplicateAddress {
                    address: element.addr(),
                    duplicate: element.location(),
                    collection,
                    original: occupied.get().location(),
                });
            }
        }
    }
    Ok(())
}

/// Scans neighbours of the sorted map for region overlap. The map is
/// ordered by base address, and among regions so ordered any overlap shows
/// up between immediate neighbours, so the adjacent-pair test is complete.
pub(crate) fn check_overlapping<Op>(
    elements: &BTreeMap<usize, Element<Op>>,
    collection: &'static Location<'static>,
) -> Result<(), Error> {
    if let Some((first, second)) = elements
        .values()
        .tuple_windows()
        .find(|(a, b)| overlapping(a, b))
    {
        return Err(Error::OverlappingElements {
            collection,
            first_addr: first.addr(),
            first_size: first.size(),
            first: first.location(),
            second_addr: second.addr(),
            second_size: second.size(),
            second: second.location(),
        });
    }
    Ok(())
}

/// Allocates and seeds regions of MMIO memory.
pub struct Stub {
    elements: BTreeMap<usize, Element<Generator>>,
    identity: u64,
    location: &'static Location<'static>,
}

impl Stub {
    /// Builds a stub from elements. Fails when two elements share a base
    /// address or their regions overlap.
    ///
    /// Shared element lists compose by iterator chaining:
    ///
    /// ```ignore
    /// let stub = Stub::new(shared_registers().into_iter().chain([
    ///     Element::value(0x4000_1000, 0u32),
    /// ]))?;
    /// ```
    #[track_caller]
    pub fn new<I>(elements: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = Element<Generator>>,
    {
        let location = Location::caller();
        let mut map = BTreeMap::new();
        append(&mut map, elements, location)?;
        check_overlapping(&map, location)?;
        Ok(Self {
            elements: map,
            identity: next_identity(),
            location,
        })
    }

    /// Empty stub, a target for [`Stub::merge`].
    #[track_caller]
    pub fn empty() -> Self {
        Self {
            elements: BTreeMap::new(),
            identity: next_identity(),
            location: Location::caller(),
        }
    }

    pub fn identity(&self) -> u64 {
        self.identity
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

    /// Materializes the stub: maps the covering pages of every element below
    /// the arena cap, then runs every generator in address order.
    ///
    /// Pages are mapped before any generator runs, because an element may
    /// cross a page boundary. Elements at or above the cap are seeded
    /// without any mapping: they refer to real host memory.
    pub fn apply(&self) -> Result<(), Error> {
        let cap = arena::size();
        let mut pages: Vec<PageRange> = Vec::new();
        for element in self.elements.values() {
            // the map is sorted, nothing past the cap can follow
            if element.addr() >= cap {
                break;
            }
            let range = PageRange::from_region(element.region());
            if !pages.iter_mut().any(|page| page.join(range)) {
                pages.push(range);
            }
        }
        {
            let mut mmio = arena::registry();
            for range in &pages {
                mmio.allocate(*range, self.identity, self.location)?;
            }
        }
        for element in self.elements.values() {
            element.invoke()?;
        }
        Ok(())
    }

    /// New stub holding the union of both element sets. The result gets a
    /// fresh identity and no arena claim; both invariants are re-checked.
    pub fn union(&self, other: &Stub) -> Result<Stub, Error> {
        let mut result = self.clone();
        append(
            &mut result.elements,
            other.elements.values().cloned(),
            result.location,
        )?;
        check_overlapping(&result.elements, result.location)?;
        Ok(result)
    }

    /// Absorbs another stub: takes its elements and claims any pages it has
    /// already allocated, so they now live and die with `self`.
    pub fn merge(&mut self, mut other: Stub) -> Result<(), Error> {
        let absorbed = std::mem::take(&mut other.elements);
        append(&mut self.elements, absorbed.into_values(), self.location)?;
        check_overlapping(&self.elements, self.location)?;
        arena::registry().claim(other.identity, self.identity);
        Ok(())
    }
}

impl Clone for Stub {
    /// The copy shares no fate with the original: it gets a fresh identity
    /// and none of the original's arena claim.
    fn clone(&self) -> Self {
        Self {
            elements: self.elements.clone(),
            identity: next_identity(),
            location: self.location,
        }
    }
}

impl Drop for Stub {
    fn drop(&mut self) {
        arena::registry().deallocate(self.identity);
    }
}
