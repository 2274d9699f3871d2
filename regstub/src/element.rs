//! elements
//!
//! an element couples a byte region with the operation to perform on it and
//! remembers where in the test source it was declared, so that every later
//! diagnostic can point at the offending line

use std::mem::size_of;
use std::panic::Location;

use bytemuck::Pod;

use regstub_region::Region;

use crate::error::Error;
use crate::operator::{Comparator, Generator, Operation};

/// One `(region, operation)` pair of a stub or verify collection.
#[derive(Clone)]
pub struct Element<Op> {
    region: Region,
    op: Op,
    location: &'static Location<'static>,
}

impl<Op> Element<Op> {
    /// Element with an explicitly constructed operator.
    #[track_caller]
    pub fn new(region: Region, op: Op) -> Self {
        Self {
            region,
            op,
            location: Location::caller(),
        }
    }

    pub fn addr(&self) -> usize {
        self.region.addr()
    }

    pub fn size(&self) -> usize {
        self.region.size()
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }
}

impl<Op: Operation> Element<Op> {
    /// Element holding a single value at an absolute address; the region is
    /// sized to the value.
    #[track_caller]
    pub fn value<T: Pod>(address: usize, value: T) -> Self {
        Self {
            region: Region::new(address, size_of::<T>()),
            op: Op::one(value),
            location: Location::caller(),
        }
    }

    /// Element repeating a value over `count` consecutive instances starting
    /// at an absolute address.
    #[track_caller]
    pub fn array<T: Pod>(address: usize, count: usize, value: T) -> Self {
        Self {
            region: Region::new(address, count * size_of::<T>()),
            op: Op::all(value),
            location: Location::caller(),
        }
    }

    /// Runs the operator against the element's region.
    ///
    /// The region must reference live memory: either pages the arena has
    /// mapped, or memory the test itself owns.
    pub fn invoke(&self) -> Result<Op::Output, Error> {
        // SAFETY: upheld by the callers. Stub/verify invoke elements only
        // after the covering pages exist; direct invocations go through
        // pointers supplied by the test.
        unsafe { self.op.run(self.region.begin(), self.region.end()) }
    }
}

impl Element<Generator> {
    /// Element that reserves its region's pages without seeding them.
    #[track_caller]
    pub fn reserve(region: Region) -> Self {
        Self {
            region,
            op: Generator::none(),
            location: Location::caller(),
        }
    }

    /// Element seeding a single value behind a pointer, for memory the test
    /// owns (locals, statics) rather than a faked register.
    #[track_caller]
    pub fn slot<T: Pod>(pointer: *mut T, value: T) -> Self {
        Self {
            region: Region::of(pointer),
            op: Generator::one(value),
            location: Location::caller(),
        }
    }

    /// Element filling `count` consecutive instances behind a pointer.
    #[track_caller]
    pub fn slice<T: Pod>(pointer: *mut T, count: usize, value: T) -> Self {
        Self {
            region: Region::of_slice(pointer, count),
            op: Generator::all(value),
            location: Location::caller(),
        }
    }
}

impl Element<Comparator> {
    /// Element comparing a single value behind a pointer.
    #[track_caller]
    pub fn check<T: Pod>(pointer: *const T, value: T) -> Self {
        Self {
            region: Region::of(pointer),
            op: Comparator::one(value),
            location: Location::caller(),
        }
    }

    /// Element comparing `count` consecutive instances behind a pointer.
    #[track_caller]
    pub fn check_slice<T: Pod>(pointer: *const T, count: usize, value: T) -> Self {
        Self {
            region: Region::of_slice(pointer, count),
            op: Comparator::all(value),
            location: Location::caller(),
        }
    }
}

/// True iff the two elements' regions intersect.
pub fn overlapping<A, B>(a: &Element<A>, b: &Element<B>) -> bool {
    regstub_region::overlapping(a.region(), b.region())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Copy, Clone, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct Quad {
        a: u32,
        b: u32,
        c: u32,
        d: u32,
    }

    #[test]
    fn explicit_operator() {
        let el = Element::new(Region::new(0x1000, 4), Generator::none());
        assert_eq!(el.addr(), 0x1000);
        assert_eq!(el.size(), 4);
        assert_eq!(el.location().file(), file!());
    }

    #[test]
    fn reserve_keeps_region() {
        let el = Element::reserve(Region::new(0x1000, 4));
        assert_eq!(el.addr(), 0x1000);
        assert_eq!(el.size(), 4);
    }

    #[test]
    fn slot_writes_local_memory() {
        let mut variable = 0u32;
        let pointer = &mut variable as *mut u32;
        let el = Element::<Generator>::slot(pointer, 0xfeedbeefu32);
        assert_eq!(el.addr(), pointer as usize);
        assert_eq!(el.size(), 4);
        el.invoke().unwrap();
        assert_eq!(variable, 0xfeedbeef);
    }

    #[test]
    fn slot_writes_struct() {
        let data = Quad {
            a: 1,
            b: 2,
            c: 3,
            d: 4,
        };
        let mut target = Quad {
            a: 0,
            b: 0,
            c: 0,
            d: 0,
        };
        let el = Element::<Generator>::slot(&mut target, data);
        assert_eq!(el.size(), 16);
        el.invoke().unwrap();
        assert_eq!(target, data);
    }

    #[test]
    fn slice_fills_array() {
        let mut array = [0u32; 16];
        let el = Element::<Generator>::slice(array.as_mut_ptr(), array.len(), 0xc0u32);
        assert_eq!(el.addr(), array.as_ptr() as usize);
        assert_eq!(el.size(), 64);
        el.invoke().unwrap();
        assert_eq!(array, [0xc0u32; 16]);
    }

    #[test]
    fn clone_copies_all_fields() {
        let mut variable = 0u32;
        let src = Element::<Generator>::slot(&mut variable, 0x55ff33u32);
        let copy = src.clone();
        assert_eq!(copy.addr(), src.addr());
        assert_eq!(copy.size(), src.size());
        assert_eq!(copy.location().line(), src.location().line());
        copy.invoke().unwrap();
        assert_eq!(variable, 0x55ff33);
    }

    #[test]
    fn comparator_element_checks_local_memory() {
        let variable = 0xfeedbeefu32;
        let el = Element::check(&variable, 0xfeedbeefu32);
        assert!(el.invoke().unwrap());
        let miss = Element::check(&variable, 0u32);
        assert!(!miss.invoke().unwrap());
    }

    #[test]
    fn comparator_slice_checks_array() {
        let array = [0xc0c0u16; 16];
        let el = Element::check_slice(array.as_ptr(), array.len(), 0xc0c0u16);
        assert!(el.invoke().unwrap());
    }

    #[test]
    fn overlap_of_regions() {
        let a: Element<Generator> = Element::reserve(Region::new(0x1000, 16));
        let b: Element<Generator> = Element::reserve(Region::new(0x1008, 4));
        let c: Element<Generator> = Element::reserve(Region::new(0x1016, 4));
        assert!(overlapping(&a, &b));
        assert!(!overlapping(&a, &c));
    }
}
