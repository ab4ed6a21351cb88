//! Endpoint and interface ownership
//!
//! Registration hands out physical endpoint and interface numbers from one
//! shared, never-reused space. The tables in this module remember who got
//! what, so that dispatch is a table lookup instead of a scan over every
//! class.

use usb_device::{endpoint::EndpointAddress, UsbDirection};

/// Endpoints per direction that a composite device can hand out
///
/// Physical endpoint numbers 1 through 15. EP0 belongs to the device core.
pub const MAX_ENDPOINTS: usize = 15;

/// Interfaces that a composite device can hand out
pub const MAX_INTERFACES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pair {
    logical: u8,
    physical: u8,
}

const PAIR_INIT: Pair = Pair {
    logical: 0,
    physical: 0,
};

/// One direction of an [`EndpointMap`]
#[derive(Debug, Clone, Copy)]
struct Pairs {
    pairs: [Pair; MAX_ENDPOINTS],
    len: usize,
}

impl Pairs {
    const fn new() -> Self {
        Self {
            pairs: [PAIR_INIT; MAX_ENDPOINTS],
            len: 0,
        }
    }
    fn as_slice(&self) -> &[Pair] {
        &self.pairs[..self.len]
    }
    fn push(&mut self, pair: Pair) -> bool {
        match self.pairs.get_mut(self.len) {
            Some(slot) => {
                *slot = pair;
                self.len += 1;
                true
            }
            None => false,
        }
    }
}

/// A class' logical-to-physical endpoint numbers
///
/// Logical numbers are the ones found in the class' own descriptor block.
/// Physical numbers are the ones the composite device wrote into its
/// configuration descriptor, and the ones the host uses.
#[derive(Debug, Clone, Copy)]
pub struct EndpointMap {
    ins: Pairs,
    outs: Pairs,
}

impl Default for EndpointMap {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointMap {
    /// An empty map.
    pub const fn new() -> Self {
        Self {
            ins: Pairs::new(),
            outs: Pairs::new(),
        }
    }

    fn pairs(&self, dir: UsbDirection) -> &Pairs {
        match dir {
            UsbDirection::In => &self.ins,
            UsbDirection::Out => &self.outs,
        }
    }

    /// Record that `logical` is known as `physical` on the wire.
    ///
    /// Returns `false` if the class already owns the maximum number of
    /// endpoints in this direction.
    pub(crate) fn insert(&mut self, dir: UsbDirection, logical: u8, physical: u8) -> bool {
        let pairs = match dir {
            UsbDirection::In => &mut self.ins,
            UsbDirection::Out => &mut self.outs,
        };
        pairs.push(Pair { logical, physical })
    }

    /// Returns the number of endpoints in the given direction.
    pub fn len(&self, dir: UsbDirection) -> usize {
        self.pairs(dir).len
    }

    /// Returns `true` if the class owns no endpoints.
    pub fn is_empty(&self) -> bool {
        self.ins.len == 0 && self.outs.len == 0
    }

    /// Translate a logical endpoint address into its physical address.
    ///
    /// EP0 is shared by every class, and it's never translated.
    pub fn physical(&self, logical: EndpointAddress) -> Option<EndpointAddress> {
        if logical.index() == 0 {
            return Some(logical);
        }
        self.pairs(logical.direction())
            .as_slice()
            .iter()
            .find(|pair| usize::from(pair.logical) == logical.index())
            .map(|pair| EndpointAddress::from_parts(pair.physical.into(), logical.direction()))
    }

    /// Translate a physical endpoint address back into the logical address.
    pub fn logical(&self, physical: EndpointAddress) -> Option<EndpointAddress> {
        if physical.index() == 0 {
            return Some(physical);
        }
        self.pairs(physical.direction())
            .as_slice()
            .iter()
            .find(|pair| usize::from(pair.physical) == physical.index())
            .map(|pair| EndpointAddress::from_parts(pair.logical.into(), physical.direction()))
    }

    /// Iterate over `(logical, physical)` pairs in the given direction, in
    /// descriptor order.
    pub fn iter(
        &self,
        dir: UsbDirection,
    ) -> impl Iterator<Item = (EndpointAddress, EndpointAddress)> + '_ {
        self.pairs(dir).as_slice().iter().map(move |pair| {
            (
                EndpointAddress::from_parts(pair.logical.into(), dir),
                EndpointAddress::from_parts(pair.physical.into(), dir),
            )
        })
    }
}

/// Helper type to allocate endpoint numbers
///
/// Numbers are handed out in increasing order, separately for each
/// direction, and they're never returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AddressAllocator {
    mask_out: u16,
    mask_in: u16,
}

impl AddressAllocator {
    pub(crate) const fn new() -> Self {
        Self {
            mask_out: 0,
            mask_in: 0,
        }
    }
    fn mask(&mut self, dir: UsbDirection) -> &mut u16 {
        match dir {
            UsbDirection::In => &mut self.mask_in,
            UsbDirection::Out => &mut self.mask_out,
        }
    }
    /// Returns the number of endpoints still available in `dir`.
    #[cfg(test)]
    pub(crate) fn remaining(&self, dir: UsbDirection) -> usize {
        let mask = match dir {
            UsbDirection::In => self.mask_in,
            UsbDirection::Out => self.mask_out,
        };
        // EP0 can never be handed out
        MAX_ENDPOINTS - mask.count_ones() as usize
    }
    pub(crate) fn next(&mut self, dir: UsbDirection) -> Option<u8> {
        let mask = self.mask(dir);
        // EP0 is owned by the device core
        let number = (*mask | 1).trailing_ones();
        let bit = 1u16.checked_shl(number)?;
        *mask |= bit;
        Some(number as u8)
    }
}

/// A class index, and the class' logical endpoint number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    /// Index of the class, in registration order.
    pub class: usize,
    /// The class' logical endpoint address.
    pub logical: EndpointAddress,
}

/// Reverse lookup from physical numbers to owning classes
///
/// Built at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Owners {
    interfaces: [Option<u8>; MAX_INTERFACES],
    ins: [Option<(u8, u8)>; MAX_ENDPOINTS + 1],
    outs: [Option<(u8, u8)>; MAX_ENDPOINTS + 1],
}

impl Owners {
    pub(crate) const fn new() -> Self {
        Self {
            interfaces: [None; MAX_INTERFACES],
            ins: [None; MAX_ENDPOINTS + 1],
            outs: [None; MAX_ENDPOINTS + 1],
        }
    }

    pub(crate) fn set_interface(&mut self, interface: u8, class: usize) -> bool {
        match self.interfaces.get_mut(usize::from(interface)) {
            Some(slot) => {
                *slot = Some(class as u8);
                true
            }
            None => false,
        }
    }

    pub(crate) fn set_endpoint(&mut self, physical: EndpointAddress, owner: Owner) {
        let table = match physical.direction() {
            UsbDirection::In => &mut self.ins,
            UsbDirection::Out => &mut self.outs,
        };
        if let Some(slot) = table.get_mut(physical.index()) {
            *slot = Some((owner.class as u8, owner.logical.index() as u8));
        }
    }

    /// Returns the class that owns `interface`.
    pub(crate) fn interface(&self, interface: u8) -> Option<usize> {
        self.interfaces
            .get(usize::from(interface))
            .copied()
            .flatten()
            .map(usize::from)
    }

    /// Returns the class that owns the physical endpoint, and the class'
    /// name for that endpoint.
    ///
    /// EP0 has no single owner.
    pub(crate) fn endpoint(&self, physical: EndpointAddress) -> Option<Owner> {
        if physical.index() == 0 {
            return None;
        }
        let table = match physical.direction() {
            UsbDirection::In => &self.ins,
            UsbDirection::Out => &self.outs,
        };
        table
            .get(physical.index())
            .copied()
            .flatten()
            .map(|(class, logical)| Owner {
                class: class.into(),
                logical: EndpointAddress::from_parts(logical.into(), physical.direction()),
            })
    }
}
