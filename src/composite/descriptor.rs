//! Composed configuration descriptor
//!
//! Each registered class brings its own full-speed configuration block, written
//! as if the class were the only function on the device. Registration walks
//! that block one descriptor at a time and appends it to a single
//! configuration:
//!
//! - the class' configuration header becomes an interface association
//!   descriptor (IAD) in the same position,
//! - interface numbers are renumbered from the shared interface space,
//! - endpoint addresses are renumbered from the shared endpoint space,
//! - CDC call management and union functional descriptors have their
//!   interface references shifted by the class' first interface,
//! - everything else is copied verbatim.
//!
//! The numbering spaces are shared by all classes, in registration order,
//! and nothing is ever handed out twice.

use super::ownership::{AddressAllocator, EndpointMap, Owner, Owners};
use usb_device::{descriptor::descriptor_type, endpoint::EndpointAddress};

/// Capacity of the composed configuration descriptor
pub const COMPOSED_DESCRIPTOR_CAPACITY: usize = 1024;

/// Size of the configuration descriptor header
pub const CONFIGURATION_HEADER_LEN: usize = 9;

/// Size of an interface association descriptor
pub const IAD_LEN: usize = 8;

/// Class-specific interface descriptor type
pub const CS_INTERFACE: u8 = 0x24;

/// CDC call management functional descriptor subtype
const CALL_MANAGEMENT: u8 = 0x01;

/// CDC union functional descriptor subtype
const UNION: u8 = 0x06;

/// Configuration header written before the first class is merged.
///
/// Bus powered, 500 mA. Total length and interface count are kept current
/// as classes are appended.
const CONFIGURATION_HEADER: [u8; CONFIGURATION_HEADER_LEN] = [
    CONFIGURATION_HEADER_LEN as u8,
    descriptor_type::CONFIGURATION,
    CONFIGURATION_HEADER_LEN as u8, // wTotalLength
    0x00,
    0x00, // bNumInterfaces
    0x01, // bConfigurationValue
    0x00, // iConfiguration
    0x80, // bmAttributes
    0xFA, // bMaxPower
];

/// Function class, subclass, and protocol of a registered class
///
/// Written into the class' interface association descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Function {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

impl Function {
    pub const fn new(class: u8, subclass: u8, protocol: u8) -> Self {
        Self {
            class,
            subclass,
            protocol,
        }
    }
}

/// The outcome of merging one class
#[derive(Debug, Clone, Copy)]
pub(crate) struct Merged {
    /// First interface number assigned to the class
    pub first_interface: u8,
    /// Number of distinct interfaces the class owns
    pub interfaces: u8,
    /// The class' endpoint renumbering
    pub endpoints: EndpointMap,
}

/// A configuration descriptor assembled from several class blocks
pub struct ComposedDescriptor {
    buffer: [u8; COMPOSED_DESCRIPTOR_CAPACITY],
    len: usize,
    interfaces: u8,
}

impl Default for ComposedDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

impl ComposedDescriptor {
    /// An empty descriptor. The configuration header is written by the first
    /// merge.
    pub const fn new() -> Self {
        Self {
            buffer: [0; COMPOSED_DESCRIPTOR_CAPACITY],
            len: 0,
            interfaces: 0,
        }
    }

    /// The composed bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer[..self.len]
    }

    /// Number of interfaces handed out so far.
    pub fn interface_count(&self) -> u8 {
        self.interfaces
    }

    /// Iterate over the descriptors of the composed configuration.
    pub fn iter(&self) -> Descriptors<'_> {
        Descriptors::new(self.as_bytes())
    }

    fn seed(&mut self) {
        if self.len == 0 {
            self.buffer[..CONFIGURATION_HEADER_LEN].copy_from_slice(&CONFIGURATION_HEADER);
            self.len = CONFIGURATION_HEADER_LEN;
        }
    }

    /// Merge a class' configuration block into this configuration.
    ///
    /// `alloc` and `owners` are only updated if the merge succeeds. On
    /// failure, the composed descriptor is left as it was.
    pub(crate) fn merge(
        &mut self,
        class: usize,
        block: &[u8],
        function: Function,
        alloc: &mut AddressAllocator,
        owners: &mut Owners,
    ) -> crate::Result<Merged> {
        self.seed();

        let mut next_alloc = *alloc;
        let mut next_owners = *owners;
        let mut endpoints = EndpointMap::new();
        let first_interface = self.interfaces;
        let mut next_interface = self.interfaces;
        let mut owned: u8 = 0;
        let mut last_interface: Option<u8> = None;
        let mut len = self.len;

        for desc in Descriptors::new(block) {
            let desc = desc?;
            let kind = desc[1];
            let out_len = if kind == descriptor_type::CONFIGURATION {
                IAD_LEN
            } else {
                desc.len()
            };
            let out = self.buffer.get_mut(len..len + out_len).ok_or_else(|| {
                warn!("Composed descriptor overflow at {}", len);
                crate::Error::Fail
            })?;

            match kind {
                descriptor_type::CONFIGURATION => {
                    let declared = *desc.get(4).ok_or(crate::Error::Fail)?;
                    out.copy_from_slice(&[
                        IAD_LEN as u8,
                        descriptor_type::IAD,
                        first_interface,
                        declared,
                        function.class,
                        function.subclass,
                        function.protocol,
                        0x00,
                    ]);
                }
                descriptor_type::INTERFACE => {
                    out.copy_from_slice(desc);
                    let number = *desc.get(2).ok_or(crate::Error::Fail)?;
                    // Alternate settings repeat the interface number
                    if last_interface != Some(number) {
                        last_interface = Some(number);
                        if !next_owners.set_interface(next_interface, class) {
                            warn!("Out of interface numbers");
                            return Err(crate::Error::Fail);
                        }
                        out[2] = next_interface;
                        next_interface += 1;
                        owned += 1;
                    } else {
                        out[2] = next_interface - 1;
                    }
                }
                descriptor_type::ENDPOINT => {
                    out.copy_from_slice(desc);
                    let address = *desc.get(2).ok_or(crate::Error::Fail)?;
                    let logical = EndpointAddress::from(address & 0x8F);
                    let dir = logical.direction();
                    let physical = next_alloc.next(dir).ok_or_else(|| {
                        warn!("Out of endpoint numbers");
                        crate::Error::Fail
                    })?;
                    if !endpoints.insert(dir, logical.index() as u8, physical) {
                        return Err(crate::Error::Fail);
                    }
                    let physical = EndpointAddress::from_parts(physical.into(), dir);
                    next_owners.set_endpoint(physical, Owner { class, logical });
                    out[2] = u8::from(physical);
                }
                CS_INTERFACE => {
                    out.copy_from_slice(desc);
                    match desc.get(2) {
                        Some(&CALL_MANAGEMENT) if out.len() > 4 => {
                            out[4] = out[4].wrapping_add(first_interface);
                        }
                        Some(&UNION) => {
                            for number in out.iter_mut().skip(3) {
                                *number = number.wrapping_add(first_interface);
                            }
                        }
                        _ => {}
                    }
                }
                _ => out.copy_from_slice(desc),
            }
            len += out_len;
        }

        self.len = len;
        self.interfaces = next_interface;
        *alloc = next_alloc;
        *owners = next_owners;
        self.update_header();

        Ok(Merged {
            first_interface,
            interfaces: owned,
            endpoints,
        })
    }

    fn update_header(&mut self) {
        let total = (self.len as u16).to_le_bytes();
        self.buffer[2] = total[0];
        self.buffer[3] = total[1];
        self.buffer[4] = self.interfaces;
    }
}

/// Iterator over the descriptors in a descriptor block
///
/// Yields each descriptor, including its length and type bytes. A zero
/// length, or a descriptor that runs past the end of the block, yields an
/// error and ends the iteration.
pub struct Descriptors<'a> {
    block: &'a [u8],
}

impl<'a> Descriptors<'a> {
    pub fn new(block: &'a [u8]) -> Self {
        Self { block }
    }
}

impl<'a> Iterator for Descriptors<'a> {
    type Item = crate::Result<&'a [u8]>;
    fn next(&mut self) -> Option<Self::Item> {
        let len = usize::from(*self.block.first()?);
        if len < 2 || len > self.block.len() {
            warn!("Malformed descriptor of length {}", len);
            self.block = &[];
            return Some(Err(crate::Error::Fail));
        }
        let (desc, rest) = self.block.split_at(len);
        self.block = rest;
        Some(Ok(desc))
    }
}
