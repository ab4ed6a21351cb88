//! Composite USB device
//!
//! [`Composite`] combines up to [`MAX_CLASSES`] class drivers into one
//! configuration. Each class is written as if it owned the whole device:
//! its descriptors start numbering interfaces at zero, and it opens and
//! addresses its endpoints by the numbers in its own descriptor block. At
//! registration, the composite renumbers the class' descriptors into a shared
//! configuration; at runtime, it routes each USB core event to the owning
//! class and translates endpoint numbers in both directions.
//!
//! The composite is a [`ClassDriver`] itself. Register the classes, then hand
//! the composite to the device core as the only class.
//!
//! ```
//! use usbd_rndis::{
//!     class::ClassDriver,
//!     composite::{Composite, Function},
//!     usbcore::UsbCore,
//! };
//!
//! struct Vendor;
//!
//! impl ClassDriver for Vendor {
//!     fn init(&mut self, _: &dyn UsbCore, _: u8) -> usbd_rndis::Result<()> {
//!         Ok(())
//!     }
//!     fn deinit(&mut self, _: &dyn UsbCore, _: u8) -> usbd_rndis::Result<()> {
//!         Ok(())
//!     }
//!     fn fs_configuration_descriptor(&self) -> &[u8] {
//!         &[
//!             0x09, 0x02, 0x19, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32,
//!             0x09, 0x04, 0x00, 0x00, 0x01, 0xFF, 0x00, 0x00, 0x00,
//!             0x07, 0x05, 0x81, 0x02, 0x40, 0x00, 0x00,
//!         ]
//!     }
//! }
//!
//! let mut first = Vendor;
//! let mut second = Vendor;
//! let mut composite = Composite::new();
//! composite.register(&mut first, Function::new(0xFF, 0, 0)).unwrap();
//! composite.register(&mut second, Function::new(0xFF, 0, 0)).unwrap();
//!
//! assert_eq!(composite.interface_count(), 2);
//! // Both classes call their endpoint 0x81. The second one is 0x82 on the wire.
//! let ep = |addr: u8| usb_device::endpoint::EndpointAddress::from(addr);
//! assert_eq!(composite.endpoint(1, ep(0x81)), Some(ep(0x82)));
//! ```

mod descriptor;
mod ownership;

pub use descriptor::{
    ComposedDescriptor, Descriptors, Function, COMPOSED_DESCRIPTOR_CAPACITY,
    CONFIGURATION_HEADER_LEN, CS_INTERFACE, IAD_LEN,
};
pub use ownership::{EndpointMap, Owner, MAX_ENDPOINTS, MAX_INTERFACES};

use crate::{
    class::ClassDriver,
    usbcore::{Speed, UsbCore},
};
use ownership::{AddressAllocator, Owners};
use usb_device::{
    control::{Recipient, Request},
    endpoint::{EndpointAddress, EndpointType},
};

/// The maximum number of classes in one composite device
pub const MAX_CLASSES: usize = 5;

/// Composite device qualifier
///
/// USB 2.0, class defined by the interfaces, 64 byte EP0, one other-speed
/// configuration.
const DEVICE_QUALIFIER: [u8; 10] = [0x0A, 0x06, 0x00, 0x02, 0x00, 0x00, 0x00, 0x40, 0x01, 0x00];

/// A registered class
struct Slot<'a> {
    class: &'a mut (dyn ClassDriver + 'a),
    function: Function,
    first_interface: u8,
    interfaces: u8,
    endpoints: EndpointMap,
}

/// A device core, as seen by one class
///
/// Translates the class' logical endpoint numbers into physical numbers
/// before calling into the real core.
struct ClassCore<'c> {
    core: &'c dyn UsbCore,
    endpoints: &'c EndpointMap,
}

impl ClassCore<'_> {
    fn translate(&self, ep: EndpointAddress) -> crate::Result<EndpointAddress> {
        self.endpoints.physical(ep).ok_or_else(|| {
            warn!("Class used unknown endpoint {=u8:#x}", u8::from(ep));
            crate::Error::Fail
        })
    }
}

impl UsbCore for ClassCore<'_> {
    fn speed(&self) -> Speed {
        self.core.speed()
    }
    fn open_endpoint(
        &self,
        ep: EndpointAddress,
        ep_type: EndpointType,
        max_packet_size: u16,
    ) -> crate::Result<()> {
        self.core
            .open_endpoint(self.translate(ep)?, ep_type, max_packet_size)
    }
    fn close_endpoint(&self, ep: EndpointAddress) -> crate::Result<()> {
        self.core.close_endpoint(self.translate(ep)?)
    }
    fn transmit(&self, ep: EndpointAddress, data: &[u8]) -> crate::Result<()> {
        self.core.transmit(self.translate(ep)?, data)
    }
    fn prepare_receive(&self, ep: EndpointAddress, max_len: usize) -> crate::Result<()> {
        self.core.prepare_receive(self.translate(ep)?, max_len)
    }
    fn read(&self, ep: EndpointAddress, buf: &mut [u8]) -> usize {
        match self.endpoints.physical(ep) {
            Some(ep) => self.core.read(ep, buf),
            None => 0,
        }
    }
    fn control_send(&self, data: &[u8]) -> crate::Result<()> {
        self.core.control_send(data)
    }
    fn control_prepare_receive(&self, len: usize) -> crate::Result<()> {
        self.core.control_prepare_receive(len)
    }
    fn control_read(&self, buf: &mut [u8]) -> usize {
        self.core.control_read(buf)
    }
    fn physical(&self, ep: EndpointAddress) -> EndpointAddress {
        self.endpoints.physical(ep).unwrap_or(ep)
    }
}

/// A composite USB device
///
/// See the [module documentation](crate::composite) for an example.
pub struct Composite<'a> {
    classes: [Option<Slot<'a>>; MAX_CLASSES],
    count: usize,
    descriptor: ComposedDescriptor,
    alloc: AddressAllocator,
    owners: Owners,
}

impl Default for Composite<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Composite<'a> {
    /// A composite device without classes.
    pub fn new() -> Self {
        Self {
            classes: [None, None, None, None, None],
            count: 0,
            descriptor: ComposedDescriptor::new(),
            alloc: AddressAllocator::new(),
            owners: Owners::new(),
        }
    }

    /// Add a class to the configuration.
    ///
    /// `function` is the class, subclass, and protocol written into the
    /// class' interface association descriptor. Returns the class' index.
    ///
    /// Fails if there are already [`MAX_CLASSES`] classes, if the class'
    /// descriptor block is malformed, or if the class' descriptors don't fit
    /// in the interface, endpoint, or descriptor space left. A failed
    /// registration changes nothing.
    pub fn register(
        &mut self,
        class: &'a mut (dyn ClassDriver + 'a),
        function: Function,
    ) -> crate::Result<usize> {
        let index = self.count;
        let Some(slot) = self.classes.get_mut(index) else {
            warn!("Class table full");
            return Err(crate::Error::Fail);
        };
        let merged = self.descriptor.merge(
            index,
            class.fs_configuration_descriptor(),
            function,
            &mut self.alloc,
            &mut self.owners,
        )?;
        debug!(
            "Registered class {=usize}: interfaces {=u8}..{=u8}",
            index,
            merged.first_interface,
            merged.first_interface + merged.interfaces
        );
        *slot = Some(Slot {
            class,
            function,
            first_interface: merged.first_interface,
            interfaces: merged.interfaces,
            endpoints: merged.endpoints,
        });
        self.count += 1;
        Ok(index)
    }

    /// Returns the number of registered classes.
    pub fn class_count(&self) -> usize {
        self.count
    }

    /// Returns the number of interfaces in the configuration.
    pub fn interface_count(&self) -> u8 {
        self.descriptor.interface_count()
    }

    /// The composed configuration descriptor.
    pub fn descriptor(&self) -> &ComposedDescriptor {
        &self.descriptor
    }

    /// Returns the function triple of class `class`.
    pub fn function(&self, class: usize) -> Option<Function> {
        self.slot(class).map(|slot| slot.function)
    }

    /// Returns the first interface number, and the number of interfaces, of
    /// class `class`.
    pub fn interfaces(&self, class: usize) -> Option<(u8, u8)> {
        self.slot(class)
            .map(|slot| (slot.first_interface, slot.interfaces))
    }

    /// Translate class `class`' logical endpoint address into the physical
    /// address.
    ///
    /// Returns `None` if there's no such class, or if the class doesn't have
    /// that endpoint. EP0 is never translated.
    pub fn endpoint(&self, class: usize, logical: EndpointAddress) -> Option<EndpointAddress> {
        self.slot(class)?.endpoints.physical(logical)
    }

    fn slot(&self, class: usize) -> Option<&Slot<'a>> {
        self.classes.get(class)?.as_ref()
    }

    /// Call `f` for every class, with that class' view of the core.
    ///
    /// Every class is called. The result is the first error, if any.
    fn broadcast(
        &mut self,
        core: &dyn UsbCore,
        mut f: impl FnMut(&mut dyn ClassDriver, &dyn UsbCore) -> crate::Result<()>,
    ) -> crate::Result<()> {
        let mut result = Ok(());
        for slot in self.classes.iter_mut().flatten() {
            let Slot {
                class, endpoints, ..
            } = slot;
            let core = ClassCore { core, endpoints };
            result = result.and(f(&mut **class, &core));
        }
        result
    }

    /// Call `f` for class `index`, with that class' view of the core.
    fn unicast(
        &mut self,
        index: usize,
        core: &dyn UsbCore,
        f: impl FnOnce(&mut dyn ClassDriver, &dyn UsbCore) -> crate::Result<()>,
    ) -> crate::Result<()> {
        let Some(Some(slot)) = self.classes.get_mut(index) else {
            return Ok(());
        };
        let Slot {
            class, endpoints, ..
        } = slot;
        let core = ClassCore { core, endpoints };
        f(&mut **class, &core)
    }

    /// Route an endpoint event to its owner, with the owner's endpoint
    /// number.
    fn route(
        &mut self,
        core: &dyn UsbCore,
        ep: EndpointAddress,
        f: impl FnOnce(&mut dyn ClassDriver, &dyn UsbCore, EndpointAddress) -> crate::Result<()>,
    ) -> crate::Result<()> {
        match self.owners.endpoint(ep) {
            Some(owner) => self.unicast(owner.class, core, |class, core| {
                f(class, core, owner.logical)
            }),
            None => {
                trace!("No owner for endpoint {=u8:#x}", u8::from(ep));
                Ok(())
            }
        }
    }
}

impl ClassDriver for Composite<'_> {
    fn init(&mut self, core: &dyn UsbCore, config: u8) -> crate::Result<()> {
        self.broadcast(core, |class, core| class.init(core, config))
    }

    fn deinit(&mut self, core: &dyn UsbCore, config: u8) -> crate::Result<()> {
        self.broadcast(core, |class, core| class.deinit(core, config))
    }

    fn setup(&mut self, core: &dyn UsbCore, req: &Request) -> crate::Result<()> {
        let owner = match req.recipient {
            Recipient::Interface => self.owners.interface(req.index as u8),
            Recipient::Endpoint => self
                .owners
                .endpoint(EndpointAddress::from(req.index as u8))
                .map(|owner| owner.class),
            _ => None,
        };
        match owner {
            Some(index) => self.unicast(index, core, |class, core| class.setup(core, req)),
            None => {
                trace!("Setup request {=u8} has no owner", req.request);
                Ok(())
            }
        }
    }

    fn ep0_tx_sent(&mut self, core: &dyn UsbCore) -> crate::Result<()> {
        self.broadcast(core, |class, core| class.ep0_tx_sent(core))
    }

    fn ep0_rx_ready(&mut self, core: &dyn UsbCore) -> crate::Result<()> {
        self.broadcast(core, |class, core| class.ep0_rx_ready(core))
    }

    fn data_in(&mut self, core: &dyn UsbCore, ep: EndpointAddress) -> crate::Result<()> {
        self.route(core, ep, |class, core, ep| class.data_in(core, ep))
    }

    fn data_out(&mut self, core: &dyn UsbCore, ep: EndpointAddress) -> crate::Result<()> {
        self.route(core, ep, |class, core, ep| class.data_out(core, ep))
    }

    fn sof(&mut self, core: &dyn UsbCore) -> crate::Result<()> {
        self.broadcast(core, |class, core| class.sof(core))
    }

    fn iso_in_incomplete(&mut self, core: &dyn UsbCore, ep: EndpointAddress) -> crate::Result<()> {
        self.route(core, ep, |class, core, ep| class.iso_in_incomplete(core, ep))
    }

    fn iso_out_incomplete(
        &mut self,
        core: &dyn UsbCore,
        ep: EndpointAddress,
    ) -> crate::Result<()> {
        self.route(core, ep, |class, core, ep| class.iso_out_incomplete(core, ep))
    }

    fn fs_configuration_descriptor(&self) -> &[u8] {
        self.descriptor.as_bytes()
    }

    fn hs_configuration_descriptor(&self) -> &[u8] {
        self.descriptor.as_bytes()
    }

    fn other_speed_configuration_descriptor(&self) -> &[u8] {
        self.descriptor.as_bytes()
    }

    fn device_qualifier_descriptor(&self) -> Option<&[u8]> {
        Some(&DEVICE_QUALIFIER)
    }
}
