//! USB device-core interface
//!
//! The class drivers in this crate don't touch USB hardware. They call into
//! a device core that owns enumeration, the control pipe, and the endpoint
//! primitives. Implement [`UsbCore`] for your device core, then hand the
//! [`Composite`](crate::composite::Composite) to it as the single class that
//! it drives.
//!
//! Every method takes `&self`. A device core that's shared between an
//! interrupt handler and a task must provide its own interior mutability,
//! like a bus adapter that guards its peripheral with a critical section.

use usb_device::endpoint::{EndpointAddress, EndpointType};

/// Negotiated bus speed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speed {
    /// 12 Mbit/s, 64 byte bulk packets
    Full,
    /// 480 Mbit/s, 512 byte bulk packets
    High,
}

/// USB device-core primitives used by class drivers
pub trait UsbCore {
    /// Returns the speed negotiated during the last bus reset.
    fn speed(&self) -> Speed;

    /// Open an endpoint for transfers.
    fn open_endpoint(
        &self,
        ep: EndpointAddress,
        ep_type: EndpointType,
        max_packet_size: u16,
    ) -> crate::Result<()>;

    /// Close a previously opened endpoint.
    fn close_endpoint(&self, ep: EndpointAddress) -> crate::Result<()>;

    /// Start an IN transfer of `data` on `ep`.
    ///
    /// The core copies `data` into endpoint memory before returning. Completion
    /// is reported later through
    /// [`ClassDriver::data_in`](crate::class::ClassDriver::data_in).
    fn transmit(&self, ep: EndpointAddress, data: &[u8]) -> crate::Result<()>;

    /// Arm `ep` to receive the next OUT packet of at most `max_len` bytes.
    ///
    /// The endpoint NAKs the host until it's armed.
    fn prepare_receive(&self, ep: EndpointAddress, max_len: usize) -> crate::Result<()>;

    /// Copy the data of the last completed OUT transfer on `ep` into `buf`.
    ///
    /// Returns the number of bytes copied.
    fn read(&self, ep: EndpointAddress, buf: &mut [u8]) -> usize;

    /// Send `data` in the data stage of the current control transfer.
    fn control_send(&self, data: &[u8]) -> crate::Result<()>;

    /// Expect `len` bytes in the OUT data stage of the current control transfer.
    ///
    /// Completion is reported through
    /// [`ClassDriver::ep0_rx_ready`](crate::class::ClassDriver::ep0_rx_ready).
    fn control_prepare_receive(&self, len: usize) -> crate::Result<()>;

    /// Copy the data received in the last control OUT data stage into `buf`.
    fn control_read(&self, buf: &mut [u8]) -> usize;

    /// Translate a class' logical endpoint address into the address used on
    /// the wire.
    ///
    /// A plain device core returns `ep` unchanged. The composite device wraps
    /// the core to apply its endpoint renumbering.
    fn physical(&self, ep: EndpointAddress) -> EndpointAddress {
        ep
    }
}

impl<C: UsbCore + ?Sized> UsbCore for &C {
    fn speed(&self) -> Speed {
        (**self).speed()
    }
    fn open_endpoint(
        &self,
        ep: EndpointAddress,
        ep_type: EndpointType,
        max_packet_size: u16,
    ) -> crate::Result<()> {
        (**self).open_endpoint(ep, ep_type, max_packet_size)
    }
    fn close_endpoint(&self, ep: EndpointAddress) -> crate::Result<()> {
        (**self).close_endpoint(ep)
    }
    fn transmit(&self, ep: EndpointAddress, data: &[u8]) -> crate::Result<()> {
        (**self).transmit(ep, data)
    }
    fn prepare_receive(&self, ep: EndpointAddress, max_len: usize) -> crate::Result<()> {
        (**self).prepare_receive(ep, max_len)
    }
    fn read(&self, ep: EndpointAddress, buf: &mut [u8]) -> usize {
        (**self).read(ep, buf)
    }
    fn control_send(&self, data: &[u8]) -> crate::Result<()> {
        (**self).control_send(data)
    }
    fn control_prepare_receive(&self, len: usize) -> crate::Result<()> {
        (**self).control_prepare_receive(len)
    }
    fn control_read(&self, buf: &mut [u8]) -> usize {
        (**self).control_read(buf)
    }
    fn physical(&self, ep: EndpointAddress) -> EndpointAddress {
        (**self).physical(ep)
    }
}
