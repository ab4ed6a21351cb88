//! USB RNDIS Ethernet for microcontrollers
//!
//! `usbd-rndis` turns a USB device into a network adapter that the host sees
//! as a Remote NDIS Ethernet interface. It has three parts:
//!
//! - [`rndis`], the RNDIS class driver. It answers the host's control
//!   messages, and moves Ethernet frames over a pair of bulk endpoints.
//! - [`composite`], a multiplexer that presents several class drivers to the
//!   device core as one, so RNDIS can share the device with, for instance, a
//!   serial port.
//! - [`netif`], the glue between the RNDIS link and an embedded TCP/IP stack
//!   running under an RTOS.
//!
//! The crate doesn't drive USB hardware. Implement [`usbcore::UsbCore`] for
//! your device core, and call the [`class::ClassDriver`] callbacks of the
//! [`Composite`](composite::Composite), or of a lone class, from the core's
//! event handlers. Endpoint types, requests, and descriptor constants come
//! from [`usb-device`].
//!
//! [`usb-device`]: https://crates.io/crates/usb-device

#![no_std]

#[macro_use]
mod log;

pub mod class;
pub mod composite;
pub mod netif;
pub mod rndis;
pub mod usbcore;

#[cfg(test)]
mod mock;

use usb_device::UsbError;

/// Errors reported by class drivers and the device core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The operation failed, and retrying won't help.
    Fail,
    /// The resource is in use. Try again later.
    Busy,
}

/// Result of class and core operations
pub type Result<T> = core::result::Result<T, Error>;

impl From<Error> for UsbError {
    fn from(err: Error) -> Self {
        match err {
            Error::Busy => UsbError::WouldBlock,
            Error::Fail => UsbError::InvalidState,
        }
    }
}

impl From<UsbError> for Error {
    fn from(err: UsbError) -> Self {
        match err {
            UsbError::WouldBlock => Error::Busy,
            _ => Error::Fail,
        }
    }
}
