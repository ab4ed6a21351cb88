//! USB class driver callbacks
//!
//! A [`ClassDriver`] is the callback table that the device core invokes for a
//! class function. Endpoint numbers passed to a class are always the class'
//! own logical numbers; the composite device translates them before and after
//! each call.

use crate::usbcore::UsbCore;
use usb_device::{control::Request, endpoint::EndpointAddress};

/// A USB class function
///
/// Only [`init`](ClassDriver::init), [`deinit`](ClassDriver::deinit) and
/// [`fs_configuration_descriptor`](ClassDriver::fs_configuration_descriptor)
/// are required. The remaining callbacks default to accepting the event and
/// doing nothing.
pub trait ClassDriver {
    /// The host selected configuration `config`.
    fn init(&mut self, core: &dyn UsbCore, config: u8) -> crate::Result<()>;

    /// The configuration was cleared, or the bus was reset.
    fn deinit(&mut self, core: &dyn UsbCore, config: u8) -> crate::Result<()>;

    /// A SETUP request addressed to one of this class' interfaces or endpoints.
    fn setup(&mut self, core: &dyn UsbCore, req: &Request) -> crate::Result<()> {
        let _ = (core, req);
        Ok(())
    }

    /// The IN data stage of a control transfer completed.
    fn ep0_tx_sent(&mut self, core: &dyn UsbCore) -> crate::Result<()> {
        let _ = core;
        Ok(())
    }

    /// The OUT data stage of a control transfer completed.
    fn ep0_rx_ready(&mut self, core: &dyn UsbCore) -> crate::Result<()> {
        let _ = core;
        Ok(())
    }

    /// An IN transfer on `ep` completed.
    fn data_in(&mut self, core: &dyn UsbCore, ep: EndpointAddress) -> crate::Result<()> {
        let _ = (core, ep);
        Ok(())
    }

    /// An OUT transfer on `ep` completed.
    fn data_out(&mut self, core: &dyn UsbCore, ep: EndpointAddress) -> crate::Result<()> {
        let _ = (core, ep);
        Ok(())
    }

    /// Start of frame.
    fn sof(&mut self, core: &dyn UsbCore) -> crate::Result<()> {
        let _ = core;
        Ok(())
    }

    /// An isochronous IN transfer on `ep` wasn't completed in its frame.
    fn iso_in_incomplete(&mut self, core: &dyn UsbCore, ep: EndpointAddress) -> crate::Result<()> {
        let _ = (core, ep);
        Ok(())
    }

    /// An isochronous OUT transfer on `ep` wasn't completed in its frame.
    fn iso_out_incomplete(
        &mut self,
        core: &dyn UsbCore,
        ep: EndpointAddress,
    ) -> crate::Result<()> {
        let _ = (core, ep);
        Ok(())
    }

    /// The full-speed configuration descriptor block.
    ///
    /// The block starts with a configuration descriptor header. This is the
    /// block that the composite device merges into its own configuration.
    fn fs_configuration_descriptor(&self) -> &[u8];

    /// The high-speed configuration descriptor block.
    fn hs_configuration_descriptor(&self) -> &[u8] {
        self.fs_configuration_descriptor()
    }

    /// The other-speed configuration descriptor block.
    fn other_speed_configuration_descriptor(&self) -> &[u8] {
        self.fs_configuration_descriptor()
    }

    /// The device qualifier descriptor, if the class provides one.
    fn device_qualifier_descriptor(&self) -> Option<&[u8]> {
        None
    }
}
