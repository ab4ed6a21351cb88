//! RNDIS Ethernet function
//!
//! [`Rndis`] is the class driver. It answers the host's RNDIS control
//! messages on EP0, and moves data messages over a bulk endpoint pair. The
//! frames themselves are exchanged with a network stack through
//! [`netif`](crate::netif), in task context; [`RndisState`] is the state
//! shared between the class, running in the USB interrupt, and those tasks.
//!
//! The function has a communications interface, with an interrupt IN
//! endpoint for notifications, and a data interface, with bulk IN and bulk
//! OUT endpoints. Register it with a [`Composite`](crate::composite::Composite)
//! using [`Rndis::FUNCTION`].

mod bridge;
mod control;
pub mod message;
pub mod state;

pub use control::{ControlEngine, LinkEvents, Transaction};
pub use message::{MacOptions, DATA_HEADER_LEN};
pub use state::{
    Link, LinkState, RndisState, Statistics, DEFAULT_RX_CAPACITY, DEFAULT_TX_CAPACITY,
};

use crate::{
    class::ClassDriver,
    composite::Function,
    netif::Rtos,
    usbcore::{Speed, UsbCore},
};
use bridge::Received;
use usb_device::{
    control::{Request, RequestType},
    descriptor::descriptor_type,
    endpoint::{EndpointAddress, EndpointType},
    UsbDirection,
};

/// Bulk packet size at full speed
pub const FS_MAX_PACKET: usize = 64;
/// Bulk packet size at high speed
pub const HS_MAX_PACKET: usize = 512;
/// Notification endpoint packet size
pub const CMD_PACKET: usize = 8;
/// Largest control transfer data stage
pub const CONTROL_BUFFER: usize = 512;

/// Bulk IN endpoint, as numbered in the descriptors
const BULK_IN: u8 = 0x81;
/// Bulk OUT endpoint, as numbered in the descriptors
const BULK_OUT: u8 = 0x01;
/// Interrupt IN notification endpoint, as numbered in the descriptors
const COMMAND: u8 = 0x82;

/// Wireless controller, RF controller, RNDIS
const CLASS: u8 = 0xE0;
const SUBCLASS: u8 = 0x01;
const PROTOCOL: u8 = 0x03;
/// CDC data
const DATA_CLASS: u8 = 0x0A;

/// Notification endpoint polling interval, in frames
const COMMAND_INTERVAL: u8 = 8;

const FS_CONFIGURATION_LEN: usize = 67;
const IAD_CONFIGURATION_LEN: usize = 66;

/// The function after its interface association: both interfaces and their
/// endpoints.
macro_rules! function_descriptors {
    ($bulk_lo:expr, $bulk_hi:expr) => {
        [
            // Communications interface
            0x09, descriptor_type::INTERFACE, 0x00, 0x00, 0x01, CLASS, SUBCLASS, PROTOCOL, 0x00,
            // Header functional descriptor, CDC 1.10
            0x05, 0x24, 0x00, 0x10, 0x01,
            // Call management functional descriptor, data interface 1
            0x05, 0x24, 0x01, 0x00, 0x01,
            // Abstract control management functional descriptor
            0x04, 0x24, 0x02, 0x00,
            // Union functional descriptor, master 0, slave 1
            0x05, 0x24, 0x06, 0x00, 0x01,
            // Notification endpoint
            0x07, descriptor_type::ENDPOINT, COMMAND, 0x03, CMD_PACKET as u8, 0x00, COMMAND_INTERVAL,
            // Data interface
            0x09, descriptor_type::INTERFACE, 0x01, 0x00, 0x02, DATA_CLASS, 0x00, 0x00, 0x00,
            // Bulk IN
            0x07, descriptor_type::ENDPOINT, BULK_IN, 0x02, $bulk_lo, $bulk_hi, 0x00,
            // Bulk OUT
            0x07, descriptor_type::ENDPOINT, BULK_OUT, 0x02, $bulk_lo, $bulk_hi, 0x00,
        ]
    };
}

const fn concat<const A: usize, const B: usize, const N: usize>(
    a: [u8; A],
    b: [u8; B],
) -> [u8; N] {
    let mut out = [0; N];
    let mut i = 0;
    while i < A {
        out[i] = a[i];
        i += 1;
    }
    while i < N {
        out[i] = b[i - A];
        i += 1;
    }
    out
}

const FS_FUNCTION: [u8; 58] = function_descriptors!(0x40, 0x00);
const HS_FUNCTION: [u8; 58] = function_descriptors!(0x00, 0x02);

const CONFIGURATION_HEADER: [u8; 9] = [
    0x09,
    descriptor_type::CONFIGURATION,
    FS_CONFIGURATION_LEN as u8,
    0x00,
    0x02, // bNumInterfaces
    0x01, // bConfigurationValue
    0x00, // iConfiguration
    0xC0, // Self powered
    0xFA, // 500 mA
];

const IAD: [u8; 8] = [
    0x08,
    descriptor_type::IAD,
    0x00, // bFirstInterface
    0x02, // bInterfaceCount
    CLASS,
    SUBCLASS,
    PROTOCOL,
    0x00,
];

/// Full-speed configuration, as if the function owned the device
pub const FS_CONFIGURATION: [u8; FS_CONFIGURATION_LEN] = concat(CONFIGURATION_HEADER, FS_FUNCTION);

/// High-speed function block, with 512 byte bulk endpoints
pub const HS_CONFIGURATION: [u8; IAD_CONFIGURATION_LEN] = concat(IAD, HS_FUNCTION);

/// Other-speed function block: the full-speed function, for a device running
/// at high speed.
pub const OTHER_SPEED_CONFIGURATION: [u8; IAD_CONFIGURATION_LEN] = concat(IAD, FS_FUNCTION);

/// Device qualifier
///
/// USB 2.0, miscellaneous class with interface association, 64 byte EP0,
/// one other-speed configuration.
pub const DEVICE_QUALIFIER: [u8; 10] = [0x0A, 0x06, 0x00, 0x02, 0xEF, 0x02, 0x01, 0x40, 0x01, 0x00];

/// Device identity, reported to the host
///
/// ```
/// use usbd_rndis::rndis::Config;
///
/// const CONFIG: Config = Config::new()
///     .with_vendor_description("Sensor hub")
///     .with_device_id([0x12, 0x34, 0x56]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub(crate) vendor_id: u32,
    pub(crate) vendor_description: &'static str,
    pub(crate) device_id: [u8; 3],
    pub(crate) permanent_address: [u8; 6],
    pub(crate) link_speed: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// The default identity.
    pub const fn new() -> Self {
        Self {
            vendor_id: 0x0075_7840,
            vendor_description: "IMBEL TPP-1400",
            device_id: [0; 3],
            permanent_address: [0x40, 0x78, 0x75, 0xDD, 0xEE, 0xFF],
            link_speed: 1000,
        }
    }

    /// Set the IEEE OUI. Only the low 24 bits are used, and they're also the
    /// first three bytes of the current MAC address, least significant byte
    /// first.
    pub const fn with_vendor_id(mut self, oui: u32) -> Self {
        self.vendor_id = oui & 0x00FF_FFFF;
        self
    }

    /// Set the vendor description string.
    pub const fn with_vendor_description(mut self, description: &'static str) -> Self {
        self.vendor_description = description;
        self
    }

    /// Set the last three bytes of the current MAC address, usually taken
    /// from the MCU's unique ID.
    pub const fn with_device_id(mut self, id: [u8; 3]) -> Self {
        self.device_id = id;
        self
    }

    /// Set the permanent MAC address.
    pub const fn with_permanent_address(mut self, address: [u8; 6]) -> Self {
        self.permanent_address = address;
        self
    }

    /// Set the reported link speed, in units of 100 bit/s.
    pub const fn with_link_speed(mut self, speed: u32) -> Self {
        self.link_speed = speed;
        self
    }

    /// The current MAC address: the vendor OUI, then the device ID.
    pub const fn current_address(&self) -> [u8; 6] {
        let oui = self.vendor_id.to_le_bytes();
        let id = self.device_id;
        [oui[0], oui[1], oui[2], id[0], id[1], id[2]]
    }
}

/// A control OUT data stage that the class is waiting for
#[derive(Debug, Clone, Copy)]
struct Pending {
    request: u8,
    len: usize,
}

/// The RNDIS class driver
pub struct Rndis<'a, const RX: usize = DEFAULT_RX_CAPACITY, const TX: usize = DEFAULT_TX_CAPACITY>
{
    state: &'a RndisState<RX, TX>,
    rtos: &'a dyn Rtos,
    events: &'a dyn LinkEvents,
    config: Config,
    engine: ControlEngine,
    control: [u8; CONTROL_BUFFER],
    pending: Option<Pending>,
}

impl<'a, const RX: usize, const TX: usize> Rndis<'a, RX, TX> {
    /// Function class triple for the interface association descriptor.
    pub const FUNCTION: Function = Function::new(CLASS, SUBCLASS, PROTOCOL);

    /// Create the class.
    ///
    /// `events` learns when the host takes the link down; that's usually the
    /// network stack. `rtos` wakes the receive task.
    pub fn new(
        state: &'a RndisState<RX, TX>,
        rtos: &'a dyn Rtos,
        events: &'a dyn LinkEvents,
        config: Config,
    ) -> Self {
        Self {
            state,
            rtos,
            events,
            config,
            engine: ControlEngine::new(),
            control: [0; CONTROL_BUFFER],
            pending: None,
        }
    }

    /// The shared state.
    pub fn state(&self) -> &'a RndisState<RX, TX> {
        self.state
    }

    /// The device identity.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The control message state machine.
    pub fn engine(&self) -> &ControlEngine {
        &self.engine
    }

    fn disconnect(&self) {
        self.state.link().disconnect();
        self.events.network_down();
    }

    /// Run a class request that has a host-to-device data stage, or none.
    fn command(&mut self, core: &dyn UsbCore, request: u8, len: usize) -> crate::Result<()> {
        if request != message::SEND_ENCAPSULATED_COMMAND {
            trace!("Ignored RNDIS class request {=u8}", request);
            return Ok(());
        }
        let msg = &self.control[..len.min(CONTROL_BUFFER)];
        if self.engine.command(msg, self.state.link(), self.events) {
            core.transmit(
                EndpointAddress::from(COMMAND),
                &message::RESPONSE_AVAILABLE,
            )?;
        }
        Ok(())
    }

    fn class_setup(&mut self, core: &dyn UsbCore, req: &Request) -> crate::Result<()> {
        let len = usize::from(req.length);
        if len == 0 {
            return self.command(core, req.request, 0);
        }
        match req.direction {
            UsbDirection::In => {
                let written = if req.request == message::GET_ENCAPSULATED_RESPONSE {
                    self.engine
                        .response(&mut self.control, self.state.link(), &self.config)
                } else {
                    0
                };
                core.control_send(&self.control[..written.min(len)])
            }
            UsbDirection::Out => {
                if len > CONTROL_BUFFER {
                    warn!("Control OUT of {=usize} bytes doesn't fit", len);
                    self.pending = None;
                    return Err(crate::Error::Fail);
                }
                self.pending = Some(Pending {
                    request: req.request,
                    len,
                });
                core.control_prepare_receive(len)
            }
        }
    }
}

impl<const RX: usize, const TX: usize> ClassDriver for Rndis<'_, RX, TX> {
    fn init(&mut self, core: &dyn UsbCore, _: u8) -> crate::Result<()> {
        let max_packet = match core.speed() {
            Speed::High => HS_MAX_PACKET,
            Speed::Full => FS_MAX_PACKET,
        };
        let bulk_in = EndpointAddress::from(BULK_IN);
        let bulk_out = EndpointAddress::from(BULK_OUT);
        core.open_endpoint(bulk_in, EndpointType::Bulk, max_packet as u16)?;
        core.open_endpoint(bulk_out, EndpointType::Bulk, max_packet as u16)?;
        core.open_endpoint(
            EndpointAddress::from(COMMAND),
            EndpointType::Interrupt,
            CMD_PACKET as u16,
        )?;
        self.state
            .set_endpoints(core.physical(bulk_in), core.physical(bulk_out), max_packet);
        debug!("RNDIS init, {=usize} byte bulk packets", max_packet);

        self.engine = ControlEngine::new();
        self.pending = None;
        self.state.reset_receive();
        self.disconnect();
        self.state.link().set_tx_busy(false);

        core.prepare_receive(bulk_out, max_packet)
    }

    fn deinit(&mut self, core: &dyn UsbCore, _: u8) -> crate::Result<()> {
        let result = core
            .close_endpoint(EndpointAddress::from(BULK_IN))
            .and(core.close_endpoint(EndpointAddress::from(BULK_OUT)))
            .and(core.close_endpoint(EndpointAddress::from(COMMAND)));
        self.pending = None;
        self.state.reset_receive();
        self.disconnect();
        debug!("RNDIS deinit");
        result
    }

    fn setup(&mut self, core: &dyn UsbCore, req: &Request) -> crate::Result<()> {
        match req.request_type {
            RequestType::Class => self.class_setup(core, req),
            RequestType::Standard => match req.request {
                Request::GET_INTERFACE => core.control_send(&[0]),
                _ => Ok(()),
            },
            _ => Ok(()),
        }
    }

    fn ep0_rx_ready(&mut self, core: &dyn UsbCore) -> crate::Result<()> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        let len = core.control_read(&mut self.control[..pending.len]);
        self.command(core, pending.request, len)
    }

    fn data_in(&mut self, _: &dyn UsbCore, ep: EndpointAddress) -> crate::Result<()> {
        if ep == EndpointAddress::from(BULK_IN) {
            self.state.transmit_complete();
        }
        Ok(())
    }

    fn data_out(&mut self, core: &dyn UsbCore, ep: EndpointAddress) -> crate::Result<()> {
        if ep != EndpointAddress::from(BULK_OUT) {
            return Ok(());
        }
        let max_packet = self.state.max_packet().min(HS_MAX_PACKET);
        let mut packet = [0; HS_MAX_PACKET];
        let len = core.read(ep, &mut packet[..max_packet]);
        let rtos = self.rtos;
        match self
            .state
            .receive(&packet[..len], max_packet, || rtos.now_us())
        {
            Received::Complete => {
                if rtos.notify_from_isr() {
                    rtos.yield_from_isr();
                }
                Ok(())
            }
            Received::Partial | Received::Dropped => core.prepare_receive(ep, max_packet),
        }
    }

    fn fs_configuration_descriptor(&self) -> &[u8] {
        &FS_CONFIGURATION
    }

    fn hs_configuration_descriptor(&self) -> &[u8] {
        &HS_CONFIGURATION
    }

    fn other_speed_configuration_descriptor(&self) -> &[u8] {
        &OTHER_SPEED_CONFIGURATION
    }

    fn device_qualifier_descriptor(&self) -> Option<&[u8]> {
        Some(&DEVICE_QUALIFIER)
    }
}
