//! Test doubles for the device core, the network stack, and the RTOS.

extern crate std;

use core::cell::{Cell, RefCell};
use std::vec::Vec;

use crate::{
    class::ClassDriver,
    netif::{NetworkBuffer, NetworkStack, Rtos},
    rndis::LinkEvents,
    usbcore::{Speed, UsbCore},
};
use usb_device::endpoint::{EndpointAddress, EndpointType};

/// A call into the device core
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Open(EndpointAddress, EndpointType, u16),
    Close(EndpointAddress),
    Transmit(EndpointAddress, Vec<u8>),
    PrepareReceive(EndpointAddress, usize),
    ControlSend(Vec<u8>),
    ControlPrepareReceive(usize),
}

/// Records every call, and serves canned OUT data
pub struct MockCore {
    speed: Cell<Speed>,
    events: RefCell<Vec<Event>>,
    out_data: RefCell<Vec<u8>>,
    control_data: RefCell<Vec<u8>>,
    fail_transmit: Cell<bool>,
}

impl MockCore {
    pub fn new() -> Self {
        Self {
            speed: Cell::new(Speed::Full),
            events: RefCell::new(Vec::new()),
            out_data: RefCell::new(Vec::new()),
            control_data: RefCell::new(Vec::new()),
            fail_transmit: Cell::new(false),
        }
    }
    pub fn set_speed(&self, speed: Speed) {
        self.speed.set(speed);
    }
    pub fn fail_transmit(&self, fail: bool) {
        self.fail_transmit.set(fail);
    }
    /// The data returned by the next `read`.
    pub fn set_out_data(&self, data: &[u8]) {
        *self.out_data.borrow_mut() = data.to_vec();
    }
    /// The data returned by the next `control_read`.
    pub fn set_control_data(&self, data: &[u8]) {
        *self.control_data.borrow_mut() = data.to_vec();
    }
    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }
    pub fn clear(&self) {
        self.events.borrow_mut().clear();
    }
    /// Everything transmitted on `ep`.
    pub fn transmitted(&self, ep: EndpointAddress) -> Vec<Vec<u8>> {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match event {
                Event::Transmit(addr, data) if *addr == ep => Some(data.clone()),
                _ => None,
            })
            .collect()
    }
    /// How many times `ep` was armed.
    pub fn prepared(&self, ep: EndpointAddress) -> usize {
        self.events
            .borrow()
            .iter()
            .filter(|event| matches!(event, Event::PrepareReceive(addr, _) if *addr == ep))
            .count()
    }
    /// Everything sent in control IN data stages.
    pub fn control_sent(&self) -> Vec<Vec<u8>> {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match event {
                Event::ControlSend(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }
    fn record(&self, event: Event) {
        self.events.borrow_mut().push(event);
    }
}

impl UsbCore for MockCore {
    fn speed(&self) -> Speed {
        self.speed.get()
    }
    fn open_endpoint(
        &self,
        ep: EndpointAddress,
        ep_type: EndpointType,
        max_packet_size: u16,
    ) -> crate::Result<()> {
        self.record(Event::Open(ep, ep_type, max_packet_size));
        Ok(())
    }
    fn close_endpoint(&self, ep: EndpointAddress) -> crate::Result<()> {
        self.record(Event::Close(ep));
        Ok(())
    }
    fn transmit(&self, ep: EndpointAddress, data: &[u8]) -> crate::Result<()> {
        if self.fail_transmit.get() {
            return Err(crate::Error::Fail);
        }
        self.record(Event::Transmit(ep, data.to_vec()));
        Ok(())
    }
    fn prepare_receive(&self, ep: EndpointAddress, max_len: usize) -> crate::Result<()> {
        self.record(Event::PrepareReceive(ep, max_len));
        Ok(())
    }
    fn read(&self, _: EndpointAddress, buf: &mut [u8]) -> usize {
        let data = self.out_data.borrow();
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        len
    }
    fn control_send(&self, data: &[u8]) -> crate::Result<()> {
        self.record(Event::ControlSend(data.to_vec()));
        Ok(())
    }
    fn control_prepare_receive(&self, len: usize) -> crate::Result<()> {
        self.record(Event::ControlPrepareReceive(len));
        Ok(())
    }
    fn control_read(&self, buf: &mut [u8]) -> usize {
        let data = self.control_data.borrow();
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        len
    }
}

/// A network stack buffer
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MockBuffer {
    data: Vec<u8>,
}

impl From<&[u8]> for MockBuffer {
    fn from(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
        }
    }
}

impl NetworkBuffer for MockBuffer {
    fn data(&self) -> &[u8] {
        &self.data
    }
    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// A network stack that keeps every frame it accepts
#[derive(Default)]
pub struct MockStack {
    pub out_of_buffers: Cell<bool>,
    pub reject: Cell<bool>,
    pub queue_full: Cell<bool>,
    pub received: RefCell<Vec<Vec<u8>>>,
    pub released: Cell<usize>,
    pub downs: Cell<usize>,
}

impl MockStack {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LinkEvents for MockStack {
    fn network_down(&self) {
        self.downs.set(self.downs.get() + 1);
    }
}

impl NetworkStack for MockStack {
    type Buffer = MockBuffer;
    fn allocate(&self, len: usize) -> Option<MockBuffer> {
        (!self.out_of_buffers.get()).then(|| MockBuffer {
            data: std::vec![0; len],
        })
    }
    fn release(&self, _: MockBuffer) {
        self.released.set(self.released.get() + 1);
    }
    fn consider_frame(&self, _: &[u8]) -> bool {
        !self.reject.get()
    }
    fn send_rx_event(&self, buffer: MockBuffer) -> Result<(), MockBuffer> {
        if self.queue_full.get() {
            return Err(buffer);
        }
        self.received.borrow_mut().push(buffer.data);
        Ok(())
    }
}

/// Counts notifications, yields, and delays
#[derive(Default)]
pub struct MockRtos {
    pub now: Cell<u64>,
    pub notified: Cell<usize>,
    pub higher_priority_woken: Cell<bool>,
    pub yields: Cell<usize>,
    pub delays: RefCell<Vec<u32>>,
    pub spawned: Cell<usize>,
    pub spawn_fails: Cell<bool>,
}

impl MockRtos {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Rtos for MockRtos {
    fn now_us(&self) -> u64 {
        self.now.get()
    }
    fn notify_from_isr(&self) -> bool {
        self.notified.set(self.notified.get() + 1);
        self.higher_priority_woken.get()
    }
    fn yield_from_isr(&self) {
        self.yields.set(self.yields.get() + 1);
    }
    fn wait_notification(&self) {}
    fn delay(&self, ticks: u32) {
        self.delays.borrow_mut().push(ticks);
    }
    fn spawn_receive_task(&self) -> bool {
        if self.spawn_fails.get() {
            return false;
        }
        self.spawned.set(self.spawned.get() + 1);
        true
    }
}

/// A vendor class with two interfaces and three endpoints
///
/// Interface 0 has bulk IN 0x81 and interrupt IN 0x82. Interface 1 has bulk
/// OUT 0x01. Records every callback.
#[derive(Default)]
pub struct TestClass {
    pub calls: Vec<&'static str>,
    pub endpoints: Vec<(&'static str, EndpointAddress)>,
    pub physical_in: Option<EndpointAddress>,
    pub fail: bool,
}

impl TestClass {
    const DESCRIPTOR: [u8; 48] = [
        0x09, 0x02, 0x30, 0x00, 0x02, 0x01, 0x00, 0x80, 0x32, //
        0x09, 0x04, 0x00, 0x00, 0x02, 0xFF, 0x00, 0x00, 0x00, //
        0x07, 0x05, 0x81, 0x02, 0x40, 0x00, 0x00, //
        0x07, 0x05, 0x82, 0x03, 0x08, 0x00, 0x01, //
        0x09, 0x04, 0x01, 0x00, 0x01, 0xFF, 0x00, 0x00, 0x00, //
        0x07, 0x05, 0x01, 0x02, 0x40, 0x00, 0x00, //
    ];

    fn call(&mut self, name: &'static str) -> crate::Result<()> {
        self.calls.push(name);
        if self.fail {
            Err(crate::Error::Fail)
        } else {
            Ok(())
        }
    }

    fn endpoint(&mut self, name: &'static str, ep: EndpointAddress) -> crate::Result<()> {
        self.endpoints.push((name, ep));
        self.call(name)
    }
}

impl ClassDriver for TestClass {
    fn init(&mut self, core: &dyn UsbCore, _: u8) -> crate::Result<()> {
        core.open_endpoint(EndpointAddress::from(0x81), EndpointType::Bulk, 64)?;
        core.open_endpoint(EndpointAddress::from(0x01), EndpointType::Bulk, 64)?;
        core.open_endpoint(EndpointAddress::from(0x82), EndpointType::Interrupt, 8)?;
        self.physical_in = Some(core.physical(EndpointAddress::from(0x81)));
        self.call("init")
    }
    fn deinit(&mut self, _: &dyn UsbCore, _: u8) -> crate::Result<()> {
        self.call("deinit")
    }
    fn setup(
        &mut self,
        _: &dyn UsbCore,
        _: &usb_device::control::Request,
    ) -> crate::Result<()> {
        self.call("setup")
    }
    fn ep0_rx_ready(&mut self, _: &dyn UsbCore) -> crate::Result<()> {
        self.call("ep0_rx_ready")
    }
    fn sof(&mut self, _: &dyn UsbCore) -> crate::Result<()> {
        self.call("sof")
    }
    fn data_in(&mut self, _: &dyn UsbCore, ep: EndpointAddress) -> crate::Result<()> {
        self.endpoint("data_in", ep)
    }
    fn data_out(&mut self, core: &dyn UsbCore, ep: EndpointAddress) -> crate::Result<()> {
        // Echo on the class' own bulk IN
        core.transmit(EndpointAddress::from(0x81), &[0x01])?;
        self.endpoint("data_out", ep)
    }
    fn iso_in_incomplete(&mut self, _: &dyn UsbCore, ep: EndpointAddress) -> crate::Result<()> {
        self.endpoint("iso_in_incomplete", ep)
    }
    fn fs_configuration_descriptor(&self) -> &[u8] {
        &Self::DESCRIPTOR
    }
}
