//! Network stack glue
//!
//! The RNDIS function is an Ethernet interface for an embedded TCP/IP stack.
//! Implement [`NetworkStack`] for the stack's buffer and event APIs, and
//! [`Rtos`] for the task primitives, then
//!
//! - call [`NetworkInterface::initialise`] from the stack's interface
//!   initialization hook, until it returns `true`,
//! - call [`NetworkInterface::output`] or
//!   [`NetworkInterface::output_and_release`] from the stack's output hook,
//! - run a [`ReceiveTask`] in its own task, and have
//!   [`Rtos::spawn_receive_task`] start that task.
//!
//! ```no_run
//! use usbd_rndis::{
//!     netif::{NetworkInterface, NetworkStack, Rtos},
//!     rndis::RndisState,
//!     usbcore::UsbCore,
//! };
//!
//! static RNDIS: RndisState = RndisState::new();
//!
//! fn output<C: UsbCore, S: NetworkStack, R: Rtos>(core: &C, stack: &S, rtos: &R, frame: &[u8]) {
//!     let netif = NetworkInterface::new(core, stack, rtos, &RNDIS);
//!     if netif.initialise() {
//!         netif.output(frame);
//!     }
//! }
//! ```

use crate::{
    rndis::{
        message::DATA_HEADER_LEN,
        state::{LinkState, RndisState, DEFAULT_RX_CAPACITY, DEFAULT_TX_CAPACITY},
        LinkEvents,
    },
    usbcore::UsbCore,
};

/// A network stack buffer, sized for one Ethernet frame
pub trait NetworkBuffer {
    /// The frame. At least as long as the size requested from
    /// [`NetworkStack::allocate`].
    fn data(&self) -> &[u8];
    /// The frame, for writing.
    fn data_mut(&mut self) -> &mut [u8];
}

/// The TCP/IP stack that sits on top of the RNDIS link
pub trait NetworkStack: LinkEvents {
    type Buffer: NetworkBuffer;

    /// Allocate a buffer for a `len` byte frame. Returns `None` if the stack
    /// is out of buffers.
    fn allocate(&self, len: usize) -> Option<Self::Buffer>;

    /// Return a buffer to the stack.
    fn release(&self, buffer: Self::Buffer);

    /// Returns `true` if the stack wants to process `frame`, after a look at
    /// its Ethernet header.
    fn consider_frame(&self, frame: &[u8]) -> bool;

    /// Hand a received frame to the stack's event queue.
    ///
    /// If the queue is full, returns the buffer.
    fn send_rx_event(&self, buffer: Self::Buffer) -> Result<(), Self::Buffer>;
}

/// Task primitives
pub trait Rtos {
    /// A free running microsecond timestamp.
    fn now_us(&self) -> u64;

    /// Wake the receive task. Called from the USB interrupt.
    ///
    /// Returns `true` if the woken task has a higher priority than the
    /// interrupted task.
    fn notify_from_isr(&self) -> bool;

    /// Switch tasks once the USB interrupt returns.
    ///
    /// By default, this pends PendSV on Cortex-M targets, and does nothing
    /// elsewhere.
    fn yield_from_isr(&self) {
        #[cfg(all(target_arch = "arm", target_os = "none"))]
        cortex_m::peripheral::SCB::set_pendsv();
    }

    /// Block the receive task until it's notified.
    fn wait_notification(&self);

    /// Block the calling task for `ticks` RTOS ticks.
    fn delay(&self, ticks: u32);

    /// Start the task that runs [`ReceiveTask::run`]. Returns `false` if the
    /// task couldn't be created.
    fn spawn_receive_task(&self) -> bool;
}

/// Attempts before [`NetworkInterface::output`] drops a frame
pub const DEFAULT_TRANSMIT_RETRIES: u8 = 5;

/// RTOS ticks between transmit attempts
pub const DEFAULT_RETRY_DELAY: u32 = 5;

/// The network stack's view of the RNDIS link
pub struct NetworkInterface<
    'a,
    C: ?Sized,
    S,
    R,
    const RX: usize = DEFAULT_RX_CAPACITY,
    const TX: usize = DEFAULT_TX_CAPACITY,
> {
    core: &'a C,
    stack: &'a S,
    rtos: &'a R,
    state: &'a RndisState<RX, TX>,
    retries: u8,
    retry_delay: u32,
}

impl<'a, C, S, R, const RX: usize, const TX: usize> NetworkInterface<'a, C, S, R, RX, TX>
where
    C: UsbCore + ?Sized,
    S: NetworkStack,
    R: Rtos,
{
    /// Create the network interface.
    ///
    /// `core` is the device core itself, not a class' view of it; the RNDIS
    /// class records its physical endpoints in `state`.
    pub fn new(core: &'a C, stack: &'a S, rtos: &'a R, state: &'a RndisState<RX, TX>) -> Self {
        Self {
            core,
            stack,
            rtos,
            state,
            retries: DEFAULT_TRANSMIT_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Make `retries` transmit attempts, `delay` ticks apart, before dropping
    /// a frame.
    pub fn with_retries(mut self, retries: u8, delay: u32) -> Self {
        self.retries = retries.max(1);
        self.retry_delay = delay;
        self
    }

    /// Bring the interface up.
    ///
    /// Returns `false` until the host initialized the RNDIS link. The first
    /// successful call starts the receive task.
    pub fn initialise(&self) -> bool {
        if self.state.link().state() != LinkState::Normal {
            return false;
        }
        if !self.state.has_consumer() {
            if !self.rtos.spawn_receive_task() {
                warn!("Couldn't start the RNDIS receive task");
                return false;
            }
            self.state.register_consumer();
            debug!("RNDIS receive task started");
        }
        true
    }

    /// Send an Ethernet frame to the host. The caller keeps the frame.
    ///
    /// Retries while the previous frame is still in flight. Returns `false`
    /// if the frame was dropped after the last retry.
    pub fn output(&self, frame: &[u8]) -> bool {
        for attempt in 0..self.retries {
            if attempt > 0 {
                self.rtos.delay(self.retry_delay);
            }
            if self.state.transmit(self.core, frame).is_ok() {
                return true;
            }
        }
        warn!("Dropped a {=usize} byte frame after {=u8} attempts", frame.len(), self.retries);
        self.state.link().count_xmit_dropped();
        false
    }

    /// Send the frame in `buffer` to the host, then release the buffer.
    pub fn output_and_release(&self, buffer: S::Buffer) -> bool {
        let sent = self.output(buffer.data());
        self.stack.release(buffer);
        sent
    }

    /// Returns `Ok` while the RNDIS link is up.
    pub fn phy_link_status(&self) -> crate::Result<()> {
        match self.state.link().state() {
            LinkState::Normal => Ok(()),
            LinkState::Halted => Err(crate::Error::Fail),
        }
    }

    /// The receive task's side of the link.
    pub fn receive_task(&self) -> ReceiveTask<'a, C, S, R, RX, TX> {
        ReceiveTask::new(self.core, self.stack, self.rtos, self.state)
    }
}

/// Moves received frames from the RNDIS link into the network stack
///
/// The USB interrupt reassembles a data message, then notifies this task.
/// The task hands the Ethernet frame to the stack, and re-arms the bulk OUT
/// endpoint for the next message.
pub struct ReceiveTask<
    'a,
    C: ?Sized,
    S,
    R,
    const RX: usize = DEFAULT_RX_CAPACITY,
    const TX: usize = DEFAULT_TX_CAPACITY,
> {
    core: &'a C,
    stack: &'a S,
    rtos: &'a R,
    state: &'a RndisState<RX, TX>,
}

impl<'a, C, S, R, const RX: usize, const TX: usize> ReceiveTask<'a, C, S, R, RX, TX>
where
    C: UsbCore + ?Sized,
    S: NetworkStack,
    R: Rtos,
{
    pub fn new(core: &'a C, stack: &'a S, rtos: &'a R, state: &'a RndisState<RX, TX>) -> Self {
        Self {
            core,
            stack,
            rtos,
            state,
        }
    }

    /// Run the task.
    pub fn run(&self) -> ! {
        loop {
            self.rtos.wait_notification();
            self.poll();
        }
    }

    /// Handle one notification.
    ///
    /// Delivers the completed data message, if there is one, then re-arms the
    /// bulk OUT endpoint.
    pub fn poll(&self) {
        if let Some(frame) = self.state.take_frame() {
            trace!(
                "RNDIS receive latency {=u64} us",
                self.rtos.now_us().wrapping_sub(frame.timestamp_us())
            );
            if frame.data().len() > DATA_HEADER_LEN {
                self.deliver(frame.payload());
            }
        }

        let ep = self.state.bulk_out();
        if self.core.prepare_receive(ep, self.state.max_packet()).is_err() {
            warn!("Couldn't re-arm RNDIS bulk OUT");
        }
    }

    fn deliver(&self, payload: &[u8]) {
        let link = self.state.link();
        let Some(mut buffer) = self.stack.allocate(payload.len()) else {
            debug!("No buffer for a {=usize} byte frame", payload.len());
            link.count_no_buffer();
            return;
        };
        match buffer.data_mut().get_mut(..payload.len()) {
            Some(dst) => dst.copy_from_slice(payload),
            None => {
                link.count_no_buffer();
                self.stack.release(buffer);
                return;
            }
        }
        if !self.stack.consider_frame(&buffer.data()[..payload.len()]) {
            link.count_rejected();
            self.stack.release(buffer);
            return;
        }
        if let Err(buffer) = self.stack.send_rx_event(buffer) {
            debug!("Network event queue full");
            link.count_queue_full();
            self.stack.release(buffer);
        }
    }
}

#[cfg(test)]
mod test {
    use super::NetworkInterface;
    use crate::{
        mock::{MockBuffer, MockCore, MockRtos, MockStack},
        rndis::{
            message::{word, DATA_HEADER_LEN},
            state::{LinkState, RndisState},
        },
        usbcore::UsbCore,
    };
    use usb_device::endpoint::EndpointAddress;

    extern crate std;
    use std::{vec, vec::Vec};

    struct Fixture {
        core: MockCore,
        stack: MockStack,
        rtos: MockRtos,
        state: RndisState,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                core: MockCore::new(),
                stack: MockStack::new(),
                rtos: MockRtos::new(),
                state: RndisState::new(),
            }
        }
        fn netif(&self) -> NetworkInterface<'_, MockCore, MockStack, MockRtos> {
            NetworkInterface::new(&self.core, &self.stack, &self.rtos, &self.state)
        }
        /// Push a data message through the receive path, as the USB
        /// interrupt would.
        fn receive(&self, message: &[u8]) {
            for packet in message.chunks(64) {
                self.state.receive(packet, 64, || 0);
            }
            if message.len() % 64 == 0 {
                self.state.receive(&[], 64, || 0);
            }
        }
    }

    fn data_message(payload: &[u8]) -> Vec<u8> {
        let mut message = vec![0; DATA_HEADER_LEN];
        message[0] = 1;
        message.extend_from_slice(payload);
        message
    }

    #[test]
    fn initialise_waits_for_the_link() {
        let f = Fixture::new();
        let netif = f.netif();
        assert!(!netif.initialise());
        assert_eq!(f.rtos.spawned.get(), 0);
        assert!(netif.phy_link_status().is_err());

        f.state.link().set_state(LinkState::Normal);
        assert!(netif.initialise());
        assert!(netif.initialise());
        assert_eq!(f.rtos.spawned.get(), 1);
        assert!(f.state.has_consumer());
        assert!(netif.phy_link_status().is_ok());
    }

    #[test]
    fn initialise_retries_a_failed_spawn() {
        let f = Fixture::new();
        f.state.link().set_state(LinkState::Normal);
        f.rtos.spawn_fails.set(true);
        assert!(!f.netif().initialise());
        assert!(!f.state.has_consumer());
        f.rtos.spawn_fails.set(false);
        assert!(f.netif().initialise());
    }

    #[test]
    fn output_retries_then_drops() {
        let f = Fixture::new();
        f.state.link().set_state(LinkState::Normal);
        let netif = f.netif();

        assert!(netif.output(&[1; 60]));
        // Still in flight
        assert!(!netif.output(&[2; 60]));
        assert_eq!(*f.rtos.delays.borrow(), [5, 5, 5, 5]);
        assert_eq!(f.state.statistics().xmit_dropped, 1);
        assert_eq!(f.core.transmitted(EndpointAddress::from(0x81)).len(), 1);

        f.state.transmit_complete();
        assert!(netif.output(&[3; 60]));
        let sent = f.core.transmitted(EndpointAddress::from(0x81));
        assert_eq!(sent.len(), 2);
        assert_eq!(&sent[1][DATA_HEADER_LEN..], &[3; 60]);
    }

    #[test]
    fn output_with_custom_retries() {
        let f = Fixture::new();
        let netif = f.netif().with_retries(2, 10);
        assert!(!netif.output(&[1; 60]));
        assert_eq!(*f.rtos.delays.borrow(), [10]);
    }

    #[test]
    fn output_and_release() {
        let f = Fixture::new();
        f.state.link().set_state(LinkState::Normal);
        let buffer = MockBuffer::from(&[7u8; 20][..]);
        assert!(f.netif().output_and_release(buffer));
        assert_eq!(f.stack.released.get(), 1);
        let sent = f.core.transmitted(EndpointAddress::from(0x81));
        assert_eq!(word(&sent[0], 3), 20);
    }

    #[test]
    fn frames_reach_the_stack() {
        let f = Fixture::new();
        f.state.link().set_state(LinkState::Normal);
        let netif = f.netif();
        assert!(netif.initialise());

        let payload: Vec<u8> = (0..100).collect();
        f.receive(&data_message(&payload));
        netif.receive_task().poll();

        assert_eq!(*f.stack.received.borrow(), [payload]);
        assert_eq!(f.stack.released.get(), 0);
        assert_eq!(f.core.prepared(EndpointAddress::from(0x01)), 1);
        assert_eq!(f.state.statistics().rcv_ok, 1);
    }

    #[test]
    fn header_only_messages_are_skipped() {
        let f = Fixture::new();
        f.state.link().set_state(LinkState::Normal);
        let netif = f.netif();
        assert!(netif.initialise());

        f.receive(&data_message(&[]));
        netif.receive_task().poll();
        assert!(f.stack.received.borrow().is_empty());
        assert_eq!(f.core.prepared(EndpointAddress::from(0x01)), 1);
    }

    #[test]
    fn drops_are_counted_and_buffers_released() {
        let f = Fixture::new();
        f.state.link().set_state(LinkState::Normal);
        let netif = f.netif();
        assert!(netif.initialise());
        let task = netif.receive_task();

        f.stack.out_of_buffers.set(true);
        f.receive(&data_message(&[1; 20]));
        task.poll();
        f.stack.out_of_buffers.set(false);

        f.stack.reject.set(true);
        f.receive(&data_message(&[2; 20]));
        task.poll();
        f.stack.reject.set(false);

        f.stack.queue_full.set(true);
        f.receive(&data_message(&[3; 20]));
        task.poll();

        let stats = f.state.statistics();
        assert_eq!(stats.no_buffer, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.queue_full, 1);
        assert_eq!(f.stack.released.get(), 2);
        assert!(f.stack.received.borrow().is_empty());
        // Re-armed after every notification
        assert_eq!(f.core.prepared(EndpointAddress::from(0x01)), 3);
    }

    #[test]
    fn core_trait_object() {
        let f = Fixture::new();
        f.state.link().set_state(LinkState::Normal);
        let core: &(dyn UsbCore + 'static) = &f.core;
        let netif = NetworkInterface::new(core, &f.stack, &f.rtos, &f.state);
        assert!(netif.output(&[4; 30]));
        netif.receive_task().poll();
        assert_eq!(f.core.transmitted(EndpointAddress::from(0x81)).len(), 1);
        assert_eq!(f.core.prepared(EndpointAddress::from(0x01)), 1);
    }

    #[test]
    fn spurious_wake_rearms() {
        let f = Fixture::new();
        f.netif().receive_task().poll();
        assert_eq!(f.core.prepared(EndpointAddress::from(0x01)), 1);
        assert!(f.stack.received.borrow().is_empty());
    }
}
