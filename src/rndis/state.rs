#![allow(clippy::declare_interior_mutable_const)] // Usage is legit in this module.

use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU8, AtomicUsize, Ordering},
};

use super::message::DATA_HEADER_LEN;
use usb_device::{endpoint::EndpointAddress, UsbDirection};

/// RNDIS link state, as negotiated with the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    /// Initial state, and the state after a HALT, a reset, or a disconnect.
    Halted = 0,
    /// The host completed an RNDIS INITIALIZE.
    Normal = 1,
}

/// A snapshot of the link counters
///
/// All counters reset when the link disconnects.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Statistics {
    /// Frames handed to the USB core for transmission.
    pub xmit_ok: u32,
    /// Frames completed by the receive path and handed to the receive task.
    pub rcv_ok: u32,
    /// Frames dropped because the network stack had no buffer.
    pub no_buffer: u32,
    /// Frames the network stack didn't want.
    pub rejected: u32,
    /// Frames dropped because the network stack's event queue was full.
    pub queue_full: u32,
    /// Packets dropped because the receive slot was still owned by the task,
    /// or because a frame overflowed the receive buffer.
    pub overrun: u32,
    /// Frames the network interface gave up on after all transmit retries.
    pub xmit_dropped: u32,
}

/// A diagnostics counter
///
/// Increments are a load and a store, so they're not atomic with respect to
/// each other. That's fine for diagnostics, and it works on cores without
/// compare-and-swap.
struct Counter(AtomicU32);

impl Counter {
    const fn new() -> Self {
        Self(AtomicU32::new(0))
    }
    fn bump(&self) {
        let count = self.0.load(Ordering::Relaxed);
        self.0.store(count.wrapping_add(1), Ordering::Relaxed);
    }
    fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
    fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

/// Link state and counters
///
/// Shared by the control path, the bulk endpoints, and the network
/// interface.
pub struct Link {
    state: AtomicU8,
    tx_busy: AtomicBool,
    xmit_ok: Counter,
    rcv_ok: Counter,
    no_buffer: Counter,
    rejected: Counter,
    queue_full: Counter,
    overrun: Counter,
    xmit_dropped: Counter,
}

impl Default for Link {
    fn default() -> Self {
        Self::new()
    }
}

impl Link {
    /// A halted link with zeroed counters.
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(LinkState::Halted as u8),
            tx_busy: AtomicBool::new(false),
            xmit_ok: Counter::new(),
            rcv_ok: Counter::new(),
            no_buffer: Counter::new(),
            rejected: Counter::new(),
            queue_full: Counter::new(),
            overrun: Counter::new(),
            xmit_dropped: Counter::new(),
        }
    }

    /// Returns the current link state.
    pub fn state(&self) -> LinkState {
        match self.state.load(Ordering::Acquire) {
            1 => LinkState::Normal,
            _ => LinkState::Halted,
        }
    }

    pub(crate) fn set_state(&self, state: LinkState) {
        debug!("RNDIS link state {=u8}", state as u8);
        self.state.store(state as u8, Ordering::Release);
    }

    /// Zero the counters, and force the link into [`LinkState::Halted`].
    pub(crate) fn disconnect(&self) {
        for counter in self.counters() {
            counter.reset();
        }
        self.set_state(LinkState::Halted);
    }

    fn counters(&self) -> [&Counter; 7] {
        [
            &self.xmit_ok,
            &self.rcv_ok,
            &self.no_buffer,
            &self.rejected,
            &self.queue_full,
            &self.overrun,
            &self.xmit_dropped,
        ]
    }

    /// Returns `true` while a bulk IN transfer is outstanding.
    pub fn is_tx_busy(&self) -> bool {
        self.tx_busy.load(Ordering::Acquire)
    }

    pub(crate) fn set_tx_busy(&self, busy: bool) {
        self.tx_busy.store(busy, Ordering::Release);
    }

    /// Claim the transmit path. Returns `false` if it's already claimed.
    pub(crate) fn claim_tx(&self) -> bool {
        self.tx_busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn count_xmit_ok(&self) {
        self.xmit_ok.bump();
    }
    pub(crate) fn count_rcv_ok(&self) {
        self.rcv_ok.bump();
    }
    pub(crate) fn count_no_buffer(&self) {
        self.no_buffer.bump();
    }
    pub(crate) fn count_rejected(&self) {
        self.rejected.bump();
    }
    pub(crate) fn count_queue_full(&self) {
        self.queue_full.bump();
    }
    pub(crate) fn count_overrun(&self) {
        self.overrun.bump();
    }
    pub(crate) fn count_xmit_dropped(&self) {
        self.xmit_dropped.bump();
    }

    /// Read all counters.
    pub fn statistics(&self) -> Statistics {
        Statistics {
            xmit_ok: self.xmit_ok.get(),
            rcv_ok: self.rcv_ok.get(),
            no_buffer: self.no_buffer.get(),
            rejected: self.rejected.get(),
            queue_full: self.queue_full.get(),
            overrun: self.overrun.get(),
            xmit_dropped: self.xmit_dropped.get(),
        }
    }
}

/// Default receive buffer size
pub const DEFAULT_RX_CAPACITY: usize = 2048;

/// Default transmit staging buffer size: the data header, then up to 2048
/// bytes of frame.
pub const DEFAULT_TX_CAPACITY: usize = DATA_HEADER_LEN + 2048;

/// Physical bulk IN endpoint until the class is initialized
const DEFAULT_BULK_IN: u8 = 0x81;
/// Physical bulk OUT endpoint until the class is initialized
const DEFAULT_BULK_OUT: u8 = 0x01;

/// State shared between the RNDIS class and the network interface.
///
/// The class runs in the USB interrupt. The network interface and the receive
/// task run in RTOS tasks. Allocate one `static` object, and give a reference
/// to the class, the network interface, and the receive task.
///
/// ```
/// use usbd_rndis::rndis::RndisState;
///
/// static RNDIS: RndisState = RndisState::new();
/// ```
///
/// `RX` sizes the buffer that reassembles bulk OUT packets into a data
/// message. `TX` sizes the buffer that stages a data message for bulk IN,
/// header included. Frames longer than `TX - 44` bytes are clamped.
///
/// ```
/// use usbd_rndis::rndis::RndisState;
///
/// static RNDIS: RndisState<1600, 1600> = RndisState::new();
/// ```
pub struct RndisState<const RX: usize = DEFAULT_RX_CAPACITY, const TX: usize = DEFAULT_TX_CAPACITY>
{
    pub(super) link: Link,
    /// Reassembly buffer. Written by the bulk OUT completion while
    /// `frame_ready` is clear, read by the receive task while it's set.
    pub(super) rx: UnsafeCell<[u8; RX]>,
    /// Owned by the bulk OUT completion.
    pub(super) rx_offset: UnsafeCell<usize>,
    /// Owned by the bulk OUT completion. Set when a frame overflowed `rx`,
    /// until the short packet that ends it.
    pub(super) rx_discarding: UnsafeCell<bool>,
    /// Published with `frame_ready`.
    pub(super) frame_len: AtomicUsize,
    /// Published with `frame_ready`. Microseconds.
    pub(super) frame_timestamp: UnsafeCell<u64>,
    /// The single-slot mailbox between the bulk OUT completion and the task.
    pub(super) frame_ready: AtomicBool,
    /// Set once the receive task exists.
    pub(super) consumer: AtomicBool,
    /// Owned by whoever claimed `link.tx_busy`.
    pub(super) tx: UnsafeCell<[u8; TX]>,
    bulk_in: AtomicU8,
    bulk_out: AtomicU8,
    max_packet: AtomicU16,
}

unsafe impl<const RX: usize, const TX: usize> Sync for RndisState<RX, TX> {}

impl RndisState {
    /// Allocate the default buffer sizes.
    pub const fn default_capacity() -> Self {
        Self::new()
    }
}

impl<const RX: usize, const TX: usize> RndisState<RX, TX> {
    const VALID: () = assert!(TX > DATA_HEADER_LEN, "TX must be larger than the data header");

    /// Allocate state with `RX` and `TX` byte buffers.
    pub const fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::VALID;
        Self {
            link: Link::new(),
            rx: UnsafeCell::new([0; RX]),
            rx_offset: UnsafeCell::new(0),
            rx_discarding: UnsafeCell::new(false),
            frame_len: AtomicUsize::new(0),
            frame_timestamp: UnsafeCell::new(0),
            frame_ready: AtomicBool::new(false),
            consumer: AtomicBool::new(false),
            tx: UnsafeCell::new([0; TX]),
            bulk_in: AtomicU8::new(DEFAULT_BULK_IN),
            bulk_out: AtomicU8::new(DEFAULT_BULK_OUT),
            max_packet: AtomicU16::new(super::FS_MAX_PACKET as u16),
        }
    }

    /// Link state and counters.
    pub fn link(&self) -> &Link {
        &self.link
    }

    /// Read all counters.
    pub fn statistics(&self) -> Statistics {
        self.link.statistics()
    }

    /// Returns the largest frame that [`transmit`](Self::transmit) sends
    /// without clamping.
    pub const fn max_frame_len(&self) -> usize {
        TX - DATA_HEADER_LEN
    }

    /// Returns `true` once a receive task is registered.
    pub fn has_consumer(&self) -> bool {
        self.consumer.load(Ordering::Acquire)
    }

    /// Register the receive task. Completed frames are dropped until a
    /// consumer exists.
    pub(crate) fn register_consumer(&self) {
        self.consumer.store(true, Ordering::Release);
    }

    /// Record the physical bulk endpoints and packet size, as opened by the
    /// class.
    pub(crate) fn set_endpoints(
        &self,
        bulk_in: EndpointAddress,
        bulk_out: EndpointAddress,
        max_packet: usize,
    ) {
        self.bulk_in.store(bulk_in.into(), Ordering::Release);
        self.bulk_out.store(bulk_out.into(), Ordering::Release);
        self.max_packet.store(max_packet as u16, Ordering::Release);
    }

    pub(crate) fn bulk_in(&self) -> EndpointAddress {
        EndpointAddress::from_parts(
            usize::from(self.bulk_in.load(Ordering::Acquire) & 0x0F),
            UsbDirection::In,
        )
    }

    pub(crate) fn bulk_out(&self) -> EndpointAddress {
        EndpointAddress::from_parts(
            usize::from(self.bulk_out.load(Ordering::Acquire) & 0x0F),
            UsbDirection::Out,
        )
    }

    /// Bulk packet size for the negotiated speed.
    pub(crate) fn max_packet(&self) -> usize {
        usize::from(self.max_packet.load(Ordering::Acquire))
    }
}
