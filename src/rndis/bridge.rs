//! Bulk endpoint I/O
//!
//! The receive half runs in the bulk OUT completion. It appends each packet
//! to the reassembly buffer, and a short packet ends the data message. The
//! completed message sits in a single-slot mailbox until the receive task
//! takes it, and the OUT endpoint stays un-armed in the meantime.
//!
//! The transmit half frames an Ethernet frame into a data message, and starts
//! a bulk IN transfer. There's one staging buffer, so there's at most one
//! transfer in flight.

use core::sync::atomic::{AtomicBool, Ordering};

use super::{
    message::{write_data_header, DATA_HEADER_LEN},
    state::{LinkState, RndisState},
};
use crate::usbcore::UsbCore;

/// The outcome of feeding one bulk OUT packet into the receive path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Received {
    /// The data message continues. Re-arm the endpoint.
    Partial,
    /// A data message is complete and waiting for the receive task. Don't
    /// re-arm the endpoint; the task does that once it's done.
    Complete,
    /// The packet was dropped. Re-arm the endpoint.
    Dropped,
}

impl<const RX: usize, const TX: usize> RndisState<RX, TX> {
    /// Feed one bulk OUT packet into the receive path.
    ///
    /// `max_packet` is the bulk packet size; a shorter packet ends the data
    /// message. `now_us` supplies the completion timestamp.
    ///
    /// Call this from the bulk OUT completion only.
    pub(crate) fn receive(
        &self,
        packet: &[u8],
        max_packet: usize,
        now_us: impl FnOnce() -> u64,
    ) -> Received {
        if self.frame_ready.load(Ordering::Acquire) {
            warn!("RNDIS receive overrun, {=usize} bytes dropped", packet.len());
            self.link.count_overrun();
            return Received::Dropped;
        }

        // Safety: the receive path is only entered from the bulk OUT
        // completion, which the USB core serializes. While frame_ready is
        // clear, nothing else touches the reassembly state.
        let offset = unsafe { &mut *self.rx_offset.get() };
        let discarding = unsafe { &mut *self.rx_discarding.get() };
        let rx = unsafe { &mut *self.rx.get() };

        let packet = &packet[..packet.len().min(max_packet)];
        let end = *offset + packet.len();
        if *discarding || end > RX {
            if !*discarding {
                warn!("RNDIS data message longer than {=usize} bytes", RX);
                self.link.count_overrun();
                *discarding = true;
            }
            *offset = 0;
            if packet.len() < max_packet {
                *discarding = false;
            }
            return Received::Dropped;
        }
        rx[*offset..end].copy_from_slice(packet);
        *offset = end;

        if packet.len() == max_packet {
            return Received::Partial;
        }

        let len = *offset;
        *offset = 0;
        if !self.has_consumer() {
            debug!("No receive task; {=usize} byte message dropped", len);
            return Received::Dropped;
        }

        // Safety: published by the frame_ready store below.
        unsafe { *self.frame_timestamp.get() = now_us() };
        self.frame_len.store(len, Ordering::Relaxed);
        self.frame_ready.store(true, Ordering::Release);
        self.link.count_rcv_ok();
        Received::Complete
    }

    /// Take the completed data message, if there is one.
    ///
    /// The receive path doesn't touch the buffer until the returned frame is
    /// dropped.
    pub(crate) fn take_frame(&self) -> Option<Frame<'_>> {
        if !self.frame_ready.load(Ordering::Acquire) {
            return None;
        }
        let len = self.frame_len.load(Ordering::Relaxed);
        // Safety: frame_ready is set, so the receive path won't write to the
        // buffer, and the timestamp was published before frame_ready.
        let (rx, timestamp_us) = unsafe { (&*self.rx.get(), *self.frame_timestamp.get()) };
        Some(Frame {
            data: &rx[..len.min(RX)],
            timestamp_us,
            ready: &self.frame_ready,
        })
    }

    /// Send `frame` to the host.
    ///
    /// Returns [`Busy`](crate::Error::Busy) if the link isn't
    /// [`Normal`](LinkState::Normal), or if the previous transmission hasn't
    /// completed. In both cases, nothing is written. Frames longer than the
    /// staging buffer are clamped.
    pub fn transmit<C: UsbCore + ?Sized>(&self, core: &C, frame: &[u8]) -> crate::Result<()> {
        if self.link.state() != LinkState::Normal {
            return Err(crate::Error::Busy);
        }
        if !self.link.claim_tx() {
            trace!("RNDIS transmit busy");
            return Err(crate::Error::Busy);
        }

        // Safety: the busy flag was claimed above, and it's only cleared
        // after the USB core is done with the staging buffer.
        let tx = unsafe { &mut *self.tx.get() };
        let len = frame.len().min(self.max_frame_len());
        let (header, payload) = tx.split_at_mut(DATA_HEADER_LEN);
        if let Ok(header) = <&mut [u8; DATA_HEADER_LEN]>::try_from(header) {
            write_data_header(header, len);
        }
        payload[..len].copy_from_slice(&frame[..len]);

        if let Err(err) = core.transmit(self.bulk_in(), &tx[..DATA_HEADER_LEN + len]) {
            self.link.set_tx_busy(false);
            return Err(err);
        }
        self.link.count_xmit_ok();
        Ok(())
    }

    /// The bulk IN transfer completed.
    pub(crate) fn transmit_complete(&self) {
        self.link.set_tx_busy(false);
    }

    /// Forget any partially assembled data message.
    ///
    /// A frame already in the mailbox stays there until the receive task
    /// takes it.
    pub(crate) fn reset_receive(&self) {
        // Safety: called from the class' init and deinit, which the USB core
        // serializes with the bulk OUT completion.
        unsafe {
            *self.rx_offset.get() = 0;
            *self.rx_discarding.get() = false;
        }
    }
}

/// A completed data message, owned by the receive task
///
/// Dropping the frame hands the buffer back to the receive path.
pub(crate) struct Frame<'a> {
    data: &'a [u8],
    timestamp_us: u64,
    ready: &'a AtomicBool,
}

impl Frame<'_> {
    /// The data message, header included.
    pub(crate) fn data(&self) -> &[u8] {
        self.data
    }

    /// The Ethernet frame, after the data header.
    pub(crate) fn payload(&self) -> &[u8] {
        self.data.get(DATA_HEADER_LEN..).unwrap_or(&[])
    }

    /// When the receive path completed the message, in microseconds.
    pub(crate) fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }
}

impl Drop for Frame<'_> {
    fn drop(&mut self) {
        self.ready.store(false, Ordering::Release);
    }
}
