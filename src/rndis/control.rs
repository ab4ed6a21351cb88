//! RNDIS control messages
//!
//! The host sends a message with SEND_ENCAPSULATED_COMMAND, waits for the
//! RESPONSE_AVAILABLE notification on the interrupt endpoint, then reads the
//! completion with GET_ENCAPSULATED_RESPONSE. [`ControlEngine`] remembers the
//! last message, and builds its completion on request.
//!
//! There's only one transaction. A command that arrives before the previous
//! response was read replaces the previous transaction, and its response is
//! lost. Hosts don't pipeline RNDIS commands.

use super::{
    message::{self, oid, word},
    state::{Link, LinkState},
    Config,
};

/// Link events raised by control messages
pub trait LinkEvents {
    /// The RNDIS link went down. The network stack should stop using the
    /// interface until it comes back up.
    ///
    /// Called from the USB interrupt.
    fn network_down(&self);
}

/// The last command received from the host
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Transaction {
    pub message_type: u32,
    pub request_id: u32,
    pub major_version: u32,
    pub minor_version: u32,
    pub max_transfer_size: u32,
    pub oid: u32,
    pub info_len: u32,
    pub info_offset: u32,
    pub device_vc_handle: u32,
}

impl Transaction {
    /// Decode the fields of a control message. Missing words read as zero.
    fn parse(msg: &[u8]) -> Self {
        let message_type = word(msg, 0);
        let request_id = word(msg, 2);
        match message_type {
            message::INITIALIZE_MSG => Self {
                message_type,
                request_id,
                major_version: word(msg, 3),
                minor_version: word(msg, 4),
                max_transfer_size: word(msg, 5),
                ..Default::default()
            },
            message::QUERY_MSG | message::SET_MSG => Self {
                message_type,
                request_id,
                oid: word(msg, 3),
                info_len: word(msg, 4),
                info_offset: word(msg, 5),
                device_vc_handle: word(msg, 6),
                ..Default::default()
            },
            _ => Self {
                message_type,
                request_id,
                ..Default::default()
            },
        }
    }
}

/// Size of the QUERY completion header
const QUERY_HEADER_LEN: usize = 24;

/// Information buffer offset for a populated QUERY completion, counted from
/// the request ID field.
const INFO_OFFSET: u32 = 16;

/// Information buffer offset for an empty QUERY completion.
const EMPTY_INFO_OFFSET: u32 = 20;

/// The RNDIS protocol state machine
#[derive(Debug, Default)]
pub struct ControlEngine {
    transaction: Option<Transaction>,
}

/// Appends little endian words to a response buffer
///
/// Writes past the end of the buffer are dropped, and reported through
/// [`Writer::len`].
struct Writer<'a> {
    buf: &'a mut [u8],
    len: usize,
    overflow: bool,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self {
            buf,
            len: 0,
            overflow: false,
        }
    }
    fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        match self.buf.get_mut(self.len..self.len + bytes.len()) {
            Some(dst) => {
                dst.copy_from_slice(bytes);
                self.len += bytes.len();
            }
            None => self.overflow = true,
        }
        self
    }
    fn word(&mut self, word: u32) -> &mut Self {
        self.bytes(&word.to_le_bytes())
    }
    fn words(&mut self, words: &[u32]) -> &mut Self {
        for &w in words {
            self.word(w);
        }
        self
    }
    fn len(&self) -> usize {
        self.len
    }
}

impl ControlEngine {
    pub const fn new() -> Self {
        Self { transaction: None }
    }

    /// The last command received from the host.
    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    /// Handle a SEND_ENCAPSULATED_COMMAND payload.
    ///
    /// Returns `true` if the host should be told that a response is
    /// available.
    pub fn command(&mut self, msg: &[u8], link: &Link, events: &dyn LinkEvents) -> bool {
        if msg.len() < 4 {
            warn!("Short RNDIS message of {=usize} bytes", msg.len());
            self.transaction = None;
            return false;
        }
        let transaction = Transaction::parse(msg);
        debug!(
            "RNDIS message {=u32:#x} request {=u32}",
            transaction.message_type,
            transaction.request_id
        );

        match transaction.message_type {
            message::INITIALIZE_MSG => {
                Self::disconnect(link, events);
                link.set_tx_busy(false);
                link.set_state(LinkState::Normal);
            }
            message::HALT_MSG => {
                link.set_tx_busy(true);
                Self::disconnect(link, events);
                self.transaction = Some(transaction);
                return false;
            }
            message::QUERY_MSG
            | message::SET_MSG
            | message::RESET_MSG
            | message::KEEPALIVE_MSG => {}
            _ => {
                debug!("Unknown RNDIS message {=u32:#x}", transaction.message_type);
                // Still replaces the pending transaction; it has no completion.
                self.transaction = Some(transaction);
                return false;
            }
        }
        self.transaction = Some(transaction);
        true
    }

    fn disconnect(link: &Link, events: &dyn LinkEvents) {
        link.disconnect();
        events.network_down();
    }

    /// Write the response to the last command into `out`, for
    /// GET_ENCAPSULATED_RESPONSE.
    ///
    /// Returns the number of bytes written. There's no response before the
    /// first command, after a HALT, or after a message that doesn't have a
    /// completion; those return zero.
    pub fn response(&self, out: &mut [u8], link: &Link, config: &Config) -> usize {
        let Some(t) = self.transaction.as_ref() else {
            return 0;
        };
        let mut w = Writer::new(out);
        match t.message_type {
            message::INITIALIZE_MSG => {
                w.words(&[
                    message::INITIALIZE_CMPLT,
                    52,
                    t.request_id,
                    message::STATUS_SUCCESS,
                    message::MAJOR_VERSION,
                    message::MINOR_VERSION,
                    message::DF_CONNECTIONLESS,
                    message::MEDIUM_802_3,
                    1, // MaxPacketsPerTransfer
                    message::MAXIMUM_TRANSFER_SIZE,
                    0, // PacketAlignmentFactor
                    0, // AFListOffset
                    0, // AFListSize
                ]);
            }
            message::QUERY_MSG => return Self::query(t, out, link, config),
            message::SET_MSG => {
                w.words(&[
                    message::SET_CMPLT,
                    16,
                    t.request_id,
                    message::STATUS_SUCCESS,
                ]);
            }
            message::RESET_MSG => {
                w.words(&[
                    message::RESET_CMPLT,
                    16,
                    message::STATUS_SUCCESS,
                    0, // AddressingReset
                ]);
            }
            message::KEEPALIVE_MSG => {
                w.words(&[
                    message::KEEPALIVE_CMPLT,
                    16,
                    t.request_id,
                    message::STATUS_SUCCESS,
                ]);
            }
            _ => {}
        }
        if w.overflow {
            warn!("RNDIS response doesn't fit in {=usize} bytes", out.len());
        }
        w.len()
    }

    fn query(t: &Transaction, out: &mut [u8], link: &Link, config: &Config) -> usize {
        if out.len() < QUERY_HEADER_LEN {
            return 0;
        }
        let (header, info) = out.split_at_mut(QUERY_HEADER_LEN);
        let mut w = Writer::new(info);
        let stats = link.statistics();
        match t.oid {
            oid::GEN_SUPPORTED_LIST => {
                w.words(&oid::SUPPORTED);
            }
            oid::GEN_HARDWARE_STATUS => {
                w.word(message::HARDWARE_STATUS_READY);
            }
            oid::GEN_MEDIA_SUPPORTED | oid::GEN_MEDIA_IN_USE => {
                w.word(message::MEDIUM_802_3);
            }
            oid::GEN_PHYSICAL_MEDIUM => {
                w.word(message::PHYSICAL_MEDIUM_UNSPECIFIED);
            }
            oid::GEN_MAXIMUM_FRAME_SIZE => {
                w.word(message::MAXIMUM_FRAME_SIZE);
            }
            oid::GEN_LINK_SPEED => {
                w.word(config.link_speed);
            }
            oid::GEN_MEDIA_CONNECT_STATUS => {
                w.word(message::MEDIA_STATE_CONNECTED);
            }
            oid::IEEE_802_3_MAXIMUM_LIST_SIZE => {
                w.word(1);
            }
            oid::IEEE_802_3_CURRENT_ADDRESS => {
                w.bytes(&config.current_address());
            }
            oid::IEEE_802_3_PERMANENT_ADDRESS => {
                w.bytes(&config.permanent_address);
            }
            oid::GEN_MAXIMUM_TOTAL_SIZE => {
                w.word(message::MAXIMUM_TOTAL_SIZE);
            }
            oid::GEN_MAC_OPTIONS => {
                w.word(message::MAC_OPTIONS.bits());
            }
            oid::IEEE_802_3_MAC_OPTIONS => {
                w.word(0);
            }
            oid::GEN_XMIT_OK => {
                w.word(stats.xmit_ok);
            }
            oid::GEN_RCV_OK => {
                w.word(stats.rcv_ok);
            }
            oid::GEN_RCV_ERROR => {
                w.word(stats.overrun);
            }
            oid::GEN_RCV_NO_BUFFER => {
                w.word(stats.no_buffer);
            }
            oid::GEN_XMIT_ERROR => {
                w.word(stats.xmit_dropped);
            }
            oid::GEN_VENDOR_ID => {
                w.bytes(&config.vendor_id.to_le_bytes()[..3]);
            }
            oid::GEN_VENDOR_DESCRIPTION => {
                w.bytes(config.vendor_description.as_bytes()).bytes(&[0]);
            }
            _ => {
                trace!("Unsupported OID {=u32:#x}", t.oid);
            }
        }
        if w.overflow {
            warn!("OID {=u32:#x} answer doesn't fit", t.oid);
        }

        let info_len = w.len();
        let offset = if info_len == 0 {
            EMPTY_INFO_OFFSET
        } else {
            INFO_OFFSET
        };
        let total = QUERY_HEADER_LEN + info_len;
        Writer::new(header).words(&[
            message::QUERY_CMPLT,
            total as u32,
            t.request_id,
            message::STATUS_SUCCESS,
            info_len as u32,
            offset,
        ]);
        total
    }
}

#[cfg(test)]
mod test {
    use super::{ControlEngine, LinkEvents, Transaction};
    use crate::rndis::{
        message::{self, oid, word},
        state::{Link, LinkState},
        Config,
    };
    use core::cell::Cell;

    #[derive(Default)]
    struct Events {
        downs: Cell<usize>,
    }

    impl LinkEvents for Events {
        fn network_down(&self) {
            self.downs.set(self.downs.get() + 1);
        }
    }

    fn msg(words: &[u32]) -> [u8; 64] {
        let mut buf = [0; 64];
        for (dst, w) in buf.chunks_exact_mut(4).zip(words) {
            dst.copy_from_slice(&w.to_le_bytes());
        }
        buf
    }

    fn init(id: u32) -> [u8; 64] {
        msg(&[message::INITIALIZE_MSG, 24, id, 1, 0, 0x4000])
    }

    fn query(id: u32, oid: u32) -> [u8; 64] {
        msg(&[message::QUERY_MSG, 28, id, oid, 0, 20, 0])
    }

    struct Fixture {
        engine: ControlEngine,
        link: Link,
        events: Events,
        config: Config,
        out: [u8; 512],
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                engine: ControlEngine::new(),
                link: Link::new(),
                events: Events::default(),
                config: Config::new(),
                out: [0; 512],
            }
        }
        fn command(&mut self, msg: &[u8]) -> bool {
            self.engine.command(msg, &self.link, &self.events)
        }
        fn response(&mut self) -> &[u8] {
            let len = self.engine.response(&mut self.out, &self.link, &self.config);
            &self.out[..len]
        }
    }

    #[test]
    fn init_resets_and_goes_normal() {
        let mut f = Fixture::new();
        f.link.count_xmit_ok();
        f.link.count_rcv_ok();
        f.link.set_tx_busy(true);

        assert!(f.command(&init(7)));
        assert_eq!(f.link.state(), LinkState::Normal);
        assert_eq!(f.link.statistics(), Default::default());
        assert!(!f.link.is_tx_busy());
        assert_eq!(f.events.downs.get(), 1);
        assert_eq!(
            f.engine.transaction(),
            Some(&Transaction {
                message_type: message::INITIALIZE_MSG,
                request_id: 7,
                major_version: 1,
                minor_version: 0,
                max_transfer_size: 0x4000,
                ..Default::default()
            })
        );

        // Again, from NORMAL
        f.link.count_rcv_ok();
        assert!(f.command(&init(8)));
        assert_eq!(f.link.state(), LinkState::Normal);
        assert_eq!(f.link.statistics().rcv_ok, 0);
    }

    #[test]
    fn init_response() {
        let mut f = Fixture::new();
        f.command(&init(0x1234));
        let rsp = f.response();
        assert_eq!(rsp.len(), 52);
        let words: [u32; 13] = core::array::from_fn(|i| word(rsp, i));
        assert_eq!(
            words,
            [0x8000_0002, 52, 0x1234, 0, 1, 0, 1, 0, 1, 1580, 0, 0, 0]
        );
    }

    #[test]
    fn halt_goes_halted() {
        let mut f = Fixture::new();
        f.command(&init(1));
        f.link.count_xmit_ok();
        f.link.count_rcv_ok();

        assert!(!f.command(&msg(&[message::HALT_MSG, 12, 2])));
        assert_eq!(f.link.state(), LinkState::Halted);
        assert_eq!(f.link.statistics(), Default::default());
        assert!(f.link.is_tx_busy());
        assert_eq!(f.events.downs.get(), 2);
        assert!(f.response().is_empty());

        // Again, from HALTED
        assert!(!f.command(&msg(&[message::HALT_MSG, 12, 3])));
        assert_eq!(f.link.state(), LinkState::Halted);
    }

    #[test]
    fn maximum_frame_size() {
        let mut f = Fixture::new();
        f.command(&init(1));
        assert!(f.command(&query(5, oid::GEN_MAXIMUM_FRAME_SIZE)));
        let rsp = f.response();
        assert_eq!(rsp.len(), 28);
        assert_eq!(word(rsp, 0), message::QUERY_CMPLT);
        assert_eq!(word(rsp, 1), 28);
        assert_eq!(word(rsp, 2), 5);
        assert_eq!(word(rsp, 3), message::STATUS_SUCCESS);
        assert_eq!(word(rsp, 4), 4);
        assert_eq!(word(rsp, 5), 16);
        assert_eq!(word(rsp, 6), 1500);
    }

    #[test]
    fn supported_list() {
        let mut f = Fixture::new();
        f.command(&query(9, oid::GEN_SUPPORTED_LIST));
        let rsp = f.response();
        assert_eq!(word(rsp, 4), 104);
        assert_eq!(word(rsp, 1) as usize, rsp.len());
        assert_eq!(rsp.len(), 24 + 104);
        for (i, &expected) in oid::SUPPORTED.iter().enumerate() {
            assert_eq!(word(rsp, 6 + i), expected);
        }
    }

    #[test]
    fn addresses() {
        let mut f = Fixture::new();
        f.config = Config::new().with_device_id([0x11, 0x22, 0x33]);

        f.command(&query(1, oid::IEEE_802_3_CURRENT_ADDRESS));
        let rsp = f.response();
        assert_eq!(word(rsp, 4), 6);
        assert_eq!(&rsp[24..], &[0x40, 0x78, 0x75, 0x11, 0x22, 0x33]);

        f.command(&query(2, oid::IEEE_802_3_PERMANENT_ADDRESS));
        let rsp = f.response();
        assert_eq!(&rsp[24..], &[0x40, 0x78, 0x75, 0xDD, 0xEE, 0xFF]);
    }

    #[test]
    fn vendor() {
        let mut f = Fixture::new();
        f.command(&query(1, oid::GEN_VENDOR_ID));
        let rsp = f.response();
        assert_eq!(word(rsp, 4), 3);
        assert_eq!(&rsp[24..], &[0x40, 0x78, 0x75]);

        f.command(&query(2, oid::GEN_VENDOR_DESCRIPTION));
        let rsp = f.response();
        assert_eq!(word(rsp, 4), 15);
        assert_eq!(&rsp[24..], b"IMBEL TPP-1400\0");
        assert_eq!(word(rsp, 1), 24 + 15);
    }

    #[test]
    fn counters() {
        let mut f = Fixture::new();
        f.command(&init(1));
        f.link.count_xmit_ok();
        f.link.count_xmit_ok();
        f.link.count_rcv_ok();
        f.link.count_no_buffer();

        f.command(&query(2, oid::GEN_XMIT_OK));
        assert_eq!(word(f.response(), 6), 2);
        f.command(&query(3, oid::GEN_RCV_OK));
        assert_eq!(word(f.response(), 6), 1);
        f.command(&query(4, oid::GEN_RCV_NO_BUFFER));
        assert_eq!(word(f.response(), 6), 1);
        f.command(&query(5, oid::GEN_RCV_ERROR));
        assert_eq!(word(f.response(), 6), 0);
    }

    #[test]
    fn unsupported_oid_is_empty_success() {
        let mut f = Fixture::new();
        f.command(&query(3, 0x0001_0110));
        let rsp = f.response();
        assert_eq!(rsp.len(), 24);
        assert_eq!(word(rsp, 1), 24);
        assert_eq!(word(rsp, 3), message::STATUS_SUCCESS);
        assert_eq!(word(rsp, 4), 0);
        assert_eq!(word(rsp, 5), 20);
    }

    #[test]
    fn set_reset_keepalive() {
        let mut f = Fixture::new();
        let filter = oid::GEN_CURRENT_PACKET_FILTER;
        assert!(f.command(&msg(&[message::SET_MSG, 32, 4, filter, 4, 20, 0, 0xF])));
        assert_eq!(f.engine.transaction().map(|t| t.oid), Some(filter));
        let rsp = f.response();
        assert_eq!(rsp.len(), 16);
        assert_eq!(
            [word(rsp, 0), word(rsp, 1), word(rsp, 2), word(rsp, 3)],
            [0x8000_0005, 16, 4, 0]
        );

        assert!(f.command(&msg(&[message::RESET_MSG, 12, 0])));
        let rsp = f.response();
        assert_eq!(
            [word(rsp, 0), word(rsp, 1), word(rsp, 2), word(rsp, 3)],
            [0x8000_0006, 16, 0, 0]
        );

        assert!(f.command(&msg(&[message::KEEPALIVE_MSG, 12, 6])));
        let rsp = f.response();
        assert_eq!(
            [word(rsp, 0), word(rsp, 1), word(rsp, 2), word(rsp, 3)],
            [0x8000_0008, 16, 6, 0]
        );
    }

    #[test]
    fn no_transaction_is_empty() {
        let mut f = Fixture::new();
        assert!(f.response().is_empty());
    }

    #[test]
    fn unknown_messages_are_ignored() {
        let mut f = Fixture::new();
        f.command(&query(1, oid::GEN_LINK_SPEED));
        assert!(!f.command(&msg(&[0x0000_00FF, 12, 2])));
        assert_eq!(f.link.state(), LinkState::Halted);
        assert!(f.response().is_empty());
    }

    #[test]
    fn unknown_message_drops_the_pending_response() {
        let mut f = Fixture::new();
        f.command(&query(1, oid::GEN_LINK_SPEED));
        assert_eq!(f.response().len(), 28);
        assert!(!f.command(&msg(&[0x0000_00FF, 12, 2])));
        assert_eq!(f.response().len(), 0);

        f.command(&query(3, oid::GEN_LINK_SPEED));
        assert!(!f.command(&[0x02, 0x00]));
        assert!(f.response().is_empty());
        assert!(f.engine.transaction().is_none());
    }

    #[test]
    fn later_command_replaces_earlier() {
        let mut f = Fixture::new();
        f.command(&query(1, oid::GEN_LINK_SPEED));
        f.command(&query(2, oid::GEN_MAXIMUM_FRAME_SIZE));
        let rsp = f.response();
        assert_eq!(word(rsp, 2), 2);
        assert_eq!(word(rsp, 6), 1500);
    }

    #[test]
    fn response_is_bounded_by_the_buffer() {
        let mut f = Fixture::new();
        f.command(&query(1, oid::GEN_SUPPORTED_LIST));
        let mut small = [0; 40];
        let len = f.engine.response(&mut small, &f.link, &f.config);
        assert_eq!(len, 24 + 16);
        assert_eq!(word(&small, 4), 16);

        let mut tiny = [0; 8];
        assert_eq!(f.engine.response(&mut tiny, &f.link, &f.config), 0);
    }
}
