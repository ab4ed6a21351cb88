//! RNDIS wire format
//!
//! Message tags, status codes, and object identifiers from the Microsoft
//! Remote NDIS specification. All multi-byte fields are little endian 32 bit
//! words.

use bitflags::bitflags;

/// Host to device data message
pub const PACKET_MSG: u32 = 0x0000_0001;
pub const INITIALIZE_MSG: u32 = 0x0000_0002;
pub const INITIALIZE_CMPLT: u32 = 0x8000_0002;
pub const HALT_MSG: u32 = 0x0000_0003;
pub const QUERY_MSG: u32 = 0x0000_0004;
pub const QUERY_CMPLT: u32 = 0x8000_0004;
pub const SET_MSG: u32 = 0x0000_0005;
pub const SET_CMPLT: u32 = 0x8000_0005;
pub const RESET_MSG: u32 = 0x0000_0006;
pub const RESET_CMPLT: u32 = 0x8000_0006;
pub const INDICATE_STATUS_MSG: u32 = 0x0000_0007;
pub const KEEPALIVE_MSG: u32 = 0x0000_0008;
pub const KEEPALIVE_CMPLT: u32 = 0x8000_0008;

pub const STATUS_SUCCESS: u32 = 0x0000_0000;
pub const STATUS_FAILURE: u32 = 0xC000_0001;
pub const STATUS_NOT_SUPPORTED: u32 = 0xC000_00BB;

/// Connectionless miniport
pub const DF_CONNECTIONLESS: u32 = 0x0000_0001;
pub const MEDIUM_802_3: u32 = 0x0000_0000;

/// NdisHardwareStatusReady
pub const HARDWARE_STATUS_READY: u32 = 0;
/// NdisMediaStateConnected
pub const MEDIA_STATE_CONNECTED: u32 = 0;
/// NdisPhysicalMediumUnspecified
pub const PHYSICAL_MEDIUM_UNSPECIFIED: u32 = 0;

/// Class requests on the control pipe
pub const SEND_ENCAPSULATED_COMMAND: u8 = 0x00;
pub const GET_ENCAPSULATED_RESPONSE: u8 = 0x01;

/// Protocol version reported in the initialize completion
pub const MAJOR_VERSION: u32 = 1;
pub const MINOR_VERSION: u32 = 0;

/// Largest Ethernet payload
pub const MAXIMUM_FRAME_SIZE: u32 = 1500;
/// Largest Ethernet frame, header included, plus RNDIS overhead the host
/// accounts for
pub const MAXIMUM_TOTAL_SIZE: u32 = 1558;
/// Largest bus transfer the device accepts from the host
pub const MAXIMUM_TRANSFER_SIZE: u32 = 1580;

/// Object identifiers
pub mod oid {
    pub const GEN_SUPPORTED_LIST: u32 = 0x0001_0101;
    pub const GEN_HARDWARE_STATUS: u32 = 0x0001_0102;
    pub const GEN_MEDIA_SUPPORTED: u32 = 0x0001_0103;
    pub const GEN_MEDIA_IN_USE: u32 = 0x0001_0104;
    pub const GEN_MAXIMUM_FRAME_SIZE: u32 = 0x0001_0106;
    pub const GEN_LINK_SPEED: u32 = 0x0001_0107;
    pub const GEN_TRANSMIT_BLOCK_SIZE: u32 = 0x0001_010A;
    pub const GEN_RECEIVE_BLOCK_SIZE: u32 = 0x0001_010B;
    pub const GEN_VENDOR_ID: u32 = 0x0001_010C;
    pub const GEN_VENDOR_DESCRIPTION: u32 = 0x0001_010D;
    pub const GEN_CURRENT_PACKET_FILTER: u32 = 0x0001_010E;
    pub const GEN_MAXIMUM_TOTAL_SIZE: u32 = 0x0001_0111;
    pub const GEN_MAC_OPTIONS: u32 = 0x0001_0113;
    pub const GEN_MEDIA_CONNECT_STATUS: u32 = 0x0001_0114;
    pub const GEN_VENDOR_DRIVER_VERSION: u32 = 0x0001_0116;
    pub const GEN_PHYSICAL_MEDIUM: u32 = 0x0001_0202;
    pub const GEN_XMIT_OK: u32 = 0x0002_0101;
    pub const GEN_RCV_OK: u32 = 0x0002_0102;
    pub const GEN_XMIT_ERROR: u32 = 0x0002_0103;
    pub const GEN_RCV_ERROR: u32 = 0x0002_0104;
    pub const GEN_RCV_NO_BUFFER: u32 = 0x0002_0105;
    pub const IEEE_802_3_PERMANENT_ADDRESS: u32 = 0x0101_0101;
    pub const IEEE_802_3_CURRENT_ADDRESS: u32 = 0x0101_0102;
    pub const IEEE_802_3_MULTICAST_LIST: u32 = 0x0101_0103;
    pub const IEEE_802_3_MAXIMUM_LIST_SIZE: u32 = 0x0101_0104;
    pub const IEEE_802_3_MAC_OPTIONS: u32 = 0x0101_0105;
    pub const IEEE_802_3_RCV_ERROR_ALIGNMENT: u32 = 0x0102_0101;
    pub const IEEE_802_3_XMIT_ONE_COLLISION: u32 = 0x0102_0102;
    pub const IEEE_802_3_XMIT_MORE_COLLISIONS: u32 = 0x0102_0103;

    /// Answer to [`GEN_SUPPORTED_LIST`], in the order reported to the host
    pub const SUPPORTED: [u32; 26] = [
        GEN_SUPPORTED_LIST,
        GEN_HARDWARE_STATUS,
        GEN_MEDIA_SUPPORTED,
        GEN_MEDIA_IN_USE,
        GEN_MAXIMUM_FRAME_SIZE,
        GEN_LINK_SPEED,
        GEN_TRANSMIT_BLOCK_SIZE,
        GEN_RECEIVE_BLOCK_SIZE,
        GEN_VENDOR_ID,
        GEN_VENDOR_DESCRIPTION,
        GEN_VENDOR_DRIVER_VERSION,
        GEN_CURRENT_PACKET_FILTER,
        GEN_MAXIMUM_TOTAL_SIZE,
        GEN_MAC_OPTIONS,
        GEN_MEDIA_CONNECT_STATUS,
        GEN_PHYSICAL_MEDIUM,
        GEN_XMIT_OK,
        GEN_RCV_OK,
        IEEE_802_3_PERMANENT_ADDRESS,
        IEEE_802_3_CURRENT_ADDRESS,
        IEEE_802_3_MULTICAST_LIST,
        IEEE_802_3_MAC_OPTIONS,
        IEEE_802_3_MAXIMUM_LIST_SIZE,
        IEEE_802_3_RCV_ERROR_ALIGNMENT,
        IEEE_802_3_XMIT_ONE_COLLISION,
        IEEE_802_3_XMIT_MORE_COLLISIONS,
    ];
}

bitflags! {
    /// `OID_GEN_MAC_OPTIONS` answer
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MacOptions : u32 {
        const COPY_LOOKAHEAD_DATA = 1 << 0;
        const RECEIVE_SERIALIZED = 1 << 1;
        const TRANSFERS_NOT_PEND = 1 << 2;
        const NO_LOOPBACK = 1 << 3;
        const FULL_DUPLEX = 1 << 4;
    }
}

/// MAC options reported to the host
///
/// Frames are copied in and out of the staging buffers, and nothing is looped
/// back to the host.
pub const MAC_OPTIONS: MacOptions = MacOptions::COPY_LOOKAHEAD_DATA
    .union(MacOptions::TRANSFERS_NOT_PEND)
    .union(MacOptions::NO_LOOPBACK);

/// Interrupt endpoint notification that tells the host to fetch a response
/// with GET_ENCAPSULATED_RESPONSE.
pub const RESPONSE_AVAILABLE: [u8; 8] = [0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

/// Size of the header in front of every Ethernet frame on the bulk endpoints
pub const DATA_HEADER_LEN: usize = 44;

/// Offset from the DataOffset field to the frame, as written by the device
const DATA_OFFSET: u32 = 36;

/// Write a `REMOTE_NDIS_PACKET_MSG` header for a frame of `payload_len`
/// bytes.
///
/// Out-of-band data, per-packet info, and reserved fields are zero.
pub fn write_data_header(header: &mut [u8; DATA_HEADER_LEN], payload_len: usize) {
    let words = [
        PACKET_MSG,
        (payload_len + DATA_HEADER_LEN) as u32,
        DATA_OFFSET,
        payload_len as u32,
    ];
    header.fill(0);
    for (dst, word) in header.chunks_exact_mut(4).zip(words) {
        dst.copy_from_slice(&word.to_le_bytes());
    }
}

/// Read the little endian word at word index `index`
///
/// Words past the end of `bytes` read as zero.
pub fn word(bytes: &[u8], index: usize) -> u32 {
    let start = index * 4;
    bytes
        .get(start..start + 4)
        .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
        .unwrap_or(0)
}

const _: [(); 1] = [(); (oid::SUPPORTED.len() * 4 == 104) as usize];
