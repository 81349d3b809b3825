//! DMRD frame codec for the MMDVM/HBRP side of the bridge

use core::fmt;

/// Frame signature carried in the first four bytes of every traffic frame
pub const DMRD_SIGNATURE: [u8; 4] = *b"DMRD";

/// Encoded length of a DMRD frame
pub const DMRD_FRAME_LEN: usize = 53;

/// Voice sync / data sync frame (flags bits 2-3)
pub const FRAME_TYPE_DATA_SYNC: u8 = 1;
/// Voice burst frame (flags bits 2-3)
pub const FRAME_TYPE_VOICE: u8 = 2;

/// Data types carried in the dtype/vseq nibble of a data sync frame
pub const DATA_TYPE_VOICE_LC_HEADER: u8 = 1;
pub const DATA_TYPE_TERMINATOR_WITH_LC: u8 = 2;
pub const DATA_TYPE_CSBK: u8 = 3;

/// A decoded 53-byte DMRD traffic frame.
///
/// All multi-byte integers are big-endian on the wire. The flags byte at
/// offset 15 packs slot (bit 0), inverted group-call flag (bit 1), frame
/// type (bits 2-3) and the data-type-or-voice-sequence nibble (bits 4-7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmrdPacket {
    pub signature: [u8; 4],
    pub seq: u8,
    /// 24-bit source radio ID
    pub src: u32,
    /// 24-bit destination ID (talkgroup or radio)
    pub dst: u32,
    pub repeater: u32,
    /// false = TS1, true = TS2
    pub slot: bool,
    pub group_call: bool,
    pub frame_type: u8,
    pub dtype_or_vseq: u8,
    pub stream_id: u32,
    pub dmr_data: [u8; 33],
}

impl Default for DmrdPacket {
    fn default() -> Self {
        Self {
            signature: DMRD_SIGNATURE,
            seq: 0,
            src: 0,
            dst: 0,
            repeater: 0,
            slot: false,
            group_call: true,
            frame_type: 0,
            dtype_or_vseq: 0,
            stream_id: 0,
            dmr_data: [0u8; 33],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DmrdDecodeError {
    /// Frames are 53 bytes; up to two trailing bytes are tolerated
    BadLength(usize),
}

impl fmt::Display for DmrdDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadLength(n) => write!(f, "bad DMRD frame length: {} bytes", n),
        }
    }
}

impl std::error::Error for DmrdDecodeError {}

impl DmrdPacket {
    /// Decode a frame from raw bytes. Accepts 53 to 55 bytes; trailing
    /// bytes past offset 52 are discarded.
    pub fn decode(data: &[u8]) -> Result<Self, DmrdDecodeError> {
        if !(DMRD_FRAME_LEN..=DMRD_FRAME_LEN + 2).contains(&data.len()) {
            return Err(DmrdDecodeError::BadLength(data.len()));
        }

        let mut signature = [0u8; 4];
        signature.copy_from_slice(&data[..4]);

        let bits = data[15];
        let mut dmr_data = [0u8; 33];
        dmr_data.copy_from_slice(&data[20..53]);

        Ok(Self {
            signature,
            seq: data[4],
            src: u32::from(data[5]) << 16 | u32::from(data[6]) << 8 | u32::from(data[7]),
            dst: u32::from(data[8]) << 16 | u32::from(data[9]) << 8 | u32::from(data[10]),
            repeater: u32::from_be_bytes([data[11], data[12], data[13], data[14]]),
            slot: bits & 0x01 != 0,
            // bit 1 set means private call
            group_call: bits & 0x02 == 0,
            frame_type: (bits & 0x0C) >> 2,
            dtype_or_vseq: (bits & 0xF0) >> 4,
            stream_id: u32::from_be_bytes([data[16], data[17], data[18], data[19]]),
            dmr_data,
        })
    }

    /// Encode to the 53-byte wire form
    pub fn encode(&self) -> [u8; DMRD_FRAME_LEN] {
        let mut data = [0u8; DMRD_FRAME_LEN];
        data[..4].copy_from_slice(&self.signature);
        data[4] = self.seq;
        data[5] = (self.src >> 16) as u8;
        data[6] = (self.src >> 8) as u8;
        data[7] = self.src as u8;
        data[8] = (self.dst >> 16) as u8;
        data[9] = (self.dst >> 8) as u8;
        data[10] = self.dst as u8;
        data[11..15].copy_from_slice(&self.repeater.to_be_bytes());

        let mut bits = 0u8;
        if self.slot {
            bits |= 0x01;
        }
        if !self.group_call {
            bits |= 0x02;
        }
        bits |= (self.frame_type & 0x03) << 2;
        bits |= (self.dtype_or_vseq & 0x0F) << 4;
        data[15] = bits;

        data[16..20].copy_from_slice(&self.stream_id.to_be_bytes());
        data[20..53].copy_from_slice(&self.dmr_data);
        data
    }
}
