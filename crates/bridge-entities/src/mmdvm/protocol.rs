//! MMDVM/HBRP control packet building and master reply parsing

use sha2::{Digest, Sha256};

use bridge_config::CfgMaster;
use bridge_proto::dmrd::{DmrdDecodeError, DmrdPacket};

/// A message received from the master server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterMessage {
    /// `MSTACK`; carries the login nonce when answering `RPTL`
    Ack(Vec<u8>),
    /// `MSTNAK`, the master refused us
    Nak,
    /// `MSTPONG` keep-alive answer
    Pong,
    /// `MSTCL`, the master is closing the connection
    Closing,
    /// A 53-byte DMRD traffic frame
    Frame(DmrdPacket),
    Unknown,
}

pub fn parse_master_message(data: &[u8]) -> Result<MasterMessage, DmrdDecodeError> {
    if data.starts_with(b"MSTACK") {
        return Ok(MasterMessage::Ack(data[6..].to_vec()));
    }
    if data.starts_with(b"MSTNAK") {
        return Ok(MasterMessage::Nak);
    }
    if data.starts_with(b"MSTPONG") {
        return Ok(MasterMessage::Pong);
    }
    if data.starts_with(b"MSTCL") {
        return Ok(MasterMessage::Closing);
    }
    if data.starts_with(b"DMRD") {
        return DmrdPacket::decode(data).map(MasterMessage::Frame);
    }
    Ok(MasterMessage::Unknown)
}

fn hex_id(id: u32) -> String {
    format!("{:08x}", id)
}

/// Left-justify `s` into exactly `width` bytes
fn fixed_width(s: &str, width: usize) -> String {
    let mut out = format!("{:<width$}", s, width = width);
    out.truncate(width);
    out
}

/// `RPTL` login request
pub fn build_login(id: u32) -> Vec<u8> {
    let mut data = b"RPTL".to_vec();
    data.extend_from_slice(hex_id(id).as_bytes());
    data
}

/// `RPTK` authentication: lowercase hex of SHA-256(nonce || password)
pub fn build_auth(id: u32, nonce: &[u8], password: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(nonce);
    hasher.update(password.as_bytes());
    let token = hex::encode(hasher.finalize());

    let mut data = b"RPTK".to_vec();
    data.extend_from_slice(hex_id(id).as_bytes());
    data.extend_from_slice(token.as_bytes());
    data
}

/// `RPTC` repeater configuration record; every field is fixed-width ASCII
pub fn build_config(master: &CfgMaster) -> Vec<u8> {
    let mut data = b"RPTC".to_vec();
    data.extend_from_slice(fixed_width(&master.callsign, 8).as_bytes());
    data.extend_from_slice(hex_id(master.id).as_bytes());
    data.extend_from_slice(format!("{:09}", master.rx_freq).as_bytes());
    data.extend_from_slice(format!("{:09}", master.tx_freq).as_bytes());
    data.extend_from_slice(format!("{:02}", master.tx_power).as_bytes());
    data.extend_from_slice(format!("{:02}", master.color_code).as_bytes());
    data.extend_from_slice(fixed_width(&format!("{:.6}", master.latitude), 8).as_bytes());
    data.extend_from_slice(fixed_width(&format!("{:.6}", master.longitude), 9).as_bytes());
    data.extend_from_slice(format!("{:03}", master.height).as_bytes());
    data.extend_from_slice(fixed_width(&master.location, 20).as_bytes());
    data.extend_from_slice(fixed_width(&master.description, 20).as_bytes());
    data.extend_from_slice(fixed_width(&master.url, 124).as_bytes());
    data.extend_from_slice(fixed_width("", 40).as_bytes());
    data.extend_from_slice(fixed_width("", 40).as_bytes());
    data
}

/// `MSTPING` keep-alive
pub fn build_ping(id: u32) -> Vec<u8> {
    let mut data = b"MSTPING".to_vec();
    data.extend_from_slice(hex_id(id).as_bytes());
    data
}

/// `RPTCL` graceful close
pub fn build_close(id: u32) -> Vec<u8> {
    let mut data = b"RPTCL".to_vec();
    data.extend_from_slice(hex_id(id).as_bytes());
    data
}
