#![allow(dead_code)]

use bridge_config::CfgMaster;
use bridge_proto::dmrd::DmrdPacket;
use bridge_proto::ipsc::*;

/// A DMRD frame the way the repeater side would produce it
pub fn test_dmrd_packet(group_call: bool, slot: bool, frame_type: u8, dtype_or_vseq: u8) -> DmrdPacket {
    DmrdPacket {
        seq: 0,
        src: 100,
        dst: 200,
        repeater: 3001,
        slot,
        group_call,
        frame_type,
        dtype_or_vseq,
        stream_id: 0x1234,
        ..Default::default()
    }
}

/// A minimal 54-byte IPSC traffic packet with call control 0xAAAA
pub fn test_ipsc_packet(packet_type: u8, burst_type: u8, group_call: bool, slot: bool) -> Vec<u8> {
    let mut buf = vec![0u8; TRAFFIC_MIN_LEN];
    buf[0] = packet_type;
    write_u32_be(&mut buf, OFFSET_PEER_ID, 99999);
    write_u24_be(&mut buf, OFFSET_SRC, 100);
    write_u24_be(&mut buf, OFFSET_DST, 200);
    buf[OFFSET_CALL_TYPE] = if group_call { CALL_TYPE_GROUP } else { CALL_TYPE_PRIVATE };
    write_u32_be(&mut buf, OFFSET_CALL_CONTROL, 0xAAAA);
    if slot {
        buf[OFFSET_CALL_INFO] |= CALL_INFO_SLOT2;
    }
    buf[OFFSET_RTP] = RTP_VERSION_BYTE;
    buf[OFFSET_BURST_TYPE] = burst_type;
    buf
}

pub fn test_master_config() -> CfgMaster {
    CfgMaster {
        callsign: "N0CALL".into(),
        id: 311860,
        host: "master.example.com".into(),
        port: 62031,
        password: "s3cret".into(),
        rx_freq: 449_000_000,
        tx_freq: 444_000_000,
        tx_power: 50,
        color_code: 1,
        latitude: 35.0,
        longitude: -97.0,
        height: 30,
        location: "Oklahoma".into(),
        description: "Test Repeater".into(),
        url: "https://example.com".into(),
        slots: 3,
        rewrite_in: Vec::new(),
        rewrite_out: Vec::new(),
    }
}
