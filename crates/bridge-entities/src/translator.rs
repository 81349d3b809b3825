//! Per-call state machine translating between IPSC traffic packets and DMRD frames

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bridge_proto::dmrd::{
    DATA_TYPE_CSBK, DATA_TYPE_TERMINATOR_WITH_LC, DATA_TYPE_VOICE_LC_HEADER, DmrdPacket,
    FRAME_TYPE_DATA_SYNC, FRAME_TYPE_VOICE,
};
use bridge_proto::ipsc::*;

/// How many identical voice-head packets a Motorola repeater sends and
/// expects at the start of every call.
const VOICE_HEAD_REPEAT: usize = 3;

/// Length of every traffic packet the translator emits: the 31-byte
/// header followed by the 33-byte DMR payload.
const TRAFFIC_PACKET_LEN: usize = OFFSET_PAYLOAD + 33;

/// State of one outbound call, keyed by its DMRD stream ID
struct ForwardStream {
    call_control: u32,
    slot: bool,
    group_call: bool,
    src: u32,
    dst: u32,
    rtp_seq: u16,
    last_seen: Instant,
}

/// State of one inbound call, keyed by its IPSC call control
struct ReverseStream {
    stream_id: u32,
    slot: bool,
    group_call: bool,
    src: u32,
    dst: u32,
    seq: u8,
    /// Collapses Motorola's triple voice header into a single DMRD header
    header_sent: bool,
    last_seen: Instant,
}

#[derive(Default)]
struct TranslatorState {
    streams: HashMap<u32, ForwardStream>,
    reverse_streams: HashMap<u32, ReverseStream>,
}

/// Bidirectional IPSC ⇄ DMRD call translator.
///
/// All state lives behind one mutex; every operation is synchronous and
/// holds the lock for its whole duration, so packets of the same call are
/// always produced in input order no matter how many I/O threads call in.
pub struct Translator {
    peer_id: u32,
    state: Mutex<TranslatorState>,
}

impl Translator {
    pub fn new(peer_id: u32) -> Self {
        Self {
            peer_id,
            state: Mutex::new(TranslatorState::default()),
        }
    }

    pub fn peer_id(&self) -> u32 {
        self.peer_id
    }

    // ─── DMRD → IPSC ─────────────────────────────────────────────

    /// Translate one DMRD frame into zero or more IPSC datagrams.
    pub fn translate_to_ipsc(&self, pkt: &DmrdPacket) -> Vec<Vec<u8>> {
        let mut state = self.state.lock().unwrap();

        match pkt.frame_type {
            FRAME_TYPE_VOICE => self.voice_burst_to_ipsc(&mut state, pkt),
            FRAME_TYPE_DATA_SYNC => match pkt.dtype_or_vseq {
                DATA_TYPE_VOICE_LC_HEADER => self.voice_head_to_ipsc(&mut state, pkt),
                DATA_TYPE_TERMINATOR_WITH_LC => self.voice_term_to_ipsc(&mut state, pkt),
                DATA_TYPE_CSBK => self.csbk_to_ipsc(&mut state, pkt),
                other => {
                    tracing::debug!("no IPSC mapping for data type {}", other);
                    Vec::new()
                }
            },
            other => {
                tracing::debug!("no IPSC mapping for DMRD frame type {}", other);
                Vec::new()
            }
        }
    }

    fn voice_head_to_ipsc(&self, state: &mut TranslatorState, pkt: &DmrdPacket) -> Vec<Vec<u8>> {
        let call_control = alloc_call_control(&state.streams);
        let stream = state.streams.entry(pkt.stream_id).or_insert(ForwardStream {
            call_control,
            slot: pkt.slot,
            group_call: pkt.group_call,
            src: pkt.src,
            dst: pkt.dst,
            rtp_seq: 0,
            last_seen: Instant::now(),
        });
        stream.last_seen = Instant::now();

        let payload = voice_lc_payload(pkt);

        (0..VOICE_HEAD_REPEAT)
            .map(|i| {
                let rtp_seq = stream.rtp_seq;
                stream.rtp_seq = stream.rtp_seq.wrapping_add(1);
                build_traffic_packet(TrafficPacket {
                    packet_type: voice_packet_type(stream.group_call),
                    peer_id: self.peer_id,
                    src: stream.src,
                    dst: stream.dst,
                    group_call: stream.group_call,
                    call_control: stream.call_control,
                    slot: stream.slot,
                    end_of_call: false,
                    rtp_seq,
                    rtp_marker: i == 0,
                    burst_type: BURST_VOICE_HEAD,
                    payload: &payload,
                })
            })
            .collect()
    }

    fn voice_burst_to_ipsc(&self, state: &mut TranslatorState, pkt: &DmrdPacket) -> Vec<Vec<u8>> {
        // A voice burst without preceding header state happens on late
        // entry or after an idle sweep; start a fresh call for it.
        let call_control = alloc_call_control(&state.streams);
        let stream = state.streams.entry(pkt.stream_id).or_insert(ForwardStream {
            call_control,
            slot: pkt.slot,
            group_call: pkt.group_call,
            src: pkt.src,
            dst: pkt.dst,
            rtp_seq: 0,
            last_seen: Instant::now(),
        });
        stream.last_seen = Instant::now();

        let rtp_seq = stream.rtp_seq;
        stream.rtp_seq = stream.rtp_seq.wrapping_add(1);

        let vseq = pkt.dtype_or_vseq.min(5);
        vec![build_traffic_packet(TrafficPacket {
            packet_type: voice_packet_type(stream.group_call),
            peer_id: self.peer_id,
            src: stream.src,
            dst: stream.dst,
            group_call: stream.group_call,
            call_control: stream.call_control,
            slot: stream.slot,
            end_of_call: false,
            rtp_seq,
            rtp_marker: false,
            burst_type: BURST_VOICE_A + vseq,
            payload: &pkt.dmr_data,
        })]
    }

    fn voice_term_to_ipsc(&self, state: &mut TranslatorState, pkt: &DmrdPacket) -> Vec<Vec<u8>> {
        // The stream is over once the terminator leaves, so take the state out
        let (call_control, slot, group_call, rtp_seq) = match state.streams.remove(&pkt.stream_id) {
            Some(stream) => (stream.call_control, stream.slot, stream.group_call, stream.rtp_seq),
            None => (alloc_call_control(&state.streams), pkt.slot, pkt.group_call, 0),
        };

        vec![build_traffic_packet(TrafficPacket {
            packet_type: voice_packet_type(group_call),
            peer_id: self.peer_id,
            src: pkt.src,
            dst: pkt.dst,
            group_call,
            call_control,
            slot,
            end_of_call: true,
            rtp_seq,
            rtp_marker: false,
            burst_type: BURST_VOICE_TERM,
            payload: &pkt.dmr_data,
        })]
    }

    fn csbk_to_ipsc(&self, state: &mut TranslatorState, pkt: &DmrdPacket) -> Vec<Vec<u8>> {
        // CSBKs are one-shot; reuse the call control of a live stream if
        // one exists, otherwise burn an ephemeral one.
        let call_control = match state.streams.get(&pkt.stream_id) {
            Some(stream) => stream.call_control,
            None => alloc_call_control(&state.streams),
        };

        vec![build_traffic_packet(TrafficPacket {
            packet_type: data_packet_type(pkt.group_call),
            peer_id: self.peer_id,
            src: pkt.src,
            dst: pkt.dst,
            group_call: pkt.group_call,
            call_control,
            slot: pkt.slot,
            end_of_call: false,
            rtp_seq: 0,
            rtp_marker: false,
            burst_type: BURST_CSBK,
            payload: &pkt.dmr_data,
        })]
    }

    // ─── IPSC → DMRD ─────────────────────────────────────────────

    /// Translate one IPSC traffic packet into zero or more DMRD frames.
    pub fn translate_to_dmrd(&self, packet_type: u8, data: &[u8]) -> Vec<DmrdPacket> {
        if !is_traffic_type(packet_type) {
            tracing::debug!("no DMRD mapping for IPSC packet type {:#04x}", packet_type);
            return Vec::new();
        }
        if data.len() < TRAFFIC_MIN_LEN {
            tracing::debug!("IPSC traffic packet too short: {} bytes", data.len());
            return Vec::new();
        }

        let group_call =
            packet_type == PACKET_TYPE_GROUP_VOICE || packet_type == PACKET_TYPE_GROUP_DATA;
        let src = read_u24_be(data, OFFSET_SRC);
        let dst = read_u24_be(data, OFFSET_DST);
        let call_control = read_u32_be(data, OFFSET_CALL_CONTROL);
        let call_info = data[OFFSET_CALL_INFO];
        let slot = call_info & CALL_INFO_SLOT2 != 0;
        let end_of_call = call_info & CALL_INFO_END != 0;
        let burst_type = data[OFFSET_BURST_TYPE];

        let mut dmr_data = [0u8; 33];
        let avail = (data.len() - OFFSET_PAYLOAD).min(33);
        dmr_data[..avail].copy_from_slice(&data[OFFSET_PAYLOAD..OFFSET_PAYLOAD + avail]);

        let mut state = self.state.lock().unwrap();
        let mut out = Vec::new();

        match burst_type {
            BURST_VOICE_HEAD => {
                let stream = entry_or_new(&mut state, call_control, slot, group_call, src, dst);
                if !stream.header_sent {
                    stream.header_sent = true;
                    out.push(emit_frame(
                        self.peer_id,
                        stream,
                        FRAME_TYPE_DATA_SYNC,
                        DATA_TYPE_VOICE_LC_HEADER,
                        dmr_data,
                    ));
                }
                // Duplicate header: Motorola sends three, the master wants one
            }
            BURST_VOICE_TERM => {
                if let Some(mut stream) = state.reverse_streams.remove(&call_control) {
                    out.push(emit_frame(
                        self.peer_id,
                        &mut stream,
                        FRAME_TYPE_DATA_SYNC,
                        DATA_TYPE_TERMINATOR_WITH_LC,
                        dmr_data,
                    ));
                }
            }
            BURST_CSBK => {
                let stream = entry_or_new(&mut state, call_control, slot, group_call, src, dst);
                out.push(emit_frame(
                    self.peer_id,
                    stream,
                    FRAME_TYPE_DATA_SYNC,
                    DATA_TYPE_CSBK,
                    dmr_data,
                ));
            }
            BURST_VOICE_A..=BURST_VOICE_F => {
                let stream = entry_or_new(&mut state, call_control, slot, group_call, src, dst);
                out.push(emit_frame(
                    self.peer_id,
                    stream,
                    FRAME_TYPE_VOICE,
                    burst_type - BURST_VOICE_A,
                    dmr_data,
                ));
            }
            other => {
                tracing::debug!("no DMRD mapping for IPSC burst type {:#04x}", other);
            }
        }

        if end_of_call {
            state.reverse_streams.remove(&call_control);
        }

        out
    }

    // ─── Idle cleanup ────────────────────────────────────────────

    /// Drop the forward state of one stream, if present.
    pub fn cleanup_stream(&self, stream_id: u32) {
        self.state.lock().unwrap().streams.remove(&stream_id);
    }

    /// Drop every stream, in either direction, that has been idle for
    /// longer than `max_age`. Called periodically by the sweeper.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        let before = state.streams.len() + state.reverse_streams.len();
        state.streams.retain(|_, s| now.duration_since(s.last_seen) <= max_age);
        state
            .reverse_streams
            .retain(|_, s| now.duration_since(s.last_seen) <= max_age);
        let removed = before - (state.streams.len() + state.reverse_streams.len());
        if removed > 0 {
            tracing::debug!("swept {} idle call stream(s)", removed);
        }
        removed
    }

    // ─── Test/introspection helpers ──────────────────────────────

    pub fn has_forward_stream(&self, stream_id: u32) -> bool {
        self.state.lock().unwrap().streams.contains_key(&stream_id)
    }

    pub fn has_reverse_stream(&self, call_control: u32) -> bool {
        self.state
            .lock()
            .unwrap()
            .reverse_streams
            .contains_key(&call_control)
    }
}

fn entry_or_new<'a>(
    state: &'a mut TranslatorState,
    call_control: u32,
    slot: bool,
    group_call: bool,
    src: u32,
    dst: u32,
) -> &'a mut ReverseStream {
    let stream_id = alloc_stream_id(&state.reverse_streams);
    let stream = state
        .reverse_streams
        .entry(call_control)
        .or_insert(ReverseStream {
            stream_id,
            slot,
            group_call,
            src,
            dst,
            seq: 0,
            header_sent: false,
            last_seen: Instant::now(),
        });
    stream.last_seen = Instant::now();
    stream
}

fn emit_frame(
    peer_id: u32,
    stream: &mut ReverseStream,
    frame_type: u8,
    dtype_or_vseq: u8,
    dmr_data: [u8; 33],
) -> DmrdPacket {
    let seq = stream.seq;
    stream.seq = stream.seq.wrapping_add(1);
    DmrdPacket {
        seq,
        src: stream.src,
        dst: stream.dst,
        repeater: peer_id,
        slot: stream.slot,
        group_call: stream.group_call,
        frame_type,
        dtype_or_vseq,
        stream_id: stream.stream_id,
        dmr_data,
        ..Default::default()
    }
}

/// Pick a call control no live forward stream is using
fn alloc_call_control(streams: &HashMap<u32, ForwardStream>) -> u32 {
    loop {
        let candidate: u32 = rand::random();
        if !streams.values().any(|s| s.call_control == candidate) {
            return candidate;
        }
    }
}

/// Pick a DMRD stream ID no live reverse stream is using
fn alloc_stream_id(reverse_streams: &HashMap<u32, ReverseStream>) -> u32 {
    loop {
        let candidate: u32 = rand::random();
        if !reverse_streams.values().any(|s| s.stream_id == candidate) {
            return candidate;
        }
    }
}

fn voice_packet_type(group_call: bool) -> u8 {
    if group_call { PACKET_TYPE_GROUP_VOICE } else { PACKET_TYPE_PRIVATE_VOICE }
}

fn data_packet_type(group_call: bool) -> u8 {
    if group_call { PACKET_TYPE_GROUP_DATA } else { PACKET_TYPE_PRIVATE_DATA }
}

/// The 9-byte full link control synthesised into an outbound voice header:
/// FLCO, two reserved bytes, then destination and source as 24-bit values.
/// The checksum bytes that follow in the payload stay zero; deployed
/// masters do not validate them.
pub fn extract_full_lc(pkt: &DmrdPacket) -> [u8; 9] {
    let mut lc = [0u8; 9];
    // FLCO 0x00 = group voice, 0x03 = unit-to-unit
    lc[0] = if pkt.group_call { 0x00 } else { 0x03 };
    lc[3] = (pkt.dst >> 16) as u8;
    lc[4] = (pkt.dst >> 8) as u8;
    lc[5] = pkt.dst as u8;
    lc[6] = (pkt.src >> 16) as u8;
    lc[7] = (pkt.src >> 8) as u8;
    lc[8] = pkt.src as u8;
    lc
}

fn voice_lc_payload(pkt: &DmrdPacket) -> [u8; 33] {
    let mut payload = [0u8; 33];
    payload[..9].copy_from_slice(&extract_full_lc(pkt));
    payload
}

struct TrafficPacket<'a> {
    packet_type: u8,
    peer_id: u32,
    src: u32,
    dst: u32,
    group_call: bool,
    call_control: u32,
    slot: bool,
    end_of_call: bool,
    rtp_seq: u16,
    rtp_marker: bool,
    burst_type: u8,
    payload: &'a [u8; 33],
}

fn build_traffic_packet(p: TrafficPacket<'_>) -> Vec<u8> {
    let mut data = vec![0u8; TRAFFIC_PACKET_LEN];
    data[0] = p.packet_type;
    write_u32_be(&mut data, OFFSET_PEER_ID, p.peer_id);
    write_u24_be(&mut data, OFFSET_SRC, p.src);
    write_u24_be(&mut data, OFFSET_DST, p.dst);
    data[OFFSET_CALL_TYPE] = if p.group_call { CALL_TYPE_GROUP } else { CALL_TYPE_PRIVATE };
    write_u32_be(&mut data, OFFSET_CALL_CONTROL, p.call_control);

    let mut call_info = 0u8;
    if p.slot {
        call_info |= CALL_INFO_SLOT2;
    }
    if p.end_of_call {
        call_info |= CALL_INFO_END;
    }
    data[OFFSET_CALL_INFO] = call_info;

    data[OFFSET_RTP] = RTP_VERSION_BYTE;
    if p.rtp_marker {
        data[OFFSET_RTP + 1] |= RTP_MARKER;
    }
    data[OFFSET_RTP + 2..OFFSET_RTP + 4].copy_from_slice(&p.rtp_seq.to_be_bytes());
    // Timestamp stays zero; the SSRC slot carries the call control
    write_u32_be(&mut data, OFFSET_RTP + 8, p.call_control);

    data[OFFSET_BURST_TYPE] = p.burst_type;
    data[OFFSET_PAYLOAD..].copy_from_slice(p.payload);
    data
}
