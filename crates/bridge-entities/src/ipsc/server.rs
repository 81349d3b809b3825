//! IPSC master server: UDP endpoint, HMAC authentication and packet dispatch

use core::fmt;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use hmac::{Hmac, Mac};
use sha1::Sha1;

use bridge_config::CfgIpscAuth;
use bridge_proto::dmrd::DmrdPacket;
use bridge_proto::ipsc::*;

use crate::translator::Translator;

use super::peers::PeerRegistry;

type HmacSha1 = Hmac<Sha1>;

/// Truncated HMAC-SHA1 tag carried at the end of authenticated packets
const AUTH_TAG_LEN: usize = 10;

// Mode byte: peer operational | digital | TS1 on | TS2 on
const MODE_PEER_OPERATIONAL: u8 = 0b0100_0000;
const MODE_DIGITAL: u8 = 0b0010_0000;
const MODE_TS1_ON: u8 = 0b0000_1000;
const MODE_TS2_ON: u8 = 0b0000_0010;

// Last flags byte: operational-reported base bits, plus auth when enabled
const FLAGS_BASE: u8 = 0x0D;
const FLAGS_AUTHENTICATED: u8 = 0x10;

/// Software name reported in master-register replies, padded to a fixed width
const REGISTER_REPLY_NAME_LEN: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpscError {
    PacketTooShort(usize),
    UnknownPacketType(u8),
    /// A reply-type packet landed on the server; we are the master
    PacketIgnored,
    AuthFailed,
}

impl fmt::Display for IpscError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PacketTooShort(n) => write!(f, "IPSC packet too short: {} bytes", n),
            Self::UnknownPacketType(t) => write!(f, "unknown IPSC packet type {:#04x}", t),
            Self::PacketIgnored => write!(f, "reply-type IPSC packet ignored"),
            Self::AuthFailed => write!(f, "IPSC packet failed authentication"),
        }
    }
}

impl std::error::Error for IpscError {}

/// What the receive loop should do with a handled packet
#[derive(Debug)]
pub enum PacketAction {
    None,
    Reply(Vec<u8>),
    /// Translated DMRD frames to hand to the MMDVM side
    Traffic(Vec<DmrdPacket>),
}

/// Stateful IPSC endpoint. Packet handling is synchronous and socket-free
/// so tests can drive it directly; `spawn` wires it to a real socket.
pub struct IpscServer {
    local_id: u32,
    /// 20-byte HMAC key when authentication is enabled
    auth_key: Option<Vec<u8>>,
    peers: PeerRegistry,
    translator: Arc<Translator>,
}

impl IpscServer {
    pub fn new(local_id: u32, auth: &CfgIpscAuth, translator: Arc<Translator>) -> Self {
        let auth_key = if auth.enabled {
            Some(decode_auth_key(&auth.key))
        } else {
            None
        };
        Self {
            local_id,
            auth_key,
            peers: PeerRegistry::new(),
            translator,
        }
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    // ─── Authentication ──────────────────────────────────────────

    /// Verify the trailing HMAC-SHA1 tag of `data`. Always true when
    /// authentication is disabled.
    pub fn auth(&self, data: &[u8]) -> bool {
        let Some(key) = &self.auth_key else {
            return true;
        };
        if data.len() < AUTH_TAG_LEN {
            return false;
        }
        let (payload, tag) = data.split_at(data.len() - AUTH_TAG_LEN);
        let Ok(mut mac) = HmacSha1::new_from_slice(key) else {
            return false;
        };
        mac.update(payload);
        // Constant-time comparison of the truncated tag
        mac.verify_truncated_left(tag).is_ok()
    }

    /// Append the truncated HMAC-SHA1 tag when authentication is enabled.
    pub fn tag_outbound(&self, mut data: Vec<u8>) -> Vec<u8> {
        if let Some(key) = &self.auth_key {
            if let Ok(mut mac) = HmacSha1::new_from_slice(key) {
                mac.update(&data);
                let tag = mac.finalize().into_bytes();
                data.extend_from_slice(&tag[..AUTH_TAG_LEN]);
            }
        }
        data
    }

    // ─── Dispatch ────────────────────────────────────────────────

    /// Handle one datagram and decide what to send back, if anything.
    pub fn handle_packet(&self, data: &[u8], addr: SocketAddr) -> Result<PacketAction, IpscError> {
        let data = if self.auth_key.is_some() {
            if !self.auth(data) {
                return Err(IpscError::AuthFailed);
            }
            &data[..data.len() - AUTH_TAG_LEN]
        } else {
            data
        };

        if data.is_empty() {
            return Err(IpscError::PacketTooShort(0));
        }

        match data[0] {
            PACKET_TYPE_MASTER_REGISTER_REQUEST => {
                let peer_id = parse_peer_id(data)?;
                self.peers
                    .upsert(peer_id, addr, self.default_mode_byte(), self.default_flags_bytes());
                Ok(PacketAction::Reply(self.build_master_register_reply()))
            }
            PACKET_TYPE_PEER_LIST_REQUEST => {
                let peer_id = parse_peer_id(data)?;
                self.peers.touch(peer_id);
                Ok(PacketAction::Reply(self.build_peer_list_reply()))
            }
            PACKET_TYPE_MASTER_ALIVE_REQUEST => {
                let peer_id = parse_peer_id(data)?;
                self.peers.mark_alive(peer_id, addr);
                self.peers.note_keep_alive_sent(peer_id);
                Ok(PacketAction::Reply(self.build_master_alive_reply()))
            }
            PACKET_TYPE_REPEATER_WAKE_UP => {
                let peer_id = parse_peer_id(data)?;
                if self.peers.get(peer_id).is_none() {
                    self.peers
                        .upsert(peer_id, addr, self.default_mode_byte(), self.default_flags_bytes());
                }
                Ok(PacketAction::None)
            }
            t if is_traffic_type(t) => {
                let peer_id = parse_peer_id(data)?;
                self.peers.touch(peer_id);
                Ok(PacketAction::Traffic(self.translator.translate_to_dmrd(t, data)))
            }
            PACKET_TYPE_MASTER_REGISTER_REPLY
            | PACKET_TYPE_PEER_LIST_REPLY
            | PACKET_TYPE_MASTER_ALIVE_REPLY => Err(IpscError::PacketIgnored),
            other => Err(IpscError::UnknownPacketType(other)),
        }
    }

    /// Queue IPSC datagrams towards every registered peer, tagging each
    /// when authentication is enabled.
    pub fn send_to_peers(&self, payloads: &[Vec<u8>], tx_queue: &Sender<(Vec<u8>, SocketAddr)>) {
        for addr in self.peers.registered_addrs() {
            for payload in payloads {
                let data = self.tag_outbound(payload.clone());
                if tx_queue.send((data, addr)).is_err() {
                    return;
                }
            }
        }
    }

    // ─── Reply builders ──────────────────────────────────────────

    fn default_mode_byte(&self) -> u8 {
        MODE_PEER_OPERATIONAL | MODE_DIGITAL | MODE_TS1_ON | MODE_TS2_ON
    }

    fn default_flags_bytes(&self) -> [u8; 4] {
        let mut flags = [0u8; 4];
        flags[3] = FLAGS_BASE;
        if self.auth_key.is_some() {
            flags[3] |= FLAGS_AUTHENTICATED;
        }
        flags
    }

    fn build_master_register_reply(&self) -> Vec<u8> {
        let mut reply = Vec::with_capacity(10 + REGISTER_REPLY_NAME_LEN);
        reply.push(PACKET_TYPE_MASTER_REGISTER_REPLY);
        reply.extend_from_slice(&self.local_id.to_be_bytes());
        reply.push(self.default_mode_byte());
        reply.extend_from_slice(&self.default_flags_bytes());
        let mut name = format!("ipsc-bridge {}", env!("CARGO_PKG_VERSION")).into_bytes();
        name.resize(REGISTER_REPLY_NAME_LEN, b' ');
        reply.extend_from_slice(&name);
        reply
    }

    /// 7-byte header followed by 11 bytes per peer:
    /// [u32 peer ID][4 IPv4 octets][u16 port][u8 mode]
    fn build_peer_list_reply(&self) -> Vec<u8> {
        let peers = self.peers.snapshot();
        let mut reply = Vec::with_capacity(7 + 11 * peers.len());
        reply.push(PACKET_TYPE_PEER_LIST_REPLY);
        reply.extend_from_slice(&self.local_id.to_be_bytes());
        reply.extend_from_slice(&(peers.len() as u16).to_be_bytes());
        for (peer_id, peer) in peers {
            reply.extend_from_slice(&peer_id.to_be_bytes());
            match peer.addr.ip() {
                IpAddr::V4(ip) => reply.extend_from_slice(&ip.octets()),
                IpAddr::V6(_) => reply.extend_from_slice(&[0u8; 4]),
            }
            reply.extend_from_slice(&peer.addr.port().to_be_bytes());
            reply.push(peer.mode);
        }
        reply
    }

    fn build_master_alive_reply(&self) -> Vec<u8> {
        let mut reply = Vec::with_capacity(11);
        reply.push(PACKET_TYPE_MASTER_ALIVE_REPLY);
        reply.extend_from_slice(&self.local_id.to_be_bytes());
        reply.push(self.default_mode_byte());
        reply.extend_from_slice(&self.default_flags_bytes());
        reply.push(self.peers.count() as u8);
        reply
    }
}

/// Peer ID from bytes 1..5 of any control packet
fn parse_peer_id(data: &[u8]) -> Result<u32, IpscError> {
    if data.len() < 5 {
        return Err(IpscError::PacketTooShort(data.len()));
    }
    Ok(read_u32_be(data, OFFSET_PEER_ID))
}

/// The configured key is up to 40 hex characters, zero-padded on the
/// left to the full 20 key bytes.
fn decode_auth_key(key: &str) -> Vec<u8> {
    let padded = format!("{:0>40}", key);
    hex::decode(padded).unwrap_or_default()
}

// ─── Socket plumbing ─────────────────────────────────────────────

/// Running server: the shared dispatch state plus the transmit queue
/// feeding the single writer thread.
#[derive(Clone)]
pub struct IpscServerHandle {
    server: Arc<IpscServer>,
    tx_queue: Sender<(Vec<u8>, SocketAddr)>,
}

impl IpscServerHandle {
    pub fn server(&self) -> &Arc<IpscServer> {
        &self.server
    }

    /// Fan IPSC datagrams out to every registered peer repeater.
    pub fn send_to_peers(&self, payloads: &[Vec<u8>]) {
        self.server.send_to_peers(payloads, &self.tx_queue);
    }
}

/// Bind the configured address and start the receive and transmit
/// threads. Translated traffic frames are delivered on `frames_tx`.
pub fn spawn(
    server: Arc<IpscServer>,
    bind_addr: SocketAddr,
    frames_tx: Sender<DmrdPacket>,
    running: Arc<AtomicBool>,
) -> std::io::Result<IpscServerHandle> {
    let socket = UdpSocket::bind(bind_addr)?;
    socket.set_read_timeout(Some(Duration::from_millis(100)))?;
    let tx_socket = socket.try_clone()?;

    let (tx_queue, tx_drain) = unbounded::<(Vec<u8>, SocketAddr)>();

    {
        let server = server.clone();
        let tx_queue = tx_queue.clone();
        let running = running.clone();
        thread::Builder::new()
            .name("ipsc-rx".into())
            .spawn(move || receive_loop(server, socket, tx_queue, frames_tx, running))?;
    }

    {
        let running = running.clone();
        thread::Builder::new()
            .name("ipsc-tx".into())
            .spawn(move || transmit_loop(tx_socket, tx_drain, running))?;
    }

    tracing::info!("IPSC server listening on {}", bind_addr);
    Ok(IpscServerHandle { server, tx_queue })
}

fn receive_loop(
    server: Arc<IpscServer>,
    socket: UdpSocket,
    tx_queue: Sender<(Vec<u8>, SocketAddr)>,
    frames_tx: Sender<DmrdPacket>,
    running: Arc<AtomicBool>,
) {
    let mut buf = [0u8; 2048];
    while running.load(Ordering::SeqCst) {
        let (len, addr) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                tracing::warn!("IPSC socket read error: {}", e);
                break;
            }
        };

        match server.handle_packet(&buf[..len], addr) {
            Ok(PacketAction::None) => {}
            Ok(PacketAction::Reply(reply)) => {
                let reply = server.tag_outbound(reply);
                if tx_queue.send((reply, addr)).is_err() {
                    break;
                }
            }
            Ok(PacketAction::Traffic(frames)) => {
                for frame in frames {
                    if frames_tx.send(frame).is_err() {
                        return;
                    }
                }
            }
            Err(IpscError::AuthFailed) => {
                tracing::warn!("dropping unauthenticated IPSC packet from {}", addr);
            }
            Err(IpscError::UnknownPacketType(t)) => {
                tracing::warn!("unknown IPSC packet type {:#04x} from {}", t, addr);
            }
            Err(e @ (IpscError::PacketTooShort(_) | IpscError::PacketIgnored)) => {
                tracing::debug!("dropping IPSC packet from {}: {}", addr, e);
            }
        }
    }
}

fn transmit_loop(
    socket: UdpSocket,
    tx_drain: Receiver<(Vec<u8>, SocketAddr)>,
    running: Arc<AtomicBool>,
) {
    loop {
        match tx_drain.recv_timeout(Duration::from_millis(100)) {
            Ok((data, addr)) => {
                if let Err(e) = socket.send_to(&data, addr) {
                    tracing::warn!("IPSC send to {} failed: {}", addr, e);
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if !running.load(Ordering::SeqCst) {
                    // Queue stayed empty through the grace window; done
                    break;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_server(auth_enabled: bool, key: &str) -> IpscServer {
        let auth = CfgIpscAuth { enabled: auth_enabled, key: key.to_string() };
        IpscServer::new(311860, &auth, Arc::new(Translator::new(311860)))
    }

    fn test_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9999)
    }

    #[test]
    fn test_auth_key_decoding() {
        let server = test_server(true, "1234");
        assert_eq!(server.auth_key.as_ref().unwrap().len(), 20);
        let mut expected = vec![0u8; 18];
        expected.extend_from_slice(&[0x12, 0x34]);
        assert_eq!(server.auth_key.as_ref().unwrap(), &expected);

        let server = test_server(false, "");
        assert!(server.auth_key.is_none());
    }

    #[test]
    fn test_auth_round_trip() {
        let server = test_server(true, "1234");
        let tagged = server.tag_outbound(b"hello world".to_vec());
        assert_eq!(tagged.len(), 11 + AUTH_TAG_LEN);
        assert!(server.auth(&tagged));
    }

    #[test]
    fn test_auth_rejects_bad_tag() {
        let server = test_server(true, "1234");
        let mut tagged = server.tag_outbound(b"hello world".to_vec());
        // Any single bit flip in the tag must be rejected
        let last = tagged.len() - 1;
        tagged[last] ^= 0x01;
        assert!(!server.auth(&tagged));

        // All-zero tag as well
        let mut zeroed = b"hello world".to_vec();
        zeroed.extend_from_slice(&[0u8; AUTH_TAG_LEN]);
        assert!(!server.auth(&zeroed));
    }

    #[test]
    fn test_auth_disabled_accepts_anything() {
        let server = test_server(false, "");
        assert!(server.auth(b"anything"));
        assert!(server.auth(&[]));
    }

    #[test]
    fn test_default_mode_byte() {
        let server = test_server(false, "");
        assert_eq!(server.default_mode_byte(), 0x6A);
    }

    #[test]
    fn test_default_flags_bytes() {
        let server = test_server(false, "");
        assert_eq!(server.default_flags_bytes(), [0, 0, 0, 0x0D]);

        let server = test_server(true, "1234");
        assert_eq!(server.default_flags_bytes(), [0, 0, 0, 0x0D | 0x10]);
    }

    #[test]
    fn test_master_register_reply_layout() {
        let server = test_server(false, "");
        let reply = server.build_master_register_reply();
        assert_eq!(reply[0], PACKET_TYPE_MASTER_REGISTER_REPLY);
        assert_eq!(read_u32_be(&reply, 1), 311860);
        assert_eq!(reply[5], 0x6A);
        assert_eq!(reply.len(), 10 + REGISTER_REPLY_NAME_LEN);
    }

    #[test]
    fn test_master_alive_reply_layout() {
        let server = test_server(false, "");
        let reply = server.build_master_alive_reply();
        assert_eq!(reply[0], PACKET_TYPE_MASTER_ALIVE_REPLY);
        assert_eq!(read_u32_be(&reply, 1), 311860);
        assert_eq!(reply[5], 0x6A);
        assert_eq!(reply[10], 0, "no peers registered yet");
        assert_eq!(reply.len(), 11);
    }

    #[test]
    fn test_peer_list_reply_layout() {
        let server = test_server(false, "");
        let reply = server.build_peer_list_reply();
        assert_eq!(reply[0], PACKET_TYPE_PEER_LIST_REPLY);
        assert_eq!(u16::from_be_bytes([reply[5], reply[6]]), 0);
        assert_eq!(reply.len(), 7);

        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)), 50000);
        server.peers.upsert(42, addr, 0x6A, server.default_flags_bytes());
        let reply = server.build_peer_list_reply();
        assert_eq!(u16::from_be_bytes([reply[5], reply[6]]), 1);
        assert_eq!(reply.len(), 7 + 11);
        assert_eq!(read_u32_be(&reply, 7), 42);
        assert_eq!(&reply[11..15], &[192, 168, 1, 100]);
        assert_eq!(u16::from_be_bytes([reply[15], reply[16]]), 50000);
        assert_eq!(reply[17], 0x6A);
    }

    #[test]
    fn test_parse_peer_id() {
        let mut data = vec![0x90u8, 0, 0, 0, 0];
        data[1..5].copy_from_slice(&12345u32.to_be_bytes());
        assert_eq!(parse_peer_id(&data).unwrap(), 12345);

        assert_eq!(
            parse_peer_id(&[0x90, 0x00]),
            Err(IpscError::PacketTooShort(2))
        );

        let max = [0x90, 0xFF, 0xFF, 0xFF, 0xFF];
        assert_eq!(parse_peer_id(&max).unwrap(), 0xFFFF_FFFF);
    }

    #[test]
    fn test_handle_packet_empty() {
        let server = test_server(false, "");
        assert_eq!(
            server.handle_packet(&[], test_addr()).unwrap_err(),
            IpscError::PacketTooShort(0)
        );
    }

    #[test]
    fn test_handle_packet_unknown_type() {
        let server = test_server(false, "");
        assert_eq!(
            server.handle_packet(&[0xFF, 0, 0, 0, 1], test_addr()).unwrap_err(),
            IpscError::UnknownPacketType(0xFF)
        );
    }

    #[test]
    fn test_handle_packet_reply_types_ignored() {
        let server = test_server(false, "");
        for t in [
            PACKET_TYPE_MASTER_REGISTER_REPLY,
            PACKET_TYPE_PEER_LIST_REPLY,
            PACKET_TYPE_MASTER_ALIVE_REPLY,
        ] {
            let mut data = vec![0u8; 5];
            data[0] = t;
            assert_eq!(
                server.handle_packet(&data, test_addr()).unwrap_err(),
                IpscError::PacketIgnored,
                "type {:#04x}",
                t
            );
        }
    }

    #[test]
    fn test_handle_packet_auth_enforced() {
        let server = test_server(true, "beef");
        let mut register = vec![0u8; 5];
        register[0] = PACKET_TYPE_MASTER_REGISTER_REQUEST;
        register[1..5].copy_from_slice(&77u32.to_be_bytes());

        // Untagged packet is dropped
        assert_eq!(
            server.handle_packet(&register, test_addr()).unwrap_err(),
            IpscError::AuthFailed
        );

        // Properly tagged packet registers the peer
        let tagged = server.tag_outbound(register);
        let action = server.handle_packet(&tagged, test_addr()).unwrap();
        assert!(matches!(action, PacketAction::Reply(_)));
        assert_eq!(server.peers.count(), 1);
    }
}
