pub mod peers;
pub mod server;

pub use peers::{Peer, PeerRegistry};
pub use server::{IpscError, IpscServer, IpscServerHandle, PacketAction};
