//! Out-of-band exchange channel: UDP packet codec, socket and worker loop.
//!
//! Discovery probes and QP parameter exchange run over a non-blocking UDP
//! socket bound to the configured port on all interfaces. All packet
//! fields are serialized little-endian on the wire.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::verbs::{Lid, Qpn};

use crate::ib::{NodeId, MAX_QPS_PER_CONNECTION};

use super::job::{JobChannel, QP_ID_UNUSED};

pub const PACKET_MAGIC: u32 = 0xBEEF_CA4E;

/// On-wire packet size: magic, type, nodeId, ident, lid, qpIds.
pub const PACKET_LEN: usize = 4 + 4 + 2 + 4 + 2 + 4 * MAX_QPS_PER_CONNECTION;

/// Ident field value for packet types that do not carry one.
const IDENT_UNUSED: u32 = 0xFFFF_FFFF;
/// Lid field value for packet types that do not carry one.
pub const LID_UNUSED: Lid = 0xFFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PacketType {
    DiscoveryReq = 0,
    DiscoveryResp = 1,
    ConInfo = 2,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// Not one of ours; dropped silently.
    #[error("bad packet magic")]
    BadMagic,
    /// Magic matched but the type is unknown; logged and dropped.
    #[error("unknown packet type {0}")]
    UnknownType(u32),
}

/// An exchange datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub ty: PacketType,
    /// Sender's node id.
    pub node_id: NodeId,
    /// Sender's connection manager incarnation.
    pub ident: u32,
    /// Sender's IB LID.
    pub lid: Lid,
    /// Sender's physical QP numbers, `0xFFFF_FFFF` = unused slot.
    pub qp_ids: [Qpn; MAX_QPS_PER_CONNECTION],
}

impl Packet {
    pub fn discovery_req(node_id: NodeId) -> Self {
        Packet {
            ty: PacketType::DiscoveryReq,
            node_id,
            ident: IDENT_UNUSED,
            lid: LID_UNUSED,
            qp_ids: [QP_ID_UNUSED; MAX_QPS_PER_CONNECTION],
        }
    }

    pub fn discovery_resp(node_id: NodeId) -> Self {
        Packet {
            ty: PacketType::DiscoveryResp,
            ..Self::discovery_req(node_id)
        }
    }

    pub fn con_info(
        node_id: NodeId,
        ident: u32,
        lid: Lid,
        qp_ids: [Qpn; MAX_QPS_PER_CONNECTION],
    ) -> Self {
        Packet {
            ty: PacketType::ConInfo,
            node_id,
            ident,
            lid,
            qp_ids,
        }
    }

    /// Serialize to the wire layout, little-endian.
    pub fn to_bytes(&self) -> [u8; PACKET_LEN] {
        let mut bytes = [0u8; PACKET_LEN];
        bytes[0..4].copy_from_slice(&PACKET_MAGIC.to_le_bytes());
        bytes[4..8].copy_from_slice(&(self.ty as u32).to_le_bytes());
        bytes[8..10].copy_from_slice(&self.node_id.to_le_bytes());
        bytes[10..14].copy_from_slice(&self.ident.to_le_bytes());
        bytes[14..16].copy_from_slice(&self.lid.to_le_bytes());
        for (i, qp_id) in self.qp_ids.iter().enumerate() {
            let at = 16 + 4 * i;
            bytes[at..at + 4].copy_from_slice(&qp_id.to_le_bytes());
        }
        bytes
    }

    /// Parse from the wire layout.
    pub fn from_bytes(bytes: &[u8; PACKET_LEN]) -> Result<Self, PacketError> {
        let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if magic != PACKET_MAGIC {
            return Err(PacketError::BadMagic);
        }

        let raw_ty = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let ty = match raw_ty {
            0 => PacketType::DiscoveryReq,
            1 => PacketType::DiscoveryResp,
            2 => PacketType::ConInfo,
            unknown => return Err(PacketError::UnknownType(unknown)),
        };

        let mut qp_ids = [QP_ID_UNUSED; MAX_QPS_PER_CONNECTION];
        for (i, qp_id) in qp_ids.iter_mut().enumerate() {
            let at = 16 + 4 * i;
            *qp_id = u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
        }

        Ok(Packet {
            ty,
            node_id: u16::from_le_bytes(bytes[8..10].try_into().unwrap()),
            ident: u32::from_le_bytes(bytes[10..14].try_into().unwrap()),
            lid: u16::from_le_bytes(bytes[14..16].try_into().unwrap()),
            qp_ids,
        })
    }
}

/// The non-blocking UDP socket the exchange worker and the job worker
/// send through. Peers are expected to listen on the same port.
pub struct ExchangeSocket {
    socket: UdpSocket,
    port: u16,
}

impl ExchangeSocket {
    /// Bind on all interfaces.
    pub fn new(port: u16) -> io::Result<Self> {
        Self::bound(Ipv4Addr::UNSPECIFIED, port)
    }

    /// Bind to a specific local address; all peers still share one port.
    pub fn bound(bind_addr: Ipv4Addr, port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(bind_addr, port))?;
        socket.set_nonblocking(true)?;
        let port = socket.local_addr()?.port();
        log::debug!("opened UDP exchange socket on {}:{}", bind_addr, port);
        Ok(ExchangeSocket { socket, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Fire-and-forget send; transient failures are logged and the
    /// discovery loop retries.
    pub fn send_packet(&self, packet: &Packet, dest: Ipv4Addr) {
        let bytes = packet.to_bytes();
        match self.socket.send_to(&bytes, SocketAddrV4::new(dest, self.port)) {
            Ok(sent) if sent == bytes.len() => {}
            Ok(sent) => {
                log::error!(
                    "sending {:?} to {} truncated ({} of {} bytes)",
                    packet.ty,
                    dest,
                    sent,
                    bytes.len()
                );
            }
            Err(e) => {
                log::error!("sending {:?} to {} failed: {}", packet.ty, dest, e);
            }
        }
    }

    /// Non-blocking receive of one datagram. Returns `None` when no
    /// complete packet is available.
    pub fn receive(&self) -> Option<(Result<Packet, PacketError>, Ipv4Addr)> {
        let mut bytes = [0u8; PACKET_LEN];
        let (len, from) = match self.socket.recv_from(&mut bytes) {
            Ok(received) => received,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
            Err(e) => {
                log::error!("receiving on exchange socket failed: {}", e);
                return None;
            }
        };

        // anything but an exact-size datagram is noise
        if len != PACKET_LEN {
            return None;
        }
        let src = match from {
            SocketAddr::V4(v4) => *v4.ip(),
            SocketAddr::V6(_) => return None,
        };

        Some((Packet::from_bytes(&bytes), src))
    }
}

/// Exchange worker loop body: receive, classify, dispatch to the job
/// worker. Runs until `run` is cleared.
pub(crate) fn run_exchange_loop(
    run: &AtomicBool,
    own_node_id: NodeId,
    socket: &ExchangeSocket,
    jobs: &JobChannel,
) {
    while run.load(Ordering::Relaxed) {
        match socket.receive() {
            Some((Ok(packet), src)) => {
                log::trace!(
                    "received {:?} from {}, nodeId {:#x}",
                    packet.ty,
                    src,
                    packet.node_id
                );
                match packet.ty {
                    PacketType::DiscoveryReq => {
                        socket.send_packet(&Packet::discovery_resp(own_node_id), src);
                    }
                    PacketType::DiscoveryResp => {
                        jobs.add_discovered_job(packet.node_id, src);
                    }
                    PacketType::ConInfo => {
                        jobs.add_create_with_remote_job(
                            packet.node_id,
                            packet.ident,
                            packet.lid,
                            packet.qp_ids,
                        );
                    }
                }
            }
            Some((Err(PacketError::BadMagic), _)) => {}
            Some((Err(PacketError::UnknownType(ty)), src)) => {
                log::error!("unknown packet type {} from {}", ty, src);
            }
            None => {
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn con_info_round_trip() {
        let mut qp_ids = [QP_ID_UNUSED; MAX_QPS_PER_CONNECTION];
        qp_ids[0] = 0x11;
        qp_ids[1] = 0x22;
        let packet = Packet::con_info(0x0042, 0xDEAD_BEEF, 0x0007, qp_ids);

        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), PACKET_LEN);
        assert_eq!(Packet::from_bytes(&bytes).unwrap(), packet);
    }

    #[test]
    fn wire_layout_is_little_endian() {
        let packet = Packet::discovery_req(0x1234);
        let bytes = packet.to_bytes();
        assert_eq!(&bytes[0..4], &[0x4E, 0xCA, 0xEF, 0xBE]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
        assert_eq!(&bytes[8..10], &[0x34, 0x12]);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut bytes = Packet::discovery_req(1).to_bytes();
        bytes[0] ^= 0xFF;
        assert_eq!(Packet::from_bytes(&bytes), Err(PacketError::BadMagic));
    }

    #[test]
    fn unknown_type_rejected() {
        let mut bytes = Packet::discovery_req(1).to_bytes();
        bytes[4..8].copy_from_slice(&99u32.to_le_bytes());
        assert_eq!(
            Packet::from_bytes(&bytes),
            Err(PacketError::UnknownType(99))
        );
    }

    #[test]
    fn socket_delivers_packets_locally() {
        let a = ExchangeSocket::new(0).unwrap();
        let b = ExchangeSocket::new(0).unwrap();

        // explicit port routing: send_packet targets the shared configured
        // port, so talk to b's port directly here
        let packet = Packet::discovery_resp(3);
        a.socket
            .send_to(
                &packet.to_bytes(),
                SocketAddrV4::new(Ipv4Addr::LOCALHOST, b.port()),
            )
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        loop {
            if let Some((parsed, src)) = b.receive() {
                assert_eq!(parsed.unwrap(), packet);
                assert_eq!(src, Ipv4Addr::LOCALHOST);
                break;
            }
            assert!(std::time::Instant::now() < deadline, "no packet received");
            thread::sleep(Duration::from_millis(1));
        }
    }
}
