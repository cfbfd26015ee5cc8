//! The UDP transport shim: turns the fixed peer list into a send/recv
//! surface the engine's message loop can drive. Keeps a `PeerId <->
//! SocketAddr` table on each side (outbound lookup by ID, inbound
//! lookup by source address) so the tree/engine state machines never
//! need to know an address, only an ID.

use crate::{message::Message, peer::PeerId};
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::net::UdpSocket;
use tracing::warn;

/// Matches the original system's UDP read buffer size, comfortably
/// above any single-hop Ethernet MTU.
const RECV_BUFFER_BYTES: usize = 1472;

#[derive(Clone)]
pub struct PeerTable {
  addr_by_id: HashMap<PeerId, SocketAddr>,
  id_by_addr: HashMap<SocketAddr, PeerId>,
}

impl PeerTable {
  pub fn new(peer_ids: &[PeerId], peer_addrs: &[SocketAddr]) -> Self {
    let mut addr_by_id = HashMap::new();
    let mut id_by_addr = HashMap::new();
    for (id, addr) in peer_ids.iter().zip(peer_addrs.iter()) {
      addr_by_id.insert(id.clone(), *addr);
      id_by_addr.insert(*addr, id.clone());
    }
    Self {
      addr_by_id,
      id_by_addr,
    }
  }

  pub fn addr_of(&self, id: &str) -> Option<SocketAddr> {
    self.addr_by_id.get(id).copied()
  }

  /// The original system matches inbound datagrams to a peer by IP
  /// only, ignoring the source port (peers always send from an
  /// ephemeral port, never their listen port). We mirror that here.
  pub fn id_of(&self, from: SocketAddr) -> Option<&PeerId> {
    self.id_by_addr.iter().find_map(|(addr, id)| {
      if addr.ip() == from.ip() {
        Some(id)
      } else {
        None
      }
    })
  }

  pub fn ids(&self) -> impl Iterator<Item = &PeerId> {
    self.addr_by_id.keys()
  }
}

pub struct Transport {
  socket: Arc<UdpSocket>,
  peers: PeerTable,
}

impl Transport {
  pub async fn bind(
    listen_addr: SocketAddr,
    peers: PeerTable,
  ) -> std::io::Result<Self> {
    let socket = UdpSocket::bind(listen_addr).await?;
    Ok(Self {
      socket: Arc::new(socket),
      peers,
    })
  }

  pub fn peers(&self) -> &PeerTable {
    &self.peers
  }

  /// Sends a message to a known peer. Unknown peer IDs are logged and
  /// dropped rather than treated as fatal — the engine may still hold
  /// a stale reference to a peer removed from the running config.
  pub async fn send(&self, to: &str, msg: &Message) {
    let Some(addr) = self.peers.addr_of(to) else {
      warn!(peer = to, "dropping outbound message to unknown peer");
      return;
    };
    if let Err(err) = self.socket.send_to(&msg.encode(), addr).await {
      warn!(peer = to, %err, "failed to send datagram");
    }
  }

  /// Blocks until a well-formed message arrives from a recognized
  /// peer, silently discarding anything else. Returns the sender's
  /// peer ID alongside the decoded message.
  pub async fn recv(&self) -> (PeerId, Message) {
    let mut buf = [0u8; RECV_BUFFER_BYTES];
    loop {
      let (len, from) = match self.socket.recv_from(&mut buf).await {
        Ok(pair) => pair,
        Err(err) => {
          warn!(%err, "transport recv error");
          continue;
        }
      };
      let Some(sender) = self.peers.id_of(from).cloned() else {
        warn!(%from, "dropping datagram from unrecognized address");
        continue;
      };
      match Message::decode(&buf[..len]) {
        Ok(msg) => return (sender, msg),
        Err(err) => {
          warn!(peer = %sender, %err, "dropping malformed datagram");
          continue;
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn table() -> PeerTable {
    PeerTable::new(
      &["A".to_string(), "B".to_string()],
      &[
        "127.0.0.1:9001".parse().unwrap(),
        "127.0.0.2:9002".parse().unwrap(),
      ],
    )
  }

  #[test]
  fn addr_of_resolves_known_peer() {
    let t = table();
    assert_eq!(t.addr_of("A"), Some("127.0.0.1:9001".parse().unwrap()));
    assert_eq!(t.addr_of("Z"), None);
  }

  #[test]
  fn id_of_matches_by_ip_ignoring_source_port() {
    let t = table();
    let from: SocketAddr = "127.0.0.1:55555".parse().unwrap();
    assert_eq!(t.id_of(from), Some(&"A".to_string()));
  }

  #[test]
  fn id_of_is_none_for_unrecognized_address() {
    let t = table();
    let from: SocketAddr = "10.0.0.9:1".parse().unwrap();
    assert_eq!(t.id_of(from), None);
  }
}
