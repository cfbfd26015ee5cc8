//! Peer identity. Identity is the ID alone — addresses are a
//! property looked up through the transport shim, never carried
//! around by the tree or engine state machines. See `transport::PeerTable`
//! for the address <-> ID registry.

use std::net::SocketAddr;

pub type PeerId = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
  pub id: PeerId,
  pub addr: SocketAddr,
}
