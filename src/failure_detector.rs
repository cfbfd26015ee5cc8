//! Tracks the last local round in which any message was heard from
//! each peer, and derives peer-failed / peer-revived events from it.
//! Ping counts as liveness — the original system bumps `last_msg` for
//! every successfully decoded message type, Ping included.

use crate::peer::PeerId;
use std::collections::{HashMap, HashSet};

pub struct FailureDetector {
  last_msg: HashMap<PeerId, i64>,
  failed: HashSet<PeerId>,
}

impl FailureDetector {
  pub fn new() -> Self {
    Self {
      last_msg: HashMap::new(),
      failed: HashSet::new(),
    }
  }

  /// Records that a message (of any kind) arrived from `peer` during
  /// `round`. Returns `true` if this is a revival — `peer` was
  /// previously marked failed.
  pub fn touch(&mut self, peer: &str, round: i64) -> bool {
    self.last_msg.insert(peer.to_string(), round);
    self.failed.remove(peer)
  }

  pub fn is_failed(&self, peer: &str) -> bool {
    self.failed.contains(peer)
  }

  /// Currently failed peers, for the low-frequency ping emitter that
  /// keeps revival possible.
  pub fn failed_peers(&self) -> Vec<PeerId> {
    self.failed.iter().cloned().collect()
  }

  /// Sweeps every known peer; any peer silent for more than `r_max`
  /// rounds is marked failed and returned. Disabled during warm-up
  /// (`current_round < 10`) to tolerate staggered node start.
  pub fn sweep(
    &mut self,
    current_round: i64,
    known_peers: &[PeerId],
    r_max: i64,
  ) -> Vec<PeerId> {
    if current_round < 10 {
      return Vec::new();
    }
    let mut newly_failed = Vec::new();
    for peer in known_peers {
      if self.failed.contains(peer) {
        continue;
      }
      let last_heard = self.last_msg.get(peer).copied().unwrap_or(0);
      if current_round - last_heard > r_max {
        self.failed.insert(peer.clone());
        newly_failed.push(peer.clone());
      }
    }
    newly_failed
  }
}

impl Default for FailureDetector {
  fn default() -> Self {
    Self::new()
  }
}
