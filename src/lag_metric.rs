//! Sliding-window evidence that a lazy peer is consistently ahead of
//! our current parent. For each peer, a set of distinct
//! rounds at which it delivered a qualifying `GlobalAggLazy`; the
//! cardinality of that set is the lag.

use crate::peer::PeerId;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default, Clone)]
pub struct LagMetric {
  by_peer: HashMap<PeerId, HashSet<i64>>,
}

impl LagMetric {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&mut self, peer: &str, round: i64) {
    self.by_peer.entry(peer.to_string()).or_default().insert(round);
  }

  pub fn get(&self, peer: &str) -> usize {
    self.by_peer.get(peer).map(HashSet::len).unwrap_or(0)
  }

  pub fn reset(&mut self) {
    self.by_peer.clear();
  }

  pub fn forget_older(&mut self, min_round: i64) {
    self.by_peer.retain(|_, rounds| {
      rounds.retain(|&r| r >= min_round);
      true
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn get_is_zero_for_unknown_peer() {
    let lm = LagMetric::new();
    assert_eq!(lm.get("A"), 0);
  }

  #[test]
  fn add_is_idempotent_per_round() {
    let mut lm = LagMetric::new();
    lm.add("C", 5);
    lm.add("C", 5);
    lm.add("C", 6);
    assert_eq!(lm.get("C"), 2);
  }

  #[test]
  fn forget_older_drops_only_strictly_older_rounds() {
    let mut lm = LagMetric::new();
    for r in 1..=5 {
      lm.add("C", r);
    }
    lm.forget_older(3);
    assert_eq!(lm.get("C"), 3); // rounds 3,4,5 remain
  }

  #[test]
  fn reset_clears_all_peers() {
    let mut lm = LagMetric::new();
    lm.add("C", 1);
    lm.add("D", 1);
    lm.reset();
    assert_eq!(lm.get("C"), 0);
    assert_eq!(lm.get("D"), 0);
  }
}
