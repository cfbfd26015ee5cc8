//! The Node Engine: owns the round clock, dispatches inbound messages
//! to the right tree, drives elections and count estimation, and
//! orchestrates the per-round sweep across every known tree.
//!
//! All mutation goes through `&mut self` methods; the caller (see
//! `main.rs`) is expected to hold a single coarse lock around every
//! call — the state space here is too interlinked for
//! finer-grained locking to pay for itself.

use crate::{
  aggregate::Aggregate,
  config::Params,
  failure_detector::FailureDetector,
  message::Message,
  peer::PeerId,
  tree::Tree,
};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use tracing::{debug, info};

pub struct Engine {
  pub self_id: PeerId,
  pub value: f64,
  pub round: i64,
  pub count_estimate: i64,
  pub is_root: bool,
  pub known_peers: Vec<PeerId>,
  pub trees: HashMap<String, Tree>,
  failure_detector: FailureDetector,
  params: Params,
  rng: ChaCha8Rng,
}

impl Engine {
  pub fn new(self_id: PeerId, known_peers: Vec<PeerId>, params: Params, rng: ChaCha8Rng) -> Self {
    Self {
      self_id,
      value: 1.0,
      round: 0,
      count_estimate: 1,
      is_root: false,
      known_peers,
      trees: HashMap::new(),
      failure_detector: FailureDetector::new(),
      params,
      rng,
    }
  }

  pub fn params(&self) -> &Params {
    &self.params
  }

  /// Currently failed peers, for the low-frequency ping emitter that
  /// keeps revival possible (§4.8: `10 * T_agg` interval, driven by
  /// the transport shim rather than the round clock).
  pub fn failed_peers(&self) -> Vec<PeerId> {
    self.failure_detector.failed_peers()
  }

  /// Lexicographically largest tree ID among known trees — the only
  /// tree that produces or propagates traffic.
  pub fn best_tree_id(&self) -> Option<String> {
    self.trees.keys().max().cloned()
  }

  pub fn reported_mean(&self) -> Option<f64> {
    let best = self.best_tree_id()?;
    self.trees[&best].global_agg.map(|ga| ga.mean())
  }

  fn get_or_create_tree(&mut self, id: &str, round_evidence: Option<i64>) {
    if !self.trees.contains_key(id) {
      let initial_first_global = round_evidence.unwrap_or(self.round);
      let tree = Tree::new(id, initial_first_global, &self.known_peers);
      self.trees.insert(id.to_string(), tree);
    } else if let Some(round) = round_evidence {
      self.trees.get_mut(id).unwrap().observe_first_global_round(round);
    }
  }

  /// Records that any message arrived from `peer` during the current
  /// round. Returns whether this is a revival, in which case the peer
  /// is re-added as a child of every tree.
  pub fn record_liveness(&mut self, peer: &str) -> bool {
    let revived = self.failure_detector.touch(peer, self.round);
    if revived {
      info!(peer, "peer revived");
      for tree in self.trees.values_mut() {
        tree.add_new_peer(peer);
      }
    }
    revived
  }

  /// Dispatches an accepted, decoded message to the right tree. Inbound
  /// traffic on a non-best tree still creates/updates the tree record
  /// (so it can be promoted later) but its content is dropped.
  pub fn dispatch(&mut self, sender: &str, msg: Message) {
    match msg {
      Message::LocalAgg(m) => {
        let tree_id = m.tree_id.clone();
        self.get_or_create_tree(&tree_id, None);
        if self.best_tree_id().as_deref() != Some(tree_id.as_str()) {
          return;
        }
        let self_id = self.self_id.clone();
        let threshold = self.params.threshold;
        self
          .trees
          .get_mut(&tree_id)
          .unwrap()
          .on_local_agg(sender, &m, &self_id, threshold);
      }
      Message::GlobalAgg(m) => {
        let tree_id = m.tree_id.clone();
        self.get_or_create_tree(&tree_id, Some(m.value_round));
        if self.best_tree_id().as_deref() != Some(tree_id.as_str()) {
          return;
        }
        let round = self.round;
        self
          .trees
          .get_mut(&tree_id)
          .unwrap()
          .on_global_agg(sender, &m, round);
      }
      Message::GlobalAggLazy(m) => {
        let tree_id = m.tree_id.clone();
        self.get_or_create_tree(&tree_id, Some(m.value_round));
        if self.best_tree_id().as_deref() != Some(tree_id.as_str()) {
          return;
        }
        let round = self.round;
        self
          .trees
          .get_mut(&tree_id)
          .unwrap()
          .on_global_agg_lazy(sender, &m, round);
      }
      Message::Ping => {}
    }
  }

  /// Peer-added handling: a newly discovered peer joins
  /// every existing tree as a child.
  pub fn handle_peer_added(&mut self, peer: &str) {
    info!(peer, "peer added");
    for tree in self.trees.values_mut() {
      tree.add_new_peer(peer);
    }
    if !self.known_peers.iter().any(|p| p == peer) {
      self.known_peers.push(peer.to_string());
    }
  }

  fn remove_inactive_trees(&mut self) {
    let round = self.round;
    let r_max = self.params.r_max;
    let mut removed_ids = Vec::new();
    self.trees.retain(|id, tree| {
      let level = tree.effective_level() as i64;
      let keep = (round - tree.last_global_round) <= level * r_max;
      if !keep {
        removed_ids.push(id.clone());
      }
      keep
    });
    for id in removed_ids {
      debug!(tree = %id, "pruned inactive tree");
    }
  }

  /// Updates the count estimate once the best tree's global aggregate
  /// has settled past the full-count window.
  fn compute_count(&mut self) {
    let Some(best_id) = self.best_tree_id() else {
      return;
    };
    let tree = &self.trees[&best_id];
    let Some(ga) = tree.global_agg else {
      return;
    };
    if ga.round - tree.first_global_round > self.params.r_full {
      self.count_estimate = ga.count;
    }
  }

  /// Runs the per-round sweep across every tree,
  /// returning the outbound messages this node must now send.
  pub fn execute_round(&mut self) -> Vec<(PeerId, Message)> {
    self.round += 1;
    self.remove_inactive_trees();

    let failed =
      self
        .failure_detector
        .sweep(self.round, &self.known_peers, self.params.r_max);
    for peer in &failed {
      info!(peer, "peer marked failed");
      for tree in self.trees.values_mut() {
        tree.forget_peer(peer);
      }
    }

    let best_id = self.best_tree_id();
    let current_local = Aggregate::new(self.value, 1, self.round);
    let r_window = self.params.r_window;
    let threshold = self.params.threshold;

    let mut outbound = Vec::new();
    let mut demoted_roots = Vec::new();
    for (id, tree) in self.trees.iter_mut() {
      let is_best = best_id.as_deref() == Some(id.as_str());
      outbound.extend(tree.execute_round(current_local, is_best, r_window, threshold));
      if !is_best && tree.is_root {
        demoted_roots.push(id.clone());
      }
    }
    for id in demoted_roots {
      debug!(tree = %id, "own root tree lost best-tree status, removing");
      self.trees.remove(&id);
      self.is_root = false;
    }

    if self.trees.is_empty() {
      // §4.8: with zero trees there is no round traffic at all to
      // keep the failure detector warm on the other end, so every
      // peer gets a bare Ping instead.
      for peer in &self.known_peers {
        outbound.push((peer.clone(), Message::Ping));
      }
    } else {
      self.compute_count();
    }

    outbound
  }

  /// True once the warm-up period has elapsed and no tree is known;
  /// the election loop should be running.
  pub fn should_be_electing(&self) -> bool {
    self.round > 5 && self.trees.is_empty()
  }

  /// A single election-tick attempt. Returns `true` if this node just
  /// became the root of a newly created tree.
  pub fn try_elect_self_as_root(&mut self) -> bool {
    let u: f64 = self.rng.gen_range(0.0..1.0);
    let p = 1.0 / (self.count_estimate.max(1) as f64);
    if u > p {
      return false;
    }
    let id = self.self_id.clone();
    let round = self.round;
    let mut tree = Tree::new(&id, round, &self.known_peers);
    tree.is_root = true;
    tree.level = 0;
    tree.last_global_round = round;
    info!(tree = %id, round, "self-elected as root");
    self.trees.insert(id, tree);
    self.is_root = true;
    true
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::message::{GlobalAgg, GlobalAggLazy, LocalAgg};
  use rand::SeedableRng;

  fn params() -> Params {
    Params {
      t_agg: 1,
      t_elect: 1,
      r_max: 3,
      r_window: 10,
      r_full: 6,
      threshold: 5,
      startup_delay: 0,
    }
  }

  fn engine(id: &str, peers: &[&str]) -> Engine {
    Engine::new(
      id.to_string(),
      peers.iter().map(|s| s.to_string()).collect(),
      params(),
      ChaCha8Rng::seed_from_u64(42),
    )
  }

  #[test]
  fn one_node_self_elects_after_warmup() {
    let mut e = engine("A", &[]);
    for _ in 0..6 {
      e.execute_round();
    }
    assert!(e.should_be_electing());
    // drain randomness until success: with count_estimate == 1 every
    // draw succeeds deterministically (p == 1.0).
    assert!(e.try_elect_self_as_root());
    assert!(e.trees.contains_key("A"));
    assert!(e.trees["A"].is_root);
  }

  #[test]
  fn two_node_convergence_b_wins_best_tree() {
    let mut a = engine("A", &["B"]);
    let mut b = engine("B", &["A"]);
    a.value = 4.0;
    b.value = 6.0;

    for _ in 0..6 {
      a.execute_round();
      b.execute_round();
    }
    assert!(b.should_be_electing());
    assert!(b.try_elect_self_as_root());

    // propagate a GlobalAgg from B to A, simulating one wire hop
    for _ in 0..3 {
      let out_b = b.execute_round();
      for (to, msg) in out_b {
        if to == "A" {
          a.dispatch("B", msg);
        }
      }
      let out_a = a.execute_round();
      for (to, msg) in out_a {
        if to == "B" {
          b.dispatch("A", msg);
        }
      }
    }

    assert_eq!(a.best_tree_id().as_deref(), Some("B"));
    assert_eq!(a.trees["B"].parent.as_deref(), Some("B"));
    let ga = b.trees["B"].global_agg.expect("root should have global agg");
    assert_eq!(ga.value, 10.0);
    assert_eq!(ga.count, 2);
  }

  #[test]
  fn non_best_tree_content_is_dropped_but_record_kept() {
    let mut e = engine("M", &["A", "Z"]);
    e.round = 1;
    e.dispatch(
      "A",
      Message::GlobalAgg(GlobalAgg {
        tree_id: "A".into(),
        value: 1.0,
        count: 1,
        level: 0,
        value_round: 1,
        sender_round: 1,
      }),
    );
    // "Z" > "A" lexicographically, so once Z appears A is no longer best
    e.dispatch(
      "Z",
      Message::GlobalAggLazy(GlobalAggLazy {
        tree_id: "Z".into(),
        value_round: 1,
        sender_round: 1,
      }),
    );
    assert_eq!(e.best_tree_id().as_deref(), Some("Z"));
    // tree "A" exists but never got its global_agg populated beyond creation
    assert!(e.trees.contains_key("A"));
    assert!(e.trees.contains_key("Z"));
  }

  #[test]
  fn non_best_own_root_tree_is_pruned_and_is_root_clears() {
    // Two-root collapse (spec.md §8 scenario 5): this node self-elected
    // as root of tree "A", but tree "B" is also known and "B" > "A"
    // lexicographically, so "B" is best. After one round this node must
    // drop its own "A" tree and clear `is_root`.
    let mut e = engine("A", &[]);
    let mut root_tree = Tree::new("A", 0, &[]);
    root_tree.is_root = true;
    e.trees.insert("A".into(), root_tree);
    e.trees.insert("B".into(), Tree::new("B", 0, &[]));
    e.is_root = true;

    e.execute_round();

    assert!(!e.trees.contains_key("A"));
    assert!(e.trees.contains_key("B"));
    assert!(!e.is_root);
  }

  #[test]
  fn compute_count_updates_only_past_r_full_window() {
    let mut e = engine("M", &[]);
    let mut t = Tree::new("X", 0, &[]);
    // round - first_global_round == r_full (6): must not trust the count yet.
    t.global_agg = Some(Aggregate::new(5.0, 5, 6));
    e.trees.insert("X".into(), t);
    e.execute_round();
    assert_eq!(e.count_estimate, 1);

    // round - first_global_round == r_full + 1: now past the settling window.
    e.trees.get_mut("X").unwrap().global_agg = Some(Aggregate::new(5.0, 9, 7));
    e.execute_round();
    assert_eq!(e.count_estimate, 9);
  }

  #[test]
  fn zero_trees_pings_every_known_peer() {
    let mut e = engine("M", &["A", "B"]);
    let out = e.execute_round();
    assert_eq!(out.len(), 2);
    assert!(out.iter().all(|(_, msg)| matches!(msg, Message::Ping)));
  }

  #[test]
  fn peer_added_joins_every_tree_as_child() {
    let mut e = engine("M", &[]);
    e.trees.insert("X".into(), Tree::new("X", 0, &[]));
    e.handle_peer_added("N");
    assert!(e.trees["X"].is_child("N"));
    assert!(e.known_peers.contains(&"N".to_string()));
  }

  #[test]
  fn failed_peer_is_forgotten_by_every_tree() {
    let mut e = engine("M", &["P"]);
    e.trees.insert("X".into(), Tree::new("X", 0, &["P".to_string()]));
    e.record_liveness("P");
    for _ in 0..20 {
      e.execute_round();
    }
    assert!(!e.trees["X"].is_child("P"));
  }

  #[test]
  fn stale_local_agg_round_trip_through_dispatch() {
    let mut e = engine("B", &["A"]);
    e.trees.insert("B".into(), {
      let mut t = Tree::new("B", 0, &["A".to_string()]);
      t.is_root = true;
      t
    });
    e.dispatch(
      "A",
      Message::LocalAgg(LocalAgg {
        tree_id: "B".into(),
        value: 4.0,
        count: 1,
        sender_round: 5,
      }),
    );
    e.dispatch(
      "A",
      Message::LocalAgg(LocalAgg {
        tree_id: "B".into(),
        value: 999.0,
        count: 1,
        sender_round: 3,
      }),
    );
    assert_eq!(e.trees["B"].local_aggs["A"].value, 4.0);
  }
}
