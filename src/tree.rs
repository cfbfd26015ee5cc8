//! Per-root aggregation state machine.
//!
//! Role membership is modeled as a closed sum on each known peer
//! (`Role::Child` / `Role::Lazy`) — easier to keep the "at most one
//! relationship per peer" invariant than juggling three disjoint
//! collections. The parent is tracked separately as a bare ID: a
//! relation plus lookup key, never an owning pointer. The peer
//! registry itself lives in the transport shim.

use crate::{
  aggregate::Aggregate,
  lag_metric::LagMetric,
  message::{GlobalAgg, GlobalAggLazy, LocalAgg, Message},
  peer::PeerId,
};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
  Child,
  Lazy,
}

#[derive(Debug, Clone)]
pub struct Tree {
  pub id: String,
  pub first_global_round: i64,
  pub last_global_round: i64,
  pub current_round: i64,
  pub parent: Option<PeerId>,
  pub parent_lag: LagMetric,
  pub parent_last_changed: i64,
  pub is_root: bool,
  pub level: u32,
  pub local_aggs: HashMap<PeerId, Aggregate>,
  pub global_agg: Option<Aggregate>,
  last_round: HashMap<PeerId, i64>,
  roles: HashMap<PeerId, Role>,
}

impl Tree {
  /// A freshly observed tree starts out trusting every known peer as
  /// a child, mirroring the original `NewTree` (`Children:
  /// slices.Clone(ps)`): relationships settle down to their real
  /// shape as messages arrive.
  pub fn new(
    id: impl Into<String>,
    first_global_round: i64,
    known_peers: &[PeerId],
  ) -> Self {
    let mut roles = HashMap::new();
    for peer in known_peers {
      roles.insert(peer.clone(), Role::Child);
    }
    Self {
      id: id.into(),
      first_global_round,
      last_global_round: -1,
      current_round: 0,
      parent: None,
      parent_lag: LagMetric::new(),
      parent_last_changed: 0,
      is_root: false,
      level: 0,
      local_aggs: HashMap::new(),
      global_agg: None,
      last_round: HashMap::new(),
      roles,
    }
  }

  /// `first_global_round` only ever moves backwards, as older
  /// evidence of the tree's existence arrives.
  pub fn observe_first_global_round(&mut self, round: i64) {
    if round < self.first_global_round {
      self.first_global_round = round;
    }
  }

  pub fn is_parent(&self, peer: &str) -> bool {
    self.parent.as_deref() == Some(peer)
  }

  pub fn is_child(&self, peer: &str) -> bool {
    matches!(self.roles.get(peer), Some(Role::Child))
  }

  pub fn is_lazy(&self, peer: &str) -> bool {
    matches!(self.roles.get(peer), Some(Role::Lazy))
  }

  pub fn children(&self) -> impl Iterator<Item = &PeerId> {
    self
      .roles
      .iter()
      .filter(|(_, r)| **r == Role::Child)
      .map(|(p, _)| p)
  }

  pub fn lazy_peers(&self) -> impl Iterator<Item = &PeerId> {
    self
      .roles
      .iter()
      .filter(|(_, r)| **r == Role::Lazy)
      .map(|(p, _)| p)
  }

  /// Level tolerates proportionally more silence the deeper a node
  /// sits; a tree with no global aggregate yet has never had a
  /// chance to learn its real depth, and a root always sits at level
  /// 0, so both are floored to 1 for the inactivity check only — the
  /// stored `level` field itself is left untouched. Without this floor
  /// a root's own tree would have zero tolerance (`0 * r_max`) and get
  /// pruned the round immediately after it refreshes itself, since
  /// pruning runs before that round's own update.
  pub fn effective_level(&self) -> u32 {
    match self.global_agg {
      None => 1,
      Some(_) => self.level.max(1),
    }
  }

  fn add_child(&mut self, peer: &str) {
    if self.is_parent(peer) || self.is_child(peer) || self.is_lazy(peer) {
      return;
    }
    self.roles.insert(peer.to_string(), Role::Child);
  }

  fn add_lazy(&mut self, peer: &str) {
    if self.is_parent(peer) || self.is_child(peer) || self.is_lazy(peer) {
      return;
    }
    self.roles.insert(peer.to_string(), Role::Lazy);
  }

  pub fn remove_child(&mut self, peer: &str) {
    if matches!(self.roles.get(peer), Some(Role::Child)) {
      self.roles.remove(peer);
    }
  }

  pub fn remove_lazy(&mut self, peer: &str) {
    if matches!(self.roles.get(peer), Some(Role::Lazy)) {
      self.roles.remove(peer);
    }
  }

  /// Drops a peer from every role and its round/aggregate bookkeeping.
  /// Called by the failure detector when a peer is marked failed.
  pub fn forget_peer(&mut self, peer: &str) {
    self.roles.remove(peer);
    if self.parent.as_deref() == Some(peer) {
      self.parent = None;
    }
    self.local_aggs.remove(peer);
    self.last_round.remove(peer);
  }

  fn ordering_guard(&mut self, sender: &str, sender_round: i64) -> bool {
    if self.last_round.get(sender).copied().unwrap_or(0) > sender_round {
      return false;
    }
    self.last_round.insert(sender.to_string(), sender_round);
    true
  }

  /// A LocalAgg from `p` implies `p` believes we are its parent.
  pub fn on_local_agg(
    &mut self,
    sender: &str,
    msg: &LocalAgg,
    self_id: &str,
    threshold: usize,
  ) {
    if !self.ordering_guard(sender, msg.sender_round) {
      return;
    }

    if self.is_lazy(sender) {
      self.remove_lazy(sender);
      self.add_child(sender);
    } else if self.is_parent(sender) && sender > self_id {
      self.parent = None;
      self.add_child(sender);
      self.select_parent(threshold);
    }

    if !self.is_child(sender) {
      return;
    }
    let accept = self
      .local_aggs
      .get(sender)
      .map_or(true, |a| msg.sender_round > a.round);
    if accept {
      self
        .local_aggs
        .insert(sender.to_string(), Aggregate::new(msg.value, msg.count, msg.sender_round));
    }
  }

  /// A GlobalAgg from `p` implies `p` believes we are its child.
  pub fn on_global_agg(
    &mut self,
    sender: &str,
    msg: &GlobalAgg,
    current_round: i64,
  ) {
    if !self.ordering_guard(sender, msg.sender_round) {
      return;
    }

    if self.parent.is_none() && !self.is_root {
      self.remove_child(sender);
      self.remove_lazy(sender);
      self.parent = Some(sender.to_string());
      self.parent_lag.reset();
    } else if self.is_child(sender) {
      self.remove_child(sender);
      self.add_lazy(sender);
    }

    if !self.is_parent(sender) {
      return;
    }
    let accept = self
      .global_agg
      .map_or(true, |ga| msg.value_round > ga.round);
    if accept {
      self.global_agg =
        Some(Aggregate::new(msg.value, msg.count, msg.value_round));
      self.last_global_round = current_round;
      self.level = msg.level + 1;
      debug!(
        tree = %self.id, value = msg.value, count = msg.count,
        "new global aggregate"
      );
    }
  }

  /// A GlobalAggLazy from `p` implies `p` believes we are its lazy
  /// subscriber.
  pub fn on_global_agg_lazy(
    &mut self,
    sender: &str,
    msg: &GlobalAggLazy,
    current_round: i64,
  ) {
    if !self.ordering_guard(sender, msg.sender_round) {
      return;
    }

    if self.is_child(sender) {
      self.remove_child(sender);
      self.add_lazy(sender);
    }

    if !self.is_lazy(sender) {
      return;
    }
    let accept = self
      .global_agg
      .map_or(true, |ga| msg.value_round > ga.round);
    if accept {
      self.last_global_round = current_round;
      self.parent_lag.add(sender, current_round);
    }
  }

  /// Peer-added handling: a newly discovered peer joins
  /// as a child of every existing tree, subject to the usual role
  /// dedup.
  pub fn add_new_peer(&mut self, peer: &str) {
    self.add_child(peer);
  }

  fn best_parent_candidate(&self) -> Option<(PeerId, usize)> {
    let mut best: Option<(PeerId, usize)> = None;
    for peer in self.lazy_peers() {
      let lag = self.parent_lag.get(peer);
      if lag == 0 {
        continue;
      }
      match &best {
        None => best = Some((peer.clone(), lag)),
        Some((_, best_lag)) if lag > *best_lag => {
          best = Some((peer.clone(), lag))
        }
        _ => {}
      }
    }
    best
  }

  /// Picks the lazy peer with the strictly largest lag as the new
  /// parent, if it clears `threshold` (or there is no parent yet).
  /// A root never picks a parent.
  pub fn select_parent(&mut self, threshold: usize) {
    if self.is_root {
      return;
    }
    let Some((candidate, lag)) = self.best_parent_candidate() else {
      return;
    };
    if self.parent.is_some() && lag <= threshold {
      return;
    }
    self.remove_lazy(&candidate);
    self.parent_lag.reset();
    self.parent_last_changed = self.current_round;
    self.parent = Some(candidate);
  }

  /// Runs one tick's worth of protocol for this tree,
  /// returning the outbound messages this node must send.
  pub fn execute_round(
    &mut self,
    current_local: Aggregate,
    is_best: bool,
    r_window: i64,
    threshold: usize,
  ) -> Vec<(PeerId, Message)> {
    self.current_round = current_local.round;
    self.parent_lag.forget_older(current_local.round - r_window);
    if current_local.round - self.parent_last_changed > r_window {
      self.select_parent(threshold);
    }

    if !is_best {
      return Vec::new();
    }

    let mut out = Vec::new();

    if self.is_root {
      let children_aggs: Vec<Aggregate> =
        self.local_aggs.values().copied().collect();
      let global = current_local.combine(&children_aggs);
      self.global_agg = Some(global);
      self.last_global_round = global.round;
    }

    if let Some(global) = self.global_agg {
      let global_msg = Message::GlobalAgg(GlobalAgg {
        tree_id: self.id.clone(),
        value: global.value,
        count: global.count,
        level: self.level,
        value_round: global.round,
        sender_round: current_local.round,
      });
      for child in self.children() {
        out.push((child.clone(), global_msg.clone()));
      }

      let lazy_msg = Message::GlobalAggLazy(GlobalAggLazy {
        tree_id: self.id.clone(),
        value_round: global.round,
        sender_round: current_local.round,
      });
      for lazy in self.lazy_peers() {
        out.push((lazy.clone(), lazy_msg.clone()));
      }
    }

    if let Some(parent) = self.parent.clone() {
      let children_aggs: Vec<Aggregate> =
        self.local_aggs.values().copied().collect();
      let local = current_local.combine(&children_aggs);
      out.push((
        parent,
        Message::LocalAgg(LocalAgg {
          tree_id: self.id.clone(),
          value: local.value,
          count: local.count,
          sender_round: local.round,
        }),
      ));
    }

    out
  }
}
