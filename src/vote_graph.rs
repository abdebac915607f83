//! C7 — Vote Graph & Tracker (spec §4.6).
//!
//! Two independent pieces: a [`VoterSet`] (insertion-ordered, per
//! `core/consensus/grandpa/voter_set.hpp` in `original_source`) and a
//! [`VoteGraph`] that accumulates weight along ancestry paths over C1, used
//! once per vote-kind (prevote, precommit) by a [`VotingRound`](crate::voting_round::VotingRound).

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;

use crate::{block_tree::BlockTree, primitives::Pubkey, types::BlockInfo};

/// An insertion-ordered, weighted voter roster (spec §3 `VoterSet`).
#[derive(Clone, Debug)]
pub struct VoterSet {
  by_id: IndexMap<Pubkey, u64>,
  total_weight: u64,
}

impl VoterSet {
  pub fn new(authorities: impl IntoIterator<Item = (Pubkey, u64)>) -> Self {
    let mut by_id = IndexMap::new();
    let mut total_weight = 0u64;
    for (id, weight) in authorities {
      total_weight += weight;
      by_id.insert(id, weight);
    }
    Self { by_id, total_weight }
  }

  pub fn total_weight(&self) -> u64 {
    self.total_weight
  }

  /// spec glossary: `threshold = total - floor((total - 1) / 3)`, i.e. > 2/3.
  pub fn threshold(&self) -> u64 {
    self.total_weight - (self.total_weight.saturating_sub(1)) / 3
  }

  pub fn len(&self) -> usize {
    self.by_id.len()
  }

  pub fn is_empty(&self) -> bool {
    self.by_id.is_empty()
  }

  pub fn index_of(&self, id: &Pubkey) -> Option<usize> {
    self.by_id.get_index_of(id)
  }

  pub fn weight_of(&self, id: &Pubkey) -> Option<u64> {
    self.by_id.get(id).copied()
  }

  pub fn nth(&self, index: usize) -> Option<(Pubkey, u64)> {
    self.by_id.get_index(index).map(|(id, w)| (*id, *w))
  }

  pub fn contains(&self, id: &Pubkey) -> bool {
    self.by_id.contains_key(id)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&Pubkey, &u64)> {
    self.by_id.iter()
  }
}

/// Outcome of pushing one voter's signed vote into a [`VoteTracker`] bag
/// (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResult {
  Success,
  Duplicated,
  Equivocated,
  VoteOfKnownEquivocator,
}

/// One bag of votes for a single round and a single vote kind (proposal,
/// prevote, or precommit). A [`VotingRound`](crate::voting_round::VotingRound)
/// owns three of these.
#[derive(Default)]
pub struct VoteTracker {
  votes: HashMap<Pubkey, BlockInfo>,
  equivocators: HashSet<Pubkey>,
}

impl VoteTracker {
  pub fn new() -> Self {
    Self::default()
  }

  /// spec §4.6 `push` — `SUCCESS`/`DUPLICATED`/`EQUIVOCATED`, and
  /// `VOTE_OF_KNOWN_EQUIVOCATOR` for any further vote from a flagged voter.
  pub fn push(&mut self, voter: Pubkey, target: BlockInfo) -> PushResult {
    if self.equivocators.contains(&voter) {
      return PushResult::VoteOfKnownEquivocator;
    }
    match self.votes.get(&voter) {
      None => {
        self.votes.insert(voter, target);
        PushResult::Success
      }
      Some(existing) if *existing == target => PushResult::Duplicated,
      Some(_) => {
        self.equivocators.insert(voter);
        PushResult::Equivocated
      }
    }
  }

  pub fn is_equivocator(&self, voter: &Pubkey) -> bool {
    self.equivocators.contains(voter)
  }

  pub fn equivocators(&self) -> impl Iterator<Item = &Pubkey> {
    self.equivocators.iter()
  }

  pub fn votes(&self) -> impl Iterator<Item = (&Pubkey, &BlockInfo)> {
    self.votes.iter()
  }

  /// Total weight cast for `target` specifically (not the subtree), ignoring
  /// flagged equivocators — equivocators never contribute to any single
  /// target's weight (spec §8 property 3).
  pub fn weight_for(&self, target: BlockInfo, voters: &VoterSet) -> u64 {
    self
      .votes
      .iter()
      .filter(|(id, t)| **t == target && !self.equivocators.contains(*id))
      .filter_map(|(id, _)| voters.weight_of(id))
      .sum()
  }
}

/// Per-block cumulative weight plus bookkeeping used to break GHOST ties by
/// earliest-inserted (spec §4.6 `insert`).
struct GraphNode {
  weight: u64,
  insertion_order: u64,
}

/// Accumulates vote weight along ancestry paths over a [`BlockTree`] (spec
/// §4.6). One instance tracks exactly one vote kind (prevotes, or
/// precommits) for one round.
pub struct VoteGraph {
  nodes: HashMap<BlockInfo, GraphNode>,
  next_order: u64,
}

impl Default for VoteGraph {
  fn default() -> Self {
    Self::new()
  }
}

impl VoteGraph {
  pub fn new() -> Self {
    Self { nodes: HashMap::new(), next_order: 0 }
  }

  /// spec §4.6 `insert(block, voter)` — adds `weight` to `block` and every
  /// ancestor reachable through C1, up to (and including) the tree's last
  /// finalized block.
  pub fn insert(&mut self, block: BlockInfo, weight: u64, tree: &dyn BlockTree) {
    let floor = tree.last_finalized();
    let mut cursor = block;
    loop {
      let order = self.next_order;
      let entry = self.nodes.entry(cursor).or_insert_with(|| {
        self.next_order += 1;
        GraphNode { weight: 0, insertion_order: order }
      });
      entry.weight += weight;
      if cursor == floor || cursor.number <= floor.number {
        break;
      }
      let Some(header) = tree.get_header(cursor.hash) else { break };
      cursor = BlockInfo::new(header.number.saturating_sub(1), header.parent_hash);
    }
  }

  pub fn weight_at(&self, block: BlockInfo) -> u64 {
    self.nodes.get(&block).map(|n| n.weight).unwrap_or(0)
  }

  /// spec §4.6 `findGhost(base, predicate)` — the highest descendant of
  /// `base` whose cumulative weight satisfies `predicate`, ties broken by
  /// earliest-inserted.
  pub fn find_ghost(&self, base: BlockInfo, predicate: impl Fn(u64) -> bool, tree: &dyn BlockTree) -> BlockInfo {
    let mut best = base;
    let mut best_order = self.nodes.get(&base).map(|n| n.insertion_order).unwrap_or(u64::MAX);

    for leaf_hash in tree.leaves() {
      let Some(header) = tree.get_header(leaf_hash) else { continue };
      let leaf = BlockInfo::new(header.number, leaf_hash);
      if !tree.has_direct_chain(base, leaf) {
        continue;
      }
      let mut cursor = leaf;
      loop {
        if let Some(node) = self.nodes.get(&cursor) {
          if predicate(node.weight)
            && (cursor.number > best.number || (cursor.number == best.number && node.insertion_order < best_order))
          {
            best = cursor;
            best_order = node.insertion_order;
          }
        }
        if cursor == base {
          break;
        }
        let Some(h) = tree.get_header(cursor.hash) else { break };
        cursor = BlockInfo::new(h.number.saturating_sub(1), h.parent_hash);
      }
    }
    best
  }

  /// spec §4.6 `findAncestor(block, predicate)` — walks upward from `block`
  /// for the first ancestor (including itself) satisfying `predicate`.
  pub fn find_ancestor(&self, block: BlockInfo, predicate: impl Fn(u64) -> bool, tree: &dyn BlockTree) -> Option<BlockInfo> {
    let mut cursor = block;
    loop {
      if let Some(node) = self.nodes.get(&cursor) {
        if predicate(node.weight) {
          return Some(cursor);
        }
      }
      let header = tree.get_header(cursor.hash)?;
      if header.number == 0 {
        return None;
      }
      cursor = BlockInfo::new(header.number - 1, header.parent_hash);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::block_tree::InMemoryBlockTree;
  use crate::types::{BlockHeader, Hash};

  fn header(number: u32, parent: Hash, seed: u8) -> BlockHeader {
    BlockHeader { parent_hash: parent, number, state_root: Hash([seed; 32]), extrinsics_root: Hash::zero(), digest: vec![] }
  }

  fn pk() -> Pubkey {
    schnorrkel::Keypair::generate_with(&mut rand::rngs::OsRng).public.into()
  }

  fn chain(len: u32) -> (InMemoryBlockTree, Vec<BlockInfo>) {
    let genesis = header(0, Hash::zero(), 0);
    let genesis_hash = genesis.hash();
    let mut tree = InMemoryBlockTree::new(genesis);
    let mut infos = vec![BlockInfo::new(0, genesis_hash)];
    let mut parent = genesis_hash;
    for n in 1..=len {
      let h = header(n, parent, n as u8);
      parent = h.hash();
      infos.push(tree.add_block(h).unwrap());
    }
    (tree, infos)
  }

  #[test]
  fn insert_propagates_weight_to_ancestors() {
    let (tree, blocks) = chain(5);
    let mut graph = VoteGraph::new();
    graph.insert(blocks[4], 3, &tree);
    assert_eq!(graph.weight_at(blocks[4]), 3);
    assert_eq!(graph.weight_at(blocks[2]), 3);
    assert_eq!(graph.weight_at(blocks[0]), 3);
  }

  #[test]
  fn find_ghost_picks_highest_block_meeting_predicate() {
    let (tree, blocks) = chain(5);
    let mut graph = VoteGraph::new();
    graph.insert(blocks[5], 2, &tree);
    graph.insert(blocks[3], 1, &tree);

    // insert only propagates weight to ancestors, so blocks[5]/[4] see only
    // the first insert's weight (2); blocks[3..=0] also pick up the second
    // insert's weight (1), reaching 3.
    let ghost = graph.find_ghost(blocks[0], |w| w >= 3, &tree);
    assert_eq!(ghost, blocks[3]);

    let ghost_strict = graph.find_ghost(blocks[0], |w| w >= 4, &tree);
    assert_eq!(ghost_strict, blocks[0]);
  }

  #[test]
  fn voter_set_threshold_is_supermajority() {
    let voters = VoterSet::new((0..3).map(|_| (pk(), 1)));
    assert_eq!(voters.total_weight(), 3);
    assert_eq!(voters.threshold(), 3); // 3 - floor(2/3) = 3
    let voters = VoterSet::new((0..10).map(|_| (pk(), 1)));
    assert_eq!(voters.threshold(), 7); // 10 - floor(9/3) = 7
  }

  #[test]
  fn equivocation_is_flagged_on_second_distinct_vote() {
    let voter = pk();
    let (_, blocks) = chain(2);
    let mut tracker = VoteTracker::new();
    assert_eq!(tracker.push(voter, blocks[1]), PushResult::Success);
    assert_eq!(tracker.push(voter, blocks[1]), PushResult::Duplicated);
    assert_eq!(tracker.push(voter, blocks[2]), PushResult::Equivocated);
    assert_eq!(tracker.push(voter, blocks[0]), PushResult::VoteOfKnownEquivocator);
  }
}
