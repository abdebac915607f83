//! C1 — Block Tree (read view).
//!
//! Per spec §1/§2 the block tree's storage and trie implementation are out
//! of scope; only the narrow capability surface in §6 is specified here,
//! as a trait. [`InMemoryBlockTree`] is a reference implementation good
//! enough to drive the rest of this crate's tests end to end — a real node
//! would back this with a trie-backed database instead.

use std::collections::HashMap;

use crate::{
  error::{ConsensusError, Result},
  types::{BlockHeader, BlockInfo, Hash},
};

/// The external block-tree capability consumed by every other component
/// (spec §6 "To block tree (consumed)").
pub trait BlockTree {
  fn get_header(&self, hash: Hash) -> Option<BlockHeader>;
  fn get_hash(&self, number: u32) -> Option<Hash>;
  fn best_block(&self) -> BlockInfo;
  fn last_finalized(&self) -> BlockInfo;
  fn leaves(&self) -> Vec<Hash>;

  /// True iff `descendant` is `ancestor` or a descendant of it along some
  /// chain in the tree.
  fn has_direct_chain(&self, ancestor: BlockInfo, descendant: BlockInfo) -> bool;

  fn add_block(&mut self, header: BlockHeader) -> Result<BlockInfo>;
  fn finalize(&mut self, hash: Hash) -> Result<()>;
  fn remove_leaf(&mut self, hash: Hash) -> Result<()>;
}

struct Node {
  header: BlockHeader,
  children: Vec<Hash>,
}

/// In-memory reference [`BlockTree`]. Keeps every block ever imported (no
/// pruning beyond what finalization implies for callers); fine for tests
/// and for driving the rest of this crate, not for production use.
pub struct InMemoryBlockTree {
  nodes: HashMap<Hash, Node>,
  best: BlockInfo,
  finalized: BlockInfo,
}

impl InMemoryBlockTree {
  pub fn new(genesis: BlockHeader) -> Self {
    let hash = genesis.hash();
    let info = BlockInfo::new(genesis.number, hash);
    let mut nodes = HashMap::new();
    nodes.insert(hash, Node { header: genesis, children: vec![] });
    Self { nodes, best: info, finalized: info }
  }

  fn recompute_best(&mut self) {
    // longest chain among current leaves; ties broken by hash for determinism.
    let mut best = self.finalized;
    for hash in self.leaves() {
      let header = &self.nodes[&hash].header;
      let candidate = BlockInfo::new(header.number, hash);
      if candidate.number > best.number
        || (candidate.number == best.number && candidate.hash > best.hash)
      {
        best = candidate;
      }
    }
    self.best = best;
  }
}

impl BlockTree for InMemoryBlockTree {
  fn get_header(&self, hash: Hash) -> Option<BlockHeader> {
    self.nodes.get(&hash).map(|n| n.header.clone())
  }

  fn get_hash(&self, number: u32) -> Option<Hash> {
    // walk back from best along parent links
    let mut cursor = self.nodes.get(&self.best.hash)?;
    let mut cursor_hash = self.best.hash;
    loop {
      if cursor.header.number == number {
        return Some(cursor_hash);
      }
      if cursor.header.number < number {
        return None;
      }
      cursor_hash = cursor.header.parent_hash;
      cursor = self.nodes.get(&cursor_hash)?;
    }
  }

  fn best_block(&self) -> BlockInfo {
    self.best
  }

  fn last_finalized(&self) -> BlockInfo {
    self.finalized
  }

  fn leaves(&self) -> Vec<Hash> {
    self
      .nodes
      .iter()
      .filter(|(_, n)| n.children.is_empty())
      .map(|(h, _)| *h)
      .collect()
  }

  fn has_direct_chain(&self, ancestor: BlockInfo, descendant: BlockInfo) -> bool {
    if ancestor == descendant {
      return true;
    }
    if ancestor.number > descendant.number {
      return false;
    }
    let Some(mut cursor) = self.nodes.get(&descendant.hash) else {
      return false;
    };
    let mut cursor_hash = descendant.hash;
    while cursor.header.number > ancestor.number {
      cursor_hash = cursor.header.parent_hash;
      let Some(next) = self.nodes.get(&cursor_hash) else {
        return false;
      };
      cursor = next;
    }
    cursor_hash == ancestor.hash
  }

  fn add_block(&mut self, header: BlockHeader) -> Result<BlockInfo> {
    if !self.nodes.contains_key(&header.parent_hash) {
      return Err(ConsensusError::UnknownBlock(BlockInfo::new(
        header.number.saturating_sub(1),
        header.parent_hash,
      )));
    }
    let hash = header.hash();
    let info = BlockInfo::new(header.number, hash);
    self
      .nodes
      .get_mut(&header.parent_hash)
      .expect("checked above")
      .children
      .push(hash);
    self.nodes.insert(hash, Node { header, children: vec![] });
    self.recompute_best();
    Ok(info)
  }

  fn finalize(&mut self, hash: Hash) -> Result<()> {
    let header = self
      .nodes
      .get(&hash)
      .ok_or(ConsensusError::UnknownBlock(BlockInfo::new(0, hash)))?;
    let info = BlockInfo::new(header.header.number, hash);
    if !self.has_direct_chain(self.finalized, info) {
      return Err(ConsensusError::NotDescendent(info));
    }
    self.finalized = info;
    Ok(())
  }

  fn remove_leaf(&mut self, hash: Hash) -> Result<()> {
    let node = self.nodes.get(&hash).ok_or(ConsensusError::UnknownBlock(BlockInfo::new(0, hash)))?;
    if !node.children.is_empty() {
      return Err(ConsensusError::UnknownBlock(BlockInfo::new(0, hash)));
    }
    let parent_hash = node.header.parent_hash;
    self.nodes.remove(&hash);
    if let Some(parent) = self.nodes.get_mut(&parent_hash) {
      parent.children.retain(|h| *h != hash);
    }
    self.recompute_best();
    Ok(())
  }
}
