//! C3 — Authority-Set Schedule Graph (spec §3, §4.2).
//!
//! A forkable tree of [`ScheduleNode`]s, each owning the authority set that
//! is effective for its block's descendants until a nested action fires.
//! Structurally this mirrors the teacher's `consensus/forktree.rs` —
//! strong parent -> child ownership (`Vec<Rc<RefCell<_>>>`), weak
//! child -> parent back-reference — generalized from "blocks voted on by
//! stake" to "pending authority-set transitions".

use std::{
  cell::RefCell,
  rc::{Rc, Weak},
  sync::Arc,
};

use tracing::{debug, warn};

use crate::{
  block_tree::BlockTree,
  error::{ConsensusError, Result},
  primitives::Pubkey,
  types::BlockInfo,
};

/// A weighted validator set (spec §3). Weight 0 disables an authority.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthoritySet {
  pub id: u64,
  pub authorities: Vec<(Pubkey, u64)>,
}

impl AuthoritySet {
  pub fn total_weight(&self) -> u64 {
    self.authorities.iter().map(|(_, w)| w).sum()
  }

  /// Returns a clone with every authority's weight zeroed — used while a
  /// [`ScheduleNode`] is in a `Pause` window, so GRANDPA can never reach a
  /// supermajority against this set (spec §4.2 invariant (d)).
  fn zero_weighted(&self) -> AuthoritySet {
    AuthoritySet {
      id: self.id,
      authorities: self.authorities.iter().map(|(id, _)| (*id, 0)).collect(),
    }
  }
}

/// The pending transition a [`ScheduleNode`] carries, if any (spec §4.2
/// state machine).
#[derive(Clone, Debug)]
pub enum ScheduleAction {
  NoAction,
  ScheduledChange { activate_at: u32, new: Arc<AuthoritySet> },
  ForcedChange { delay_start: u32, delay: u32, new: Arc<AuthoritySet> },
  Pause { activate_at: u32 },
  Resume { activate_at: u32 },
}

impl ScheduleAction {
  fn activation_height(&self) -> Option<u32> {
    match self {
      ScheduleAction::NoAction => None,
      ScheduleAction::ScheduledChange { activate_at, .. } => Some(*activate_at),
      ScheduleAction::ForcedChange { delay_start, delay, .. } => Some(delay_start + delay),
      ScheduleAction::Pause { activate_at } => Some(*activate_at),
      ScheduleAction::Resume { activate_at } => Some(*activate_at),
    }
  }
}

/// A node in the schedule graph (spec §3 `ScheduleNode`).
pub struct ScheduleNode {
  block: BlockInfo,
  parent: Option<Weak<RefCell<ScheduleNode>>>,
  descendants: Vec<Rc<RefCell<ScheduleNode>>>,
  current_authorities: Arc<AuthoritySet>,
  enabled: bool,
  action: ScheduleAction,
}

type NodeRef = Rc<RefCell<ScheduleNode>>;

impl ScheduleNode {
  fn new_root(block: BlockInfo, authorities: Arc<AuthoritySet>) -> NodeRef {
    Rc::new(RefCell::new(ScheduleNode {
      block,
      parent: None,
      descendants: vec![],
      current_authorities: authorities,
      enabled: true,
      action: ScheduleAction::NoAction,
    }))
  }

  /// The authority set a caller at `self.block` (and descendants, until a
  /// nested action) should see — zeroed out while paused (invariant (d)).
  fn effective_set(&self) -> Arc<AuthoritySet> {
    if self.enabled {
      Arc::clone(&self.current_authorities)
    } else {
      Arc::new(self.current_authorities.zero_weighted())
    }
  }
}

/// Public API for C3, wrapping the root of the schedule graph.
pub struct AuthoritySetGraph {
  root: NodeRef,
  /// Whether `apply_on_disabled` actions are honored (spec §9 open
  /// question) — defaults to `false` unless the chain spec enables it.
  honor_on_disabled: bool,
}

impl AuthoritySetGraph {
  pub fn new(root_block: BlockInfo, genesis_authorities: AuthoritySet) -> Self {
    Self {
      root: ScheduleNode::new_root(root_block, Arc::new(genesis_authorities)),
      honor_on_disabled: false,
    }
  }

  pub fn with_on_disabled(mut self, honor: bool) -> Self {
    self.honor_on_disabled = honor;
    self
  }

  /// Finds the schedule node that is the nearest tracked ancestor of
  /// `target` (spec §4.2 `authorities`). Descends greedily: among children
  /// that are ancestors-or-equal of `target`, picks the one with the
  /// highest block number (there is at most one on any single branch).
  fn nearest_ancestor(&self, target: BlockInfo, tree: &dyn BlockTree) -> Option<NodeRef> {
    if !tree.has_direct_chain(self.root.borrow().block, target) {
      return None;
    }
    let mut current = Rc::clone(&self.root);
    loop {
      let next = current
        .borrow()
        .descendants
        .iter()
        .find(|d| tree.has_direct_chain(d.borrow().block, target))
        .cloned();
      match next {
        Some(n) => current = n,
        None => return Some(current),
      }
    }
  }

  /// spec §4.2 `authorities`.
  pub fn authorities(
    &self,
    target: BlockInfo,
    tree: &dyn BlockTree,
  ) -> Option<Arc<AuthoritySet>> {
    let node = self.nearest_ancestor(target, tree)?;
    let node_ref = node.borrow();

    // materialize a synthetic descendant at `target` by applying any
    // pending action whose activation height has been crossed.
    match &node_ref.action {
      ScheduleAction::NoAction => Some(node_ref.effective_set()),
      ScheduleAction::ScheduledChange { activate_at, new } => {
        if target.number >= *activate_at {
          Some(Arc::clone(new))
        } else {
          Some(node_ref.effective_set())
        }
      }
      ScheduleAction::ForcedChange { delay_start, delay, new } => {
        if target.number >= delay_start + delay {
          Some(Arc::clone(new))
        } else {
          Some(node_ref.effective_set())
        }
      }
      ScheduleAction::Pause { activate_at } => {
        if target.number >= *activate_at {
          Some(Arc::new(node_ref.current_authorities.zero_weighted()))
        } else {
          Some(node_ref.effective_set())
        }
      }
      ScheduleAction::Resume { activate_at } => {
        if target.number >= *activate_at {
          Some(Arc::clone(&node_ref.current_authorities))
        } else {
          Some(Arc::new(node_ref.current_authorities.zero_weighted()))
        }
      }
    }
  }

  /// Attaches a new pending action at `at`, provided no ancestor already
  /// has one that activates no later than this one (spec invariant (e)).
  fn attach(&mut self, at: BlockInfo, action: ScheduleAction, tree: &dyn BlockTree) -> Result<()> {
    let Some(ancestor) = self.nearest_ancestor(at, tree) else {
      return Err(ConsensusError::OrphanBlockOrAlreadyFinalized);
    };

    // nested pending actions: a forced change always overrides whatever the
    // ancestor was carrying (spec §4.2 tie-break); otherwise first-wins —
    // the new action is ignored if the ancestor's still activates first.
    // This only governs authority-set changes (Scheduled/Forced); Pause and
    // Resume move an orthogonal `enabled` bit and are never blocked by it —
    // otherwise a Resume could never attach once its Pause's activation
    // height had passed.
    let ancestor_is_authority_change =
      matches!(ancestor.borrow().action, ScheduleAction::ScheduledChange { .. } | ScheduleAction::ForcedChange { .. });
    let new_is_authority_change =
      matches!(action, ScheduleAction::ScheduledChange { .. } | ScheduleAction::ForcedChange { .. });

    if ancestor_is_authority_change && new_is_authority_change {
      let existing_activation = ancestor
        .borrow()
        .action
        .activation_height()
        .expect("authority-change actions always carry an activation height");
      let ancestor_is_forced = matches!(ancestor.borrow().action, ScheduleAction::ForcedChange { .. });
      let new_is_forced = matches!(action, ScheduleAction::ForcedChange { .. });
      if new_is_forced && !ancestor_is_forced {
        ancestor.borrow_mut().action = ScheduleAction::NoAction;
      } else {
        let new_activation = action.activation_height().unwrap_or(u32::MAX);
        if existing_activation <= new_activation {
          debug!(
            "ignoring action at {:?}: ancestor {:?} already has a pending action activating at {}",
            at,
            ancestor.borrow().block,
            existing_activation
          );
          return Ok(());
        }
      }
    }

    if ancestor.borrow().block == at {
      ancestor.borrow_mut().action = action;
      return Ok(());
    }

    let child = Rc::new(RefCell::new(ScheduleNode {
      block: at,
      parent: Some(Rc::downgrade(&ancestor)),
      descendants: vec![],
      current_authorities: Arc::clone(&ancestor.borrow().current_authorities),
      enabled: ancestor.borrow().enabled,
      action,
    }));

    // reorganize descendants (spec §4.2): any of `ancestor`'s existing
    // descendants that actually sit below `at` on the chain belong under
    // the new node, not as its siblings — mirrors kagome's
    // `AuthorityManagerImpl::reorganize`.
    {
      let mut ancestor_mut = ancestor.borrow_mut();
      let previous = std::mem::take(&mut ancestor_mut.descendants);
      let (below, above): (Vec<_>, Vec<_>) =
        previous.into_iter().partition(|d| tree.has_direct_chain(at, d.borrow().block));
      ancestor_mut.descendants = above;
      for d in below {
        d.borrow_mut().parent = Some(Rc::downgrade(&child));
        child.borrow_mut().descendants.push(d);
      }
      ancestor_mut.descendants.push(child);
    }
    Ok(())
  }

  /// spec §4.2 `apply_scheduled_change`.
  pub fn apply_scheduled_change(
    &mut self,
    at: BlockInfo,
    new: Vec<(Pubkey, u64)>,
    activate_at: u32,
    set_id: u64,
    tree: &dyn BlockTree,
  ) -> Result<()> {
    self.attach(
      at,
      ScheduleAction::ScheduledChange {
        activate_at,
        new: Arc::new(AuthoritySet { id: set_id, authorities: new }),
      },
      tree,
    )
  }

  /// spec §4.2 `apply_forced_change`. `delay_start` is clamped to the root
  /// if it precedes it.
  pub fn apply_forced_change(
    &mut self,
    current: BlockInfo,
    new: Vec<(Pubkey, u64)>,
    delay_start: u32,
    delay: u32,
    set_id: u64,
    tree: &dyn BlockTree,
  ) -> Result<()> {
    let root_number = self.root.borrow().block.number;
    let delay_start = delay_start.max(root_number);
    self.attach(
      current,
      ScheduleAction::ForcedChange {
        delay_start,
        delay,
        new: Arc::new(AuthoritySet { id: set_id, authorities: new }),
      },
      tree,
    )
  }

  /// spec §4.2 `apply_on_disabled`. No-op unless `honor_on_disabled`.
  pub fn apply_on_disabled(
    &mut self,
    at: BlockInfo,
    authority_index: usize,
    tree: &dyn BlockTree,
  ) -> Result<()> {
    if !self.honor_on_disabled {
      return Ok(());
    }
    let Some(ancestor) = self.nearest_ancestor(at, tree) else {
      return Err(ConsensusError::OrphanBlockOrAlreadyFinalized);
    };
    let mut set = (*ancestor.borrow().current_authorities).clone();
    if let Some((_, weight)) = set.authorities.get_mut(authority_index) {
      *weight = 0;
    }
    if ancestor.borrow().block == at {
      ancestor.borrow_mut().current_authorities = Arc::new(set);
    } else {
      let child = Rc::new(RefCell::new(ScheduleNode {
        block: at,
        parent: Some(Rc::downgrade(&ancestor)),
        descendants: vec![],
        current_authorities: Arc::new(set),
        enabled: ancestor.borrow().enabled,
        action: ScheduleAction::NoAction,
      }));
      ancestor.borrow_mut().descendants.push(child);
    }
    Ok(())
  }

  /// spec §4.2 `apply_pause`.
  pub fn apply_pause(&mut self, at: BlockInfo, activate_at: u32, tree: &dyn BlockTree) -> Result<()> {
    self.attach(at, ScheduleAction::Pause { activate_at }, tree)
  }

  /// spec §4.2 `apply_resume`.
  pub fn apply_resume(&mut self, at: BlockInfo, activate_at: u32, tree: &dyn BlockTree) -> Result<()> {
    self.attach(at, ScheduleAction::Resume { activate_at }, tree)
  }

  /// spec §4.2 `cancel` — removes a pending action if `at` is a leaf node.
  pub fn cancel(&mut self, at: BlockInfo, tree: &dyn BlockTree) -> Result<()> {
    let Some(node) = self.nearest_ancestor(at, tree) else {
      return Ok(());
    };
    if node.borrow().block != at || !node.borrow().descendants.is_empty() {
      return Ok(()); // no-op: not an exact, leaf match
    }
    if let Some(parent) = node.borrow().parent.as_ref().and_then(Weak::upgrade) {
      parent.borrow_mut().descendants.retain(|d| !Rc::ptr_eq(d, &node));
    }
    Ok(())
  }

  /// Walks every node in the subtree, resolving any action whose activation
  /// height is now behind `finalized`, folding its new set/enabled flag
  /// into the node itself. Called during `on_finalize` before pruning.
  fn settle(node: &NodeRef, finalized: BlockInfo) {
    let mut n = node.borrow_mut();
    match std::mem::replace(&mut n.action, ScheduleAction::NoAction) {
      ScheduleAction::NoAction => {}
      ScheduleAction::ScheduledChange { activate_at, new } => {
        if finalized.number >= activate_at {
          n.current_authorities = new;
        } else {
          n.action = ScheduleAction::ScheduledChange { activate_at, new };
        }
      }
      ScheduleAction::ForcedChange { delay_start, delay, new } => {
        if finalized.number >= delay_start + delay {
          n.current_authorities = new;
        } else {
          n.action = ScheduleAction::ForcedChange { delay_start, delay, new };
        }
      }
      ScheduleAction::Pause { activate_at } => {
        if finalized.number >= activate_at {
          n.enabled = false;
        } else {
          n.action = ScheduleAction::Pause { activate_at };
        }
      }
      ScheduleAction::Resume { activate_at } => {
        if finalized.number >= activate_at {
          n.enabled = true;
        } else {
          n.action = ScheduleAction::Resume { activate_at };
        }
      }
    }
    let children: Vec<_> = n.descendants.clone();
    drop(n);
    for child in children {
      Self::settle(&child, finalized);
    }
  }

  /// spec §4.2 `on_finalize` — rebases the root at `finalized`, discarding
  /// every branch that isn't its ancestry (spec invariant, §8 property 5).
  pub fn on_finalize(&mut self, finalized: BlockInfo, tree: &dyn BlockTree) -> Result<()> {
    if !tree.has_direct_chain(self.root.borrow().block, finalized) {
      warn!("on_finalize({:?}): finalized block is not a descendant of the current schedule root", finalized);
      return Err(ConsensusError::OrphanBlockOrAlreadyFinalized);
    }
    // settle every node on the path from the old root down to the new one —
    // not just the old root — so a pending action several generations deep
    // (e.g. the scheduled change that will itself become the new root) is
    // resolved before it's read.
    let new_root = {
      let mut current = Rc::clone(&self.root);
      loop {
        Self::settle(&current, finalized);
        let next = current
          .borrow()
          .descendants
          .iter()
          .find(|d| tree.has_direct_chain(d.borrow().block, finalized))
          .cloned();
        match next {
          Some(n) => current = n,
          None => break current,
        }
      }
    };
    new_root.borrow_mut().parent = None;
    // if the nearest ancestor sits strictly behind the finalized block and
    // has no action to carry forward, synthesize a root exactly at
    // `finalized` so invariant (c) in spec §3 holds precisely.
    if new_root.borrow().block != finalized {
      let synthetic = Rc::new(RefCell::new(ScheduleNode {
        block: finalized,
        parent: None,
        descendants: new_root.borrow().descendants.clone(),
        current_authorities: Arc::clone(&new_root.borrow().current_authorities),
        enabled: new_root.borrow().enabled,
        action: new_root.borrow().action.clone_for_settle(),
      }));
      for child in synthetic.borrow().descendants.iter() {
        child.borrow_mut().parent = Some(Rc::downgrade(&synthetic));
      }
      self.root = synthetic;
    } else {
      self.root = new_root;
    }
    Ok(())
  }

  #[cfg(test)]
  fn root_authorities(&self) -> Arc<AuthoritySet> {
    Arc::clone(&self.root.borrow().current_authorities)
  }
}

impl ScheduleAction {
  fn clone_for_settle(&self) -> ScheduleAction {
    self.clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::block_tree::InMemoryBlockTree;
  use crate::types::{BlockHeader, Hash};

  fn pk(_tag: u8) -> Pubkey {
    schnorrkel::Keypair::generate_with(&mut rand::rngs::OsRng).public.into()
  }

  fn header(number: u32, parent_hash: Hash, seed: u8) -> BlockHeader {
    BlockHeader {
      parent_hash,
      number,
      state_root: Hash([seed; 32]),
      extrinsics_root: Hash::zero(),
      digest: vec![],
    }
  }

  fn chain(len: u32) -> (InMemoryBlockTree, Vec<BlockInfo>) {
    let genesis = header(0, Hash::zero(), 0);
    let genesis_hash = genesis.hash();
    let mut tree = InMemoryBlockTree::new(genesis);
    let mut infos = vec![BlockInfo::new(0, genesis_hash)];
    let mut parent_hash = genesis_hash;
    for n in 1..=len {
      let h = header(n, parent_hash, n as u8);
      parent_hash = h.hash();
      let info = tree.add_block(h).unwrap();
      infos.push(info);
    }
    (tree, infos)
  }

  #[test]
  fn scheduled_change_activates_at_height() {
    let (tree, blocks) = chain(20);
    let old_set = AuthoritySet { id: 0, authorities: vec![(pk(1), 1)] };
    let new_set = vec![(pk(2), 1)];
    let mut graph = AuthoritySetGraph::new(blocks[0], old_set.clone());

    graph.apply_scheduled_change(blocks[10], new_set.clone(), 15, 1, &tree).unwrap();

    assert_eq!(*graph.authorities(blocks[14], &tree).unwrap(), old_set);
    let activated = graph.authorities(blocks[15], &tree).unwrap();
    assert_eq!(activated.authorities, new_set);
    assert_eq!(activated.id, 1);
  }

  #[test]
  fn forced_change_under_pending_scheduled_change() {
    let (tree, blocks) = chain(35);
    let old_set = AuthoritySet { id: 0, authorities: vec![(pk(1), 1)] };
    let scheduled_new = vec![(pk(2), 1)];
    let forced_new = vec![(pk(3), 1)];
    let mut graph = AuthoritySetGraph::new(blocks[0], old_set.clone());

    graph.apply_scheduled_change(blocks[20], scheduled_new, 30, 1, &tree).unwrap();
    graph.apply_forced_change(blocks[25], forced_new.clone(), 22, 5, 2, &tree).unwrap();

    // at block 27 the forced change (activating at 22+5=27) is active.
    let active = graph.authorities(blocks[27], &tree).unwrap();
    assert_eq!(active.authorities, forced_new);
    assert_eq!(active.id, 2);

    // the scheduled change at 30 must have been cleared.
    let at_30 = graph.authorities(blocks[30], &tree).unwrap();
    assert_eq!(at_30.authorities, forced_new);
  }

  #[test]
  fn pause_zero_weights_until_resume() {
    let (tree, blocks) = chain(20);
    let set = AuthoritySet { id: 0, authorities: vec![(pk(1), 5)] };
    let mut graph = AuthoritySetGraph::new(blocks[0], set);

    graph.apply_pause(blocks[5], 10, &tree).unwrap();
    assert_eq!(graph.authorities(blocks[10], &tree).unwrap().total_weight(), 0);

    graph.apply_resume(blocks[10], 15, &tree).unwrap();
    assert_eq!(graph.authorities(blocks[14], &tree).unwrap().total_weight(), 0);
    assert_eq!(graph.authorities(blocks[15], &tree).unwrap().total_weight(), 5);
  }

  #[test]
  fn on_finalize_prunes_to_new_root() {
    let (tree, blocks) = chain(20);
    let set = AuthoritySet { id: 0, authorities: vec![(pk(1), 1)] };
    let mut graph = AuthoritySetGraph::new(blocks[0], set.clone());
    let new_set = vec![(pk(2), 1)];
    graph.apply_scheduled_change(blocks[5], new_set.clone(), 8, 1, &tree).unwrap();

    graph.on_finalize(blocks[10], &tree).unwrap();
    assert_eq!(graph.root_authorities().authorities, new_set);
    assert_eq!(graph.root.borrow().block, blocks[10]);
  }

  #[test]
  fn attaching_an_ancestor_action_after_a_descendant_reparents_it() {
    let (tree, blocks) = chain(30);
    let old_set = AuthoritySet { id: 0, authorities: vec![(pk(1), 1)] };
    let scheduled_new = vec![(pk(2), 1)];
    let forced_new = vec![(pk(3), 1)];
    let mut graph = AuthoritySetGraph::new(blocks[0], old_set);

    // attach the descendant (block 20) first, then an ancestor action
    // (block 10) below it on the same chain — `attach` must reparent the
    // block-20 node under the block-10 node rather than leaving them as
    // flat siblings of root.
    graph.apply_scheduled_change(blocks[20], scheduled_new.clone(), 25, 1, &tree).unwrap();
    graph.apply_forced_change(blocks[10], forced_new.clone(), 10, 2, 2, &tree).unwrap();

    assert_eq!(graph.root.borrow().descendants.len(), 1, "block-20 node must be reparented, not a flat sibling");
    let ancestor_node = graph.root.borrow().descendants[0].clone();
    assert_eq!(ancestor_node.borrow().block, blocks[10]);
    assert_eq!(ancestor_node.borrow().descendants.len(), 1);
    assert_eq!(ancestor_node.borrow().descendants[0].borrow().block, blocks[20]);

    // the forced change (activating at 10+2=12) must be visible before the
    // scheduled change at 25 supersedes it.
    assert_eq!(graph.authorities(blocks[15], &tree).unwrap().authorities, forced_new);
    assert_eq!(graph.authorities(blocks[15], &tree).unwrap().id, 2);

    // finalizing past both must settle the forced change on the way down
    // instead of silently discarding it.
    graph.on_finalize(blocks[26], &tree).unwrap();
    assert_eq!(graph.root_authorities().authorities, scheduled_new);
    assert_eq!(graph.root_authorities().id, 1);
  }
}
