//! C8 — Voting Round (spec §4.7).
//!
//! The phase machine is flattened into a single `RoundPhase` enum driven by
//! `step()`, per spec §9's guidance to turn the source's coroutine-style
//! round driver into an explicit state machine — shape borrowed from the
//! real `finality-grandpa` crate's `voter::State::{Start, Prevoted,
//! Precommitted}` (`examples/other_examples/...finality-grandpa__src-voter.rs`).

use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::{
  block_tree::BlockTree,
  error::{ConsensusError, Result},
  primitives::Pubkey,
  types::BlockInfo,
  vote_graph::{PushResult, VoteGraph, VoteTracker, VoterSet},
};

/// spec §4.7's ASCII state diagram, kept as named, distinct states so every
/// transition in the spec has a one-to-one counterpart here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
  Init,
  Start,
  StartPrevote,
  PrevoteRuns,
  EndPrevote,
  StartPrecommit,
  PrecommitRuns,
  EndPrecommit,
  StartWaiting,
  WaitingRuns,
  EndWaiting,
  Completed,
}

/// Context carried over from the previous round, needed for proposal and
/// prevote selection (spec §4.7 Actions).
#[derive(Clone, Copy, Debug)]
pub struct PriorRoundView {
  pub estimate: BlockInfo,
  pub finalized: Option<BlockInfo>,
}

/// One GRANDPA round (spec §4.7).
pub struct VotingRound {
  pub round_number: u64,
  pub set_id: u64,
  voters: VoterSet,
  own_id: Option<Pubkey>,
  base: BlockInfo,
  prior: PriorRoundView,
  duration: Duration,

  phase: RoundPhase,
  phase_started_at: Instant,
  next_neighbor_broadcast: Instant,

  primary_proposal: Option<BlockInfo>,
  prevotes: VoteTracker,
  precommits: VoteTracker,
  prevote_graph: VoteGraph,
  precommit_graph: VoteGraph,

  prevote_ghost: Option<BlockInfo>,
  estimate: Option<BlockInfo>,
  finalized: Option<BlockInfo>,
}

impl VotingRound {
  pub fn new(
    round_number: u64,
    set_id: u64,
    voters: VoterSet,
    own_id: Option<Pubkey>,
    prior: PriorRoundView,
    duration: Duration,
    now: Instant,
  ) -> Self {
    Self {
      round_number,
      set_id,
      base: prior.estimate,
      voters,
      own_id,
      prior,
      duration,
      phase: RoundPhase::Init,
      phase_started_at: now,
      next_neighbor_broadcast: now,
      primary_proposal: None,
      prevotes: VoteTracker::new(),
      precommits: VoteTracker::new(),
      prevote_graph: VoteGraph::new(),
      precommit_graph: VoteGraph::new(),
      prevote_ghost: None,
      estimate: None,
      finalized: None,
    }
  }

  pub fn phase(&self) -> RoundPhase {
    self.phase
  }

  pub fn is_completed(&self) -> bool {
    self.phase == RoundPhase::Completed
  }

  pub fn finalized(&self) -> Option<BlockInfo> {
    self.finalized
  }

  fn is_primary(&self) -> bool {
    match self.own_id {
      Some(id) => self.voters.index_of(&id).map(|idx| idx as u64 == self.round_number % self.voters.len() as u64).unwrap_or(false),
      None => false,
    }
  }

  /// spec §4.7 Actions — Proposal. Only emitted once, on entering `Start`.
  fn maybe_propose(&mut self) {
    if !self.is_primary() {
      return;
    }
    let candidate = self.prior.estimate;
    let exceeds_last_finalized = self.prior.finalized.map(|f| candidate.number > f.number).unwrap_or(true);
    if exceeds_last_finalized {
      debug!(round = self.round_number, ?candidate, "broadcasting primary proposal");
      self.primary_proposal = Some(candidate);
    }
  }

  /// Records an incoming primary proposal (from gossip); a no-op after the
  /// prevote has already been cast.
  pub fn import_primary_proposal(&mut self, proposal: BlockInfo) {
    if self.phase as u8 <= RoundPhase::PrevoteRuns as u8 {
      self.primary_proposal = Some(proposal);
    }
  }

  pub fn import_prevote(&mut self, voter: Pubkey, target: BlockInfo, tree: &dyn BlockTree) -> PushResult {
    let result = self.prevotes.push(voter, target);
    if matches!(result, PushResult::Success) {
      if let Some(weight) = self.voters.weight_of(&voter) {
        self.prevote_graph.insert(target, weight, tree);
      }
    }
    result
  }

  pub fn import_precommit(&mut self, voter: Pubkey, target: BlockInfo, tree: &dyn BlockTree) -> PushResult {
    let result = self.precommits.push(voter, target);
    if matches!(result, PushResult::Success) {
      if let Some(weight) = self.voters.weight_of(&voter) {
        self.precommit_graph.insert(target, weight, tree);
      }
    }
    result
  }

  fn recompute_prevote_ghost(&mut self, tree: &dyn BlockTree) {
    let threshold = self.voters.threshold();
    self.prevote_ghost = Some(self.prevote_graph.find_ghost(self.base, |w| w >= threshold, tree));
  }

  /// spec §4.7 Actions — Prevote.
  fn cast_prevote(&mut self, tree: &dyn BlockTree) -> Option<BlockInfo> {
    self.recompute_prevote_ghost(tree);
    let ghost = self.prevote_ghost.unwrap_or(self.base);

    let target = match self.primary_proposal {
      Some(proposal) if self.prior.estimate.number <= proposal.number
        && proposal.number <= ghost.number
        && tree.has_direct_chain(self.prior.estimate, proposal)
        && tree.has_direct_chain(proposal, ghost) =>
      {
        proposal
      }
      _ => ghost,
    };

    if let Some(own) = self.own_id {
      self.import_prevote(own, target, tree);
    }
    Some(target)
  }

  /// spec §4.7 Actions — Precommit. Returns `Err(LastEstimateBetterThanPrevote)`
  /// if the round must abort rather than cast a precommit.
  fn cast_precommit(&mut self, tree: &dyn BlockTree) -> Result<Option<BlockInfo>> {
    self.recompute_prevote_ghost(tree);
    let ghost = self.prevote_ghost.unwrap_or(self.base);
    if !tree.has_direct_chain(self.prior.estimate, ghost) {
      return Err(ConsensusError::LastEstimateBetterThanPrevote);
    }
    if let Some(own) = self.own_id {
      self.import_precommit(own, ghost, tree);
    }
    Ok(Some(ghost))
  }

  /// spec §4.7 Completability: conservative check — the round is
  /// completable once the weight of voters who have *not yet* precommitted
  /// is too small to push any other branch past the supermajority
  /// threshold, so no future vote (honest or equivocating) can change the
  /// estimate.
  pub fn completable(&mut self, tree: &dyn BlockTree) -> bool {
    let threshold = self.voters.threshold();
    let committed_weight: u64 = self
      .precommits
      .votes()
      .filter(|(id, _)| !self.precommits.is_equivocator(id))
      .filter_map(|(id, _)| self.voters.weight_of(id))
      .sum();
    let remaining = self.voters.total_weight().saturating_sub(committed_weight);

    self.estimate = Some(self.precommit_graph.find_ghost(self.base, |w| w >= threshold, tree));
    remaining < threshold
  }

  /// spec §4.7 Finalizability: completable **and** some block reached
  /// supermajority precommit weight.
  pub fn finalizable(&mut self, tree: &dyn BlockTree) -> bool {
    let threshold = self.voters.threshold();
    let completable = self.completable(tree);
    let candidate = self.precommit_graph.find_ghost(self.base, |w| w >= threshold, tree);
    if candidate.number > self.base.number || candidate == self.base {
      self.finalized = Some(candidate);
    }
    completable && self.finalized.is_some()
  }

  /// spec §4.7 Finalize — calls into C1, returning the justification (the
  /// precommits on blocks equal-or-descendant of the finalized block).
  pub fn finalize(&self, tree: &mut dyn BlockTree) -> Result<Vec<(Pubkey, BlockInfo)>> {
    let Some(block) = self.finalized else {
      return Err(ConsensusError::RoundIsNotFinalizable);
    };
    let justification: Vec<(Pubkey, BlockInfo)> = self
      .precommits
      .votes()
      .filter(|(id, target)| !self.precommits.is_equivocator(id) && tree.has_direct_chain(block, **target))
      .map(|(id, target)| (*id, *target))
      .collect();
    tree.finalize(block.hash)?;
    info!(round = self.round_number, ?block, "round finalized");
    Ok(justification)
  }

  pub fn should_broadcast_neighbor(&self, now: Instant) -> bool {
    now >= self.next_neighbor_broadcast
  }

  pub fn mark_neighbor_broadcast(&mut self, now: Instant) {
    let period = self.duration.saturating_mul(10).max(Duration::from_secs(120));
    self.next_neighbor_broadcast = now + period;
  }

  /// Drives the phase machine one step forward; call repeatedly from timer
  /// callbacks and message handlers (spec §9).
  pub fn step(&mut self, now: Instant, tree: &dyn BlockTree) -> Result<()> {
    match self.phase {
      RoundPhase::Init => {
        self.phase = RoundPhase::Start;
      }
      RoundPhase::Start => {
        self.maybe_propose();
        self.phase = RoundPhase::StartPrevote;
      }
      RoundPhase::StartPrevote => {
        self.phase_started_at = now;
        self.phase = RoundPhase::PrevoteRuns;
      }
      RoundPhase::PrevoteRuns => {
        if now >= self.phase_started_at + self.duration * 2 || self.completable(tree) {
          self.phase = RoundPhase::EndPrevote;
        }
      }
      RoundPhase::EndPrevote => {
        self.cast_prevote(tree);
        self.phase = RoundPhase::StartPrecommit;
      }
      RoundPhase::StartPrecommit => {
        self.phase_started_at = now;
        self.phase = RoundPhase::PrecommitRuns;
      }
      RoundPhase::PrecommitRuns => {
        if now >= self.phase_started_at + self.duration * 4 || self.completable(tree) {
          self.phase = RoundPhase::EndPrecommit;
        }
      }
      RoundPhase::EndPrecommit => {
        self.cast_precommit(tree)?;
        self.phase = RoundPhase::StartWaiting;
      }
      RoundPhase::StartWaiting => {
        self.phase_started_at = now;
        self.phase = RoundPhase::WaitingRuns;
      }
      RoundPhase::WaitingRuns => {
        let prev_leq = self.prior.finalized.map(|f| self.finalized.map(|b| f.number <= b.number).unwrap_or(false)).unwrap_or(true);
        if self.finalizable(tree) && prev_leq {
          self.phase = RoundPhase::EndWaiting;
        }
      }
      RoundPhase::EndWaiting => {
        self.phase = RoundPhase::Completed;
      }
      RoundPhase::Completed => {}
    }
    Ok(())
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

  fn pk() -> Pubkey {
    schnorrkel::Keypair::generate_with(&mut rand::rngs::OsRng).public.into()
  }

  #[test]
  fn round_finalizes_once_supermajority_precommits_land() {
    let (mut tree, blocks) = chain(5);
    let voters: Vec<Pubkey> = (0..3).map(|_| pk()).collect();
    let voter_set = VoterSet::new(voters.iter().map(|id| (*id, 1)));
    let prior = PriorRoundView { estimate: blocks[0], finalized: Some(blocks[0]) };

    let mut round = VotingRound::new(1, 0, voter_set, None, prior, Duration::from_millis(1), Instant::now());
    for voter in &voters {
      round.import_prevote(*voter, blocks[5], &tree);
    }
    for voter in &voters {
      round.import_precommit(*voter, blocks[5], &tree);
    }

    assert!(round.finalizable(&tree));
    let justification = round.finalize(&mut tree).expect("round should finalize");
    assert_eq!(justification.len(), 3);
    assert_eq!(tree.last_finalized(), blocks[5]);
  }

  #[test]
  fn equivocating_voter_does_not_block_finalization_of_remaining_majority() {
    let (tree, blocks) = chain(5);
    let voters: Vec<Pubkey> = (0..4).map(|_| pk()).collect();
    let voter_set = VoterSet::new(voters.iter().map(|id| (*id, 1)));
    let prior = PriorRoundView { estimate: blocks[0], finalized: Some(blocks[0]) };
    let mut round = VotingRound::new(1, 0, voter_set, None, prior, Duration::from_millis(1), Instant::now());

    // voters[0] equivocates between two targets; the other three agree.
    round.import_precommit(voters[0], blocks[2], &tree);
    round.import_precommit(voters[0], blocks[3], &tree);
    for voter in &voters[1..] {
      round.import_precommit(*voter, blocks[5], &tree);
    }

    assert!(round.finalizable(&tree));
  }
}
