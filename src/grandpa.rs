//! C9 — GRANDPA Coordinator (spec §4.8).
//!
//! Owns the chain of recent [`VotingRound`]s and the justification-apply
//! entrypoint; round-to-round sequencing and the postponed-justification
//! retry queue (spec §7 `NotEnoughWeight`) live here.

use std::{
  collections::{HashMap, VecDeque},
  time::{Duration, Instant},
};

use codec::{Decode, Encode};
use tracing::{debug, warn};

use crate::{
  authority_set::AuthoritySetGraph,
  block_tree::BlockTree,
  error::{ConsensusError, Result},
  primitives::{verify_signature, Pubkey},
  types::{BlockHeader, BlockInfo},
  vote_graph::VoterSet,
  voting_round::{PriorRoundView, VotingRound},
};

/// At most this many completed rounds are kept for catch-up replies (spec
/// §4.8).
pub const KEEP_RECENT: usize = 3;

/// A peer whose view trails ours by at least this many rounds triggers a
/// catch-up request (spec §4.8 Neighbor handling).
pub const CATCH_UP_THRESHOLD: u64 = 2;

/// spec §6 `SignedMessage<Precommit>`.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct SignedPrecommit {
  pub target: BlockInfo,
  pub id: Pubkey,
  pub signature: [u8; 64],
}

impl SignedPrecommit {
  fn signing_payload(round: u64, set_id: u64, target: BlockInfo) -> Vec<u8> {
    (round, set_id, target).encode()
  }

  pub fn verify(&self, round: u64, set_id: u64) -> bool {
    verify_signature(&self.id, &Self::signing_payload(round, set_id, self.target), &self.signature)
  }
}

/// spec §3/§6 `GrandpaJustification`.
#[derive(Clone, Debug, Encode, Decode)]
pub struct GrandpaJustification {
  pub round: u64,
  pub set_id: u64,
  pub block: BlockInfo,
  pub items: Vec<SignedPrecommit>,
  pub votes_ancestries: Vec<BlockHeader>,
}

/// `{round, set_id, last_finalized}` neighbor view (spec §4.8, §6).
#[derive(Clone, Copy, Debug)]
pub struct NeighborView {
  pub round: u64,
  pub set_id: u64,
  pub last_finalized: BlockInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAction {
  None,
  SendCatchUpRequest,
  /// Positive delta rewards good behavior, negative penalizes (spec §9
  /// "reputation-delta constants are chain-specific; treat as tunable").
  AdjustReputation(i32),
}

struct PendingCatchUp {
  round: u64,
  set_id: u64,
  requested_at: Instant,
}

/// C9's public surface.
pub struct GrandpaCoordinator {
  rounds: VecDeque<VotingRound>,
  own_id: Option<Pubkey>,
  round_duration: Duration,
  peers: HashMap<Pubkey, NeighborView>,
  pending_catch_up: Option<PendingCatchUp>,
  postponed: Vec<GrandpaJustification>,
}

impl GrandpaCoordinator {
  pub fn new(
    genesis_voters: VoterSet,
    genesis_block: BlockInfo,
    own_id: Option<Pubkey>,
    round_duration: Duration,
    now: Instant,
  ) -> Self {
    let prior = PriorRoundView { estimate: genesis_block, finalized: Some(genesis_block) };
    let first =
      VotingRound::new(1, 0, genesis_voters, own_id, prior, round_duration, now);
    let mut rounds = VecDeque::new();
    rounds.push_front(first);
    Self { rounds, own_id, round_duration, peers: HashMap::new(), pending_catch_up: None, postponed: vec![] }
  }

  pub fn current_round(&self) -> &VotingRound {
    self.rounds.front().expect("always at least one round")
  }

  pub fn current_round_mut(&mut self) -> &mut VotingRound {
    self.rounds.front_mut().expect("always at least one round")
  }

  /// spec §4.8 `try_execute_next_round`.
  pub fn try_execute_next_round(
    &mut self,
    prev_round_number: u64,
    schedule: &AuthoritySetGraph,
    tree: &dyn BlockTree,
    now: Instant,
  ) -> Result<()> {
    if self.current_round().round_number != prev_round_number {
      debug!("try_execute_next_round({}): no longer the current round", prev_round_number);
      return Ok(());
    }
    let prev = self.current_round();
    let finalized = prev.finalized().unwrap_or(tree.last_finalized());
    let estimate = prev.finalized().unwrap_or(finalized);

    let authorities = schedule.authorities(finalized, tree).ok_or(ConsensusError::OrphanBlockOrAlreadyFinalized)?;
    let new_set_id = authorities.id;
    let voters = VoterSet::new(authorities.authorities.iter().copied());

    let new_round_number = if new_set_id != self.current_set_id() { 1 } else { prev_round_number + 1 };
    let prior = PriorRoundView { estimate, finalized: prev.finalized() };
    let round = VotingRound::new(new_round_number, new_set_id, voters, self.own_id, prior, self.round_duration, now);

    self.rounds.push_front(round);
    while self.rounds.len() > KEEP_RECENT {
      self.rounds.pop_back();
    }
    Ok(())
  }

  fn current_set_id(&self) -> u64 {
    self.current_round().set_id
  }

  fn round_mut(&mut self, round_number: u64, set_id: u64) -> Option<&mut VotingRound> {
    self.rounds.iter_mut().find(|r| r.round_number == round_number && r.set_id == set_id)
  }

  /// spec §4.8 Peer-message handling — Neighbor.
  pub fn handle_neighbor(&mut self, peer: Pubkey, view: NeighborView, now: Instant) -> PeerAction {
    self.peers.insert(peer, view);
    if view.round >= self.current_round().round_number + CATCH_UP_THRESHOLD {
      if self.pending_catch_up.is_some() {
        return PeerAction::None;
      }
      self.pending_catch_up = Some(PendingCatchUp { round: view.round, set_id: view.set_id, requested_at: now });
      return PeerAction::SendCatchUpRequest;
    }
    PeerAction::None
  }

  /// spec §4.8 Peer-message handling — CatchUpRequest. Only honored if the
  /// requester is strictly behind and on our set.
  pub fn should_honor_catch_up_request(&self, requester: NeighborView) -> bool {
    requester.set_id == self.current_set_id() && requester.round < self.current_round().round_number
  }

  /// spec §4.8 Peer-message handling — CatchUpResponse. Clears the pending
  /// request only if it answers the round/set we actually asked about;
  /// a response for a stale request (we've since moved further ahead) is
  /// ignored.
  pub fn handle_catch_up_response(&mut self, response_round: u64, response_set_id: u64) -> bool {
    match &self.pending_catch_up {
      Some(pending) if pending.round == response_round && pending.set_id == response_set_id => {
        self.pending_catch_up = None;
        true
      }
      _ => false,
    }
  }

  /// True once a previously sent catch-up request has gone unanswered for
  /// longer than `timeout`, clearing it so a fresh request can be sent.
  pub fn expire_stale_catch_up_request(&mut self, now: Instant, timeout: Duration) -> bool {
    match &self.pending_catch_up {
      Some(pending) if now.duration_since(pending.requested_at) >= timeout => {
        self.pending_catch_up = None;
        true
      }
      _ => false,
    }
  }

  /// spec §4.8 Peer-message handling — Vote. Routes to the matching round if
  /// it is within `[current-2, current]`.
  pub fn handle_vote(&mut self, round: u64, set_id: u64, voter: Pubkey, target: BlockInfo, is_precommit: bool, tree: &dyn BlockTree) -> PeerAction {
    let current = self.current_round().round_number;
    if round + 2 < current || round > current {
      return PeerAction::AdjustReputation(-10);
    }
    let Some(r) = self.round_mut(round, set_id) else {
      return PeerAction::AdjustReputation(-5);
    };
    let result = if is_precommit { r.import_precommit(voter, target, tree) } else { r.import_prevote(voter, target, tree) };
    match result {
      crate::vote_graph::PushResult::Success | crate::vote_graph::PushResult::Duplicated => PeerAction::None,
      crate::vote_graph::PushResult::Equivocated => PeerAction::AdjustReputation(-50),
      crate::vote_graph::PushResult::VoteOfKnownEquivocator => PeerAction::AdjustReputation(-5),
    }
  }

  /// spec §4.8 `apply_justification` / §7 `NotEnoughWeight` — the only
  /// pathway with a postponed-retry queue, drained here on every call.
  pub fn apply_justification(
    &mut self,
    justification: GrandpaJustification,
    schedule: &AuthoritySetGraph,
    tree: &mut dyn BlockTree,
    now: Instant,
  ) -> Result<()> {
    self.try_apply(&justification, schedule, tree, now)?;
    self.drain_postponed(schedule, tree, now);
    Ok(())
  }

  fn try_apply(
    &mut self,
    justification: &GrandpaJustification,
    schedule: &AuthoritySetGraph,
    tree: &mut dyn BlockTree,
    now: Instant,
  ) -> Result<()> {
    if justification.set_id < self.current_set_id() {
      return Err(ConsensusError::JustificationForAuthoritySetInPast);
    }
    if justification.block.number <= tree.last_finalized().number {
      return Ok(()); // spec §8 property 7: idempotent re-apply is a no-op.
    }

    // spec §4.8: a justification for a round ahead of what we've reached,
    // but still on our current set, hops the round chain forward to meet
    // it before the justification itself is applied.
    if justification.set_id == self.current_set_id() {
      while self.current_round().round_number < justification.round {
        let prev_number = self.current_round().round_number;
        self.try_execute_next_round(prev_number, schedule, tree, now)?;
        if self.current_round().round_number <= prev_number {
          warn!(
            round = justification.round,
            "could not hop the round chain forward to meet justification; applying against the current round"
          );
          break;
        }
      }
    }

    let authorities = schedule
      .authorities(justification.block, tree)
      .ok_or(ConsensusError::OrphanBlockOrAlreadyFinalized)?;
    let voters = VoterSet::new(authorities.authorities.iter().copied());

    let mut seen = std::collections::HashSet::new();
    let mut weight = 0u64;
    for item in &justification.items {
      if !item.verify(justification.round, justification.set_id) {
        warn!("justification for {:?} carries an invalid signature from {:?}", justification.block, item.id);
        continue;
      }
      if !tree.has_direct_chain(justification.block, item.target) {
        continue;
      }
      if seen.insert(item.id) {
        weight += voters.weight_of(&item.id).unwrap_or(0);
      }
    }

    let required = voters.threshold();
    if weight < required {
      return Err(ConsensusError::NotEnoughWeight { got: weight, required });
    }

    tree.finalize(justification.block.hash)?;
    debug!(?justification.block, weight, required, "justification applied");

    // the round this justification finalized is now settled; advance past
    // it so `current_round()`/`current_set_id()` reflect the finalized
    // block rather than staying pinned to wherever we were before.
    if self.current_round().round_number == justification.round && self.current_set_id() == justification.set_id {
      self.try_execute_next_round(justification.round, schedule, tree, now)?;
    }

    Ok(())
  }

  fn drain_postponed(&mut self, schedule: &AuthoritySetGraph, tree: &mut dyn BlockTree, now: Instant) {
    let pending = std::mem::take(&mut self.postponed);
    for justification in pending {
      match self.try_apply(&justification, schedule, tree, now) {
        Ok(()) => {}
        Err(ConsensusError::NotEnoughWeight { .. }) => self.postponed.push(justification),
        Err(e) => warn!("dropping postponed justification: {e}"),
      }
    }
  }

  /// Queues a justification that failed with `NotEnoughWeight`, to be
  /// retried on the next `apply_justification` call (spec §7).
  pub fn postpone(&mut self, justification: GrandpaJustification) {
    self.postponed.push(justification);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    authority_set::AuthoritySet,
    block_tree::InMemoryBlockTree,
    primitives::Keypair,
    types::Hash,
  };

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

  fn sign_precommit(keypair: &Keypair, round: u64, set_id: u64, target: BlockInfo) -> SignedPrecommit {
    let payload = SignedPrecommit::signing_payload(round, set_id, target);
    SignedPrecommit { target, id: keypair.public(), signature: keypair.sign(&payload) }
  }

  #[test]
  fn postponed_justification_succeeds_once_weight_catches_up() {
    let (mut tree, blocks) = chain(5);
    let keypairs: Vec<Keypair> = (0..3).map(|_| schnorrkel::Keypair::generate_with(&mut rand::rngs::OsRng).into()).collect();
    let authorities: Vec<(Pubkey, u64)> = keypairs.iter().map(|k| (k.public(), 1)).collect();
    let schedule = AuthoritySetGraph::new(blocks[0], AuthoritySet { id: 0, authorities: authorities.clone() });
    let voters = VoterSet::new(authorities.iter().copied());
    let mut coordinator = GrandpaCoordinator::new(voters, blocks[0], None, Duration::from_millis(1), Instant::now());

    // only 2 of 3 authorities sign: 2/3 weight, threshold for 3 voters is 3 - floor(2/3) = 3.
    let items: Vec<_> = keypairs[..2].iter().map(|k| sign_precommit(k, 1, 0, blocks[5])).collect();
    let justification = GrandpaJustification { round: 1, set_id: 0, block: blocks[5], items, votes_ancestries: vec![] };

    let err = coordinator.apply_justification(justification.clone(), &schedule, &mut tree, Instant::now()).unwrap_err();
    assert!(matches!(err, ConsensusError::NotEnoughWeight { .. }));
    coordinator.postpone(justification);

    let full_items: Vec<_> = keypairs.iter().map(|k| sign_precommit(k, 1, 0, blocks[5])).collect();
    let full_justification = GrandpaJustification { round: 1, set_id: 0, block: blocks[5], items: full_items, votes_ancestries: vec![] };
    coordinator.apply_justification(full_justification, &schedule, &mut tree, Instant::now()).unwrap();

    assert_eq!(tree.last_finalized(), blocks[5]);
  }

  #[test]
  fn justification_ahead_of_current_round_hops_the_round_chain_forward() {
    let (mut tree, blocks) = chain(5);
    let keypairs: Vec<Keypair> = (0..3).map(|_| schnorrkel::Keypair::generate_with(&mut rand::rngs::OsRng).into()).collect();
    let authorities: Vec<(Pubkey, u64)> = keypairs.iter().map(|k| (k.public(), 1)).collect();
    let schedule = AuthoritySetGraph::new(blocks[0], AuthoritySet { id: 0, authorities: authorities.clone() });
    let voters = VoterSet::new(authorities.iter().copied());
    let mut coordinator = GrandpaCoordinator::new(voters, blocks[0], None, Duration::from_millis(1), Instant::now());
    assert_eq!(coordinator.current_round().round_number, 1);

    // a fully-signed justification for round 3, two rounds ahead of where
    // this coordinator currently sits.
    let items: Vec<_> = keypairs.iter().map(|k| sign_precommit(k, 3, 0, blocks[5])).collect();
    let justification = GrandpaJustification { round: 3, set_id: 0, block: blocks[5], items, votes_ancestries: vec![] };

    coordinator.apply_justification(justification, &schedule, &mut tree, Instant::now()).unwrap();

    assert_eq!(tree.last_finalized(), blocks[5]);
    // the round chain hopped forward to meet the justification (and then
    // one further, since applying it settles round 3 too).
    assert!(coordinator.current_round().round_number > 3);
  }

  #[test]
  fn neighbor_far_ahead_triggers_catch_up_request() {
    let (_, blocks) = chain(2);
    let voters = VoterSet::new(std::iter::once((schnorrkel::Keypair::generate_with(&mut rand::rngs::OsRng).public.into(), 1u64)));
    let mut coordinator = GrandpaCoordinator::new(voters, blocks[0], None, Duration::from_millis(1), Instant::now());
    let peer: Pubkey = schnorrkel::Keypair::generate_with(&mut rand::rngs::OsRng).public.into();

    let action = coordinator.handle_neighbor(peer, NeighborView { round: 10, set_id: 0, last_finalized: blocks[2] }, Instant::now());
    assert_eq!(action, PeerAction::SendCatchUpRequest);
  }
}
