//! C5 — Block Producer (spec §4.4).
//!
//! Drives one slot tick end to end: leadership check, inherents assembly,
//! proposal, seal, submission. Steps 9/10 (inherents assembly, block
//! proposal) reach into the runtime/proposer/parachain-inherent stack, which
//! is out of scope (spec §1 Non-goals) — [`Proposer`] is the seam that stack
//! would plug into, shaped the way the teacher separates block assembly from
//! consensus (cf. `consensus/mod.rs::Consensus::propose`).

use std::time::Instant;

use codec::Encode;
use tracing::{debug, info, warn};

use crate::{
  authority_set::AuthoritySetGraph,
  block_tree::BlockTree,
  config::EpochConfigRepository,
  digest::DigestTracker,
  error::{ConsensusError, Result},
  lottery::{self, SlotLottery},
  primitives::Keypair,
  types::{BlockHeader, BlockInfo, DigestItem, Hash, SlotClaim, SlotType, ENGINE_ID_BABE},
};

/// How many extra slot durations past the deadline a block may still be
/// submitted under before C5 aborts as late (spec §4.4 step 13).
const K_OVERTIME: u32 = 2;

/// Inherent data assembled before proposing (spec §4.4 step 9).
/// `parachain_inherent_data` stands in for the bitfield/backing/dispute
/// collaborators' payloads; those subsystems are out of scope, so it is
/// carried as an opaque blob the proposer is free to ignore.
pub struct Inherents {
  pub timestamp: u64,
  pub slot: u64,
  pub parachain_inherent_data: Vec<u8>,
}

/// An unsealed block as returned by the (out-of-scope) block-authoring
/// pipeline (spec §4.4 step 10).
pub struct UnsealedBlock {
  pub header: BlockHeader,
  pub computed_extrinsics_root: Hash,
}

/// The seam C5 calls into for everything this crate does not implement:
/// transaction inclusion, WASM execution, parachain backing (spec §1
/// Non-goals).
pub trait Proposer {
  fn propose(
    &self,
    parent: BlockInfo,
    deadline: Instant,
    inherents: &Inherents,
    pre_digest: DigestItem,
  ) -> Result<UnsealedBlock>;
}

/// One slot's worth of external clock input (spec §4.4 "Inputs per slot
/// tick").
pub struct SlotTick {
  pub slot_number: u64,
  pub best_block: BlockInfo,
  pub slot_timestamp: u64,
  pub slot_started_at: Instant,
}

/// C5's public surface.
pub struct BlockProducer<'a, P> {
  configs: &'a EpochConfigRepository,
  /// Epoch duration is fixed at genesis and never revised by a
  /// `NextConfigDescriptor` (only `leadership_rate`/`allowed_slots` are), so
  /// it lives outside the per-epoch lookup — step 2 needs it before step 3
  /// can even run.
  epoch_length_slots: u64,
  keypair: Option<Keypair>,
  lottery: SlotLottery,
  last_epoch: Option<u64>,
  proposer: P,
}

impl<'a, P: Proposer> BlockProducer<'a, P> {
  pub fn new(configs: &'a EpochConfigRepository, epoch_length_slots: u64, keypair: Option<Keypair>, proposer: P) -> Self {
    Self { configs, epoch_length_slots, keypair, lottery: SlotLottery::new(), last_epoch: None, proposer }
  }

  fn slot_to_epoch(&self, slot: u64) -> u64 {
    slot / self.epoch_length_slots.max(1)
  }

  /// spec §4.4 `algorithm`, steps 2-15 (step 1's wall-clock slot check is the
  /// caller's responsibility — it supplies `tick` only once its own clock
  /// agrees this is the current slot).
  pub fn produce_slot(
    &mut self,
    tick: SlotTick,
    schedule: &mut AuthoritySetGraph,
    tree: &mut dyn BlockTree,
    digests: &mut DigestTracker,
    randomness: [u8; 32],
    now: Instant,
  ) -> Result<Option<BlockInfo>> {
    // 2. epoch.
    let epoch = self.slot_to_epoch(tick.slot_number);
    // 3. epoch config lookup.
    let config = self.configs.config(tick.best_block, epoch)?;

    // 4. session key lookup.
    let keypair = self.keypair.as_ref().ok_or(ConsensusError::NoValidator)?;
    let own_id = keypair.public();

    let authority_set = schedule
      .authorities(tick.best_block, tree)
      .ok_or(ConsensusError::OrphanBlockOrAlreadyFinalized)?;
    let Some(own_index) = authority_set.authorities.iter().position(|(id, _)| *id == own_id) else {
      return Err(ConsensusError::NoValidator);
    };
    let own_weight = authority_set.authorities[own_index].1;

    // 5. epoch change.
    if self.last_epoch != Some(epoch) {
      let threshold =
        lottery::calculate_primary_threshold(config.leadership_rate, own_weight, authority_set.total_weight());
      self.lottery.change_epoch(epoch, randomness, threshold, keypair.inner().clone());
      self.last_epoch = Some(epoch);
      debug!(epoch, "slot lottery rolled to new epoch");
    }

    // 6. backoff policy.
    let finalized = tree.last_finalized();
    if tick.best_block.number.saturating_sub(finalized.number) > config.finality_lag_backoff {
      return Err(ConsensusError::BackingOff);
    }

    // 7/8. leadership.
    let (slot_type, vrf_output) = if let Some(vrf) = self.lottery.slot_leadership(tick.slot_number) {
      (SlotType::Primary, Some(vrf))
    } else {
      let authored_by_me =
        lottery::secondary_slot_author(tick.slot_number, authority_set.authorities.len(), &randomness) == own_index;
      match (authored_by_me, config.allowed_slots) {
        (true, crate::types::AllowedSlots::PrimaryAndSecondaryVRF) => {
          let vrf = self.lottery.slot_vrf_signature(tick.slot_number);
          (SlotType::SecondaryVRF, vrf)
        }
        (true, crate::types::AllowedSlots::PrimaryAndSecondaryPlain) => (SlotType::SecondaryPlain, None),
        _ => return Err(ConsensusError::NoSlotLeader),
      }
    };

    let claim = SlotClaim { authority_index: own_index as u32, slot_number: tick.slot_number, slot_type, vrf_output };
    let pre_digest = DigestItem::PreRuntime(ENGINE_ID_BABE, claim.encode());

    // 9. inherents.
    let inherents =
      Inherents { timestamp: tick.slot_timestamp, slot: tick.slot_number, parachain_inherent_data: vec![] };

    // 10. propose.
    let slot_duration = config.slot_duration;
    let deadline = tick.slot_started_at + slot_duration - slot_duration / 3;
    let unsealed = self.proposer.propose(tick.best_block, deadline, &inherents, pre_digest)?;

    // 11. extrinsics-root check.
    if unsealed.header.extrinsics_root != unsealed.computed_extrinsics_root {
      warn!(slot = tick.slot_number, "proposer returned a body whose extrinsics root does not match");
      return Err(ConsensusError::InvalidSeal);
    }

    // 12. seal.
    let mut header = unsealed.header;
    let pre_seal_hash = header.pre_seal_hash();
    let seal = keypair.sign(pre_seal_hash.0.as_slice());
    header.digest.push(DigestItem::Seal(ENGINE_ID_BABE, seal.to_vec()));

    // 13. late-abort.
    let slot_finish = tick.slot_started_at + slot_duration;
    if now > slot_finish + slot_duration * K_OVERTIME {
      warn!(slot = tick.slot_number, "block produced too late, aborting");
      return Err(ConsensusError::BackingOff);
    }

    // 14. submit.
    let block = tree.add_block(header.clone())?;
    if let Err(e) = digests.on_digest(block, &header, authority_set.id, schedule, tree) {
      warn!("best-effort leaf removal after digest processing failed: {e}");
      let _ = tree.remove_leaf(block.hash);
      return Err(e);
    }
    info!(slot = tick.slot_number, ?block, ?slot_type, "produced and submitted block");

    // 15. offchain-worker spawn is fire-and-forget and out of scope; only
    // logged here.
    if tree.best_block() == block {
      debug!(?block, "new best block, would spawn offchain-worker task here");
    }

    Ok(Some(block))
  }
}
