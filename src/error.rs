//! Crate-wide error type.
//!
//! Every variant corresponds to one of the error kinds the consensus core can
//! produce. Disposition (silent skip, reject + penalize, postpone, drop) is
//! documented on each variant and is decided by the caller, not by this type.

use thiserror::Error;

use crate::types::{BlockInfo, Hash};

#[derive(Debug, Error)]
pub enum ConsensusError {
  /// Local keypair is not a member of the current authority set. Slot is
  /// skipped silently.
  #[error("this node does not hold a key in the current authority set")]
  NoValidator,

  /// The slot lottery did not elect this node and no secondary slot applies.
  #[error("not the elected leader for this slot")]
  NoSlotLeader,

  /// `best_block.number - last_finalized.number` exceeds the chain's backoff
  /// threshold; claiming would widen an already-lagging finality gap.
  #[error("finality is lagging too far behind the best block, backing off")]
  BackingOff,

  /// The runtime returned no epoch configuration for the requested block.
  #[error("no epoch configuration available for block {0:?}")]
  MissingConfig(BlockInfo),

  #[error("seal signature verification failed")]
  InvalidSeal,

  #[error("VRF proof verification failed")]
  InvalidVrf,

  #[error("signature verification failed")]
  InvalidSignature,

  /// The same authority claimed two different blocks in the same slot.
  #[error("authority {authority_index} produced two blocks in slot {slot}")]
  TwoBlocksInSlot { authority_index: u32, slot: u64 },

  /// A secondary slot claim was seen but the epoch config forbids secondary
  /// authorship.
  #[error("secondary slot claims are disabled for this epoch")]
  SecondaryDisabled,

  /// A schedule-graph action referenced a block outside the tracked tree.
  #[error("authority-set action references an orphan or already-finalized block")]
  OrphanBlockOrAlreadyFinalized,

  /// The justification's signed weight is below the supermajority threshold.
  /// Not fatal — the justification is queued and retried on the next import.
  #[error("justification carries {got} of {required} required weight")]
  NotEnoughWeight { got: u64, required: u64 },

  #[error("justification is for a round already superseded")]
  JustificationForRoundInPast,

  #[error("justification is for a block already finalized past this point")]
  JustificationForBlockInPast,

  #[error("justification is for an authority set that is no longer current")]
  JustificationForAuthoritySetInPast,

  /// A third vote arrived from a voter already flagged as an equivocator.
  #[error("redundant vote from known equivocator")]
  RedundantEquivocation,

  /// Internal-only: a finalize was attempted before the round was
  /// finalizable. Surfaced only in tests.
  #[error("round is not yet finalizable")]
  RoundIsNotFinalizable,

  /// The prevote-GHOST regressed behind the previous round's estimate; the
  /// round aborts rather than precommit (spec §4.7 Precommit action).
  #[error("prevote-GHOST is not a descendant of the previous round's estimate")]
  LastEstimateBetterThanPrevote,

  /// The ancestry chain needed to build a justification's vote-ancestry
  /// proof could not be constructed from the block tree.
  #[error("could not build ancestry for justification target {0:?}")]
  CantMakeAncestry(BlockInfo),

  /// Digest processing observed a justification applied before its block's
  /// digests were processed, or before the block was linked into the tree.
  #[error("digest items for block {0:?} were processed out of order")]
  BadOrderOfDigestItem(BlockInfo),

  #[error("block {0:?} is not known to the block tree")]
  UnknownBlock(BlockInfo),

  #[error("block {0:?} is not a descendant of the required ancestor")]
  NotDescendent(BlockInfo),

  #[error("decoding failed: {0}")]
  Codec(#[from] codec::Error),

  #[error("vote target {0:?} not found in this round's vote graph")]
  UnknownVoteTarget(Hash),
}

pub type Result<T> = std::result::Result<T, ConsensusError>;
