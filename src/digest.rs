//! C2 — Digest Tracker (spec §4.1).
//!
//! Walks a freshly-imported block's digest log and dispatches consensus
//! items to C3. Must run after the block is linked into C1 and before any
//! justification targeting it is applied (spec §5 ordering guarantee) —
//! callers are expected to enforce that sequencing; this module only
//! complains loudly (`BadOrderOfDigestItem`) when asked to process the same
//! block twice.

use std::collections::HashSet;

use codec::{Decode, Encode};
use tracing::debug;

use crate::{
  authority_set::AuthoritySetGraph,
  block_tree::BlockTree,
  error::{ConsensusError, Result},
  primitives::Pubkey,
  types::{BlockHeader, BlockInfo, DigestItem, ENGINE_ID_BEEFY, ENGINE_ID_GRANDPA},
};

/// The GRANDPA consensus-log payload carried in `Consensus(GRPA, _)` digests.
/// Shape matches the real `finality-grandpa`/substrate `ConsensusLog` enum —
/// one digest item per schedule-graph action (spec §4.2).
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub enum GrandpaDigest {
  ScheduledChange { next_authorities: Vec<(Pubkey, u64)>, delay: u32 },
  ForcedChange { delay_start: u32, delay: u32, next_authorities: Vec<(Pubkey, u64)> },
  OnDisabled { authority_index: u32 },
  Pause { delay: u32 },
  Resume { delay: u32 },
}

/// A BEEFY validator-set hint forwarded by a `Consensus(BEEF, _)` digest.
/// BEEFY itself is out of scope; this is kept only so the hint isn't
/// silently dropped (spec §4.1).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BeefyHint(pub Vec<u8>);

/// Dispatches block digests to [`AuthoritySetGraph`], enforcing the
/// `add_block -> on_digest -> apply_justification` ordering invariant.
pub struct DigestTracker {
  processed: HashSet<BlockInfo>,
}

impl Default for DigestTracker {
  fn default() -> Self {
    Self::new()
  }
}

impl DigestTracker {
  pub fn new() -> Self {
    Self { processed: HashSet::new() }
  }

  /// spec §4.1 `on_digest(B, digest)`. `set_id` is the authority-set id this
  /// block's actions should tag newly-scheduled sets with.
  pub fn on_digest(
    &mut self,
    block: BlockInfo,
    header: &BlockHeader,
    set_id: u64,
    schedule: &mut AuthoritySetGraph,
    tree: &dyn BlockTree,
  ) -> Result<Option<BeefyHint>> {
    if self.processed.contains(&block) {
      return Err(ConsensusError::BadOrderOfDigestItem(block));
    }

    let mut beefy_hint = None;
    for item in &header.digest {
      match item {
        DigestItem::Consensus(engine, payload) if *engine == ENGINE_ID_GRANDPA => {
          let grandpa_digest = GrandpaDigest::decode(&mut &payload[..])?;
          self.apply_grandpa_digest(block, grandpa_digest, set_id, schedule, tree)?;
        }
        DigestItem::Consensus(engine, payload) if *engine == ENGINE_ID_BEEFY => {
          debug!("forwarding BEEFY hint from block {:?}", block);
          beefy_hint = Some(BeefyHint(payload.clone()));
        }
        DigestItem::Consensus(engine, _) => {
          debug!("ignoring unrecognized consensus engine {:?} at block {:?}", engine, block);
        }
        DigestItem::PreRuntime(..) | DigestItem::Seal(..) | DigestItem::Other(..) => {}
      }
    }

    self.processed.insert(block);
    Ok(beefy_hint)
  }

  fn apply_grandpa_digest(
    &self,
    block: BlockInfo,
    digest: GrandpaDigest,
    set_id: u64,
    schedule: &mut AuthoritySetGraph,
    tree: &dyn BlockTree,
  ) -> Result<()> {
    match digest {
      GrandpaDigest::ScheduledChange { next_authorities, delay } => {
        schedule.apply_scheduled_change(block, next_authorities, block.number + delay, set_id + 1, tree)
      }
      GrandpaDigest::ForcedChange { delay_start, delay, next_authorities } => {
        schedule.apply_forced_change(block, next_authorities, delay_start, delay, set_id + 1, tree)
      }
      GrandpaDigest::OnDisabled { authority_index } => {
        schedule.apply_on_disabled(block, authority_index as usize, tree)
      }
      GrandpaDigest::Pause { delay } => schedule.apply_pause(block, block.number + delay, tree),
      GrandpaDigest::Resume { delay } => schedule.apply_resume(block, block.number + delay, tree),
    }
  }

  /// spec §4.1 `cancel(B)` — rolls back a block's digest processing so it can
  /// be observed again (used when B is removed from the tree, e.g. a losing
  /// fork). The schedule-graph edits themselves are undone by the caller via
  /// [`AuthoritySetGraph::cancel`], keyed on the same block.
  pub fn cancel(&mut self, block: BlockInfo) {
    self.processed.remove(&block);
  }

  pub fn is_processed(&self, block: BlockInfo) -> bool {
    self.processed.contains(&block)
  }
}
