//! C6 — Block Validator / Header Verifier (spec §4.5).
//!
//! Mirrors the real header-verification flow (cf.
//! `examples/other_examples/...avail-light__src-babe.rs::verify_header`):
//! decode the pre-runtime slot claim, recompute the expected authority,
//! verify the seal, then the VRF (and threshold, for primary claims).

use std::collections::HashSet;

use codec::Decode;

use crate::{
  authority_set::AuthoritySetGraph,
  block_tree::BlockTree,
  config::ChainConfig,
  error::{ConsensusError, Result},
  lottery::{self, verify_vrf},
  primitives::verify_signature,
  types::{BlockHeader, BlockInfo, DigestItem, SlotClaim, ENGINE_ID_BABE},
};

/// Tracks `(authority_index, slot)` pairs already seen on a branch, so a
/// second header for the same slot by the same authority is rejected as an
/// equivocation (spec §4.5 step 8).
#[derive(Default)]
pub struct EquivocationTracker {
  seen: HashSet<(u32, u64)>,
}

impl EquivocationTracker {
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns `Err(TwoBlocksInSlot)` if this `(authority_index, slot)` pair
  /// was already observed; otherwise records it and returns `Ok`.
  pub fn observe(&mut self, authority_index: u32, slot: u64) -> Result<()> {
    if !self.seen.insert((authority_index, slot)) {
      return Err(ConsensusError::TwoBlocksInSlot { authority_index, slot });
    }
    Ok(())
  }
}

/// C6's public surface.
pub struct BlockValidator<'a> {
  config: &'a ChainConfig,
  epoch_length_slots: u64,
}

impl<'a> BlockValidator<'a> {
  pub fn new(config: &'a ChainConfig) -> Self {
    Self {
      config,
      epoch_length_slots: config.epoch_length_slots,
    }
  }

  fn slot_to_epoch(&self, slot: u64) -> u64 {
    slot / self.epoch_length_slots.max(1)
  }

  /// spec §4.5 `validate_header`.
  pub fn validate_header(
    &self,
    header: &BlockHeader,
    parent: BlockInfo,
    randomness: &[u8; 32],
    schedule: &AuthoritySetGraph,
    equivocations: &mut EquivocationTracker,
    tree: &dyn BlockTree,
  ) -> Result<()> {
    // 1. decode the slot claim.
    let pre_runtime = header
      .digest
      .iter()
      .find_map(|item| match item {
        DigestItem::PreRuntime(engine, payload) if *engine == ENGINE_ID_BABE => Some(payload),
        _ => None,
      })
      .ok_or_else(|| ConsensusError::BadOrderOfDigestItem(BlockInfo::new(header.number, header.hash())))?;
    let claim = SlotClaim::decode(&mut &pre_runtime[..])?;

    // 2/3. epoch + authority set for the parent.
    let epoch = self.slot_to_epoch(claim.slot_number);
    let authority_set = schedule
      .authorities(parent, tree)
      .ok_or(ConsensusError::OrphanBlockOrAlreadyFinalized)?;

    // 4. slot type permitted?
    if !self.config.allowed_slots.permits(claim.slot_type) {
      return Err(ConsensusError::SecondaryDisabled);
    }

    // 5. recompute expected authority.
    let (authority_id, weight) = authority_set
      .authorities
      .get(claim.authority_index as usize)
      .copied()
      .ok_or(ConsensusError::InvalidSignature)?;

    // 6. verify the seal.
    let seal = header.seal().ok_or_else(|| {
      ConsensusError::BadOrderOfDigestItem(BlockInfo::new(header.number, header.hash()))
    })?;
    if !verify_signature(&authority_id, header.pre_seal_hash().0.as_slice(), seal) {
      return Err(ConsensusError::InvalidSeal);
    }

    // 7. VRF / threshold, where required.
    use crate::types::SlotType;
    match claim.slot_type {
      SlotType::Primary | SlotType::SecondaryVRF => {
        let vrf = claim.vrf_output.as_ref().ok_or(ConsensusError::InvalidVrf)?;
        let public = authority_id.to_schnorrkel().map_err(|_| ConsensusError::InvalidVrf)?;
        let inout = verify_vrf(&public, randomness, claim.slot_number, epoch, vrf).ok_or(ConsensusError::InvalidVrf)?;
        if claim.slot_type == SlotType::Primary {
          let threshold = lottery::calculate_primary_threshold(
            self.config.leadership_rate,
            weight,
            authority_set.total_weight(),
          );
          if !lottery::wins_threshold(&inout, threshold) {
            return Err(ConsensusError::InvalidVrf);
          }
        }
      }
      SlotType::SecondaryPlain => {
        let expected =
          lottery::secondary_slot_author(claim.slot_number, authority_set.authorities.len(), randomness);
        if expected != claim.authority_index as usize {
          return Err(ConsensusError::InvalidSignature);
        }
      }
    }

    // 8. two-blocks-in-slot equivocation.
    equivocations.observe(claim.authority_index, claim.slot_number)?;

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    authority_set::AuthoritySet,
    block_tree::InMemoryBlockTree,
    config::AuthorityConfig,
    primitives::Keypair,
    types::{AllowedSlots, Hash, VrfOutput},
  };
  use std::time::Duration;

  fn make_config(authorities: Vec<(crate::primitives::Pubkey, u64)>) -> ChainConfig {
    ChainConfig {
      chain_id: "test".into(),
      authorities: authorities.into_iter().map(|(public_key, weight)| AuthorityConfig { public_key, weight }).collect(),
      slot_duration: Duration::from_millis(1000),
      epoch_length_slots: 10,
      leadership_rate: (1, 1),
      allowed_slots: AllowedSlots::PrimaryAndSecondaryVRF,
      finality_lag_backoff: 100,
      grandpa_round_duration: Duration::from_millis(1000),
      honor_on_disabled: false,
    }
  }

  #[test]
  fn accepts_a_correctly_produced_primary_block_and_rejects_tampering() {
    let keypair: Keypair = schnorrkel::Keypair::generate_with(&mut rand::rngs::OsRng).into();
    let config = make_config(vec![(keypair.public(), 1)]);
    let randomness = [9u8; 32];

    let genesis = BlockHeader {
      parent_hash: Hash::zero(),
      number: 0,
      state_root: Hash::zero(),
      extrinsics_root: Hash::zero(),
      digest: vec![],
    };
    let genesis_hash = genesis.hash();
    let tree = InMemoryBlockTree::new(genesis);
    let schedule = AuthoritySetGraph::new(
      BlockInfo::new(0, genesis_hash),
      AuthoritySet { id: 0, authorities: config.authority_list() },
    );

    let slot = 3u64;
    let transcript_randomness = randomness;
    let (inout, proof, _) = keypair.inner().vrf_sign({
      let mut t = merlin::Transcript::new(b"consensus-core-babe-vrf");
      t.append_message(b"randomness", &transcript_randomness);
      t.append_u64(b"slot", slot);
      t.append_u64(b"epoch", 0);
      t
    });
    let vrf_output = VrfOutput { output: inout.to_preout().to_bytes(), proof: proof.to_bytes() };

    let claim = SlotClaim {
      authority_index: 0,
      slot_number: slot,
      slot_type: crate::types::SlotType::Primary,
      vrf_output: Some(vrf_output),
    };
    let mut header = BlockHeader {
      parent_hash: genesis_hash,
      number: 1,
      state_root: Hash::zero(),
      extrinsics_root: Hash::zero(),
      digest: vec![DigestItem::PreRuntime(ENGINE_ID_BABE, codec::Encode::encode(&claim))],
    };
    let seal = keypair.sign(header.pre_seal_hash().0.as_slice());
    header.digest.push(DigestItem::Seal(ENGINE_ID_BABE, seal.to_vec()));

    let validator = BlockValidator::new(&config);
    let mut equivocations = EquivocationTracker::new();
    validator
      .validate_header(&header, BlockInfo::new(0, genesis_hash), &randomness, &schedule, &mut equivocations, &tree)
      .expect("correctly produced block should validate");

    // tamper with the body (a non-seal byte) and expect the seal to fail.
    let mut tampered = header.clone();
    tampered.number = 2;
    let mut equivocations2 = EquivocationTracker::new();
    let err = validator
      .validate_header(&tampered, BlockInfo::new(0, genesis_hash), &randomness, &schedule, &mut equivocations2, &tree)
      .unwrap_err();
    assert!(matches!(err, ConsensusError::InvalidSeal));
  }

  #[test]
  fn second_block_in_same_slot_is_rejected_as_equivocation() {
    let mut equivocations = EquivocationTracker::new();
    equivocations.observe(0, 5).unwrap();
    let err = equivocations.observe(0, 5).unwrap_err();
    assert!(matches!(err, ConsensusError::TwoBlocksInSlot { authority_index: 0, slot: 5 }));
  }
}
