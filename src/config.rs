//! Chain configuration (ambient, SPEC_FULL §A.3).
//!
//! Grounded on the teacher's `consensus/genesis.rs::Genesis` — a
//! `serde`-driven configuration struct fixing the parameters every other
//! module reads (slot duration, epoch length, leadership rate, GRANDPA round
//! duration). The teacher's CLI-driven construction (`cli.rs::CliOpts`) is
//! dropped since the CLI surface itself is out of scope (spec §1); only the
//! struct and its (de)serialization survive.

use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
  error::{ConsensusError, Result},
  primitives::Pubkey,
  types::{AllowedSlots, BlockInfo},
};

/// One authority's public key and GRANDPA/BABE voting weight (spec §3
/// `AuthoritySet`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityConfig {
  pub public_key: Pubkey,
  pub weight: u64,
}

/// Chain-wide consensus parameters, fixed at genesis and read by C4/C5/C6/C9.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainConfig {
  /// Globally unique chain identifier, used to scope gossip and signing
  /// contexts so messages can't be replayed across chains.
  pub chain_id: String,

  /// The genesis authority set (spec §3 `AuthoritySet`, `id = 0`).
  pub authorities: Vec<AuthorityConfig>,

  /// Length of one slot (spec §4.4).
  #[serde(with = "humantime_serde")]
  pub slot_duration: Duration,

  /// Number of slots per epoch (spec §3 `EpochDescriptor`).
  pub epoch_length_slots: u64,

  /// `(num, den)` fraction of weighted stake expected to win a slot over one
  /// epoch (spec §4.3/§9 `leadership_rate`).
  pub leadership_rate: (u64, u64),

  /// Which non-primary slot kinds this chain permits (spec §3).
  pub allowed_slots: AllowedSlots,

  /// `best_block.number - last_finalized.number` beyond which C5 backs off
  /// from claiming further slots (spec §4.4 step 6).
  pub finality_lag_backoff: u32,

  /// Base duration of one GRANDPA round phase (spec §4.7); the round's
  /// prevote/precommit timeouts are `2x`/`4x` this value.
  #[serde(with = "humantime_serde")]
  pub grandpa_round_duration: Duration,

  /// Whether `apply_on_disabled` is honored by the authority-set graph
  /// (spec §9 open question — default to ignore unless set).
  #[serde(default)]
  pub honor_on_disabled: bool,
}

impl ChainConfig {
  pub fn total_weight(&self) -> u64 {
    self.authorities.iter().map(|a| a.weight).sum()
  }

  pub fn authority_list(&self) -> Vec<(Pubkey, u64)> {
    self.authorities.iter().map(|a| (a.public_key, a.weight)).collect()
  }
}

/// Per-epoch configuration lookup (spec §4.4 step 3 `config_repo.config`).
/// A real node tracks config changes signalled by `NextConfigDescriptor`
/// digests; this crate has no forks of its own to track them per-branch, so
/// it's a flat table keyed by the epoch a config becomes effective from —
/// but a lookup for an epoch with no entry at or before it still fails with
/// `MissingConfig`, same as the runtime-absent case spec step 3 describes
/// (e.g. a node that hasn't yet imported the epoch-0 config).
#[derive(Default)]
pub struct EpochConfigRepository {
  configs: BTreeMap<u64, ChainConfig>,
}

impl EpochConfigRepository {
  pub fn new() -> Self {
    Self::default()
  }

  /// Installs a config effective from `epoch` onward (e.g. a
  /// `NextConfigDescriptor` digest changing `leadership_rate`/`allowed_slots`).
  pub fn install(&mut self, epoch: u64, config: ChainConfig) {
    self.configs.insert(epoch, config);
  }

  /// `config_repo.config(best_block, epoch)`: the most recently installed
  /// config effective at or before `epoch`.
  pub fn config(&self, best_block: BlockInfo, epoch: u64) -> Result<&ChainConfig> {
    self
      .configs
      .range(..=epoch)
      .next_back()
      .map(|(_, config)| config)
      .ok_or(ConsensusError::MissingConfig(best_block))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn round_trips_through_json() {
    let keypair = schnorrkel::Keypair::generate_with(&mut rand::rngs::OsRng);
    let cfg = ChainConfig {
      chain_id: "test-net".into(),
      authorities: vec![AuthorityConfig { public_key: keypair.public.into(), weight: 1 }],
      slot_duration: Duration::from_millis(6000),
      epoch_length_slots: 600,
      leadership_rate: (1, 4),
      allowed_slots: AllowedSlots::PrimaryAndSecondaryVRF,
      finality_lag_backoff: 128,
      grandpa_round_duration: Duration::from_millis(4000),
      honor_on_disabled: false,
    };

    let json = serde_json::to_string(&cfg).unwrap();
    let decoded: ChainConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(decoded.chain_id, cfg.chain_id);
    assert_eq!(decoded.total_weight(), 1);
  }

  fn make_config(leadership_rate: (u64, u64)) -> ChainConfig {
    let keypair = schnorrkel::Keypair::generate_with(&mut rand::rngs::OsRng);
    ChainConfig {
      chain_id: "test-net".into(),
      authorities: vec![AuthorityConfig { public_key: keypair.public.into(), weight: 1 }],
      slot_duration: Duration::from_millis(6000),
      epoch_length_slots: 600,
      leadership_rate,
      allowed_slots: AllowedSlots::PrimaryAndSecondaryVRF,
      finality_lag_backoff: 128,
      grandpa_round_duration: Duration::from_millis(4000),
      honor_on_disabled: false,
    }
  }

  #[test]
  fn lookup_before_any_install_is_missing_config() {
    let repo = EpochConfigRepository::new();
    let best_block = BlockInfo::new(0, crate::types::Hash::zero());
    let err = repo.config(best_block, 0).unwrap_err();
    assert!(matches!(err, ConsensusError::MissingConfig(b) if b == best_block));
  }

  #[test]
  fn lookup_uses_the_most_recent_config_at_or_before_the_epoch() {
    let mut repo = EpochConfigRepository::new();
    let best_block = BlockInfo::new(0, crate::types::Hash::zero());
    repo.install(0, make_config((1, 4)));
    repo.install(10, make_config((1, 2)));

    assert_eq!(repo.config(best_block, 5).unwrap().leadership_rate, (1, 4));
    assert_eq!(repo.config(best_block, 10).unwrap().leadership_rate, (1, 2));
    assert_eq!(repo.config(best_block, 100).unwrap().leadership_rate, (1, 2));
    assert!(repo.config(best_block, 0).is_ok());
  }
}
