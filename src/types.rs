//! Wire types shared by every component (spec §3, §6).
//!
//! These are SCALE-encoded (`parity-scale-codec`) to stay bit-exact with the
//! rest of the Polkadot ecosystem — block headers, justifications and
//! authority lists produced here must decode on any other client.

use codec::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// 4-byte consensus-engine tag, e.g. `*b"BABE"`, `*b"GRPA"`.
pub type EngineId = [u8; 4];

pub const ENGINE_ID_BABE: EngineId = *b"BABE";
pub const ENGINE_ID_GRANDPA: EngineId = *b"GRPA";
pub const ENGINE_ID_BEEFY: EngineId = *b"BEEF";
pub const ENGINE_ID_SASSAFRAS: EngineId = *b"SASS";

/// A block hash. Kept as a plain 32-byte digest (rather than a
/// self-describing `multihash::Multihash`) so that `BlockHeader` matches
/// spec §3 exactly and encodes/decodes as a fixed-size SCALE array.
#[derive(
  Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode, Serialize, Deserialize,
)]
pub struct Hash(pub [u8; 32]);

impl Hash {
  pub const fn zero() -> Self {
    Hash([0u8; 32])
  }

  pub fn from_bytes(bytes: &[u8]) -> Self {
    use sha3::{Digest, Sha3_256};
    let digest = Sha3_256::digest(bytes);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Hash(out)
  }
}

impl std::fmt::Debug for Hash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", bs58::encode(self.0).into_string())
  }
}

impl std::fmt::Display for Hash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", bs58::encode(self.0).into_string())
  }
}

/// `(number, hash)` pair. Ordering is by number then hash (spec §3).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
pub struct BlockInfo {
  pub number: u32,
  pub hash: Hash,
}

impl std::fmt::Debug for BlockInfo {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "#{}({})", self.number, self.hash)
  }
}

impl PartialOrd for BlockInfo {
  fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for BlockInfo {
  fn cmp(&self, other: &Self) -> std::cmp::Ordering {
    self.number.cmp(&other.number).then(self.hash.cmp(&other.hash))
  }
}

impl BlockInfo {
  pub fn new(number: u32, hash: Hash) -> Self {
    Self { number, hash }
  }
}

/// A single entry in a header's digest log (spec §3).
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub enum DigestItem {
  PreRuntime(EngineId, Vec<u8>),
  Consensus(EngineId, Vec<u8>),
  Seal(EngineId, Vec<u8>),
  Other(Vec<u8>),
}

/// A block header (spec §3). `state_root`/`extrinsics_root` are opaque to
/// the consensus core (trie storage is out of scope) and kept only so the
/// header hash matches what the rest of the node computes.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct BlockHeader {
  pub parent_hash: Hash,
  pub number: u32,
  pub state_root: Hash,
  pub extrinsics_root: Hash,
  pub digest: Vec<DigestItem>,
}

impl BlockHeader {
  /// Hash of the header with its seal digest (if any) stripped — this is
  /// the value a `Seal` signs over (spec §3 `Seal`).
  pub fn pre_seal_hash(&self) -> Hash {
    let mut unsealed = self.clone();
    if matches!(unsealed.digest.last(), Some(DigestItem::Seal(..))) {
      unsealed.digest.pop();
    }
    Hash::from_bytes(&unsealed.encode())
  }

  /// Full hash of the header, including the seal. Used as the block's
  /// identity once it has been produced or imported.
  pub fn hash(&self) -> Hash {
    Hash::from_bytes(&self.encode())
  }

  pub fn seal(&self) -> Option<&[u8]> {
    match self.digest.last() {
      Some(DigestItem::Seal(_, sig)) => Some(sig),
      _ => None,
    }
  }
}

/// Which kind of slot claim a pre-runtime digest asserts (spec §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub enum SlotType {
  Primary,
  SecondaryPlain,
  SecondaryVRF,
}

/// VRF output + proof, encoded the way BABE wire-formats it: a 32-byte
/// pre-output and a 64-byte proof (spec §6 `BabeBlockHeader`).
#[derive(Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct VrfOutput {
  pub output: [u8; 32],
  pub proof: [u8; 64],
}

impl std::fmt::Debug for VrfOutput {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "VrfOutput({})", bs58::encode(self.output).into_string())
  }
}

/// Pre-runtime digest payload (spec §3 `SlotClaim`).
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct SlotClaim {
  pub authority_index: u32,
  pub slot_number: u64,
  pub slot_type: SlotType,
  pub vrf_output: Option<VrfOutput>,
}

/// Which slot types an epoch permits authoring with (spec §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub enum AllowedSlots {
  Primary,
  PrimaryAndSecondaryPlain,
  PrimaryAndSecondaryVRF,
}

impl AllowedSlots {
  pub fn permits(&self, slot_type: SlotType) -> bool {
    match (self, slot_type) {
      (_, SlotType::Primary) => true,
      (AllowedSlots::PrimaryAndSecondaryPlain, SlotType::SecondaryPlain) => true,
      (AllowedSlots::PrimaryAndSecondaryVRF, SlotType::SecondaryVRF) => true,
      _ => false,
    }
  }
}
