//! Authority key material.
//!
//! Grounded on the teacher's `src/keys.rs`/`src/primitives/keys.rs` (newtype
//! over raw key bytes, base58 `Display`/`FromStr`), rebased onto `schnorrkel`
//! since the consensus core needs both Sr25519 signatures (§6 `Seal`) and a
//! VRF (§4.3), neither of which `ed25519-dalek` provides.

use std::{fmt::Display, ops::Deref, str::FromStr};

use codec::{Decode, Encode};
use schnorrkel::{Keypair as SrKeypair, PublicKey as SrPublicKey, SecretKey as SrSecretKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The signing context all authority signatures and VRF transcripts are
/// bound to, so that a signature produced for one purpose can't be replayed
/// as another.
pub const SIGNING_CONTEXT: &[u8] = b"consensus-core";

/// A trait for formatting raw key/signature bytes the way block explorers
/// expect — base58, matching `ToBase58String` in the teacher's
/// `src/primitives/b58.rs`.
pub trait ToBase58String {
  fn to_b58(&self) -> String;
}

impl ToBase58String for [u8] {
  fn to_b58(&self) -> String {
    bs58::encode(self).into_string()
  }
}

/// An authority's public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
pub struct Pubkey([u8; 32]);

impl Deref for Pubkey {
  type Target = [u8];
  fn deref(&self) -> &Self::Target {
    &self.0
  }
}

impl Display for Pubkey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", bs58::encode(self.0).into_string())
  }
}

impl std::fmt::Debug for Pubkey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "Pubkey({})", bs58::encode(self.0).into_string())
  }
}

impl From<SrPublicKey> for Pubkey {
  fn from(p: SrPublicKey) -> Self {
    Self(p.to_bytes())
  }
}

impl Pubkey {
  pub fn to_schnorrkel(&self) -> Result<SrPublicKey, KeyError> {
    SrPublicKey::from_bytes(&self.0).map_err(|_| KeyError::InvalidPublicKey)
  }

  pub fn as_bytes(&self) -> &[u8; 32] {
    &self.0
  }
}

#[derive(Debug, Error)]
pub enum KeyError {
  #[error("failed parsing base58 string")]
  Base58(#[from] bs58::decode::Error),
  #[error("not a valid public key")]
  InvalidPublicKey,
  #[error("not a valid secret key: {0}")]
  InvalidSecretKey(schnorrkel::SignatureError),
}

impl FromStr for Pubkey {
  type Err = KeyError;
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let mut bytes = [0u8; 32];
    bs58::decode(s).into(&mut bytes)?;
    Ok(Self(bytes))
  }
}

impl Serialize for Pubkey {
  fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&bs58::encode(self.0).into_string())
  }
}

impl<'de> Deserialize<'de> for Pubkey {
  fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    Pubkey::from_str(&s).map_err(serde::de::Error::custom)
  }
}

/// An authority's keypair. Used to sign seals and votes, and to run the VRF.
pub struct Keypair(SrKeypair);

impl Keypair {
  pub fn public(&self) -> Pubkey {
    self.0.public.into()
  }

  pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
    let ctx = schnorrkel::signing_context(SIGNING_CONTEXT);
    self.0.sign(ctx.bytes(msg)).to_bytes()
  }

  pub fn inner(&self) -> &SrKeypair {
    &self.0
  }
}

impl Clone for Keypair {
  fn clone(&self) -> Self {
    Self(SrKeypair::from_bytes(&self.0.to_bytes()).expect("round-trips"))
  }
}

impl std::fmt::Debug for Keypair {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("Keypair").field(&self.public()).finish()
  }
}

impl From<SrKeypair> for Keypair {
  fn from(k: SrKeypair) -> Self {
    Self(k)
  }
}

impl TryFrom<&[u8]> for Keypair {
  type Error = KeyError;
  fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
    let secret = SrSecretKey::from_bytes(value).map_err(KeyError::InvalidSecretKey)?;
    let public = secret.to_public();
    Ok(Self(SrKeypair { secret, public }))
  }
}

impl FromStr for Keypair {
  type Err = KeyError;
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let mut bytes = [0u8; 64];
    bs58::decode(s).into(&mut bytes)?;
    bytes[..].try_into()
  }
}

/// Verifies a signature over `msg` made by `pubkey` under [`SIGNING_CONTEXT`].
pub fn verify_signature(pubkey: &Pubkey, msg: &[u8], signature: &[u8]) -> bool {
  let Ok(public) = pubkey.to_schnorrkel() else {
    return false;
  };
  let Ok(sig) = schnorrkel::Signature::from_bytes(signature) else {
    return false;
  };
  let ctx = schnorrkel::signing_context(SIGNING_CONTEXT);
  public.verify(ctx.bytes(msg), &sig).is_ok()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn test_keypair() -> Keypair {
    SrKeypair::generate_with(&mut rand::rngs::OsRng).into()
  }

  #[test]
  fn sign_and_verify_round_trip() {
    let keypair = test_keypair();
    let msg = b"hello consensus";
    let sig = keypair.sign(msg);
    assert!(verify_signature(&keypair.public(), msg, &sig));
  }

  #[test]
  fn tampered_message_fails_verification() {
    let keypair = test_keypair();
    let sig = keypair.sign(b"hello consensus");
    assert!(!verify_signature(&keypair.public(), b"hello CONSENSUS", &sig));
  }

  #[test]
  fn pubkey_base58_round_trip() {
    let keypair = test_keypair();
    let encoded = keypair.public().to_string();
    let decoded: Pubkey = encoded.parse().unwrap();
    assert_eq!(keypair.public(), decoded);
  }
}
