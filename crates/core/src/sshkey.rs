use russh::keys::ssh_key::private::{Ed25519Keypair, KeypairData};
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::{Algorithm, PrivateKey};
use sha2::{Digest, Sha256};

/// Derive the ed25519 host key. A non-empty seed yields the same key on
/// every start, so reinstalling the honeypot keeps its host identity; an
/// empty seed yields a fresh random key.
pub(crate) fn host_key(seed: &str) -> Result<PrivateKey, russh::keys::ssh_key::Error> {
  if seed.is_empty() {
    return PrivateKey::random(&mut OsRng, Algorithm::Ed25519);
  }

  let digest: [u8; 32] = Sha256::digest(seed.as_bytes()).into();
  let keypair = Ed25519Keypair::from_seed(&digest);
  return PrivateKey::new(KeypairData::Ed25519(keypair), "funeypot");
}
