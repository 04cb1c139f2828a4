//! consists of some cryptographic helpers: RSA keypairs, SHA-256 signatures and plain hashing

extern crate openssl;

use log::warn;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::sha;
use openssl::sign::{Signer, Verifier};

/// Modulus size for freshly generated node keys.
const RSA_BITS: u32 = 2048;

/// Generates a fresh RSA keypair; returns (private, public) as PEM bytes.
pub fn generate_keypair() -> (Vec<u8>, Vec<u8>) {
    let rsa = Rsa::generate(RSA_BITS).expect("RSA key generation failed");
    let privkey = rsa
        .private_key_to_pem()
        .expect("private key PEM encoding failed");
    let pubkey = rsa
        .public_key_to_pem()
        .expect("public key PEM encoding failed");
    (privkey, pubkey)
}

/// Signs `data` with a PEM-encoded RSA private key (PKCS#1 v1.5, SHA-256).
pub fn sign_sha256(data: &[u8], privkey_pem: &[u8]) -> Vec<u8> {
    let pkey = PKey::private_key_from_pem(privkey_pem).expect("invalid private key PEM");
    let mut signer =
        Signer::new(MessageDigest::sha256(), &pkey).expect("failed to arm the signer");
    signer.update(data).expect("signer update failed");
    signer.sign_to_vec().expect("signing failed")
}

/// Checks `sig` over `data` against a PEM-encoded RSA public key.
/// A signature that cannot even be parsed counts as invalid.
pub fn valid_sig_sha256(data: &[u8], sig: &[u8], pubkey_pem: &[u8]) -> bool {
    let pkey = match PKey::public_key_from_pem(pubkey_pem) {
        Ok(pkey) => pkey,
        Err(e) => {
            warn!("unreadable public key: {}", e);
            return false;
        }
    };
    let mut verifier = match Verifier::new(MessageDigest::sha256(), &pkey) {
        Ok(verifier) => verifier,
        Err(e) => {
            warn!("failed to arm the verifier: {}", e);
            return false;
        }
    };
    if let Err(e) = verifier.update(data) {
        warn!("verifier update failed: {}", e);
        return false;
    }
    match verifier.verify(sig) {
        Ok(res) => res,
        Err(e) => {
            warn!("defunct signature: {}", e);
            false
        }
    }
}

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> Vec<u8> {
    sha::sha256(data).to_vec()
}
