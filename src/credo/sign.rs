//! BIP-340 signatures over identity keys
//!
//! Credo tokens are signed with the same secp256k1 keys used for the
//! messaging identity. Identities travel as 32-byte x-only public keys
//! (hex or npub); signatures are 64-byte Schnorr, hex encoded.

use nostr::{Keys, PublicKey};
use once_cell::sync::Lazy;
use secp256k1::schnorr::Signature;
use secp256k1::{All, Keypair, Message, Secp256k1, XOnlyPublicKey};

use crate::errors::{WalletError, WalletResult};

static SECP: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

/// Sign a 32-byte digest with the identity key, returning the hex signature
pub fn sign_digest(keys: &Keys, digest: &[u8; 32]) -> WalletResult<String> {
    let secret_bytes = keys.secret_key().to_secret_bytes();
    let keypair = Keypair::from_seckey_slice(&SECP, &secret_bytes)
        .map_err(|e| WalletError::Signature(format!("invalid identity key: {}", e)))?;

    let message = Message::from_digest(*digest);
    // Deterministic signing: no auxiliary randomness needed for token ids
    let signature = SECP.sign_schnorr_no_aux_rand(&message, &keypair);
    Ok(signature.to_string())
}

/// Verify a hex signature over a 32-byte digest against an identity pubkey
/// given as hex or npub
pub fn verify_digest(identity: &str, digest: &[u8; 32], signature_hex: &str) -> WalletResult<()> {
    let pubkey = parse_identity(identity)?;

    let sig_bytes = hex::decode(signature_hex)
        .map_err(|e| WalletError::Signature(format!("signature is not hex: {}", e)))?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|e| WalletError::Signature(format!("malformed signature: {}", e)))?;

    let message = Message::from_digest(*digest);
    SECP.verify_schnorr(&signature, &message, &pubkey)
        .map_err(|e| WalletError::Signature(format!("verification failed: {}", e)))
}

/// Parse an identity string (hex x-only key or npub) into an x-only pubkey
pub fn parse_identity(identity: &str) -> WalletResult<XOnlyPublicKey> {
    let parsed = PublicKey::parse(identity)
        .map_err(|e| WalletError::Signature(format!("invalid identity pubkey: {}", e)))?;

    let bytes = hex::decode(parsed.to_hex())
        .map_err(|e| WalletError::Signature(format!("identity not hex: {}", e)))?;
    XOnlyPublicKey::from_slice(&bytes)
        .map_err(|e| WalletError::Signature(format!("not an x-only key: {}", e)))
}

/// Hex form of the local identity's public key
pub fn identity_hex(keys: &Keys) -> String {
    keys.public_key().to_hex()
}
