use base64::{Engine as _, engine::general_purpose};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::boc::{self, Cell};

mod address;

pub use address::validate_address;

/// Words expected in a wallet mnemonic.
pub const MNEMONIC_WORDS: usize = 24;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("malformed mnemonic: {0}")]
    Mnemonic(String),
    #[error("key derivation failed: {0}")]
    Key(String),
    #[error("could not encode transfer: {0}")]
    Encode(String),
    #[error("invalid wallet address: {0}")]
    Address(String),
}

/// Outbound internal message carried by one wallet transaction.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub seqno: u32,
    pub destination: String,
    /// Attached value in nano units.
    pub value: u64,
    pub bounce: bool,
    pub body: Arc<Cell>,
}

/// Fully encoded, signed external message, ready for any backend.
#[derive(Clone, PartialEq, Eq)]
pub struct SignedMessage(Vec<u8>);

impl SignedMessage {
    #[cfg(test)]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SignedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignedMessage({} bytes)", self.0.len())
    }
}

/// Turns a transfer into the bytes the network accepts for `wallet`.
pub trait TransferSigner: Send + Sync {
    fn sign_transfer(&self, wallet: &str, transfer: &Transfer) -> Result<SignedMessage, WalletError>;
}

/// Wallet address plus whatever signs on its behalf.
#[derive(Clone)]
pub struct WalletAccount {
    pub address: String,
    pub signer: Arc<dyn TransferSigner>,
}

impl WalletAccount {
    pub fn new(address: impl Into<String>, signer: Arc<dyn TransferSigner>) -> Self {
        Self {
            address: address.into(),
            signer,
        }
    }

    pub fn sign(&self, transfer: &Transfer) -> Result<SignedMessage, WalletError> {
        self.signer.sign_transfer(&self.address, transfer)
    }
}

/// Lowercase, single-spaced phrase; rejects anything that is not 24 plain words.
pub fn normalize_mnemonic(phrase: &str) -> Result<String, WalletError> {
    let words: Vec<String> = phrase
        .split_whitespace()
        .map(|w| w.to_ascii_lowercase())
        .collect();
    if words.len() != MNEMONIC_WORDS {
        return Err(WalletError::Mnemonic(format!(
            "expected {MNEMONIC_WORDS} words, got {}",
            words.len()
        )));
    }
    if let Some(bad) = words.iter().find(|w| !w.chars().all(|c| c.is_ascii_alphabetic())) {
        return Err(WalletError::Mnemonic(format!("invalid word `{bad}`")));
    }
    Ok(words.join(" "))
}

/// secp256k1 key pair owned by the local process.
pub struct LocalSigner {
    secret: SecretKey,
    public: PublicKey,
}

impl LocalSigner {
    /// Derive the signing key from the SHA-256 of the normalized phrase.
    pub fn from_mnemonic(phrase: &str) -> Result<Self, WalletError> {
        let normalized = normalize_mnemonic(phrase)?;
        let digest = Sha256::digest(normalized.as_bytes());
        let secret = SecretKey::from_slice(&digest).map_err(|e| WalletError::Key(e.to_string()))?;
        let secp = Secp256k1::signing_only();
        let public = PublicKey::from_secret_key(&secp, &secret);
        Ok(Self { secret, public })
    }

    #[cfg(test)]
    pub fn random() -> Self {
        let secp = Secp256k1::new();
        let (secret, public) = secp.generate_keypair(&mut rand::rngs::OsRng);
        Self { secret, public }
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public.serialize())
    }
}

#[derive(Serialize)]
struct TransferPayload<'a> {
    wallet: &'a str,
    seqno: u32,
    destination: &'a str,
    value: u64,
    bounce: bool,
    body: String,
}

#[derive(Serialize)]
struct SignedEnvelope<'a> {
    #[serde(flatten)]
    payload: TransferPayload<'a>,
    public_key: String,
    signature: String,
}

impl TransferPayload<'_> {
    /// Canonical bytes that get hashed and signed.
    fn signing_bytes(&self) -> Result<Vec<u8>, WalletError> {
        serde_json::to_vec(self).map_err(|e| WalletError::Encode(e.to_string()))
    }

    fn sighash(&self) -> Result<[u8; 32], WalletError> {
        let digest = Sha256::digest(self.signing_bytes()?);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest[..]);
        Ok(out)
    }
}

impl TransferSigner for LocalSigner {
    fn sign_transfer(&self, wallet: &str, transfer: &Transfer) -> Result<SignedMessage, WalletError> {
        let payload = TransferPayload {
            wallet,
            seqno: transfer.seqno,
            destination: &transfer.destination,
            value: transfer.value,
            bounce: transfer.bounce,
            body: general_purpose::STANDARD.encode(boc::serialize(&transfer.body)),
        };
        let sighash = payload.sighash()?;
        let msg = Message::from_digest_slice(&sighash).map_err(|e| WalletError::Encode(e.to_string()))?;
        let secp = Secp256k1::signing_only();
        let signature = secp.sign_ecdsa(&msg, &self.secret);

        let envelope = SignedEnvelope {
            payload,
            public_key: self.public_key_hex(),
            signature: hex::encode(signature.serialize_der()),
        };
        serde_json::to_vec(&envelope)
            .map(SignedMessage)
            .map_err(|e| WalletError::Encode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::ecdsa::Signature;

    const PHRASE: &str = "abandon ability able about above absent absorb abstract absurd abuse access accident \
                          account accuse achieve acid acoustic acquire across act action actor actress actual";

    fn body() -> Arc<Cell> {
        Arc::new(Cell::new(vec![0xde, 0xad], 16, vec![]).unwrap())
    }

    fn transfer() -> Transfer {
        Transfer {
            seqno: 9,
            destination: "giver-1".into(),
            value: 50_000_000,
            bounce: true,
            body: body(),
        }
    }

    #[test]
    fn mnemonic_must_have_24_words() {
        assert!(matches!(
            normalize_mnemonic("one two three"),
            Err(WalletError::Mnemonic(_))
        ));
        let noisy = PHRASE.to_uppercase().replace(' ', "   ");
        assert_eq!(normalize_mnemonic(&noisy).unwrap(), normalize_mnemonic(PHRASE).unwrap());
    }

    #[test]
    fn mnemonic_rejects_non_words() {
        let bad = PHRASE.replacen("abandon", "ab4ndon", 1);
        assert!(normalize_mnemonic(&bad).is_err());
    }

    #[test]
    fn derivation_is_deterministic() {
        let a = LocalSigner::from_mnemonic(PHRASE).unwrap();
        let b = LocalSigner::from_mnemonic(&PHRASE.to_uppercase()).unwrap();
        assert_eq!(a.public_key_hex(), b.public_key_hex());
        assert_eq!(a.public_key_hex().len(), 66);
    }

    #[test]
    fn signed_transfer_verifies_against_sighash() {
        let signer = LocalSigner::from_mnemonic(PHRASE).unwrap();
        let account = WalletAccount::new(
            address::tests::FRIENDLY,
            Arc::new(LocalSigner::from_mnemonic(PHRASE).unwrap()),
        );
        let signed = account.sign(&transfer()).unwrap();

        let json: serde_json::Value = serde_json::from_slice(signed.as_bytes()).unwrap();
        assert_eq!(json["seqno"], 9);
        assert_eq!(json["destination"], "giver-1");
        assert_eq!(json["value"], 50_000_000);
        assert_eq!(json["bounce"], true);
        assert_eq!(json["public_key"], signer.public_key_hex());

        let payload = TransferPayload {
            wallet: &account.address,
            seqno: 9,
            destination: "giver-1",
            value: 50_000_000,
            bounce: true,
            body: general_purpose::STANDARD.encode(boc::serialize(&body())),
        };
        let msg = Message::from_digest_slice(&payload.sighash().unwrap()).unwrap();
        let sig_bytes = hex::decode(json["signature"].as_str().unwrap()).unwrap();
        let sig = Signature::from_der(&sig_bytes).unwrap();
        let secp = Secp256k1::verification_only();
        assert!(secp.verify_ecdsa(&msg, &sig, &signer.public).is_ok());
    }

    #[test]
    fn body_travels_as_standalone_bag() {
        let signer = LocalSigner::random();
        let signed = signer.sign_transfer("w", &transfer()).unwrap();
        let json: serde_json::Value = serde_json::from_slice(signed.as_bytes()).unwrap();
        let bag = general_purpose::STANDARD
            .decode(json["body"].as_str().unwrap())
            .unwrap();
        let roots = boc::deserialize(&bag).unwrap();
        assert_eq!(roots[0].data(), &[0xde, 0xad]);
    }
}
