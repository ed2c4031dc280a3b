//! Account keys and signed calls.
//!
//! An account identifier is the hex-encoded Ed25519 verifying key. Committing
//! calls carry a signature over [`Call::digest`], which binds the contract
//! address, caller, nonce, attached value and entrypoint arguments.

use std::{fs, path::Path};

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::contracts::Entrypoint;
use crate::ledger::{AccountId, Amount};

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("malformed account identifier {0}")]
    MalformedAccount(String),
    #[error("malformed secret key: {0}")]
    MalformedSecret(String),
    #[error("malformed signature from {0}")]
    MalformedSignature(AccountId),
    #[error("invalid signature from {0}")]
    InvalidSignature(AccountId),
    #[error("key file: {0}")]
    Io(#[from] std::io::Error),
    #[error("key file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("key file account {declared} does not match its secret ({derived})")]
    KeyMismatch { declared: AccountId, derived: AccountId },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Call {
    pub contract: String,
    pub caller: AccountId,
    #[serde(default)]
    pub nonce: u64,
    #[serde(default)]
    pub value: Amount,
    pub entrypoint: Entrypoint,
}

impl Call {
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"meetup-call");
        hasher.update((self.contract.len() as u64).to_le_bytes());
        hasher.update(self.contract.as_bytes());
        hasher.update((self.caller.len() as u64).to_le_bytes());
        hasher.update(self.caller.as_bytes());
        hasher.update(self.nonce.to_le_bytes());
        hasher.update(self.value.to_le_bytes());
        hasher.update(self.entrypoint.commitment());
        hasher.finalize().into()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedCall {
    pub call: Call,
    #[serde(with = "crate::identity::serde_hex")]
    pub signature: Vec<u8>,
}

impl SignedCall {
    pub fn digest(&self) -> [u8; 32] {
        self.call.digest()
    }

    pub fn verify(&self) -> Result<(), IdentityError> {
        let caller = &self.call.caller;
        let key = parse_account(caller)?;
        let signature = Signature::from_slice(&self.signature)
            .map_err(|_| IdentityError::MalformedSignature(caller.clone()))?;
        key.verify_strict(&self.digest(), &signature)
            .map_err(|_| IdentityError::InvalidSignature(caller.clone()))
    }
}

pub fn parse_account(account: &str) -> Result<VerifyingKey, IdentityError> {
    let malformed = || IdentityError::MalformedAccount(account.to_string());
    let bytes = hex::decode(account.trim()).map_err(|_| malformed())?;
    let bytes: [u8; 32] = bytes.as_slice().try_into().map_err(|_| malformed())?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| malformed())
}

pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(secret_hex.trim())
            .map_err(|e| IdentityError::MalformedSecret(e.to_string()))?;
        let bytes: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            IdentityError::MalformedSecret(format!("expected 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self {
            signing: SigningKey::from_bytes(&bytes),
        })
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing.to_bytes())
    }

    pub fn account(&self) -> AccountId {
        hex::encode(self.signing.verifying_key().as_bytes())
    }

    pub fn sign(&self, call: Call) -> SignedCall {
        let signature = self.signing.sign(&call.digest());
        SignedCall {
            call,
            signature: signature.to_bytes().to_vec(),
        }
    }
}

/// On-disk form of a keypair.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyFile {
    pub account: AccountId,
    pub secret_hex: String,
}

impl KeyFile {
    pub fn from_keypair(keypair: &Keypair) -> Self {
        Self {
            account: keypair.account(),
            secret_hex: keypair.secret_hex(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), IdentityError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Keypair, IdentityError> {
        let file: KeyFile = serde_json::from_slice(&fs::read(path)?)?;
        let keypair = Keypair::from_secret_hex(&file.secret_hex)?;
        if keypair.account() != file.account {
            return Err(IdentityError::KeyMismatch {
                declared: file.account,
                derived: keypair.account(),
            });
        }
        Ok(keypair)
    }
}

pub(crate) mod serde_hex {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(&encoded).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buy_call(keypair: &Keypair, nonce: u64) -> Call {
        Call {
            contract: "ct_test".into(),
            caller: keypair.account(),
            nonce,
            value: 4,
            entrypoint: Entrypoint::BuyTicket {
                meeting_id: 0,
                quantity: 2,
            },
        }
    }

    #[test]
    fn signed_call_verifies() {
        let keypair = Keypair::generate();
        let signed = keypair.sign(buy_call(&keypair, 1));
        signed.verify().unwrap();
        assert_eq!(parse_account(&keypair.account()).unwrap().as_bytes().len(), 32);
    }

    #[test]
    fn tampered_call_fails_verification() {
        let keypair = Keypair::generate();
        let mut signed = keypair.sign(buy_call(&keypair, 1));
        signed.call.value = 1;
        match signed.verify().unwrap_err() {
            IdentityError::InvalidSignature(account) => assert_eq!(account, keypair.account()),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn call_signed_by_someone_else_is_rejected() {
        let alice = Keypair::generate();
        let mallory = Keypair::generate();
        let mut signed = mallory.sign(buy_call(&mallory, 1));
        signed.call.caller = alice.account();
        assert!(matches!(
            signed.verify().unwrap_err(),
            IdentityError::InvalidSignature(_)
        ));

        signed.call.caller = "not-hex".into();
        assert!(matches!(
            signed.verify().unwrap_err(),
            IdentityError::MalformedAccount(_)
        ));
    }

    #[test]
    fn secret_hex_restores_the_same_account() {
        let keypair = Keypair::generate();
        let restored = Keypair::from_secret_hex(&keypair.secret_hex()).unwrap();
        assert_eq!(restored.account(), keypair.account());
        assert!(Keypair::from_secret_hex("abcd").is_err());
    }

    #[test]
    fn signature_is_hex_on_the_wire() {
        let keypair = Keypair::generate();
        let signed = keypair.sign(buy_call(&keypair, 3));
        let json = serde_json::to_value(&signed).unwrap();
        let sig = json["signature"].as_str().unwrap();
        assert_eq!(sig.len(), 128);
        let back: SignedCall = serde_json::from_value(json).unwrap();
        back.verify().unwrap();
    }

    #[test]
    fn key_file_round_trips_through_disk() {
        let keypair = Keypair::generate();
        let path = std::env::temp_dir().join(format!("meetup-key-{}.json", keypair.account()));
        KeyFile::from_keypair(&keypair).save(&path).unwrap();
        let loaded = KeyFile::load(&path).unwrap();
        assert_eq!(loaded.account(), keypair.account());
        let _ = std::fs::remove_file(&path);
    }
}
