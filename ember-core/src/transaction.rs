use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use ember_crypto::{sha256_digest, sha256_hex};

/// Sentinel signature marking a coinbase transaction.
pub const COINBASE_SIGNATURE: &str = "coinbase";

/// A signed value transfer. `from` and `to` are hex-encoded uncompressed
/// public keys; a coinbase mint uses an empty `from` and the sentinel
/// signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Empty until signed; unsigned transactions may omit it on the wire.
    #[serde(default)]
    pub id: String,
    pub from: String,
    pub to: String,
    pub amount: u64,
    pub fee: u64,
    #[serde(default)]
    pub signature: String,
    pub timestamp: DateTime<Utc>,
}

impl Transaction {
    /// Builds an unsigned transaction stamped with the current time.
    /// `id` and `signature` stay empty until [`Self::attach_signature`].
    pub fn new(from: &str, to: &str, amount: u64, fee: u64) -> Self {
        Self {
            id: String::new(),
            from: from.to_string(),
            to: to.to_string(),
            amount,
            fee,
            signature: String::new(),
            timestamp: Utc::now(),
        }
    }

    /// Mints `amount` to `to` at a fixed instant. Deterministic inputs give
    /// a deterministic id, which the genesis block relies on.
    pub fn coinbase_at(to: &str, amount: u64, timestamp: DateTime<Utc>) -> Self {
        let mut tx = Self {
            id: String::new(),
            from: String::new(),
            to: to.to_string(),
            amount,
            fee: 0,
            signature: COINBASE_SIGNATURE.to_string(),
            timestamp,
        };
        tx.id = tx.compute_id();
        tx
    }

    pub fn coinbase(to: &str, amount: u64) -> Self {
        Self::coinbase_at(to, amount, Utc::now())
    }

    pub fn is_coinbase(&self) -> bool {
        self.from.is_empty() && self.signature == COINBASE_SIGNATURE
    }

    /// Nanosecond RFC3339 rendering used by both digests. The signing
    /// payload and the id must agree on this string byte-for-byte, so it
    /// lives in exactly one place.
    pub fn timestamp_rfc3339(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
    }

    /// 32-byte digest the sender signs: from || to || amount || fee ||
    /// timestamp, integers in decimal.
    pub fn signing_payload(&self) -> [u8; 32] {
        let payload = format!(
            "{}{}{}{}{}",
            self.from,
            self.to,
            self.amount,
            self.fee,
            self.timestamp_rfc3339()
        );
        sha256_digest(payload.as_bytes())
    }

    /// Identifier over the full envelope including the signature.
    pub fn compute_id(&self) -> String {
        let payload = format!(
            "{}{}{}{}{}{}",
            self.from,
            self.to,
            self.amount,
            self.fee,
            self.signature,
            self.timestamp_rfc3339()
        );
        sha256_hex(payload.as_bytes())
    }

    /// Attaches the sender's signature and derives the id from it.
    pub fn attach_signature(&mut self, signature: String) {
        self.signature = signature;
        self.id = self.compute_id();
    }

    /// Structural validation: field presence and id integrity. Signature
    /// verification and balance feasibility are separate checks.
    pub fn validate(&self) -> Result<()> {
        if self.is_coinbase() {
            if self.to.is_empty() {
                return Err(CoreError::InvalidInput("coinbase recipient is empty".into()));
            }
            if self.amount == 0 {
                return Err(CoreError::InvalidInput("coinbase amount is zero".into()));
            }
        } else {
            if self.from.is_empty() {
                return Err(CoreError::InvalidInput("sender address is empty".into()));
            }
            if self.to.is_empty() {
                return Err(CoreError::InvalidInput("recipient address is empty".into()));
            }
            if self.amount == 0 {
                return Err(CoreError::InvalidInput("amount is zero".into()));
            }
            if self.fee == 0 {
                return Err(CoreError::InvalidInput("fee is zero".into()));
            }
            if self.signature.is_empty() {
                return Err(CoreError::InvalidInput("signature is empty".into()));
            }
        }
        if self.id.is_empty() {
            return Err(CoreError::InvalidInput("transaction id is empty".into()));
        }
        if self.id != self.compute_id() {
            return Err(CoreError::InvalidInput(format!(
                "transaction id mismatch for {}",
                self.id
            )));
        }
        Ok(())
    }

    /// Checks the ECDSA signature against the sender address. Coinbase
    /// transactions carry no signature and always pass.
    pub fn verify_signature(&self) -> Result<()> {
        if self.is_coinbase() {
            return Ok(());
        }
        let ok = ember_crypto::verify_digest(&self.from, &self.signing_payload(), &self.signature)
            .map_err(|e| CoreError::InvalidSignature(e.to_string()))?;
        if !ok {
            return Err(CoreError::InvalidSignature(format!(
                "signature does not verify for transaction {}",
                self.id
            )));
        }
        Ok(())
    }
}
