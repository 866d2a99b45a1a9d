use serde::{Deserialize, Serialize};
use thiserror::Error;

use ember_core::Transaction;
use ember_crypto::CryptoError;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("private key does not control the sender address")]
    AddressMismatch,
}

/// A keypair as handed out by the façade. The private key is plain hex;
/// protecting it at rest is explicitly out of scope here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub address: String,
    pub private_key: String,
}

impl Wallet {
    pub fn generate() -> Self {
        let keypair = ember_crypto::generate_keypair();
        Self {
            address: keypair.address,
            private_key: keypair.private_key,
        }
    }
}

/// Signs an unsigned transaction in place: fills `signature` and derives
/// the id. The key must belong to the transaction's `from` address.
pub fn sign_transaction(private_key: &str, tx: &mut Transaction) -> Result<(), WalletError> {
    let address = ember_crypto::address_from_private_key(private_key)?;
    if tx.from != address {
        return Err(WalletError::AddressMismatch);
    }
    let signature = ember_crypto::sign_digest(private_key, &tx.signing_payload())?;
    tx.attach_signature(signature);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_wallet_signs_a_transfer() {
        let wallet = Wallet::generate();
        let to = Wallet::generate();
        let mut tx = Transaction::new(&wallet.address, &to.address, 100, 10);
        sign_transaction(&wallet.private_key, &mut tx).unwrap();
        tx.validate().unwrap();
        tx.verify_signature().unwrap();
    }

    #[test]
    fn foreign_key_is_rejected() {
        let wallet = Wallet::generate();
        let other = Wallet::generate();
        let mut tx = Transaction::new(&wallet.address, &other.address, 100, 10);
        assert!(matches!(
            sign_transaction(&other.private_key, &mut tx),
            Err(WalletError::AddressMismatch)
        ));
    }

    #[test]
    fn bad_key_surfaces_crypto_error() {
        let wallet = Wallet::generate();
        let mut tx = Transaction::new(&wallet.address, &wallet.address, 1, 1);
        assert!(matches!(
            sign_transaction("not-hex", &mut tx),
            Err(WalletError::Crypto(_))
        ));
    }
}
