//! Local transaction signing
//!
//! Keys stay in-process. The transaction id is derived from the signed
//! artifact before submission, so the saga can persist it and later match the
//! ledger confirmation event against it.

use crate::error::{OrchestratorError, OrchestratorResult};

use ed25519_dalek::Signer as _;
use k256::ecdsa::signature::Signer as _;
use serde::Serialize;
use serde_json::{json, Value};
use sha3::{Digest, Keccak256, Sha3_256};
use std::collections::HashMap;

/// Parameters of an account-model value transfer
#[derive(Debug, Clone, Serialize)]
pub struct RawTxParams {
    pub from: String,
    pub to: String,
    pub amount: u64,
    pub gas: u64,
    pub nonce: u64,
}

/// A signed transaction ready for `sendRawTransaction`
#[derive(Debug, Clone)]
pub struct SignedTx {
    pub serialized: String,
    /// Keccak-256 of the serialized transaction, `0x`-prefixed
    pub tx_id: String,
}

/// Signs account-model transfers with per-address ECDSA keys
pub struct EthereumSigner {
    keys: HashMap<String, k256::ecdsa::SigningKey>,
}

impl EthereumSigner {
    /// Build a signer from hex-encoded secp256k1 keys indexed by address
    pub fn from_hex_keys(keys: &HashMap<String, String>) -> OrchestratorResult<Self> {
        let mut parsed = HashMap::new();
        for (address, key_hex) in keys {
            parsed.insert(address.to_lowercase(), decode_secp256k1(address, key_hex)?);
        }
        Ok(Self { keys: parsed })
    }

    /// Add one key, replacing any previous key for the address
    pub fn insert_key(&mut self, address: &str, key_hex: &str) -> OrchestratorResult<()> {
        self.keys
            .insert(address.to_lowercase(), decode_secp256k1(address, key_hex)?);
        Ok(())
    }

    /// Sign a transfer with the key registered for `params.from`
    pub fn sign(&self, params: &RawTxParams) -> OrchestratorResult<SignedTx> {
        let key = self
            .keys
            .get(&params.from.to_lowercase())
            .ok_or_else(|| {
                OrchestratorError::Signer(format!("no signing key for address {}", params.from))
            })?;

        let payload = serde_json::to_vec(params)
            .map_err(|e| OrchestratorError::Signer(format!("unencodable transaction: {}", e)))?;
        let signature: k256::ecdsa::Signature = key.sign(&payload);

        let mut raw = payload;
        raw.extend_from_slice(&signature.to_bytes());

        let tx_id = format!("0x{}", hex::encode(Keccak256::digest(&raw)));
        Ok(SignedTx {
            serialized: format!("0x{}", hex::encode(raw)),
            tx_id,
        })
    }
}

fn decode_secp256k1(address: &str, key_hex: &str) -> OrchestratorResult<k256::ecdsa::SigningKey> {
    let bytes = hex::decode(key_hex.trim_start_matches("0x")).map_err(|e| {
        OrchestratorError::Signer(format!("invalid key encoding for {}: {}", address, e))
    })?;
    k256::ecdsa::SigningKey::from_slice(&bytes)
        .map_err(|e| OrchestratorError::Signer(format!("invalid key for {}: {}", address, e)))
}

/// A signed chaincode proposal together with its commit request
#[derive(Debug, Clone)]
pub struct SignedProposal {
    pub signed_proposal: Value,
    pub commit_req: Value,
    /// SHA3-256 over nonce and creator, hex without prefix
    pub tx_id: String,
}

/// Signs chaincode proposals for channel-model ledgers
pub struct FabricProposalSigner {
    channel_name: String,
    signing_key: ed25519_dalek::SigningKey,
}

impl FabricProposalSigner {
    pub fn from_hex(channel_name: &str, key_hex: &str) -> OrchestratorResult<Self> {
        let bytes = hex::decode(key_hex)
            .map_err(|e| OrchestratorError::Signer(format!("invalid proposal key: {}", e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| OrchestratorError::Signer("proposal key must be 32 bytes".to_string()))?;

        Ok(Self {
            channel_name: channel_name.to_string(),
            signing_key: ed25519_dalek::SigningKey::from_bytes(&bytes),
        })
    }

    /// Build and sign a proposal for one chaincode invocation.
    ///
    /// The transaction id is fixed here, before anything is submitted, from a
    /// fresh nonce and the creator identity.
    pub fn sign_proposal(
        &self,
        chaincode_function: &str,
        args: &[String],
    ) -> OrchestratorResult<SignedProposal> {
        let nonce = *uuid::Uuid::new_v4().as_bytes();
        let creator = self.signing_key.verifying_key();

        let mut hasher = Sha3_256::new();
        hasher.update(nonce);
        hasher.update(creator.as_bytes());
        let tx_id = hex::encode(hasher.finalize());

        let proposal = json!({
            "channel": self.channel_name,
            "fcn": chaincode_function,
            "args": args,
            "nonce": hex::encode(nonce),
            "tx_id": tx_id,
        });

        let message = serde_json::to_vec(&proposal)
            .map_err(|e| OrchestratorError::Signer(format!("unencodable proposal: {}", e)))?;
        let signature = self.signing_key.sign(&message);

        let signed_proposal = json!({
            "proposal": proposal,
            "signature": hex::encode(signature.to_bytes()),
            "creator": hex::encode(creator.as_bytes()),
        });
        let commit_req = json!({
            "channel": self.channel_name,
            "tx_id": tx_id,
        });

        Ok(SignedProposal {
            signed_proposal,
            commit_req,
            tx_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> EthereumSigner {
        let mut keys = HashMap::new();
        keys.insert(
            "0xec709e".to_string(),
            hex::encode([0x11u8; 32]),
        );
        EthereumSigner::from_hex_keys(&keys).unwrap()
    }

    fn params(nonce: u64) -> RawTxParams {
        RawTxParams {
            from: "0xec709e".to_string(),
            to: "0x36e146".to_string(),
            amount: 50,
            gas: 21_000,
            nonce,
        }
    }

    #[test]
    fn test_tx_id_is_stable_for_same_params() {
        let signer = signer();
        let first = signer.sign(&params(7)).unwrap();
        let second = signer.sign(&params(7)).unwrap();
        assert_eq!(first.tx_id, second.tx_id);
        assert!(first.tx_id.starts_with("0x"));
        assert_eq!(first.tx_id.len(), 2 + 64);
    }

    #[test]
    fn test_nonce_changes_the_tx_id() {
        let signer = signer();
        let first = signer.sign(&params(7)).unwrap();
        let second = signer.sign(&params(8)).unwrap();
        assert_ne!(first.tx_id, second.tx_id);
    }

    #[test]
    fn test_unknown_sender_is_rejected() {
        let signer = signer();
        let mut p = params(1);
        p.from = "0xdeadbeef".to_string();
        assert!(matches!(
            signer.sign(&p),
            Err(OrchestratorError::Signer(_))
        ));
    }

    #[test]
    fn test_address_lookup_ignores_case() {
        let signer = signer();
        let mut p = params(1);
        p.from = "0xEC709E".to_string();
        assert!(signer.sign(&p).is_ok());
    }

    #[test]
    fn test_proposal_tx_ids_are_unique_per_call() {
        let signer =
            FabricProposalSigner::from_hex("mychannel", &hex::encode([0x22u8; 32])).unwrap();
        let first = signer
            .sign_proposal("TransferAsset", &["asset-01".to_string(), "fuser02".to_string()])
            .unwrap();
        let second = signer
            .sign_proposal("TransferAsset", &["asset-01".to_string(), "fuser02".to_string()])
            .unwrap();
        assert_ne!(first.tx_id, second.tx_id);
        assert_eq!(first.tx_id.len(), 64);
        assert_eq!(first.commit_req["tx_id"], first.tx_id.as_str());
    }
}
