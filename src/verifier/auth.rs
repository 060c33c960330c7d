//! Inbound payload authentication
//!
//! Every ledger event and sync response arriving on a channel is wrapped in a
//! sealed envelope `{payload, signature}` signed by the validator. The
//! envelope is verified against the validator's public key before anything is
//! handed to listeners; a bad signature drops the message for everyone.

use crate::error::{OrchestratorError, OrchestratorResult};

use ed25519_dalek::{Signature, VerifyingKey};
use serde_json::Value;

/// Verifies sealed envelopes from one validator
#[derive(Clone)]
pub struct EventAuthenticator {
    validator_id: String,
    verifying_key: VerifyingKey,
}

impl EventAuthenticator {
    /// Load the validator public key from `auth_key_path` (hex-encoded)
    pub fn from_key_file(validator_id: &str, path: &str) -> OrchestratorResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::Config(format!("cannot read auth key {}: {}", path, e))
        })?;
        Self::from_hex(validator_id, raw.trim())
    }

    /// Build an authenticator from a hex-encoded ed25519 public key
    pub fn from_hex(validator_id: &str, key_hex: &str) -> OrchestratorResult<Self> {
        let bytes = hex::decode(key_hex).map_err(|e| {
            OrchestratorError::Config(format!("invalid auth key encoding: {}", e))
        })?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            OrchestratorError::Config("auth key must be 32 bytes".to_string())
        })?;
        let verifying_key = VerifyingKey::from_bytes(&bytes).map_err(|e| {
            OrchestratorError::Config(format!("invalid auth key: {}", e))
        })?;

        Ok(Self {
            validator_id: validator_id.to_string(),
            verifying_key,
        })
    }

    /// Verify a sealed envelope and return the decoded payload
    pub fn verify(&self, sealed: &Value) -> OrchestratorResult<Value> {
        let payload = sealed.get("payload").ok_or_else(|| self.reject("missing payload"))?;
        let signature_hex = sealed
            .get("signature")
            .and_then(Value::as_str)
            .ok_or_else(|| self.reject("missing signature"))?;

        let signature_bytes =
            hex::decode(signature_hex).map_err(|_| self.reject("malformed signature"))?;
        let signature = Signature::from_slice(&signature_bytes)
            .map_err(|_| self.reject("malformed signature"))?;

        let message = serde_json::to_vec(payload)
            .map_err(|e| self.reject(&format!("unencodable payload: {}", e)))?;

        self.verifying_key
            .verify_strict(&message, &signature)
            .map_err(|_| self.reject("signature verification failed"))?;

        Ok(payload.clone())
    }

    fn reject(&self, message: &str) -> OrchestratorError {
        OrchestratorError::Authentication {
            validator_id: self.validator_id.clone(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn keypair() -> (SigningKey, EventAuthenticator) {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        let auth =
            EventAuthenticator::from_hex("84jUisrs", &hex::encode(signing.verifying_key().as_bytes()))
                .unwrap();
        (signing, auth)
    }

    fn seal(signing: &SigningKey, payload: Value) -> Value {
        let message = serde_json::to_vec(&payload).unwrap();
        let signature = signing.sign(&message);
        serde_json::json!({
            "payload": payload,
            "signature": hex::encode(signature.to_bytes()),
        })
    }

    #[test]
    fn test_verify_roundtrip() {
        let (signing, auth) = keypair();
        let payload = serde_json::json!({"blockData": [{"hash": "0xa"}]});
        let sealed = seal(&signing, payload.clone());
        assert_eq!(auth.verify(&sealed).unwrap(), payload);
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let (signing, auth) = keypair();
        let mut sealed = seal(&signing, serde_json::json!({"amount": 1}));
        sealed["payload"]["amount"] = serde_json::json!(1000);
        assert!(matches!(
            auth.verify(&sealed),
            Err(OrchestratorError::Authentication { .. })
        ));
    }

    #[test]
    fn test_missing_signature_is_rejected() {
        let (_, auth) = keypair();
        let sealed = serde_json::json!({"payload": {"x": 1}});
        assert!(auth.verify(&sealed).is_err());
    }
}
