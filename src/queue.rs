//! Durable resume queue
//!
//! Between segments the engine hands itself a signed resume message through
//! an external durable queue. The queue owns retries and dead-lettering;
//! the engine owns message authenticity.

use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{EngineError, EngineResult};
use crate::execution::ExecutionId;

/// Body of a resume message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeMessage {
    /// Execution to resume
    pub execution_id: ExecutionId,
    /// Segment the checkpoint belongs to
    pub segment_number: u64,
    /// First step index the next segment should consider
    #[serde(default)]
    pub start_step_index: Option<usize>,
    /// Trace id carried across segments
    pub trace_id: String,
}

/// Resume message plus its detached signature
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedResumeMessage {
    /// Message body
    pub message: ResumeMessage,
    /// Hex-encoded ed25519 signature over the canonical body
    pub signature: String,
}

fn canonical_bytes(message: &ResumeMessage) -> EngineResult<Vec<u8>> {
    serde_json::to_vec(message).map_err(|e| EngineError::Serialization(e.to_string()))
}

/// Signs outgoing resume messages
pub struct MessageSigner {
    signing_key: SigningKey,
}

impl MessageSigner {
    /// Build a signer from 32 bytes of key material
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    /// Public half for verification
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign a message body
    pub fn sign(&self, message: ResumeMessage) -> EngineResult<SignedResumeMessage> {
        let bytes = canonical_bytes(&message)?;
        let signature = self.signing_key.sign(&bytes);
        Ok(SignedResumeMessage {
            message,
            signature: hex::encode(signature.to_bytes()),
        })
    }
}

/// Verifies incoming resume messages at the boundary
pub struct MessageVerifier {
    verifying_key: VerifyingKey,
}

impl MessageVerifier {
    /// Build a verifier from the signer's public key
    pub fn new(verifying_key: VerifyingKey) -> Self {
        Self { verifying_key }
    }

    /// Verify a signed message, returning the body on success
    pub fn verify(&self, signed: &SignedResumeMessage) -> EngineResult<ResumeMessage> {
        let bytes = canonical_bytes(&signed.message)?;
        let raw = hex::decode(&signed.signature)
            .map_err(|_| EngineError::SignatureInvalid("signature is not hex".into()))?;
        let raw: [u8; 64] = raw
            .try_into()
            .map_err(|_| EngineError::SignatureInvalid("signature has wrong length".into()))?;
        let signature = Signature::from_bytes(&raw);
        self.verifying_key
            .verify(&bytes, &signature)
            .map_err(|_| EngineError::SignatureInvalid("signature check failed".into()))?;
        Ok(signed.message.clone())
    }
}

/// Capability that publishes resume messages
#[async_trait]
pub trait ResumeQueue: Send + Sync {
    /// Publish a signed message with a delivery delay
    async fn publish(&self, message: &SignedResumeMessage, delay: Duration) -> EngineResult<()>;
}

/// In-process queue capturing messages for tests and local runs
#[derive(Default)]
pub struct InProcessQueue {
    published: Mutex<Vec<(SignedResumeMessage, Duration)>>,
    /// When set, publishing fails; exercises the fallback path
    pub fail_publishes: Mutex<bool>,
}

impl InProcessQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages published so far
    pub fn drain(&self) -> Vec<(SignedResumeMessage, Duration)> {
        std::mem::take(&mut *self.published.lock())
    }

    /// Number of messages currently captured
    pub fn len(&self) -> usize {
        self.published.lock().len()
    }

    /// Whether no messages are captured
    pub fn is_empty(&self) -> bool {
        self.published.lock().is_empty()
    }
}

#[async_trait]
impl ResumeQueue for InProcessQueue {
    async fn publish(&self, message: &SignedResumeMessage, delay: Duration) -> EngineResult<()> {
        if *self.fail_publishes.lock() {
            return Err(EngineError::QueueUnavailable("test-induced failure".into()));
        }
        self.published.lock().push((message.clone(), delay));
        Ok(())
    }
}

/// HTTP publisher for a durable queue service
#[cfg(feature = "http")]
pub struct HttpQueue {
    client: reqwest::Client,
    endpoint: String,
}

#[cfg(feature = "http")]
impl HttpQueue {
    /// Create a publisher for the given queue endpoint
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl ResumeQueue for HttpQueue {
    async fn publish(&self, message: &SignedResumeMessage, delay: Duration) -> EngineResult<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-orka-signature", &message.signature)
            .header("x-orka-delay-ms", delay.as_millis().to_string())
            .json(&message.message)
            .send()
            .await
            .map_err(|e| EngineError::QueueUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EngineError::QueueUnavailable(format!(
                "queue returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> ResumeMessage {
        ResumeMessage {
            execution_id: ExecutionId::new(),
            segment_number: 2,
            start_step_index: Some(4),
            trace_id: "trace-1".into(),
        }
    }

    #[test]
    fn sign_verify_roundtrip() {
        let signer = MessageSigner::from_seed([7u8; 32]);
        let verifier = MessageVerifier::new(signer.verifying_key());

        let signed = signer.sign(message()).unwrap();
        let verified = verifier.verify(&signed).unwrap();
        assert_eq!(verified, signed.message);
    }

    #[test]
    fn tampered_message_is_rejected() {
        let signer = MessageSigner::from_seed([7u8; 32]);
        let verifier = MessageVerifier::new(signer.verifying_key());

        let mut signed = signer.sign(message()).unwrap();
        signed.message.segment_number = 99;
        let err = verifier.verify(&signed).unwrap_err();
        assert!(matches!(err, EngineError::SignatureInvalid(_)));
    }

    #[test]
    fn wrong_key_is_rejected() {
        let signer = MessageSigner::from_seed([7u8; 32]);
        let other = MessageSigner::from_seed([8u8; 32]);
        let verifier = MessageVerifier::new(other.verifying_key());

        let signed = signer.sign(message()).unwrap();
        assert!(verifier.verify(&signed).is_err());
    }

    #[tokio::test]
    async fn in_process_queue_captures() {
        let queue = InProcessQueue::new();
        let signer = MessageSigner::from_seed([1u8; 32]);
        let signed = signer.sign(message()).unwrap();

        queue.publish(&signed, Duration::from_secs(2)).await.unwrap();
        let drained = queue.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].1, Duration::from_secs(2));
    }
}
