use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// A dense ordered sequence of 32-bit floats. Activations, embeddings, and
/// mask vectors are all represented this way; element-wise operations
/// require equal length.
pub type Vector = Vec<f32>;

/// A 32-byte big-endian unsigned integer, guaranteed < 2^253 so it is always
/// a valid BN254 scalar field element.
pub type FieldElement256 = [u8; 32];

pub type WorkerId = String;
pub type AccountId = String;

/// Token amount. Reward/fee-split arithmetic in this system is fractional
/// (halving reward to `1e-8`, 85/9/6% fee splits), so amounts are tracked as
/// `f64` rather than a fixed-point integer scale.
pub type Amount = f64;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("vector length mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("no experts registered in the index")]
    NoExperts,
    #[error("routing produced no chunks")]
    NoRoutings,
    #[error("insufficient funds: balance {balance} < amount {amount}")]
    InsufficientFunds { balance: Amount, amount: Amount },
    #[error("hmac verification failed")]
    HmacError,
    #[error("worker compute failed: {0}")]
    ComputeError(String),
    #[error("operation timed out after {0}ms")]
    Timeout(u64),
    #[error("connection refused for worker {0}")]
    ConnectRefused(String),
    #[error("worker {0} unreachable")]
    WorkerUnreachable(String),
    #[error("zk proof generation failed: {0}")]
    ProofGenerationError(String),
    #[error("zk proof verification failed for worker {0}")]
    VerificationError(String),
    #[error("ledger invariant violated for account {account}: balance {balance} != credits {credits} - debits {debits}")]
    LedgerCorruption {
        account: AccountId,
        balance: Amount,
        credits: Amount,
        debits: Amount,
    },
}

/// `index` preserves the order needed to reassemble a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub index: u32,
    pub text: String,
    pub embedding: Vector,
}

/// A private scalar known only to the worker it belongs to; it never
/// crosses the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WorkerSecret(pub FieldElement256);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub worker_id: WorkerId,
    pub embedding: Vector,
    pub secret: WorkerSecret,
    pub endpoint: String,
    pub status: WorkerStatus,
}

/// `(chunk, worker_id, distance)` — transient, discarded after a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Routing {
    pub chunk: Chunk,
    pub worker_id: WorkerId,
    pub distance: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInferenceOutput {
    pub text: String,
    pub input_tokens: Vector,
    pub output_tokens: Vector,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInferenceResult {
    pub worker_id: WorkerId,
    pub chunk_index: u32,
    pub chunk_text: String,
    pub output_text: String,
    pub input_tokens: Vector,
    pub output_tokens: Vector,
    pub zk_proof: ZkProof,
    pub latency_ms: u64,
}

/// Groth16 proof over BN254. `a`/`b`/`c` are opaque compressed curve point
/// encodings; the single public signal is
/// `Poseidon(inputHash, outputHash, workerSecret)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZkProof {
    pub a: Vec<u8>,
    pub b: Vec<u8>,
    pub c: Vec<u8>,
    pub public_signals: Vec<FieldElement256>,
}

impl ZkProof {
    pub fn commitment(&self) -> Option<&FieldElement256> {
        self.public_signals.first()
    }
}

/// Verifies a `ZkProof` against a fixed verification key. A seam so the
/// Orchestrator can depend on verification without depending on a concrete
/// proving backend.
pub trait ZkVerify: Send + Sync {
    fn verify(&self, proof: &ZkProof) -> Result<bool, MeshError>;
}

/// SHA-256 over the little-endian IEEE-754 byte layout of `v`, with the
/// high 3 bits of the first output byte cleared so the big-endian
/// interpretation is always < the BN254 scalar field prime.
pub fn hash_activations(v: &Vector) -> FieldElement256 {
    let mut hasher = Sha256::new();
    for f in v {
        hasher.update(f.to_le_bytes());
    }
    let mut out: FieldElement256 = hasher.finalize().into();
    out[0] &= 0b0001_1111;
    out
}

/// Produces a `Vector` embedding for a piece of text. Backed by an external
/// embedding model in deployment; the core only consumes the contract.
#[async_trait]
pub trait EmbedFn: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vector>;
}

/// Runs inference for one chunk on one worker. `input_tokens`/`output_tokens`
/// must be deterministic functions of `chunk`/`text` respectively so ZK
/// commitments reproduce.
#[async_trait]
pub trait NodeInferenceFn: Send + Sync {
    async fn infer(&self, worker_id: &str, chunk_text: &str) -> anyhow::Result<NodeInferenceOutput>;
}

pub fn now_ts() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_below_253_bits() {
        let v: Vector = vec![1.0, 2.5, -3.25, 0.0];
        let h = hash_activations(&v);
        assert_eq!(h[0] & 0b1110_0000, 0);
    }

    #[test]
    fn hash_is_deterministic() {
        let v1: Vector = vec![1.0, 2.0, 3.0];
        let v2: Vector = vec![1.0, 2.0, 3.0];
        assert_eq!(hash_activations(&v1), hash_activations(&v2));
    }

    #[test]
    fn hash_differs_on_changed_input() {
        let v1: Vector = vec![1.0, 2.0, 3.0];
        let v2: Vector = vec![1.0, 2.0, 3.0001];
        assert_ne!(hash_activations(&v1), hash_activations(&v2));
    }

    #[test]
    fn hash_defined_for_empty_vector() {
        let v: Vector = vec![];
        let h = hash_activations(&v);
        assert_eq!(h.len(), 32);
    }
}
