//! Groth16 proof of `Poseidon(inputHash, outputHash, workerSecret) = commitment`
//! over BN254, with a fast native-binary backend and a portable arkworks
//! fallback.

use anyhow::Context;
use ark_bn254::{Bn254, Fr};
use ark_crypto_primitives::sponge::constraints::CryptographicSpongeVar;
use ark_crypto_primitives::sponge::poseidon::constraints::PoseidonSpongeVar;
use ark_crypto_primitives::sponge::poseidon::{find_poseidon_ark_and_mds, PoseidonConfig};
use ark_ec::pairing::Pairing;
use ark_ff::{BigInteger, PrimeField};
use ark_groth16::{prepare_verifying_key, Groth16, PreparedVerifyingKey, Proof, ProvingKey};
use ark_r1cs_std::alloc::AllocVar;
use ark_r1cs_std::eq::EqGadget;
use ark_r1cs_std::fields::fp::FpVar;
use ark_relations::r1cs::{ConstraintSynthesizer, ConstraintSystemRef, SynthesisError};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use ark_std::rand::rngs::StdRng;
use ark_std::rand::SeedableRng;
use mesh_core::{FieldElement256, MeshError, ZkProof};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

/// Selects which backend `ZkProver::prove` tries first. The portable backend
/// is always the fallback, never the primary, regardless of this setting,
/// once the native attempt has failed.
#[derive(Debug, Clone)]
pub enum ProverBackend {
    /// Shells out to an external prover binary taking
    /// `(zkey_path, witness_path, proof_out_path, public_out_path)`.
    Native { binary: PathBuf, zkey: PathBuf },
    Portable,
}

/// `find_poseidon_ark_and_mds` derives the round constants and MDS matrix
/// from scratch; every `ZkProver`/`ZkVerifier` in a process shares one copy
/// instead of redoing that work per instance.
static POSEIDON_CONFIG: once_cell::sync::Lazy<PoseidonConfig<Fr>> = once_cell::sync::Lazy::new(|| {
    let full_rounds = 8;
    let partial_rounds = 57;
    let alpha = 5;
    let rate = 3;
    let capacity = 1;
    let (ark, mds) = find_poseidon_ark_and_mds::<Fr>(254, rate, full_rounds, partial_rounds, 0);
    PoseidonConfig::new(
        full_rounds as usize,
        partial_rounds as usize,
        alpha,
        mds,
        ark,
        rate,
        capacity,
    )
});

fn poseidon_config() -> PoseidonConfig<Fr> {
    POSEIDON_CONFIG.clone()
}

fn field_element_to_fr(fe: &FieldElement256) -> Fr {
    Fr::from_be_bytes_mod_order(fe)
}

fn fr_to_field_element(fr: &Fr) -> FieldElement256 {
    let bytes = fr.into_bigint().to_bytes_be();
    let mut out = [0u8; 32];
    let offset = 32usize.saturating_sub(bytes.len());
    out[offset..].copy_from_slice(&bytes);
    out
}

/// `commitment = Poseidon(inputHash, outputHash, workerSecret)`. The three
/// hash inputs are private witnesses; `commitment` is the sole public input.
#[derive(Clone)]
struct CommitmentCircuit {
    config: PoseidonConfig<Fr>,
    input_hash: Fr,
    output_hash: Fr,
    worker_secret: Fr,
    commitment: Fr,
}

impl ConstraintSynthesizer<Fr> for CommitmentCircuit {
    fn generate_constraints(self, cs: ConstraintSystemRef<Fr>) -> Result<(), SynthesisError> {
        let input_hash_var = FpVar::new_witness(cs.clone(), || Ok(self.input_hash))?;
        let output_hash_var = FpVar::new_witness(cs.clone(), || Ok(self.output_hash))?;
        let worker_secret_var = FpVar::new_witness(cs.clone(), || Ok(self.worker_secret))?;
        let commitment_var = FpVar::new_input(cs.clone(), || Ok(self.commitment))?;

        let mut sponge = PoseidonSpongeVar::new(cs, &self.config);
        sponge.absorb(&input_hash_var)?;
        sponge.absorb(&output_hash_var)?;
        sponge.absorb(&worker_secret_var)?;
        let squeezed = sponge.squeeze_field_elements(1)?;
        squeezed[0].enforce_equal(&commitment_var)?;
        Ok(())
    }
}

fn commitment(config: &PoseidonConfig<Fr>, input: Fr, output: Fr, secret: Fr) -> Fr {
    use ark_crypto_primitives::sponge::poseidon::PoseidonSponge;
    use ark_crypto_primitives::sponge::CryptographicSponge;

    let mut sponge = PoseidonSponge::new(config);
    sponge.absorb(&input);
    sponge.absorb(&output);
    sponge.absorb(&secret);
    sponge.squeeze_field_elements(1).remove(0)
}

/// Produces a Groth16 proof of commitment knowledge. Holds the (fixed,
/// immutable) proving parameters and the configured backend preference.
pub struct ZkProver {
    config: PoseidonConfig<Fr>,
    pk: ProvingKey<Bn254>,
    backend: ProverBackend,
}

impl ZkProver {
    /// Runs trusted setup for the commitment circuit with placeholder
    /// witness values; Groth16 parameter generation only needs the
    /// constraint shape, not a satisfying assignment.
    pub fn new(backend: ProverBackend) -> anyhow::Result<Self> {
        let config = poseidon_config();
        let circuit = CommitmentCircuit {
            config: config.clone(),
            input_hash: Fr::from(0u64),
            output_hash: Fr::from(0u64),
            worker_secret: Fr::from(0u64),
            commitment: Fr::from(0u64),
        };
        let mut rng = StdRng::seed_from_u64(0xC0FFEE);
        let pk = Groth16::<Bn254>::generate_random_parameters_with_reduction(circuit, &mut rng)
            .context("groth16 setup")?;
        Ok(Self { config, pk, backend })
    }

    pub fn verifying_key(&self) -> PreparedVerifyingKey<Bn254> {
        prepare_verifying_key(&self.pk.vk)
    }

    pub async fn prove(
        &self,
        input_hash: &FieldElement256,
        output_hash: &FieldElement256,
        worker_secret: &FieldElement256,
    ) -> Result<ZkProof, MeshError> {
        let input = field_element_to_fr(input_hash);
        let output = field_element_to_fr(output_hash);
        let secret = field_element_to_fr(worker_secret);
        let commitment = commitment(&self.config, input, output, secret);

        if let ProverBackend::Native { binary, zkey } = &self.backend {
            match self.prove_native(binary, zkey, input, output, secret, commitment).await {
                Ok(proof) => return Ok(proof),
                Err(e) => warn!(error = %e, "native prover failed, falling back to portable backend"),
            }
        }

        self.prove_portable(input, output, secret, commitment)
    }

    async fn prove_native(
        &self,
        binary: &PathBuf,
        zkey: &PathBuf,
        input: Fr,
        output: Fr,
        secret: Fr,
        commitment: Fr,
    ) -> anyhow::Result<ZkProof> {
        let dir = tempfile::TempDir::new().context("create scoped prover dir")?;
        let witness_path = dir.path().join("witness.json");
        let proof_out = dir.path().join("proof.json");
        let public_out = dir.path().join("public.json");

        let witness = serde_json::json!({
            "inputHash": fr_to_field_element(&input).to_vec(),
            "outputHash": fr_to_field_element(&output).to_vec(),
            "workerSecret": fr_to_field_element(&secret).to_vec(),
            "commitment": fr_to_field_element(&commitment).to_vec(),
        });
        std::fs::write(&witness_path, witness.to_string()).context("write witness file")?;

        let mut child = tokio::process::Command::new(binary)
            .arg(zkey)
            .arg(&witness_path)
            .arg(&proof_out)
            .arg(&public_out)
            .current_dir(dir.path())
            .kill_on_drop(true)
            .spawn()
            .context("spawn native prover")?;

        let status = tokio::time::timeout(Duration::from_secs(30), child.wait())
            .await
            .context("native prover timed out")?
            .context("wait on native prover")?;

        if !status.success() {
            anyhow::bail!("native prover exited with {status}");
        }

        let proof_bytes = std::fs::read(&proof_out).context("read proof output")?;
        let public_bytes = std::fs::read(&public_out).context("read public output")?;
        debug!(bytes = proof_bytes.len(), "native prover wrote proof");
        parse_native_output(&proof_bytes, &public_bytes)
        // `dir` drops here regardless of outcome, deleting the scoped directory.
    }

    fn prove_portable(
        &self,
        input: Fr,
        output: Fr,
        secret: Fr,
        commitment: Fr,
    ) -> Result<ZkProof, MeshError> {
        let circuit = CommitmentCircuit {
            config: self.config.clone(),
            input_hash: input,
            output_hash: output,
            worker_secret: secret,
            commitment,
        };
        let mut rng = ark_std::rand::thread_rng();
        let proof = Groth16::<Bn254>::create_random_proof_with_reduction(circuit, &self.pk, &mut rng)
            .map_err(|e| MeshError::ProofGenerationError(e.to_string()))?;
        encode_proof(&proof, commitment).map_err(|e| MeshError::ProofGenerationError(e.to_string()))
    }
}

fn encode_proof(proof: &Proof<Bn254>, commitment: Fr) -> anyhow::Result<ZkProof> {
    let mut a = Vec::new();
    let mut b = Vec::new();
    let mut c = Vec::new();
    proof.a.serialize_compressed(&mut a)?;
    proof.b.serialize_compressed(&mut b)?;
    proof.c.serialize_compressed(&mut c)?;
    Ok(ZkProof {
        a,
        b,
        c,
        public_signals: vec![fr_to_field_element(&commitment)],
    })
}

fn parse_native_output(proof_bytes: &[u8], public_bytes: &[u8]) -> anyhow::Result<ZkProof> {
    #[derive(serde::Deserialize)]
    struct NativeProof {
        a: Vec<u8>,
        b: Vec<u8>,
        c: Vec<u8>,
    }
    let parsed: NativeProof =
        serde_json::from_slice(proof_bytes).context("malformed native proof output")?;
    let public: Vec<Vec<u8>> =
        serde_json::from_slice(public_bytes).context("malformed native public signals")?;
    let public_signals = public
        .into_iter()
        .map(|bytes| {
            let mut out = [0u8; 32];
            let offset = 32usize.saturating_sub(bytes.len());
            out[offset..].copy_from_slice(&bytes[..bytes.len().min(32)]);
            out
        })
        .collect();
    Ok(ZkProof {
        a: parsed.a,
        b: parsed.b,
        c: parsed.c,
        public_signals,
    })
}

/// Verifies proofs against a fixed Groth16 verification key.
pub struct ZkVerifier {
    pvk: PreparedVerifyingKey<Bn254>,
}

impl ZkVerifier {
    pub fn new(pvk: PreparedVerifyingKey<Bn254>) -> Self {
        Self { pvk }
    }

    pub fn from_prover(prover: &ZkProver) -> Self {
        Self::new(prover.verifying_key())
    }

    pub fn verify(&self, proof: &ZkProof) -> Result<bool, MeshError> {
        let a = <Bn254 as Pairing>::G1Affine::deserialize_compressed(&proof.a[..])
            .map_err(|e| MeshError::VerificationError(e.to_string()))?;
        let b = <Bn254 as Pairing>::G2Affine::deserialize_compressed(&proof.b[..])
            .map_err(|e| MeshError::VerificationError(e.to_string()))?;
        let c = <Bn254 as Pairing>::G1Affine::deserialize_compressed(&proof.c[..])
            .map_err(|e| MeshError::VerificationError(e.to_string()))?;
        let ark_proof = Proof { a, b, c };

        let public_inputs: Vec<Fr> = proof
            .public_signals
            .iter()
            .map(field_element_to_fr)
            .collect();

        Groth16::<Bn254>::verify_proof(&self.pvk, &ark_proof, &public_inputs)
            .map_err(|e| MeshError::VerificationError(e.to_string()))
    }

    /// `proof.public_signals[0]`, the single public commitment signal.
    pub fn get_commitment(proof: &ZkProof) -> Option<&FieldElement256> {
        proof.commitment()
    }
}

impl mesh_core::ZkVerify for ZkVerifier {
    fn verify(&self, proof: &ZkProof) -> Result<bool, MeshError> {
        ZkVerifier::verify(self, proof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::hash_activations;

    fn secret() -> FieldElement256 {
        let mut s = [0u8; 32];
        s[31] = 7;
        s
    }

    #[tokio::test]
    async fn portable_proof_round_trips() {
        let prover = ZkProver::new(ProverBackend::Portable).unwrap();
        let verifier = ZkVerifier::from_prover(&prover);

        let input_hash = hash_activations(&vec![1.0, 2.0, 3.0]);
        let output_hash = hash_activations(&vec![4.0, 5.0]);
        let proof = prover.prove(&input_hash, &output_hash, &secret()).await.unwrap();

        assert!(verifier.verify(&proof).unwrap());
    }

    #[tokio::test]
    async fn tampered_public_signal_fails_verification() {
        let prover = ZkProver::new(ProverBackend::Portable).unwrap();
        let verifier = ZkVerifier::from_prover(&prover);

        let input_hash = hash_activations(&vec![1.0, 2.0, 3.0]);
        let output_hash = hash_activations(&vec![4.0, 5.0]);
        let mut proof = prover.prove(&input_hash, &output_hash, &secret()).await.unwrap();
        proof.public_signals[0][31] ^= 0xFF;

        assert!(!verifier.verify(&proof).unwrap());
    }

    #[tokio::test]
    async fn missing_native_binary_falls_back_to_portable() {
        let prover = ZkProver::new(ProverBackend::Native {
            binary: PathBuf::from("/nonexistent/mesh-prover-bin"),
            zkey: PathBuf::from("/nonexistent/circuit.zkey"),
        })
        .unwrap();
        let verifier = ZkVerifier::from_prover(&prover);

        let input_hash = hash_activations(&vec![9.0]);
        let output_hash = hash_activations(&vec![10.0]);
        let proof = prover.prove(&input_hash, &output_hash, &secret()).await.unwrap();
        assert!(verifier.verify(&proof).unwrap());
    }

    #[test]
    fn commitment_is_deterministic() {
        let config = poseidon_config();
        let a = commitment(&config, Fr::from(1u64), Fr::from(2u64), Fr::from(3u64));
        let b = commitment(&config, Fr::from(1u64), Fr::from(2u64), Fr::from(3u64));
        assert_eq!(a, b);
    }
}
