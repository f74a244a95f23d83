//! Proof-of-work target derivation and nonce search (spec.md §4.5).
//!
//! The target scales inversely with the number of trial hashes an average
//! verifier is expected to be willing to spend, and is computed with
//! [`num_bigint`] because the numerator `2**64` and the TTL-weighted
//! denominator both comfortably exceed `u64`.

use crate::crypto::double_sha512;
use crate::error::{Error, Result};
use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Semaphore};

/// Default trial count per extra byte of payload, absent an explicit
/// `nonceTrialsPerByte` from the destination's pubkey.
pub const DEFAULT_NONCE_TRIALS_PER_BYTE: u64 = 1000;
/// Default flat per-object overhead, absent an explicit `extraBytes`.
pub const DEFAULT_EXTRA_BYTES: u64 = 1000;

const TWO_POW_64: u128 = 1 << 64;
const TTL_DENOMINATOR: u64 = 1 << 16;

/// Compute the PoW target for an object whose payload (excluding the 8-byte
/// nonce) is `payload_length` bytes, living for `ttl_seconds` before
/// expiring.
///
/// `target = 2**64 / ((length + extraBytes + 8) *
/// max(nonceTrialsPerByte, TTL * (length + extraBytes + 8) / 2**16))`
pub fn target_for(
    payload_length: u64,
    ttl_seconds: i64,
    nonce_trials_per_byte: u64,
    extra_bytes: u64,
) -> BigUint {
    let length_component = BigUint::from(payload_length) + BigUint::from(extra_bytes) + BigUint::from(8u64);
    let ttl = BigUint::from(ttl_seconds.max(0) as u64);
    let ttl_term = (&ttl * &length_component) / BigUint::from(TTL_DENOMINATOR);
    let trials = BigUint::from(nonce_trials_per_byte.max(1));
    let effective_trials = trials.max(ttl_term);
    let denominator = &length_component * &effective_trials;

    if denominator.is_zero() {
        return BigUint::from(u64::MAX);
    }
    BigUint::from(TWO_POW_64) / denominator
}

/// `true` if `nonce` satisfies `target` against `initial_hash`: the first 8
/// bytes of `doubleSha512(nonce || initial_hash)`, read big-endian, must not
/// exceed `target`.
pub fn nonce_satisfies(initial_hash: &[u8; 64], nonce: u64, target: &BigUint) -> bool {
    let mut preimage = Vec::with_capacity(8 + 64);
    preimage.extend_from_slice(&nonce.to_be_bytes());
    preimage.extend_from_slice(initial_hash);
    let digest = double_sha512(&preimage);

    let mut trial_bytes = [0u8; 8];
    trial_bytes.copy_from_slice(&digest[0..8]);
    let trial_value = u64::from_be_bytes(trial_bytes);

    BigUint::from(trial_value) <= *target
}

/// Validate a completed object's nonce against the target implied by its
/// own length, TTL, and the PoW parameters a receiver is willing to accept.
pub fn validate(
    initial_hash: &[u8; 64],
    nonce: u64,
    payload_length: u64,
    ttl_seconds: i64,
    nonce_trials_per_byte: u64,
    extra_bytes: u64,
) -> Result<()> {
    let target = target_for(payload_length, ttl_seconds, nonce_trials_per_byte, extra_bytes);
    if nonce_satisfies(initial_hash, nonce, &target) {
        Ok(())
    } else {
        Err(Error::PowInvalid)
    }
}

/// A PoW search engine admitting one in-flight search at a time, mirroring
/// the reference client's behavior of never running two proof-of-work
/// searches concurrently on the same node.
pub struct PowEngine {
    admission: Arc<Semaphore>,
}

impl Default for PowEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PowEngine {
    pub fn new() -> Self {
        Self {
            admission: Arc::new(Semaphore::new(1)),
        }
    }

    /// Search for a nonce satisfying `target` against `initial_hash`,
    /// spreading the search across `worker_count` OS threads. Blocks (via
    /// the admission semaphore) until any prior search on this engine has
    /// finished. Returns [`Error::Cancelled`] if `cancel` fires first.
    pub async fn run(
        &self,
        initial_hash: [u8; 64],
        target: BigUint,
        worker_count: usize,
        mut cancel: oneshot::Receiver<()>,
    ) -> Result<u64> {
        let _permit = self
            .admission
            .acquire()
            .await
            .map_err(|_| Error::Cancelled)?;

        let worker_count = worker_count.clamp(1, 255);
        let found = Arc::new(AtomicBool::new(false));
        let (result_tx, result_rx) = std::sync::mpsc::channel::<u64>();

        let handles: Vec<_> = (0..worker_count)
            .map(|start| {
                let found = Arc::clone(&found);
                let result_tx = result_tx.clone();
                let target = target.clone();
                std::thread::spawn(move || {
                    search_worker(initial_hash, target, start as u64, worker_count as u64, found, result_tx);
                })
            })
            .collect();
        drop(result_tx);

        let nonce = tokio::select! {
            biased;
            _ = &mut cancel => {
                found.store(true, Ordering::SeqCst);
                None
            }
            recv = tokio::task::spawn_blocking(move || result_rx.recv().ok()) => {
                recv.map_err(|_| Error::Cancelled)?
            }
        };

        found.store(true, Ordering::SeqCst);
        for handle in handles {
            let _ = handle.join();
        }

        nonce.ok_or(Error::Cancelled)
    }
}

fn search_worker(
    initial_hash: [u8; 64],
    target: BigUint,
    start: u64,
    stride: u64,
    found: Arc<AtomicBool>,
    result_tx: std::sync::mpsc::Sender<u64>,
) {
    let mut nonce = start;
    loop {
        if found.load(Ordering::Relaxed) {
            return;
        }
        if nonce_satisfies(&initial_hash, nonce, &target) {
            found.store(true, Ordering::SeqCst);
            let _ = result_tx.send(nonce);
            return;
        }
        nonce = nonce.wrapping_add(stride);
        if nonce < stride {
            // wrapped past u64::MAX without success; extremely unlikely for
            // any realistic target, but avoid spinning forever.
            return;
        }
    }
}

/// Estimate the expected number of trial hashes for a target, mostly useful
/// for logging progress/ETA rather than any protocol decision.
pub fn expected_trials(target: &BigUint) -> u64 {
    if target.is_zero() {
        return u64::MAX;
    }
    (BigUint::from(TWO_POW_64) / target).to_u64().unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_shrinks_as_length_grows() {
        let small = target_for(100, 3600, DEFAULT_NONCE_TRIALS_PER_BYTE, DEFAULT_EXTRA_BYTES);
        let large = target_for(10_000, 3600, DEFAULT_NONCE_TRIALS_PER_BYTE, DEFAULT_EXTRA_BYTES);
        assert!(large < small);
    }

    #[test]
    fn target_shrinks_as_ttl_grows() {
        let short_ttl = target_for(1000, 3600, DEFAULT_NONCE_TRIALS_PER_BYTE, DEFAULT_EXTRA_BYTES);
        let long_ttl = target_for(1000, 3600 * 24 * 28, DEFAULT_NONCE_TRIALS_PER_BYTE, DEFAULT_EXTRA_BYTES);
        assert!(long_ttl < short_ttl);
    }

    #[test]
    fn nonce_zero_fails_a_strict_target() {
        let initial_hash = [7u8; 64];
        let strict_target = BigUint::from(1u64);
        assert!(!nonce_satisfies(&initial_hash, 0, &strict_target));
    }

    #[tokio::test]
    async fn engine_finds_a_satisfying_nonce_against_a_loose_target() {
        let initial_hash = [3u8; 64];
        // A target this loose is satisfied almost immediately.
        let loose_target = BigUint::from(TWO_POW_64) / BigUint::from(4u64);

        let engine = PowEngine::new();
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        let nonce = engine
            .run(initial_hash, loose_target.clone(), 2, cancel_rx)
            .await
            .unwrap();
        assert!(nonce_satisfies(&initial_hash, nonce, &loose_target));
    }

    #[tokio::test]
    async fn engine_search_is_cancellable() {
        let initial_hash = [5u8; 64];
        // An effectively impossible target that no realistic search finds.
        let impossible_target = BigUint::zero();

        let engine = PowEngine::new();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let run = engine.run(initial_hash, impossible_target, 2, cancel_rx);
        tokio::pin!(run);

        cancel_tx.send(()).unwrap();
        let result = run.await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn validate_rejects_nonce_against_a_strict_target() {
        let initial_hash = [1u8; 64];
        let err = validate(&initial_hash, 0, 1_000_000, 3600, 1000, 1000).unwrap_err();
        assert!(matches!(err, Error::PowInvalid));
    }
}
