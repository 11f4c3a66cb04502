//! Puzzle construction and validation.
//!
//! A puzzle is a random 32-byte seed plus a per-client condition. A nonce
//! solves it when the lowercase hex digest of `seed ++ ":" ++ nonce` starts
//! with `difficulty` ASCII `'0'` bytes and carries the condition byte at the
//! condition index. The condition is derived from the client's IP, so a
//! solution found for one client is useless to another.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use rand::RngCore;
use ripemd::Ripemd320;
use sha2::{Digest, Sha256, Sha512};

use crate::error::Error;

pub const SEED_LEN: usize = 32;
pub const DEFAULT_DIFFICULTY: usize = 4;
pub const MAX_DIFFICULTY: usize = 8;

/// First digest position a condition may point at; keeps it clear of the zero prefix.
pub const CONDITION_OFFSET: usize = MAX_DIFFICULTY;
pub const CONDITION_RANGE: usize = 16;

/// 0x30 is the ascii code for '0'.
pub const ZERO_DIGIT: u8 = 0x30;

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

pub type Seed = [u8; SEED_LEN];

/// Hash function behind the digest. Client and server must agree on it.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowAlgorithm {
    #[default]
    Sha2_256,
    Sha2_512,
    RIPEMD_320,
    Blake3,
}

impl PowAlgorithm {
    fn calculate_with<D: Digest>(seed: &[u8], nonce: u64) -> Vec<u8> {
        let mut hasher = D::new();
        hasher.update(seed);
        hasher.update(b":");
        hasher.update(nonce.to_string().as_bytes());
        hasher.finalize().to_vec()
    }

    /// Calculates SHA-256 over `seed ++ ":" ++ nonce`.
    pub fn calculate_sha2_256(seed: &[u8], nonce: u64) -> Vec<u8> {
        Self::calculate_with::<Sha256>(seed, nonce)
    }

    /// Calculates SHA-512 over `seed ++ ":" ++ nonce`.
    pub fn calculate_sha2_512(seed: &[u8], nonce: u64) -> Vec<u8> {
        Self::calculate_with::<Sha512>(seed, nonce)
    }

    /// Calculates RIPEMD-320 over `seed ++ ":" ++ nonce`.
    pub fn calculate_ripemd_320(seed: &[u8], nonce: u64) -> Vec<u8> {
        Self::calculate_with::<Ripemd320>(seed, nonce)
    }

    /// Calculates BLAKE3 over `seed ++ ":" ++ nonce`.
    pub fn calculate_blake3(seed: &[u8], nonce: u64) -> Vec<u8> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(seed);
        hasher.update(b":");
        hasher.update(nonce.to_string().as_bytes());
        hasher.finalize().as_bytes().to_vec()
    }

    /// Raw digest bytes for the selected algorithm.
    pub fn calculate(&self, seed: &[u8], nonce: u64) -> Vec<u8> {
        match self {
            Self::Sha2_256 => Self::calculate_sha2_256(seed, nonce),
            Self::Sha2_512 => Self::calculate_sha2_512(seed, nonce),
            Self::RIPEMD_320 => Self::calculate_ripemd_320(seed, nonce),
            Self::Blake3 => Self::calculate_blake3(seed, nonce),
        }
    }

    /// Lowercase hex digest, the form every puzzle predicate is checked against.
    pub fn digest(&self, seed: &[u8], nonce: u64) -> Vec<u8> {
        hex::encode(self.calculate(seed, nonce)).into_bytes()
    }

    /// Length of [`PowAlgorithm::digest`] output in bytes.
    pub const fn digest_len(&self) -> usize {
        match self {
            Self::Sha2_256 | Self::Blake3 => 64,
            Self::Sha2_512 => 128,
            Self::RIPEMD_320 => 80,
        }
    }
}

impl FromStr for PowAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" | "sha2-256" => Ok(Self::Sha2_256),
            "sha512" | "sha2-512" => Ok(Self::Sha2_512),
            "ripemd320" | "ripemd-320" => Ok(Self::RIPEMD_320),
            "blake3" => Ok(Self::Blake3),
            other => Err(Error::InvalidConfig(format!("unknown algorithm {other:?}"))),
        }
    }
}

/// Per-client predicate: `digest[index] == byte`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Condition {
    pub index: usize,
    pub byte: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Puzzle {
    pub seed: Seed,
    pub difficulty: usize,
    pub condition: Condition,
}

impl Puzzle {
    pub fn new(seed: Seed, difficulty: usize, condition: Condition) -> Self {
        Self {
            seed,
            difficulty,
            condition,
        }
    }

    /// Recompute the digest for `nonce` and check it. The caller's digest is never trusted.
    pub fn accepts(&self, pow: &dyn PowHandler, nonce: u64) -> bool {
        let digest = pow.digest(&self.seed, nonce);
        pow.validate(&digest, self.condition, self.difficulty)
    }
}

/// Merge `prev` and `randomness` and hash them into a seed.
pub fn build_seed(randomness: &[u8], prev: &[u8]) -> Seed {
    let mut hasher = Sha256::new();
    hasher.update(prev);
    hasher.update(randomness);
    hasher.finalize().into()
}

/// Fresh seed from the thread-local CSPRNG.
pub fn random_seed() -> Seed {
    let mut randomness = [0u8; SEED_LEN];
    rand::thread_rng().fill_bytes(&mut randomness);
    build_seed(&randomness, &[])
}

/// Derive the condition bound to a client address.
///
/// IPv4-mapped IPv6 addresses are folded to IPv4 first so both socket
/// families agree on the identity of one host.
pub fn derive_condition(client: IpAddr) -> Condition {
    let octets = match client.to_canonical() {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    };
    let first = octets.first().copied().unwrap_or_default() as usize;
    let last = octets.last().copied().unwrap_or_default() as usize;
    Condition {
        index: CONDITION_OFFSET + first % CONDITION_RANGE,
        byte: HEX_DIGITS[last % HEX_DIGITS.len()],
    }
}

/// Check both predicates on an already computed digest.
pub fn validate(digest: &[u8], condition: Condition, difficulty: usize) -> bool {
    if digest.len() < difficulty || digest.len() <= condition.index {
        return false;
    }
    digest[..difficulty].iter().all(|b| *b == ZERO_DIGIT) && digest[condition.index] == condition.byte
}

/// Puzzle operations injected into servers and solvers.
pub trait PowHandler: Send + Sync + fmt::Debug {
    fn build_seed(&self) -> Seed;
    fn derive_condition(&self, client: IpAddr) -> Condition;
    fn digest(&self, seed: &[u8], nonce: u64) -> Vec<u8>;
    fn validate(&self, digest: &[u8], condition: Condition, difficulty: usize) -> bool;
}

/// [`PowHandler`] backed by a real hash function.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashPow {
    algorithm: PowAlgorithm,
}

impl HashPow {
    pub const fn new(algorithm: PowAlgorithm) -> Self {
        Self { algorithm }
    }

    pub const fn algorithm(&self) -> PowAlgorithm {
        self.algorithm
    }
}

impl PowHandler for HashPow {
    fn build_seed(&self) -> Seed {
        random_seed()
    }

    fn derive_condition(&self, client: IpAddr) -> Condition {
        derive_condition(client)
    }

    fn digest(&self, seed: &[u8], nonce: u64) -> Vec<u8> {
        self.algorithm.digest(seed, nonce)
    }

    fn validate(&self, digest: &[u8], condition: Condition, difficulty: usize) -> bool {
        validate(digest, condition, difficulty)
    }
}
