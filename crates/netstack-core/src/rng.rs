//! Thread-safe random number sources.
//!
//! The stack carries two generators: a cryptographically secure source used
//! for seeds and secrets, and a fast insecure PRNG for everything that must
//! not be predictable but is not security sensitive (port selection hashes,
//! jitter). The insecure generator wraps a non-thread-safe engine in a mutex
//! so it can be shared freely.

use std::sync::Mutex;

use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};

/// A cryptographically secure random source.
///
/// Defaults to the operating system generator; an alternative source can be
/// injected for deterministic tests.
pub struct SecureRng {
    inner: Mutex<Box<dyn RngCore + Send>>,
}

impl SecureRng {
    /// The process-wide default source.
    pub fn system() -> Self {
        Self {
            inner: Mutex::new(Box::new(OsRng)),
        }
    }

    /// Wrap a caller-provided source.
    pub fn from_source(source: Box<dyn RngCore + Send>) -> Self {
        Self {
            inner: Mutex::new(source),
        }
    }

    pub fn next_u32(&self) -> u32 {
        self.inner.lock().unwrap().next_u32()
    }

    pub fn next_u64(&self) -> u64 {
        self.inner.lock().unwrap().next_u64()
    }

    pub fn fill_bytes(&self, dest: &mut [u8]) {
        self.inner.lock().unwrap().fill_bytes(dest);
    }
}

/// A mutex-wrapped PRNG safe for concurrent use.
///
/// Not suitable for security-sensitive work.
pub struct InsecureRng {
    inner: Mutex<StdRng>,
}

impl InsecureRng {
    /// Seed from a secure source.
    pub fn from_secure(secure: &SecureRng) -> Self {
        let mut seed = <StdRng as SeedableRng>::Seed::default();
        secure.fill_bytes(&mut seed);
        Self {
            inner: Mutex::new(StdRng::from_seed(seed)),
        }
    }

    /// Seed deterministically (tests).
    pub fn from_seed_u64(seed: u64) -> Self {
        Self {
            inner: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn next_u32(&self) -> u32 {
        self.inner.lock().unwrap().next_u32()
    }

    pub fn next_u64(&self) -> u64 {
        self.inner.lock().unwrap().next_u64()
    }

    pub fn fill_bytes(&self, dest: &mut [u8]) {
        self.inner.lock().unwrap().fill_bytes(dest);
    }
}
