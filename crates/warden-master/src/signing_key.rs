//! The one-shot module-signing-key download gate.
//!
//! The master holds the module signing private key in memory for exactly as long as it
//! takes one admin to fetch it; the first successful read clears the in-memory copy so
//! the key can never be served twice over the wire.

use std::sync::Mutex;

/// Guards a PEM-encoded private key so it can be retrieved over HTTP exactly once.
pub struct SigningKeyGate {
    pem: Mutex<Option<String>>,
}

impl SigningKeyGate {
    /// Load the gate with `pem`, ready to be taken once. Pass `None` for a gate that
    /// starts already spent — the case on every boot after the first, once the signing
    /// key has already been persisted and (presumably) already downloaded.
    #[must_use]
    pub fn new(pem: Option<String>) -> Self {
        Self {
            pem: Mutex::new(pem),
        }
    }

    /// Take the key, if it hasn't already been taken. Every call after the first
    /// returns `None`.
    pub fn take(&self) -> Option<String> {
        self.pem.lock().expect("signing key gate mutex poisoned").take()
    }

    /// Whether the key has already been taken (or the gate started empty).
    #[must_use]
    pub fn is_spent(&self) -> bool {
        self.pem.lock().expect("signing key gate mutex poisoned").is_none()
    }
}
