// SPDX-License-Identifier: MIT OR Apache-2.0
//! One-shot, TTL-bounded pairing code issuance and redemption.
//!
//! Pairing requests are stored twice: once by id (the primary record) and once by
//! normalized token (a secondary index), so redemption by the token an operator reads
//! off a terminal doesn't require a table scan.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{Duration, Utc};
use rand::Rng;
use warden_core::{format_display_token, normalize_token, PairingRequest, PAIRING_ALPHABET};
use warden_error::{AsErrorCode, ErrorCode};
use warden_kv::{Bucket, Store};

/// Errors arising from pairing issuance or redemption.
#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    /// Underlying key-value store failure.
    #[error("store error: {0}")]
    Kv(#[from] warden_kv::KvError),

    /// No pairing request exists for the given token.
    #[error("unknown pairing token")]
    NotFound,

    /// The pairing has already been redeemed.
    #[error("pairing already used")]
    AlreadyUsed,

    /// The pairing's TTL has elapsed.
    #[error("pairing expired")]
    Expired,
}

impl AsErrorCode for PairingError {
    fn code(&self) -> ErrorCode {
        match self {
            PairingError::Kv(_) => ErrorCode::Fatal,
            PairingError::NotFound => ErrorCode::NotFound,
            PairingError::AlreadyUsed | PairingError::Expired => ErrorCode::InvalidToken,
        }
    }
}

/// Default pairing TTL: 15 minutes, matching the master's admin-minted pairing codes.
pub const DEFAULT_PAIRING_TTL: Duration = Duration::minutes(15);

/// Issues and redeems [`PairingRequest`]s against a persistent store.
pub struct PairingService {
    requests: Bucket<PairingRequest>,
    token_index: Bucket<String>,
}

impl PairingService {
    /// Open (or create) the pairing buckets within `store`.
    pub fn open(store: &Store) -> Result<Self, PairingError> {
        Ok(Self {
            requests: store.bucket("pairings")?,
            token_index: store.bucket("pairing_tokens")?,
        })
    }

    /// Mint a new pairing request, valid for `ttl` from now.
    pub fn create(&self, ttl: Duration) -> Result<PairingRequest, PairingError> {
        let id = uuid::Uuid::new_v4().to_string();
        let token = random_token();
        let now = Utc::now();

        let request = PairingRequest {
            id: id.clone(),
            token: token.clone(),
            display_token: format_display_token(&token),
            created_at: now,
            expires_at: now + ttl,
            used: false,
            used_at: None,
            assigned_agent: None,
            agent_hostname: None,
        };

        self.requests.put(&id, &request)?;
        self.token_index.put(&token, &id)?;
        Ok(request)
    }

    /// Look up a pairing request by its user-supplied token (dashes/case-insensitive).
    pub fn get_by_token(&self, raw_token: &str) -> Result<Option<PairingRequest>, PairingError> {
        let token = normalize_token(raw_token);
        let Some(id) = self.token_index.get(&token)? else {
            return Ok(None);
        };
        Ok(self.requests.get(&id)?)
    }

    /// Redeem a pairing token for `agent_id`, marking it used and recording the
    /// reported hostname.
    ///
    /// # Errors
    /// [`PairingError::NotFound`] if the token is unknown, [`PairingError::Expired`] or
    /// [`PairingError::AlreadyUsed`] if it can no longer be redeemed.
    pub fn redeem(
        &self,
        raw_token: &str,
        agent_id: &str,
        agent_hostname: Option<String>,
    ) -> Result<PairingRequest, PairingError> {
        let mut request = self.get_by_token(raw_token)?.ok_or(PairingError::NotFound)?;
        let now = Utc::now();

        if request.used {
            return Err(PairingError::AlreadyUsed);
        }
        if request.is_expired(now) {
            return Err(PairingError::Expired);
        }

        request.used = true;
        request.used_at = Some(now);
        request.assigned_agent = Some(agent_id.to_string());
        request.agent_hostname = agent_hostname;

        self.requests.put(&request.id, &request)?;
        Ok(request)
    }
}

fn random_token() -> String {
    let mut rng = rand::thread_rng();
    let alphabet: Vec<char> = PAIRING_ALPHABET.chars().collect();
    (0..8)
        .map(|_| alphabet[rng.gen_range(0..alphabet.len())])
        .collect()
}
