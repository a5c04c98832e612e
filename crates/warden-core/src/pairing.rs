//! Pairing request entities: one-shot, TTL-bounded enrollment credentials (§3, §4.3).

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Alphabet used for pairing codes: Crockford base32 minus the ambiguity-prone
/// characters `I`, `L`, `O`, and the digit `0`/`1` duplicates.
pub const PAIRING_ALPHABET: &str = "ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// A pairing credential: minted by an admin, consumed exactly once by an enrolling agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PairingRequest {
    /// Stable id for this pairing record.
    pub id: String,
    /// Normalized token (uppercase, no separators) — the secondary-index key.
    pub token: String,
    /// Human-facing `"XXXX-XXXX"` formatted token.
    pub display_token: String,
    /// When this pairing was created.
    pub created_at: DateTime<Utc>,
    /// When this pairing stops being valid for enrollment.
    pub expires_at: DateTime<Utc>,
    /// Becomes `true`, irreversibly, on a successful enrollment.
    pub used: bool,
    /// When the pairing was consumed, if it has been.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_at: Option<DateTime<Utc>>,
    /// The agent id that consumed this pairing, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_agent: Option<String>,
    /// Hostname reported by the enrolling agent, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_hostname: Option<String>,
}

impl PairingRequest {
    /// `true` if `now` is past [`PairingRequest::expires_at`].
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// `true` if the pairing can still be redeemed: unused and not expired.
    #[must_use]
    pub fn is_redeemable(&self, now: DateTime<Utc>) -> bool {
        !self.used && !self.is_expired(now)
    }
}

/// Normalize a user-supplied token (e.g. `"abcd-efgh"`) to its index key (`"ABCDEFGH"`).
#[must_use]
pub fn normalize_token(raw: &str) -> String {
    raw.chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

/// Format a normalized 8-character token as `"XXXX-XXXX"` for display.
#[must_use]
pub fn format_display_token(normalized: &str) -> String {
    if normalized.len() == 8 {
        format!("{}-{}", &normalized[..4], &normalized[4..])
    } else {
        normalized.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample(now: DateTime<Utc>, ttl_secs: i64) -> PairingRequest {
        PairingRequest {
            id: "pr-1".into(),
            token: "ABCDEFGH".into(),
            display_token: "ABCD-EFGH".into(),
            created_at: now,
            expires_at: now + Duration::seconds(ttl_secs),
            used: false,
            used_at: None,
            assigned_agent: None,
            agent_hostname: None,
        }
    }

    #[test]
    fn normalize_lowercases_and_strips_dashes() {
        assert_eq!(normalize_token("abcd-efgh"), "ABCDEFGH");
        assert_eq!(normalize_token("ABCD EFGH"), "ABCDEFGH");
    }

    #[test]
    fn format_display_token_inserts_dash_at_midpoint() {
        assert_eq!(format_display_token("ABCDEFGH"), "ABCD-EFGH");
    }

    #[test]
    fn redeemable_before_expiry_and_unused() {
        let now = Utc::now();
        let pairing = sample(now, 600);
        assert!(pairing.is_redeemable(now));
        assert!(!pairing.is_expired(now));
    }

    #[test]
    fn not_redeemable_once_expired() {
        let now = Utc::now();
        let pairing = sample(now - Duration::seconds(700), 600);
        assert!(pairing.is_expired(now));
        assert!(!pairing.is_redeemable(now));
    }

    #[test]
    fn not_redeemable_once_used() {
        let now = Utc::now();
        let mut pairing = sample(now, 600);
        pairing.used = true;
        assert!(!pairing.is_redeemable(now));
    }
}
