use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Expiry of an access grant.
///
/// Permanence is its own case rather than a far-future timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "at", rename_all = "snake_case")]
pub enum GrantExpiry {
    Permanent,
    ExpiresAt(DateTime<Utc>),
}

impl GrantExpiry {
    /// A zero duration means the grant never expires.
    pub fn from_duration(now: DateTime<Utc>, duration_secs: u64) -> Self {
        if duration_secs == 0 {
            GrantExpiry::Permanent
        } else {
            GrantExpiry::ExpiresAt(now + Duration::seconds(duration_secs as i64))
        }
    }

    /// Ledger encoding: unix seconds, zero for permanent. None for values
    /// that are negative or beyond the representable range.
    pub fn from_unix(secs: i64) -> Option<Self> {
        match secs {
            0 => Some(GrantExpiry::Permanent),
            s if s < 0 => None,
            s => Utc.timestamp_opt(s, 0).single().map(GrantExpiry::ExpiresAt),
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        match self {
            GrantExpiry::Permanent => true,
            GrantExpiry::ExpiresAt(at) => at.timestamp() > now.timestamp(),
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            GrantExpiry::Permanent => "permanent",
            GrantExpiry::ExpiresAt(_) => "expires_at",
        }
    }

    pub fn unix_timestamp(&self) -> Option<i64> {
        match self {
            GrantExpiry::Permanent => None,
            GrantExpiry::ExpiresAt(at) => Some(at.timestamp()),
        }
    }
}

/// Access grant row, keyed by (cid, grantee)
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AccessGrant {
    pub id: String,
    pub cid: String,
    pub grantee_address: String,
    pub granter_address: String,
    #[serde(skip_serializing)]
    pub expiry_kind: String,
    #[serde(skip_serializing)]
    pub expires_at: Option<i64>,
    pub is_active: bool,
    /// Revoked locally, ledger revoke not yet confirmed
    #[serde(skip_serializing)]
    pub revoke_pending: bool,
    pub tx_hash: Option<String>,
    #[serde(skip_serializing)]
    pub last_event_block: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl AccessGrant {
    pub fn expiry(&self) -> GrantExpiry {
        match (self.expiry_kind.as_str(), self.expires_at) {
            ("expires_at", Some(secs)) => match Utc.timestamp_opt(secs, 0).single() {
                Some(at) => GrantExpiry::ExpiresAt(at),
                // Unrepresentable timestamps are treated as already expired
                None => GrantExpiry::ExpiresAt(DateTime::<Utc>::MIN_UTC),
            },
            _ => GrantExpiry::Permanent,
        }
    }

    pub fn is_effective_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expiry().is_valid_at(now)
    }
}

/// Grant view returned to clients
#[derive(Debug, Serialize)]
pub struct AccessGrantView {
    #[serde(flatten)]
    pub grant: AccessGrant,
    pub expiry: GrantExpiry,
}

impl From<AccessGrant> for AccessGrantView {
    fn from(grant: AccessGrant) -> Self {
        let expiry = grant.expiry();
        Self { grant, expiry }
    }
}

/// Which source answered an access check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessSource {
    Uploader,
    LocalGrant,
    Ledger,
}

/// Grant access request
#[derive(Debug, Deserialize)]
pub struct GrantAccessRequest {
    pub cid: String,
    pub granter: String,
    pub grantee: String,
    /// Seconds; zero grants permanent access
    #[serde(default)]
    pub duration: u64,
    pub signature: String,
}

/// Revoke access request
#[derive(Debug, Deserialize)]
pub struct RevokeAccessRequest {
    pub cid: String,
    pub granter: String,
    pub grantee: String,
    pub signature: String,
}

#[derive(Debug, Serialize)]
pub struct AccessCheckResponse {
    pub cid: String,
    pub address: String,
    pub has_access: bool,
    pub source: Option<AccessSource>,
}
