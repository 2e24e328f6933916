use serde::{Deserialize, Serialize};

/// Smallest ledger unit (wei-style, 18 decimals)
pub type Amount = u128;

pub const AMOUNT_DECIMALS: u32 = 18;

/// Reward constants. The same formula runs off-ledger for previews and
/// on-ledger for settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewardSchedule {
    pub base: Amount,
    pub size_multiplier: Amount,
    pub encryption_bonus: Amount,
}

impl RewardSchedule {
    /// `base + floor(size / 1024) * size_multiplier + bonus`
    pub fn calculate(&self, size_bytes: u64, encrypted: bool) -> Amount {
        let kib = (size_bytes / 1024) as Amount;
        let bonus = if encrypted { self.encryption_bonus } else { 0 };
        self.base
            .saturating_add(kib.saturating_mul(self.size_multiplier))
            .saturating_add(bonus)
    }
}

/// Render an amount with 18 decimals, trailing zeros trimmed
pub fn format_amount(amount: Amount) -> String {
    let unit = 10u128.pow(AMOUNT_DECIMALS);
    let whole = amount / unit;
    let frac = amount % unit;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{:0width$}", frac, width = AMOUNT_DECIMALS as usize);
    format!("{}.{}", whole, frac.trim_end_matches('0'))
}

/// Claim a single reward
#[derive(Debug, Deserialize)]
pub struct ClaimRewardRequest {
    pub cid: String,
    pub user_address: String,
    pub signature: String,
}

/// Claim several rewards in one ledger transaction
#[derive(Debug, Deserialize)]
pub struct BatchClaimRequest {
    pub cids: Vec<String>,
    pub user_address: String,
    pub signature: String,
}

#[derive(Debug, Serialize)]
pub struct ClaimReceipt {
    pub cid: String,
    pub tx_hash: String,
    pub amount_wei: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotFound,
    NotOwner,
    AlreadyRewarded,
    NotConfirmed,
    Duplicate,
}

#[derive(Debug, Serialize)]
pub struct SkippedClaim {
    pub cid: String,
    pub reason: SkipReason,
}

#[derive(Debug, Serialize)]
pub struct BatchClaimReceipt {
    /// None when nothing in the batch was eligible
    pub tx_hash: Option<String>,
    pub claimed: Vec<String>,
    pub skipped: Vec<SkippedClaim>,
    pub total_wei: String,
}

#[derive(Debug, Deserialize)]
pub struct RewardPreviewQuery {
    pub size: u64,
    #[serde(default)]
    pub encrypted: bool,
}

#[derive(Debug, Serialize)]
pub struct RewardPreview {
    pub size: u64,
    pub encrypted: bool,
    pub amount_wei: String,
    pub amount: String,
}

#[derive(Debug, Serialize)]
pub struct RewardBalance {
    pub address: String,
    pub balance_wei: String,
    pub balance: String,
}
