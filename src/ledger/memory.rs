use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

use super::{cid_to_bytes32, keccak256, LedgerClient, LedgerRewardEntry, TxHash, TxStatus};
use crate::error::LedgerError;
use crate::models::{Amount, RewardSchedule};

#[derive(Debug, Clone)]
struct Entry {
    uploader: String,
    file_size: u64,
    is_encrypted: bool,
    reward_claimed: bool,
}

#[derive(Debug, Default)]
struct State {
    records: HashMap<[u8; 32], Entry>,
    balances: HashMap<String, Amount>,
    // (cid key, grantee) -> unix expiry, 0 for permanent
    grants: HashMap<([u8; 32], String), i64>,
    transactions: HashMap<TxHash, TxStatus>,
    submitted: HashMap<&'static str, u32>,
    block: u64,
    tx_counter: u64,
    failures_remaining: u32,
    offline: bool,
    latency: Option<Duration>,
    now: Option<i64>,
}

/// In-process ledger with the same claim-once, balance and access rules
/// as the registry contract. Backs `ledger.mode = "memory"`.
pub struct InMemoryLedger {
    schedule: RewardSchedule,
    state: Mutex<State>,
}

impl InMemoryLedger {
    pub fn new(schedule: RewardSchedule) -> Self {
        Self {
            schedule,
            state: Mutex::new(State::default()),
        }
    }

    /// Fail the next `count` calls with a retryable transaction error
    pub async fn fail_next(&self, count: u32) {
        self.state.lock().await.failures_remaining = count;
    }

    pub async fn set_offline(&self, offline: bool) {
        self.state.lock().await.offline = offline;
    }

    /// Delay every call, for exercising deadlines
    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().await.latency = latency;
    }

    /// Pin the ledger clock (unix seconds) used for grant expiry
    pub async fn set_time(&self, now: Option<i64>) {
        self.state.lock().await.now = now;
    }

    /// Number of accepted transactions of the given kind
    pub async fn submitted(&self, kind: &str) -> u32 {
        self.state
            .lock()
            .await
            .submitted
            .get(kind)
            .copied()
            .unwrap_or(0)
    }

    async fn begin(&self) -> Result<tokio::sync::MutexGuard<'_, State>, LedgerError> {
        let latency = self.state.lock().await.latency;
        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        if state.offline {
            return Err(LedgerError::ContractCallFailed("ledger unreachable".to_string()));
        }
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(LedgerError::TransactionFailed("injected failure".to_string()));
        }
        Ok(state)
    }
}

impl State {
    fn now(&self) -> i64 {
        self.now.unwrap_or_else(|| Utc::now().timestamp())
    }

    fn commit(&mut self, kind: &'static str) -> TxHash {
        self.tx_counter += 1;
        self.block += 1;
        let hash = format!(
            "0x{}",
            hex::encode(keccak256(format!("{}:{}", kind, self.tx_counter).as_bytes()))
        );
        self.transactions.insert(hash.clone(), TxStatus::Confirmed);
        *self.submitted.entry(kind).or_insert(0) += 1;
        hash
    }
}

fn normalize(address: &str) -> String {
    address.to_lowercase()
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    async fn record_upload(
        &self,
        cid: &str,
        uploader: &str,
        size: u64,
        encrypted: bool,
        _metadata: &str,
    ) -> Result<TxHash, LedgerError> {
        let mut state = self.begin().await?;
        let key = cid_to_bytes32(cid);
        if state.records.contains_key(&key) {
            return Err(LedgerError::AlreadyRecorded);
        }
        state.records.insert(
            key,
            Entry {
                uploader: normalize(uploader),
                file_size: size,
                is_encrypted: encrypted,
                reward_claimed: false,
            },
        );
        Ok(state.commit("record_upload"))
    }

    async fn claim_reward(&self, cid: &str) -> Result<TxHash, LedgerError> {
        let mut state = self.begin().await?;
        let entry = state
            .records
            .get_mut(&cid_to_bytes32(cid))
            .ok_or(LedgerError::NothingToClaim)?;
        if entry.reward_claimed {
            return Err(LedgerError::AlreadyClaimed);
        }
        entry.reward_claimed = true;
        let amount = self.schedule.calculate(entry.file_size, entry.is_encrypted);
        let uploader = entry.uploader.clone();
        *state.balances.entry(uploader).or_insert(0) += amount;
        Ok(state.commit("claim_reward"))
    }

    async fn claim_rewards(&self, cids: &[String]) -> Result<TxHash, LedgerError> {
        let mut state = self.begin().await?;
        if cids.is_empty() {
            return Err(LedgerError::NothingToClaim);
        }

        // All or nothing, like a reverting transaction
        for cid in cids {
            match state.records.get(&cid_to_bytes32(cid)) {
                None => return Err(LedgerError::NothingToClaim),
                Some(entry) if entry.reward_claimed => return Err(LedgerError::AlreadyClaimed),
                Some(_) => {}
            }
        }

        for cid in cids {
            let credit = state.records.get_mut(&cid_to_bytes32(cid)).map(|entry| {
                entry.reward_claimed = true;
                (
                    entry.uploader.clone(),
                    self.schedule.calculate(entry.file_size, entry.is_encrypted),
                )
            });
            if let Some((uploader, amount)) = credit {
                *state.balances.entry(uploader).or_insert(0) += amount;
            }
        }
        Ok(state.commit("claim_rewards"))
    }

    async fn grant_access(
        &self,
        cid: &str,
        grantee: &str,
        duration_secs: u64,
    ) -> Result<TxHash, LedgerError> {
        let mut state = self.begin().await?;
        let expiry = if duration_secs == 0 {
            0
        } else {
            state.now().saturating_add(duration_secs as i64)
        };
        state
            .grants
            .insert((cid_to_bytes32(cid), normalize(grantee)), expiry);
        Ok(state.commit("grant_access"))
    }

    async fn revoke_access(&self, cid: &str, grantee: &str) -> Result<TxHash, LedgerError> {
        let mut state = self.begin().await?;
        state.grants.remove(&(cid_to_bytes32(cid), normalize(grantee)));
        Ok(state.commit("revoke_access"))
    }

    async fn has_access(&self, cid: &str, address: &str) -> Result<bool, LedgerError> {
        let state = self.begin().await?;
        let key = cid_to_bytes32(cid);
        let address = normalize(address);

        if let Some(entry) = state.records.get(&key) {
            if entry.uploader == address {
                return Ok(true);
            }
        }
        Ok(match state.grants.get(&(key, address)) {
            Some(0) => true,
            Some(expiry) => *expiry > state.now(),
            None => false,
        })
    }

    async fn reward_balance(&self, address: &str) -> Result<Amount, LedgerError> {
        let state = self.begin().await?;
        Ok(state.balances.get(&normalize(address)).copied().unwrap_or(0))
    }

    async fn calculate_reward(&self, size: u64, encrypted: bool) -> Result<Amount, LedgerError> {
        let _state = self.begin().await?;
        Ok(self.schedule.calculate(size, encrypted))
    }

    async fn reward_entry(&self, cid: &str) -> Result<Option<LedgerRewardEntry>, LedgerError> {
        let state = self.begin().await?;
        Ok(state
            .records
            .get(&cid_to_bytes32(cid))
            .map(|entry| LedgerRewardEntry {
                uploader: entry.uploader.clone(),
                file_size: entry.file_size,
                is_encrypted: entry.is_encrypted,
                reward_claimed: entry.reward_claimed,
            }))
    }

    async fn transaction_status(&self, tx_hash: &str) -> Result<TxStatus, LedgerError> {
        let state = self.begin().await?;
        Ok(state
            .transactions
            .get(tx_hash)
            .copied()
            .unwrap_or(TxStatus::Pending))
    }

    async fn block_number(&self) -> Result<u64, LedgerError> {
        Ok(self.begin().await?.block)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UPLOADER: &str = "0x00000000000000000000000000000000000000a1";
    const OTHER: &str = "0x00000000000000000000000000000000000000b2";

    fn ledger() -> InMemoryLedger {
        InMemoryLedger::new(RewardSchedule {
            base: 100,
            size_multiplier: 10,
            encryption_bonus: 5,
        })
    }

    #[tokio::test]
    async fn test_claim_once() {
        let ledger = ledger();
        ledger.record_upload("cid1", UPLOADER, 2048, true, "{}").await.unwrap();

        ledger.claim_reward("cid1").await.unwrap();
        let err = ledger.claim_reward("cid1").await.unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyClaimed));

        assert_eq!(ledger.reward_balance(UPLOADER).await.unwrap(), 100 + 20 + 5);
        assert_eq!(ledger.submitted("claim_reward").await, 1);
    }

    #[tokio::test]
    async fn test_claim_unrecorded() {
        let ledger = ledger();
        let err = ledger.claim_reward("missing").await.unwrap_err();
        assert!(matches!(err, LedgerError::NothingToClaim));
    }

    #[tokio::test]
    async fn test_batch_is_atomic() {
        let ledger = ledger();
        ledger.record_upload("a", UPLOADER, 0, false, "").await.unwrap();
        ledger.record_upload("b", UPLOADER, 0, false, "").await.unwrap();
        ledger.claim_reward("b").await.unwrap();

        let err = ledger
            .claim_rewards(&["a".to_string(), "b".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyClaimed));
        assert!(!ledger.reward_entry("a").await.unwrap().unwrap().reward_claimed);
    }

    #[tokio::test]
    async fn test_grant_expiry_follows_clock() {
        let ledger = ledger();
        ledger.record_upload("cid", UPLOADER, 1, false, "").await.unwrap();
        ledger.set_time(Some(1_000)).await;
        ledger.grant_access("cid", OTHER, 60).await.unwrap();

        assert!(ledger.has_access("cid", OTHER).await.unwrap());
        ledger.set_time(Some(1_061)).await;
        assert!(!ledger.has_access("cid", OTHER).await.unwrap());
        assert!(ledger.has_access("cid", UPLOADER).await.unwrap());
    }

    #[tokio::test]
    async fn test_second_record_is_rejected() {
        let ledger = ledger();
        ledger.record_upload("cid", UPLOADER, 1, false, "").await.unwrap();
        let err = ledger.record_upload("cid", UPLOADER, 1, false, "").await.unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyRecorded));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let ledger = ledger();
        ledger.fail_next(1).await;
        let err = ledger.record_upload("cid", UPLOADER, 1, false, "").await.unwrap_err();
        assert!(err.is_retryable());
        ledger.record_upload("cid", UPLOADER, 1, false, "").await.unwrap();
    }

    #[tokio::test]
    async fn test_transaction_status() {
        let ledger = ledger();
        let tx = ledger.record_upload("cid", UPLOADER, 1, false, "").await.unwrap();
        assert_eq!(ledger.transaction_status(&tx).await.unwrap(), TxStatus::Confirmed);
        assert_eq!(ledger.transaction_status("0xunknown").await.unwrap(), TxStatus::Pending);
    }
}
