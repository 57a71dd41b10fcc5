//! Token economy primitives: the append-only per-account ledger, the
//! block-reward halving schedule, and the contribution-tree fee split.

use mesh_core::{AccountId, Amount, MeshError, WorkerId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

// ---------------------------------------------------------------------
// C6: TokenLedger
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxKind {
    Mine,
    Pay,
    Fee,
    Refund,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxDirection {
    Credit,
    Debit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tx {
    pub tx_id: String,
    pub account_id: AccountId,
    pub amount: Amount,
    pub kind: TxKind,
    pub direction: TxDirection,
    pub timestamp: u64,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub account_id: AccountId,
    pub balance: Amount,
    pub txs: Vec<Tx>,
}

impl LedgerEntry {
    fn empty(account_id: &AccountId) -> Self {
        Self {
            account_id: account_id.clone(),
            balance: 0.0,
            txs: Vec::new(),
        }
    }
}

/// Backing key/value store for ledger entries. Any store with single-writer
/// semantics per key satisfies this; the in-memory sink below is the default
/// for tests and single-process deployments.
pub trait LedgerSink: Send + Sync {
    fn put(&self, id: &AccountId, entry: LedgerEntry);
    fn get(&self, id: &AccountId) -> Option<LedgerEntry>;
    fn del(&self, id: &AccountId);
    fn all(&self) -> Vec<(AccountId, LedgerEntry)>;
}

#[derive(Default)]
pub struct InMemorySink {
    data: RwLock<HashMap<AccountId, LedgerEntry>>,
}

impl LedgerSink for InMemorySink {
    fn put(&self, id: &AccountId, entry: LedgerEntry) {
        self.data.write().insert(id.clone(), entry);
    }

    fn get(&self, id: &AccountId) -> Option<LedgerEntry> {
        self.data.read().get(id).cloned()
    }

    fn del(&self, id: &AccountId) {
        self.data.write().remove(id);
    }

    fn all(&self) -> Vec<(AccountId, LedgerEntry)> {
        self.data
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Append-only per-account ledger. Every credit/debit is a single logical
/// commit under a per-account lock: the balance update and the tx-list
/// append are both visible or neither is.
pub struct TokenLedger<S: LedgerSink = InMemorySink> {
    sink: S,
    account_locks: RwLock<HashMap<AccountId, Arc<Mutex<()>>>>,
}

impl TokenLedger<InMemorySink> {
    pub fn in_memory() -> Self {
        Self::new(InMemorySink::default())
    }
}

impl<S: LedgerSink> TokenLedger<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            account_locks: RwLock::new(HashMap::new()),
        }
    }

    fn account_lock(&self, account: &AccountId) -> Arc<Mutex<()>> {
        if let Some(lock) = self.account_locks.read().get(account) {
            return lock.clone();
        }
        self.account_locks
            .write()
            .entry(account.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Always succeeds for `amount >= 0`.
    pub fn credit(
        &self,
        account: &AccountId,
        amount: Amount,
        kind: TxKind,
        metadata: serde_json::Value,
    ) -> Tx {
        let lock = self.account_lock(account);
        let _guard = lock.lock();

        let mut entry = self.sink.get(account).unwrap_or_else(|| LedgerEntry::empty(account));
        let tx = Tx {
            tx_id: Uuid::new_v4().to_string(),
            account_id: account.clone(),
            amount,
            kind,
            direction: TxDirection::Credit,
            timestamp: mesh_core::now_ts(),
            metadata,
        };
        entry.balance += amount;
        entry.txs.push(tx.clone());
        self.sink.put(account, entry);
        tx
    }

    /// Fails with `InsufficientFunds` (no state change) when `balance < amount`.
    pub fn debit(
        &self,
        account: &AccountId,
        amount: Amount,
        kind: TxKind,
        metadata: serde_json::Value,
    ) -> Result<Tx, MeshError> {
        let lock = self.account_lock(account);
        let _guard = lock.lock();

        let mut entry = self.sink.get(account).unwrap_or_else(|| LedgerEntry::empty(account));
        if entry.balance < amount {
            return Err(MeshError::InsufficientFunds {
                balance: entry.balance,
                amount,
            });
        }
        let tx = Tx {
            tx_id: Uuid::new_v4().to_string(),
            account_id: account.clone(),
            amount,
            kind,
            direction: TxDirection::Debit,
            timestamp: mesh_core::now_ts(),
            metadata,
        };
        entry.balance -= amount;
        entry.txs.push(tx.clone());
        self.sink.put(account, entry);
        Ok(tx)
    }

    /// 0 for unknown accounts.
    pub fn get_balance(&self, account: &AccountId) -> Amount {
        self.sink.get(account).map(|e| e.balance).unwrap_or(0.0)
    }

    pub fn get_history(&self, account: &AccountId) -> Vec<Tx> {
        self.sink.get(account).map(|e| e.txs).unwrap_or_default()
    }

    pub fn all_balances(&self) -> HashMap<AccountId, Amount> {
        self.sink.all().into_iter().map(|(id, e)| (id, e.balance)).collect()
    }

    /// `balance == Σ credits − Σ debits` and `balance ≥ 0`. Violation is a
    /// fatal, surfaced condition: it means a prior mutation skipped the
    /// per-account lock or a sink write was partially applied.
    pub fn check_invariant(&self, account: &AccountId) -> Result<(), MeshError> {
        let entry = match self.sink.get(account) {
            Some(e) => e,
            None => return Ok(()),
        };
        let credits: Amount = entry
            .txs
            .iter()
            .filter(|t| t.direction == TxDirection::Credit)
            .map(|t| t.amount)
            .sum();
        let debits: Amount = entry
            .txs
            .iter()
            .filter(|t| t.direction == TxDirection::Debit)
            .map(|t| t.amount)
            .sum();
        let expected = credits - debits;
        if entry.balance < -1e-9 || (entry.balance - expected).abs() > 1e-6 {
            return Err(MeshError::LedgerCorruption {
                account: account.clone(),
                balance: entry.balance,
                credits,
                debits,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// C7: RewardSchedule
// ---------------------------------------------------------------------

/// `L` in `epoch(block) = floor(block / L)`, either a fixed interval or a
/// demand-driven one derived from the observed inference rate.
#[derive(Debug, Clone, Copy)]
pub enum EpochLength {
    Fixed(u64),
    DemandDriven { epoch_duration_secs: u64 },
}

struct IpsTracker {
    window_secs: u64,
    events: Mutex<VecDeque<u64>>,
}

impl IpsTracker {
    fn new(window_secs: u64) -> Self {
        Self {
            window_secs: window_secs.max(1),
            events: Mutex::new(VecDeque::new()),
        }
    }

    fn record(&self, now: u64) {
        let mut events = self.events.lock();
        events.push_back(now);
        while let Some(&front) = events.front() {
            if now.saturating_sub(front) > self.window_secs {
                events.pop_front();
            } else {
                break;
            }
        }
    }

    fn ips(&self, now: u64) -> f64 {
        let events = self.events.lock();
        let count = events
            .iter()
            .filter(|&&t| now.saturating_sub(t) <= self.window_secs)
            .count();
        count as f64 / self.window_secs as f64
    }
}

/// `reward(block) = max(R0 / 2^epoch(block), R_min)`, capped so cumulative
/// minted never exceeds `S_max`. Halving is monotonic: the observed epoch
/// never regresses even if a demand-driven `L` shrinks between calls.
pub struct RewardSchedule {
    genesis_reward: Amount,
    supply_cap: Amount,
    min_reward: Amount,
    epoch_length: EpochLength,
    cumulative_minted: RwLock<Amount>,
    max_epoch_seen: AtomicU64,
    ips: IpsTracker,
}

impl RewardSchedule {
    pub fn new(genesis_reward: Amount, supply_cap: Amount, min_reward: Amount, epoch_length: EpochLength) -> Self {
        Self {
            genesis_reward,
            supply_cap,
            min_reward,
            epoch_length,
            cumulative_minted: RwLock::new(0.0),
            max_epoch_seen: AtomicU64::new(0),
            ips: IpsTracker::new(60),
        }
    }

    /// Feeds the demand-driven epoch manager; a no-op under `Fixed`.
    pub fn record_inference(&self, now: u64) {
        self.ips.record(now);
    }

    pub fn cumulative_minted(&self) -> Amount {
        *self.cumulative_minted.read()
    }

    pub fn block_reward(&self, height: u64, now: u64) -> Amount {
        let l = match self.epoch_length {
            EpochLength::Fixed(l) => l.max(1),
            EpochLength::DemandDriven { epoch_duration_secs } => {
                let ips = self.ips.ips(now);
                ((ips * epoch_duration_secs as f64).round() as u64).max(1)
            }
        };
        let raw_epoch = height / l;
        let epoch = self.max_epoch_seen.fetch_max(raw_epoch, Ordering::SeqCst).max(raw_epoch);

        let raw = self.genesis_reward / 2f64.powi(epoch as i32);
        let tentative = raw.max(self.min_reward);

        let mut minted = self.cumulative_minted.write();
        let reward = if *minted + tentative > self.supply_cap {
            (self.supply_cap - *minted).max(0.0)
        } else {
            tentative
        };
        *minted += reward;
        debug!(height, epoch, reward, "block reward minted");
        reward
    }
}

// ---------------------------------------------------------------------
// C8: ContributionTracker
// ---------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ContributionError {
    #[error("registering {child} under {parent} would create a cycle")]
    Cycle { child: String, parent: String },
}

/// Rooted "fine-tuned from" forest over model ids. Acyclic by construction;
/// enforced on every insertion.
#[derive(Default)]
pub struct ContributionTree {
    parents: RwLock<HashMap<String, Option<String>>>,
}

impl ContributionTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, model_id: &str, parent: Option<&str>) -> Result<(), ContributionError> {
        if let Some(parent_id) = parent {
            let parents = self.parents.read();
            let mut current = Some(parent_id.to_string());
            while let Some(node) = current {
                if node == model_id {
                    return Err(ContributionError::Cycle {
                        child: model_id.to_string(),
                        parent: parent_id.to_string(),
                    });
                }
                current = parents.get(&node).cloned().flatten();
            }
        }
        self.parents
            .write()
            .insert(model_id.to_string(), parent.map(|s| s.to_string()));
        Ok(())
    }

    /// `[model_id, parent, grandparent, ..., root]`.
    fn path_to_root(&self, model_id: &str) -> Vec<String> {
        let parents = self.parents.read();
        let mut path = vec![model_id.to_string()];
        let mut current = parents.get(model_id).cloned().flatten();
        while let Some(node) = current {
            current = parents.get(&node).cloned().flatten();
            path.push(node);
        }
        path
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayoutRole {
    Provider,
    Uploader,
    Improver,
}

#[derive(Debug, Clone)]
pub struct Payout {
    pub account: AccountId,
    pub amount: Amount,
    pub role: PayoutRole,
}

/// Splits an inference fee into a provider pool, an uploader (root) share,
/// and a decay-weighted improver pool along the model's ancestry.
pub struct ContributionTracker {
    pub tree: ContributionTree,
}

impl ContributionTracker {
    pub fn new(tree: ContributionTree) -> Self {
        Self { tree }
    }

    /// `Σ payouts == fee` modulo rounding; undistributed improver dust (no
    /// ancestors between the model and the root) accrues to the provider pool.
    pub fn split(&self, fee: Amount, workers: &[WorkerId], model_id: &str) -> Vec<Payout> {
        if fee <= 0.0 {
            return Vec::new();
        }

        let mut payouts = Vec::new();
        let provider_pool = 0.85 * fee;
        if !workers.is_empty() {
            let share = provider_pool / workers.len() as f64;
            for worker in workers {
                payouts.push(Payout {
                    account: worker.clone(),
                    amount: share,
                    role: PayoutRole::Provider,
                });
            }
        }

        let path = self.tree.path_to_root(model_id);
        let root = path.last().cloned().unwrap_or_else(|| model_id.to_string());
        payouts.push(Payout {
            account: root,
            amount: 0.15 * fee * 0.60,
            role: PayoutRole::Uploader,
        });

        let improver_pool = 0.15 * fee * 0.40;
        let ancestors = if path.len() > 2 { &path[1..path.len() - 1] } else { &[][..] };

        if ancestors.is_empty() {
            if !workers.is_empty() {
                let dust = improver_pool / workers.len() as f64;
                for payout in payouts.iter_mut().filter(|p| p.role == PayoutRole::Provider) {
                    payout.amount += dust;
                }
            }
        } else {
            const DECAY: f64 = 0.70;
            let weights: Vec<f64> = (0..ancestors.len()).map(|i| DECAY.powi(i as i32)).collect();
            let weight_sum: f64 = weights.iter().sum();
            for (ancestor, weight) in ancestors.iter().zip(weights.iter()) {
                payouts.push(Payout {
                    account: ancestor.clone(),
                    amount: improver_pool * (weight / weight_sum),
                    role: PayoutRole::Improver,
                });
            }
        }

        payouts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credit_then_debit_keeps_invariant() {
        let ledger = TokenLedger::in_memory();
        let acct = "alice".to_string();
        ledger.credit(&acct, 10.0, TxKind::Mine, serde_json::json!({}));
        ledger.debit(&acct, 4.0, TxKind::Pay, serde_json::json!({})).unwrap();
        assert_eq!(ledger.get_balance(&acct), 6.0);
        ledger.check_invariant(&acct).unwrap();
    }

    #[test]
    fn debit_exceeding_balance_leaves_state_unchanged() {
        let ledger = TokenLedger::in_memory();
        let acct = "bob".to_string();
        ledger.credit(&acct, 4.0, TxKind::Mine, serde_json::json!({}));
        let err = ledger.debit(&acct, 5.0, TxKind::Pay, serde_json::json!({})).unwrap_err();
        assert!(matches!(err, MeshError::InsufficientFunds { .. }));
        assert_eq!(ledger.get_balance(&acct), 4.0);
    }

    #[test]
    fn unknown_account_has_zero_balance() {
        let ledger = TokenLedger::in_memory();
        assert_eq!(ledger.get_balance(&"nobody".to_string()), 0.0);
    }

    #[test]
    fn halving_at_interval_boundary() {
        let schedule = RewardSchedule::new(50.0, 21_000_000.0, 1e-8, EpochLength::Fixed(3));
        assert_eq!(schedule.block_reward(0, 0), 50.0);
        assert_eq!(schedule.block_reward(1, 0), 50.0);
        assert_eq!(schedule.block_reward(2, 0), 50.0);
        assert_eq!(schedule.block_reward(3, 0), 25.0);
        assert_eq!(schedule.cumulative_minted(), 175.0);
    }

    #[test]
    fn reward_never_exceeds_supply_cap() {
        let schedule = RewardSchedule::new(50.0, 120.0, 1e-8, EpochLength::Fixed(1));
        let r0 = schedule.block_reward(0, 0);
        let r1 = schedule.block_reward(1, 0);
        let r2 = schedule.block_reward(2, 0);
        assert_eq!(r0 + r1 + r2, 120.0);
        assert_eq!(schedule.block_reward(3, 0), 0.0);
    }

    #[test]
    fn acyclic_insertion_rejects_self_reference_cycles() {
        let tree = ContributionTree::new();
        tree.insert("base", None).unwrap();
        tree.insert("child", Some("base")).unwrap();
        let err = tree.insert("base", Some("child")).unwrap_err();
        assert!(matches!(err, ContributionError::Cycle { .. }));
    }

    #[test]
    fn split_with_no_ancestors_sends_dust_to_providers() {
        let tree = ContributionTree::new();
        tree.insert("m", None).unwrap();
        let tracker = ContributionTracker::new(tree);
        let workers = vec!["w0".to_string(), "w1".to_string()];
        let payouts = tracker.split(10.0, &workers, "m");

        let total: Amount = payouts.iter().map(|p| p.amount).sum();
        assert!((total - 10.0).abs() < 1e-9);
        let uploader: Amount = payouts
            .iter()
            .filter(|p| p.role == PayoutRole::Uploader)
            .map(|p| p.amount)
            .sum();
        assert!((uploader - 0.9).abs() < 1e-9);
    }

    #[test]
    fn chunked_fee_split_matches_depth_two_decay() {
        let tree = ContributionTree::new();
        tree.insert("root", None).unwrap();
        tree.insert("near", Some("root")).unwrap();
        tree.insert("far", Some("near")).unwrap();
        tree.insert("model", Some("far")).unwrap();
        let tracker = ContributionTracker::new(tree);

        let workers = vec!["w0".into(), "w1".into(), "w2".into(), "w3".into()];
        let payouts = tracker.split(10.0, &workers, "model");

        for p in payouts.iter().filter(|p| p.role == PayoutRole::Provider) {
            assert!((p.amount - 2.125).abs() < 1e-9);
        }
        let uploader = payouts.iter().find(|p| p.role == PayoutRole::Uploader).unwrap();
        assert!((uploader.amount - 0.9).abs() < 1e-9);

        let mut improvers: Vec<Amount> = payouts
            .iter()
            .filter(|p| p.role == PayoutRole::Improver)
            .map(|p| p.amount)
            .collect();
        improvers.sort_by(|a, b| b.partial_cmp(a).unwrap());
        assert!((improvers[0] - 0.3529411764705882).abs() < 1e-6);
        assert!((improvers[1] - 0.24705882352941178).abs() < 1e-6);

        let total: Amount = payouts.iter().map(|p| p.amount).sum();
        assert!((total - 10.0).abs() < 1e-9);
    }
}
