use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    error::PipelineError,
    pipeline::types::{NormalizedTradeline, UNKNOWN_CREDITOR, UpsertOutcome},
    storage::TradelineStorage,
};

/// Suffix words dropped from creditor names before keying, so "Chase Bank NA"
/// and "CHASE" land on the same key.
const CREDITOR_SUFFIX_WORDS: &[&str] = &["bank", "inc", "llc", "corp", "na", "company"];

pub fn normalize_creditor_name(raw: &str) -> String {
    let lower = raw.to_lowercase();
    let cleaned: String = lower
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    let words: Vec<&str> = cleaned
        .split_whitespace()
        .filter(|word| !CREDITOR_SUFFIX_WORDS.contains(word))
        .collect();

    // Single letters left over from dotted abbreviations ("N.A.", "F.S.B.")
    // are dropped so the dotted and undotted spellings key identically,
    // unless the name consists of nothing else.
    let significant: Vec<&str> = words
        .iter()
        .copied()
        .filter(|word| word.chars().count() > 1)
        .collect();
    let kept = if significant.is_empty() { words } else { significant };

    kept.join(" ")
}

/// Identity of a tradeline for dedup purposes. The same account reported by
/// different bureaus produces distinct keys on purpose: up to one row per
/// bureau may coexist.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeduplicationKey {
    user_id: String,
    creditor: String,
    account_prefix: String,
    date_opened: String,
    bureau: String,
}

impl DeduplicationKey {
    pub fn build(user_id: &str, tl: &NormalizedTradeline) -> Self {
        Self {
            user_id: user_id.to_string(),
            creditor: normalize_creditor_name(&tl.creditor_name),
            account_prefix: tl.account_number_prefix.clone().unwrap_or_default(),
            date_opened: tl.date_opened.clone().unwrap_or_default(),
            bureau: tl.credit_bureau.to_string(),
        }
    }

    /// Stable storage key derived from the tuple.
    pub fn storage_key(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            &self.user_id,
            &self.creditor,
            &self.account_prefix,
            &self.date_opened,
            &self.bureau,
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        let digest = hasher.finalize();
        let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
        format!("tl-{hex}")
    }
}

/// Upserts normalized tradelines against the store under a per-user lock, so
/// two concurrent reports for the same user cannot race a key collision.
/// Locks are held weakly and pruned on acquisition; the map does not grow
/// with the number of users ever seen.
pub struct DeduplicationEngine {
    storage: Arc<dyn TradelineStorage>,
    user_locks: Mutex<HashMap<String, Weak<Mutex<()>>>>,
}

impl DeduplicationEngine {
    pub fn new(storage: Arc<dyn TradelineStorage>) -> Self {
        Self {
            storage,
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn upsert(
        &self,
        mut candidate: NormalizedTradeline,
    ) -> Result<UpsertOutcome, PipelineError> {
        let key = DeduplicationKey::build(&candidate.user_id, &candidate);
        let storage_key = key.storage_key();

        let user_lock = {
            let mut locks = self.user_locks.lock().await;
            locks.retain(|_, weak| weak.strong_count() > 0);
            match locks.get(&candidate.user_id).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(Mutex::new(()));
                    locks.insert(candidate.user_id.clone(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        let _guard = user_lock.lock().await;

        let existing = self
            .storage
            .get(&storage_key)
            .await
            .map_err(|err| PipelineError::Storage(err.to_string()))?;

        match existing {
            None => {
                candidate.id = storage_key.clone();
                self.storage
                    .put(&storage_key, candidate)
                    .await
                    .map_err(|err| PipelineError::Storage(err.to_string()))?;
                Ok(UpsertOutcome::Inserted { id: storage_key })
            }
            Some(previous) => {
                let (merged, conflicts) = merge(previous, candidate);
                debug!(key = %storage_key, conflicts, "merging duplicate tradeline");
                self.storage
                    .put(&storage_key, merged)
                    .await
                    .map_err(|err| PipelineError::Storage(err.to_string()))?;
                Ok(UpsertOutcome::Merged {
                    previous_id: storage_key,
                    conflicts,
                })
            }
        }
    }
}

/// Field-wise merge of a stored row and a freshly parsed duplicate. A
/// populated field is never replaced by an empty or placeholder value; when
/// both sides hold different real values the new parse wins and the conflict
/// counter records the disagreement for audit.
fn merge(
    previous: NormalizedTradeline,
    new: NormalizedTradeline,
) -> (NormalizedTradeline, u32) {
    let mut conflicts = 0u32;
    let mut merged = previous.clone();

    merged.creditor_name = pick_required(
        previous.creditor_name,
        new.creditor_name,
        |v| v.is_empty() || v == UNKNOWN_CREDITOR,
        &mut conflicts,
    );
    merged.account_number = pick_required(
        previous.account_number,
        new.account_number,
        |v| v.is_empty(),
        &mut conflicts,
    );

    merged.account_number_prefix =
        pick(previous.account_number_prefix, new.account_number_prefix, is_empty, &mut conflicts);
    merged.account_balance =
        pick(previous.account_balance, new.account_balance, is_zero_currency, &mut conflicts);
    merged.credit_limit =
        pick(previous.credit_limit, new.credit_limit, is_zero_currency, &mut conflicts);
    merged.monthly_payment =
        pick(previous.monthly_payment, new.monthly_payment, is_zero_currency, &mut conflicts);
    merged.date_opened = pick(previous.date_opened, new.date_opened, is_empty, &mut conflicts);
    merged.account_type = pick(previous.account_type, new.account_type, is_empty, &mut conflicts);
    merged.account_status =
        pick(previous.account_status, new.account_status, is_empty, &mut conflicts);

    // Signal fields take the stronger reading rather than last-write-wins.
    merged.is_negative = previous.is_negative || new.is_negative;
    merged.confidence_score = previous.confidence_score.max(new.confidence_score);
    merged.low_confidence = previous.low_confidence && new.low_confidence;
    merged.parse_confidence = previous.parse_confidence.max(new.parse_confidence);

    merged.merge_conflicts = previous.merge_conflicts + conflicts;
    (merged, conflicts)
}

fn is_empty(value: &str) -> bool {
    value.trim().is_empty()
}

fn is_zero_currency(value: &str) -> bool {
    value.trim().is_empty() || value.trim() == "$0"
}

fn pick(
    previous: Option<String>,
    new: Option<String>,
    placeholder: fn(&str) -> bool,
    conflicts: &mut u32,
) -> Option<String> {
    match (previous, new) {
        (prev, None) => prev,
        (prev, Some(n)) if placeholder(&n) => prev,
        (None, Some(n)) => Some(n),
        (Some(p), Some(n)) if placeholder(&p) => Some(n),
        (Some(p), Some(n)) => {
            if p != n {
                *conflicts += 1;
            }
            Some(n)
        }
    }
}

fn pick_required(
    previous: String,
    new: String,
    placeholder: fn(&str) -> bool,
    conflicts: &mut u32,
) -> String {
    if placeholder(&new) {
        return previous;
    }
    if placeholder(&previous) {
        return new;
    }
    if previous != new {
        *conflicts += 1;
    }
    new
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pipeline::types::Bureau,
        storage::{JsonTradelineStorage, JsonTradelineStorageConfig},
    };

    fn record(creditor: &str, bureau: Bureau) -> NormalizedTradeline {
        NormalizedTradeline {
            user_id: "user-1".into(),
            creditor_name: creditor.into(),
            account_number: "4242XXXXXXXXXXXX".into(),
            account_number_prefix: Some("4242".into()),
            account_balance: Some("$500".into()),
            date_opened: Some("03/01/2019".into()),
            credit_bureau: bureau,
            confidence_score: 80,
            ..NormalizedTradeline::default()
        }
    }

    async fn engine() -> (DeduplicationEngine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(JsonTradelineStorage::new(JsonTradelineStorageConfig {
            working_dir: dir.path().to_path_buf(),
        }));
        storage.initialize().await.unwrap();
        (DeduplicationEngine::new(storage), dir)
    }

    #[test]
    fn creditor_normalization_strips_suffixes() {
        assert_eq!(normalize_creditor_name("Chase Bank, N.A."), "chase");
        assert_eq!(normalize_creditor_name("CHASE"), "chase");
        // Suffix words only drop as whole words.
        assert_ne!(normalize_creditor_name("Bankers Trust"), "ers trust");
    }

    #[test]
    fn dotted_and_undotted_spellings_key_identically() {
        assert_eq!(
            normalize_creditor_name("Chase Bank, N.A."),
            normalize_creditor_name("Chase Bank NA"),
        );
        assert_eq!(normalize_creditor_name("First Savings F.S.B."), "first savings");
        // A name made of nothing but initials keeps them.
        assert_eq!(normalize_creditor_name("G.M."), "g m");
    }

    #[test]
    fn same_account_different_bureau_gets_distinct_keys() {
        let tu = record("CHASE", Bureau::TransUnion);
        let eq = record("CHASE", Bureau::Equifax);
        let key_tu = DeduplicationKey::build("user-1", &tu).storage_key();
        let key_eq = DeduplicationKey::build("user-1", &eq).storage_key();
        assert_ne!(key_tu, key_eq);
    }

    #[tokio::test]
    async fn insert_then_merge_counts_conflicts() {
        let (engine, _dir) = engine().await;

        let first = record("Chase Bank", Bureau::TransUnion);
        let outcome = engine.upsert(first).await.unwrap();
        let id = match outcome {
            UpsertOutcome::Inserted { id } => id,
            other => panic!("expected insert, got {other:?}"),
        };

        // Same key, new balance: populated-vs-populated difference.
        let mut second = record("Chase Bank", Bureau::TransUnion);
        second.account_balance = Some("$750".into());
        let outcome = engine.upsert(second).await.unwrap();
        assert_eq!(
            outcome,
            UpsertOutcome::Merged {
                previous_id: id,
                conflicts: 1
            }
        );
    }

    #[tokio::test]
    async fn merge_never_overwrites_with_placeholder() {
        let (engine, _dir) = engine().await;

        let first = record("Chase Bank", Bureau::TransUnion);
        let id = match engine.upsert(first).await.unwrap() {
            UpsertOutcome::Inserted { id } => id,
            other => panic!("expected insert, got {other:?}"),
        };

        let mut second = record("CHASE", Bureau::TransUnion);
        second.account_balance = Some("$0".into());
        second.account_status = None;
        engine.upsert(second).await.unwrap();

        let stored = engine.storage.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.account_balance.as_deref(), Some("$500"));
    }

    #[tokio::test]
    async fn user_locks_are_pruned_after_use() {
        let (engine, _dir) = engine().await;

        for i in 0..10 {
            let mut tl = record("CHASE", Bureau::TransUnion);
            tl.user_id = format!("user-{i}");
            engine.upsert(tl).await.unwrap();
        }

        // Acquisition prunes dead entries, so the map cannot accumulate one
        // slot per user ever seen.
        let locks = engine.user_locks.lock().await;
        assert!(locks.len() <= 1, "lock map kept {} entries", locks.len());
        assert!(locks.values().all(|weak| weak.strong_count() == 0));
    }

    #[tokio::test]
    async fn three_bureaus_coexist() {
        let (engine, _dir) = engine().await;

        for bureau in [Bureau::TransUnion, Bureau::Equifax, Bureau::Experian] {
            let outcome = engine.upsert(record("CHASE", bureau)).await.unwrap();
            assert!(matches!(outcome, UpsertOutcome::Inserted { .. }));
        }

        let rows = engine.storage.list_for_user("user-1").await.unwrap();
        assert_eq!(rows.len(), 3);
    }
}
