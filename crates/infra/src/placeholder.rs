//! Virtual placeholder registry.
//!
//! Tracks which tokens are still pending, which operation will produce each
//! one, and which queued operations are waiting on it. A token is resolved at
//! most once. Resolved values are retained (bounded) so late references can
//! still be substituted; the set of resolved tokens is kept for the life of
//! the runtime so repeat resolutions are always detected.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;

use silentq_core::{OperationId, PlaceholderToken, QueueError, dehydrate_with};

pub(crate) const RETIRED_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// Waiting for `owner` (or the application, when `None`) to resolve it.
    Pending { owner: Option<OperationId> },
    /// The owner failed; this token will only resolve if the application does it.
    Orphaned,
}

#[derive(Debug)]
struct Entry {
    slot: Slot,
    referrers: BTreeSet<OperationId>,
}

/// Lock-protected registry state.
///
/// Lock order: the placeholder table is always taken before the queue
/// registry when both are needed.
#[derive(Debug, Default)]
pub(crate) struct PlaceholderTable {
    entries: HashMap<PlaceholderToken, Entry>,
    retired: HashMap<PlaceholderToken, Value>,
    retired_order: VecDeque<PlaceholderToken>,
    resolved: HashSet<PlaceholderToken>,
}

impl PlaceholderTable {
    pub(crate) fn allocate(&mut self, owner: Option<OperationId>) -> PlaceholderToken {
        let token = PlaceholderToken::new();
        self.register(token, owner);
        token
    }

    /// Track an existing token (used when rehydrating producers at boot).
    pub(crate) fn register(&mut self, token: PlaceholderToken, owner: Option<OperationId>) {
        if self.resolved.contains(&token) {
            return;
        }
        self.entries.entry(token).or_insert(Entry {
            slot: Slot::Pending { owner },
            referrers: BTreeSet::new(),
        });
    }

    /// Values of tokens in `refs` that are already resolved.
    ///
    /// Fails with `PlaceholderExpired` if a referenced token was resolved but
    /// its value has since been evicted.
    pub(crate) fn resolved_among(
        &self,
        refs: &BTreeSet<PlaceholderToken>,
    ) -> Result<Vec<(PlaceholderToken, Value)>, QueueError> {
        let mut out = Vec::new();
        for token in refs {
            match self.retired.get(token) {
                Some(value) => out.push((*token, value.clone())),
                None if self.resolved.contains(token) => {
                    return Err(QueueError::PlaceholderExpired(*token));
                }
                None => {}
            }
        }
        Ok(out)
    }

    /// Register `op` as waiting on each of `refs`.
    ///
    /// Returns the already-resolved tokens (with values) that the caller must
    /// substitute immediately. Unknown tokens are kept as orphans so a later
    /// manual resolution still reaches `op`.
    pub(crate) fn bind(
        &mut self,
        op: OperationId,
        refs: &BTreeSet<PlaceholderToken>,
    ) -> Vec<(PlaceholderToken, Value)> {
        let mut resolved = Vec::new();
        for token in refs {
            if let Some(value) = self.retired.get(token) {
                resolved.push((*token, value.clone()));
                continue;
            }
            if self.resolved.contains(token) {
                tracing::warn!(operation_id = %op, token = %token, "operation references an expired placeholder");
                continue;
            }
            let entry = self.entries.entry(*token).or_insert_with(|| {
                tracing::warn!(operation_id = %op, token = %token, "operation references an unknown placeholder");
                Entry {
                    slot: Slot::Orphaned,
                    referrers: BTreeSet::new(),
                }
            });
            entry.referrers.insert(op);
        }
        resolved
    }

    /// Mark `token` resolved and return the operations waiting on it.
    pub(crate) fn begin_resolve(
        &mut self,
        token: PlaceholderToken,
        value: Value,
    ) -> Result<BTreeSet<OperationId>, QueueError> {
        if self.resolved.contains(&token) {
            return Err(QueueError::AlreadyResolved(token));
        }
        let entry = self
            .entries
            .remove(&token)
            .ok_or(QueueError::UnknownPlaceholder(token))?;

        if self.retired_order.len() >= RETIRED_CAPACITY {
            if let Some(oldest) = self.retired_order.pop_front() {
                self.retired.remove(&oldest);
            }
        }
        self.retired.insert(token, value);
        self.retired_order.push_back(token);
        self.resolved.insert(token);
        Ok(entry.referrers)
    }

    /// `op` no longer waits on any of `refs`.
    pub(crate) fn release(&mut self, op: OperationId, refs: &BTreeSet<PlaceholderToken>) {
        for token in refs {
            let drop_entry = match self.entries.get_mut(token) {
                Some(entry) => {
                    entry.referrers.remove(&op);
                    entry.slot == Slot::Orphaned && entry.referrers.is_empty()
                }
                None => false,
            };
            if drop_entry {
                self.entries.remove(token);
            }
        }
    }

    /// The producer of `tokens` failed permanently.
    pub(crate) fn orphan(&mut self, tokens: impl IntoIterator<Item = PlaceholderToken>) {
        for token in tokens {
            let drop_entry = match self.entries.get_mut(&token) {
                Some(entry) => {
                    entry.slot = Slot::Orphaned;
                    entry.referrers.is_empty()
                }
                None => false,
            };
            if drop_entry {
                self.entries.remove(&token);
            }
        }
    }

    pub(crate) fn resolved_value(&self, token: &PlaceholderToken) -> Option<Value> {
        self.retired.get(token).cloned()
    }

    pub(crate) fn is_pending(&self, token: &PlaceholderToken) -> bool {
        self.entries.contains_key(token)
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.entries.len()
    }
}

/// Process-wide placeholder registry.
#[derive(Debug, Default)]
pub struct PlaceholderRegistry {
    inner: Mutex<PlaceholderTable>,
}

impl PlaceholderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PlaceholderTable> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate a token resolved later by the application itself.
    pub fn allocate(&self) -> PlaceholderToken {
        self.lock().allocate(None)
    }

    pub fn resolved_value(&self, token: &PlaceholderToken) -> Option<Value> {
        self.lock().resolved_value(token)
    }

    pub fn is_pending(&self, token: &PlaceholderToken) -> bool {
        self.lock().is_pending(token)
    }

    /// Number of tokens still tracked as unresolved.
    pub fn pending_len(&self) -> usize {
        self.lock().pending_len()
    }

    /// Replace embedded tokens by their resolved values (one level).
    pub fn dehydrate(&self, value: &Value) -> Value {
        let table = self.lock();
        dehydrate_with(value, &|t: &PlaceholderToken| table.resolved_value(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn resolves_exactly_once() {
        let mut table = PlaceholderTable::default();
        let producer = OperationId::new();
        let waiter = OperationId::new();
        let t = table.allocate(Some(producer));

        assert!(table.bind(waiter, &BTreeSet::from([t])).is_empty());
        assert_eq!(table.begin_resolve(t, json!(1)).unwrap(), BTreeSet::from([waiter]));
        assert_eq!(table.begin_resolve(t, json!(2)), Err(QueueError::AlreadyResolved(t)));
        assert_eq!(table.resolved_value(&t), Some(json!(1)));
        assert!(!table.is_pending(&t));
    }

    #[test]
    fn late_binding_sees_resolved_value() {
        let mut table = PlaceholderTable::default();
        let t = table.allocate(None);
        table.begin_resolve(t, json!("srv-1")).unwrap();

        let op = OperationId::new();
        let refs = BTreeSet::from([t]);
        assert_eq!(table.resolved_among(&refs).unwrap(), vec![(t, json!("srv-1"))]);
        assert_eq!(table.bind(op, &refs), vec![(t, json!("srv-1"))]);
        assert_eq!(table.pending_len(), 0);
    }

    #[test]
    fn orphaned_tokens_are_collected_when_unreferenced() {
        let mut table = PlaceholderTable::default();
        let producer = OperationId::new();
        let waiter = OperationId::new();
        let t = table.allocate(Some(producer));
        table.bind(waiter, &BTreeSet::from([t]));

        table.orphan([t]);
        assert!(table.is_pending(&t));

        table.release(waiter, &BTreeSet::from([t]));
        assert!(!table.is_pending(&t));
        assert_eq!(table.begin_resolve(t, json!(0)), Err(QueueError::UnknownPlaceholder(t)));
    }

    #[test]
    fn unknown_reference_becomes_orphan() {
        let mut table = PlaceholderTable::default();
        let stray = PlaceholderToken::new();
        let op = OperationId::new();

        table.bind(op, &BTreeSet::from([stray]));
        assert!(table.is_pending(&stray));
        assert_eq!(table.begin_resolve(stray, json!(5)).unwrap(), BTreeSet::from([op]));
    }

    #[test]
    fn retired_values_are_bounded() {
        let mut table = PlaceholderTable::default();
        let first = table.allocate(None);
        table.begin_resolve(first, json!(0)).unwrap();
        for n in 0..RETIRED_CAPACITY {
            let t = table.allocate(None);
            table.begin_resolve(t, json!(n)).unwrap();
        }
        assert_eq!(table.resolved_value(&first), None);
        assert_eq!(table.retired.len(), RETIRED_CAPACITY);
    }

    #[test]
    fn evicted_tokens_still_refuse_a_second_resolution() {
        let mut table = PlaceholderTable::default();
        let first = table.allocate(None);
        table.begin_resolve(first, json!("srv-1")).unwrap();
        for n in 0..RETIRED_CAPACITY {
            let t = table.allocate(None);
            table.begin_resolve(t, json!(n)).unwrap();
        }

        assert_eq!(table.begin_resolve(first, json!("srv-2")), Err(QueueError::AlreadyResolved(first)));
        assert_eq!(
            table.resolved_among(&BTreeSet::from([first])),
            Err(QueueError::PlaceholderExpired(first))
        );

        // A late reference is neither substituted nor kept as an orphan.
        let op = OperationId::new();
        assert!(table.bind(op, &BTreeSet::from([first])).is_empty());
        assert!(!table.is_pending(&first));
        table.register(first, None);
        assert!(!table.is_pending(&first));
    }

    #[test]
    fn dehydrate_uses_resolved_values() {
        let registry = PlaceholderRegistry::new();
        let done = registry.allocate();
        let open = registry.allocate();
        registry.lock().begin_resolve(done, json!(10)).unwrap();

        let value = json!({"a": done.to_value(), "b": open.to_value()});
        assert_eq!(registry.dehydrate(&value), json!({"a": 10, "b": open.to_value()}));
    }

    proptest! {
        #[test]
        fn every_waiter_is_handed_back_once(waiters in proptest::collection::vec(0usize..4, 1..12)) {
            let mut table = PlaceholderTable::default();
            let tokens: Vec<_> = (0..4).map(|_| table.allocate(None)).collect();
            let mut expected: Vec<BTreeSet<OperationId>> = vec![BTreeSet::new(); tokens.len()];
            for pick in waiters {
                let op = OperationId::new();
                table.bind(op, &BTreeSet::from([tokens[pick]]));
                expected[pick].insert(op);
            }

            for (token, want) in tokens.iter().zip(expected) {
                prop_assert_eq!(table.begin_resolve(*token, json!(1)).unwrap(), want);
                prop_assert_eq!(
                    table.begin_resolve(*token, json!(2)),
                    Err(QueueError::AlreadyResolved(*token))
                );
            }
            prop_assert_eq!(table.pending_len(), 0);
        }
    }
}
