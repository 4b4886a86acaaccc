//! Reconciler: drives the metric cache from declaration change events

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cloudmetrics_cache::{CacheKey, MetricCache};
use cloudmetrics_common::metrics;
use cloudmetrics_common::{ChangeToken, Declaration, DeclarationId, DeclarationKind};
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::derive::derive_entry;
use crate::store::StoreEvent;

/// What happened to a declaration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    /// First time this declaration is seen
    Added,
    /// A newer version of a known declaration
    Updated,
    /// The declaration was deleted
    Deleted,
}

/// One change event from the declaration store
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    /// Event kind
    pub kind: ChangeKind,
    /// Declaration snapshot (last known state for deletes)
    pub declaration: Declaration,
}

impl Notification {
    /// Build a notification
    pub fn new(kind: ChangeKind, declaration: Declaration) -> Self {
        Self { kind, declaration }
    }
}

/// Result of applying one notification
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The cache changed
    Written,
    /// Re-delivery of what the cache already holds
    Unchanged,
    /// Older than what was already applied; ignored
    Stale,
    /// Failed validation; previous cache state kept
    Rejected,
    /// Entry removed
    Removed,
    /// Delete for something the cache does not hold
    NotPresent,
}

/// Counters for reconciler activity
///
/// Shared with whoever wants to read them; only the reconciler writes.
#[derive(Debug, Default)]
pub struct ReconcileStats {
    written: AtomicU64,
    unchanged: AtomicU64,
    stale: AtomicU64,
    rejected: AtomicU64,
    removed: AtomicU64,
}

impl ReconcileStats {
    /// Notifications that changed the cache by upsert
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Notifications that matched what the cache already held
    pub fn unchanged(&self) -> u64 {
        self.unchanged.load(Ordering::Relaxed)
    }

    /// Notifications ignored as older than the applied state
    pub fn stale(&self) -> u64 {
        self.stale.load(Ordering::Relaxed)
    }

    /// Distinct declaration versions rejected by validation
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Entries removed
    pub fn removed(&self) -> u64 {
        self.removed.load(Ordering::Relaxed)
    }

    fn record(&self, outcome: ApplyOutcome) {
        let counter = match outcome {
            ApplyOutcome::Written => &self.written,
            ApplyOutcome::Unchanged => &self.unchanged,
            ApplyOutcome::Stale => &self.stale,
            ApplyOutcome::Rejected => &self.rejected,
            ApplyOutcome::Removed => &self.removed,
            ApplyOutcome::NotPresent => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Last applied state of one declaration
#[derive(Clone, Debug)]
struct Applied {
    key: CacheKey,
    token: ChangeToken,
}

/// Single writer of the metric cache
pub struct Reconciler {
    cache: Arc<MetricCache>,
    applied: HashMap<DeclarationId, Applied>,
    /// Versions already reported as invalid, so re-deliveries are not
    /// counted twice
    rejected: HashMap<DeclarationId, ChangeToken>,
    /// Same for declarations that have no identity to key on
    rejected_anonymous: HashSet<(DeclarationKind, ChangeToken)>,
    stats: Arc<ReconcileStats>,
}

impl Reconciler {
    /// Create a reconciler writing into `cache`
    pub fn new(cache: Arc<MetricCache>) -> Self {
        Self {
            cache,
            applied: HashMap::new(),
            rejected: HashMap::new(),
            rejected_anonymous: HashSet::new(),
            stats: Arc::new(ReconcileStats::default()),
        }
    }

    /// Activity counters
    pub fn stats(&self) -> Arc<ReconcileStats> {
        Arc::clone(&self.stats)
    }

    /// Load the full declared state before any query is served
    pub fn initial_sync(&mut self, declarations: Vec<Declaration>) {
        let total = declarations.len();
        let loaded = declarations
            .iter()
            .map(|d| {
                let outcome = self.upsert(d);
                self.stats.record(outcome);
                outcome
            })
            .filter(|o| matches!(o, ApplyOutcome::Written | ApplyOutcome::Unchanged))
            .count();
        info!(
            declarations = total,
            loaded,
            rejected = total - loaded,
            entries = self.cache.len(),
            "Initial declaration sync complete"
        );
    }

    /// Apply one change notification
    pub fn apply(&mut self, notification: Notification) -> ApplyOutcome {
        let outcome = match notification.kind {
            ChangeKind::Added | ChangeKind::Updated => self.upsert(&notification.declaration),
            ChangeKind::Deleted => self.delete(&notification.declaration),
        };
        self.stats.record(outcome);
        outcome
    }

    /// Full resync for one kind
    ///
    /// Every listed declaration is upserted; every known declaration of
    /// `kind` missing from the list is deleted.
    pub fn resync(&mut self, kind: DeclarationKind, declarations: Vec<Declaration>) {
        let mut listed = HashSet::new();
        for declaration in &declarations {
            if let Ok(id) = declaration.id() {
                listed.insert(id);
            }
            let outcome = self.upsert(declaration);
            self.stats.record(outcome);
        }

        let gone: Vec<DeclarationId> = self
            .applied
            .keys()
            .filter(|id| id.kind == kind && !listed.contains(*id))
            .cloned()
            .collect();
        for id in &gone {
            let outcome = self.forget(id);
            self.stats.record(outcome);
        }
        self.rejected
            .retain(|id, _| id.kind != kind || listed.contains(id));

        debug!(
            kind = %kind,
            listed = declarations.len(),
            removed = gone.len(),
            "Declaration resync applied"
        );
    }

    /// Consume store events until the stream ends or `cancel` fires
    pub async fn run<S>(mut self, events: S, cancel: CancellationToken)
    where
        S: Stream<Item = StoreEvent> + Send,
    {
        let mut events = std::pin::pin!(events);
        info!("Reconciler started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Reconciler shutting down");
                    break;
                }
                event = events.next() => match event {
                    Some(StoreEvent::Changed(notification)) => {
                        self.apply(notification);
                    }
                    Some(StoreEvent::Listed { kind, declarations }) => {
                        self.resync(kind, declarations);
                    }
                    None => {
                        warn!("Declaration event stream ended");
                        break;
                    }
                }
            }
        }
    }

    fn upsert(&mut self, declaration: &Declaration) -> ApplyOutcome {
        let id = match declaration.id() {
            Ok(id) => id,
            Err(e) => {
                let seen = (declaration.kind(), declaration.token().clone());
                if !self.rejected_anonymous.insert(seen) {
                    return ApplyOutcome::Unchanged;
                }
                warn!(error = %e, "Ignoring declaration without identity");
                metrics::record_declaration_error(declaration.kind().as_str());
                return ApplyOutcome::Rejected;
            }
        };
        let token = declaration.token();

        let newer_seen = self
            .applied
            .get(&id)
            .map(|a| &a.token)
            .into_iter()
            .chain(self.rejected.get(&id))
            .any(|seen| token.is_older_than(seen));
        if newer_seen {
            debug!(declaration = %id, generation = ?token.generation, "Ignoring stale declaration");
            return ApplyOutcome::Stale;
        }

        let entry = match derive_entry(declaration) {
            Ok(entry) => entry,
            Err(e) => {
                if self.rejected.get(&id) == Some(token) {
                    return ApplyOutcome::Unchanged;
                }
                warn!(
                    declaration = %id,
                    field = e.field().unwrap_or_default(),
                    error = %e,
                    "Declaration rejected; keeping previous cache state"
                );
                metrics::record_declaration_error(id.kind.as_str());
                self.rejected.insert(id, token.clone());
                return ApplyOutcome::Rejected;
            }
        };
        self.rejected.remove(&id);

        let key = entry.key.clone();
        if let Some(previous) = self.applied.get(&id) {
            if previous.key != key && self.cache.remove_owned(&previous.key, &id) {
                info!(declaration = %id, from = %previous.key, to = %key, "Declaration moved to a new key");
            }
        }

        let written = self.cache.upsert(entry);
        if written {
            info!(declaration = %id, key = %key, "Cache entry written");
        }
        self.applied.insert(
            id,
            Applied {
                key,
                token: token.clone(),
            },
        );

        if written {
            ApplyOutcome::Written
        } else {
            ApplyOutcome::Unchanged
        }
    }

    fn delete(&mut self, declaration: &Declaration) -> ApplyOutcome {
        let id = match declaration.id() {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Ignoring delete for declaration without identity");
                return ApplyOutcome::NotPresent;
            }
        };

        // a delete of an earlier incarnation must not remove the recreated object's entry
        if let Some(applied) = self.applied.get(&id) {
            let token = declaration.token();
            if matches!((&token.uid, &applied.token.uid), (Some(a), Some(b)) if a != b) {
                debug!(declaration = %id, "Ignoring delete of a previous incarnation");
                return ApplyOutcome::Stale;
            }
        }

        self.rejected.remove(&id);
        if self.applied.contains_key(&id) {
            return self.forget(&id);
        }

        // never applied here; the key may still be derivable
        match derive_entry(declaration) {
            Ok(entry) if self.cache.remove_owned(&entry.key, &id) => {
                info!(declaration = %id, key = %entry.key, "Cache entry removed");
                ApplyOutcome::Removed
            }
            _ => ApplyOutcome::NotPresent,
        }
    }

    fn forget(&mut self, id: &DeclarationId) -> ApplyOutcome {
        let Some(applied) = self.applied.remove(id) else {
            return ApplyOutcome::NotPresent;
        };
        if self.cache.remove_owned(&applied.key, id) {
            info!(declaration = %id, key = %applied.key, "Cache entry removed");
            ApplyOutcome::Removed
        } else {
            debug!(declaration = %id, key = %applied.key, "Key already taken over by another declaration");
            ApplyOutcome::NotPresent
        }
    }
}
