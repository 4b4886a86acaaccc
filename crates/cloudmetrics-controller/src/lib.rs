//! Declaration reconciliation for the cloudmetrics adapter
//!
//! The [`Reconciler`] is the cache's only writer. It consumes
//! [`StoreEvent`]s from a [`DeclarationStore`], derives a cache entry per
//! declaration with [`derive_entry`], and keeps track of which key each
//! declaration last wrote.

#![deny(missing_docs)]

mod derive;
mod reconciler;
mod store;

pub use derive::derive_entry;
pub use reconciler::{ApplyOutcome, ChangeKind, Notification, ReconcileStats, Reconciler};
pub use store::{list_with_backoff, DeclarationStore, KubeDeclarationStore, ListBackoff, StoreEvent};

#[cfg(test)]
pub use store::MockDeclarationStore;
