//! Age-based pruning of long-term summaries
//!
//! A pass scans a snapshot, collects ids, then deletes them in one call. A
//! document promoted after the snapshot is never touched by that pass.
//! Nothing here owns a timer; callers trigger passes.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::long_term::{SummaryDocument, CREATED_AT, LAST_ACCESSED_AT};
use crate::storage::DocumentStore;

/// What a pruning pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub scanned: usize,
    pub deleted: usize,
    /// Documents kept because their timestamp could not be parsed
    pub malformed: usize,
}

/// Delete summaries whose `created_at` is older than `cutoff_age`
///
/// Returns the number of documents deleted.
pub async fn prune_older_than(
    store: &dyn DocumentStore,
    cutoff_age: chrono::Duration,
    now: DateTime<Utc>,
) -> Result<usize> {
    let report = prune_by(store, cutoff(now, cutoff_age), |doc| {
        doc.created_at().map(|ts| (CREATED_AT, ts))
    })
    .await?;
    Ok(report.deleted)
}

/// Delete summaries not accessed for `max_idle`
///
/// Documents that were never accessed are judged by `created_at`.
pub async fn prune_idle(
    store: &dyn DocumentStore,
    max_idle: chrono::Duration,
    now: DateTime<Utc>,
) -> Result<PruneReport> {
    prune_by(store, cutoff(now, max_idle), |doc| {
        doc.timestamp(LAST_ACCESSED_AT)
            .map(|ts| (LAST_ACCESSED_AT, ts))
            .or_else(|| doc.created_at().map(|ts| (CREATED_AT, ts)))
    })
    .await
}

/// Oldest instant still kept. An age reaching past the representable range
/// keeps everything.
fn cutoff(now: DateTime<Utc>, age: chrono::Duration) -> DateTime<Utc> {
    now.checked_sub_signed(age).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

type Stamp = (&'static str, std::result::Result<DateTime<Utc>, String>);

async fn prune_by(
    store: &dyn DocumentStore,
    cutoff: DateTime<Utc>,
    stamp: impl Fn(&SummaryDocument) -> Option<Stamp>,
) -> Result<PruneReport> {
    let docs = store.all_documents().await?;
    let mut report = PruneReport {
        scanned: docs.len(),
        ..Default::default()
    };

    let mut to_delete = Vec::new();
    for doc in &docs {
        match stamp(doc) {
            // No timestamp at all: nothing to judge age by
            None => continue,
            Some((field, Err(value))) => {
                let err = Error::MalformedTimestamp {
                    id: doc.id.clone(),
                    value,
                };
                tracing::warn!(field, error = %err, "retaining document with malformed timestamp");
                report.malformed += 1;
            }
            Some((_, Ok(at))) if at < cutoff => to_delete.push(doc.id.clone()),
            Some(_) => {}
        }
    }

    if !to_delete.is_empty() {
        report.deleted = store.delete(&to_delete).await?;
    }

    Ok(report)
}

/// Serializes periodic pruning passes over one document store
///
/// Overlapping triggers never run two passes at once; the later trigger is
/// skipped.
#[derive(Clone)]
pub struct PruningScheduler {
    store: Arc<dyn DocumentStore>,
    cutoff_age: chrono::Duration,
    pass: Arc<Mutex<()>>,
}

impl PruningScheduler {
    pub fn new(store: Arc<dyn DocumentStore>, cutoff_age: chrono::Duration) -> Self {
        Self {
            store,
            cutoff_age,
            pass: Arc::new(Mutex::new(())),
        }
    }

    pub fn cutoff_age(&self) -> chrono::Duration {
        self.cutoff_age
    }

    /// Run one pass. `None` if another pass is still running.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> Result<Option<PruneReport>> {
        let Ok(_guard) = self.pass.try_lock() else {
            tracing::debug!("pruning pass already running, skipping");
            return Ok(None);
        };

        let report = prune_by(self.store.as_ref(), cutoff(now, self.cutoff_age), |doc| {
            doc.created_at().map(|ts| (CREATED_AT, ts))
        })
        .await?;

        tracing::info!(
            scanned = report.scanned,
            deleted = report.deleted,
            malformed = report.malformed,
            "pruning pass finished"
        );
        Ok(Some(report))
    }
}
