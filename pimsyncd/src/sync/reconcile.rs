use std::collections::HashMap;

use pimsync_store::{LocalItem, RemoteRecord};

#[derive(Debug, Default)]
pub struct ReconcilePlan {
    pub to_insert: Vec<LocalItem>,
    pub to_update: Vec<LocalItem>,
    pub to_delete: Vec<RemoteRecord>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.to_insert.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }
}

/// Diffs a local snapshot against the remote one. Timestamps are compared
/// at the store's second resolution, so a local item is only "newer" once
/// its downsampled clock actually passes the remote value. Remote records
/// matching no local identifier are scheduled for deletion.
///
/// Pure and order-independent; the caller owns fetching both snapshots and
/// must apply nothing if either fetch failed.
pub fn reconcile(local: &[LocalItem], remote: Vec<RemoteRecord>) -> ReconcilePlan {
    let mut remote_by_id: HashMap<String, RemoteRecord> = remote
        .into_iter()
        .map(|record| (record.identifier.clone(), record))
        .collect();

    let mut plan = ReconcilePlan::default();
    for item in local {
        match remote_by_id.remove(&item.identifier) {
            None => plan.to_insert.push(item.clone()),
            Some(record) => {
                if item.modified_secs() > record.last_modified_remote {
                    plan.to_update.push(item.clone());
                }
            }
        }
    }

    let mut leftovers: Vec<RemoteRecord> = remote_by_id.into_values().collect();
    leftovers.sort_by(|a, b| a.identifier.cmp(&b.identifier));
    plan.to_delete = leftovers;
    plan
}
