//! Boot-time recovery: repair partial writes left by a crashed `create`.

use futures::StreamExt;

use crate::model::{Node, Walk};
use crate::store::contract::RecoveryReport;
use crate::store::error::StoreError;

use super::backend::BlobBackend;
use super::entry::PlanEntry;
use super::layout::{action_path, block_path, checks_path, candidate_containers, plans_prefix, sequence_path};

/// Scan every container in the retention window for `*-entry.json` blobs
/// and repair partial writes:
///
/// - entry without object ⇒ the writer crashed mid-`create`; delete the
///   orphan entry so reads return not-found.
/// - entry with object ⇒ the plan is complete on disk; verify every
///   sub-object blob the entry (transitively) references exists, and
///   recreate any that are missing from the object blob's embedded tree.
pub async fn run(backend: &BlobBackend) -> Result<RecoveryReport, StoreError> {
    let mut report = RecoveryReport::default();
    let today = chrono::Utc::now().date_naive();
    let containers = candidate_containers(&backend.config.prefix, today, backend.config.retention_days);

    for container in containers {
        let prefix = plans_prefix(&container);
        let mut listing = backend.object_store.list(Some(&prefix));

        let mut entry_ids = Vec::new();
        while let Some(meta) = listing.next().await {
            let meta = meta.map_err(|e| StoreError::StorageGet(format!("list {prefix}: {e}")))?;
            if meta.location.as_ref().ends_with("-entry.json") {
                entry_ids.push(meta.location);
            }
        }

        for path in entry_ids {
            let entry: PlanEntry = match backend.get_json(&path).await {
                Ok(e) => e,
                Err(StoreError::NotFound(_)) => continue, // raced with a concurrent delete
                Err(e) => return Err(e),
            };

            match backend.read_object(entry.plan_id).await {
                Ok(plan) => {
                    for item in Walk::new(&plan) {
                        let recreated = match item.value {
                            Node::Checks(c) => {
                                recreate_if_missing(backend, &checks_path(&container, entry.plan_id, c.id), || {
                                    serde_json::to_value(super::entry::ChecksEntry::from_checks(c))
                                })
                                .await?
                            }
                            Node::Sequence(s) => {
                                recreate_if_missing(backend, &sequence_path(&container, entry.plan_id, s.id), || {
                                    serde_json::to_value(super::entry::SequenceEntry::from_sequence(s))
                                })
                                .await?
                            }
                            Node::Block(b) => {
                                recreate_if_missing(backend, &block_path(&container, entry.plan_id, b.id), || {
                                    serde_json::to_value(super::entry::BlockEntry::from_block(b))
                                })
                                .await?
                            }
                            Node::Action(a) => {
                                recreate_if_missing(backend, &action_path(&container, entry.plan_id, a.id), || {
                                    serde_json::to_value(a)
                                })
                                .await?
                            }
                            Node::Plan(_) => false,
                        };
                        if recreated {
                            report.sub_objects_recreated += 1;
                        }
                    }
                }
                Err(StoreError::NotFound(_)) => {
                    backend.try_delete(&path).await?;
                    report.orphan_entries_deleted += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    Ok(report)
}

async fn recreate_if_missing(
    backend: &BlobBackend,
    path: &object_store::path::Path,
    to_value: impl FnOnce() -> Result<serde_json::Value, serde_json::Error>,
) -> Result<bool, StoreError> {
    if backend.exists(path).await? {
        return Ok(false);
    }
    let value = to_value().map_err(|e| StoreError::StoragePut(format!("encode {path}: {e}")))?;
    backend.put_json(path, &value).await?;
    Ok(true)
}
