//! Resumable per-(mailbox, folder) synchronization
//!
//! Initial backfill runs in bounded ascending batches with a checkpoint
//! after every batch, so a crash resumes from the next batch. Incremental
//! catch-up fetches everything above the checkpoint in one streamed
//! request. Live tailing is driven by the supervisor, which calls back
//! into `catch_up` on every wake-up.

use crate::error::{MailError, MailResult};
use crate::imap::{FetchedMessage, SessionClient};
use crate::inbound::InboundProcessor;
use crate::models::{FolderSyncState, Mailbox};
use crate::repository::Repositories;
use crate::status::{FolderHealth, StatusRegistry};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Initial backfill batch size
pub const BATCH_SIZE: usize = 20;
/// Hard cap on messages considered during initial backfill
pub const MAX_TOTAL: usize = 50_000;
/// Concurrent normalization workers per batch
const BATCH_WORKERS: usize = BATCH_SIZE / 2;
/// Pause between backfill batches to avoid server throttling
const BATCH_PAUSE: Duration = Duration::from_secs(1);

/// Per-folder synchronizer shared by all supervisors of one process
#[derive(Clone)]
pub struct FolderSynchronizer {
    repos: Repositories,
    processor: InboundProcessor,
    registry: StatusRegistry,
}

impl FolderSynchronizer {
    pub fn new(
        repos: Repositories,
        processor: InboundProcessor,
        registry: StatusRegistry,
    ) -> Self {
        Self {
            repos,
            processor,
            registry,
        }
    }

    /// Bring one folder up to date. Returns how many new messages were
    /// ingested; the caller uses that for staleness tracking.
    pub async fn catch_up(
        &self,
        client: &mut SessionClient,
        mailbox: &Mailbox,
        folder: &str,
        cancel: &CancellationToken,
    ) -> MailResult<usize> {
        let status = client.select(folder).await?;

        let mut state = self
            .repos
            .sync_states
            .get(&mailbox.id, folder)
            .await?
            .unwrap_or_else(|| FolderSyncState::new(&mailbox.id, folder));

        // UID space is only valid within one UIDVALIDITY generation
        if let (Some(seen), Some(current)) = (state.uid_validity, status.uid_validity) {
            if seen != current {
                warn!(
                    mailbox_id = %mailbox.id,
                    folder,
                    old = seen,
                    new = current,
                    "UIDVALIDITY changed, restarting initial sync"
                );
                state.last_uid = 0;
            }
        }
        state.uid_validity = status.uid_validity;

        let ingested = if state.last_uid == 0 {
            self.initial_sync(client, mailbox, folder, &mut state, cancel)
                .await?
        } else {
            self.incremental_sync(client, mailbox, folder, &mut state, cancel)
                .await?
        };

        self.registry
            .set_folder(
                &mailbox.id,
                folder,
                FolderHealth {
                    total: status.exists,
                    unseen: status.unseen.unwrap_or(0),
                    last_seen_uid: state.last_uid,
                    last_sync: Some(Utc::now()),
                },
            )
            .await;

        Ok(ingested)
    }

    /// Full backfill in ascending UID batches with a checkpoint per batch
    async fn initial_sync(
        &self,
        client: &mut SessionClient,
        mailbox: &Mailbox,
        folder: &str,
        state: &mut FolderSyncState,
        cancel: &CancellationToken,
    ) -> MailResult<usize> {
        let mut uids = client.uid_search("ALL").await?;
        if uids.is_empty() {
            // Empty folder: the checkpoint stays at 0 and tailing begins
            state.last_synced_at = Some(Utc::now());
            self.repos.sync_states.save(state).await?;
            info!(mailbox_id = %mailbox.id, folder, "initial sync of empty folder complete");
            return Ok(0);
        }

        if uids.len() > MAX_TOTAL {
            warn!(
                mailbox_id = %mailbox.id,
                folder,
                found = uids.len(),
                cap = MAX_TOTAL,
                "folder exceeds backfill cap, truncating to oldest messages"
            );
            uids.truncate(MAX_TOTAL);
        }

        info!(
            mailbox_id = %mailbox.id,
            folder,
            messages = uids.len(),
            "starting initial backfill"
        );

        let mut ingested = 0;
        let batches = uids.chunks(BATCH_SIZE).count();
        for (index, batch) in uids.chunks(BATCH_SIZE).enumerate() {
            if cancel.is_cancelled() {
                debug!(mailbox_id = %mailbox.id, folder, "backfill cancelled between batches");
                return Ok(ingested);
            }

            let messages = client.uid_fetch(&uid_set_expression(batch)).await?;
            ingested += self
                .process_batch(mailbox, folder, messages)
                .await?;

            // Checkpoint only after every worker in the batch finished
            state.last_uid = batch.iter().copied().max().unwrap_or(state.last_uid);
            state.last_synced_at = Some(Utc::now());
            self.repos.sync_states.save(state).await?;

            debug!(
                mailbox_id = %mailbox.id,
                folder,
                batch = index + 1,
                batches,
                last_uid = state.last_uid,
                "backfill batch checkpointed"
            );

            if index + 1 < batches {
                tokio::select! {
                    _ = tokio::time::sleep(BATCH_PAUSE) => {}
                    _ = cancel.cancelled() => return Ok(ingested),
                }
            }
        }

        info!(
            mailbox_id = %mailbox.id,
            folder,
            ingested,
            last_uid = state.last_uid,
            "initial backfill complete"
        );
        Ok(ingested)
    }

    /// Fetch everything above the checkpoint in one streamed request
    async fn incremental_sync(
        &self,
        client: &mut SessionClient,
        mailbox: &Mailbox,
        folder: &str,
        state: &mut FolderSyncState,
        cancel: &CancellationToken,
    ) -> MailResult<usize> {
        let criteria = format!("UID {}:*", state.last_uid.saturating_add(1));
        let uids: Vec<u32> = client
            .uid_search(&criteria)
            .await?
            .into_iter()
            // A range whose start exceeds the highest UID still returns
            // the last message; filter it out.
            .filter(|uid| *uid > state.last_uid)
            .collect();

        if uids.is_empty() {
            state.last_synced_at = Some(Utc::now());
            self.repos.sync_states.save(state).await?;
            return Ok(0);
        }

        debug!(
            mailbox_id = %mailbox.id,
            folder,
            new = uids.len(),
            "incremental catch-up"
        );

        let messages = client.uid_fetch(&uid_set_expression(&uids)).await?;

        let mut ingested = 0;
        for chunk in messages.chunks(BATCH_SIZE) {
            if cancel.is_cancelled() {
                break;
            }
            ingested += self.process_batch(mailbox, folder, chunk.to_vec()).await?;
            state.last_uid = chunk
                .iter()
                .map(|m| m.uid)
                .max()
                .unwrap_or(state.last_uid)
                .max(state.last_uid);
            state.last_synced_at = Some(Utc::now());
            self.repos.sync_states.save(state).await?;
        }

        Ok(ingested)
    }

    /// Run normalization workers for one batch, bounded by a semaphore.
    /// Single-message failures are quarantined (logged, batch continues);
    /// a worker panic fails the whole batch so the checkpoint does not
    /// advance past it.
    async fn process_batch(
        &self,
        mailbox: &Mailbox,
        folder: &str,
        messages: Vec<FetchedMessage>,
    ) -> MailResult<usize> {
        if messages.is_empty() {
            return Ok(0);
        }

        let semaphore = Arc::new(Semaphore::new(BATCH_WORKERS));
        let mut handles = Vec::with_capacity(messages.len());

        // Spawn in server order (ascending UID)
        for message in messages {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| MailError::internal("batch semaphore closed"))?;
            let processor = self.processor.clone();
            let mailbox = mailbox.clone();
            let folder = folder.to_string();

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let uid = message.uid;
                (uid, processor.process(&mailbox, &folder, &message).await)
            }));
        }

        let mut ingested = 0;
        for handle in handles {
            match handle.await {
                Ok((_, Ok(outcome))) => {
                    if outcome.created {
                        ingested += 1;
                    }
                }
                Ok((uid, Err(e))) => {
                    // Quarantine: the message is skipped, the batch goes on
                    warn!(
                        mailbox_id = %mailbox.id,
                        folder,
                        uid,
                        error = %e,
                        kind = e.kind().as_str(),
                        "failed to process message, quarantined"
                    );
                }
                Err(join_error) => {
                    return Err(MailError::internal(format!(
                        "normalization worker panicked: {}",
                        join_error
                    )));
                }
            }
        }

        Ok(ingested)
    }
}

/// Compact UID set expression: consecutive runs become ranges
fn uid_set_expression(uids: &[u32]) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut run_start: Option<(u32, u32)> = None;

    for &uid in uids {
        run_start = match run_start {
            None => Some((uid, uid)),
            Some((start, end)) if uid == end + 1 => Some((start, uid)),
            Some((start, end)) => {
                parts.push(format_run(start, end));
                Some((uid, uid))
            }
        };
    }
    if let Some((start, end)) = run_start {
        parts.push(format_run(start, end));
    }

    parts.join(",")
}

fn format_run(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{}:{}", start, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_set_expression_collapses_runs() {
        assert_eq!(uid_set_expression(&[1, 2, 3, 4]), "1:4");
        assert_eq!(uid_set_expression(&[1, 3, 5]), "1,3,5");
        assert_eq!(uid_set_expression(&[1, 2, 3, 7, 9, 10]), "1:3,7,9:10");
        assert_eq!(uid_set_expression(&[42]), "42");
        assert_eq!(uid_set_expression(&[]), "");
    }

    #[test]
    fn test_batch_workers_are_half_the_batch() {
        assert_eq!(BATCH_WORKERS, BATCH_SIZE / 2);
    }
}
