//! Per-mailbox connection supervision
//!
//! One long-lived task per configured mailbox owns that mailbox's IMAP
//! session outright: connect, sync folders sequentially, tail, and
//! reconnect with backoff. Nothing else ever issues commands on the
//! session, and the supervisor is the only writer of the mailbox's
//! connection-status fields.

use crate::config::SyncConfig;
use crate::error::{ErrorKind, MailError, MailResult};
use crate::imap::{IdleOutcome, SessionClient};
use crate::models::{ConnectionStatus, Mailbox};
use crate::repository::Repositories;
use crate::status::StatusRegistry;
use crate::sync::backoff::Backoff;
use crate::sync::folder::FolderSynchronizer;
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Auth failures tolerated before the mailbox is disabled
const MAX_AUTH_ATTEMPTS: u32 = 10;
/// Command deadline while shutting down
const SHUTDOWN_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a session loop iteration ended
enum SessionEnd {
    /// Root cancellation; stop supervising
    Stopped,
    /// Error classified for the retry policy
    Failed(MailError),
}

/// Supervisor for a single mailbox
pub struct MailboxSupervisor {
    mailbox: Mailbox,
    repos: Repositories,
    synchronizer: FolderSynchronizer,
    registry: StatusRegistry,
    config: SyncConfig,
    cancel: CancellationToken,
}

impl MailboxSupervisor {
    pub fn new(
        mailbox: Mailbox,
        repos: Repositories,
        synchronizer: FolderSynchronizer,
        registry: StatusRegistry,
        config: SyncConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            mailbox,
            repos,
            synchronizer,
            registry,
            config,
            cancel,
        }
    }

    /// Run until cancelled or fatally failed
    pub async fn run(mut self) {
        let mut backoff = Backoff::new();
        let mut auth_failures: u32 = 0;

        info!(mailbox_id = %self.mailbox.id, address = %self.mailbox.email_address, "supervisor started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.publish_status(ConnectionStatus::Connecting, None).await;

            let delay = match SessionClient::connect(&self.mailbox.imap, &self.config).await {
                Ok(mut client) => {
                    backoff.reset();
                    auth_failures = 0;
                    self.publish_status(ConnectionStatus::Connected, None).await;

                    match self.run_session(&mut client).await {
                        SessionEnd::Stopped => {
                            self.shutdown_session(client).await;
                            break;
                        }
                        SessionEnd::Failed(e) => {
                            self.publish_status(
                                ConnectionStatus::Disconnected,
                                Some(e.to_string()),
                            )
                            .await;
                            drop(client);

                            if e.is_fatal() {
                                auth_failures += 1;
                                if auth_failures >= MAX_AUTH_ATTEMPTS {
                                    self.disable(&e).await;
                                    break;
                                }
                                backoff.next_delay()
                            } else {
                                // Transient in-session errors retry quickly
                                Backoff::folder_retry()
                            }
                        }
                    }
                }
                Err(e) => {
                    self.publish_status(ConnectionStatus::Disconnected, Some(e.to_string()))
                        .await;

                    if e.is_fatal() {
                        auth_failures += 1;
                        error!(
                            mailbox_id = %self.mailbox.id,
                            attempt = auth_failures,
                            error = %e,
                            "authentication failed"
                        );
                        if auth_failures >= MAX_AUTH_ATTEMPTS {
                            self.disable(&e).await;
                            break;
                        }
                    } else {
                        warn!(mailbox_id = %self.mailbox.id, error = %e, "connect failed");
                    }
                    backoff.next_delay()
                }
            };

            self.publish_status(ConnectionStatus::Reconnecting, None).await;
            debug!(mailbox_id = %self.mailbox.id, delay_ms = delay.as_millis() as u64, "backing off before reconnect");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => break,
            }
        }

        self.registry.unregister(&self.mailbox.id).await;
        info!(mailbox_id = %self.mailbox.id, "supervisor stopped");
    }

    /// One connected session: sequential folder sync, then tailing
    async fn run_session(&mut self, client: &mut SessionClient) -> SessionEnd {
        // Folders are processed strictly sequentially on this session
        for folder in self.mailbox.sync_folders.clone() {
            if self.cancel.is_cancelled() {
                return SessionEnd::Stopped;
            }

            match self
                .synchronizer
                .catch_up(client, &self.mailbox, &folder, &self.cancel)
                .await
            {
                Ok(ingested) => {
                    debug!(mailbox_id = %self.mailbox.id, folder = %folder, ingested, "folder synced");
                }
                Err(e) if e.is_transient() => {
                    // Abandon the remaining folders; the reconnect will
                    // resume from each folder's checkpoint.
                    warn!(
                        mailbox_id = %self.mailbox.id,
                        folder = %folder,
                        error = %e,
                        kind = e.kind().as_str(),
                        "transient folder error, reconnecting"
                    );
                    return SessionEnd::Failed(e);
                }
                Err(e) => {
                    error!(
                        mailbox_id = %self.mailbox.id,
                        folder = %folder,
                        error = %e,
                        kind = e.kind().as_str(),
                        "folder sync failed, continuing with next folder"
                    );
                }
            }
        }

        self.tail(client).await
    }

    /// Live tailing: IDLE in short cycles when the server supports it,
    /// otherwise a polling ticker. Every wake-up runs an incremental
    /// catch-up; a long stretch without updates forces a reconnect.
    async fn tail(&mut self, client: &mut SessionClient) -> SessionEnd {
        let primary = match self.mailbox.sync_folders.first().cloned() {
            Some(folder) => folder,
            None => {
                return SessionEnd::Failed(MailError::internal(
                    "inbound mailbox without sync folders",
                ))
            }
        };

        let supports_idle = client.supports_idle();
        // Keep each IDLE cycle short enough that the keepalive NOOP and
        // the logout deadline are both honored.
        let idle_cycle = self
            .config
            .keepalive_interval
            .min(self.config.idle_logout_timeout);

        let mut last_activity = tokio::time::Instant::now();
        let mut last_full_poll = tokio::time::Instant::now();

        info!(mailbox_id = %self.mailbox.id, idle = supports_idle, "tailing");

        loop {
            if self.cancel.is_cancelled() {
                return SessionEnd::Stopped;
            }
            if last_activity.elapsed() >= self.config.stale_after {
                return SessionEnd::Failed(MailError::transient(
                    "tail saw no updates within the staleness window",
                ));
            }

            if supports_idle {
                // Re-select so untagged EXISTS updates apply to the
                // primary folder before entering IDLE.
                if let Err(e) = client.select(&primary).await {
                    return self.tail_error(e);
                }
                match client.idle_wait(idle_cycle, &self.cancel).await {
                    Ok(IdleOutcome::Stopped) => return SessionEnd::Stopped,
                    Ok(IdleOutcome::NewData) => {
                        match self
                            .synchronizer
                            .catch_up(client, &self.mailbox, &primary, &self.cancel)
                            .await
                        {
                            Ok(ingested) if ingested > 0 => {
                                last_activity = tokio::time::Instant::now();
                            }
                            Ok(_) => {}
                            Err(e) => return self.tail_error(e),
                        }
                    }
                    Ok(IdleOutcome::TimedOut) => {
                        // Idle NOOP keepalive while nothing is happening
                        if let Err(e) = client.noop().await {
                            return self.tail_error(e);
                        }
                    }
                    Err(e) => return self.tail_error(e),
                }

                if last_full_poll.elapsed() >= self.config.idle_poll_interval {
                    if let Err(e) = self.poll_all_folders(client).await {
                        return self.tail_error(e);
                    }
                    last_full_poll = tokio::time::Instant::now();
                }
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = self.cancel.cancelled() => return SessionEnd::Stopped,
                }

                match self.poll_all_folders(client).await {
                    Ok(ingested) if ingested > 0 => {
                        last_activity = tokio::time::Instant::now();
                    }
                    Ok(_) => {
                        if last_full_poll.elapsed() >= self.config.keepalive_interval {
                            if let Err(e) = client.noop().await {
                                return self.tail_error(e);
                            }
                            last_full_poll = tokio::time::Instant::now();
                        }
                    }
                    Err(e) => return self.tail_error(e),
                }
            }
        }
    }

    async fn poll_all_folders(&self, client: &mut SessionClient) -> MailResult<usize> {
        let mut total = 0;
        for folder in &self.mailbox.sync_folders {
            if self.cancel.is_cancelled() {
                break;
            }
            total += self
                .synchronizer
                .catch_up(client, &self.mailbox, folder, &self.cancel)
                .await?;
        }
        Ok(total)
    }

    fn tail_error(&self, e: MailError) -> SessionEnd {
        if self.cancel.is_cancelled() {
            SessionEnd::Stopped
        } else {
            SessionEnd::Failed(e)
        }
    }

    /// Graceful logout with the shutdown deadline
    async fn shutdown_session(&self, mut client: SessionClient) {
        client.set_command_timeout(SHUTDOWN_COMMAND_TIMEOUT);
        if let Err(e) = client.logout().await {
            debug!(mailbox_id = %self.mailbox.id, error = %e, "logout during shutdown failed");
        }
        self.publish_status(ConnectionStatus::Disconnected, None).await;
    }

    async fn disable(&self, cause: &MailError) {
        error!(
            mailbox_id = %self.mailbox.id,
            error = %cause,
            "giving up after repeated authentication failures, disabling mailbox"
        );
        self.publish_status(ConnectionStatus::Disabled, Some(cause.to_string()))
            .await;
    }

    /// Publish to the registry and persist the snapshot. Persistence
    /// failures are logged and swallowed so a database blip cannot kill
    /// the supervision loop.
    async fn publish_status(&self, status: ConnectionStatus, error_message: Option<String>) {
        self.registry
            .set_connection(&self.mailbox.id, status, error_message.clone())
            .await;

        if let Err(e) = self
            .repos
            .mailboxes
            .update_connection_status(&self.mailbox.id, status, error_message.as_deref())
            .await
        {
            if e.kind() != ErrorKind::NotFound {
                warn!(
                    mailbox_id = %self.mailbox.id,
                    error = %e,
                    "failed to persist connection status"
                );
            }
        }
    }
}

/// Set of running supervisors, one per mailbox
pub struct SupervisorSet {
    handles: HashMap<String, JoinHandle<()>>,
    cancel: CancellationToken,
}

impl SupervisorSet {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            handles: HashMap::new(),
            cancel,
        }
    }

    /// Spawn a supervisor for every inbound-enabled mailbox
    pub async fn start(
        &mut self,
        repos: &Repositories,
        synchronizer: &FolderSynchronizer,
        registry: &StatusRegistry,
        config: &SyncConfig,
    ) -> MailResult<usize> {
        let mailboxes = repos.mailboxes.list().await?;
        let mut started = 0;

        for mailbox in mailboxes {
            if !mailbox.inbound_enabled {
                continue;
            }
            if mailbox.sync_folders.is_empty() {
                warn!(
                    mailbox_id = %mailbox.id,
                    "inbound enabled but no sync folders configured, skipping"
                );
                continue;
            }
            self.spawn(
                mailbox,
                repos.clone(),
                synchronizer.clone(),
                registry.clone(),
                config.clone(),
            );
            started += 1;
        }

        info!(supervisors = started, "mailbox supervisors started");
        Ok(started)
    }

    /// Spawn one supervisor; replaces any previous task for the mailbox
    pub fn spawn(
        &mut self,
        mailbox: Mailbox,
        repos: Repositories,
        synchronizer: FolderSynchronizer,
        registry: StatusRegistry,
        config: SyncConfig,
    ) {
        let id = mailbox.id.clone();
        let supervisor = MailboxSupervisor::new(
            mailbox,
            repos,
            synchronizer,
            registry,
            config,
            self.cancel.child_token(),
        );
        let handle = tokio::spawn(supervisor.run());
        if let Some(previous) = self.handles.insert(id, handle) {
            previous.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Cancel every supervisor and wait for them within the budget
    pub async fn shutdown(self, budget: Duration) {
        self.cancel.cancel();

        let join_all = async {
            for (id, handle) in self.handles {
                if let Err(e) = handle.await {
                    if !e.is_cancelled() {
                        warn!(mailbox_id = %id, error = %e, "supervisor task ended abnormally");
                    }
                }
            }
        };

        if tokio::time::timeout(budget, join_all).await.is_err() {
            warn!("supervisors did not stop within the shutdown budget");
        }
    }
}
