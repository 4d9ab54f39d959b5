//! IMAP session client: dial, TLS, login, commands, IDLE, logout

use crate::config::SyncConfig;
use crate::error::{MailError, MailResult};
use crate::models::{Endpoint, Security};
use async_imap::extensions::idle::IdleResponse;
use async_imap::types::Capability;
use async_imap::{Client, Session};
use async_native_tls::{TlsConnector, TlsStream};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use secrecy::ExposeSecret;
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type TlsCompatStream = TlsStream<Compat<TcpStream>>;
type TcpCompatStream = Compat<TcpStream>;

/// Fetch items for every message: envelope, flags, structure, full body.
/// PEEK is mandatory so ingest never sets `\Seen` on the server.
const FETCH_ITEMS: &str = "(UID FLAGS ENVELOPE BODYSTRUCTURE BODY.PEEK[])";

/// Folder counters returned by SELECT
#[derive(Debug, Clone, Default)]
pub struct FolderStatus {
    pub exists: u32,
    pub recent: u32,
    pub unseen: Option<u32>,
    pub uid_validity: Option<u32>,
    pub uid_next: Option<u32>,
}

/// One message pulled off the wire
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub uid: u32,
    pub raw: Vec<u8>,
    pub flags: Vec<String>,
    pub internal_date: Option<DateTime<Utc>>,
}

/// What ended an IDLE wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    /// Server pushed new state; re-check the folder
    NewData,
    /// Wait elapsed without activity
    TimedOut,
    /// The stop signal fired
    Stopped,
}

/// Session over either a TLS or a plain transport
enum InnerSession {
    Tls(Session<TlsCompatStream>),
    Plain(Session<TcpCompatStream>),
}

impl InnerSession {
    async fn select(&mut self, folder: &str) -> Result<async_imap::types::Mailbox, async_imap::error::Error> {
        match self {
            InnerSession::Tls(session) => session.select(folder).await,
            InnerSession::Plain(session) => session.select(folder).await,
        }
    }

    async fn uid_search(&mut self, query: &str) -> Result<HashSet<u32>, async_imap::error::Error> {
        match self {
            InnerSession::Tls(session) => session.uid_search(query).await,
            InnerSession::Plain(session) => session.uid_search(query).await,
        }
    }

    async fn uid_fetch(
        &mut self,
        sequence_set: &str,
        query: &str,
    ) -> Result<Vec<async_imap::types::Fetch>, async_imap::error::Error> {
        match self {
            InnerSession::Tls(session) => {
                let stream = session.uid_fetch(sequence_set, query).await?;
                stream.try_collect().await
            }
            InnerSession::Plain(session) => {
                let stream = session.uid_fetch(sequence_set, query).await?;
                stream.try_collect().await
            }
        }
    }

    async fn noop(&mut self) -> Result<(), async_imap::error::Error> {
        match self {
            InnerSession::Tls(session) => session.noop().await,
            InnerSession::Plain(session) => session.noop().await,
        }
    }

    async fn capabilities(&mut self) -> Result<Vec<String>, async_imap::error::Error> {
        let names = |caps: async_imap::types::Capabilities| {
            caps.iter().map(capability_name).collect::<Vec<_>>()
        };
        match self {
            InnerSession::Tls(session) => session.capabilities().await.map(names),
            InnerSession::Plain(session) => session.capabilities().await.map(names),
        }
    }

    async fn logout(self) -> Result<(), async_imap::error::Error> {
        match self {
            InnerSession::Tls(mut session) => session.logout().await,
            InnerSession::Plain(mut session) => session.logout().await,
        }
    }

    /// Enter IDLE, wait for activity or `wait_for`, then send DONE and
    /// hand the session back. The stop source is a single-fire latch:
    /// it is consumed exactly once, either by the stop signal or by
    /// being dropped when the wait resolves.
    async fn idle_wait(
        self,
        wait_for: Duration,
        stop: &CancellationToken,
    ) -> Result<(IdleOutcome, InnerSession), async_imap::error::Error> {
        match self {
            InnerSession::Tls(session) => {
                let mut handle = session.idle();
                handle.init().await?;
                let (wait_future, stop_source) = handle.wait_with_timeout(wait_for);
                let outcome = race_idle(wait_future, stop_source, stop).await?;
                let session = handle.done().await?;
                Ok((outcome, InnerSession::Tls(session)))
            }
            InnerSession::Plain(session) => {
                let mut handle = session.idle();
                handle.init().await?;
                let (wait_future, stop_source) = handle.wait_with_timeout(wait_for);
                let outcome = race_idle(wait_future, stop_source, stop).await?;
                let session = handle.done().await?;
                Ok((outcome, InnerSession::Plain(session)))
            }
        }
    }
}

async fn race_idle<F, S>(
    wait_future: F,
    stop_source: S,
    stop: &CancellationToken,
) -> Result<IdleOutcome, async_imap::error::Error>
where
    F: Future<Output = Result<IdleResponse, async_imap::error::Error>>,
{
    tokio::pin!(wait_future);
    let mut stop_source = Some(stop_source);

    loop {
        tokio::select! {
            response = &mut wait_future => {
                return Ok(match response? {
                    IdleResponse::NewData(_) => IdleOutcome::NewData,
                    IdleResponse::Timeout => IdleOutcome::TimedOut,
                    IdleResponse::ManualInterrupt => IdleOutcome::Stopped,
                });
            }
            _ = stop.cancelled(), if stop_source.is_some() => {
                // Dropping the source interrupts the wait; the future
                // then resolves with ManualInterrupt.
                drop(stop_source.take());
            }
        }
    }
}

/// A logged-in IMAP session with cached capabilities
pub struct SessionClient {
    session: Option<InnerSession>,
    capabilities: HashSet<String>,
    command_timeout: Duration,
    fetch_timeout: Duration,
    host: String,
}

impl SessionClient {
    /// Dial, negotiate security, log in, and probe capabilities.
    /// On login failure the connection is shut down with LOGOUT before
    /// the error is returned.
    pub async fn connect(endpoint: &Endpoint, sync: &SyncConfig) -> MailResult<Self> {
        let addr = format!("{}:{}", endpoint.host, endpoint.port);
        debug!(host = %endpoint.host, port = endpoint.port, security = %endpoint.security, "connecting to IMAP server");

        let tcp_stream = tokio::time::timeout(sync.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| MailError::timeout("IMAP dial", sync.connect_timeout.as_secs()))?
            .map_err(|e| MailError::transient(format!("failed to connect to {}: {}", addr, e)))?;
        set_nodelay(&tcp_stream);

        let session = match endpoint.security {
            Security::Tls => {
                let tls_stream = tls_handshake(&endpoint.host, tcp_stream.compat()).await?;
                let mut client = Client::new(tls_stream);
                read_greeting(&mut client, sync).await?;
                InnerSession::Tls(login(client, endpoint, sync).await?)
            }
            Security::Starttls => {
                let tcp_stream = starttls_upgrade(tcp_stream, sync).await?;
                let tls_stream = tls_handshake(&endpoint.host, tcp_stream.compat()).await?;
                // The greeting was consumed during the STARTTLS exchange
                let client = Client::new(tls_stream);
                InnerSession::Tls(login(client, endpoint, sync).await?)
            }
            Security::None => {
                let mut client = Client::new(tcp_stream.compat());
                read_greeting(&mut client, sync).await?;
                InnerSession::Plain(login(client, endpoint, sync).await?)
            }
        };

        let mut client = Self {
            session: Some(session),
            capabilities: HashSet::new(),
            command_timeout: sync.command_timeout,
            fetch_timeout: sync.fetch_timeout,
            host: endpoint.host.clone(),
        };

        let caps = client
            .with_timeout(|session| session.capabilities())
            .await?;
        client.capabilities = caps.into_iter().collect();
        debug!(host = %client.host, idle = client.supports_idle(), "IMAP session established");

        Ok(client)
    }

    /// Whether the server advertises IDLE
    pub fn supports_idle(&self) -> bool {
        self.capabilities.iter().any(|c| c.eq_ignore_ascii_case("IDLE"))
    }

    pub fn capabilities(&self) -> &HashSet<String> {
        &self.capabilities
    }

    /// Adjust the request/response deadline; the supervisor drops it to
    /// 5 s during graceful shutdown.
    pub fn set_command_timeout(&mut self, timeout: Duration) {
        self.command_timeout = timeout;
    }

    /// SELECT a folder and report its counters
    pub async fn select(&mut self, folder: &str) -> MailResult<FolderStatus> {
        let folder = folder.to_string();
        let mailbox = self
            .with_timeout(move |session| async move { session.select(&folder).await })
            .await?;

        Ok(FolderStatus {
            exists: mailbox.exists,
            recent: mailbox.recent,
            unseen: mailbox.unseen,
            uid_validity: mailbox.uid_validity,
            uid_next: mailbox.uid_next,
        })
    }

    /// UID SEARCH; results sorted ascending
    pub async fn uid_search(&mut self, criteria: &str) -> MailResult<Vec<u32>> {
        let criteria = criteria.to_string();
        let uids = self
            .with_timeout(move |session| async move { session.uid_search(&criteria).await })
            .await?;

        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    /// UID FETCH the standard item set for a UID set expression.
    /// Uses the streaming fetch deadline rather than the command deadline.
    pub async fn uid_fetch(&mut self, uid_set: &str) -> MailResult<Vec<FetchedMessage>> {
        let fetch_timeout = self.fetch_timeout;
        let uid_set = uid_set.to_string();
        let session = self.session_mut()?;
        let fetches = tokio::time::timeout(fetch_timeout, session.uid_fetch(&uid_set, FETCH_ITEMS))
            .await
            .map_err(|_| MailError::timeout("UID FETCH", fetch_timeout.as_secs()))??;

        let mut messages = Vec::with_capacity(fetches.len());
        for fetch in &fetches {
            let Some(uid) = fetch.uid else {
                warn!(host = %self.host, "fetch response without UID, skipping");
                continue;
            };
            let raw = fetch.body().map(|b| b.to_vec()).unwrap_or_default();
            let flags = fetch.flags().map(|f| format!("{:?}", f)).collect();
            let internal_date = fetch.internal_date().map(|d| d.with_timezone(&Utc));
            messages.push(FetchedMessage {
                uid,
                raw,
                flags,
                internal_date,
            });
        }
        // Server order is ascending UID for an ascending set expression,
        // but normalize anyway before handing to the processor.
        messages.sort_by_key(|m| m.uid);
        Ok(messages)
    }

    /// Liveness probe
    pub async fn noop(&mut self) -> MailResult<()> {
        self.with_timeout(|session| session.noop()).await?;
        Ok(())
    }

    /// Hold the connection in IDLE until server activity, timeout, or stop
    pub async fn idle_wait(
        &mut self,
        wait_for: Duration,
        stop: &CancellationToken,
    ) -> MailResult<IdleOutcome> {
        let session = self
            .session
            .take()
            .ok_or_else(|| MailError::internal("no active IMAP session"))?;

        match session.idle_wait(wait_for, stop).await {
            Ok((outcome, session)) => {
                self.session = Some(session);
                Ok(outcome)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Graceful LOGOUT; the session is gone afterwards either way
    pub async fn logout(mut self) -> MailResult<()> {
        if let Some(session) = self.session.take() {
            tokio::time::timeout(self.command_timeout, session.logout())
                .await
                .map_err(|_| MailError::timeout("LOGOUT", self.command_timeout.as_secs()))??;
        }
        Ok(())
    }

    fn session_mut(&mut self) -> MailResult<&mut InnerSession> {
        self.session
            .as_mut()
            .ok_or_else(|| MailError::internal("no active IMAP session"))
    }

    async fn with_timeout<'a, F, Fut, T>(&'a mut self, op: F) -> MailResult<T>
    where
        F: FnOnce(&'a mut InnerSession) -> Fut,
        Fut: Future<Output = Result<T, async_imap::error::Error>> + 'a,
    {
        let timeout = self.command_timeout;
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| MailError::internal("no active IMAP session"))?;
        let result = tokio::time::timeout(timeout, op(session))
            .await
            .map_err(|_| MailError::timeout("IMAP command", timeout.as_secs()))??;
        Ok(result)
    }
}

/// Consume the `* OK` server greeting before the first command
async fn read_greeting<T>(client: &mut Client<T>, sync: &SyncConfig) -> MailResult<()>
where
    T: futures::AsyncRead + futures::AsyncWrite + Unpin + Send + std::fmt::Debug,
{
    let greeting = tokio::time::timeout(sync.connect_timeout, client.read_response())
        .await
        .map_err(|_| MailError::timeout("IMAP greeting", sync.connect_timeout.as_secs()))?
        .map_err(MailError::from)?;
    if greeting.is_none() {
        return Err(MailError::transient(
            "server closed connection before greeting",
        ));
    }
    Ok(())
}

async fn tls_handshake<S>(host: &str, stream: S) -> MailResult<TlsStream<S>>
where
    S: futures::AsyncRead + futures::AsyncWrite + Unpin,
{
    let connector = TlsConnector::new();
    connector
        .connect(host, stream)
        .await
        .map_err(|e| MailError::auth(format!("TLS handshake failed: {}", e)))
}

async fn login<T>(
    client: Client<T>,
    endpoint: &Endpoint,
    sync: &SyncConfig,
) -> MailResult<Session<T>>
where
    T: futures::AsyncRead + futures::AsyncWrite + Unpin + Send + std::fmt::Debug,
{
    let attempt = client.login(&endpoint.username, endpoint.secret.expose_secret());
    match tokio::time::timeout(sync.connect_timeout, attempt).await {
        Ok(Ok(session)) => Ok(session),
        Ok(Err((e, mut client))) => {
            // Best-effort LOGOUT so the server releases the connection
            let _ = client.run_command_and_check_ok("LOGOUT", None).await;
            Err(MailError::auth(format!("login rejected: {:?}", e)))
        }
        Err(_) => Err(MailError::timeout("IMAP login", sync.connect_timeout.as_secs())),
    }
}

/// Pre-TLS STARTTLS exchange on the raw socket: consume the greeting,
/// request the upgrade, wait for the tagged OK.
async fn starttls_upgrade(stream: TcpStream, sync: &SyncConfig) -> MailResult<TcpStream> {
    let exchange = async {
        let mut reader = BufReader::new(stream);

        let mut greeting = String::new();
        reader.read_line(&mut greeting).await?;
        if !greeting.starts_with("* OK") {
            return Err(MailError::protocol(format!(
                "unexpected IMAP greeting: {}",
                greeting.trim_end()
            )));
        }

        reader.get_mut().write_all(b"a1 STARTTLS\r\n").await?;

        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(MailError::transient("connection closed during STARTTLS"));
            }
            if line.starts_with("a1 OK") {
                return Ok(reader.into_inner());
            }
            if line.starts_with("a1 ") {
                return Err(MailError::auth(format!(
                    "STARTTLS rejected: {}",
                    line.trim_end()
                )));
            }
        }
    };

    tokio::time::timeout(sync.connect_timeout, exchange)
        .await
        .map_err(|_| MailError::timeout("STARTTLS", sync.connect_timeout.as_secs()))?
}

fn set_nodelay(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("failed to set TCP_NODELAY: {}", e);
    }
}

fn capability_name(cap: &Capability) -> String {
    match cap {
        Capability::Imap4rev1 => "IMAP4rev1".to_string(),
        Capability::Auth(mechanism) => format!("AUTH={}", mechanism),
        Capability::Atom(atom) => atom.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_items_use_peek() {
        assert!(FETCH_ITEMS.contains("BODY.PEEK[]"));
        assert!(!FETCH_ITEMS.contains("BODY[]"));
    }

    #[test]
    fn test_capability_names() {
        assert_eq!(
            capability_name(&Capability::Imap4rev1),
            "IMAP4rev1".to_string()
        );
        assert_eq!(
            capability_name(&Capability::Atom("IDLE".into())),
            "IDLE".to_string()
        );
        assert_eq!(
            capability_name(&Capability::Auth("PLAIN".into())),
            "AUTH=PLAIN".to_string()
        );
    }
}
