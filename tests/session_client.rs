//! Session client integration tests against a scripted IMAP server
//!
//! The server binds an ephemeral localhost port and speaks just enough
//! IMAP4rev1 for the connect → select → search → fetch → logout cycle:
//! tagged commands in, untagged data plus tagged completions out, and
//! counted literals for message bodies.

use mailstack::config::SyncConfig;
use mailstack::imap::SessionClient;
use mailstack::models::{Endpoint, Security};
use secrecy::SecretString;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// One message in the scripted INBOX
struct TestEmail {
    uid: u32,
    raw: &'static [u8],
}

const MESSAGE: &[u8] = b"Message-ID: <m1@x>\r\n\
From: Ada <a@x.io>\r\n\
To: b@y.io\r\n\
Subject: hello\r\n\
\r\n\
hi there\r\n";

struct FakeImapServer {
    port: u16,
    _handle: tokio::task::JoinHandle<()>,
}

impl FakeImapServer {
    async fn start(emails: Vec<TestEmail>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind to ephemeral port");
        let port = listener.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                serve(socket, &emails).await;
            }
        });

        Self {
            port,
            _handle: handle,
        }
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: "127.0.0.1".to_string(),
            port: self.port,
            username: "a@x.io".to_string(),
            secret: SecretString::new("password".to_string()),
            security: Security::None,
        }
    }
}

async fn serve(socket: TcpStream, emails: &[TestEmail]) {
    let mut stream = BufReader::new(socket);
    let _ = write_all(&mut stream, b"* OK IMAP4rev1 ready\r\n").await;

    loop {
        let mut line = String::new();
        match tokio::io::AsyncBufReadExt::read_line(&mut stream, &mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }

        let mut parts = line.trim_end().splitn(2, ' ');
        let tag = parts.next().unwrap_or_default().to_string();
        let command = parts.next().unwrap_or_default().to_uppercase();

        if command.starts_with("CAPABILITY") {
            let _ = write_all(&mut stream, b"* CAPABILITY IMAP4rev1 IDLE\r\n").await;
            let _ = write_line(&mut stream, format!("{tag} OK CAPABILITY completed")).await;
        } else if command.starts_with("LOGIN") {
            let _ = write_line(&mut stream, format!("{tag} OK LOGIN completed")).await;
        } else if command.starts_with("SELECT") {
            let _ = write_all(
                &mut stream,
                b"* FLAGS (\\Seen \\Answered \\Flagged \\Deleted \\Draft)\r\n",
            )
            .await;
            let _ = write_line(&mut stream, format!("* {} EXISTS", emails.len())).await;
            let _ = write_all(&mut stream, b"* 0 RECENT\r\n").await;
            let _ = write_all(&mut stream, b"* OK [UIDVALIDITY 42]\r\n").await;
            let uidnext = emails.iter().map(|e| e.uid).max().map_or(1, |m| m + 1);
            let _ = write_line(&mut stream, format!("* OK [UIDNEXT {uidnext}]")).await;
            let _ = write_line(&mut stream, format!("{tag} OK [READ-WRITE] SELECT completed")).await;
        } else if command.starts_with("UID SEARCH") {
            let uids: Vec<String> = emails.iter().map(|e| e.uid.to_string()).collect();
            let _ = write_line(&mut stream, format!("* SEARCH {}", uids.join(" "))).await;
            let _ = write_line(&mut stream, format!("{tag} OK SEARCH completed")).await;
        } else if command.starts_with("UID FETCH") {
            for (idx, email) in emails.iter().enumerate() {
                let header = format!(
                    "* {} FETCH (UID {} BODY[] {{{}}}\r\n",
                    idx + 1,
                    email.uid,
                    email.raw.len()
                );
                let _ = write_all(&mut stream, header.as_bytes()).await;
                let _ = write_all(&mut stream, email.raw).await;
                let _ = write_all(&mut stream, b")\r\n").await;
            }
            let _ = write_line(&mut stream, format!("{tag} OK FETCH completed")).await;
        } else if command.starts_with("NOOP") {
            let _ = write_line(&mut stream, format!("{tag} OK NOOP completed")).await;
        } else if command.starts_with("LOGOUT") {
            let _ = write_all(&mut stream, b"* BYE logging out\r\n").await;
            let _ = write_line(&mut stream, format!("{tag} OK LOGOUT completed")).await;
            return;
        } else {
            let _ = write_line(&mut stream, format!("{tag} BAD unsupported")).await;
        }
    }
}

async fn write_all(stream: &mut BufReader<TcpStream>, bytes: &[u8]) -> std::io::Result<()> {
    stream.get_mut().write_all(bytes).await?;
    stream.get_mut().flush().await
}

async fn write_line(stream: &mut BufReader<TcpStream>, line: String) -> std::io::Result<()> {
    write_all(stream, format!("{line}\r\n").as_bytes()).await
}

#[tokio::test]
async fn connect_select_search_fetch_logout() {
    let server = FakeImapServer::start(vec![TestEmail {
        uid: 7,
        raw: MESSAGE,
    }])
    .await;

    let mut client = SessionClient::connect(&server.endpoint(), &SyncConfig::default())
        .await
        .expect("connect");
    assert!(client.supports_idle());

    let status = client.select("INBOX").await.expect("select");
    assert_eq!(status.exists, 1);
    assert_eq!(status.uid_validity, Some(42));
    assert_eq!(status.uid_next, Some(8));

    let uids = client.uid_search("ALL").await.expect("search");
    assert_eq!(uids, vec![7]);

    let messages = client.uid_fetch("7").await.expect("fetch");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].uid, 7);
    assert_eq!(messages[0].raw, MESSAGE);

    client.noop().await.expect("noop");
    client.logout().await.expect("logout");
}

#[tokio::test]
async fn empty_folder_yields_no_uids() {
    let server = FakeImapServer::start(Vec::new()).await;

    let mut client = SessionClient::connect(&server.endpoint(), &SyncConfig::default())
        .await
        .expect("connect");

    let status = client.select("INBOX").await.expect("select");
    assert_eq!(status.exists, 0);

    let uids = client.uid_search("ALL").await.expect("search");
    assert!(uids.is_empty());

    client.logout().await.expect("logout");
}

#[tokio::test]
async fn connect_to_closed_port_is_transient() {
    // Bind then drop so the port is very likely unused
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let endpoint = Endpoint {
        host: "127.0.0.1".to_string(),
        port,
        username: "a@x.io".to_string(),
        secret: SecretString::new("password".to_string()),
        security: Security::None,
    };

    let result = SessionClient::connect(&endpoint, &SyncConfig::default()).await;
    let error = result.err().expect("connection must fail");
    assert!(error.is_transient());
}
