//! Mailbox connector speaking raw IMAP4rev1 over TLS (rustls) or plain TCP.
//!
//! The protocol client is blocking; every network round trip runs on
//! `spawn_blocking` and hands the connection back when it is done.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use mail_parser::MessageParser;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::error::MailboxError;
use crate::pipeline::types::RawMessage;

// ── Configuration ───────────────────────────────────────────────────

/// Mailbox credentials and connection settings.
#[derive(Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub user: String,
    pub password: SecretString,
    /// Socket read/write timeout.
    pub timeout: Duration,
}

impl std::fmt::Debug for ImapConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

// ── Search criteria ─────────────────────────────────────────────────

/// Messages since a date whose sender or subject matches any of the given
/// fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchCriteria {
    pub since: NaiveDate,
    pub from_any: Vec<String>,
    pub subject_any: Vec<String>,
}

impl SearchCriteria {
    /// Failure notifications received within `window` before `now`.
    /// A window reaching past the representable range searches from the epoch.
    pub fn bounce_notifications(now: DateTime<Utc>, window: chrono::Duration) -> Self {
        let since = now
            .checked_sub_signed(window)
            .unwrap_or(DateTime::UNIX_EPOCH);
        Self {
            since: since.date_naive(),
            from_any: vec!["postmaster".into(), "mailer-daemon".into()],
            subject_any: vec![
                "Undelivered".into(),
                "Delivery Status".into(),
                "Mail delivery failed".into(),
            ],
        }
    }

    /// Render as an IMAP SEARCH key list.
    ///
    /// `OR` is binary in IMAP, so n alternatives become n-1 nested ORs:
    /// `SINCE d OR a OR b c`.
    pub fn to_imap(&self) -> String {
        let terms: Vec<String> = self
            .from_any
            .iter()
            .map(|f| format!("FROM {}", quote(f)))
            .chain(self.subject_any.iter().map(|s| format!("SUBJECT {}", quote(s))))
            .collect();

        let mut out = format!("SINCE {}", self.since.format("%d-%b-%Y"));
        if let Some((last, rest)) = terms.split_last() {
            for term in rest {
                out.push_str(" OR ");
                out.push_str(term);
            }
            out.push(' ');
            out.push_str(last);
        }
        out
    }
}

// ── Connector traits ────────────────────────────────────────────────

/// Opens authenticated mailbox sessions.
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn MailboxSession>, MailboxError>;
}

/// One authenticated mailbox session.
#[async_trait]
pub trait MailboxSession: Send {
    /// Open the first candidate folder that the server accepts.
    async fn open_folder(&mut self, candidates: &[String]) -> Result<String, MailboxError>;

    /// Message identifiers matching `criteria`, in server order.
    async fn search(&mut self, criteria: &SearchCriteria) -> Result<Vec<String>, MailboxError>;

    /// Fetch and parse one message.
    async fn fetch(&mut self, uid: &str) -> Result<RawMessage, MailboxError>;

    /// Log out. Errors are swallowed.
    async fn close(self: Box<Self>);
}

// ── Network connector ───────────────────────────────────────────────

/// Connector for a real IMAP server.
#[derive(Debug, Clone)]
pub struct ImapConnector {
    config: ImapConfig,
}

impl ImapConnector {
    pub fn new(config: ImapConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MailboxConnector for ImapConnector {
    async fn connect(&self) -> Result<Box<dyn MailboxSession>, MailboxError> {
        let cfg = self.config.clone();
        let client = tokio::task::spawn_blocking(move || connect_blocking(&cfg))
            .await
            .map_err(|e| MailboxError::Protocol(format!("IMAP connect task panicked: {e}")))??;

        info!(host = %self.config.host, user = %self.config.user, "Connected to IMAP");
        Ok(Box::new(ImapSession {
            client: Some(client),
        }))
    }
}

fn connect_blocking(config: &ImapConfig) -> Result<ImapClient<ImapStream>, MailboxError> {
    let connect_err = |reason: String| MailboxError::Connect {
        host: config.host.clone(),
        port: config.port,
        reason,
    };

    let tcp = TcpStream::connect((&*config.host, config.port)).map_err(|e| connect_err(e.to_string()))?;
    tcp.set_read_timeout(Some(config.timeout))?;
    tcp.set_write_timeout(Some(config.timeout))?;

    let stream = if config.tls {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls::pki_types::ServerName::try_from(config.host.clone())
            .map_err(|e| MailboxError::Tls(e.to_string()))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| MailboxError::Tls(e.to_string()))?;
        ImapStream::Tls(Box::new(rustls::StreamOwned::new(conn, tcp)))
    } else {
        ImapStream::Plain(tcp)
    };

    let mut client = ImapClient::new(stream);
    client.open(&config.user, config.password.expose_secret())?;
    Ok(client)
}

/// TCP stream, with or without TLS.
pub enum ImapStream {
    Plain(TcpStream),
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

impl Read for ImapStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(s) => s.read(buf),
            Self::Tls(s) => s.read(buf),
        }
    }
}

impl Write for ImapStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(s) => s.write(buf),
            Self::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(s) => s.flush(),
            Self::Tls(s) => s.flush(),
        }
    }
}

/// Session over a live connection.
struct ImapSession {
    client: Option<ImapClient<ImapStream>>,
}

impl ImapSession {
    /// Run one blocking protocol exchange off the async runtime.
    async fn with_client<T, F>(&mut self, op: F) -> Result<T, MailboxError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapClient<ImapStream>) -> Result<T, MailboxError> + Send + 'static,
    {
        let mut client = self.client.take().ok_or(MailboxError::Closed)?;
        let (client, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut client);
            (client, result)
        })
        .await
        .map_err(|e| MailboxError::Protocol(format!("IMAP task panicked: {e}")))?;
        self.client = Some(client);
        result
    }
}

#[async_trait]
impl MailboxSession for ImapSession {
    async fn open_folder(&mut self, candidates: &[String]) -> Result<String, MailboxError> {
        let candidates = candidates.to_vec();
        self.with_client(move |c| c.select_first(&candidates)).await
    }

    async fn search(&mut self, criteria: &SearchCriteria) -> Result<Vec<String>, MailboxError> {
        let query = criteria.to_imap();
        self.with_client(move |c| c.uid_search(&query)).await
    }

    async fn fetch(&mut self, uid: &str) -> Result<RawMessage, MailboxError> {
        let uid = uid.to_string();
        self.with_client(move |c| c.uid_fetch(&uid)).await
    }

    async fn close(mut self: Box<Self>) {
        if let Err(e) = self.with_client(|c| c.logout()).await {
            debug!("IMAP logout failed: {e}");
        }
    }
}

// ── Protocol client ─────────────────────────────────────────────────

/// Completion status of a tagged command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    No,
    Bad,
}

/// Everything the server sent for one command.
#[derive(Debug, Default)]
pub struct Response {
    /// Untagged lines (`* ...`), with any literals removed.
    pub untagged: Vec<String>,
    /// Literal payloads in the order they arrived.
    pub literals: Vec<Vec<u8>>,
    pub status: Option<Status>,
    /// Text after the status word on the tagged line.
    pub text: String,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        self.status == Some(Status::Ok)
    }
}

/// Server greeting state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Greeting {
    /// `* OK`: LOGIN required.
    Ready,
    /// `* PREAUTH`: already in authenticated state.
    PreAuthenticated,
}

/// Minimal blocking IMAP client over any byte stream.
pub struct ImapClient<S: Read + Write> {
    stream: BufReader<S>,
    next_tag: u32,
}

impl<S: Read + Write> ImapClient<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
            next_tag: 1,
        }
    }

    pub fn read_greeting(&mut self) -> Result<Greeting, MailboxError> {
        let line = self.read_raw_line()?;
        if line.starts_with("* OK") {
            Ok(Greeting::Ready)
        } else if line.starts_with("* PREAUTH") {
            Ok(Greeting::PreAuthenticated)
        } else {
            Err(MailboxError::Protocol(format!(
                "unexpected greeting: {}",
                line.trim_end()
            )))
        }
    }

    /// Read the greeting and log in, unless the server already
    /// authenticated the connection.
    pub fn open(&mut self, user: &str, password: &str) -> Result<(), MailboxError> {
        match self.read_greeting()? {
            Greeting::Ready => self.login(user, password),
            Greeting::PreAuthenticated => {
                debug!(user = %user, "Server sent PREAUTH, skipping LOGIN");
                Ok(())
            }
        }
    }

    pub fn login(&mut self, user: &str, password: &str) -> Result<(), MailboxError> {
        let resp = self.command(&format!("LOGIN {} {}", quote(user), quote(password)))?;
        if resp.is_ok() {
            Ok(())
        } else {
            Err(MailboxError::Auth {
                user: user.to_string(),
            })
        }
    }

    /// SELECT each candidate in turn; returns the one that opened.
    pub fn select_first(&mut self, candidates: &[String]) -> Result<String, MailboxError> {
        for name in candidates {
            let resp = self.command(&format!("SELECT {}", quote(name)))?;
            if resp.is_ok() {
                debug!(folder = %name, "Folder opened");
                return Ok(name.clone());
            }
            debug!(folder = %name, reason = %resp.text, "Folder rejected");
        }
        Err(MailboxError::NoFolder {
            candidates: candidates.to_vec(),
        })
    }

    pub fn uid_search(&mut self, query: &str) -> Result<Vec<String>, MailboxError> {
        let resp = self.command(&format!("UID SEARCH {query}"))?;
        if !resp.is_ok() {
            return Err(MailboxError::Search(resp.text));
        }
        Ok(resp
            .untagged
            .iter()
            .flat_map(|line| parse_search_line(line))
            .collect())
    }

    /// Fetch the full message without setting `\Seen`.
    pub fn uid_fetch(&mut self, uid: &str) -> Result<RawMessage, MailboxError> {
        let fetch_err = |reason: String| MailboxError::Fetch {
            uid: uid.to_string(),
            reason,
        };

        let resp = self.command(&format!("UID FETCH {uid} BODY.PEEK[]"))?;
        if !resp.is_ok() {
            return Err(fetch_err(resp.text));
        }
        let raw = resp
            .literals
            .into_iter()
            .max_by_key(|l| l.len())
            .ok_or_else(|| fetch_err("no message body in response".into()))?;

        parse_message(uid, &raw).ok_or_else(|| fetch_err("unparseable message".into()))
    }

    pub fn logout(&mut self) -> Result<(), MailboxError> {
        self.command("LOGOUT").map(|_| ())
    }

    /// Send a tagged command and collect the response up to its tagged line.
    pub fn command(&mut self, cmd: &str) -> Result<Response, MailboxError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let stream = self.stream.get_mut();
        stream.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        stream.flush()?;

        let mut resp = Response::default();
        loop {
            let line = self.read_logical_line(&mut resp.literals)?;
            if let Some(rest) = line.strip_prefix(&tag).and_then(|r| r.strip_prefix(' ')) {
                let (status, text) = rest.split_once(' ').unwrap_or((rest, ""));
                resp.status = match status.to_ascii_uppercase().as_str() {
                    "OK" => Some(Status::Ok),
                    "NO" => Some(Status::No),
                    "BAD" => Some(Status::Bad),
                    other => {
                        return Err(MailboxError::Protocol(format!(
                            "unknown status {other} for {tag}"
                        )));
                    }
                };
                resp.text = text.trim_end().to_string();
                return Ok(resp);
            }
            if line.starts_with("* BYE") && !cmd.eq_ignore_ascii_case("LOGOUT") {
                warn!("IMAP server closed the session: {}", line.trim_end());
            }
            resp.untagged.push(line);
        }
    }

    fn read_raw_line(&mut self) -> Result<String, MailboxError> {
        let mut buf = Vec::new();
        let n = self.stream.read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Err(MailboxError::Protocol("IMAP connection closed".into()));
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Read one line, pulling in any `{n}` literals it announces.
    fn read_logical_line(&mut self, literals: &mut Vec<Vec<u8>>) -> Result<String, MailboxError> {
        let mut line = String::new();
        loop {
            let segment = self.read_raw_line()?;
            let trimmed = segment.trim_end_matches(['\r', '\n']);
            match literal_len(trimmed) {
                Some(len) => {
                    line.push_str(trimmed);
                    let mut literal = vec![0u8; len];
                    self.stream.read_exact(&mut literal)?;
                    literals.push(literal);
                }
                None => {
                    line.push_str(trimmed);
                    return Ok(line);
                }
            }
        }
    }
}

// ── Helpers (public for testing) ────────────────────────────────────

/// Quote a string for use as an IMAP quoted string.
pub fn quote(s: &str) -> String {
    let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// Length of a trailing `{n}` literal marker, if the line ends with one.
pub fn literal_len(line: &str) -> Option<usize> {
    let inner = line.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].trim_end_matches('+').parse().ok()
}

/// Identifiers from a `* SEARCH ...` line; empty for any other line.
pub fn parse_search_line(line: &str) -> Vec<String> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("*"), Some(kw)) if kw.eq_ignore_ascii_case("SEARCH") => {
            parts.map(|s| s.to_string()).collect()
        }
        _ => Vec::new(),
    }
}

/// Parse RFC 822 bytes into the fields the pipeline needs.
pub fn parse_message(uid: &str, raw: &[u8]) -> Option<RawMessage> {
    let parsed = MessageParser::default().parse(raw)?;
    Some(RawMessage {
        uid: uid.to_string(),
        from: parsed
            .from()
            .and_then(|addr| addr.first())
            .and_then(|a| a.address())
            .map(|s| s.to_string()),
        subject: parsed.subject().map(|s| s.to_string()),
        text: parsed.body_text(0).map(|s| s.into_owned()),
        html: parsed.body_html(0).map(|s| s.into_owned()),
    })
}

// ── Tests ───────────────────────────────────────────────────────────
