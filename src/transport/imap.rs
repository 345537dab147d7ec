//! IMAP/SMTP mailbox transport.
//!
//! Reading uses raw IMAP over rustls; sending uses lettre SMTP. Marker
//! mapping: `unread` is the absence of `\Seen`, `claimed` is the configured
//! keyword. Claims use CONDSTORE `UNCHANGEDSINCE` when the server offers it,
//! which makes them compare-and-set across agents sharing the mailbox.
//! Without CONDSTORE a claim is a plain flag store and two agents polling at
//! the same instant could both win.
//!
//! All socket work is blocking and runs in `spawn_blocking`. One
//! authenticated session is kept open and replaced after any I/O or protocol
//! error. A claim that may have been stored when its session failed is
//! released at the start of the next poll.

use std::collections::{BTreeSet, HashMap};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, LazyLock, Mutex};

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{SmtpTransport, Transport as _};
use regex::Regex;
use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use super::mime::{self, new_email_id, thread_root};
use super::state::{MarkerState, ProcessingState};
use super::Transport;
use crate::config::{ImapConfig, SmtpConfig};
use crate::error::TransportError;
use crate::message::Message;

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

static LITERAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(\d+)\}$").expect("valid regex"));
static FLAGS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"FLAGS \(([^)]*)\)").expect("valid regex"));
static MODSEQ_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"MODSEQ \((\d+)\)").expect("valid regex"));
static PERMANENTFLAGS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[PERMANENTFLAGS \(([^)]*)\)\]").expect("valid regex"));

/// Quote a string as an IMAP quoted string.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Command name for error reports; never includes arguments.
fn verb(command: &str) -> String {
    let mut words = command.split_whitespace();
    match words.next() {
        Some("UID") => format!("UID {}", words.next().unwrap_or_default()),
        Some(word) => word.to_string(),
        None => String::new(),
    }
}

/// If `line` ends with a literal announcement `{N}`, the offset where it
/// starts and `N`.
fn literal_len(line: &str) -> Option<(usize, usize)> {
    let caps = LITERAL_RE.captures(line)?;
    let whole = caps.get(0)?;
    let len = caps[1].parse().ok()?;
    Some((whole.start(), len))
}

/// UIDs from `* SEARCH` responses, ascending.
fn parse_search<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<u32> {
    let mut uids: Vec<u32> = lines
        .into_iter()
        .filter_map(|line| line.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace())
        .filter_map(|token| token.parse().ok())
        .collect();
    uids.sort_unstable();
    uids.dedup();
    uids
}

fn parse_flags(line: &str) -> Option<Vec<String>> {
    let caps = FLAGS_RE.captures(line)?;
    Some(caps[1].split_whitespace().map(str::to_string).collect())
}

fn parse_modseq(line: &str) -> Option<u64> {
    MODSEQ_RE.captures(line)?[1].parse().ok()
}

/// Marker bits encoded by a FLAGS list.
fn markers_from_flags(flags: &[String], keyword: &str) -> MarkerState {
    MarkerState {
        unread: !flags.iter().any(|f| f.eq_ignore_ascii_case("\\Seen")),
        claimed: flags.iter().any(|f| f.eq_ignore_ascii_case(keyword)),
    }
}

/// Whether a PERMANENTFLAGS list lets clients store `keyword`.
fn keyword_permitted(permanent_flags: &str, keyword: &str) -> bool {
    permanent_flags
        .split_whitespace()
        .any(|f| f == "\\*" || f.eq_ignore_ascii_case(keyword))
}

struct Untagged {
    /// Response text with literal payloads removed.
    text: String,
    literals: Vec<Vec<u8>>,
}

struct Reply {
    untagged: Vec<Untagged>,
    /// Tagged completion, e.g. `OK [MODIFIED 7] Conditional STORE failed`.
    status: String,
}

impl Reply {
    fn is_ok(&self) -> bool {
        self.status.starts_with("OK")
    }

    fn fetch_lines(&self) -> impl Iterator<Item = &Untagged> {
        self.untagged.iter().filter(|u| u.text.contains(" FETCH "))
    }
}

/// Why a single claim attempt stopped.
struct ClaimFailure {
    error: TransportError,
    /// The keyword may be set on the server with nobody processing the
    /// message.
    held: bool,
}

impl ClaimFailure {
    fn untouched(error: TransportError) -> Self {
        Self { error, held: false }
    }

    fn held(error: TransportError) -> Self {
        Self { error, held: true }
    }
}

/// Claim bookkeeping that outlives any one session.
#[derive(Default)]
struct ClaimBook {
    /// Message-ID to UID for claimed messages not yet completed.
    uids: Mutex<HashMap<String, u32>>,
    /// UIDs whose keyword must be removed before the next claim round.
    releases: Mutex<BTreeSet<u32>>,
}

impl ClaimBook {
    fn remember(&self, message_id: &str, uid: u32) {
        if let Ok(mut uids) = self.uids.lock() {
            uids.insert(message_id.to_string(), uid);
        }
    }

    fn lookup(&self, message_id: &str) -> Option<u32> {
        self.uids.lock().ok()?.get(message_id).copied()
    }

    fn forget(&self, message_id: &str) {
        if let Ok(mut uids) = self.uids.lock() {
            uids.remove(message_id);
        }
    }

    fn defer_release(&self, uid: u32) {
        if let Ok(mut releases) = self.releases.lock() {
            releases.insert(uid);
        }
    }

    fn take_releases(&self) -> Vec<u32> {
        self.releases
            .lock()
            .map(|mut releases| std::mem::take(&mut *releases).into_iter().collect())
            .unwrap_or_default()
    }
}

/// One authenticated IMAP connection with a selected mailbox.
struct ImapSession<S: Read + Write> {
    stream: BufReader<S>,
    next_tag: u32,
    condstore: bool,
    permanent_flags: String,
    /// Set once the stream can no longer be trusted to be in sync.
    broken: bool,
}

impl ImapSession<TlsStream> {
    fn connect(config: &ImapConfig) -> Result<Self, TransportError> {
        let connect_err = |reason: String| TransportError::Connect {
            host: config.host.clone(),
            reason,
        };

        let tcp = TcpStream::connect((config.host.as_str(), config.port))
            .map_err(|e| connect_err(e.to_string()))?;
        tcp.set_read_timeout(Some(config.timeout))?;
        tcp.set_write_timeout(Some(config.timeout))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls_pki_types::ServerName::try_from(config.host.clone())
            .map_err(|e| connect_err(e.to_string()))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| connect_err(e.to_string()))?;

        let mut session = Self::new(rustls::StreamOwned::new(conn, tcp));
        if let Err(e) = session.handshake(config) {
            session.broken = true;
            return Err(e);
        }
        Ok(session)
    }
}

impl<S: Read + Write> ImapSession<S> {
    fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
            next_tag: 1,
            condstore: false,
            permanent_flags: String::new(),
            broken: false,
        }
    }

    /// Greeting, LOGIN, CAPABILITY and SELECT.
    fn handshake(&mut self, config: &ImapConfig) -> Result<(), TransportError> {
        let greeting = self.read_line()?;
        if !greeting.starts_with("* OK") && !greeting.starts_with("* PREAUTH") {
            return Err(TransportError::Connect {
                host: config.host.clone(),
                reason: format!("unexpected greeting: {}", greeting.trim_end()),
            });
        }

        let login = self.exchange(&format!(
            "LOGIN {} {}",
            quote(&config.username),
            quote(config.password.expose_secret())
        ))?;
        if !login.is_ok() {
            return Err(TransportError::AuthFailed {
                user: config.username.clone(),
            });
        }

        let capabilities = self.run("CAPABILITY")?;
        let server_condstore = capabilities
            .untagged
            .iter()
            .any(|u| u.text.starts_with("* CAPABILITY") && u.text.contains("CONDSTORE"));
        let use_condstore = config.condstore && server_condstore;

        let select = if use_condstore {
            format!("SELECT {} (CONDSTORE)", quote(&config.mailbox))
        } else {
            format!("SELECT {}", quote(&config.mailbox))
        };
        let selected = self.run(&select)?;
        self.condstore =
            use_condstore && !selected.untagged.iter().any(|u| u.text.contains("[NOMODSEQ]"));
        self.permanent_flags = selected
            .untagged
            .iter()
            .find_map(|u| PERMANENTFLAGS_RE.captures(&u.text).map(|c| c[1].to_string()))
            .unwrap_or_default();

        debug!(
            host = %config.host,
            mailbox = %config.mailbox,
            condstore = self.condstore,
            "IMAP session ready"
        );
        Ok(())
    }

    fn read_line(&mut self) -> Result<String, TransportError> {
        let mut buf = Vec::new();
        if self.stream.read_until(b'\n', &mut buf)? == 0 {
            return Err(TransportError::Unavailable("IMAP connection closed".into()));
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Read responses up to and including the one tagged `tag`.
    fn read_reply(&mut self, tag: &str) -> Result<Reply, TransportError> {
        let mut untagged = Vec::new();
        loop {
            let mut text = String::new();
            let mut literals = Vec::new();
            loop {
                let raw = self.read_line()?;
                let line = raw.trim_end_matches(['\r', '\n']);
                match literal_len(line) {
                    Some((start, len)) => {
                        text.push_str(&line[..start]);
                        let mut literal = vec![0u8; len];
                        self.stream.read_exact(&mut literal)?;
                        literals.push(literal);
                    }
                    None => {
                        text.push_str(line);
                        break;
                    }
                }
            }

            if let Some(status) = text.strip_prefix(tag).and_then(|s| s.strip_prefix(' ')) {
                return Ok(Reply {
                    untagged,
                    status: status.to_string(),
                });
            }
            untagged.push(Untagged { text, literals });
        }
    }

    /// Send a command and collect its reply, whatever the completion status.
    fn exchange(&mut self, command: &str) -> Result<Reply, TransportError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let stream = self.stream.get_mut();
        stream.write_all(format!("{tag} {command}\r\n").as_bytes())?;
        stream.flush()?;
        self.read_reply(&tag)
    }

    /// Send a command that must complete with `OK`.
    fn run(&mut self, command: &str) -> Result<Reply, TransportError> {
        let reply = self.exchange(command)?;
        if !reply.is_ok() {
            return Err(TransportError::Rejected {
                command: verb(command),
                response: reply.status,
            });
        }
        Ok(reply)
    }

    fn search(&mut self, criteria: &str) -> Result<Vec<u32>, TransportError> {
        let reply = self.run(&format!("UID SEARCH {criteria}"))?;
        Ok(parse_search(reply.untagged.iter().map(|u| u.text.as_str())))
    }

    /// Current markers of `uid`, with its MODSEQ when CONDSTORE is active.
    /// `None` if the message no longer exists.
    fn markers(
        &mut self,
        uid: u32,
        keyword: &str,
    ) -> Result<Option<(MarkerState, Option<u64>)>, TransportError> {
        let items = if self.condstore { "(MODSEQ FLAGS)" } else { "(FLAGS)" };
        let reply = self.run(&format!("UID FETCH {uid} {items}"))?;
        Ok(reply.fetch_lines().find_map(|u| {
            let flags = parse_flags(&u.text)?;
            Some((markers_from_flags(&flags, keyword), parse_modseq(&u.text)))
        }))
    }

    /// Raw RFC 5322 bytes of `uid`, without setting `\Seen`.
    fn fetch_raw(&mut self, uid: u32) -> Result<Option<Vec<u8>>, TransportError> {
        let reply = self.run(&format!("UID FETCH {uid} (BODY.PEEK[])"))?;
        Ok(reply
            .untagged
            .into_iter()
            .filter(|u| u.text.contains(" FETCH "))
            .find_map(|u| u.literals.into_iter().next()))
    }

    fn add_flag(&mut self, uid: u32, flag: &str) -> Result<(), TransportError> {
        self.run(&format!("UID STORE {uid} +FLAGS.SILENT ({flag})"))
            .map(|_| ())
    }

    fn remove_flag(&mut self, uid: u32, flag: &str) -> Result<(), TransportError> {
        self.run(&format!("UID STORE {uid} -FLAGS.SILENT ({flag})"))
            .map(|_| ())
    }

    /// UID of `message_id`, from the claim book or a header search.
    fn uid_for(
        &mut self,
        message_id: &str,
        book: &ClaimBook,
    ) -> Result<Option<u32>, TransportError> {
        if let Some(uid) = book.lookup(message_id) {
            return Ok(Some(uid));
        }
        Ok(self
            .search(&format!("HEADER Message-ID {}", quote(message_id)))?
            .into_iter()
            .next())
    }

    /// Claim `uid` and fetch it.
    ///
    /// `Ok(None)` when another agent got there first or the message could not
    /// be read and its claim was released again.
    fn claim_one(&mut self, uid: u32, keyword: &str) -> Result<Option<Message>, ClaimFailure> {
        let Some((markers, modseq)) = self.markers(uid, keyword).map_err(ClaimFailure::untouched)?
        else {
            return Ok(None);
        };
        if !markers.state().can_transition_to(ProcessingState::Claimed) {
            return Ok(None);
        }

        let command = match modseq.filter(|_| self.condstore) {
            Some(modseq) => {
                format!("UID STORE {uid} (UNCHANGEDSINCE {modseq}) +FLAGS.SILENT ({keyword})")
            }
            None => format!("UID STORE {uid} +FLAGS.SILENT ({keyword})"),
        };
        let reply = self.run(&command).map_err(|e| match e {
            e @ TransportError::Rejected { .. } => ClaimFailure::untouched(e),
            e => ClaimFailure::held(e),
        })?;
        if reply.status.contains("[MODIFIED") {
            debug!(uid, "Claim lost, skipping");
            return Ok(None);
        }

        let parsed = self.fetch_raw(uid).and_then(|raw| {
            let raw = raw.ok_or_else(|| {
                TransportError::Protocol(format!("no body returned for UID {uid}"))
            })?;
            Ok(mime::from_email(&raw)?)
        });
        match parsed {
            Ok(message) => Ok(Some(message)),
            Err(e) => {
                warn!(uid, "Fetch after claim failed, releasing: {e}");
                self.remove_flag(uid, keyword).map_err(ClaimFailure::held)?;
                Ok(None)
            }
        }
    }

    /// Release leftover claims, then claim up to `limit` pending messages.
    ///
    /// A failure after at least one claim ends the batch but still returns
    /// what was claimed, and marks the session broken.
    fn claim_batch(
        &mut self,
        keyword: &str,
        limit: usize,
        book: &ClaimBook,
    ) -> Result<Vec<Message>, TransportError> {
        let releases = book.take_releases();
        for (i, &uid) in releases.iter().enumerate() {
            if let Err(e) = self.remove_flag(uid, keyword) {
                for &uid in &releases[i..] {
                    book.defer_release(uid);
                }
                return Err(e);
            }
            info!(uid, "Released leftover claim");
        }

        let candidates = self.search(&format!("UNSEEN UNKEYWORD {keyword}"))?;

        let mut claimed = Vec::new();
        for uid in candidates {
            if claimed.len() >= limit {
                break;
            }
            match self.claim_one(uid, keyword) {
                Ok(Some(message)) => {
                    book.remember(&message.message_id, uid);
                    claimed.push(message);
                }
                Ok(None) => {}
                Err(ClaimFailure { error, held }) => {
                    if held {
                        book.defer_release(uid);
                    }
                    if matches!(error, TransportError::Rejected { .. }) {
                        warn!(uid, "Skipping message: {error}");
                        continue;
                    }
                    if claimed.is_empty() {
                        return Err(error);
                    }
                    warn!(uid, claimed = claimed.len(), "Claim round cut short: {error}");
                    self.broken = true;
                    break;
                }
            }
        }
        Ok(claimed)
    }

    fn mark(
        &mut self,
        message_id: &str,
        keyword: &str,
        target: ProcessingState,
        book: &ClaimBook,
    ) -> Result<bool, TransportError> {
        let Some(uid) = self.uid_for(message_id, book)? else {
            debug!(message_id, "No such message in mailbox");
            return Ok(false);
        };
        let Some((markers, _)) = self.markers(uid, keyword)? else {
            book.forget(message_id);
            return Ok(false);
        };

        let current = markers.state();
        if current.is_terminal() {
            if target == ProcessingState::Done && markers.claimed {
                // Finish a success commit interrupted between its two stores.
                self.remove_flag(uid, keyword)?;
                book.forget(message_id);
                return Ok(true);
            }
            debug!(message_id, to = %target, "Message already done");
            return Ok(false);
        }
        if !current.can_transition_to(target) {
            debug!(message_id, from = %current, to = %target, "Refusing marker transition");
            return Ok(false);
        }

        match target {
            ProcessingState::Done => {
                self.add_flag(uid, "\\Seen")?;
                self.remove_flag(uid, keyword)?;
                book.forget(message_id);
            }
            ProcessingState::Pending => self.remove_flag(uid, keyword)?,
            ProcessingState::Claimed => self.add_flag(uid, keyword)?,
        }
        Ok(true)
    }

    fn fetch_message(
        &mut self,
        message_id: &str,
        book: &ClaimBook,
    ) -> Result<Option<Message>, TransportError> {
        let Some(uid) = self.uid_for(message_id, book)? else {
            return Ok(None);
        };
        match self.fetch_raw(uid)? {
            Some(raw) => Ok(Some(mime::from_email(&raw)?)),
            None => Ok(None),
        }
    }
}

impl<S: Read + Write> Drop for ImapSession<S> {
    fn drop(&mut self) {
        if !self.broken {
            let _ = self.exchange("LOGOUT");
        }
    }
}

struct Inner {
    address: String,
    config: ImapConfig,
    session: Mutex<Option<ImapSession<TlsStream>>>,
    book: ClaimBook,
    mailer: SmtpTransport,
}

impl Inner {
    /// Run `op` on the live session, connecting first if needed. The session
    /// is discarded after any error other than a command rejection, and
    /// after a cut-short claim round.
    fn with_session<T>(
        &self,
        op: impl FnOnce(&mut ImapSession<TlsStream>) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let mut guard = self
            .session
            .lock()
            .map_err(|_| TransportError::Unavailable("IMAP session lock poisoned".into()))?;
        if guard.is_none() {
            *guard = Some(ImapSession::<TlsStream>::connect(&self.config)?);
        }
        let session = guard
            .as_mut()
            .ok_or_else(|| TransportError::Unavailable("no IMAP session".into()))?;

        let result = op(session);
        let failed = matches!(&result, Err(e) if !matches!(e, TransportError::Rejected { .. }));
        if failed || session.broken {
            if let Err(e) = &result {
                warn!("Dropping IMAP session after error: {e}");
            } else {
                warn!("Dropping IMAP session after a failed claim");
            }
            session.broken = true;
            *guard = None;
        }
        result
    }

    fn keyword(&self) -> &str {
        &self.config.claim_keyword
    }
}

/// Transport over an IMAP mailbox and its SMTP relay.
pub struct ImapTransport {
    inner: Arc<Inner>,
}

impl ImapTransport {
    /// Build the transport. No connection is opened until first use.
    pub fn new(
        address: impl Into<String>,
        imap: ImapConfig,
        smtp: &SmtpConfig,
    ) -> Result<Self, TransportError> {
        let creds = Credentials::new(
            smtp.username.clone(),
            smtp.password.expose_secret().to_string(),
        );
        let relay = if smtp.port == 465 {
            SmtpTransport::relay(&smtp.host)
        } else {
            SmtpTransport::starttls_relay(&smtp.host)
        };
        let mailer = relay
            .map_err(|e| TransportError::Connect {
                host: smtp.host.clone(),
                reason: format!("SMTP relay error: {e}"),
            })?
            .port(smtp.port)
            .credentials(creds)
            .timeout(Some(imap.timeout))
            .build();

        Ok(Self {
            inner: Arc::new(Inner {
                address: address.into(),
                config: imap,
                session: Mutex::new(None),
                book: ClaimBook::default(),
                mailer,
            }),
        })
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, TransportError>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T, TransportError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || op(&inner))
            .await
            .map_err(|e| TransportError::Unavailable(format!("IMAP task failed: {e}")))?
    }
}

#[async_trait]
impl Transport for ImapTransport {
    fn name(&self) -> &str {
        "imap"
    }

    fn address(&self) -> &str {
        &self.inner.address
    }

    async fn prepare(&self) -> Result<(), TransportError> {
        self.blocking(|inner| {
            inner.with_session(|session| {
                let keyword = inner.keyword();
                if !keyword_permitted(&session.permanent_flags, keyword) {
                    return Err(TransportError::Rejected {
                        command: "SELECT".into(),
                        response: format!(
                            "mailbox {} does not permit keyword {keyword} (PERMANENTFLAGS: {})",
                            inner.config.mailbox, session.permanent_flags
                        ),
                    });
                }
                info!(
                    mailbox = %inner.config.mailbox,
                    keyword = %keyword,
                    condstore = session.condstore,
                    "IMAP mailbox ready"
                );
                if !session.condstore {
                    warn!("Server lacks CONDSTORE; concurrent claims are best effort");
                }
                Ok(())
            })
        })
        .await
    }

    async fn list_claimable(&self, limit: usize) -> Result<Vec<Message>, TransportError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.blocking(move |inner| {
            inner.with_session(|s| s.claim_batch(inner.keyword(), limit, &inner.book))
        })
        .await
    }

    async fn send(&self, mut message: Message) -> Result<Message, TransportError> {
        if message.sender.is_empty() {
            message.sender = self.inner.address.clone();
        }
        let message = message.with_message_id(new_email_id(&self.inner.address));
        let thread = thread_root(&message.references, &message.message_id);
        let message = message.with_thread_id(Some(thread));
        let email = mime::to_email(&message)?;

        self.blocking(move |inner| {
            inner
                .mailer
                .send(&email)
                .map_err(|e| TransportError::SendFailed {
                    recipient: message.recipient.clone(),
                    reason: format!("SMTP send failed: {e}"),
                })?;
            info!(
                message_id = %message.message_id,
                recipient = %message.recipient,
                "Email sent"
            );
            Ok(message)
        })
        .await
    }

    async fn mark_succeeded(&self, message_id: &str) -> Result<bool, TransportError> {
        let id = message_id.to_string();
        self.blocking(move |inner| {
            inner.with_session(|s| s.mark(&id, inner.keyword(), ProcessingState::Done, &inner.book))
        })
        .await
    }

    async fn mark_failed(&self, message_id: &str) -> Result<bool, TransportError> {
        let id = message_id.to_string();
        self.blocking(move |inner| {
            inner.with_session(|s| {
                s.mark(&id, inner.keyword(), ProcessingState::Pending, &inner.book)
            })
        })
        .await
    }

    async fn fetch(&self, message_id: &str) -> Result<Option<Message>, TransportError> {
        let id = message_id.to_string();
        self.blocking(move |inner| inner.with_session(|s| s.fetch_message(&id, &inner.book)))
            .await
    }
}
