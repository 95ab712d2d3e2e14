use crate::Opt;
use crate::filter::{ContentFilter, Verdict};
use crate::identity::PeerAddr;
use crate::session::Session;
use crate::utils::Logger;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

/// Taille des blocs de corps transmis par le MTA
pub const BODY_CHUNK_SIZE: usize = 65535;

/// Message découpé comme le MTA le présenterait au filtre
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ParsedMessage {
    pub sender: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Sépare en-têtes et corps, et déplie les en-têtes sur plusieurs lignes.
pub fn parse_message(raw: &[u8]) -> ParsedMessage {
    let (head, body) = match (find(raw, b"\r\n\r\n"), find(raw, b"\n\n")) {
        (Some(crlf), Some(lf)) if lf < crlf => (&raw[..lf], &raw[lf + 2..]),
        (Some(crlf), _) => (&raw[..crlf], &raw[crlf + 4..]),
        (None, Some(lf)) => (&raw[..lf], &raw[lf + 2..]),
        (None, None) => (raw, &raw[raw.len()..]),
    };

    let head = String::from_utf8_lossy(head);
    let mut headers: Vec<(String, String)> = Vec::new();

    for line in head.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = headers.last_mut() {
                value.push_str("\r\n");
                value.push_str(line);
            }
            continue;
        }

        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim_start().to_string()));
        }
    }

    let sender = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("Return-Path"))
        .map(|(_, value)| value.trim().to_string())
        .unwrap_or_else(|| "<>".to_string());

    ParsedMessage {
        sender,
        headers,
        body: body.to_vec(),
    }
}

/// Construit la `struct sockaddr` que le MTA transmettrait au filtre.
pub fn raw_peer(opt: &Opt) -> libc::sockaddr_storage {
    // SAFETY: une sockaddr_storage remplie de zéros est valide
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };

    if opt.unix_peer {
        storage.ss_family = libc::AF_UNIX as libc::sa_family_t;
        return storage;
    }

    let target: *mut libc::sockaddr_storage = &mut storage;
    match opt.peer {
        SocketAddr::V4(addr) => {
            // SAFETY: structure C sans invariant, zéro est une valeur valide
            let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = addr.port().to_be();
            sin.sin_addr.s_addr = u32::from(*addr.ip()).to_be();
            // SAFETY: sockaddr_storage est assez grande et alignée pour sockaddr_in
            unsafe { std::ptr::write(target.cast(), sin) };
        }
        SocketAddr::V6(addr) => {
            // SAFETY: idem pour sockaddr_in6
            let mut sin6: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = addr.port().to_be();
            sin6.sin6_flowinfo = addr.flowinfo().to_be();
            sin6.sin6_scope_id = addr.scope_id();
            sin6.sin6_addr.s6_addr = addr.ip().octets();
            // SAFETY: sockaddr_storage est assez grande et alignée pour sockaddr_in6
            unsafe { std::ptr::write(target.cast(), sin6) };
        }
    }

    storage
}

/// Rejoue des fichiers .eml à travers le filtre, comme le ferait un MTA.
pub struct Replayer {
    pub opt: Opt,
    logger: Arc<Logger>,
    filter: ContentFilter,
    peer: PeerAddr,
}

impl Replayer {
    pub fn new(opt: Opt) -> Result<Self> {
        let logger = Arc::new(
            Logger::new(opt.log_file.clone(), opt.raw_display, opt.verbose)
                .context("Failed to open log file")?,
        );

        if !opt.tmpdir.is_dir() {
            eprintln!("[WARNING] Temporary directory {:?} is not accessible", opt.tmpdir);
        }

        let storage = raw_peer(&opt);
        let addr: *const libc::sockaddr = if opt.no_peer {
            std::ptr::null()
        } else {
            (&storage as *const libc::sockaddr_storage).cast()
        };
        // SAFETY: nul ou sockaddr_storage initialisée par raw_peer
        let peer = unsafe { PeerAddr::from_raw(addr) };

        let filter = ContentFilter::new(opt.tmpdir.clone(), opt.keep_temp_files, logger.clone());

        Ok(Self { opt, logger, filter, peer })
    }

    fn replay_message(&self, session: &mut Session, message: &ParsedMessage) -> Verdict {
        let verdict = self.drive(session, message);
        if let Verdict::Reject { status, code, reason } = verdict {
            self.logger.log(session.id(), &format!("message rejected: {} {} {}", status, code, reason));
        }
        if verdict != Verdict::Continue {
            self.logger.log(session.id(), &format!("message not accepted: {:?}", verdict));
            self.filter.abort(session);
        }
        verdict
    }

    fn drive(&self, session: &mut Session, message: &ParsedMessage) -> Verdict {
        let verdict = self.filter.envelope_from(session, &message.sender);
        if verdict != Verdict::Continue {
            return verdict;
        }

        for (name, value) in &message.headers {
            self.logger.log_verbose(session.id(), "HEADER", &format!("{}: {}", name, value));
            let verdict = self.filter.header(session, name, value);
            if verdict != Verdict::Continue {
                return verdict;
            }
        }

        let verdict = self.filter.end_of_headers(session);
        if verdict != Verdict::Continue {
            return verdict;
        }

        for chunk in message.body.chunks(BODY_CHUNK_SIZE) {
            let verdict = self.filter.body(session, chunk);
            if verdict != Verdict::Continue {
                return verdict;
            }
        }

        self.filter.end_of_message(session)
    }

    /// Une connexion : une session, plusieurs messages séparés par un reset.
    fn replay_connection(&self, messages: Vec<(PathBuf, Vec<u8>)>) -> Vec<Verdict> {
        let mut session = self.filter.connect(&self.opt.hostname, &self.peer);

        let verdicts = messages
            .iter()
            .map(|(path, raw)| {
                self.logger.log(session.id(), &format!("replaying {:?}", path));
                self.replay_message(&mut session, &parse_message(raw))
            })
            .collect();

        self.filter.close(session);
        verdicts
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut connections: Vec<Vec<(PathBuf, Vec<u8>)>> = Vec::new();

        for path in &self.opt.messages {
            let raw = tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read message: {:?}", path))?;

            // En mode réutilisation, tous les messages passent par la même connexion
            if self.opt.reuse {
                if let Some(batch) = connections.last_mut() {
                    batch.push((path.clone(), raw));
                    continue;
                }
            }
            connections.push(vec![(path.clone(), raw)]);
        }

        let mut handles = vec![];

        for messages in connections {
            let this = self.clone();
            handles.push(tokio::task::spawn_blocking(move || this.replay_connection(messages)));
        }

        let mut failed = 0;
        for handle in handles {
            failed += handle.await?.into_iter().filter(|v| *v != Verdict::Continue).count();
        }

        if failed > 0 {
            eprintln!("[WARNING] {} message(s) were not accepted", failed);
        }

        Ok(())
    }
}
