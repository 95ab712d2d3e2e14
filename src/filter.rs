use std::io::{Seek, Write};
use std::path::PathBuf;
use std::sync::Arc;

use crate::identity::PeerAddr;
use crate::session::{MailFlags, Session};
use crate::utils::Diagnostics;

/// En-tête ajouté par le filtre aux messages signés
pub const FILTER_HEADER: &str = "X-Sigh";

/// En-têtes copiés dans le spool et notés pour réécriture
pub const MARKED_HEADERS: [&str; 7] = [
    FILTER_HEADER,
    "MIME-Version",
    "Content-ID",
    "Content-Type",
    "Content-Disposition",
    "Content-Description",
    "Content-Transfer-Encoding",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    TempFail,
    Reject {
        status: &'static str,
        code: &'static str,
        reason: &'static str,
    },
    Accept,
}

fn starts_with_ignore_case(value: &str, prefix: &str) -> bool {
    value.len() >= prefix.len()
        && value.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

/// Enchaînement des rappels du MTA sur une session.
pub struct ContentFilter {
    tmpdir: PathBuf,
    retain_spool: bool,
    sink: Arc<dyn Diagnostics>,
}

impl ContentFilter {
    pub fn new(tmpdir: PathBuf, retain_spool: bool, sink: Arc<dyn Diagnostics>) -> Self {
        Self { tmpdir, retain_spool, sink }
    }

    pub fn connect(&self, hostname: &str, peer: &PeerAddr) -> Session {
        let session = Session::new(hostname, peer, self.sink.clone()).retain_spool(self.retain_spool);
        self.sink.note(
            session.id(),
            &format!("connect from hostname={} socket={}", session.hostname, session.descriptor()),
        );
        session
    }

    pub fn envelope_from(&self, session: &mut Session, sender: &str) -> Verdict {
        if session.open_spool(&self.tmpdir).is_err() {
            return Verdict::TempFail;
        }

        session.annotate("envfrom", sender);
        Verdict::Continue
    }

    pub fn header(&self, session: &mut Session, name: &str, value: &str) -> Verdict {
        let Some(marked) = MARKED_HEADERS.iter().find(|h| starts_with_ignore_case(name, h)) else {
            return Verdict::Continue;
        };

        session.mark_header(name, value);

        if starts_with_ignore_case(name, "MIME-Version") {
            session.mail_flags |= MailFlags::MIME;
        }
        if starts_with_ignore_case(name, "Content-Type") && value.contains("multipart/") {
            session.mail_flags |= MailFlags::MULTIPART;
        }

        // Notre propre en-tête n'est pas recopié
        if *marked == FILTER_HEADER {
            return Verdict::Continue;
        }

        self.write_spool(session, format!("{}: {}\r\n", name, value).as_bytes(), "Unable to write header")
    }

    pub fn end_of_headers(&self, session: &mut Session) -> Verdict {
        // Content-Type multipart sans MIME-Version : RFC 2045
        if session.mail_flags.contains(MailFlags::MULTIPART) && !session.mail_flags.contains(MailFlags::MIME) {
            return Verdict::Reject {
                status: "554",
                code: "5.6.0",
                reason: "RFC2045 violation",
            };
        }

        self.write_spool(session, b"\r\n", "Unable to write end of header")
    }

    pub fn body(&self, session: &mut Session, chunk: &[u8]) -> Verdict {
        if chunk.is_empty() {
            return Verdict::Continue;
        }

        let mut chunk = chunk;

        // Préambule optionnel avant la première frontière, RFC 2046 5.1.1
        if session.optional_preamble && session.mail_flags.contains(MailFlags::MULTIPART) {
            match chunk.windows(2).position(|w| w == b"--") {
                Some(start) => {
                    chunk = &chunk[start..];
                    session.optional_preamble = false;
                }
                None => return Verdict::Continue,
            }
        }

        self.write_spool(session, chunk, "Unable to write body")
    }

    pub fn end_of_message(&self, session: &mut Session) -> Verdict {
        let id = session.id();

        let size = match session.spool() {
            Some(spool) => match spool.rewind().and_then(|_| spool.len()) {
                Ok(size) => size,
                Err(e) => {
                    self.sink.report(Some(id), &format!("Unwilling to rewind temp file: {}", e));
                    return Verdict::TempFail;
                }
            },
            None => {
                self.sink.report(Some(id), "Temp file is not open");
                return Verdict::TempFail;
            }
        };

        if session.generic_error {
            return Verdict::TempFail;
        }

        let sender = session
            .annotation("envfrom")
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .unwrap_or_default();
        let kind = if session.mail_flags.is_none() {
            "plain"
        } else if session.mail_flags.contains(MailFlags::MULTIPART) {
            "multipart"
        } else {
            "mime"
        };
        self.sink.note(
            id,
            &format!(
                "message from={} size={} type={} marked_headers={}",
                sender,
                size,
                kind,
                session.header_rewrites.len()
            ),
        );

        self.cleanup(session);
        Verdict::Continue
    }

    pub fn abort(&self, session: &mut Session) -> Verdict {
        if session.spool_opened() {
            self.sink.note(session.id(), "message aborted, discarding spool");
        }
        self.cleanup(session);
        Verdict::Continue
    }

    pub fn close(&self, session: Session) -> Verdict {
        self.sink.note(
            session.id(),
            &format!("disconnect from hostname={} socket={}", session.hostname, session.descriptor()),
        );

        let id = session.id();
        let report = session.close();
        if !report.is_clean() {
            self.sink.note(id, &format!("cleanup finished with {} failure(s)", report.failures));
        }
        Verdict::Accept
    }

    fn cleanup(&self, session: &mut Session) {
        let report = session.reset();
        if !report.is_clean() {
            self.sink.note(session.id(), &format!("reset finished with {} failure(s)", report.failures));
        }
    }

    fn write_spool(&self, session: &mut Session, bytes: &[u8], what: &str) -> Verdict {
        let id = session.id();
        let result = match session.spool() {
            Some(spool) => spool.write_all(bytes),
            None => {
                self.sink.report(Some(id), &format!("{}: temp file is not open", what));
                return Verdict::TempFail;
            }
        };

        match result {
            Ok(()) => Verdict::Continue,
            Err(e) => {
                self.sink.report(Some(id), &format!("{}: {}", what, e));
                Verdict::TempFail
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::testing::Recorder;
    use std::io::Read;
    use std::net::SocketAddr;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (ContentFilter, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let filter = ContentFilter::new(dir.path().to_path_buf(), false, recorder.clone());
        (filter, recorder)
    }

    fn peer() -> PeerAddr {
        PeerAddr::from("[2001:db8::1]:587".parse::<SocketAddr>().unwrap())
    }

    fn spooled(session: &mut Session) -> String {
        let spool = session.spool().unwrap();
        spool.rewind().unwrap();
        let mut buf = String::new();
        spool.read_to_string(&mut buf).unwrap();
        buf
    }

    #[test]
    fn envelope_from_opens_spool_and_records_sender() {
        let dir = TempDir::new().unwrap();
        let (filter, _) = setup(&dir);
        let mut s = filter.connect("mx.example.org", &peer());

        assert_eq!(filter.envelope_from(&mut s, "<alice@example.org>"), Verdict::Continue);
        assert!(s.spool_opened());
        assert_eq!(s.annotation("envfrom"), Some(&b"<alice@example.org>"[..]));
        assert_eq!(s.descriptor(), "[2001:db8::1]:587");
    }

    #[test]
    fn envelope_from_fails_when_tmpdir_is_missing() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder::default());
        let filter = ContentFilter::new(dir.path().join("gone"), false, recorder.clone());
        let mut s = filter.connect("mx.example.org", &peer());

        assert_eq!(filter.envelope_from(&mut s, "<alice@example.org>"), Verdict::TempFail);
        assert!(!s.spool_opened());
        assert_eq!(recorder.report_count(), 1);
    }

    #[test]
    fn only_mime_headers_are_marked_and_spooled() {
        let dir = TempDir::new().unwrap();
        let (filter, _) = setup(&dir);
        let mut s = filter.connect("mx.example.org", &peer());
        filter.envelope_from(&mut s, "<alice@example.org>");

        filter.header(&mut s, "Subject", "hello");
        filter.header(&mut s, "MIME-Version", "1.0");
        filter.header(&mut s, "content-type", "multipart/signed; boundary=b");
        filter.header(&mut s, "X-Sigh", "S/MIME sigh milter");

        assert_eq!(
            s.header_rewrites,
            vec![
                ("MIME-Version".to_string(), "1.0".to_string()),
                ("content-type".to_string(), "multipart/signed; boundary=b".to_string()),
                ("X-Sigh".to_string(), "S/MIME sigh milter".to_string()),
            ]
        );
        assert!(s.mail_flags.contains(MailFlags::MIME | MailFlags::MULTIPART));
        assert_eq!(
            spooled(&mut s),
            "MIME-Version: 1.0\r\ncontent-type: multipart/signed; boundary=b\r\n"
        );
    }

    #[test]
    fn multipart_without_mime_version_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (filter, _) = setup(&dir);
        let mut s = filter.connect("mx.example.org", &peer());
        filter.envelope_from(&mut s, "<alice@example.org>");
        filter.header(&mut s, "Content-Type", "multipart/mixed; boundary=b");

        assert!(matches!(filter.end_of_headers(&mut s), Verdict::Reject { code: "5.6.0", .. }));
    }

    #[test]
    fn preamble_is_stripped_once() {
        let dir = TempDir::new().unwrap();
        let (filter, _) = setup(&dir);
        let mut s = filter.connect("mx.example.org", &peer());
        filter.envelope_from(&mut s, "<alice@example.org>");
        filter.header(&mut s, "MIME-Version", "1.0");
        filter.header(&mut s, "Content-Type", "multipart/mixed; boundary=b");
        assert_eq!(filter.end_of_headers(&mut s), Verdict::Continue);

        filter.body(&mut s, b"This is a multi-part message.\r\n");
        assert!(s.optional_preamble);
        filter.body(&mut s, b"ignored\r\n--b\r\npart one\r\n");
        assert!(!s.optional_preamble);
        filter.body(&mut s, b"text -- kept\r\n--b--\r\n");

        let content = spooled(&mut s);
        assert!(content.ends_with("\r\n\r\n--b\r\npart one\r\ntext -- kept\r\n--b--\r\n"));
        assert!(!content.contains("multi-part message"));
    }

    #[test]
    fn end_of_message_resets_session_and_removes_spool() {
        let dir = TempDir::new().unwrap();
        let (filter, recorder) = setup(&dir);
        let mut s = filter.connect("mx.example.org", &peer());
        filter.envelope_from(&mut s, "<alice@example.org>");
        filter.header(&mut s, "MIME-Version", "1.0");
        filter.end_of_headers(&mut s);
        filter.body(&mut s, b"hello\r\n");
        let path = s.spool_path().unwrap().to_path_buf();

        assert_eq!(filter.end_of_message(&mut s), Verdict::Continue);
        assert!(recorder.notes.lock().unwrap().iter().any(|(_, m)| m.contains("size=28 type=mime")));
        assert!(!s.spool_opened());
        assert!(!path.exists());
        assert!(s.annotations.is_empty());
        assert!(s.header_rewrites.is_empty());
        assert_eq!(recorder.report_count(), 0);

        // Un deuxième message sur la même connexion
        assert_eq!(filter.envelope_from(&mut s, "<bob@example.org>"), Verdict::Continue);
        assert_eq!(filter.close(s), Verdict::Accept);
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn plain_message_is_reported_as_plain() {
        let dir = TempDir::new().unwrap();
        let (filter, recorder) = setup(&dir);
        let mut s = filter.connect("mx.example.org", &peer());
        filter.envelope_from(&mut s, "<alice@example.org>");
        filter.header(&mut s, "Subject", "hi");
        filter.end_of_headers(&mut s);
        filter.body(&mut s, b"x");

        assert_eq!(filter.end_of_message(&mut s), Verdict::Continue);
        assert!(recorder.notes.lock().unwrap().iter().any(|(_, m)| m.contains("type=plain")));
    }

    #[test]
    fn end_of_message_without_spool_is_a_tempfail() {
        let dir = TempDir::new().unwrap();
        let (filter, recorder) = setup(&dir);
        let mut s = filter.connect("mx.example.org", &peer());

        assert_eq!(filter.end_of_message(&mut s), Verdict::TempFail);
        assert_eq!(recorder.last_report().as_deref(), Some("Temp file is not open"));
    }

    #[test]
    fn generic_error_defers_message() {
        let dir = TempDir::new().unwrap();
        let (filter, recorder) = setup(&dir);
        let mut s = filter.connect("mx.example.org", &peer());
        filter.envelope_from(&mut s, "<alice@example.org>");
        s.generic_error = true;

        assert_eq!(filter.end_of_message(&mut s), Verdict::TempFail);
        assert_eq!(filter.abort(&mut s), Verdict::Continue);
        assert!(recorder.notes.lock().unwrap().iter().any(|(_, m)| m == "message aborted, discarding spool"));
        assert!(!s.generic_error);
        assert!(!s.spool_opened());
    }
}
