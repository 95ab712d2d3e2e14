use std::collections::HashMap;
use std::ops::{BitOr, BitOrAssign};
use std::path::Path;
use std::sync::Arc;

use crate::identity::{self, PeerAddr};
use crate::spool::{Spool, SpoolError};
use crate::utils::Diagnostics;

/// En-têtes détectés pendant l'analyse, combinables par OU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MailFlags(u8);

impl MailFlags {
    pub const NONE: MailFlags = MailFlags(0x0);
    pub const MIME: MailFlags = MailFlags(0x1);
    pub const MULTIPART: MailFlags = MailFlags(0x2);

    pub fn contains(self, other: MailFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for MailFlags {
    type Output = MailFlags;

    fn bitor(self, rhs: MailFlags) -> MailFlags {
        MailFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for MailFlags {
    fn bitor_assign(&mut self, rhs: MailFlags) {
        self.0 |= rhs.0;
    }
}

/// Nombre d'échecs internes rencontrés pendant un nettoyage.
///
/// Les ressources sont libérées quoi qu'il arrive ; le bilan ne sert qu'à la
/// journalisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[must_use]
pub struct CleanupReport {
    pub failures: usize,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures == 0
    }
}

/// État d'une connexion SMTP vue par le filtre.
///
/// `id` et `descriptor` sont fixés à la construction ; tout le reste revient
/// à sa valeur par défaut sur `reset`.
pub struct Session {
    id: u64,
    descriptor: String,
    pub hostname: String,
    spool: Option<Spool>,
    pub annotations: HashMap<String, Vec<u8>>,
    pub header_rewrites: Vec<(String, String)>,
    pub mail_flags: MailFlags,
    pub optional_preamble: bool,
    pub generic_error: bool,
    retain_spool: bool,
    sink: Arc<dyn Diagnostics>,
}

impl Session {
    pub fn new(hostname: impl Into<String>, peer: &PeerAddr, sink: Arc<dyn Diagnostics>) -> Self {
        let id = identity::next_session_id();
        let descriptor = identity::network_descriptor(id, peer, sink.as_ref());

        Self {
            id,
            descriptor,
            hostname: hostname.into(),
            spool: None,
            annotations: HashMap::new(),
            header_rewrites: Vec::new(),
            mail_flags: MailFlags::NONE,
            optional_preamble: true,
            generic_error: false,
            retain_spool: cfg!(feature = "keep-temp-files"),
            sink,
        }
    }

    /// Active ou désactive la rétention des fichiers spool
    pub fn retain_spool(mut self, retain: bool) -> Self {
        self.retain_spool = retain;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn spool_opened(&self) -> bool {
        self.spool.is_some()
    }

    pub fn spool(&mut self) -> Option<&mut Spool> {
        self.spool.as_mut()
    }

    pub fn spool_path(&self) -> Option<&Path> {
        self.spool.as_ref().map(Spool::path)
    }

    pub fn annotate(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.annotations.insert(key.into(), value.into());
    }

    pub fn annotation(&self, key: &str) -> Option<&[u8]> {
        self.annotations.get(key).map(Vec::as_slice)
    }

    pub fn mark_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.header_rewrites.push((name.into(), value.into()));
    }

    /// Crée un nouveau fichier spool dans `dir`.
    ///
    /// Un spool déjà ouvert est libéré d'abord. En cas d'échec la session
    /// reste sans spool et l'erreur a déjà été signalée.
    pub fn open_spool(&mut self, dir: &Path) -> Result<(), SpoolError> {
        if !dir.is_dir() {
            let err = SpoolError::Directory(dir.to_path_buf());
            self.sink.report(Some(self.id), &err.to_string());
            return Err(err);
        }

        // Le nettoyage préalable n'est jamais bloquant
        let _ = self.release_spool();

        match Spool::create(dir, self.retain_spool) {
            Ok(spool) => {
                self.spool = Some(spool);
                Ok(())
            }
            Err(err) => {
                self.sink.report(Some(self.id), &err.to_string());
                Err(err)
            }
        }
    }

    /// Remet la session dans l'état d'une session neuve, sauf `id` et
    /// `descriptor`. Un pool qui veut une nouvelle identité doit construire
    /// une nouvelle session.
    pub fn reset(&mut self) -> CleanupReport {
        let report = self.release_spool();

        self.annotations.clear();
        self.header_rewrites.clear();

        self.mail_flags = MailFlags::NONE;
        self.optional_preamble = true;
        self.generic_error = false;

        report
    }

    /// Fin de vie de la session : libère tout et rend le bilan.
    pub fn close(mut self) -> CleanupReport {
        let report = self.release_spool();
        self.annotations.clear();
        self.header_rewrites.clear();
        report
    }

    fn release_spool(&mut self) -> CleanupReport {
        let mut report = CleanupReport::default();

        if let Some(spool) = self.spool.take() {
            if let Err(e) = spool.release() {
                self.sink.report(Some(self.id), &e.to_string());
                report.failures += 1;
            }
        }

        report
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.release_spool();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("descriptor", &self.descriptor)
            .field("hostname", &self.hostname)
            .field("spool", &self.spool_path())
            .field("annotations", &self.annotations.len())
            .field("header_rewrites", &self.header_rewrites.len())
            .field("mail_flags", &self.mail_flags)
            .field("optional_preamble", &self.optional_preamble)
            .field("generic_error", &self.generic_error)
            .finish()
    }
}
