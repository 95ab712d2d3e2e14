use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use rand::Rng;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("Can not access temporary directory {0:?}")]
    Directory(PathBuf),
    #[error("Unable to open spool file {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Unable to remove spool file {path:?}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Nombre de noms essayés avant d'abandonner
const CREATE_ATTEMPTS: usize = 8;

/// Nom aléatoire de la forme `xxxx-xxxx-xxxx-xxxx.eml`
pub fn unique_name() -> String {
    let mut rng = rand::thread_rng();
    let segments: Vec<String> = (0..4)
        .map(|_| format!("{:04x}", rng.gen::<u16>()))
        .collect();
    format!("{}.eml", segments.join("-"))
}

/// Fichier temporaire privé contenant le message d'une session.
///
/// Le fichier est fermé puis supprimé par `release`, ou à défaut quand la
/// valeur est abandonnée. En mode rétention il reste sur disque, fermé.
#[derive(Debug)]
pub struct Spool {
    file: Option<File>,
    path: PathBuf,
    retain: bool,
}

impl Spool {
    pub fn create(dir: &Path, retain: bool) -> Result<Self, SpoolError> {
        Self::create_with(dir, retain, unique_name)
    }

    /// Ouvre un nouveau fichier sans jamais réutiliser un nom existant.
    fn create_with(
        dir: &Path,
        retain: bool,
        mut next_name: impl FnMut() -> String,
    ) -> Result<Self, SpoolError> {
        if !dir.is_dir() {
            return Err(SpoolError::Directory(dir.to_path_buf()));
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let path = dir.join(next_name());
            match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => return Ok(Self { file: Some(file), path, retain }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempt < CREATE_ATTEMPTS => continue,
                Err(source) => return Err(SpoolError::Open { path, source }),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> io::Result<u64> {
        match &self.file {
            Some(file) => Ok(file.metadata()?.len()),
            None => Err(closed()),
        }
    }

    /// Ferme le fichier et le supprime, sauf en mode rétention.
    pub fn release(mut self) -> Result<(), SpoolError> {
        self.close_and_remove()
    }

    fn close_and_remove(&mut self) -> Result<(), SpoolError> {
        // Fermeture
        drop(self.file.take());

        if self.retain {
            return Ok(());
        }

        match fs::symlink_metadata(&self.path) {
            Ok(meta) if meta.is_file() => fs::remove_file(&self.path).map_err(|source| SpoolError::Remove {
                path: self.path.clone(),
                source,
            }),
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SpoolError::Remove {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn handle(&mut self) -> io::Result<&mut File> {
        self.file.as_mut().ok_or_else(closed)
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "spool file is closed")
}

impl Drop for Spool {
    fn drop(&mut self) {
        // `Session` libère toujours explicitement ; ceci ne sert qu'aux spools orphelins
        if self.file.is_some() {
            if let Err(e) = self.close_and_remove() {
                eprintln!("[ERROR] {}", e);
            }
        }
    }
}

impl Write for Spool {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.handle()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.handle()?.flush()
    }
}

impl Read for Spool {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.handle()?.read(buf)
    }
}

impl Seek for Spool {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.handle()?.seek(pos)
    }
}
