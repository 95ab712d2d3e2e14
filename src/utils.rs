use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Mutex;

/// Filtre pour ne garder que les caractères ASCII imprimables et les espaces blancs
pub fn filter_printable_chars(input: &str) -> String {
    input.chars()
        .filter(|c| {
            c.is_ascii_graphic() ||
            c.is_ascii_whitespace() ||
            *c == '\n' ||
            *c == '\r' ||
            *c == '\t'
        })
        .collect()
}

/// Convertit les caractères non imprimables en séquences d'échappement
pub fn safe_log_string(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\0' => result.push_str("\\0"),
            '\x01'..='\x08' | '\x0b' | '\x0c' | '\x0e'..='\x1f' | '\x7f' => {
                result.push_str(&format!("\\x{:02x}", c as u32));
            }
            _ if c.is_ascii_graphic() || c.is_ascii_whitespace() || c == '\n' || c == '\r' => {
                result.push(c);
            }
            _ => {
                result.push_str(&format!("\\u{{{:x}}}", c as u32));
            }
        }
    }
    result
}

/// Destination des messages de diagnostic.
///
/// Chaque échec récupérable du cœur de session passe par `report` une seule
/// fois avant que l'opération ne continue. `note` sert aux événements
/// informatifs (connexion, fin de message...).
pub trait Diagnostics: Send + Sync {
    fn report(&self, session: Option<u64>, message: &str);

    fn note(&self, _session: u64, _message: &str) {}
}

pub struct Logger {
    writer: Option<Mutex<BufWriter<File>>>,
    raw_display: bool,
    verbose: bool,
}

impl Logger {
    pub fn new(log_file: Option<PathBuf>, raw_display: bool, verbose: bool) -> anyhow::Result<Self> {
        let writer = if let Some(path) = log_file {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                }
            }

            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;

            Some(Mutex::new(BufWriter::new(file)))
        } else {
            None
        };

        Ok(Self { writer, raw_display, verbose })
    }

    fn emit(&self, prefix: &str, message: &str) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");

        let log_line = format!("{} {} {}\n", timestamp, prefix, message);

        if self.raw_display {
            print!("{}", log_line);
        } else {
            print!("{}", filter_printable_chars(&log_line));
        }

        if let Some(writer) = &self.writer {
            // Un mutex empoisonné ne doit pas bloquer les autres sessions
            let mut writer = match writer.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let file_line = format!("{} {} {}\n", timestamp, prefix, safe_log_string(message));
            let _ = writer.write_all(file_line.as_bytes());
            let _ = writer.flush();
        }
    }

    pub fn log(&self, session: u64, message: &str) {
        self.emit(&format!("id={}", session), message);
    }

    pub fn log_verbose(&self, session: u64, title: &str, details: &str) {
        if !self.verbose {
            return;
        }

        let separator = "─".repeat(60);
        let display_details = if self.raw_display {
            details.to_string()
        } else {
            safe_log_string(details)
        };

        self.emit(
            &format!("id={}", session),
            &format!("VERBOSE: {}\n{}\n{}\n{}", title, separator, display_details, separator),
        );
    }
}

impl Diagnostics for Logger {
    fn report(&self, session: Option<u64>, message: &str) {
        let prefix = match session {
            Some(id) => format!("id={}", id),
            None => "id=-".to_string(),
        };
        self.emit(&prefix, &format!("Error: {}", message));
    }

    fn note(&self, session: u64, message: &str) {
        self.log(session, message);
    }
}
