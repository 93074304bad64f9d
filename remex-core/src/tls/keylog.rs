//! Per-session NSS key-log output.
//!
//! One line per key derivation event, `\n`-terminated, appended to the
//! configured file. The path is a per-session setting, never process
//! state, so two sessions can log to different files.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use tracing::warn;

/// `rustls::KeyLog` implementation writing NSS-format lines.
#[derive(Debug)]
pub struct KeyLogToFile {
    path: PathBuf,
}

impl KeyLogToFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl rustls::KeyLog for KeyLogToFile {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        let mut line = String::with_capacity(label.len() + 2 * (client_random.len() + secret.len()) + 3);
        line.push_str(label);
        line.push(' ');
        for byte in client_random {
            line.push_str(&format!("{byte:02x}"));
        }
        line.push(' ');
        for byte in secret {
            line.push_str(&format!("{byte:02x}"));
        }
        line.push('\n');

        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            warn!("key-log write to {} failed: {e}", self.path.display());
        }
    }
}
