use anyhow::Result;
use chrono::Utc;
use codewright_core::runtime_dir;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Append-only run log plus stderr diagnostics.
///
/// Everything the loop wants remembered (guard trips, compaction
/// failures, permission decisions) goes through here rather than ad-hoc
/// eprintln calls scattered through the crates.
pub struct Observer {
    log_path: PathBuf,
    verbose: bool,
}

impl Observer {
    pub fn new(workspace: &Path) -> Result<Self> {
        let dir = runtime_dir(workspace);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            log_path: dir.join("observe.log"),
            verbose: false,
        })
    }

    /// Enable or disable verbose logging to stderr.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Record a turn-level event line.
    pub fn record(&self, msg: &str) {
        let _ = self.append_log_line(&format!("{} EVENT {msg}", Utc::now().to_rfc3339()));
    }

    /// Log a message to stderr with `[codewright]` prefix when verbose
    /// mode is on.
    pub fn verbose_log(&self, msg: &str) {
        if self.verbose {
            eprintln!("[codewright] {msg}");
        }
    }

    /// Log a warning — always written to the log file, and to stderr.
    pub fn warn_log(&self, msg: &str) {
        eprintln!("[codewright WARN] {msg}");
        let _ = self.append_log_line(&format!("{} WARN {msg}", Utc::now().to_rfc3339()));
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    fn append_log_line(&self, line: &str) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }
}
