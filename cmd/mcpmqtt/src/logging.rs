//! Logging setup.
//!
//! Logs go to stderr; stdout carries tool responses only.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use mcpmqtt::LogLevel;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `level`. When `logfile` is set, every
/// record is also appended to it.
pub fn init(level: LogLevel, json: bool, logfile: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));
    let file = logfile.map(open_logfile).transpose()?;

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(file.map(|f| fmt::layer().json().with_ansi(false).with_writer(f)))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .with(file.map(|f| fmt::layer().with_target(true).with_ansi(false).with_writer(f)))
            .init();
    }
    Ok(())
}

fn open_logfile(path: &Path) -> Result<Arc<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create log directory {}", parent.display()))?;
        }
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open log file {}", path.display()))?;
    Ok(Arc::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_logfile_creates_parents_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/nested/mcpmqtt.log");

        {
            use std::io::Write;
            let file = open_logfile(&path).unwrap();
            (&*file).write_all(b"first\n").unwrap();
        }
        {
            use std::io::Write;
            let file = open_logfile(&path).unwrap();
            (&*file).write_all(b"second\n").unwrap();
        }

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }
}
