//! Process-wide log setup.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::fmt::writer::MakeWriterExt;

use crate::error::{EnrollKitError, Result};

/// Log file created in the working directory.
pub const LOG_FILE: &str = "logger.log";

/// Sends log output to stdout and to `log_file`, which is truncated first.
///
/// `debug` lowers the level to DEBUG and adds source locations.
pub fn init(debug: bool, log_file: &Path) -> Result<()> {
    let file = open_log_file(log_file)?;

    let level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_ansi(false)
        .with_file(debug)
        .with_line_number(debug)
        .with_writer(std::io::stdout.and(Arc::new(file)))
        .try_init()
        .map_err(|e| EnrollKitError::Config(format!("cannot install logger: {e}")))
}

/// Each run starts a fresh log.
fn open_log_file(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn log_file_is_truncated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_FILE);
        std::fs::write(&path, "previous run\n").unwrap();

        let mut file = open_log_file(&path).unwrap();
        file.write_all(b"this run\n").unwrap();
        drop(file);

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "this run\n");
    }
}
