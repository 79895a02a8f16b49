//! Size-capped log file with a single `.1` backup.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};

/// Default size cap before rotation.
pub const DEFAULT_MAX_BYTES: u64 = 1024 * 1024;

/// Append-only writer that rotates `<path>` to `<path>.1` once it grows
/// past `max_bytes`.
#[derive(Debug)]
pub struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    file: File,
    written: u64,
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// `<path>.1`
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".1");
    PathBuf::from(name)
}

impl RotatingFile {
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = open_append(&path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            max_bytes: max_bytes.max(1),
            file,
            written,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rename the current file to the backup slot and start fresh.
    /// On failure keep appending to the current file.
    fn rotate(&mut self) {
        let _ = self.file.flush();
        let backup = backup_path(&self.path);
        let _ = fs::remove_file(&backup);
        if fs::rename(&self.path, &backup).is_err() {
            return;
        }
        match open_append(&self.path) {
            Ok(file) => {
                self.file = file;
                self.written = 0;
            }
            Err(_) => {
                // the renamed handle is still valid for appends
            }
        }
    }
}

/// Open `path` behind a background writer thread so that logging call
/// sites never wait on disk I/O or rotation. Records are flushed when the
/// guard drops.
pub fn non_blocking(
    path: impl Into<PathBuf>,
    max_bytes: u64,
) -> io::Result<(NonBlocking, WorkerGuard)> {
    let file = RotatingFile::open(path, max_bytes)?;
    Ok(tracing_appender::non_blocking(file))
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_bytes {
            self.rotate();
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
