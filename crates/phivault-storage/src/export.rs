//! Short-lived plaintext files for handing data to an external share mechanism.

use std::{
    fs,
    future::Future,
    io::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use phivault_core::Result;
use tempfile::{Builder, NamedTempFile, TempPath};
use tracing::{debug, warn};

pub const DEFAULT_EXPORT_TTL: Duration = Duration::from_secs(5 * 60);

/// Plaintext file that is removed when dropped, or after a bounded time once handed off.
pub struct PlaintextExport {
    file: NamedTempFile,
}

impl PlaintextExport {
    /// `name` like `audit.csv` becomes `audit-<random>.csv` inside `dir`.
    pub fn create(dir: &Path, name: &str) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let name = Path::new(name);
        let stem = name
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("export");
        let suffix = name
            .extension()
            .and_then(|s| s.to_str())
            .map(|ext| format!(".{ext}"))
            .unwrap_or_default();
        let file = Builder::new()
            .prefix(&format!("{stem}-"))
            .suffix(&suffix)
            .tempfile_in(dir)?;
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Finish writing and schedule removal after `ttl`. Needs a running tokio runtime.
    pub fn keep_for(mut self, ttl: Duration) -> Result<PathBuf> {
        self.file.flush()?;
        self.file.as_file().sync_all()?;
        let temp_path = self.file.into_temp_path();
        let path = temp_path.to_path_buf();
        tokio::spawn(remove_after(temp_path, ttl));
        Ok(path)
    }

    /// Hold the file until the hand-off finishes or `ttl` passes, then remove it.
    pub async fn hold_until(mut self, ttl: Duration, done: impl Future<Output = ()>) -> Result<()> {
        self.file.flush()?;
        self.file.as_file().sync_all()?;
        tokio::select! {
            _ = tokio::time::sleep(ttl) => debug!("export ttl elapsed"),
            _ = done => debug!("export hand-off finished"),
        }
        self.remove()
    }

    /// Remove now, reporting failures instead of ignoring them as drop would.
    pub fn remove(self) -> Result<()> {
        self.file.close()?;
        Ok(())
    }
}

impl Write for PlaintextExport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

async fn remove_after(path: TempPath, ttl: Duration) {
    tokio::time::sleep(ttl).await;
    let shown = path.display().to_string();
    match path.close() {
        Ok(()) => debug!(path = %shown, "plaintext export removed"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %shown, error = %err, "failed to remove plaintext export"),
    }
}

/// Remove exports abandoned by an earlier process. Returns how many were removed.
pub fn sweep_exports(dir: &Path) -> Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };
    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}
