//! Crash-consistent JSON reads and writes: write-tmp-then-rename, corrupt
//! documents surfaced as a sentinel rather than deleted or overwritten.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Result of reading a JSON document that may not exist or may not parse.
pub enum StoreValue<T> {
    /// File missing.
    Absent,
    /// File present and valid.
    Present(T),
    /// File present but failed to parse; untouched so an operator can inspect it.
    Corrupt { details: String },
}

impl<T> StoreValue<T> {
    #[must_use]
    pub fn present(self) -> Option<T> {
        match self {
            Self::Present(value) => Some(value),
            Self::Absent | Self::Corrupt { .. } => None,
        }
    }

    #[must_use]
    pub const fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}

/// Read and parse a JSON document, never erroring on missing or corrupt input.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> StoreValue<T> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return StoreValue::Absent,
    };
    match serde_json::from_str(&raw) {
        Ok(value) => StoreValue::Present(value),
        Err(err) => StoreValue::Corrupt { details: err.to_string() },
    }
}

/// Write a JSON document atomically: serialize, write to `NAME.tmp` in the
/// same directory, `sync_all`, then `fs::rename` over the target. The temp
/// file is removed on any failure path so a half-written document is never
/// left where a reader would find it.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let tmp_path = path.with_extension("json.tmp");

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut json = serde_json::to_string_pretty(value).map_err(std::io::Error::other)?;
    json.push('\n');

    let result = (|| {
        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt as _;
            opts.mode(0o644);
        }
        let mut file = opts.open(&tmp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

/// Append one line of plain text to a file, creating it if necessary.
/// Used for the append-only `badnode_events.log`.
pub fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}
