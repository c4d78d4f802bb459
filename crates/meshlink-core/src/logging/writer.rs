//! Append-only JSONL file per device per day

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::entry::LogEntry;

/// Appends log entries to `<dir>/<date>_<device>.jsonl`
pub struct DeviceLogWriter {
    device: String,
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl DeviceLogWriter {
    pub fn new(logs_dir: impl AsRef<Path>, device: impl Into<String>) -> std::io::Result<Self> {
        let device = device.into();
        let logs_dir = logs_dir.as_ref();
        fs::create_dir_all(logs_dir)?;

        let date = chrono::Local::now().format("%Y-%m-%d");
        let path = logs_dir.join(format!("{}_{}.jsonl", date, device));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            device,
            writer: Mutex::new(BufWriter::new(file)),
            path,
        })
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one entry as one line and flush
    pub fn write(&self, entry: &LogEntry) -> std::io::Result<()> {
        let json = entry
            .to_json_line()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{}", json)?;
        writer.flush()
    }

    pub fn flush(&self) -> std::io::Result<()> {
        self.writer.lock().flush()
    }
}

impl Drop for DeviceLogWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Every entry from every `.jsonl` file in `logs_dir`, oldest first
///
/// Unparseable lines are skipped.
pub fn read_entries(logs_dir: impl AsRef<Path>) -> std::io::Result<Vec<LogEntry>> {
    let logs_dir = logs_dir.as_ref();
    if !logs_dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for dir_entry in fs::read_dir(logs_dir)? {
        let path = dir_entry?.path();
        if path.extension().map(|e| e == "jsonl").unwrap_or(false) {
            let content = fs::read_to_string(&path)?;
            entries.extend(
                content
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .filter_map(|line| LogEntry::from_json_line(line).ok()),
            );
        }
    }
    entries.sort_by(|a, b| a.ts.cmp(&b.ts));
    Ok(entries)
}
