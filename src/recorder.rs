//! Measurement recording to daily CSV files.
//!
//! Files are named `<data_dir>/<port>-<YYYY-MM-DD>.csv` (UTC date, path
//! separators in the port name replaced by `_`) and rotate when the UTC day
//! changes. Failures while writing are logged and dropped; they never affect
//! the connection.

use crate::state::InstrumentReadout;
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};

pub const CSV_HEADERS: [&str; 4] = ["timestamp_utc", "timestamp_epoch_ms", "voltage_v", "current_a"];

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("Failed to prepare log file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV write failed: {0}")]
    Csv(#[from] csv::Error),
}

/// Receiver of published readouts while logging is enabled.
pub trait ReadoutSink: Send + Sync {
    /// Start or stop recording. Returns the active file when starting.
    fn set_enabled(&self, enabled: bool, port: Option<&str>) -> Result<Option<PathBuf>, RecorderError>;

    fn record(&self, readout: &InstrumentReadout);

    /// A new connection was made on `port`; later rows belong to it.
    /// Returns the new file when recording is on and the file changed.
    fn port_changed(&self, _port: &str) -> Option<PathBuf> {
        None
    }
}

struct OpenFile {
    date: NaiveDate,
    path: PathBuf,
    writer: csv::Writer<File>,
}

#[derive(Default)]
struct RecorderInner {
    enabled: bool,
    safe_port: String,
    file: Option<OpenFile>,
}

/// `ReadoutSink` writing one CSV row per readout.
pub struct CsvRecorder {
    data_dir: PathBuf,
    inner: Mutex<RecorderInner>,
}

/// Port name usable as a file name component.
pub fn safe_port_name(port: &str) -> String {
    let trimmed = port.trim();
    if trimmed.is_empty() {
        return "unknown".to_string();
    }
    trimmed.replace(['/', '\\', ':'], "_")
}

impl CsvRecorder {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            inner: Mutex::new(RecorderInner {
                safe_port: "unknown".to_string(),
                ..Default::default()
            }),
        }
    }

    pub fn file_for(&self, safe_port: &str, date: NaiveDate) -> PathBuf {
        self.data_dir
            .join(format!("{}-{}.csv", safe_port, date.format("%Y-%m-%d")))
    }

    fn open(&self, safe_port: &str, date: NaiveDate) -> Result<OpenFile, RecorderError> {
        let path = self.file_for(safe_port, date);
        let io_err = |source| RecorderError::Io {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.data_dir).map_err(io_err)?;
        let needs_header = fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if needs_header {
            writer.write_record(CSV_HEADERS)?;
            writer.flush().map_err(io_err)?;
        }
        info!(path = %path.display(), "recording to CSV");
        Ok(OpenFile { date, path, writer })
    }
}

impl ReadoutSink for CsvRecorder {
    fn set_enabled(&self, enabled: bool, port: Option<&str>) -> Result<Option<PathBuf>, RecorderError> {
        let mut inner = self.inner.lock();

        if let Some(mut file) = inner.file.take() {
            if let Err(e) = file.writer.flush() {
                warn!(path = %file.path.display(), error = %e, "flushing CSV log failed");
            }
        }
        inner.enabled = false;

        if !enabled {
            info!("recording stopped");
            return Ok(None);
        }

        if let Some(port) = port {
            inner.safe_port = safe_port_name(port);
        }
        let today = chrono::Utc::now().date_naive();
        let file = self.open(&inner.safe_port, today)?;
        let path = file.path.clone();
        inner.file = Some(file);
        inner.enabled = true;
        Ok(Some(path))
    }

    fn record(&self, readout: &InstrumentReadout) {
        let mut inner = self.inner.lock();
        if !inner.enabled {
            return;
        }

        let date = readout.captured_at.date_naive();
        if inner.file.as_ref().map(|f| f.date) != Some(date) {
            match self.open(&inner.safe_port, date) {
                Ok(file) => inner.file = Some(file),
                Err(e) => {
                    warn!(error = %e, "CSV rotation failed");
                    inner.file = None;
                    return;
                }
            }
        }

        let Some(file) = inner.file.as_mut() else {
            return;
        };
        let row = [
            readout.captured_at.to_rfc3339(),
            readout.captured_at.timestamp_millis().to_string(),
            readout.voltage.to_string(),
            readout.current.to_string(),
        ];
        let result = file
            .writer
            .write_record(&row)
            .and_then(|()| file.writer.flush().map_err(csv::Error::from));
        if let Err(e) = result {
            warn!(path = %file.path.display(), error = %e, "CSV write failed");
        }
    }

    fn port_changed(&self, port: &str) -> Option<PathBuf> {
        let mut inner = self.inner.lock();
        let safe_port = safe_port_name(port);
        if inner.safe_port == safe_port {
            return None;
        }
        inner.safe_port = safe_port;
        if let Some(mut file) = inner.file.take() {
            if let Err(e) = file.writer.flush() {
                warn!(path = %file.path.display(), error = %e, "flushing CSV log failed");
            }
        }
        if !inner.enabled {
            return None;
        }

        let today = chrono::Utc::now().date_naive();
        match self.open(&inner.safe_port, today) {
            Ok(file) => {
                let path = file.path.clone();
                inner.file = Some(file);
                Some(path)
            }
            Err(e) => {
                // record() retries on the next readout.
                warn!(error = %e, "switching CSV log to new port failed");
                None
            }
        }
    }
}

impl std::fmt::Debug for CsvRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsvRecorder")
            .field("data_dir", &self.data_dir)
            .field("enabled", &self.inner.lock().enabled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn readout_at(day: u32, voltage: f64) -> InstrumentReadout {
        InstrumentReadout {
            captured_at: Utc.with_ymd_and_hms(2025, 3, day, 12, 0, 0).unwrap(),
            ..InstrumentReadout::new(voltage, 0.01, 1)
        }
    }

    #[test]
    fn test_safe_port_name() {
        assert_eq!(safe_port_name("/dev/ttyACM0"), "_dev_ttyACM0");
        assert_eq!(safe_port_name("COM3"), "COM3");
        assert_eq!(safe_port_name("\\\\.\\COM10"), "__._COM10");
        assert_eq!(safe_port_name(""), "unknown");
    }

    #[test]
    fn test_disabled_recorder_writes_nothing() {
        let dir = tempdir().unwrap();
        let recorder = CsvRecorder::new(dir.path());
        recorder.record(&readout_at(1, 1.0));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_records_rows_with_header() {
        let dir = tempdir().unwrap();
        let recorder = CsvRecorder::new(dir.path().join("data"));
        let path = recorder
            .set_enabled(true, Some("/dev/ttyACM0"))
            .unwrap()
            .unwrap();
        assert!(path.starts_with(dir.path().join("data")));

        let readout = InstrumentReadout::new(3.3, 0.012, 1);
        recorder.record(&readout);
        recorder.set_enabled(false, None).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "timestamp_utc,timestamp_epoch_ms,voltage_v,current_a");
        assert_eq!(lines.len(), 2);
        assert!(lines[1].ends_with(",3.3,0.012"));
    }

    #[test]
    fn test_rotates_on_date_change() {
        let dir = tempdir().unwrap();
        let recorder = CsvRecorder::new(dir.path());
        recorder.set_enabled(true, Some("COM3")).unwrap();

        recorder.record(&readout_at(1, 1.0));
        recorder.record(&readout_at(2, 2.0));

        let day1 = recorder.file_for("COM3", NaiveDate::from_ymd_opt(2025, 3, 1).unwrap());
        let day2 = recorder.file_for("COM3", NaiveDate::from_ymd_opt(2025, 3, 2).unwrap());
        assert_eq!(fs::read_to_string(day1).unwrap().lines().count(), 2);
        assert_eq!(fs::read_to_string(day2).unwrap().lines().count(), 2);
    }

    #[test]
    fn test_reenable_appends_without_second_header() {
        let dir = tempdir().unwrap();
        let recorder = CsvRecorder::new(dir.path());
        let path = recorder.set_enabled(true, Some("COM3")).unwrap().unwrap();
        recorder.record(&InstrumentReadout::new(1.0, 0.0, 1));
        recorder.set_enabled(false, None).unwrap();
        recorder.set_enabled(true, None).unwrap();
        recorder.record(&InstrumentReadout::new(2.0, 0.0, 1));
        recorder.set_enabled(false, None).unwrap();

        let text = fs::read_to_string(path).unwrap();
        assert_eq!(text.matches("timestamp_utc").count(), 1);
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn test_port_change_switches_file() {
        let dir = tempdir().unwrap();
        let recorder = CsvRecorder::new(dir.path());
        let first = recorder.set_enabled(true, Some("COM3")).unwrap().unwrap();
        recorder.record(&InstrumentReadout::new(1.0, 0.0, 1));

        assert_eq!(recorder.port_changed("COM3"), None);
        let second = recorder.port_changed("/dev/ttyACM1").unwrap();
        assert_ne!(first, second);
        assert!(second
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("_dev_ttyACM1-"));

        recorder.record(&InstrumentReadout::new(2.0, 0.0, 2));
        recorder.set_enabled(false, None).unwrap();

        assert_eq!(fs::read_to_string(first).unwrap().lines().count(), 2);
        let text = fs::read_to_string(second).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.lines().nth(1).unwrap().ends_with(",2,0"));
    }

    #[test]
    fn test_port_change_while_disabled_only_renames() {
        let dir = tempdir().unwrap();
        let recorder = CsvRecorder::new(dir.path());
        assert_eq!(recorder.port_changed("COM7"), None);
        let path = recorder.set_enabled(true, None).unwrap().unwrap();
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("COM7-"));
    }

    #[test]
    fn test_unwritable_directory_is_an_error() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let recorder = CsvRecorder::new(blocker.join("sub"));
        assert!(recorder.set_enabled(true, Some("COM3")).is_err());
    }
}
