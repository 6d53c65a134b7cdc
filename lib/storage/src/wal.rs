use anyhow::Result;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use parking_lot::Mutex;
use tracing::warn;
use transitx_core::CongestionSample;

/// Append-only congestion log, one JSON sample per line.
///
/// Lines are never rewritten. A torn last line left by a crash is closed off
/// with a newline on open, so it is skipped on replay and later appends start
/// on a line of their own.
pub struct CongestionLog {
    file: Arc<Mutex<BufWriter<File>>>,
    raw_file: Arc<Mutex<File>>,
    path: PathBuf,
}

impl CongestionLog {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        if len > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::Start(len - 1))?;
            file.read_exact(&mut last)?;
            if last[0] != b'\n' {
                warn!("Terminating torn last line of {}", path.display());
                file.write_all(b"\n")?;
                file.sync_data()?;
            }
        }

        let raw_file = file.try_clone()?;

        Ok(Self {
            file: Arc::new(Mutex::new(BufWriter::new(file))),
            raw_file: Arc::new(Mutex::new(raw_file)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one sample
    #[inline]
    pub fn append(&self, sample: &CongestionSample) -> Result<()> {
        let line = serde_json::to_vec(sample)?;
        let mut writer = self.file.lock();
        writer.write_all(&line)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    /// Append a batch under one lock, then fdatasync.
    pub fn append_batch(&self, samples: &[CongestionSample]) -> Result<()> {
        {
            let mut writer = self.file.lock();
            for sample in samples {
                serde_json::to_writer(&mut *writer, sample)?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
        }
        self.sync()
    }

    /// Sync log to disk
    #[inline]
    pub fn sync(&self) -> Result<()> {
        let mut writer = self.file.lock();
        writer.flush()?;

        let raw = self.raw_file.lock();
        raw.sync_data()?;
        Ok(())
    }

    /// Reads every sample back in append order. Malformed lines are skipped
    /// with a warning.
    pub fn replay<P: AsRef<Path>>(path: P) -> Result<Vec<CongestionSample>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(path)?);
        let mut samples = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CongestionSample>(&line) {
                Ok(sample) if (0.0..=100.0).contains(&sample.congestion_percent) => samples.push(sample),
                Ok(sample) => warn!(
                    "Skipping {}:{}: congestion {} out of range",
                    path.display(),
                    line_no + 1,
                    sample.congestion_percent
                ),
                Err(e) => warn!("Skipping {}:{}: {}", path.display(), line_no + 1, e),
            }
        }
        Ok(samples)
    }
}
