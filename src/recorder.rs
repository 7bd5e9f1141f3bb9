use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};
use serde::Serialize;

use crate::drivers::AcqError;
use crate::types::MuxBlock;

/// Sidecar written next to the data files.
#[derive(Debug, Serialize)]
struct RecordMetadata<'a> {
    sample_rate_hz: f64,
    channels: &'a [String],
    max_size: usize,
    started_unix: u64,
    samples: u64,
    files: Vec<String>,
    finished: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecordSummary {
    /// Samples per channel written across all parts.
    pub samples: u64,
    pub files: Vec<PathBuf>,
}

/// CSV writer for demultiplexed blocks, split into parts of at most `max_size` rows.
pub struct DataRecorder {
    base_path: PathBuf,
    channel_names: Vec<String>,
    sample_rate_hz: f64,
    max_size: usize,
    writer: Option<BufWriter<File>>,
    files: Vec<PathBuf>,
    rows_in_part: usize,
    samples: u64,
    started_unix: u64,
}

impl DataRecorder {
    pub fn create(
        path: impl AsRef<Path>,
        channel_names: Vec<String>,
        sample_rate_hz: f64,
        max_size: usize,
    ) -> Result<Self, AcqError> {
        if sample_rate_hz <= 0.0 {
            return Err(AcqError::InvalidSampleRate);
        }
        let base_path = path.as_ref().to_path_buf();
        if base_path.is_file() {
            info!("removing previous recording {}", base_path.display());
            fs::remove_file(&base_path)?;
        }
        let started_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let mut recorder = Self {
            base_path,
            channel_names,
            sample_rate_hz,
            max_size: max_size.max(1),
            writer: None,
            files: Vec::new(),
            rows_in_part: 0,
            samples: 0,
            started_unix,
        };
        recorder.open_part()?;
        recorder.write_metadata(false)?;
        info!(
            "recording {} channels to {}",
            recorder.channel_names.len(),
            recorder.base_path.display()
        );
        Ok(recorder)
    }
    /// `data.csv` -> `data_001.csv`, `data_002.csv`, ...
    fn part_path(&self, part: usize) -> PathBuf {
        if part == 0 {
            return self.base_path.clone();
        }
        let stem = self
            .base_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "record".to_owned());
        let name = match self.base_path.extension() {
            Some(ext) => format!("{stem}_{part:03}.{}", ext.to_string_lossy()),
            None => format!("{stem}_{part:03}"),
        };
        self.base_path.with_file_name(name)
    }
    /// `data.csv` -> `data.csv.meta.json`; never one of the data parts.
    fn metadata_path(&self) -> PathBuf {
        let mut name = self
            .base_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "record".into());
        name.push(".meta.json");
        self.base_path.with_file_name(name)
    }
    fn open_part(&mut self) -> Result<(), AcqError> {
        if let Some(mut w) = self.writer.take() {
            w.flush()?;
        }
        let path = self.part_path(self.files.len());
        let mut w = BufWriter::new(File::create(&path)?);
        write!(w, "Time")?;
        for name in &self.channel_names {
            write!(w, ",{name}")?;
        }
        writeln!(w)?;
        self.writer = Some(w);
        self.files.push(path);
        self.rows_in_part = 0;
        Ok(())
    }
    fn write_metadata(&self, finished: bool) -> Result<(), AcqError> {
        let meta = RecordMetadata {
            sample_rate_hz: self.sample_rate_hz,
            channels: &self.channel_names,
            max_size: self.max_size,
            started_unix: self.started_unix,
            samples: self.samples,
            files: self.files.iter().map(|p| p.display().to_string()).collect(),
            finished,
        };
        fs::write(self.metadata_path(), serde_json::to_string_pretty(&meta)?)?;
        Ok(())
    }
    pub fn write_block(&mut self, block: &MuxBlock) -> Result<(), AcqError> {
        if block.n_channels() != self.channel_names.len() {
            return Err(AcqError::ChannelMismatch {
                expected: self.channel_names.len(),
                actual: block.n_channels(),
            });
        }
        let dt = 1.0 / self.sample_rate_hz;
        for (i, column) in block.out.columns().into_iter().enumerate() {
            if self.rows_in_part == self.max_size {
                self.open_part()?;
            }
            let Some(w) = self.writer.as_mut() else {
                break;
            };
            write!(w, "{:.6}", block.t0 + i as f64 * dt)?;
            for val in column.iter() {
                write!(w, ",{val}")?;
            }
            writeln!(w)?;
            self.rows_in_part += 1;
            self.samples += 1;
        }
        Ok(())
    }
    pub fn finish(mut self) -> Result<RecordSummary, AcqError> {
        if let Some(mut w) = self.writer.take() {
            w.flush()?;
        }
        self.write_metadata(true)?;
        info!(
            "recording saved: {} samples in {} file(s)",
            self.samples,
            self.files.len()
        );
        Ok(RecordSummary {
            samples: self.samples,
            files: std::mem::take(&mut self.files),
        })
    }
}

/// Writer thread: drains its queue until the producer goes away, then finishes the files.
pub struct SavingThread {
    handle: Option<JoinHandle<Result<RecordSummary, AcqError>>>,
}

impl SavingThread {
    pub fn spawn(
        mut recorder: DataRecorder,
        blocks: Receiver<Arc<MuxBlock>>,
    ) -> Result<Self, AcqError> {
        let handle = thread::Builder::new()
            .name("saving".into())
            .spawn(move || {
                let mut failure = None;
                for block in blocks.iter() {
                    if failure.is_some() {
                        continue;
                    }
                    if let Err(e) = recorder.write_block(&block) {
                        warn!("recording failed at block {}: {e}", block.seq);
                        failure = Some(e);
                    }
                }
                let summary = recorder.finish()?;
                match failure {
                    Some(e) => Err(e),
                    None => Ok(summary),
                }
            })?;
        Ok(Self {
            handle: Some(handle),
        })
    }
    /// Wait for the queue to drain. The producer side must already be gone.
    pub fn stop(&mut self) -> Result<RecordSummary, AcqError> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| AcqError::WorkerPanicked("saving".into()))?,
            None => Ok(RecordSummary::default()),
        }
    }
}

impl Drop for SavingThread {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("saving thread ended with an error: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use std::sync::mpsc::sync_channel;

    fn block(seq: u64, n_channels: usize, n: usize, fs: f64) -> Arc<MuxBlock> {
        Arc::new(MuxBlock {
            seq,
            t0: (seq as usize * n) as f64 / fs,
            raw: Array2::zeros((1, 1)),
            out: Array2::from_shape_fn((n_channels, n), |(c, i)| (c * 10 + i) as f32),
        })
    }

    fn names(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("Ch01Col{i:02}")).collect()
    }

    #[test]
    fn writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.csv");
        let mut rec = DataRecorder::create(&path, names(2), 10.0, 100).unwrap();
        rec.write_block(&block(0, 2, 3, 10.0)).unwrap();
        let summary = rec.finish().unwrap();
        assert_eq!(summary.samples, 3);
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Time,Ch01Col01,Ch01Col02");
        assert_eq!(lines[2], "0.100000,1,11");
        assert_eq!(lines.len(), 4);
        let meta: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("rec.csv.meta.json")).unwrap())
                .unwrap();
        assert_eq!(meta["samples"], 3);
        assert_eq!(meta["finished"], true);
    }

    #[test]
    fn splits_parts_at_max_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.csv");
        let mut rec = DataRecorder::create(&path, names(1), 10.0, 4).unwrap();
        for seq in 0..3 {
            rec.write_block(&block(seq, 1, 3, 10.0)).unwrap();
        }
        let summary = rec.finish().unwrap();
        assert_eq!(summary.samples, 9);
        assert_eq!(
            summary.files,
            vec![
                path.clone(),
                dir.path().join("rec_001.csv"),
                dir.path().join("rec_002.csv")
            ]
        );
        let last = fs::read_to_string(dir.path().join("rec_002.csv")).unwrap();
        assert_eq!(last.lines().count(), 2);
    }

    #[test]
    fn replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.csv");
        fs::write(&path, "stale\nstale\nstale\n").unwrap();
        let rec = DataRecorder::create(&path, names(1), 10.0, 4).unwrap();
        rec.finish().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "Time,Ch01Col01\n");
    }

    #[test]
    fn saving_thread_drains_queue_before_finishing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.csv");
        let rec = DataRecorder::create(&path, names(2), 10.0, 1000).unwrap();
        let (tx, rx) = sync_channel(16);
        let mut saver = SavingThread::spawn(rec, rx).unwrap();
        for seq in 0..10 {
            tx.send(block(seq, 2, 5, 10.0)).unwrap();
        }
        drop(tx);
        let summary = saver.stop().unwrap();
        assert_eq!(summary.samples, 50);
    }

    #[test]
    fn channel_mismatch_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let rec = DataRecorder::create(dir.path().join("rec.csv"), names(3), 10.0, 10).unwrap();
        let (tx, rx) = sync_channel(4);
        let mut saver = SavingThread::spawn(rec, rx).unwrap();
        tx.send(block(0, 2, 5, 10.0)).unwrap();
        drop(tx);
        assert!(matches!(
            saver.stop(),
            Err(AcqError::ChannelMismatch { expected: 3, actual: 2 })
        ));
    }

    #[test]
    fn json_data_path_keeps_its_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.json");
        let mut rec = DataRecorder::create(&path, names(1), 10.0, 100).unwrap();
        rec.write_block(&block(0, 1, 3, 10.0)).unwrap();
        rec.finish().unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("Time,Ch01Col01\n"));
        assert_eq!(text.lines().count(), 4);
        assert!(dir.path().join("rec.json.meta.json").is_file());
    }

    #[test]
    fn extensionless_path_gets_its_own_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let other = dir.path().join("session.json");
        fs::write(&other, "{}").unwrap();
        let rec = DataRecorder::create(dir.path().join("session"), names(1), 10.0, 4).unwrap();
        rec.finish().unwrap();
        assert_eq!(fs::read_to_string(&other).unwrap(), "{}");
        assert!(dir.path().join("session.meta.json").is_file());
    }

    #[test]
    fn dropping_the_thread_finishes_the_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.csv");
        let rec = DataRecorder::create(&path, names(1), 10.0, 100).unwrap();
        let (tx, rx) = sync_channel(4);
        let saver = SavingThread::spawn(rec, rx).unwrap();
        tx.send(block(0, 1, 5, 10.0)).unwrap();
        drop(tx);
        drop(saver);
        let meta: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(dir.path().join("rec.csv.meta.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(meta["finished"], true);
        assert_eq!(meta["samples"], 5);
    }
}
