// src/session.rs
//! Window orchestration without the window: owns the parameter tree and the
//! worker set, and turns button clicks and parameter edits into worker
//! lifecycle and reconfiguration.
use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info, warn};

use crate::config::{self, AppParameters, ParamChange, ParamError, ParamValue};
use crate::drivers::{
    AcqError, AcquisitionThread, FanOut, MuxSource, Plotter, PsdFrame, PsdPlotter,
    SimulatedMux, SubscriberStats, TimeSeriesFrame,
};
use crate::recorder::{DataRecorder, RecordSummary, SavingThread};
use crate::types::{BlockPart, SessionEvent};

/// Queue depth of the file writer; it must ride out disk hiccups.
const SAVER_QUEUE: usize = 64;
/// Queue depth of each plot worker; stale blocks are worth little to a plot.
const PLOT_QUEUE: usize = 8;

#[derive(Clone, Debug, PartialEq)]
pub struct ConsumerStats {
    pub name: String,
    pub delivered: u64,
    pub dropped: u64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionStats {
    pub running: bool,
    pub blocks: u64,
    pub last_interval: Option<Duration>,
    pub mean_interval: Option<Duration>,
    pub consumers: Vec<ConsumerStats>,
    /// File being written by the current run.
    pub recording: Option<PathBuf>,
    /// Result of the last finished recording.
    pub last_record: Option<RecordSummary>,
}

#[derive(Default)]
struct BlockClock {
    blocks: u64,
    last_at: Option<Instant>,
    last_interval: Option<Duration>,
    total: Duration,
    intervals: u32,
}

impl BlockClock {
    fn tick(&mut self, at: Instant) {
        if let Some(prev) = self.last_at {
            let dt = at.saturating_duration_since(prev);
            self.last_interval = Some(dt);
            self.total += dt;
            self.intervals += 1;
        }
        self.last_at = Some(at);
        self.blocks += 1;
    }
    fn mean(&self) -> Option<Duration> {
        (self.intervals > 0).then(|| self.total / self.intervals)
    }
}

pub struct Session {
    params: AppParameters,
    acquisition: Option<AcquisitionThread>,
    saver: Option<SavingThread>,
    plotter: Option<Plotter>,
    raw_plotter: Option<Plotter>,
    psd_plotter: Option<PsdPlotter>,
    events: Option<Receiver<SessionEvent>>,
    consumers: Vec<(String, Arc<SubscriberStats>)>,
    clock: BlockClock,
    recording: Option<PathBuf>,
    last_record: Option<RecordSummary>,
    stopped_once: bool,
}

impl Session {
    pub fn new(mut params: AppParameters) -> Self {
        params.sync_derived();
        Self {
            params,
            acquisition: None,
            saver: None,
            plotter: None,
            raw_plotter: None,
            psd_plotter: None,
            events: None,
            consumers: Vec::new(),
            clock: BlockClock::default(),
            recording: None,
            last_record: None,
            stopped_once: false,
        }
    }

    pub fn params(&self) -> &AppParameters {
        &self.params
    }

    /// Swap in a whole parameter set (e.g. loaded from disk). Sampling values
    /// take effect at the next start.
    pub fn replace_params(&mut self, params: AppParameters) {
        self.params = params;
        self.params.sync_derived();
    }

    pub fn is_running(&self) -> bool {
        self.acquisition.is_some()
    }

    pub fn button_text(&self) -> &'static str {
        if self.is_running() {
            "Stop Gen"
        } else if self.stopped_once {
            "Start Gen"
        } else {
            "Start Acq!"
        }
    }

    /// Start/stop toggle behind the main button. Starts the simulated array.
    pub fn on_btn_start(&mut self) -> Result<(), AcqError> {
        if self.is_running() {
            self.stop()
        } else {
            let sim = SimulatedMux::new(self.params.sampling.simulation.clone());
            self.start_with_source(Box::new(sim))
        }
    }

    pub fn start_with_source(&mut self, source: Box<dyn MuxSource>) -> Result<(), AcqError> {
        if self.is_running() {
            return Err(AcqError::AlreadyRunning);
        }
        let layout = self.params.sampling.layout();
        layout.validate()?;

        // Every consumer is subscribed before the producer exists.
        let mut fanout = FanOut::new();
        let mut consumers = Vec::new();
        let (rx, stats) = fanout.subscribe("plotter", PLOT_QUEUE);
        let plotter = Plotter::start(
            "plotter",
            self.params.plot.settings(true, BlockPart::Processed),
            rx,
        )?;
        consumers.push(("plotter".to_owned(), stats));

        let (rx, stats) = fanout.subscribe("raw plotter", PLOT_QUEUE);
        let raw_plotter = Plotter::start(
            "raw plotter",
            self.params.raw_plot.settings(false, BlockPart::Raw),
            rx,
        )?;
        consumers.push(("raw plotter".to_owned(), stats));

        let (rx, stats) = fanout.subscribe("psd plotter", PLOT_QUEUE);
        let psd_plotter = PsdPlotter::start(
            "psd plotter",
            self.params.psd.settings(&self.params.plot.channels),
            rx,
        )?;
        consumers.push(("psd plotter".to_owned(), stats));

        // The writer comes last: creating it replaces any previous recording.
        let mut saver = None;
        let mut recording = None;
        if let Some(path) = self.params.record.file_path() {
            let path = PathBuf::from(path);
            let recorder = DataRecorder::create(
                &path,
                layout.channel_names(),
                layout.fs_x_ch,
                self.params.record.max_size,
            )?;
            let (rx, stats) = fanout.subscribe("saver", SAVER_QUEUE);
            saver = Some(SavingThread::spawn(recorder, rx)?);
            consumers.push(("saver".to_owned(), stats));
            recording = Some(path);
        }

        let (events_tx, events_rx) = channel();
        let acquisition = AcquisitionThread::start(layout, source, fanout, events_tx)?;

        self.acquisition = Some(acquisition);
        self.saver = saver;
        self.plotter = Some(plotter);
        self.raw_plotter = Some(raw_plotter);
        self.psd_plotter = Some(psd_plotter);
        self.events = Some(events_rx);
        self.consumers = consumers;
        self.clock = BlockClock::default();
        self.recording = recording;
        info!("session started");
        Ok(())
    }

    /// Stop acquisition, then the file writer, then every plot worker.
    /// Plot workers stay around so their last frames remain visible.
    pub fn stop(&mut self) -> Result<(), AcqError> {
        let Some(mut acquisition) = self.acquisition.take() else {
            return Ok(());
        };
        self.stopped_once = true;
        let mut first_error = None;
        match acquisition.stop() {
            Ok(blocks) => info!("acquisition joined after {blocks} blocks"),
            Err(e) => first_error = Some(e),
        }
        drop(acquisition);

        if let Some(mut saver) = self.saver.take() {
            match saver.stop() {
                Ok(summary) => {
                    info!(
                        "recording finished: {} samples in {} file(s)",
                        summary.samples,
                        summary.files.len()
                    );
                    self.last_record = Some(summary);
                }
                Err(e) => {
                    error!("recording failed: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }
        self.recording = None;

        let plot_results = [
            self.plotter.as_mut().map(|p| p.stop()),
            self.raw_plotter.as_mut().map(|p| p.stop()),
            self.psd_plotter.as_mut().map(|p| p.stop()),
        ];
        for result in plot_results.into_iter().flatten() {
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        info!("session stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Edit one parameter and route the consequences.
    pub fn set_param(&mut self, path: &str, value: ParamValue) -> Result<(), ParamError> {
        let update = self.params.set(path, value)?;
        self.on_pars_changed(&update.changes);
        if update.new_conf {
            self.on_new_conf();
        }
        Ok(())
    }

    pub fn on_pars_changed(&mut self, changes: &[ParamChange]) {
        for change in changes {
            let path = change.path.as_str();
            let value = &change.value;
            match path {
                config::PATH_FSXCH => {
                    self.route(&config::leaf_path(config::PLOT_GROUP, "Fs"), value);
                    self.route(&config::leaf_path(config::PSD_GROUP, "Fs"), value);
                }
                config::PATH_FS => {
                    self.route(&config::leaf_path(config::RAW_PLOT_GROUP, "Fs"), value);
                }
                _ => {}
            }
            let Some(seconds) = value.as_f64() else {
                continue;
            };
            match path {
                "Plot options.RefreshTime" => {
                    if let Some(p) = &self.plotter {
                        p.set_refresh_time(seconds);
                    }
                }
                "Plot options.ViewTime" => {
                    if let Some(p) = &self.plotter {
                        p.set_view_time(seconds);
                    }
                }
                "Raw Plot.RefreshTime" => {
                    if let Some(p) = &self.raw_plotter {
                        p.set_refresh_time(seconds);
                    }
                }
                "Raw Plot.ViewTime" => {
                    if let Some(p) = &self.raw_plotter {
                        p.set_view_time(seconds);
                    }
                }
                "PSD Options.RefreshTime" => {
                    if let Some(p) = &self.psd_plotter {
                        p.set_refresh_time(seconds);
                    }
                }
                _ => {}
            }
        }
    }

    fn route(&mut self, path: &str, value: &ParamValue) {
        if let Err(e) = self.params.set(path, value.clone()) {
            warn!("could not forward {path}: {e}");
        }
    }

    /// Rebuild the plotted channel sets after rows or columns changed.
    pub fn on_new_conf(&mut self) {
        let channels = self.params.sampling.channel_names();
        let raw = self.params.sampling.raw_channel_names();
        info!(
            "channel configuration: {} channels, {} rows",
            channels.len(),
            raw.len()
        );
        self.params.plot.set_channels(channels);
        self.params.raw_plot.set_channels(raw);
    }

    /// Drain worker events. Returns messages worth showing to the user.
    pub fn poll_events(&mut self) -> Vec<String> {
        let Some(events) = &self.events else {
            return Vec::new();
        };
        let pending: Vec<SessionEvent> = events.try_iter().collect();
        let mut messages = Vec::new();
        let mut must_stop = false;
        for event in pending {
            match event {
                SessionEvent::NewBlock { at } => self.clock.tick(at),
                SessionEvent::AcquisitionFinished { blocks } => {
                    messages.push(format!("acquisition finished after {blocks} blocks"));
                    must_stop = true;
                }
                SessionEvent::Error(e) => {
                    messages.push(format!("acquisition error: {e}"));
                    must_stop = true;
                }
            }
        }
        if must_stop {
            if let Err(e) = self.stop() {
                messages.push(format!("stop failed: {e}"));
            }
            self.events = None;
        }
        messages
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            running: self.is_running(),
            blocks: self.clock.blocks,
            last_interval: self.clock.last_interval,
            mean_interval: self.clock.mean(),
            consumers: self
                .consumers
                .iter()
                .map(|(name, s)| ConsumerStats {
                    name: name.clone(),
                    delivered: s.delivered(),
                    dropped: s.dropped(),
                })
                .collect(),
            recording: self.recording.clone(),
            last_record: self.last_record.clone(),
        }
    }

    pub fn processed_frame(&self) -> Option<TimeSeriesFrame> {
        self.plotter.as_ref().and_then(|p| p.latest_frame())
    }
    pub fn raw_frame(&self) -> Option<TimeSeriesFrame> {
        self.raw_plotter.as_ref().and_then(|p| p.latest_frame())
    }
    pub fn psd_frame(&self) -> Option<PsdFrame> {
        self.psd_plotter.as_ref().and_then(|p| p.latest_frame())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("error while shutting down: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{column_path, row_path, PATH_NBLOCKS, PATH_NDISCARD, PATH_NSAMPSCO};
    use crate::drivers::ManualSource;
    use ndarray::Array2;
    use std::fs;
    use std::thread;

    /// 2 rows x 2 columns, 100 Hz per channel, 4 samples per slot, 5 cycles per block.
    fn small_session() -> Session {
        let mut s = Session::new(AppParameters::default());
        s.set_param(config::PATH_FSXCH, ParamValue::Float(100.0)).unwrap();
        s.set_param(PATH_NDISCARD, ParamValue::Int(1)).unwrap();
        s.set_param(PATH_NSAMPSCO, ParamValue::Int(4)).unwrap();
        s.set_param(PATH_NBLOCKS, ParamValue::Int(5)).unwrap();
        for i in 3..=8 {
            s.set_param(&row_path(&format!("Ch{i:02}")), ParamValue::Bool(false))
                .unwrap();
            s.set_param(&column_path(&format!("Col{i:02}")), ParamValue::Bool(false))
                .unwrap();
        }
        s
    }

    fn raw_blocks(n: usize) -> ManualSource {
        ManualSource::new((0..n).map(|b| Array2::from_elem((2, 40), b as f32)))
    }

    fn wait_until_stopped(s: &mut Session) -> Vec<String> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut messages = Vec::new();
        while s.is_running() && Instant::now() < deadline {
            messages.extend(s.poll_events());
            thread::sleep(Duration::from_millis(5));
        }
        messages
    }

    #[test]
    fn routing_follows_sampling_changes() {
        let s = small_session();
        let p = s.params();
        assert_eq!(p.plot.fs, 100.0);
        assert_eq!(p.psd.fs, 100.0);
        assert_eq!(p.raw_plot.fs, 100.0 * 4.0 * 2.0);
        assert_eq!(
            p.plot.channels.keys().cloned().collect::<Vec<_>>(),
            vec!["Ch01Col01", "Ch01Col02", "Ch02Col01", "Ch02Col02"]
        );
        assert_eq!(p.raw_plot.channels.len(), 2);
    }

    #[test]
    fn run_to_exhaustion_records_and_plots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.csv");
        let mut s = small_session();
        s.set_param(
            "Record File.File Path",
            ParamValue::Text(path.display().to_string()),
        )
        .unwrap();
        assert_eq!(s.button_text(), "Start Acq!");
        s.start_with_source(Box::new(raw_blocks(3))).unwrap();
        assert_eq!(s.button_text(), "Stop Gen");
        assert_eq!(s.stats().recording.as_deref(), Some(path.as_path()));

        let messages = wait_until_stopped(&mut s);
        assert!(!s.is_running());
        assert_eq!(s.button_text(), "Start Gen");
        assert!(messages.iter().any(|m| m.contains("finished after 3 blocks")));

        let stats = s.stats();
        assert_eq!(stats.blocks, 3);
        assert!(stats.mean_interval.is_some());
        assert_eq!(stats.consumers.len(), 4);
        assert!(stats.consumers.iter().all(|c| c.delivered + c.dropped == 3));
        assert_eq!(stats.last_record.as_ref().map(|r| r.samples), Some(15));

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 1 + 15);
        let frame = s.processed_frame().unwrap();
        assert_eq!(frame.samples.len(), 4);
        assert_eq!(s.raw_frame().unwrap().samples.len(), 2);
        // 15 samples are far from one 1024-point segment.
        assert!(s.psd_frame().is_none());
    }

    #[test]
    fn invalid_layout_does_not_start() {
        let mut s = small_session();
        s.set_param(&column_path("Col01"), ParamValue::Bool(false)).unwrap();
        s.set_param(&column_path("Col02"), ParamValue::Bool(false)).unwrap();
        assert!(s.start_with_source(Box::new(raw_blocks(1))).is_err());
        assert!(!s.is_running());
        assert_eq!(s.button_text(), "Start Acq!");
        assert!(s.stats().consumers.is_empty());
    }

    #[test]
    fn toggle_start_stop_start() {
        let mut s = Session::new(AppParameters::default());
        s.on_btn_start().unwrap();
        assert!(s.is_running());
        assert!(matches!(
            s.start_with_source(Box::new(raw_blocks(1))),
            Err(AcqError::AlreadyRunning)
        ));
        thread::sleep(Duration::from_millis(30));
        s.set_param("Plot options.ViewTime", ParamValue::Float(1.0))
            .unwrap();
        s.set_param("PSD Options.RefreshTime", ParamValue::Float(0.5))
            .unwrap();
        s.on_btn_start().unwrap();
        assert!(!s.is_running());
        assert_eq!(s.button_text(), "Start Gen");
        // No file path: the writer is never created.
        assert_eq!(s.stats().consumers.len(), 3);
        assert!(s.stats().last_record.is_none());

        s.on_btn_start().unwrap();
        assert!(s.is_running());
        assert_eq!(s.stats().blocks, 0);
        s.stop().unwrap();
        assert!(!s.is_running());
    }

    #[test]
    fn demux_error_stops_session() {
        let mut s = small_session();
        let bad = ManualSource::new([Array2::zeros((2, 7))]);
        s.start_with_source(Box::new(bad)).unwrap();
        let messages = wait_until_stopped(&mut s);
        assert!(!s.is_running());
        assert!(messages.iter().any(|m| m.starts_with("acquisition error")));
    }

    fn wait_for<T>(mut probe: impl FnMut() -> Option<T>) -> Option<T> {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if let Some(found) = probe() {
                return Some(found);
            }
            thread::sleep(Duration::from_millis(10));
        }
        None
    }

    #[test]
    fn refresh_edits_reach_running_plotters() {
        let mut s = small_session();
        for path in [
            "Plot options.RefreshTime",
            "Raw Plot.RefreshTime",
            "PSD Options.RefreshTime",
        ] {
            s.set_param(path, ParamValue::Float(30.0)).unwrap();
        }
        s.set_param("PSD Options.nFFT", ParamValue::Int(16)).unwrap();
        s.set_param("PSD Options.nAvg", ParamValue::Int(1)).unwrap();
        // Paced: one 50 ms block at a time.
        s.on_btn_start().unwrap();
        thread::sleep(Duration::from_millis(300));
        assert!(s.processed_frame().is_none());
        assert!(s.raw_frame().is_none());
        assert!(s.psd_frame().is_none());

        for path in [
            "Plot options.RefreshTime",
            "Raw Plot.RefreshTime",
            "PSD Options.RefreshTime",
        ] {
            s.set_param(path, ParamValue::Float(0.05)).unwrap();
        }
        assert!(wait_for(|| s.processed_frame()).is_some());
        assert!(wait_for(|| s.raw_frame()).is_some());
        let psd = wait_for(|| s.psd_frame()).unwrap();
        assert_eq!(psd.segments, 1);
        assert_eq!(psd.frequencies_hz.len(), 9);
        assert!(s.is_running());
        s.stop().unwrap();
    }

    #[test]
    fn view_time_edits_reach_running_plotters() {
        let mut s = small_session();
        s.on_btn_start().unwrap();
        s.set_param("Plot options.ViewTime", ParamValue::Float(0.25))
            .unwrap();
        s.set_param("Raw Plot.ViewTime", ParamValue::Float(0.25))
            .unwrap();
        // Well over the five 50 ms blocks either history holds.
        thread::sleep(Duration::from_millis(600));
        s.stop().unwrap();

        // Processed 100 Hz, raw 100 * 4 * 2 = 800 Hz.
        let processed = s.processed_frame().unwrap();
        assert!(processed.samples.iter().all(|c| c.len() == 25));
        let raw = s.raw_frame().unwrap();
        assert!(raw.samples.iter().all(|c| c.len() == 200));
    }

    #[test]
    fn sampling_edits_wait_for_the_next_start() {
        let mut s = small_session();
        s.on_btn_start().unwrap();
        s.set_param(&column_path("Col02"), ParamValue::Bool(false))
            .unwrap();
        assert_eq!(s.params().plot.channels.len(), 2);
        assert_eq!(s.params().raw_plot.fs, 100.0 * 4.0);
        thread::sleep(Duration::from_millis(150));
        s.stop().unwrap();
        assert_eq!(s.processed_frame().unwrap().samples.len(), 4);

        s.on_btn_start().unwrap();
        thread::sleep(Duration::from_millis(150));
        s.stop().unwrap();
        assert_eq!(s.processed_frame().unwrap().samples.len(), 2);
        assert_eq!(
            s.processed_frame().unwrap().channel_labels,
            vec!["Ch01Col01", "Ch02Col01"]
        );
    }

    #[test]
    fn dropping_a_running_session_finishes_the_recording() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.csv");
        let mut s = small_session();
        s.set_param(
            "Record File.File Path",
            ParamValue::Text(path.display().to_string()),
        )
        .unwrap();
        s.on_btn_start().unwrap();
        thread::sleep(Duration::from_millis(120));
        drop(s);

        let sidecar = fs::read_to_string(dir.path().join("run.csv.meta.json")).unwrap();
        let meta: serde_json::Value = serde_json::from_str(&sidecar).unwrap();
        assert_eq!(meta["finished"], true);
        let rows = fs::read_to_string(&path).unwrap().lines().count() as u64 - 1;
        assert_eq!(meta["samples"], rows);
        assert!(rows > 0);
    }

    #[test]
    fn unwritable_recording_path_does_not_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("run.csv");
        let mut s = small_session();
        s.set_param(
            "Record File.File Path",
            ParamValue::Text(path.display().to_string()),
        )
        .unwrap();
        assert!(s.start_with_source(Box::new(raw_blocks(3))).is_err());
        assert!(!s.is_running());
        assert!(s.stats().consumers.is_empty());
        assert!(s.stats().recording.is_none());
        assert!(!path.exists());
    }
}
