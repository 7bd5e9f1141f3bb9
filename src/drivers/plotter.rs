use std::collections::BTreeMap;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::drivers::{AcqError, SignalBuffer, TimeSeriesFrame};
use crate::types::{BlockPart, MuxBlock};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum YScale {
    /// Follow the min and max of the visible window.
    Auto,
    /// Fix the Y axis to +/- the given value.
    Fixed(f32),
}
impl Default for YScale {
    fn default() -> Self {
        YScale::Auto
    }
}

/// Everything a time-domain plot worker needs to start.
#[derive(Clone, Debug, PartialEq)]
pub struct PlotterSettings {
    pub n_channels: usize,
    /// Channel name -> row index inside the block part being plotted.
    pub channel_conf: BTreeMap<String, usize>,
    pub fs: f64,
    pub view_time: f64,
    pub refresh_time: f64,
    pub show_time: bool,
    pub y_scale: YScale,
    pub part: BlockPart,
}

/// Live reconfiguration of a running view worker.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ViewCommand {
    SetViewTime(f64),
    SetRefreshTime(f64),
    Stop,
}

/// A consumer-side model that turns blocks into something drawable.
pub trait BlockView: Send + 'static {
    type Frame: Clone + Send + 'static;
    fn ingest(&mut self, block: &MuxBlock) -> Result<(), AcqError>;
    fn render(&self) -> Option<Self::Frame>;
    fn set_view_time(&mut self, _seconds: f64) {}
}

/// Background thread that feeds a [`BlockView`] and publishes its frames
/// every refresh period.
pub struct ViewWorker<F> {
    name: String,
    commands: Sender<ViewCommand>,
    latest: Arc<Mutex<Option<F>>>,
    handle: Option<JoinHandle<()>>,
}

impl<F: Clone + Send + 'static> ViewWorker<F> {
    pub fn spawn<V>(
        name: &str,
        mut view: V,
        refresh_time: f64,
        blocks: Receiver<Arc<MuxBlock>>,
    ) -> Result<Self, AcqError>
    where
        V: BlockView<Frame = F>,
    {
        let (commands, command_rx) = channel();
        let latest = Arc::new(Mutex::new(None));
        let slot = latest.clone();
        let thread_name = name.to_owned();
        let handle = thread::Builder::new().name(name.into()).spawn(move || {
            let mut refresh = refresh_period(refresh_time);
            let mut last_refresh = Instant::now();
            let mut dirty = false;
            info!("{thread_name} started");
            'run: loop {
                let wait = refresh.saturating_sub(last_refresh.elapsed());
                match blocks.recv_timeout(wait.max(Duration::from_millis(1))) {
                    Ok(block) => match view.ingest(&block) {
                        Ok(()) => dirty = true,
                        Err(e) => warn!("{thread_name} skipped block {}: {e}", block.seq),
                    },
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break 'run,
                }
                for cmd in command_rx.try_iter() {
                    match cmd {
                        ViewCommand::SetViewTime(secs) => {
                            view.set_view_time(secs);
                            dirty = true;
                        }
                        ViewCommand::SetRefreshTime(secs) => refresh = refresh_period(secs),
                        ViewCommand::Stop => {
                            for block in blocks.try_iter() {
                                if view.ingest(&block).is_ok() {
                                    dirty = true;
                                }
                            }
                            break 'run;
                        }
                    }
                }
                if dirty && last_refresh.elapsed() >= refresh {
                    publish(&slot, view.render());
                    last_refresh = Instant::now();
                    dirty = false;
                }
            }
            if dirty {
                publish(&slot, view.render());
            }
            info!("{thread_name} stopped");
        })?;
        Ok(Self {
            name: name.to_owned(),
            commands,
            latest,
            handle: Some(handle),
        })
    }
    pub fn set_view_time(&self, seconds: f64) {
        debug!("{}: view time {seconds} s", self.name);
        self.commands.send(ViewCommand::SetViewTime(seconds)).ok();
    }
    pub fn set_refresh_time(&self, seconds: f64) {
        debug!("{}: refresh time {seconds} s", self.name);
        self.commands.send(ViewCommand::SetRefreshTime(seconds)).ok();
    }
    pub fn latest_frame(&self) -> Option<F> {
        self.latest.lock().ok().and_then(|f| f.as_ref().cloned())
    }
    pub fn stop(&mut self) -> Result<(), AcqError> {
        self.commands.send(ViewCommand::Stop).ok();
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| AcqError::WorkerPanicked(self.name.clone())),
            None => Ok(()),
        }
    }
}

impl<F> Drop for ViewWorker<F> {
    fn drop(&mut self) {
        self.commands.send(ViewCommand::Stop).ok();
        if let Some(handle) = self.handle.take() {
            handle.join().ok();
        }
    }
}

fn refresh_period(seconds: f64) -> Duration {
    Duration::from_secs_f64(seconds.clamp(0.01, 60.0))
}

fn publish<F>(slot: &Mutex<Option<F>>, frame: Option<F>) {
    if let (Ok(mut guard), Some(frame)) = (slot.lock(), frame) {
        *guard = Some(frame);
    }
}

/// Scrolling time-domain view of selected channels.
pub struct WaveformView {
    settings: PlotterSettings,
    rows: Vec<usize>,
    buffer: SignalBuffer,
}

impl WaveformView {
    pub fn new(settings: PlotterSettings) -> Result<Self, AcqError> {
        if settings.n_channels != settings.channel_conf.len() {
            return Err(AcqError::ChannelMismatch {
                expected: settings.n_channels,
                actual: settings.channel_conf.len(),
            });
        }
        let (labels, rows): (Vec<String>, Vec<usize>) = settings
            .channel_conf
            .iter()
            .map(|(name, &idx)| (name.clone(), idx))
            .unzip();
        let buffer = SignalBuffer::with_history_seconds(labels, settings.fs, settings.view_time)?;
        Ok(Self {
            settings,
            rows,
            buffer,
        })
    }
}

impl BlockView for WaveformView {
    type Frame = TimeSeriesFrame;
    fn ingest(&mut self, block: &MuxBlock) -> Result<(), AcqError> {
        let data = self.settings.part.select(block);
        self.buffer.push_rows(data.view(), &self.rows)
    }
    fn render(&self) -> Option<TimeSeriesFrame> {
        if self.buffer.is_empty() {
            return None;
        }
        let mut frame = self.buffer.full_frame();
        frame.show_time = self.settings.show_time;
        frame.y_range = match self.settings.y_scale {
            YScale::Auto => None,
            YScale::Fixed(mag) => Some((-mag, mag)),
        };
        Some(frame)
    }
    fn set_view_time(&mut self, seconds: f64) {
        self.settings.view_time = seconds;
        self.buffer.set_history_seconds(seconds);
    }
}

/// Time-domain plot worker.
pub type Plotter = ViewWorker<TimeSeriesFrame>;

impl Plotter {
    pub fn start(
        name: &str,
        settings: PlotterSettings,
        blocks: Receiver<Arc<MuxBlock>>,
    ) -> Result<Self, AcqError> {
        let refresh = settings.refresh_time;
        Self::spawn(name, WaveformView::new(settings)?, refresh, blocks)
    }
}
