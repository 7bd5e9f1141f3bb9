use std::collections::VecDeque;

use ndarray::ArrayView2;

use crate::drivers::AcqError;
/// Flattened view of the current time-domain buffer.
#[derive(Clone, Debug)]
pub struct TimeSeriesFrame {
    pub sample_rate_hz: f64,
    pub channel_labels: Vec<String>,
    pub samples: Vec<Vec<f32>>, // channels x samples
    /// Index of the newest sample since the worker started.
    pub last_index: u64,
    /// Plot against seconds instead of sample index.
    pub show_time: bool,
    pub y_range: Option<(f32, f32)>,
    pub stats: Vec<ChannelStats>,
}
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ChannelStats {
    pub min: f32,
    pub max: f32,
    pub rms: f32,
}
impl ChannelStats {
    pub fn of(samples: &[f32]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut min = f32::MAX;
        let mut max = f32::MIN;
        let mut sum_sq = 0.0f32;
        for &v in samples {
            min = min.min(v);
            max = max.max(v);
            sum_sq += v * v;
        }
        Self {
            min,
            max,
            rms: (sum_sq / samples.len() as f32).sqrt(),
        }
    }
}
impl TimeSeriesFrame {
    pub fn duration_seconds(&self) -> f64 {
        self.samples
            .first()
            .map(|c| c.len() as f64 / self.sample_rate_hz)
            .unwrap_or(0.0)
    }
    /// Plot points of one channel, x in seconds or sample index.
    pub fn points(&self, channel: usize) -> Vec<[f64; 2]> {
        let Some(samples) = self.samples.get(channel) else {
            return Vec::new();
        };
        let first = (self.last_index + 1).saturating_sub(samples.len() as u64);
        samples
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let idx = (first + i as u64) as f64;
                let x = if self.show_time {
                    idx / self.sample_rate_hz
                } else {
                    idx
                };
                [x, *v as f64]
            })
            .collect()
    }
}
/// Rolling buffer that stores recent samples per channel.
pub struct SignalBuffer {
    per_channel: Vec<VecDeque<f32>>, // channel -> samples
    channel_labels: Vec<String>,
    sample_rate_hz: f64,
    capacity: usize,
    total_pushed: u64,
}
impl SignalBuffer {
    pub fn with_history_seconds(
        channel_labels: Vec<String>,
        sample_rate_hz: f64,
        history_seconds: f64,
    ) -> Result<Self, AcqError> {
        if !(sample_rate_hz > 0.0) {
            return Err(AcqError::InvalidSampleRate);
        }
        let capacity = Self::capacity_for(sample_rate_hz, history_seconds);
        Ok(Self::with_capacity(channel_labels, sample_rate_hz, capacity))
    }
    pub fn with_capacity(
        channel_labels: Vec<String>,
        sample_rate_hz: f64,
        capacity: usize,
    ) -> Self {
        let capacity = capacity.max(1);
        let per_channel = channel_labels
            .iter()
            .map(|_| VecDeque::with_capacity(capacity))
            .collect();
        Self {
            per_channel,
            channel_labels,
            sample_rate_hz,
            capacity,
            total_pushed: 0,
        }
    }
    fn capacity_for(sample_rate_hz: f64, seconds: f64) -> usize {
        ((sample_rate_hz * seconds).ceil() as usize).max(1)
    }
    pub fn channel_labels(&self) -> &[String] {
        &self.channel_labels
    }
    pub fn capacity(&self) -> usize {
        self.capacity
    }
    pub fn len(&self) -> usize {
        self.per_channel.first().map(|c| c.len()).unwrap_or(0)
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Append rows `indices` of a channels x samples block, in buffer channel order.
    pub fn push_rows(&mut self, block: ArrayView2<f32>, indices: &[usize]) -> Result<(), AcqError> {
        if indices.len() != self.per_channel.len() {
            return Err(AcqError::ChannelMismatch {
                expected: self.per_channel.len(),
                actual: indices.len(),
            });
        }
        if let Some(&bad) = indices.iter().find(|&&i| i >= block.nrows()) {
            return Err(AcqError::ChannelMismatch {
                expected: bad + 1,
                actual: block.nrows(),
            });
        }
        for (channel_queue, &row) in self.per_channel.iter_mut().zip(indices) {
            for &sample in block.row(row).iter() {
                if channel_queue.len() == self.capacity {
                    channel_queue.pop_front();
                }
                channel_queue.push_back(sample);
            }
        }
        self.total_pushed += block.ncols() as u64;
        Ok(())
    }
    pub fn set_history_seconds(&mut self, seconds: f64) {
        self.set_capacity(Self::capacity_for(self.sample_rate_hz, seconds));
    }
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        for channel in &mut self.per_channel {
            let excess = channel.len().saturating_sub(self.capacity);
            channel.drain(..excess);
        }
    }
    /// Newest `n` samples of every channel (fewer if not buffered yet).
    pub fn latest(&self, n: usize) -> Vec<Vec<f32>> {
        self.per_channel
            .iter()
            .map(|channel| {
                let skip = channel.len().saturating_sub(n);
                channel.iter().skip(skip).copied().collect()
            })
            .collect()
    }
    pub fn snapshot(&self, seconds: f64) -> TimeSeriesFrame {
        let samples = self.latest(Self::capacity_for(self.sample_rate_hz, seconds));
        let stats = samples.iter().map(|c| ChannelStats::of(c)).collect();
        TimeSeriesFrame {
            sample_rate_hz: self.sample_rate_hz,
            channel_labels: self.channel_labels.clone(),
            samples,
            last_index: self.total_pushed.saturating_sub(1),
            show_time: true,
            y_range: None,
            stats,
        }
    }
    pub fn full_frame(&self) -> TimeSeriesFrame {
        self.snapshot(self.capacity as f64 / self.sample_rate_hz)
    }
}
