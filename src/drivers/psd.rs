use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use log::debug;
use rustfft::{num_complex::Complex64, Fft, FftPlanner};
use serde::{Deserialize, Serialize};

use crate::drivers::{AcqError, BlockView, SignalBuffer, ViewWorker};
use crate::types::MuxBlock;

/// Normalisation of the averaged periodogram.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PsdScaling {
    /// Power spectral density, units²/Hz.
    #[default]
    Density,
    /// Power spectrum, units².
    Spectrum,
}

impl PsdScaling {
    pub const ALL: [PsdScaling; 2] = [PsdScaling::Density, PsdScaling::Spectrum];
    pub fn label(&self) -> &'static str {
        match self {
            PsdScaling::Density => "density",
            PsdScaling::Spectrum => "spectrum",
        }
    }
    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.label() == label)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PsdSettings {
    pub n_channels: usize,
    pub channel_conf: BTreeMap<String, usize>,
    pub fs: f64,
    pub n_fft: usize,
    pub n_avg: usize,
    pub scaling: PsdScaling,
    pub refresh_time: f64,
}

impl PsdSettings {
    /// Seconds of signal behind one fully averaged estimate.
    pub fn acq_time(&self) -> f64 {
        (self.n_fft * self.n_avg) as f64 / self.fs
    }
}

/// Averaged spectrum of every plotted channel.
#[derive(Clone, Debug)]
pub struct PsdFrame {
    pub frequencies_hz: Vec<f64>,
    pub psd: Vec<Vec<f64>>, // channel -> bins
    pub channel_labels: Vec<String>,
    pub scaling: PsdScaling,
    pub segments: usize,
}

fn hann(len: usize) -> Vec<f64> {
    // Periodic Hann, the usual choice for spectral estimation.
    (0..len)
        .map(|n| 0.5 - 0.5 * (2.0 * PI * n as f64 / len as f64).cos())
        .collect()
}

/// Frequencies of the one-sided bins for an `n_fft` point transform.
pub fn frequencies(fs: f64, n_fft: usize) -> Vec<f64> {
    (0..=n_fft / 2).map(|k| k as f64 * fs / n_fft as f64).collect()
}

/// Welch estimate over the newest non-overlapping `fft.len()` segments of
/// `samples` (at most `n_avg` of them). Returns `None` when not even one
/// segment is available.
pub fn welch(
    fft: &dyn Fft<f64>,
    samples: &[f32],
    fs: f64,
    n_avg: usize,
    scaling: PsdScaling,
) -> Option<(Vec<f64>, usize)> {
    let n_fft = fft.len();
    if n_fft < 2 || fs <= 0.0 {
        return None;
    }
    let segments = (samples.len() / n_fft).min(n_avg.max(1));
    if segments == 0 {
        return None;
    }
    let window = hann(n_fft);
    let norm = match scaling {
        PsdScaling::Density => fs * window.iter().map(|w| w * w).sum::<f64>(),
        PsdScaling::Spectrum => window.iter().sum::<f64>().powi(2),
    };
    let n_bins = n_fft / 2 + 1;
    let mut acc = vec![0.0f64; n_bins];
    let start = samples.len() - segments * n_fft;
    let mut buffer = vec![Complex64::new(0.0, 0.0); n_fft];
    for segment in samples[start..].chunks_exact(n_fft) {
        let mean = segment.iter().map(|&v| v as f64).sum::<f64>() / n_fft as f64;
        for ((slot, &v), w) in buffer.iter_mut().zip(segment).zip(&window) {
            *slot = Complex64::new((v as f64 - mean) * w, 0.0);
        }
        fft.process(&mut buffer);
        for (a, c) in acc.iter_mut().zip(&buffer) {
            *a += c.norm_sqr();
        }
    }
    for (k, a) in acc.iter_mut().enumerate() {
        let one_sided = if k == 0 || (n_fft % 2 == 0 && k == n_fft / 2) {
            1.0
        } else {
            2.0
        };
        *a *= one_sided / (norm * segments as f64);
    }
    Some((acc, segments))
}

/// Spectral view fed with processed blocks.
pub struct PsdView {
    settings: PsdSettings,
    rows: Vec<usize>,
    buffer: SignalBuffer,
    fft: Arc<dyn Fft<f64>>,
}

impl PsdView {
    pub fn new(settings: PsdSettings) -> Result<Self, AcqError> {
        if !(settings.fs > 0.0) {
            return Err(AcqError::InvalidSampleRate);
        }
        if settings.n_channels != settings.channel_conf.len() {
            return Err(AcqError::ChannelMismatch {
                expected: settings.n_channels,
                actual: settings.channel_conf.len(),
            });
        }
        if settings.n_fft < 2 {
            return Err(AcqError::InvalidLayout(format!(
                "nFFT {} is too short",
                settings.n_fft
            )));
        }
        let (labels, rows): (Vec<String>, Vec<usize>) = settings
            .channel_conf
            .iter()
            .map(|(name, &idx)| (name.clone(), idx))
            .unzip();
        let capacity = settings.n_fft * settings.n_avg.max(1);
        let buffer = SignalBuffer::with_capacity(labels, settings.fs, capacity);
        let fft = FftPlanner::<f64>::new().plan_fft_forward(settings.n_fft);
        debug!(
            "psd: {} point FFT, {} averages, {:.2} s per estimate",
            settings.n_fft,
            settings.n_avg,
            settings.acq_time()
        );
        Ok(Self {
            settings,
            rows,
            buffer,
            fft,
        })
    }
}

impl BlockView for PsdView {
    type Frame = PsdFrame;
    fn ingest(&mut self, block: &MuxBlock) -> Result<(), AcqError> {
        self.buffer.push_rows(block.out.view(), &self.rows)
    }
    fn render(&self) -> Option<PsdFrame> {
        let s = &self.settings;
        let mut segments = 0;
        let mut psd = Vec::with_capacity(self.rows.len());
        for channel in self.buffer.latest(self.buffer.capacity()) {
            let (bins, used) = welch(self.fft.as_ref(), &channel, s.fs, s.n_avg, s.scaling)?;
            segments = used;
            psd.push(bins);
        }
        Some(PsdFrame {
            frequencies_hz: frequencies(s.fs, s.n_fft),
            psd,
            channel_labels: self.buffer.channel_labels().to_vec(),
            scaling: s.scaling,
            segments,
        })
    }
}

/// Spectral plot worker.
pub type PsdPlotter = ViewWorker<PsdFrame>;

impl PsdPlotter {
    pub fn start(
        name: &str,
        settings: PsdSettings,
        blocks: Receiver<Arc<MuxBlock>>,
    ) -> Result<Self, AcqError> {
        let refresh = settings.refresh_time;
        Self::spawn(name, PsdView::new(settings)?, refresh, blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn sine(fs: f64, freq: f64, amp: f64, n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| (amp * (2.0 * PI * freq * i as f64 / fs).sin()) as f32)
            .collect()
    }

    #[test]
    fn density_integrates_to_signal_power() {
        let fs = 1000.0;
        let n_fft = 256;
        // Bin-centred tone: 40 * fs / n_fft.
        let freq = 40.0 * fs / n_fft as f64;
        let x = sine(fs, freq, 2.0, n_fft * 4);
        let fft = FftPlanner::<f64>::new().plan_fft_forward(n_fft);
        let (psd, segments) = welch(fft.as_ref(), &x, fs, 4, PsdScaling::Density).unwrap();
        assert_eq!(segments, 4);
        assert_eq!(psd.len(), n_fft / 2 + 1);
        let df = fs / n_fft as f64;
        let power: f64 = psd.iter().sum::<f64>() * df;
        assert!((power - 2.0).abs() < 0.02, "power {power}");
        let peak = psd
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(k, _)| k)
            .unwrap();
        assert_eq!(peak, 40);
    }

    #[test]
    fn spectrum_scaling_reads_tone_power_at_peak() {
        let fs = 512.0;
        let n_fft = 512;
        let x = sine(fs, 64.0, 1.0, n_fft);
        let fft = FftPlanner::<f64>::new().plan_fft_forward(n_fft);
        let (ps, _) = welch(fft.as_ref(), &x, fs, 1, PsdScaling::Spectrum).unwrap();
        // Power of a unit sine is 0.5.
        assert!((ps[64] - 0.5).abs() < 1e-6, "peak {}", ps[64]);
    }

    #[test]
    fn too_short_input_gives_nothing() {
        let fft = FftPlanner::<f64>::new().plan_fft_forward(128);
        assert!(welch(fft.as_ref(), &[0.0; 100], 100.0, 2, PsdScaling::Density).is_none());
    }

    #[test]
    fn uses_newest_segments_only() {
        let fft = FftPlanner::<f64>::new().plan_fft_forward(64);
        let mut x = vec![100.0f32; 64];
        x.extend(std::iter::repeat(0.0).take(64));
        let (psd, segments) = welch(fft.as_ref(), &x, 64.0, 1, PsdScaling::Density).unwrap();
        assert_eq!(segments, 1);
        assert!(psd.iter().all(|&p| p == 0.0));
    }

    #[test]
    fn view_renders_once_a_segment_is_buffered() {
        let settings = PsdSettings {
            n_channels: 1,
            channel_conf: [("Ch01Col01".to_string(), 0usize)].into_iter().collect(),
            fs: 100.0,
            n_fft: 32,
            n_avg: 2,
            scaling: PsdScaling::Density,
            refresh_time: 0.1,
        };
        assert!((settings.acq_time() - 0.64).abs() < 1e-12);
        let mut view = PsdView::new(settings).unwrap();
        let block = |n| MuxBlock {
            seq: 0,
            t0: 0.0,
            raw: Array2::zeros((1, 1)),
            out: Array2::from_shape_fn((1, n), |(_, i)| (i as f32 * 0.7).sin()),
        };
        view.ingest(&block(20)).unwrap();
        assert!(view.render().is_none());
        view.ingest(&block(20)).unwrap();
        let frame = view.render().unwrap();
        assert_eq!(frame.segments, 1);
        assert_eq!(frame.frequencies_hz.len(), 17);
        assert_eq!(frame.psd[0].len(), 17);
        assert_eq!(PsdScaling::from_label("spectrum"), Some(PsdScaling::Spectrum));
    }
}
