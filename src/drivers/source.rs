#[cfg(test)]
use std::collections::VecDeque;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use ndarray::Array2;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::drivers::{AcqError, MuxLayout};

/// Longest uninterrupted sleep while pacing, bounds the stop latency.
const PACE_SLICE: Duration = Duration::from_millis(10);

/// Something that delivers raw multiplexed blocks (rows x raw samples).
///
/// `read_block` blocks until the next block is ready, the way a device driver
/// read does, but returns early once `running` goes false. `Ok(None)` means
/// the source has nothing more to give.
pub trait MuxSource: Send {
    fn read_block(
        &mut self,
        layout: &MuxLayout,
        running: &AtomicBool,
    ) -> Result<Option<Array2<f32>>, AcqError>;
}

/// Signal model of the simulated array.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimSettings {
    /// Sine amplitude per channel.
    pub amplitude: f64,
    /// Peak uniform noise.
    pub noise: f64,
    /// Frequency of the first channel; each further channel adds 1.5 Hz.
    pub frequency_hz: f64,
    pub seed: u64,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            amplitude: 1.0e-3,
            noise: 1.0e-4,
            frequency_hz: 10.0,
            seed: 0x5eed,
        }
    }
}

/// Software stand-in for the 8x8 multiplexed array.
pub struct SimulatedMux {
    settings: SimSettings,
    rng: StdRng,
    cycle: u64,
    next_deadline: Option<Instant>,
    paced: bool,
}

impl SimulatedMux {
    pub fn new(settings: SimSettings) -> Self {
        let rng = StdRng::seed_from_u64(settings.seed);
        Self {
            settings,
            rng,
            cycle: 0,
            next_deadline: None,
            paced: true,
        }
    }
    /// Produce blocks as fast as asked instead of in real time.
    #[cfg(test)]
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }
    fn channel_value(&mut self, row: usize, channel: usize, t: f64) -> f64 {
        let s = &self.settings;
        let freq = s.frequency_hz + channel as f64 * 1.5;
        let offset = 1.0e-3 * row as f64;
        let noise = if s.noise > 0.0 {
            self.rng.gen_range(-s.noise..s.noise)
        } else {
            0.0
        };
        offset + s.amplitude * (2.0 * PI * freq * t).sin() + noise
    }
    fn pace(&mut self, period: Duration, running: &AtomicBool) {
        if !self.paced {
            return;
        }
        let deadline = *self.next_deadline.get_or_insert_with(Instant::now) + period;
        while running.load(Ordering::Acquire) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(PACE_SLICE));
        }
        self.next_deadline = Some(deadline);
    }
}

impl MuxSource for SimulatedMux {
    fn read_block(
        &mut self,
        layout: &MuxLayout,
        running: &AtomicBool,
    ) -> Result<Option<Array2<f32>>, AcqError> {
        layout.validate()?;
        self.pace(layout.block_duration(), running);
        let n_cols = layout.n_columns();
        let nsc = layout.n_samps_co;
        let mut raw = Array2::<f32>::zeros((layout.n_rows(), layout.raw_block_len()));
        for k in 0..layout.n_blocks {
            let t = (self.cycle + k as u64) as f64 / layout.fs_x_ch;
            for r in 0..layout.n_rows() {
                for c in 0..n_cols {
                    let value = self.channel_value(r, r * n_cols + c, t);
                    let slot = (k * n_cols + c) * nsc;
                    for i in 0..nsc {
                        // Switching transient decays over the discarded samples.
                        let glitch = if i < layout.n_discard {
                            0.01 * (-(i as f64)).exp()
                        } else {
                            0.0
                        };
                        raw[[r, slot + i]] = (value + glitch) as f32;
                    }
                }
            }
        }
        self.cycle += layout.n_blocks as u64;
        Ok(Some(raw))
    }
}

/// In-memory source for deterministic playback in tests.
#[cfg(test)]
pub struct ManualSource {
    queue: VecDeque<Array2<f32>>,
}
#[cfg(test)]
impl ManualSource {
    pub fn new(blocks: impl IntoIterator<Item = Array2<f32>>) -> Self {
        Self {
            queue: blocks.into_iter().collect(),
        }
    }
}
#[cfg(test)]
impl MuxSource for ManualSource {
    fn read_block(
        &mut self,
        _layout: &MuxLayout,
        _running: &AtomicBool,
    ) -> Result<Option<Array2<f32>>, AcqError> {
        Ok(self.queue.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::demux::{demux, test_layout};

    static RUNNING: AtomicBool = AtomicBool::new(true);

    #[test]
    fn simulated_blocks_have_layout_shape() {
        let layout = test_layout(3, 2);
        let mut sim = SimulatedMux::new(SimSettings::default()).unpaced();
        let raw = sim.read_block(&layout, &RUNNING).unwrap().unwrap();
        assert_eq!(raw.dim(), (3, layout.raw_block_len()));
    }

    #[test]
    fn discarded_samples_remove_the_transient() {
        let layout = test_layout(1, 2);
        let settings = SimSettings {
            amplitude: 0.0,
            noise: 0.0,
            ..SimSettings::default()
        };
        let mut sim = SimulatedMux::new(settings).unpaced();
        let raw = sim.read_block(&layout, &RUNNING).unwrap().unwrap();
        assert!(raw[[0, 0]] > 0.005);
        let out = demux(&layout, &raw).unwrap();
        assert!(out.iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn same_seed_same_data() {
        let layout = test_layout(2, 2);
        let mut a = SimulatedMux::new(SimSettings::default()).unpaced();
        let mut b = SimulatedMux::new(SimSettings::default()).unpaced();
        assert_eq!(
            a.read_block(&layout, &RUNNING).unwrap(),
            b.read_block(&layout, &RUNNING).unwrap()
        );
    }

    #[test]
    fn manual_source_runs_dry() {
        let layout = test_layout(1, 1);
        let mut src = ManualSource::new(vec![Array2::zeros((1, 20))]);
        assert!(src.read_block(&layout, &RUNNING).unwrap().is_some());
        assert!(src.read_block(&layout, &RUNNING).unwrap().is_none());
    }

    #[test]
    fn pacing_gives_up_when_stopped() {
        // FsxCh 100, 5 cycles per block: 50 ms per block.
        let layout = test_layout(1, 1);
        let mut sim = SimulatedMux::new(SimSettings::default());
        let stopped = AtomicBool::new(false);
        sim.read_block(&layout, &stopped).unwrap();
        let started = Instant::now();
        sim.read_block(&layout, &stopped).unwrap();
        assert!(started.elapsed() < Duration::from_millis(20));
    }
}
