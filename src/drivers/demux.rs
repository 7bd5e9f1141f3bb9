use std::time::Duration;

use ndarray::Array2;

use crate::drivers::AcqError;

/// Geometry and timing of a time-multiplexed acquisition.
#[derive(Clone, Debug, PartialEq)]
pub struct MuxLayout {
    /// Output rate per channel (Hz).
    pub fs_x_ch: f64,
    /// Raw samples per column slot.
    pub n_samps_co: usize,
    /// Leading samples of every slot dropped while the switch settles.
    pub n_discard: usize,
    /// Full column sweeps per block.
    pub n_blocks: usize,
    pub rows: Vec<String>,
    pub columns: Vec<String>,
}

impl MuxLayout {
    pub fn validate(&self) -> Result<(), AcqError> {
        if !(self.fs_x_ch.is_finite() && self.fs_x_ch > 0.0) {
            return Err(AcqError::InvalidSampleRate);
        }
        if self.rows.is_empty() {
            return Err(AcqError::InvalidLayout("no rows enabled".into()));
        }
        if self.columns.is_empty() {
            return Err(AcqError::InvalidLayout("no columns enabled".into()));
        }
        if self.n_samps_co == 0 {
            return Err(AcqError::InvalidLayout("nSampsCo must be at least 1".into()));
        }
        if self.n_discard >= self.n_samps_co {
            return Err(AcqError::InvalidLayout(format!(
                "nDiscard ({}) must be smaller than nSampsCo ({})",
                self.n_discard, self.n_samps_co
            )));
        }
        if self.n_blocks == 0 {
            return Err(AcqError::InvalidLayout("nBlocks must be at least 1".into()));
        }
        Ok(())
    }
    /// Raw per-row ADC rate.
    pub fn fs(&self) -> f64 {
        self.fs_x_ch * (self.n_samps_co * self.n_columns()) as f64
    }
    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }
    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }
    pub fn n_channels(&self) -> usize {
        self.n_rows() * self.n_columns()
    }
    pub fn raw_block_len(&self) -> usize {
        self.n_blocks * self.n_columns() * self.n_samps_co
    }
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs_f64(self.n_blocks as f64 / self.fs_x_ch)
    }
    /// Output channel names, row-major (`Ch01Col01`, `Ch01Col02`, ...).
    pub fn channel_names(&self) -> Vec<String> {
        self.rows
            .iter()
            .flat_map(|r| self.columns.iter().map(move |c| format!("{r}{c}")))
            .collect()
    }
}

/// Average every column slot of `raw` (rows x raw samples) into one output
/// sample per channel. Output channel `r * n_columns + c` holds (row r, column c).
pub fn demux(layout: &MuxLayout, raw: &Array2<f32>) -> Result<Array2<f32>, AcqError> {
    let expected = (layout.n_rows(), layout.raw_block_len());
    if raw.dim() != expected {
        return Err(AcqError::BlockShape {
            expected,
            actual: raw.dim(),
        });
    }
    let n_cols = layout.n_columns();
    let nsc = layout.n_samps_co;
    let kept = (nsc - layout.n_discard) as f32;
    let mut out = Array2::<f32>::zeros((layout.n_channels(), layout.n_blocks));
    for (r, row) in raw.outer_iter().enumerate() {
        for k in 0..layout.n_blocks {
            let cycle_start = k * n_cols * nsc;
            for c in 0..n_cols {
                let slot = cycle_start + c * nsc;
                let sum: f32 = (slot + layout.n_discard..slot + nsc).map(|i| row[i]).sum();
                out[[r * n_cols + c, k]] = sum / kept;
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) fn test_layout(n_rows: usize, n_cols: usize) -> MuxLayout {
    MuxLayout {
        fs_x_ch: 100.0,
        n_samps_co: 4,
        n_discard: 1,
        n_blocks: 5,
        rows: (1..=n_rows).map(|i| format!("Ch{i:02}")).collect(),
        columns: (1..=n_cols).map(|i| format!("Col{i:02}")).collect(),
    }
}
