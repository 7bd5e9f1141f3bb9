// src/types.rs
use ndarray::Array2;
use std::time::Instant;

/// One acquired block, shared by every consumer through an `Arc`.
#[derive(Debug)]
pub struct MuxBlock {
    pub seq: u64,
    /// Session time of the first output sample, in seconds.
    pub t0: f64,
    /// Raw rows x raw samples, sampled at `Fs`.
    pub raw: Array2<f32>,
    /// Demultiplexed channels x samples, sampled at `FsxCh`.
    pub out: Array2<f32>,
}

impl MuxBlock {
    pub fn n_channels(&self) -> usize {
        self.out.nrows()
    }
}

// Which half of a block a consumer looks at.
#[derive(PartialEq, Clone, Copy, Debug)]
pub enum BlockPart {
    Processed,
    Raw,
}

impl BlockPart {
    pub fn select<'a>(&self, block: &'a MuxBlock) -> &'a Array2<f32> {
        match self {
            BlockPart::Processed => &block.out,
            BlockPart::Raw => &block.raw,
        }
    }
}

// Workers -> session
#[derive(Clone, Debug)]
pub enum SessionEvent {
    NewBlock { at: Instant },
    AcquisitionFinished { blocks: u64 },
    Error(String),
}
