use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use log::{debug, error, info, warn};

use crate::drivers::demux::demux;
use crate::drivers::{AcqError, FanOut, MuxLayout, MuxSource};
use crate::types::{MuxBlock, SessionEvent};

/// Producer thread: reads raw blocks, demultiplexes them and publishes to the fan-out.
pub struct AcquisitionThread {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<u64>>,
}

impl AcquisitionThread {
    pub fn start(
        layout: MuxLayout,
        mut source: Box<dyn MuxSource>,
        mut fanout: FanOut,
        events: Sender<SessionEvent>,
    ) -> Result<Self, AcqError> {
        layout.validate()?;
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = thread::Builder::new()
            .name("acquisition".into())
            .spawn(move || {
                info!(
                    "acquisition started: {} rows x {} columns, Fs {:.1} Hz, FsxCh {:.1} Hz, {} consumers",
                    layout.n_rows(),
                    layout.n_columns(),
                    layout.fs(),
                    layout.fs_x_ch,
                    fanout.len()
                );
                if fanout.is_empty() {
                    warn!("no consumers subscribed, blocks are produced for nobody");
                }
                let dt = 1.0 / layout.fs_x_ch;
                let mut seq = 0u64;
                while flag.load(Ordering::Acquire) {
                    let raw = match source.read_block(&layout, &flag) {
                        Ok(Some(raw)) => raw,
                        Ok(None) => {
                            info!("source exhausted after {seq} blocks");
                            events
                                .send(SessionEvent::AcquisitionFinished { blocks: seq })
                                .ok();
                            break;
                        }
                        Err(e) => {
                            error!("acquisition read failed: {e}");
                            events.send(SessionEvent::Error(e.to_string())).ok();
                            break;
                        }
                    };
                    // A stop request during a blocking read discards that block.
                    if !flag.load(Ordering::Acquire) {
                        break;
                    }
                    let out = match demux(&layout, &raw) {
                        Ok(out) => out,
                        Err(e) => {
                            error!("demux failed: {e}");
                            events.send(SessionEvent::Error(e.to_string())).ok();
                            break;
                        }
                    };
                    let at = Instant::now();
                    let block = Arc::new(MuxBlock {
                        seq,
                        t0: (seq * layout.n_blocks as u64) as f64 * dt,
                        raw,
                        out,
                    });
                    fanout.publish(&block);
                    events.send(SessionEvent::NewBlock { at }).ok();
                    debug!("block {seq} published");
                    seq += 1;
                }
                flag.store(false, Ordering::Release);
                info!("acquisition stopped after {seq} blocks");
                seq
            })?;
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }
    /// Ask the producer to stop and wait for it. Returns the number of blocks produced.
    pub fn stop(&mut self) -> Result<u64, AcqError> {
        self.running.store(false, Ordering::Release);
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| AcqError::WorkerPanicked("acquisition".into())),
            None => Ok(0),
        }
    }
}

impl Drop for AcquisitionThread {
    fn drop(&mut self) {
        self.stop().ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::demux::test_layout;
    use crate::drivers::{ManualSource, SimSettings, SimulatedMux};
    use ndarray::Array2;
    use std::sync::mpsc::channel;
    use std::time::Duration;

    #[test]
    fn publishes_every_block_then_disconnects() {
        let layout = test_layout(2, 2);
        let blocks: Vec<_> = (0..3)
            .map(|_| Array2::<f32>::ones((2, layout.raw_block_len())))
            .collect();
        let mut fanout = FanOut::new();
        let (rx, stats) = fanout.subscribe("test", 8);
        let (tx, events) = channel();
        let mut acq =
            AcquisitionThread::start(layout, Box::new(ManualSource::new(blocks)), fanout, tx)
                .unwrap();
        let received: Vec<_> = rx.iter().collect();
        assert_eq!(received.len(), 3);
        assert_eq!(received[2].seq, 2);
        assert!((received[1].t0 - 0.05).abs() < 1e-12);
        assert_eq!(received[0].out.dim(), (4, 5));
        assert_eq!(stats.delivered(), 3);
        assert_eq!(acq.stop().unwrap(), 3);
        let events: Vec<_> = events.try_iter().collect();
        assert!(matches!(
            events.last(),
            Some(SessionEvent::AcquisitionFinished { blocks: 3 })
        ));
    }

    #[test]
    fn stop_ends_an_endless_source() {
        let layout = test_layout(1, 1);
        let mut fanout = FanOut::new();
        let (rx, _) = fanout.subscribe("test", 2);
        let (tx, _events) = channel();
        let source = SimulatedMux::new(SimSettings::default());
        let mut acq = AcquisitionThread::start(layout, Box::new(source), fanout, tx).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        acq.stop().unwrap();
        // Second stop is a no-op.
        assert_eq!(acq.stop().unwrap(), 0);
    }

    #[test]
    fn bad_block_reports_error() {
        let layout = test_layout(2, 2);
        let (tx, events) = channel();
        let source = ManualSource::new(vec![Array2::<f32>::zeros((1, 3))]);
        let mut acq =
            AcquisitionThread::start(layout, Box::new(source), FanOut::new(), tx).unwrap();
        let mut saw_error = false;
        while let Ok(ev) = events.recv_timeout(Duration::from_secs(2)) {
            if let SessionEvent::Error(_) = ev {
                saw_error = true;
                break;
            }
        }
        assert!(saw_error);
        assert_eq!(acq.stop().unwrap(), 0);
    }

    #[test]
    fn invalid_layout_is_refused() {
        let mut layout = test_layout(1, 1);
        layout.rows.clear();
        let (tx, _) = channel();
        assert!(AcquisitionThread::start(
            layout,
            Box::new(ManualSource::new(Vec::new())),
            FanOut::new(),
            tx
        )
        .is_err());
    }

    #[test]
    fn stop_does_not_wait_for_a_long_block() {
        // 10 Hz per channel, 50 cycles: five seconds per block.
        let mut layout = test_layout(1, 1);
        layout.fs_x_ch = 10.0;
        layout.n_blocks = 50;
        let (tx, _events) = channel();
        let source = SimulatedMux::new(SimSettings::default());
        let mut acq =
            AcquisitionThread::start(layout, Box::new(source), FanOut::new(), tx).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        assert_eq!(acq.stop().unwrap(), 0);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
