use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;

use log::{debug, warn};

use crate::types::MuxBlock;

/// Delivery counters of one consumer, shared with whoever wants to display them.
#[derive(Debug, Default)]
pub struct SubscriberStats {
    pub delivered: AtomicU64,
    pub dropped: AtomicU64,
}

impl SubscriberStats {
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct Subscriber {
    name: String,
    tx: SyncSender<Arc<MuxBlock>>,
    stats: Arc<SubscriberStats>,
}

/// Hands every block to all consumers without ever waiting on one of them.
#[derive(Default)]
pub struct FanOut {
    subscribers: Vec<Subscriber>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }
    /// Register a consumer with a queue of `capacity` blocks.
    pub fn subscribe(
        &mut self,
        name: &str,
        capacity: usize,
    ) -> (Receiver<Arc<MuxBlock>>, Arc<SubscriberStats>) {
        let (tx, rx) = sync_channel(capacity.max(1));
        let stats = Arc::new(SubscriberStats::default());
        self.subscribers.push(Subscriber {
            name: name.to_owned(),
            tx,
            stats: stats.clone(),
        });
        (rx, stats)
    }
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
    pub fn publish(&mut self, block: &Arc<MuxBlock>) {
        self.subscribers.retain(|sub| match sub.tx.try_send(block.clone()) {
            Ok(()) => {
                sub.stats.delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                let dropped = sub.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 100 == 0 {
                    warn!(
                        "{} queue full, dropped block {} ({} dropped so far)",
                        sub.name, block.seq, dropped
                    );
                }
                true
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("{} went away, unsubscribing", sub.name);
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn block(seq: u64) -> Arc<MuxBlock> {
        Arc::new(MuxBlock {
            seq,
            t0: 0.0,
            raw: Array2::zeros((1, 4)),
            out: Array2::zeros((1, 1)),
        })
    }

    #[test]
    fn full_consumer_drops_without_affecting_others() {
        let mut fanout = FanOut::new();
        let (slow_rx, slow_stats) = fanout.subscribe("slow", 1);
        let (fast_rx, fast_stats) = fanout.subscribe("fast", 16);
        for seq in 0..5 {
            fanout.publish(&block(seq));
        }
        assert_eq!(slow_stats.delivered(), 1);
        assert_eq!(slow_stats.dropped(), 4);
        assert_eq!(fast_stats.delivered(), 5);
        assert_eq!(fast_stats.dropped(), 0);
        assert_eq!(slow_rx.try_recv().unwrap().seq, 0);
        let seqs: Vec<u64> = fast_rx.try_iter().map(|b| b.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn blocks_are_shared_not_copied() {
        let mut fanout = FanOut::new();
        let (a, _) = fanout.subscribe("a", 4);
        let (b, _) = fanout.subscribe("b", 4);
        fanout.publish(&block(7));
        assert!(Arc::ptr_eq(&a.recv().unwrap(), &b.recv().unwrap()));
    }

    #[test]
    fn disconnected_consumers_are_removed() {
        let mut fanout = FanOut::new();
        let (rx, _) = fanout.subscribe("gone", 4);
        let (_keep, _) = fanout.subscribe("kept", 4);
        drop(rx);
        fanout.publish(&block(0));
        assert_eq!(fanout.len(), 1);
    }
}
