//! Best-effort progress channel between a strategy and its worker.

use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::mpsc;

/// Highest value a strategy may report. The worker sets 100 on success.
pub const MAX_REPORTED_PROGRESS: u8 = 95;

/// Sends integer progress ticks. Non-decreasing, capped at
/// [`MAX_REPORTED_PROGRESS`]; ticks are dropped when the consumer lags.
#[derive(Debug)]
pub struct ProgressReporter {
    tx: mpsc::Sender<u8>,
    last: AtomicU8,
}

impl ProgressReporter {
    pub fn new(tx: mpsc::Sender<u8>) -> Self {
        Self {
            tx,
            last: AtomicU8::new(0),
        }
    }

    /// Create a reporter and the receiving end of its channel.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<u8>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::new(tx), rx)
    }

    /// Report progress as a percentage. Lower or repeated values are ignored.
    pub fn report(&self, percent: u8) {
        let percent = percent.min(MAX_REPORTED_PROGRESS);
        let previous = self.last.fetch_max(percent, Ordering::Relaxed);
        if percent <= previous {
            return;
        }
        if self.tx.try_send(percent).is_err() {
            tracing::trace!(percent, "Progress tick dropped");
        }
    }

    /// Report `done / total` scaled into `[start, end]`.
    pub fn report_fraction(&self, done: u64, total: u64, start: u8, end: u8) {
        let total = total.max(1);
        let span = u64::from(end.saturating_sub(start));
        let scaled = start as u64 + span * done.min(total) / total;
        self.report(scaled.min(u64::from(u8::MAX)) as u8);
    }

    /// Last value accepted by [`report`](Self::report).
    pub fn last(&self) -> u8 {
        self.last.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_are_monotonic_and_capped() {
        let (reporter, mut rx) = ProgressReporter::channel(16);
        reporter.report(10);
        reporter.report(5);
        reporter.report(10);
        reporter.report(40);
        reporter.report(100);

        let mut seen = Vec::new();
        while let Ok(p) = rx.try_recv() {
            seen.push(p);
        }
        assert_eq!(seen, vec![10, 40, 95]);
        assert_eq!(reporter.last(), 95);
    }

    #[test]
    fn slow_consumer_misses_ticks() {
        let (reporter, mut rx) = ProgressReporter::channel(1);
        reporter.report(1);
        reporter.report(2);
        reporter.report(3);
        assert_eq!(rx.try_recv().unwrap(), 1);
        assert!(rx.try_recv().is_err());
        assert_eq!(reporter.last(), 3);
    }

    #[test]
    fn fraction_is_scaled_into_range() {
        let (reporter, mut rx) = ProgressReporter::channel(4);
        reporter.report_fraction(1, 2, 0, 80);
        assert_eq!(rx.try_recv().unwrap(), 40);
        reporter.report_fraction(10, 10, 80, 95);
        assert_eq!(rx.try_recv().unwrap(), 95);
    }
}
