//! Timing streams.
//!
//! `Ticker`: periodic wake-ups with optional jitter. The poller and the
//! finalizer run off one of these; jitter keeps a fleet of workers from
//! hitting the database in lockstep.

use futures::Stream;
use pin_project_lite::pin_project;
use rand::Rng;

pin_project! {
    /// Fixed-period pulse to drive polling, renewal or finalization.
    ///
    /// We reset on ready to reduce drift when consumers stall briefly.
    pub struct Ticker {
        #[pin]
        inner: futures_timer::Delay,
        period: std::time::Duration,
        jitter: std::time::Duration,
    }
}

impl Ticker {
    pub fn new(period: std::time::Duration) -> Self {
        Self {
            inner: futures_timer::Delay::new(period),
            period,
            jitter: std::time::Duration::ZERO,
        }
    }

    /// Add up to `jitter` of random extra delay to every period.
    pub fn with_jitter(period: std::time::Duration, jitter: std::time::Duration) -> Self {
        Self {
            inner: futures_timer::Delay::new(period),
            period,
            jitter,
        }
    }

    fn next_period(period: std::time::Duration, jitter: std::time::Duration) -> std::time::Duration {
        if jitter.is_zero() {
            return period;
        }
        let extra = rand::thread_rng().gen_range(0..=jitter.as_millis() as u64);
        period + std::time::Duration::from_millis(extra)
    }
}

impl Stream for Ticker {
    type Item = ();

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let mut this = self.project();
        let poll = this.inner.as_mut().poll(cx);
        if poll.is_ready() {
            this.inner.reset(Self::next_period(*this.period, *this.jitter));
        }
        poll.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn ticker_fires_repeatedly() {
        let ticker = Ticker::new(std::time::Duration::from_millis(1));
        futures::pin_mut!(ticker);
        for _ in 0..3 {
            assert_eq!(ticker.next().await, Some(()));
        }
    }

    #[test]
    fn jittered_period_stays_in_bounds() {
        let period = std::time::Duration::from_millis(100);
        let jitter = std::time::Duration::from_millis(20);
        for _ in 0..100 {
            let next = Ticker::next_period(period, jitter);
            assert!(next >= period && next <= period + jitter);
        }
    }
}
