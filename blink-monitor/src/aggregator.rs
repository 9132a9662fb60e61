//! Periodic sampling of the blink counter into the metric window.

use std::time::Duration;

use tracing::{debug, trace};

use crate::counter::BlinkCounterReader;
use crate::window::{MetricSample, WindowWriter};
use crate::worker::sleep_while_alive;

pub struct MetricAggregator {
    counter: BlinkCounterReader,
    window: WindowWriter,
    interval: Duration,
}

impl MetricAggregator {
    pub fn new(counter: BlinkCounterReader, window: WindowWriter, interval: Duration) -> Self {
        Self {
            counter,
            window,
            interval,
        }
    }

    /// Record the current counter value with timestamp `timestamp`.
    pub fn tick_at(&mut self, timestamp: i64) -> MetricSample {
        let sample = MetricSample {
            timestamp,
            value: self.counter.get(),
        };
        let evicted = self.window.push(sample);
        trace!("sampled {sample:?}, evicted {evicted:?}");
        sample
    }

    /// Record the current counter value with the current time.
    pub fn tick(&mut self) -> MetricSample {
        self.tick_at(chrono::Utc::now().timestamp())
    }

    /// Tick once per interval until `flag` is stopped. The first sample is
    /// taken one interval after starting.
    pub fn run(mut self, flag: &thread_control::Flag) -> u64 {
        let mut n_ticks = 0;
        while sleep_while_alive(flag, self.interval) {
            self.tick();
            n_ticks += 1;
        }
        debug!("aggregator done after {n_ticks} samples");
        n_ticks
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;
    use crate::counter::BlinkCounter;
    use crate::window::MetricWindow;

    #[test]
    fn samples_counter_newest_first() {
        let counter = BlinkCounter::new();
        let mut writer = counter.claim_writer().unwrap();
        let window = MetricWindow::new(NonZeroUsize::new(3).unwrap(), 100);
        let reader = window.reader();
        let mut aggregator = MetricAggregator::new(
            counter.reader(),
            window.claim_writer().unwrap(),
            Duration::from_secs(1),
        );
        aggregator.tick_at(101);
        writer.add(2);
        aggregator.tick_at(102);
        writer.add(1);
        let newest = aggregator.tick_at(103);
        assert_eq!(
            newest,
            MetricSample {
                timestamp: 103,
                value: 3
            }
        );
        let values: Vec<(i64, u64)> = reader
            .snapshot()
            .iter()
            .map(|s| (s.timestamp, s.value))
            .collect();
        assert_eq!(values, vec![(103, 3), (102, 2), (101, 0)]);
    }

    #[test]
    fn run_ticks_until_stopped() {
        let counter = BlinkCounter::new();
        let window = MetricWindow::new(NonZeroUsize::new(10).unwrap(), 0);
        let reader = window.reader();
        let aggregator = MetricAggregator::new(
            counter.reader(),
            window.claim_writer().unwrap(),
            Duration::from_millis(10),
        );
        let (flag, control) = thread_control::make_pair();
        let join = std::thread::spawn(move || aggregator.run(&flag));
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while reader.newest().timestamp == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        control.stop();
        let n_ticks = join.join().unwrap();
        assert!(n_ticks >= 1);
        assert_eq!(reader.len(), 10);
        assert!(reader.newest().timestamp > 0);
    }
}
