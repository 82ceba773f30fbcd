use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_stream::{wrappers::WatchStream, Stream, StreamExt};
use tracing::trace;

use crate::models::{raw_line::RawLine, sensor_key::SensorKey};

/// Last-value-wins store for telemetry.
///
/// Holds the most recent full line from the device and the most recent
/// numeric reading per sensor. Nothing is queued: a reader that is slower
/// than the device only ever sees the newest value. Publishing never blocks.
pub struct TelemetryBroadcaster {
    latest_line: watch::Sender<Option<RawLine>>,
    // NOTE: One channel per key so updates to different keys never contend
    // beyond the short map lookup.
    readings: Mutex<HashMap<SensorKey, watch::Sender<Option<f32>>>>,
}

impl Default for TelemetryBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryBroadcaster {
    pub fn new() -> Self {
        let (latest_line, _) = watch::channel(None);
        Self {
            latest_line,
            readings: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the latest line. Never blocks and never fails.
    pub fn publish(&self, line: RawLine) {
        trace!("Publishing line: {}", line);
        self.latest_line.send_replace(Some(line));
    }

    pub fn latest_line(&self) -> Option<RawLine> {
        self.latest_line.borrow().clone()
    }

    /// Live view that is marked changed whenever a new line is published.
    pub fn subscribe_latest_line(&self) -> watch::Receiver<Option<RawLine>> {
        self.latest_line.subscribe()
    }

    /// Lines published from now on, as a stream. Intermediate lines may be
    /// skipped if the consumer falls behind.
    pub fn latest_lines(&self) -> impl Stream<Item = RawLine> + Unpin {
        WatchStream::from_changes(self.latest_line.subscribe()).filter_map(|line| line)
    }

    /// Store the newest reading for `key`.
    pub fn update_reading(&self, key: &SensorKey, value: f32) {
        let mut readings = self.readings.lock();
        match readings.get(key) {
            Some(sender) => {
                sender.send_replace(Some(value));
            }
            None => {
                let (sender, _) = watch::channel(Some(value));
                readings.insert(key.clone(), sender);
            }
        }
    }

    pub fn latest_reading(&self, key: &SensorKey) -> Option<f32> {
        self.readings
            .lock()
            .get(key)
            .and_then(|sender| *sender.borrow())
    }

    /// Live view of the reading for `key`. Works before the first reading arrives.
    pub fn subscribe_reading(&self, key: &SensorKey) -> watch::Receiver<Option<f32>> {
        self.readings
            .lock()
            .entry(key.clone())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    /// Snapshot of every known reading.
    pub fn readings(&self) -> HashMap<SensorKey, f32> {
        self.readings
            .lock()
            .iter()
            .filter_map(|(key, sender)| (*sender.borrow()).map(|value| (key.clone(), value)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn line(text: &str) -> RawLine {
        RawLine::new(text).expect("Failed to create line.")
    }

    fn key(name: &str) -> SensorKey {
        SensorKey::try_from(name).expect("Failed to create sensor key.")
    }

    #[test]
    fn test_last_value_wins() {
        let broadcaster = TelemetryBroadcaster::new();
        assert_eq!(broadcaster.latest_line(), None);

        broadcaster.publish(line("TEMP=1"));
        broadcaster.publish(line("TEMP=2"));
        assert_eq!(broadcaster.latest_line(), Some(line("TEMP=2")));
    }

    #[tokio::test]
    async fn test_subscriber_sees_newest_line() {
        let broadcaster = TelemetryBroadcaster::new();
        let mut receiver = broadcaster.subscribe_latest_line();

        broadcaster.publish(line("LOAD=1"));
        broadcaster.publish(line("LOAD=2"));

        receiver.changed().await.expect("Broadcaster dropped.");
        assert_eq!(*receiver.borrow_and_update(), Some(line("LOAD=2")));
        assert!(!receiver.has_changed().expect("Broadcaster dropped."));
    }

    #[tokio::test]
    async fn test_line_stream_yields_new_lines() {
        let broadcaster = TelemetryBroadcaster::new();
        broadcaster.publish(line("OLD"));
        let mut lines = broadcaster.latest_lines();

        broadcaster.publish(line("VOLT=12"));
        let next = tokio::time::timeout(Duration::from_secs(1), lines.next())
            .await
            .expect("Timed out waiting for line.");
        assert_eq!(next, Some(line("VOLT=12")));
    }

    #[test]
    fn test_readings_are_kept_per_key() {
        let broadcaster = TelemetryBroadcaster::new();
        let temp = key("TEMP");
        let load = key("LOAD");

        let receiver = broadcaster.subscribe_reading(&temp);
        assert_eq!(*receiver.borrow(), None);
        assert_eq!(broadcaster.latest_reading(&temp), None);

        broadcaster.update_reading(&temp, 21.5);
        broadcaster.update_reading(&load, 3.0);
        broadcaster.update_reading(&temp, 22.0);

        assert_eq!(*receiver.borrow(), Some(22.0));
        assert_eq!(broadcaster.latest_reading(&temp), Some(22.0));
        assert_eq!(broadcaster.latest_reading(&load), Some(3.0));
        assert_eq!(broadcaster.readings().len(), 2);
    }

    #[test]
    fn test_untouched_subscriptions_are_not_readings() {
        let broadcaster = TelemetryBroadcaster::new();
        let _receiver = broadcaster.subscribe_reading(&key("ROT"));
        assert!(broadcaster.readings().is_empty());
    }
}
