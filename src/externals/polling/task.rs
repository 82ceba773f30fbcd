use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::{
    externals::{event_logging::AuditLog, telemetry::broadcaster::TelemetryBroadcaster},
    models::{audit_event::AuditEvent, sensor_key::SensorKey},
};

const CURRENT_MARKER: &str = "CUR=";

/// Who the pollers log for and how often.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollingEnvironment {
    pub username: String,
    pub refresh_interval: Duration,
}

/// Task: Runs periodically for one sensor. Samples the latest line, updates
/// the sensor's reading and records a periodic audit event.
/// Can be cancelled; stops within one refresh interval.
#[tracing::instrument(skip_all, fields(sensor = %key))]
pub async fn task_poll_sensor(
    token: CancellationToken,
    key: SensorKey,
    environment: PollingEnvironment,
    broadcaster: Arc<TelemetryBroadcaster>,
    audit: AuditLog,
) {
    info!("Started.");
    loop {
        business_logic(&token, &key, &environment, &broadcaster, &audit);

        tokio::select! {
            _ = token.cancelled() => {
                info!("Cancelled.");
                break;
            },
            _ = tokio::time::sleep(environment.refresh_interval) => {}
        };
    }
}

/// Perform one polling iteration.
fn business_logic(
    token: &CancellationToken,
    key: &SensorKey,
    environment: &PollingEnvironment,
    broadcaster: &TelemetryBroadcaster,
    audit: &AuditLog,
) {
    trace!("Executing business logic.");
    let latest = broadcaster.latest_line();
    let line = latest
        .as_ref()
        .and_then(|latest| select_line(latest.as_str(), key));

    if let Some(line) = line {
        match extract_current(line) {
            Some(value) => {
                debug!("Current reading: {}", value);
                broadcaster.update_reading(key, value);
            }
            None => trace!("No current reading in line."),
        }
    }

    // NOTE: Checked last so a disable that lands mid-iteration suppresses the event.
    if token.is_cancelled() {
        return;
    }
    audit.record(AuditEvent::periodic(&environment.username, key, line));
}

/// First line of `output` that starts with `key`, ignoring case.
pub fn select_line<'a>(output: &'a str, key: &SensorKey) -> Option<&'a str> {
    output
        .split('\n')
        .map(str::trim)
        .find(|line| key.is_prefix_of(line))
}

/// The number following the first `CUR=` in `line` that is followed by one,
/// e.g. `123.5` in `LOAD CUR=123.5 OTHER`.
pub fn extract_current(line: &str) -> Option<f32> {
    line.match_indices(CURRENT_MARKER)
        .find_map(|(index, _)| parse_leading_number(&line[index + CURRENT_MARKER.len()..]))
}

/// Parse `digits[.digits]` at the start of `text`.
fn parse_leading_number(text: &str) -> Option<f32> {
    let bytes = text.as_bytes();
    let integer = bytes.iter().take_while(|b| b.is_ascii_digit()).count();
    if integer == 0 {
        return None;
    }

    let mut end = integer;
    if bytes.get(integer) == Some(&b'.') {
        let fraction = bytes[integer + 1..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count();
        if fraction > 0 {
            end += 1 + fraction;
        }
    }
    text[..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> SensorKey {
        SensorKey::try_from(name).expect("Failed to create sensor key.")
    }

    #[test]
    fn test_select_line_matches_prefix_ignoring_case() {
        let output = "TEMP=21\nload CUR=5\nLOAD CUR=6";
        assert_eq!(select_line(output, &key("LOAD")), Some("load CUR=5"));
        assert_eq!(select_line(output, &key("TEMP")), Some("TEMP=21"));
        assert_eq!(select_line(output, &key("VOLT")), None);
    }

    #[test]
    fn test_extract_current() {
        assert_eq!(extract_current("LOAD CUR=123.5 OTHER"), Some(123.5));
        assert_eq!(extract_current("LOAD CUR=42"), Some(42.0));
        assert_eq!(extract_current("LOAD CUR=7. mA"), Some(7.0));
        assert_eq!(extract_current("LOAD NOCUR"), None);
        assert_eq!(extract_current("LOAD CUR=abc"), None);
        assert_eq!(extract_current("LOAD CUR=-3"), None);
        assert_eq!(extract_current("LOAD CUR=x CUR=9.25"), Some(9.25));
    }
}
