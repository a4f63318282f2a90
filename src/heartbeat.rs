//! Heartbeat cycle of a server connection.
//!
//! Each cycle sends a heartbeat on behalf of every heartbeat-enabled client,
//! waits for all of them to settle, records the outcomes and announces a
//! change of the aggregate status. The next cycle starts one period after the
//! previous one settled, where the period is never shorter than the command
//! timeout. Failures never stop the cycle; only disposal does.

use crate::message::MosMessage;
use crate::server_connection::NcsServerConnection;
use futures::future::join_all;

/// Start the heartbeat task for `connection`.
///
/// The task holds only a weak reference between cycles, so it ends once the
/// connection is disposed or dropped.
pub(crate) fn spawn(connection: &NcsServerConnection) {
    let weak = connection.downgrade();
    let period = connection.heartbeat_period();
    let cancel = connection.cancel_token().child_token();
    let id = connection.id().to_string();

    tokio::spawn(async move {
        tracing::debug!(connection = %id, "Heartbeats every {} ms", period.as_millis());
        loop {
            let Some(connection) = NcsServerConnection::upgrade(&weak) else {
                break;
            };
            if connection.is_disposed() {
                break;
            }
            run_cycle(&connection).await;
            drop(connection);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
        }
        tracing::debug!(connection = %id, "Heartbeats stopped");
    });
}

/// Run one heartbeat cycle.
pub(crate) async fn run_cycle(connection: &NcsServerConnection) {
    let targets = connection.heartbeat_targets().await;
    let probes = targets.into_iter().map(|(handle, port)| async move {
        let outcome = connection.execute_command(MosMessage::heartbeat(port)).await;
        (handle, port, outcome)
    });
    let outcomes = join_all(probes).await;

    if connection.is_disposed() {
        return;
    }
    connection.record_heartbeats(outcomes).await;
    connection.announce_status().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionOptions;
    use crate::error::MosError;
    use crate::message::PortType;
    use crate::server_connection::ConnectionEvent;
    use std::time::Duration;
    use tokio::time::Instant;

    async fn next_heartbeat_error(
        events: &mut tokio::sync::broadcast::Receiver<ConnectionEvent>,
    ) -> Instant {
        loop {
            if let Ok(ConnectionEvent::Error(error)) = events.recv().await {
                if let MosError::Heartbeat { port, source } = error.as_ref() {
                    assert_eq!(*port, PortType::Lower);
                    assert!(source.is_timeout());
                    return Instant::now();
                }
            }
        }
    }

    fn assert_about(elapsed: Duration, millis: u64) {
        let expected = Duration::from_millis(millis);
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(10),
            "expected ~{millis} ms, got {elapsed:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_period_clamps_to_command_timeout_and_survives_failures() {
        let options = ConnectionOptions::default()
            .with_command_timeout(Duration::from_millis(3000))
            .with_heartbeat_interval(Duration::from_millis(1000));
        let conn = NcsServerConnection::new("ncs", "127.0.0.1", "mos", options).unwrap();
        assert_eq!(conn.heartbeat_period(), Duration::from_millis(3000));
        conn.create_client("lower", 10540, PortType::Lower, true).await.unwrap();
        let mut events = conn.subscribe();

        // The client never connects, so every heartbeat times out.
        let started = Instant::now();
        spawn(&conn);

        let first = next_heartbeat_error(&mut events).await;
        let second = next_heartbeat_error(&mut events).await;
        let third = next_heartbeat_error(&mut events).await;

        assert_about(first - started, 3000);
        // Timeout plus the clamped period, not timeout plus the configured interval.
        assert_about(second - first, 6000);
        assert_about(third - second, 6000);

        conn.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_records_failure_per_client() {
        let options = ConnectionOptions::default().with_command_timeout(Duration::from_millis(1000));
        let conn = NcsServerConnection::new("ncs", "127.0.0.1", "mos", options).unwrap();
        conn.create_client("lower", 10540, PortType::Lower, true).await.unwrap();
        conn.create_client("upper", 10541, PortType::Upper, false).await.unwrap();
        let mut events = conn.subscribe();

        let targets = conn.heartbeat_targets().await;
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].1, PortType::Lower);

        run_cycle(&conn).await;

        // Only the heartbeat-enabled client is probed.
        next_heartbeat_error(&mut events).await;
        assert!(events.try_recv().is_err());
        // Not connected yet, so the status reads as such regardless of heartbeats.
        assert_eq!(conn.get_connected_status().await.status, "Not connected");
        conn.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_cycle_after_dispose() {
        let conn = NcsServerConnection::new("ncs", "127.0.0.1", "mos", ConnectionOptions::default()).unwrap();
        conn.create_client("lower", 10540, PortType::Lower, true).await.unwrap();
        let mut events = conn.subscribe();

        spawn(&conn);
        conn.dispose().await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(matches!(events.recv().await, Ok(ConnectionEvent::ConnectionChanged)));
        assert!(events.try_recv().is_err());
    }
}
