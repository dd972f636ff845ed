// metrics.rs - Prometheus counters for the transport
// Numan Thabit 2025
use prometheus::{IntCounter, IntGauge, Registry};
use thiserror::Error;

/// Failure while setting up or registering transport metrics.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metric registration failed: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// Constructs a counter and hands a handle to the registry.
fn new_counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, MetricsError> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn new_gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, MetricsError> {
    let gauge = IntGauge::new(name, help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    pub packets_dropped_short: IntCounter,
    pub bad_packets_reported: IntCounter,
    pub bad_packets_suppressed: IntCounter,
    pub challenges_issued: IntCounter,
    pub challenges_rejected: IntCounter,
    pub connections_accepted: IntCounter,
    pub connections_rejected_duplicate: IntCounter,
    pub connect_ok_sent: IntCounter,
    pub data_packets_sent: IntCounter,
    pub data_packets_received: IntCounter,
    pub decrypt_failures: IntCounter,
    pub duplicate_packets_dropped: IntCounter,
    pub no_connection_sent: IntCounter,
    pub connection_closed_sent: IntCounter,
    pub live_connections: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new_custom(Some("numilink".into()), None)?;
        Ok(Self {
            packets_dropped_short: new_counter(
                &registry,
                "packets_dropped_short",
                "Inbound packets below the minimum size",
            )?,
            bad_packets_reported: new_counter(
                &registry,
                "bad_packets_reported",
                "Bad packets that were logged",
            )?,
            bad_packets_suppressed: new_counter(
                &registry,
                "bad_packets_suppressed",
                "Bad packets suppressed by the report rate limiter",
            )?,
            challenges_issued: new_counter(
                &registry,
                "challenges_issued",
                "Challenge replies sent to clients",
            )?,
            challenges_rejected: new_counter(
                &registry,
                "challenges_rejected",
                "Connect requests with stale or wrong challenges",
            )?,
            connections_accepted: new_counter(
                &registry,
                "connections_accepted",
                "Connections created from verified connect requests",
            )?,
            connections_rejected_duplicate: new_counter(
                &registry,
                "connections_rejected_duplicate",
                "Connect requests rejected for an existing remote key",
            )?,
            connect_ok_sent: new_counter(&registry, "connect_ok_sent", "ConnectOK messages sent")?,
            data_packets_sent: new_counter(&registry, "data_packets_sent", "Data packets sent")?,
            data_packets_received: new_counter(
                &registry,
                "data_packets_received",
                "Data packets processed",
            )?,
            decrypt_failures: new_counter(
                &registry,
                "decrypt_failures",
                "Data packets that failed to decrypt",
            )?,
            duplicate_packets_dropped: new_counter(
                &registry,
                "duplicate_packets_dropped",
                "Data packets dropped as duplicate or stale",
            )?,
            no_connection_sent: new_counter(
                &registry,
                "no_connection_sent",
                "NoConnection replies sent",
            )?,
            connection_closed_sent: new_counter(
                &registry,
                "connection_closed_sent",
                "ConnectionClosed messages sent",
            )?,
            live_connections: new_gauge(
                &registry,
                "live_connections",
                "Connections currently alive",
            )?,
            registry,
        })
    }

    /// Access to the backing registry for scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
