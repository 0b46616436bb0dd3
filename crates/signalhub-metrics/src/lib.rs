//! Prometheus metric groups for a signalhub [`Node`](../signalhub_core/struct.Node.html).
//!
//! Grounded on the shape of `spacetimedb-core`'s `WORKER_METRICS`/`DB_METRICS`
//! statics: one `Lazy<...>` struct per concern, `IntGauge`/`IntCounter`/
//! `HistogramVec` fields registered into a private [`prometheus::Registry`]
//! rather than the process-wide default registry, so a process can host more
//! than one `Node` without metric name collisions.
//!
//! The exporter (the HTTP `/metrics` endpoint) is out of scope per spec §1;
//! this crate only owns the counters themselves and a way to gather them.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};

/// Per-node counters for the hub, session layer, and writers.
///
/// Construct one per [`Node`](../signalhub_core/struct.Node.html) (not a
/// process-wide global) via [`NodeMetrics::new`], since a process may host
/// several nodes in tests.
pub struct NodeMetrics {
    registry: Registry,

    pub connected_clients: IntGauge,
    pub sessions_spawned_total: IntCounter,
    pub sessions_closed_total: IntCounter,
    pub sessions_aborted_total: IntCounter,

    pub commands_received_total: IntCounter,
    pub command_errors_total: IntCounter,

    pub publications_total: IntCounter,
    pub publications_dropped_total: IntCounter,

    pub websocket_request_bytes: Histogram,

    pub write_queue_bytes: IntGauge,
    pub slow_consumer_disconnects_total: IntCounter,

    pub channels_active: IntGauge,
    pub subscriptions_active: IntGauge,

    pub presence_entries: IntGauge,
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        macro_rules! register {
            ($ctor:ident, $name:literal, $help:literal) => {{
                let m = $ctor(Opts::new($name, $help)).expect("metric registration");
                registry.register(Box::new(m.clone())).expect("metric already registered");
                m
            }};
        }

        fn new_int_gauge(opts: Opts) -> prometheus::Result<IntGauge> {
            IntGauge::with_opts(opts)
        }
        fn new_int_counter(opts: Opts) -> prometheus::Result<IntCounter> {
            IntCounter::with_opts(opts)
        }

        let websocket_request_bytes = Histogram::with_opts(
            HistogramOpts::new(
                "signalhub_websocket_request_bytes",
                "Size in bytes of decoded client command frames",
            )
            .buckets(vec![32.0, 128.0, 512.0, 2048.0, 8192.0, 32768.0, 131072.0]),
        )
        .expect("metric registration");
        registry
            .register(Box::new(websocket_request_bytes.clone()))
            .expect("metric already registered");

        Self {
            connected_clients: register!(
                new_int_gauge,
                "signalhub_connected_clients",
                "Number of currently connected client sessions"
            ),
            sessions_spawned_total: register!(
                new_int_counter,
                "signalhub_sessions_spawned_total",
                "Cumulative number of client sessions spawned"
            ),
            sessions_closed_total: register!(
                new_int_counter,
                "signalhub_sessions_closed_total",
                "Cumulative number of client sessions closed cleanly"
            ),
            sessions_aborted_total: register!(
                new_int_counter,
                "signalhub_sessions_aborted_total",
                "Cumulative number of client sessions aborted abnormally"
            ),
            commands_received_total: register!(
                new_int_counter,
                "signalhub_commands_received_total",
                "Cumulative number of decoded client commands"
            ),
            command_errors_total: register!(
                new_int_counter,
                "signalhub_command_errors_total",
                "Cumulative number of per-command error replies"
            ),
            publications_total: register!(
                new_int_counter,
                "signalhub_publications_total",
                "Cumulative number of publications accepted"
            ),
            publications_dropped_total: register!(
                new_int_counter,
                "signalhub_publications_dropped_total",
                "Cumulative number of publications that failed to reach a subscriber"
            ),
            websocket_request_bytes,
            write_queue_bytes: register!(
                new_int_gauge,
                "signalhub_write_queue_bytes",
                "Total bytes currently queued across all connection write queues"
            ),
            slow_consumer_disconnects_total: register!(
                new_int_counter,
                "signalhub_slow_consumer_disconnects_total",
                "Cumulative number of sessions disconnected for exceeding their write queue limit"
            ),
            channels_active: register!(
                new_int_gauge,
                "signalhub_channels_active",
                "Number of channels with at least one subscriber"
            ),
            subscriptions_active: register!(
                new_int_gauge,
                "signalhub_subscriptions_active",
                "Number of active (client, channel) subscriptions"
            ),
            presence_entries: register!(
                new_int_gauge,
                "signalhub_presence_entries",
                "Number of live presence entries across all channels"
            ),
            registry,
        }
    }

    /// Gather all registered metric families, for a caller-supplied exporter
    /// to render (e.g. as `text/plain; version=0.0.4`).
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_node_metrics_starts_at_zero() {
        let metrics = NodeMetrics::new();
        assert_eq!(metrics.connected_clients.get(), 0);
        metrics.connected_clients.inc();
        assert_eq!(metrics.connected_clients.get(), 1);
    }

    #[test]
    fn gather_includes_registered_families() {
        let metrics = NodeMetrics::new();
        let families = metrics.gather();
        assert!(families.iter().any(|f| f.get_name() == "signalhub_connected_clients"));
    }

    #[test]
    fn two_independent_nodes_do_not_collide() {
        let a = NodeMetrics::new();
        let b = NodeMetrics::new();
        a.connected_clients.inc();
        assert_eq!(a.connected_clients.get(), 1);
        assert_eq!(b.connected_clients.get(), 0);
    }
}
