use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

// ============================================================================
// Metrics Module - Prometheus metrics for observability
// ============================================================================
//
// Counters for the write side (saves, conflicts, commands), the bus
// (publishes, resends, acks, reconnects) and the read side (replays,
// refresh passes). Components take an `Option<Arc<Metrics>>` so tests can
// run without a registry.
//
// ============================================================================

/// Central metrics registry for the runtime
pub struct Metrics {
    registry: Registry,

    // Event store
    pub events_saved: IntCounterVec,
    pub store_conflicts: IntCounterVec,

    // Commands
    pub commands_handled: IntCounterVec,

    // Publisher
    pub events_published: IntCounterVec,
    pub publish_resends: IntCounterVec,
    pub publish_failures: IntCounterVec,

    // Consumer
    pub deliveries: IntCounterVec,

    // Connection management
    pub reconnects: IntCounterVec,
    pub connection_state: IntGaugeVec,

    // Circuit breaker
    pub circuit_breaker_state: IntGauge,
    pub circuit_breaker_transitions: IntCounterVec,

    // Projections
    pub projection_replays: IntCounterVec,
    pub refresh_passes: IntCounter,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let events_saved = IntCounterVec::new(
            Opts::new("events_saved_total", "Events appended to the event store"),
            &["aggregate_type"],
        )?;
        registry.register(Box::new(events_saved.clone()))?;

        let store_conflicts = IntCounterVec::new(
            Opts::new("store_conflicts_total", "Optimistic concurrency conflicts on save"),
            &["aggregate_type"],
        )?;
        registry.register(Box::new(store_conflicts.clone()))?;

        let commands_handled = IntCounterVec::new(
            Opts::new("commands_handled_total", "Commands dispatched through the registry"),
            &["command_type", "outcome"],
        )?;
        registry.register(Box::new(commands_handled.clone()))?;

        let events_published = IntCounterVec::new(
            Opts::new("events_published_total", "Events confirmed by the broker"),
            &["event_type"],
        )?;
        registry.register(Box::new(events_published.clone()))?;

        let publish_resends = IntCounterVec::new(
            Opts::new("publish_resends_total", "Publish attempts repeated after nack or send failure"),
            &["event_type"],
        )?;
        registry.register(Box::new(publish_resends.clone()))?;

        let publish_failures = IntCounterVec::new(
            Opts::new("publish_failures_total", "Publishes that gave up"),
            &["reason"],
        )?;
        registry.register(Box::new(publish_failures.clone()))?;

        let deliveries = IntCounterVec::new(
            Opts::new("deliveries_total", "Consumed deliveries by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(deliveries.clone()))?;

        let reconnects = IntCounterVec::new(
            Opts::new("broker_reconnects_total", "Broker connections re-established"),
            &["connection"],
        )?;
        registry.register(Box::new(reconnects.clone()))?;

        let connection_state = IntGaugeVec::new(
            Opts::new(
                "broker_connection_state",
                "Connection state (0=Disconnected, 1=Connecting, 2=Connected, 3=Reconnecting)",
            ),
            &["connection"],
        )?;
        registry.register(Box::new(connection_state.clone()))?;

        let circuit_breaker_state = IntGauge::new(
            "circuit_breaker_state",
            "Publisher circuit breaker state (0=Closed, 1=Open, 2=HalfOpen)",
        )?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        let circuit_breaker_transitions = IntCounterVec::new(
            Opts::new("circuit_breaker_transitions_total", "Circuit breaker state transitions"),
            &["from_state", "to_state"],
        )?;
        registry.register(Box::new(circuit_breaker_transitions.clone()))?;

        let projection_replays = IntCounterVec::new(
            Opts::new("projection_replays_total", "History replays triggered by outdated projections"),
            &["aggregate_type"],
        )?;
        registry.register(Box::new(projection_replays.clone()))?;

        let refresh_passes = IntCounter::new(
            "projection_refresh_passes_total",
            "Completed projection refresh passes",
        )?;
        registry.register(Box::new(refresh_passes.clone()))?;

        Ok(Self {
            registry,
            events_saved,
            store_conflicts,
            commands_handled,
            events_published,
            publish_resends,
            publish_failures,
            deliveries,
            reconnects,
            connection_state,
            circuit_breaker_state,
            circuit_breaker_transitions,
            projection_replays,
            refresh_passes,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every metric in the Prometheus text format.
    pub fn encode(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    pub fn record_events_saved(&self, aggregate_type: &str, count: usize) {
        self.events_saved
            .with_label_values(&[aggregate_type])
            .inc_by(count as u64);
    }

    pub fn record_store_conflict(&self, aggregate_type: &str) {
        self.store_conflicts.with_label_values(&[aggregate_type]).inc();
    }

    pub fn record_command(&self, command_type: &str, success: bool) {
        let outcome = if success { "ok" } else { "error" };
        self.commands_handled
            .with_label_values(&[command_type, outcome])
            .inc();
    }

    pub fn record_published(&self, event_type: &str) {
        self.events_published.with_label_values(&[event_type]).inc();
    }

    pub fn record_publish_resend(&self, event_type: &str) {
        self.publish_resends.with_label_values(&[event_type]).inc();
    }

    pub fn record_publish_failure(&self, reason: &str) {
        self.publish_failures.with_label_values(&[reason]).inc();
    }

    /// `outcome` is one of `ack`, `nack` or `reject`.
    pub fn record_delivery(&self, outcome: &str) {
        self.deliveries.with_label_values(&[outcome]).inc();
    }

    pub fn record_reconnect(&self, connection: &str) {
        self.reconnects.with_label_values(&[connection]).inc();
    }

    pub fn set_connection_state(&self, connection: &str, state: i64) {
        self.connection_state
            .with_label_values(&[connection])
            .set(state);
    }

    pub fn update_circuit_breaker_state(&self, state: u8) {
        self.circuit_breaker_state.set(state as i64);
    }

    pub fn record_circuit_breaker_transition(&self, from_state: &str, to_state: &str) {
        self.circuit_breaker_transitions
            .with_label_values(&[from_state, to_state])
            .inc();
    }

    pub fn record_projection_replay(&self, aggregate_type: &str) {
        self.projection_replays
            .with_label_values(&[aggregate_type])
            .inc();
    }

    pub fn record_refresh_pass(&self) {
        self.refresh_passes.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert!(!metrics.registry().gather().is_empty());
    }

    #[test]
    fn test_record_command_outcomes() {
        let metrics = Metrics::new().unwrap();
        metrics.record_command("CreateUser", true);
        metrics.record_command("CreateUser", false);
        metrics.record_command("CreateUser", true);

        assert_eq!(
            metrics.commands_handled.with_label_values(&["CreateUser", "ok"]).get(),
            2
        );
        assert_eq!(
            metrics.commands_handled.with_label_values(&["CreateUser", "error"]).get(),
            1
        );
    }

    #[test]
    fn test_connection_state_gauge() {
        let metrics = Metrics::new().unwrap();
        metrics.set_connection_state("publisher", 3);
        metrics.set_connection_state("publisher", 2);

        assert_eq!(metrics.connection_state.with_label_values(&["publisher"]).get(), 2);
    }

    #[test]
    fn test_encode_contains_recorded_series() {
        let metrics = Metrics::new().unwrap();
        metrics.record_published("UserCreated");
        metrics.record_delivery("ack");

        let text = metrics.encode().unwrap();
        assert!(text.contains("events_published_total{event_type=\"UserCreated\"} 1"));
        assert!(text.contains("deliveries_total{outcome=\"ack\"} 1"));
    }
}
