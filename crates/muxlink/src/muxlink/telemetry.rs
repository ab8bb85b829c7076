use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")?;
    describe();
    Ok(handle)
}

fn describe() {
    metrics::describe_counter!(
        "muxlink_streams_total",
        "Tunnel streams accepted from the server, by routing outcome"
    );
    metrics::describe_counter!("muxlink_bridges_total", "Bridge pairs started");
    metrics::describe_gauge!("muxlink_active_bridges", "Bridge pairs currently open");
    metrics::describe_counter!(
        "muxlink_bridge_bytes_total",
        metrics::Unit::Bytes,
        "Payload bytes copied by bridges, by direction"
    );
    metrics::describe_counter!(
        "muxlink_routes_registered_total",
        "Routes registered through the control channel"
    );
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
