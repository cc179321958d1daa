use std::net::SocketAddr;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::tunnelgate::net;

pub const SESSIONS_TOTAL: &str = "tunnelgate_sessions_total";
pub const ACTIVE_SESSIONS: &str = "tunnelgate_active_sessions";
pub const PROXIES_EMITTED_TOTAL: &str = "tunnelgate_proxies_emitted_total";
pub const RELAY_BYTES_TOTAL: &str = "tunnelgate_relay_bytes_total";

/// Installs the process-wide Prometheus recorder.
///
/// With a non-empty `listen_addr` the exposition format is served over HTTP
/// at that address; otherwise metrics are recorded but not exported.
pub fn init_prometheus(listen_addr: &str) -> anyhow::Result<()> {
    let builder = PrometheusBuilder::new();
    if listen_addr.trim().is_empty() {
        builder
            .install_recorder()
            .context("metrics: install Prometheus recorder")?;
    } else {
        let addr: SocketAddr = net::normalize_bind_addr(listen_addr)
            .parse()
            .with_context(|| format!("invalid metrics_addr: {listen_addr}"))?;
        builder
            .with_http_listener(addr)
            .install()
            .with_context(|| format!("metrics: serve Prometheus on {addr}"))?;
        tracing::info!(addr = %addr, "metrics: listening");
    }
    describe();
    Ok(())
}

fn describe() {
    metrics::describe_counter!(SESSIONS_TOTAL, "Control sessions started.");
    metrics::describe_gauge!(ACTIVE_SESSIONS, "Control sessions currently open.");
    metrics::describe_counter!(PROXIES_EMITTED_TOTAL, "Proxy configs handed to the registry.");
    metrics::describe_counter!(RELAY_BYTES_TOTAL, "Bytes moved by relay pipes.");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorded_metrics_render_with_descriptions() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            describe();
            metrics::counter!(RELAY_BYTES_TOTAL).increment(42);
            metrics::gauge!(ACTIVE_SESSIONS).increment(1.0);
        });

        let out = handle.render();
        assert!(out.contains("# HELP tunnelgate_relay_bytes_total Bytes moved by relay pipes."));
        assert!(out.contains("tunnelgate_relay_bytes_total 42"));
        assert!(out.contains("tunnelgate_active_sessions 1"));
    }
}
