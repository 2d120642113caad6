//! Prometheus metrics for the router and a small exporter.
use std::convert::Infallible;
use std::net::SocketAddr;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use once_cell::sync::Lazy;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::{error, info, warn};

/// Router metric families, registered in their own [`Registry`].
pub struct RouterMetrics {
    registry: Registry,
    /// Routes that had to broadcast, by table and broadcast kind.
    pub route_broadcasts: IntCounterVec,
    /// Physical targets dispatched by the coordinator, by operation.
    pub fanout_targets: IntCounterVec,
    /// Failed physical targets, by failure kind.
    pub target_failures: IntCounterVec,
    /// Identifiers handed out by the ID generator.
    pub ids_generated: IntCounter,
    /// End-to-end logical operation latency.
    pub op_latency_secs: HistogramVec,
}

impl RouterMetrics {
    fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let route_broadcasts = IntCounterVec::new(
            Opts::new("strata_route_broadcasts_total", "Routes that could not be narrowed to one target"),
            &["table", "kind"],
        )?;
        let fanout_targets = IntCounterVec::new(
            Opts::new("strata_fanout_targets_total", "Physical targets dispatched"),
            &["op"],
        )?;
        let target_failures = IntCounterVec::new(
            Opts::new("strata_target_failures_total", "Physical targets that failed"),
            &["kind"],
        )?;
        let ids_generated = IntCounter::new("strata_ids_generated_total", "Snowflake identifiers generated")?;
        let op_latency_secs = HistogramVec::new(
            HistogramOpts::new("strata_op_latency_seconds", "Logical operation latency in seconds")
                .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
            &["op"],
        )?;
        registry.register(Box::new(route_broadcasts.clone()))?;
        registry.register(Box::new(fanout_targets.clone()))?;
        registry.register(Box::new(target_failures.clone()))?;
        registry.register(Box::new(ids_generated.clone()))?;
        registry.register(Box::new(op_latency_secs.clone()))?;
        Ok(Self { registry, route_broadcasts, fanout_targets, target_failures, ids_generated, op_latency_secs })
    }

    /// Text exposition of every metric family.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            warn!("metrics encoding failed: {e}");
        }
        buffer
    }
}

static METRICS: Lazy<Option<RouterMetrics>> = Lazy::new(|| match RouterMetrics::new() {
    Ok(m) => Some(m),
    Err(e) => {
        error!("router metrics disabled: {e}");
        None
    }
});

/// Process-wide metrics, `None` if they could not be registered.
pub fn metrics() -> Option<&'static RouterMetrics> {
    METRICS.as_ref()
}

/// Count a broadcast route.
pub fn record_broadcast(table: &str, kind: &str) {
    if let Some(m) = metrics() {
        m.route_broadcasts.with_label_values(&[table, kind]).inc();
    }
}

/// Count `targets` dispatched for one logical operation.
pub fn record_fanout(op: &str, targets: usize) {
    if let Some(m) = metrics() {
        m.fanout_targets.with_label_values(&[op]).inc_by(targets as u64);
    }
}

/// Count one failed target.
pub fn record_target_failure(kind: &str) {
    if let Some(m) = metrics() {
        m.target_failures.with_label_values(&[kind]).inc();
    }
}

pub fn record_id_generated() {
    if let Some(m) = metrics() {
        m.ids_generated.inc();
    }
}

/// Observe the latency of one logical operation.
pub fn observe_op(op: &str, secs: f64) {
    if let Some(m) = metrics() {
        m.op_latency_secs.with_label_values(&[op]).observe(secs);
    }
}

/// Launch the Prometheus exporter on `addr` and return the bound address.
/// When `basic_auth` is Some((user, pass)), requires an Authorization header.
pub async fn serve(addr: &str, basic_auth: Option<(String, String)>) -> Result<SocketAddr> {
    let make_svc = make_service_fn(move |_| {
        let auth = basic_auth.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| metrics_handler(req, auth.clone()))) }
    });
    let server = Server::try_bind(&addr.parse()?)?.serve(make_svc);
    let bound = server.local_addr();
    tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("metrics server error: {e}");
        }
    });
    info!(addr = %bound, "metrics exporter listening");
    Ok(bound)
}

fn status_only(status: StatusCode) -> Response<Body> {
    let mut resp = Response::new(Body::empty());
    *resp.status_mut() = status;
    resp
}

async fn metrics_handler(req: Request<Body>, auth: Option<(String, String)>) -> Result<Response<Body>, Infallible> {
    if req.uri().path() != "/metrics" {
        return Ok(status_only(StatusCode::NOT_FOUND));
    }
    if let Some((u, p)) = auth {
        let expected = format!("Basic {}", B64.encode(format!("{u}:{p}")));
        let given = req.headers().get(AUTHORIZATION).and_then(|h| h.to_str().ok());
        if given != Some(expected.as_str()) {
            return Ok(status_only(StatusCode::UNAUTHORIZED));
        }
    }
    let body = metrics().map(RouterMetrics::encode).unwrap_or_default();
    let mut resp = Response::new(Body::from(body));
    resp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4"));
    Ok(resp)
}
