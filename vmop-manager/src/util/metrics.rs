use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use owo_colors::OwoColorize;

use super::colors::FG1;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;

use super::shutdown::shutdown_signal;

/// Prometheus metrics for the per-VM reconciliation pipeline.
#[derive(Clone)]
pub struct ControllerMetrics {
    registry: Registry,
    reconcile_count: IntCounterVec,
    action_count: IntCounterVec,
}

impl ControllerMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let reconcile_count = IntCounterVec::new(
            Opts::new(
                "vmop_reconcile_total",
                "Number of reconciliation passes, by outcome",
            ),
            &["namespace", "name", "outcome"],
        )
        .expect("build vmop_reconcile_total");
        registry
            .register(Box::new(reconcile_count.clone()))
            .expect("register vmop_reconcile_total");

        let action_count = IntCounterVec::new(
            Opts::new(
                "vmop_action_total",
                "Number of child-resource actions taken, by kind",
            ),
            &["namespace", "name", "action"],
        )
        .expect("build vmop_action_total");
        registry
            .register(Box::new(action_count.clone()))
            .expect("register vmop_action_total");

        Self {
            registry,
            reconcile_count,
            action_count,
        }
    }

    pub fn record_reconcile(&self, namespace: &str, name: &str, outcome: &str) {
        self.reconcile_count
            .with_label_values(&[namespace, name, outcome])
            .inc();
    }

    pub fn record_action(&self, namespace: &str, name: &str, action: &str) {
        self.action_count
            .with_label_values(&[namespace, name, action])
            .inc();
    }

    fn render(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .expect("encode prometheus metrics");
        buffer
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

async fn route(
    metrics: ControllerMetrics,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let body = match req.uri().path() {
        "/metrics" => metrics.render(),
        "/healthz" => b"ok".to_vec(),
        "/readyz" => b"ok".to_vec(),
        _ => return Ok(Response::builder().status(404).body(Full::new(Bytes::new())).unwrap()),
    };
    Ok(Response::new(Full::new(Bytes::from(body))))
}

/// Serves `/metrics`, `/healthz`, and `/readyz` until shut down.
pub async fn serve(metrics: ControllerMetrics, addr: SocketAddr) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    println!("{} {addr}", "metrics server listening on".color(FG1));

    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                println!("{}", "metrics server shutting down".color(FG1));
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let io = TokioIo::new(stream);
                let metrics = metrics.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| route(metrics.clone(), req));
                    if let Err(err) = ConnBuilder::new(hyper_util::rt::TokioExecutor::new())
                        .serve_connection(io, service)
                        .await
                    {
                        eprintln!("metrics connection error: {err}");
                    }
                });
            }
        }
    }
}
