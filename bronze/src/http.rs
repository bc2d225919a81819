//! Metrics and health endpoint of `bronze run`.

use std::{collections::BTreeMap, convert::Infallible, fmt::Write, sync::Arc};

use bronze_ingest::{ConsumerState, StopReason};
use bronze_types::Source;
use hyper::{
    Body, Method, Request, Response, StatusCode,
    server::conn::{AddrIncoming, AddrStream},
};
use observability_deps::tracing::debug;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// What the endpoint reports on.
#[derive(Debug, Clone)]
pub(crate) struct ServerState {
    metrics: Arc<metric::Registry>,
    consumers: BTreeMap<Source, watch::Receiver<ConsumerState>>,
}

impl ServerState {
    pub(crate) fn new(
        metrics: Arc<metric::Registry>,
        consumers: BTreeMap<Source, watch::Receiver<ConsumerState>>,
    ) -> Self {
        Self { metrics, consumers }
    }
}

/// Serve `GET /metrics` and `GET /health` until `shutdown` is cancelled.
pub(crate) async fn serve(
    addr: AddrIncoming,
    state: ServerState,
    shutdown: CancellationToken,
) -> Result<(), hyper::Error> {
    let state = Arc::new(state);

    hyper::Server::builder(addr)
        .serve(hyper::service::make_service_fn(|_conn: &AddrStream| {
            let state = Arc::clone(&state);
            let service = hyper::service::service_fn(move |request: Request<Body>| {
                let state = Arc::clone(&state);
                async move { Ok::<_, Infallible>(route_request(&state, request)) }
            });
            futures::future::ready(Ok::<_, Infallible>(service))
        }))
        .with_graceful_shutdown(shutdown.cancelled())
        .await
}

fn route_request(state: &ServerState, req: Request<Body>) -> Response<Body> {
    debug!(method = %req.method(), path = req.uri().path(), "processing request");

    match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => health(state),
        (&Method::GET, "/metrics") => handle_metrics(&state.metrics),
        _ => response(StatusCode::NOT_FOUND, "not found\n".into()),
    }
}

/// One line per consumer. Unhealthy once a consumer stopped for good.
fn health(state: &ServerState) -> Response<Body> {
    let mut body = String::new();
    let mut healthy = true;
    for (source, rx) in &state.consumers {
        let consumer = *rx.borrow();
        healthy &= consumer != ConsumerState::Stopped(StopReason::Fatal);
        let _ = writeln!(body, "{source}: {consumer}");
    }

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    response(status, body)
}

fn handle_metrics(registry: &metric::Registry) -> Response<Body> {
    let mut body: Vec<u8> = Default::default();
    let mut reporter = metric_exporters::PrometheusTextEncoder::new(&mut body);
    registry.report(&mut reporter);

    Response::new(Body::from(body))
}

fn response(status: StatusCode, body: String) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use metric::{Attributes, U64Counter};
    use pretty_assertions::assert_eq;

    use super::*;

    async fn get(state: &ServerState, path: &str) -> (StatusCode, String) {
        let req = Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())
            .unwrap();
        let resp = route_request(state, req);
        let status = resp.status();
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn metrics_are_exported_as_prometheus_text() {
        let metrics = Arc::new(metric::Registry::default());
        metrics
            .register_metric::<U64Counter>("bronze_test_events", "events seen by the test")
            .recorder(Attributes::from(&[("source", "relational")]))
            .inc(3);
        let state = ServerState::new(metrics, BTreeMap::new());

        let (status, body) = get(&state, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("bronze_test_events"), "{body}");
        assert!(body.contains(r#"source="relational""#), "{body}");
    }

    #[tokio::test]
    async fn health_reports_every_consumer() {
        let (_tx_r, rx_r) = watch::channel(ConsumerState::Streaming);
        let (tx_d, rx_d) = watch::channel(ConsumerState::Backoff);
        let state = ServerState::new(
            Default::default(),
            BTreeMap::from([(Source::Relational, rx_r), (Source::Document, rx_d)]),
        );

        let (status, body) = get(&state, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "relational: streaming\ndocument: backoff\n");

        tx_d.send_replace(ConsumerState::Stopped(StopReason::Fatal));
        let (status, body) = get(&state, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "relational: streaming\ndocument: stopped(fatal)\n");
    }

    #[tokio::test]
    async fn unknown_routes_are_not_found() {
        let state = ServerState::new(Default::default(), BTreeMap::new());
        let (status, _) = get(&state, "/write").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
