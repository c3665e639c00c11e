use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::pool::{ChannelPool, HostStatus};
use crate::report::MatrixReport;

#[derive(Clone)]
pub struct DashboardState {
    pub progress: watch::Receiver<MatrixReport>,
    pub pool: Arc<ChannelPool>,
}

#[derive(Serialize)]
struct HostsResponse {
    leased: usize,
    hosts: Vec<HostStatus>,
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index_handler))
        .route("/api/report", get(report_handler))
        .route("/api/hosts", get(hosts_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the progress dashboard until `cancel` fires.
pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, cancel: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    let shutdown = async move { cancel.cancelled().await };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn report_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let report = state.progress.borrow().clone();
    Json(report)
}

async fn hosts_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(HostsResponse {
        leased: state.pool.leased(),
        hosts: state.pool.status(),
    })
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>sisyphus-lite</title>
<style>
body { font-family: monospace; margin: 2em; }
table { border-collapse: collapse; margin-bottom: 2em; }
td, th { padding: 4px 10px; border-bottom: 1px solid #ddd; text-align: left; }
.succeeded { color: #1a7f37; }
.failed { color: #cf222e; }
</style>
</head>
<body>
<h2>Build matrix</h2>
<p id="summary">loading...</p>
<table id="targets"></table>
<h2>Hosts</h2>
<table id="hosts"></table>
<script>
// Keys and host names come from user input; cells only ever get text
function fill(table, header, rows) {
  table.replaceChildren();
  const head = table.insertRow();
  for (const name of header) {
    const th = document.createElement('th');
    th.textContent = name;
    head.appendChild(th);
  }
  for (const cells of rows) {
    const tr = table.insertRow();
    for (const cell of cells) {
      const td = tr.insertCell();
      td.textContent = String(cell.text ?? cell);
      if (cell.cls) td.className = cell.cls;
    }
  }
}

async function refresh() {
  const report = await (await fetch('/api/report')).json();
  const s = report.summary;
  document.getElementById('summary').textContent =
    `${s.total} targets: ${s.succeeded} succeeded, ${s.failed} failed, ${s.retried} retried, ${s.pending} pending`;
  fill(document.getElementById('targets'), ['target', 'state', 'attempts', 'host'],
    report.targets.concat(report.pending).map(t =>
      [t.key, {text: t.state, cls: t.state}, t.attempts, t.host ?? '-']));

  const pool = await (await fetch('/api/hosts')).json();
  fill(document.getElementById('hosts'), ['host', 'os', 'health', 'preparation', 'leased', 'idle'],
    pool.hosts.map(h =>
      [h.name, h.os, h.health, h.preparation, `${h.leased}/${h.max_channels}`, h.idle]));
}
refresh();
setInterval(refresh, 2000);
</script>
</body>
</html>
"#;
