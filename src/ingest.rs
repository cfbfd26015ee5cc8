//! HTTP ingestion endpoint: accepts a Prometheus-style text exposition
//! body on `POST /metrics` and extracts a single gauge,
//! `app_memory_usage_bytes`, as this node's locally observed value.
//! Mirrors the original system's metrics scraper, reimplemented as a
//! push endpoint the monitored process posts to directly.

use crate::engine::Engine;
use axum::{
  extract::Extension,
  http::StatusCode,
  routing::post,
  Router,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

const METRIC_NAME: &str = "app_memory_usage_bytes";

/// Finds `app_memory_usage_bytes <value>` (optionally followed by a
/// trailing timestamp, per the Prometheus text exposition format) and
/// parses `<value>` as an `f64`. Lines starting with `#` are comments
/// and are skipped, matching the format's own rules.
fn parse_metric(body: &str) -> Option<f64> {
  body
    .lines()
    .filter(|line| !line.trim_start().starts_with('#'))
    .find_map(|line| {
      let mut fields = line.split_whitespace();
      let name = fields.next()?;
      if name != METRIC_NAME {
        return None;
      }
      fields.next()?.parse::<f64>().ok()
    })
}

async fn serve_metrics(
  Extension(engine): Extension<Arc<Mutex<Engine>>>,
  body: String,
) -> StatusCode {
  match parse_metric(&body) {
    Some(value) => {
      engine.lock().value = value;
      debug!(value, "ingested local value");
      StatusCode::OK
    }
    None => {
      warn!(metric = METRIC_NAME, "metrics body missing expected gauge");
      StatusCode::BAD_REQUEST
    }
  }
}

/// Spawns the ingestion server on `addr`, returning its join handle.
pub fn spawn(
  addr: std::net::SocketAddr,
  engine: Arc<Mutex<Engine>>,
) -> tokio::task::JoinHandle<()> {
  let app = Router::new()
    .route("/metrics", post(serve_metrics))
    .layer(Extension(engine));

  tokio::spawn(async move {
    if let Err(err) = axum::Server::bind(&addr).serve(app.into_make_service()).await {
      tracing::error!(%err, "metrics ingestion server stopped");
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_gauge_with_trailing_timestamp() {
    let body = "app_memory_usage_bytes 12345.6 1627849200000\n";
    assert_eq!(parse_metric(body), Some(12345.6));
  }

  #[test]
  fn parses_gauge_among_unrelated_lines() {
    let body = "# HELP app_memory_usage_bytes docs\n\
                # TYPE app_memory_usage_bytes gauge\n\
                other_metric 1\n\
                app_memory_usage_bytes 42\n";
    assert_eq!(parse_metric(body), Some(42.0));
  }

  #[test]
  fn missing_gauge_returns_none() {
    assert_eq!(parse_metric("other_metric 1\n"), None);
  }

  #[test]
  fn malformed_value_returns_none() {
    assert_eq!(parse_metric("app_memory_usage_bytes not_a_number\n"), None);
  }
}
