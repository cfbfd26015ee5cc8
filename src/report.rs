//! Periodic CSV export of the node's observable state, for out-of-band
//! analysis of a running deployment. Two files, appended to once per
//! second: `value.csv` (the current reported mean) and `msg_count.csv`
//! (transport throughput), both under `/var/log/hidera/` as the
//! original system's own `util.WriteCSV` helper does.

use crate::engine::Engine;
use parking_lot::Mutex;
use std::{
  fs::OpenOptions,
  path::{Path, PathBuf},
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
  },
  time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::error;

const LOG_DIR: &str = "/var/log/hidera";

/// Shared, lock-free counters the transport layer bumps on every send
/// and receive; the report task drains them once per tick.
#[derive(Default)]
pub struct MessageCounters {
  sent: AtomicU64,
  received: AtomicU64,
}

impl MessageCounters {
  pub fn record_sent(&self) {
    self.sent.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_received(&self) {
    self.received.fetch_add(1, Ordering::Relaxed);
  }

  fn drain(&self) -> (u64, u64) {
    (
      self.sent.swap(0, Ordering::Relaxed),
      self.received.swap(0, Ordering::Relaxed),
    )
  }
}

fn now_unix_nanos() -> u128 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_nanos()
}

fn append_row(path: &Path, row: &[String]) -> std::io::Result<()> {
  let file = OpenOptions::new().create(true).append(true).open(path)?;
  let mut writer = csv::WriterBuilder::new()
    .has_headers(false)
    .from_writer(file);
  writer.write_record(row)?;
  writer.flush()
}

/// Spawns the once-per-second CSV writer task.
pub fn spawn(
  engine: Arc<Mutex<Engine>>,
  counters: Arc<MessageCounters>,
  log_dir: Option<PathBuf>,
) -> tokio::task::JoinHandle<()> {
  let log_dir = log_dir.unwrap_or_else(|| PathBuf::from(LOG_DIR));
  tokio::spawn(async move {
    if let Err(err) = std::fs::create_dir_all(&log_dir) {
      error!(%err, dir = %log_dir.display(), "failed to create report directory");
      return;
    }
    let value_path = log_dir.join("value.csv");
    let msg_count_path = log_dir.join("msg_count.csv");
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
      ticker.tick().await;
      let req_ts = now_unix_nanos();
      let mean = {
        let e = engine.lock();
        e.reported_mean()
      };
      let rcv_ts = now_unix_nanos();
      let row = vec![
        "x".to_string(),
        req_ts.to_string(),
        rcv_ts.to_string(),
        mean.map(|m| m.to_string()).unwrap_or_default(),
      ];
      if let Err(err) = append_row(&value_path, &row) {
        error!(%err, "failed to append to value.csv");
      }

      let (sent, received) = counters.drain();
      let row = vec![rcv_ts.to_string(), sent.to_string(), received.to_string()];
      if let Err(err) = append_row(&msg_count_path, &row) {
        error!(%err, "failed to append to msg_count.csv");
      }
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn counters_drain_resets_to_zero() {
    let c = MessageCounters::default();
    c.record_sent();
    c.record_sent();
    c.record_received();
    assert_eq!(c.drain(), (2, 1));
    assert_eq!(c.drain(), (0, 0));
  }

  #[test]
  fn append_row_writes_csv_line() {
    let dir = std::env::temp_dir().join(format!(
      "hidera-report-test-{:?}",
      std::thread::current().id()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("out.csv");
    append_row(&path, &["a".to_string(), "1".to_string()]).unwrap();
    append_row(&path, &["b".to_string(), "2".to_string()]).unwrap();
    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents, "a,1\nb,2\n");
    let _ = std::fs::remove_dir_all(&dir);
  }
}
