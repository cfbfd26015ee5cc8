mod aggregate;
mod config;
mod engine;
mod error;
mod failure_detector;
mod ingest;
mod lag_metric;
mod message;
mod peer;
mod report;
mod transport;
mod tree;

use crate::{
  config::{NodeConfig, Params},
  engine::Engine,
  report::MessageCounters,
  transport::{PeerTable, Transport},
};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::{sync::Arc, time::Duration};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const INGEST_PORT: u16 = 9200;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let node_config = NodeConfig::from_env().map_err(|err| {
    error!(%err, "configuration error");
    err
  })?;
  let params = Params::from_env().map_err(|err| {
    error!(%err, "configuration error");
    err
  })?;

  info!(id = %node_config.id, listen = %node_config.listen_addr, "starting node");
  tokio::time::sleep(Duration::from_secs(params.startup_delay)).await;

  let peer_table = PeerTable::new(&node_config.peer_ids, &node_config.peer_addrs);
  let transport = Arc::new(Transport::bind(node_config.listen_addr, peer_table).await?);

  let rng = ChaCha8Rng::from_rng(rand::rngs::OsRng).expect("OS RNG is available");
  let engine = Arc::new(Mutex::new(Engine::new(
    node_config.id.clone(),
    node_config.peer_ids.clone(),
    params,
    rng,
  )));
  let counters = Arc::new(MessageCounters::default());

  let ingest_addr = std::net::SocketAddr::new(node_config.listen_addr.ip(), INGEST_PORT);
  let ingest_handle = ingest::spawn(ingest_addr, Arc::clone(&engine));
  let report_handle = report::spawn(Arc::clone(&engine), Arc::clone(&counters), None);
  let election_handle = spawn_election_loop(Arc::clone(&engine), params.t_elect);
  let failed_peer_ping_handle =
    spawn_failed_peer_pinger(Arc::clone(&engine), Arc::clone(&transport), params.t_agg);

  let round_interval = Duration::from_secs(params.t_agg.max(1));
  let mut ticker = tokio::time::interval(round_interval);

  info!("node running");
  loop {
    tokio::select! {
      _ = ticker.tick() => {
        let outbound = {
          let mut e = engine.lock();
          e.execute_round()
        };
        for (to, msg) in outbound {
          transport.send(&to, &msg).await;
          counters.record_sent();
        }
      }

      (sender, msg) = transport.recv() => {
        counters.record_received();
        let mut e = engine.lock();
        e.record_liveness(&sender);
        e.dispatch(&sender, msg);
      }

      _ = shutdown_signal() => {
        info!("received shutdown signal, stopping");
        break;
      }
    }
  }

  ingest_handle.abort();
  report_handle.abort();
  election_handle.abort();
  failed_peer_ping_handle.abort();
  Ok(())
}

/// Low-frequency ping to every currently-failed peer, so a peer that
/// silently comes back has a way to be revived even while it contributes
/// no tree traffic of its own (§4.8: `10 * T_agg`).
fn spawn_failed_peer_pinger(
  engine: Arc<Mutex<Engine>>,
  transport: Arc<Transport>,
  t_agg_secs: u64,
) -> tokio::task::JoinHandle<()> {
  tokio::spawn(async move {
    let period = Duration::from_secs((t_agg_secs.max(1)) * 10);
    let mut ticker = tokio::time::interval(period);
    loop {
      ticker.tick().await;
      let failed = engine.lock().failed_peers();
      for peer in failed {
        transport.send(&peer, &crate::message::Message::Ping).await;
      }
    }
  })
}

/// Periodically attempts self-election while no tree is known, the
/// way the original system's retry-until-elected goroutine does —
/// re-checked every tick rather than spawned/joined on demand, since
/// the attempt itself is a no-op once a tree exists.
fn spawn_election_loop(
  engine: Arc<Mutex<Engine>>,
  t_elect_secs: u64,
) -> tokio::task::JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(Duration::from_secs(t_elect_secs.max(1)));
    loop {
      ticker.tick().await;
      let mut e = engine.lock();
      if e.should_be_electing() {
        e.try_elect_self_as_root();
      }
    }
  })
}

async fn shutdown_signal() {
  #[cfg(unix)]
  {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm =
      signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
      _ = tokio::signal::ctrl_c() => {}
      _ = sigterm.recv() => {}
    }
  }
  #[cfg(not(unix))]
  {
    let _ = tokio::signal::ctrl_c().await;
  }
}
