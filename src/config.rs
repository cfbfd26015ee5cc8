//! Startup configuration, loaded once from the process environment and
//! validated eagerly. Split into two cooperating pieces, mirroring the
//! original system's `config/config.go` (identity, addresses, peer
//! list) and `config/params.go` (round-tuning knobs) — the former
//! needs DNS resolution and cross-field validation, the latter is a
//! flat table of defaulted integers.

use crate::error::ConfigError;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

/// This node's identity, listen address and the fixed peer set it was
/// launched with.
#[derive(Debug, Clone)]
pub struct NodeConfig {
  pub id: String,
  pub listen_addr: SocketAddr,
  pub peer_ids: Vec<String>,
  pub peer_addrs: Vec<SocketAddr>,
}

impl NodeConfig {
  pub fn from_env() -> Result<Self, ConfigError> {
    let id = require_env("ID")?;

    let listen_ip = resolve_ip_env("LISTEN_IP", "LISTEN_HOST")?;
    let listen_port = parse_env("LISTEN_PORT")?;
    let listen_addr = SocketAddr::new(listen_ip, listen_port);

    let peer_ids = split_and_trim(&std::env::var("PEER_IDS").unwrap_or_default());
    if peer_ids.is_empty() {
      return Err(ConfigError::Missing("PEER_IDS"));
    }
    let peer_ips =
      split_and_trim(&std::env::var("PEER_IPS").unwrap_or_default());
    let peer_hosts =
      split_and_trim(&std::env::var("PEER_HOSTS").unwrap_or_default());

    let n = peer_ids.len();
    let peer_ips = pad(peer_ips, n);
    let peer_hosts = pad(peer_hosts, n);

    let mut peer_addrs = Vec::with_capacity(n);
    for i in 0..n {
      let ip = &peer_ips[i];
      let host = &peer_hosts[i];
      let resolved = if !ip.is_empty() {
        ip.parse::<IpAddr>().map_err(|_| ConfigError::InvalidValue {
          name: "PEER_IPS",
          value: ip.clone(),
        })?
      } else if !host.is_empty() {
        resolve_host(host)?
      } else {
        return Err(ConfigError::PeerMissingAddress(peer_ids[i].clone()));
      };
      peer_addrs.push(SocketAddr::new(resolved, listen_port));
    }

    if peer_ids.len() != peer_addrs.len() {
      return Err(ConfigError::PeerListLengthMismatch);
    }

    Ok(Self {
      id,
      listen_addr,
      peer_ids,
      peer_addrs,
    })
  }
}

/// Tunable round/election/threshold parameters. All carry
/// the original system's defaults.
#[derive(Debug, Clone, Copy)]
pub struct Params {
  pub t_agg: u64,
  pub t_elect: u64,
  pub r_max: i64,
  pub r_window: i64,
  pub r_full: i64,
  pub threshold: usize,
  pub startup_delay: u64,
}

impl Params {
  pub fn from_env() -> Result<Self, ConfigError> {
    Ok(Self {
      t_agg: parse_env_or("T_AGG", 1)?,
      t_elect: parse_env_or("T_ELECT", 1)?,
      r_max: parse_env_or("R_MAX", 3)?,
      r_window: parse_env_or("R_WINDOW", 10)?,
      r_full: parse_env_or("R_FULL", 6)?,
      threshold: parse_env_or("THRESHOLD", 5)?,
      startup_delay: parse_env_or("STARTUP_DELAY", 15)?,
    })
  }
}

fn require_env(name: &'static str) -> Result<String, ConfigError> {
  std::env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn parse_env<T: std::str::FromStr>(name: &'static str) -> Result<T, ConfigError> {
  let raw = require_env(name)?;
  raw.parse().map_err(|_| ConfigError::InvalidValue {
    name,
    value: raw,
  })
}

fn parse_env_or<T: std::str::FromStr>(
  name: &'static str,
  default: T,
) -> Result<T, ConfigError> {
  match std::env::var(name) {
    Err(_) => Ok(default),
    Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
      name,
      value: raw,
    }),
  }
}

fn resolve_ip_env(
  ip_var: &'static str,
  host_var: &'static str,
) -> Result<IpAddr, ConfigError> {
  if let Ok(ip) = std::env::var(ip_var) {
    if !ip.is_empty() {
      return ip.parse().map_err(|_| ConfigError::InvalidValue {
        name: ip_var,
        value: ip,
      });
    }
  }
  match std::env::var(host_var) {
    Ok(host) if !host.is_empty() => resolve_host(&host),
    _ => Err(ConfigError::NoListenAddress),
  }
}

fn resolve_host(host: &str) -> Result<IpAddr, ConfigError> {
  (host, 0)
    .to_socket_addrs()
    .map_err(|source| ConfigError::HostResolution {
      host: host.to_string(),
      source,
    })?
    .next()
    .map(|addr| addr.ip())
    .ok_or_else(|| ConfigError::HostResolution {
      host: host.to_string(),
      source: std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "no addresses returned",
      ),
    })
}

fn split_and_trim(s: &str) -> Vec<String> {
  if s.is_empty() {
    return Vec::new();
  }
  s.split(',').map(|p| p.trim().to_string()).collect()
}

fn pad(mut v: Vec<String>, n: usize) -> Vec<String> {
  if v.len() < n {
    v.resize(n, String::new());
  }
  v
}
