use thiserror::Error;

/// Errors raised while loading and validating startup configuration.
/// These are always fatal: the process aborts before any round ever
/// runs, mirroring the original `config.LoadFromEnv` / `LoadParamsFromEnv`
/// fail-fast behavior.
#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("missing required environment variable {0}")]
  Missing(&'static str),

  #[error("must set either LISTEN_IP or LISTEN_HOST")]
  NoListenAddress,

  #[error("error resolving host {host:?}: {source}")]
  HostResolution {
    host: String,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid value for {name}: {value:?}")]
  InvalidValue { name: &'static str, value: String },

  #[error("peer {0:?} has neither an IP nor a host")]
  PeerMissingAddress(String),

  #[error(
    "PEER_IDS, PEER_IPS and PEER_HOSTS describe a different number of peers"
  )]
  PeerListLengthMismatch,
}

/// Errors raised while decoding an inbound datagram. These are never
/// fatal: a malformed message is dropped and logged, per the protocol's
/// error taxonomy.
#[derive(Debug, Error)]
pub enum DecodeError {
  #[error("empty datagram")]
  Empty,

  #[error("unknown message type tag {0}")]
  UnknownTag(u8),

  #[error("malformed payload for tag {tag}: {source}")]
  Malformed {
    tag: u8,
    #[source]
    source: serde_json::Error,
  },
}
