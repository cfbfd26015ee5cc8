//! Wire codec: a tagged union of four message kinds framed as
//! `[tag: u8][json payload]`, matching the original system's
//! `MsgToBytes` / `BytesToMsg`. JSON is kept as the payload
//! encoding deliberately — it is what the original wire format uses
//! ("self-describing text payload") and `serde_json` is already the
//! project's serialization crate.

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};

const LOCAL_AGG_TAG: u8 = 1;
const GLOBAL_AGG_TAG: u8 = 2;
const GLOBAL_AGG_LAZY_TAG: u8 = 3;
const PING_TAG: u8 = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalAgg {
  pub tree_id: String,
  pub value: f64,
  pub count: i64,
  pub sender_round: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalAgg {
  pub tree_id: String,
  pub value: f64,
  pub count: i64,
  pub level: u32,
  pub value_round: i64,
  pub sender_round: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalAggLazy {
  pub tree_id: String,
  pub value_round: i64,
  pub sender_round: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
  LocalAgg(LocalAgg),
  GlobalAgg(GlobalAgg),
  GlobalAggLazy(GlobalAggLazy),
  Ping,
}

impl Message {
  pub fn tag(&self) -> u8 {
    match self {
      Message::LocalAgg(_) => LOCAL_AGG_TAG,
      Message::GlobalAgg(_) => GLOBAL_AGG_TAG,
      Message::GlobalAggLazy(_) => GLOBAL_AGG_LAZY_TAG,
      Message::Ping => PING_TAG,
    }
  }

  pub fn tree_id(&self) -> Option<&str> {
    match self {
      Message::LocalAgg(m) => Some(&m.tree_id),
      Message::GlobalAgg(m) => Some(&m.tree_id),
      Message::GlobalAggLazy(m) => Some(&m.tree_id),
      Message::Ping => None,
    }
  }

  pub fn sender_round(&self) -> Option<i64> {
    match self {
      Message::LocalAgg(m) => Some(m.sender_round),
      Message::GlobalAgg(m) => Some(m.sender_round),
      Message::GlobalAggLazy(m) => Some(m.sender_round),
      Message::Ping => None,
    }
  }

  pub fn encode(&self) -> Vec<u8> {
    let mut out = vec![self.tag()];
    match self {
      Message::LocalAgg(m) => {
        out.extend(serde_json::to_vec(m).expect("LocalAgg is serializable"))
      }
      Message::GlobalAgg(m) => {
        out.extend(serde_json::to_vec(m).expect("GlobalAgg is serializable"))
      }
      Message::GlobalAggLazy(m) => out.extend(
        serde_json::to_vec(m).expect("GlobalAggLazy is serializable"),
      ),
      Message::Ping => {}
    }
    out
  }

  pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    let (&tag, payload) = bytes.split_first().ok_or(DecodeError::Empty)?;
    match tag {
      LOCAL_AGG_TAG => serde_json::from_slice(payload)
        .map(Message::LocalAgg)
        .map_err(|source| DecodeError::Malformed { tag, source }),
      GLOBAL_AGG_TAG => serde_json::from_slice(payload)
        .map(Message::GlobalAgg)
        .map_err(|source| DecodeError::Malformed { tag, source }),
      GLOBAL_AGG_LAZY_TAG => serde_json::from_slice(payload)
        .map(Message::GlobalAggLazy)
        .map_err(|source| DecodeError::Malformed { tag, source }),
      PING_TAG => Ok(Message::Ping),
      other => Err(DecodeError::UnknownTag(other)),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn round_trips_local_agg() {
    let msg = Message::LocalAgg(LocalAgg {
      tree_id: "B".into(),
      value: 4.0,
      count: 1,
      sender_round: 7,
    });
    assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
  }

  #[test]
  fn round_trips_global_agg() {
    let msg = Message::GlobalAgg(GlobalAgg {
      tree_id: "B".into(),
      value: 10.0,
      count: 2,
      level: 1,
      value_round: 4,
      sender_round: 7,
    });
    assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
  }

  #[test]
  fn ping_has_no_payload() {
    assert_eq!(Message::Ping.encode(), vec![PING_TAG]);
    assert_eq!(Message::decode(&[PING_TAG]).unwrap(), Message::Ping);
  }

  #[test]
  fn decode_rejects_empty_datagram() {
    assert!(matches!(Message::decode(&[]), Err(DecodeError::Empty)));
  }

  #[test]
  fn decode_rejects_unknown_tag() {
    assert!(matches!(
      Message::decode(&[9]),
      Err(DecodeError::UnknownTag(9))
    ));
  }

  #[test]
  fn decode_rejects_malformed_payload() {
    let mut bytes = vec![LOCAL_AGG_TAG];
    bytes.extend(b"not json");
    assert!(matches!(
      Message::decode(&bytes),
      Err(DecodeError::Malformed { tag: LOCAL_AGG_TAG, .. })
    ));
  }
}
