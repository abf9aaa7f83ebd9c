use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::core::constants::PROTOCOL_TAG;
use crate::core::key::{BindSpec, Key};
use crate::error::BindError;

/// Outcome of registering with a distributor: the bound address for IP
/// bindings, nothing for path and descriptor bindings, or the bind error.
pub type AddReply = Result<Option<SocketAddr>, BindError>;

/// One message on a worker channel.
///
/// `tag` is optional on decode so that traffic belonging to other protocols
/// still parses and can be ignored rather than rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
    #[serde(flatten)]
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Request(Request),
    Reply(Reply),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "act")]
pub enum Request {
    /// Primary to worker: take ownership of the attached connection.
    #[serde(rename = "newconn")]
    NewConn { key: Key },
    /// Worker to primary: join the pool for this binding.
    #[serde(rename = "queryServer")]
    QueryServer { spec: BindSpec },
    /// Worker to primary: leave the pool for this binding.
    #[serde(rename = "close")]
    Close { key: Key },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sockname: Option<SocketAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errno: Option<i32>,
}

impl Reply {
    pub fn accepted(accepted: bool) -> Self {
        Self {
            accepted: Some(accepted),
            ..Self::default()
        }
    }

    /// Back to the registration outcome. A reply without `errno` is a
    /// success, with or without an address.
    pub fn into_add_reply(self) -> AddReply {
        match self.errno {
            Some(errno) => Err(BindError { errno }),
            None => Ok(self.sockname),
        }
    }
}

impl From<AddReply> for Reply {
    fn from(reply: AddReply) -> Self {
        match reply {
            Ok(sockname) => Self {
                sockname,
                ..Self::default()
            },
            Err(e) => Self {
                errno: Some(e.errno),
                ..Self::default()
            },
        }
    }
}

impl From<Request> for Payload {
    fn from(request: Request) -> Self {
        Self::Request(request)
    }
}

impl From<Reply> for Payload {
    fn from(reply: Reply) -> Self {
        Self::Reply(reply)
    }
}

impl Envelope {
    pub fn new(seq: u64, ack: Option<u64>, payload: Payload) -> Self {
        Self {
            tag: Some(PROTOCOL_TAG.to_owned()),
            seq: Some(seq),
            ack,
            payload,
        }
    }

    pub fn is_cluster(&self) -> bool {
        self.tag.as_deref() == Some(PROTOCOL_TAG)
    }

    pub fn request(&self) -> Option<&Request> {
        match &self.payload {
            Payload::Request(r) => Some(r),
            Payload::Reply(_) => None,
        }
    }

    pub fn reply(&self) -> Option<&Reply> {
        match &self.payload {
            Payload::Reply(r) => Some(r),
            Payload::Request(_) => None,
        }
    }

    /// `accepted` of a handoff reply; anything that is not an explicit
    /// acceptance counts as a refusal.
    pub fn is_accepted(&self) -> bool {
        self.reply().and_then(|r| r.accepted).unwrap_or(false)
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn newconn_wire_shape() {
        let env = Envelope::new(
            4,
            None,
            Request::NewConn {
                key: Key::new("127.0.0.1:80:tcp"),
            }
            .into(),
        );
        let value: serde_json::Value = serde_json::from_slice(&env.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({ "tag": "cluster-rpc", "act": "newconn", "key": "127.0.0.1:80:tcp", "seq": 4 })
        );
    }

    #[test]
    fn handoff_reply_decodes() {
        let raw = br#"{"tag":"cluster-rpc","ack":4,"accepted":false,"seq":0}"#;
        let env = Envelope::decode(raw).unwrap();
        assert!(env.is_cluster());
        assert_eq!(env.ack, Some(4));
        assert!(!env.is_accepted());
        assert!(env.request().is_none());
    }

    #[test]
    fn foreign_messages_still_parse() {
        let env = Envelope::decode(br#"{"cmd":"status","x":1}"#).unwrap();
        assert!(!env.is_cluster());
    }

    #[test]
    fn query_server_carries_spec() {
        let raw = br#"{"tag":"cluster-rpc","seq":0,"act":"queryServer","spec":{"port":8080,"address":"0.0.0.0"}}"#;
        let env = Envelope::decode(raw).unwrap();
        match env.request() {
            Some(Request::QueryServer { spec }) => {
                assert_eq!(spec, &BindSpec::tcp(Some("0.0.0.0"), 8080));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn add_reply_survives_the_wire() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let bound: AddReply = Ok(Some(addr));
        let ok = Reply::from(bound);
        assert_eq!(serde_json::to_value(&ok).unwrap(), json!({ "sockname": "127.0.0.1:8080" }));
        assert_eq!(ok.into_add_reply(), Ok(Some(addr)));

        let unbound: AddReply = Ok(None);
        let pipe = Reply::from(unbound);
        assert_eq!(serde_json::to_value(&pipe).unwrap(), json!({}));

        let in_use: AddReply = Err(BindError {
            errno: libc::EADDRINUSE,
        });
        let failed = Reply::from(in_use);
        assert_eq!(
            failed.into_add_reply(),
            Err(BindError {
                errno: libc::EADDRINUSE
            })
        );
    }
}
