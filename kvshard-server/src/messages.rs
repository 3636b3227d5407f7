//! Argument/reply record types for the `KVServer` RPC methods.
//!
//! These are the only types `kvshard-codec` ever encodes or decodes here;
//! the codec itself stays oblivious to their shape.

use serde::{Deserialize, Serialize};

/// Sentinel returned in a reply's `value` to signal failure. In-band with
/// the value space by design: a legitimate stored string equal to this
/// sentinel is indistinguishable from failure.
pub const FAIL_SENTINEL: &str = "__FAIL__";

pub fn is_fail(value: &str) -> bool {
    value == FAIL_SENTINEL
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetArgs {
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetReply {
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Put,
    Append,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutAppendArgs {
    pub key: String,
    pub value: String,
    pub op: Op,
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutAppendReply {
    pub value: String,
}

impl PutAppendReply {
    pub fn fail() -> Self {
        PutAppendReply {
            value: FAIL_SENTINEL.to_string(),
        }
    }
}
