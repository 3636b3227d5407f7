//! The `KVServer` shard replica: a [`Service`](kvshard_net::Service) plugged
//! into a [`ServerHost`](kvshard_net::ServerHost), plus the RPC stub
//! functions both this crate and `kvshard-client` use to call it.

mod messages;
mod replica;

pub use messages::{GetArgs, GetReply, Op, PutAppendArgs, PutAppendReply, FAIL_SENTINEL};
pub use replica::KvReplica;

use std::sync::Arc;

use kvshard_net::{CallError, ClientEnd, MethodOutcome, Service};

const SERVICE_NAME: &str = "KVServer";

fn rpc<A, R>(end: &ClientEnd, method: &str, args: &A) -> Result<R, CallError>
where
    A: serde::Serialize,
    R: serde::de::DeserializeOwned,
{
    let payload = kvshard_codec::encode(args).map_err(|_| CallError::Timeout)?;
    let bytes = end.call(&format!("{SERVICE_NAME}.{method}"), payload)?;
    kvshard_codec::decode(&bytes).map_err(|_| CallError::Timeout)
}

pub fn call_get(end: &ClientEnd, args: &GetArgs) -> Result<GetReply, CallError> {
    rpc(end, "Get", args)
}

pub fn call_put(end: &ClientEnd, args: &PutAppendArgs) -> Result<PutAppendReply, CallError> {
    rpc(end, "Put", args)
}

pub fn call_append(end: &ClientEnd, args: &PutAppendArgs) -> Result<PutAppendReply, CallError> {
    rpc(end, "Append", args)
}

pub(crate) fn call_replicate(end: &ClientEnd, args: &PutAppendArgs) -> Result<PutAppendReply, CallError> {
    rpc(end, "Replicate", args)
}

/// Wraps a [`KvReplica`] so it can be registered with a
/// [`ServerHost`](kvshard_net::ServerHost) under the name `"KVServer"`.
pub struct KvService(Arc<KvReplica>);

impl KvService {
    pub fn new(replica: Arc<KvReplica>) -> Self {
        KvService(replica)
    }
}

impl Service for KvService {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    fn call(&self, method: &str, args: &[u8]) -> MethodOutcome {
        match method {
            "Get" => dispatch(args, |a: GetArgs| self.0.get(&a)),
            "Put" => dispatch(args, |a: PutAppendArgs| self.0.put(a)),
            "Append" => dispatch(args, |a: PutAppendArgs| self.0.append(a)),
            "Replicate" => dispatch(args, |a: PutAppendArgs| self.0.replicate(a)),
            other => panic!("KVServer: unknown method {other}"),
        }
    }
}

fn dispatch<A, R>(args: &[u8], handler: impl FnOnce(A) -> R) -> MethodOutcome
where
    A: serde::de::DeserializeOwned,
    R: serde::Serialize,
{
    let Ok(args) = kvshard_codec::decode::<A>(args) else {
        return MethodOutcome::DecodeError;
    };
    let reply = handler(args);
    match kvshard_codec::encode(&reply) {
        Ok(bytes) => MethodOutcome::Ok(bytes),
        Err(_) => MethodOutcome::DecodeError,
    }
}
