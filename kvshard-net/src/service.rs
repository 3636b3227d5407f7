//! The per-service half of dispatch: decode args, invoke the named method,
//! encode the reply.

/// Outcome of invoking one method on a [`Service`].
pub enum MethodOutcome {
    /// The method ran and produced an encoded reply.
    Ok(Vec<u8>),
    /// The argument bytes failed to decode. Not fatal: the caller sees
    /// this as an ordinary RPC failure, the same as a dropped message.
    DecodeError,
}

/// A named collection of RPC methods, e.g. `"KVServer"`.
///
/// Implementors decode args, call the receiver, and encode the reply for
/// each method name they recognize. An unrecognized method name is a
/// configuration error: implementations must panic, not return
/// [`MethodOutcome::DecodeError`], so the mistake surfaces immediately
/// instead of looking like a flaky network.
pub trait Service: Send + Sync {
    /// The service name used in `"Service.Method"` dispatch strings.
    fn name(&self) -> &str;

    /// Invoke `method` with the encoded argument bytes.
    fn call(&self, method: &str, args: &[u8]) -> MethodOutcome;
}
