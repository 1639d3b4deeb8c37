/// The verbs a shard serves and calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcVerb {
    /// Sent by the client when it starts. No payload, empty reply.
    Hello = 0,
    /// Sent by the client when it stops. Ends the run of the server that receives it.
    Bye = 1,
    /// Replies with its `u64` argument.
    Echo = 2,
}

impl From<RpcVerb> for i32 {
    fn from(verb: RpcVerb) -> Self {
        verb as i32
    }
}
