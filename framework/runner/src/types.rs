/// Recommended error type for the `main` function of a binary built on this runner. Errors from
/// every layer of the tester convert into it so `?` can be used throughout.
pub type RpcTesterResult<T> = anyhow::Result<T>;
