use std::future::Future;

use anyhow::Context;
use rpc_tester_core::prelude::{ShutdownHandle, ShutdownSignalError};

/// The single-threaded runtime that one shard's connections, handlers and jobs run on.
#[derive(Debug)]
pub(crate) struct Executor {
    runtime: tokio::runtime::Runtime,
    shutdown_handle: ShutdownHandle,
}

impl Executor {
    pub(crate) fn new(shard: usize, shutdown_handle: ShutdownHandle) -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .with_context(|| format!("Failed to create Tokio runtime for shard {shard}"))?;

        Ok(Self {
            runtime,
            shutdown_handle,
        })
    }

    /// Run async code in place, blocking until it completes.
    ///
    /// Note that the future will be cancelled if the runner is shutdown. Use this for steps that
    /// could wait on the peer forever, such as connecting and the HELLO handshake.
    pub(crate) fn execute_in_place<T>(
        &self,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> anyhow::Result<T> {
        let mut shutdown_listener = self.shutdown_handle.new_listener();
        self.runtime.block_on(async move {
            tokio::select! {
                result = fut => result,
                _ = shutdown_listener.wait_for_shutdown() => {
                    Err(anyhow::anyhow!(ShutdownSignalError::default()))
                },
            }
        })
    }

    /// Run async code to completion, whether or not the runner is shutdown. The future is
    /// expected to observe the shutdown signal itself where that matters.
    pub(crate) fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }
}
