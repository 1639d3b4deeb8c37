use rpc_tester_core::prelude::ShutdownHandle;
use tokio::signal;

/// Turn Ctrl-C into the process-wide shutdown signal.
pub(crate) fn start_shutdown_listener(runtime: &tokio::runtime::Runtime) -> ShutdownHandle {
    let handle = ShutdownHandle::default();

    let listener_handle = handle.clone();
    runtime.spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                listener_handle.shutdown();
                log::info!("Received shutdown signal, shutting down...");
            }
            Err(e) => log::error!("Failed to listen for the Ctrl-C signal: {e}"),
        }
    });

    handle
}
