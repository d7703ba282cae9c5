//! Event-loop ownership.
//!
//! All protocol state of a node lives in one actor task; this module decides
//! where that task runs. By default the library spawns a single worker
//! thread driving a current-thread runtime, so the whole node is
//! cooperatively scheduled on one thread and torn down with it. A caller may
//! instead hand in a runtime handle, in which case no thread is spawned.

use std::fmt;
use std::future::Future;
use std::thread;

use tokio_util::sync::CancellationToken;
use tracing::error;

/// Startup failure of a client or server, reported through
/// `error_stack::Report`.
#[derive(Debug)]
pub struct StartError;

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("failed to start node")
    }
}

impl std::error::Error for StartError {}

/// Owns the actor's execution context for the lifetime of a handle.
pub(crate) struct EventLoop {
    cancel: CancellationToken,
    thread: Option<thread::JoinHandle<()>>,
}

impl EventLoop {
    /// Drive `future` to completion on `runtime` when given, otherwise on a
    /// dedicated worker thread. `cancel` is the token the future observes
    /// for shutdown.
    pub(crate) fn spawn<F>(
        runtime: Option<tokio::runtime::Handle>,
        cancel: CancellationToken,
        future: F,
    ) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let thread = match runtime {
            Some(handle) => {
                handle.spawn(future);
                None
            }
            None => {
                let spawned = thread::Builder::new()
                    .name("paxkit-loop".into())
                    .spawn(move || {
                        match tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                        {
                            Ok(rt) => rt.block_on(future),
                            Err(e) => error!(error = %e, "failed to build event-loop runtime"),
                        }
                    });
                match spawned {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        error!(error = %e, "failed to spawn event-loop thread");
                        None
                    }
                }
            }
        };
        Self { cancel, thread }
    }

    /// Cancel the loop and, when we own the worker thread, wait for it to
    /// finish draining.
    pub(crate) fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}
