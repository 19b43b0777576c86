use anyhow::Context;
use tokio::runtime::Runtime;

/// The multi-threaded runtime the server runs on.
///
/// # Arguments
///
/// `worker_threads` - Number of runtime threads, one per core when `None`.
///
pub fn async_runtime(worker_threads: Option<usize>) -> Result<Runtime, anyhow::Error> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(threads) = worker_threads {
        builder.worker_threads(threads.max(1));
    }
    builder
        .thread_name("contaflix-worker")
        .enable_all()
        .build()
        .context("failed to build async Tokio runtime")
}
