use anyhow::Context;
use log::{debug, trace};
use std::fmt::Debug;
use std::future::{pending, Future};
use tokio::select;
use tokio_util::sync::CancellationToken;

/// A long-running part of the server.
///
/// The service loop repeatedly polls the service for its next task output and hands it back to
/// the service, until the service's cancellation token fires.
///
pub trait Service {
    type TaskOutput: Debug + Send;

    fn poll_task(&mut self) -> impl Future<Output = Self::TaskOutput> + Send {
        pending()
    }

    #[allow(unused_variables)]
    fn on_task_ready(&mut self, output: Self::TaskOutput) -> impl Future<Output = Result<(), anyhow::Error>> + Send {
        async { Ok(()) }
    }

    fn on_terminate(&mut self) -> impl Future<Output = Result<(), anyhow::Error>> + Send {
        async { Ok(()) }
    }
}

/// Run a service until `token` is cancelled.
///
/// Cancellation is checked before every poll, so a service always gets to terminate even when it
/// has output ready. An error handling output stops the service without calling `on_terminate`.
///
pub fn start_service<N, S>(
    name: N,
    mut service: S,
    token: CancellationToken,
) -> impl Future<Output = Result<(), anyhow::Error>> + Send
where
    N: Into<String>,
    S: Service + Send,
{
    let name = name.into();

    async move {
        debug!(service = name; "Starting");

        loop {
            select! {
                biased;

                _ = token.cancelled() => {
                    debug!(service = name; "Terminating");
                    service.on_terminate().await.with_context(|| format!("{name}: termination handling failed"))?;
                    break;
                },

                value = service.poll_task() => {
                    trace!(service = name, value:?; "Task ready");
                    service.on_task_ready(value).await.with_context(|| format!("{name}: task ready handling failed"))?;
                },
            }
        }

        debug!(service = name; "Completed");
        Ok(())
    }
}
