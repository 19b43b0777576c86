use crate::clock::{Clock, SystemClock};
use crate::context::AppContext;
use crate::exe::{Janitor, QueueProcessor};
use crate::options::ContaflixOptions;
use crate::service::start_service;
use crate::signal_listener::SignalListener;
use crate::store::{InMemoryStore, SeedData};
use crate::tcp::ContaflixTcpListener;
use anyhow::Context;
use log::{error, info};
use std::future::Future;
use std::sync::Arc;
use tokio::try_join;
use tokio_util::sync::CancellationToken;

/// The server: TCP listener, queue processor, janitor and signal listener sharing one context.
pub struct Contaflix {
    options: ContaflixOptions,
}

impl Contaflix {
    pub fn new(options: ContaflixOptions) -> Self {
        Self { options }
    }

    /// Run until SIGINT or SIGTERM, or until a service fails.
    pub async fn run(self) -> Result<(), anyhow::Error> {
        let shutdown = CancellationToken::new();

        let store = InMemoryStore::new();
        if let Some(path) = &self.options.seed_file {
            store.seed(SeedData::from_file(path)?).await;
            info!(path:?; "Store seeded");
        }

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let context = AppContext::new(store.clone(), self.options.clone(), clock.clone(), shutdown.clone());

        let tcp = ContaflixTcpListener::new(&self.options, context.clone()).await?;
        let janitor = Janitor::new(
            store.clone(),
            context.dispatcher.clone(),
            clock.clone(),
            context.audit.clone(),
            self.options.worker_offline_after(),
            self.options.janitor_interval(),
        );
        let signals = SignalListener::new(shutdown.clone())?;

        let processor = async {
            if !self.options.queue_processor_enabled() {
                info!("Queue processor disabled");
                return Ok::<(), anyhow::Error>(());
            }
            let processor = QueueProcessor::new(
                store.clone(),
                context.dispatcher.clone(),
                clock.clone(),
                self.options.processor_interval(),
                self.options.processor_concurrency(),
            )
            .await?;
            start_service("PROC", processor, shutdown.child_token()).await
        };

        try_join!(
            stop_on_error(start_service("TCP", tcp, shutdown.child_token()), &shutdown),
            stop_on_error(processor, &shutdown),
            stop_on_error(start_service("JANITOR", janitor, shutdown.child_token()), &shutdown),
            stop_on_error(start_service("SIG", signals, shutdown.child_token()), &shutdown),
        )
        .context("server stopped with an error")?;

        info!("ContaFlix stopped");
        Ok(())
    }
}

/// Shut the other services down when `service` fails.
async fn stop_on_error<F>(service: F, shutdown: &CancellationToken) -> Result<(), anyhow::Error>
where
    F: Future<Output = Result<(), anyhow::Error>>,
{
    let result = service.await;
    if let Err(e) = &result {
        error!(e:?; "Service failed, shutting down");
        shutdown.cancel();
    }
    result
}
