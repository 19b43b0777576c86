use crate::context::AppContext;
use crate::options::ContaflixOptions;
use crate::service::{start_service, Service};
use crate::store::Store;
use crate::tcp::TcpClientHandler;
use anyhow::Context;
use libc::{getppid, kill, SIGUSR1};
use log::{info, warn};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Accepts connections and serves each one with its own client handler service.
pub struct ContaflixTcpListener<S> {
    /// The inner tokio TCP listener.
    inner: TcpListener,
    context: AppContext<S>,

    /// Parent of every client handler's token.
    handlers_token: CancellationToken,

    /// Set of asynchronous tasks handling client streams.
    handlers: JoinSet<Result<(), anyhow::Error>>,
}

impl<S: Store> ContaflixTcpListener<S> {
    /// Bind the listener to the configured address.
    ///
    /// # Arguments
    ///
    /// `options` - Host and port to bind, and whether to signal the parent process once bound.
    /// `context` - Shared by every connection.
    ///
    pub async fn new(options: &ContaflixOptions, context: AppContext<S>) -> Result<Self, anyhow::Error> {
        let (host, port) = (options.host(), options.port());
        let inner = TcpListener::bind(format!("{host}:{port}"))
            .await
            .with_context(|| format!("binding {host}:{port}"))?;
        info!(addr:? = inner.local_addr()?; "Accepting TCP connections");

        if options.signal_parent_ready() {
            match unsafe { kill(getppid(), SIGUSR1) } {
                0 => info!("Successfully signalled ready to parent process"),
                _ => warn!("Failed to send ready signal to parent process"),
            }
        }

        let handlers_token = context.shutdown_token().child_token();
        Ok(Self { inner, context, handlers_token, handlers: JoinSet::new() })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, anyhow::Error> {
        self.inner.local_addr().context("reading local address")
    }

    /// Collect handlers of closed connections.
    fn reap(&mut self) {
        while let Some(result) = self.handlers.try_join_next() {
            log_handler_result(result);
        }
    }
}

fn log_handler_result(result: Result<Result<(), anyhow::Error>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(e:?; "Client handler failed"),
        Err(e) => warn!(e:?; "Client handler aborted"),
    }
}

impl<S: Store> Service for ContaflixTcpListener<S> {
    type TaskOutput = Result<(TcpStream, SocketAddr), anyhow::Error>;

    async fn poll_task(&mut self) -> Self::TaskOutput {
        self.inner.accept().await.context("failed to accept TCP connections")
    }

    async fn on_task_ready(&mut self, conn: Self::TaskOutput) -> Result<(), anyhow::Error> {
        self.reap();

        // A failed accept only concerns that one connection.
        let (stream, addr) = match conn {
            Ok(conn) => conn,
            Err(e) => {
                warn!(e:?; "Accepting connection failed");
                return Ok(());
            }
        };
        info!(addr:?; "Accepted connection");

        let token = self.handlers_token.child_token();
        let handler = TcpClientHandler::new(stream, addr, self.context.clone(), token.clone());
        self.handlers.spawn(start_service("TCP-handler", handler, token));
        Ok(())
    }

    async fn on_terminate(&mut self) -> Result<(), anyhow::Error> {
        self.handlers_token.cancel();
        while let Some(result) = self.handlers.join_next().await {
            log_handler_result(result);
        }
        Ok(())
    }
}
