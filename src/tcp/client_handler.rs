use crate::context::AppContext;
use crate::io::{read_object, write_object};
use crate::messaging::{Request, Response};
use crate::service::Service;
use crate::store::Store;
use anyhow::Context;
use log::{debug, trace};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Serves the requests of one connection, one at a time, until the client hangs up.
pub struct TcpClientHandler<S> {
    stream: TcpStream,
    addr: SocketAddr,
    context: AppContext<S>,

    /// The handler's own token, cancelled when the client closes the connection.
    token: CancellationToken,
}

impl<S: Store> TcpClientHandler<S> {
    pub fn new(stream: TcpStream, addr: SocketAddr, context: AppContext<S>, token: CancellationToken) -> Self {
        Self { stream, addr, context, token }
    }
}

impl<S: Store> Service for TcpClientHandler<S> {
    type TaskOutput = Result<Option<serde_json::Value>, anyhow::Error>;

    async fn poll_task(&mut self) -> Self::TaskOutput {
        read_object(&mut self.stream)
            .await
            .context("receiving request over TCP failed")
    }

    async fn on_task_ready(&mut self, request: Self::TaskOutput) -> Result<(), anyhow::Error> {
        let Some(request) = request? else {
            debug!(addr:? = self.addr; "Client closed the connection");
            self.token.cancel();
            return Ok(());
        };

        // A well-framed but unknown request is answered, the connection stays open.
        let response = match serde_json::from_value::<Request>(request) {
            Ok(request) => self.context.handle(request).await,
            Err(e) => Response::Error { message: format!("invalid request: {e}") },
        };
        trace!(response:?; "Sending response over TCP");
        write_object(&mut self.stream, &response)
            .await
            .context("sending response over TCP failed")
    }
}
