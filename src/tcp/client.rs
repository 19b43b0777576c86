use crate::io::{read_object, write_object};
use crate::messaging::{Request, Response};
use anyhow::{anyhow, Context};
use std::ops::DerefMut;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Options for creating a TCP client.
#[derive(Debug, Clone)]
pub struct TcpClientOptions {
    /// The host to connect to.
    pub host: String,

    /// The port to connect on.
    pub port: u16,
}

/// The TCP client used to communicate with the server.
#[derive(Debug)]
pub struct ContaflixTcpClient {
    /// The TCP stream once connected.
    stream: Mutex<TcpStream>,
}

impl ContaflixTcpClient {
    /// Connect to the server.
    pub async fn connect(options: TcpClientOptions) -> Result<Self, anyhow::Error> {
        let address = format!("{}:{}", options.host, options.port);
        let stream = TcpStream::connect(&address)
            .await
            .with_context(|| format!("failed to connect to {address}"))?;
        Ok(Self { stream: Mutex::new(stream) })
    }

    /// Send a request and wait for its response.
    ///
    /// Requests from concurrent callers are sent one after the other on the same connection.
    ///
    pub async fn request(&self, request: &Request) -> Result<Response, anyhow::Error> {
        let mut stream = self.stream.lock().await;
        write_object(stream.deref_mut(), request).await.context("sending request over TCP")?;
        read_object(stream.deref_mut())
            .await
            .context("receiving response over TCP")?
            .ok_or_else(|| anyhow!("server closed the connection"))
    }
}
