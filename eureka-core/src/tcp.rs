//! TCP transport: JSON lines over tokio TcpStream.
//! A pump task owns the socket; the session talks to it through mpsc queues, which keeps
//! `Session::recv` cancel-safe.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

use crate::endpoint::{Endpoint, Protocol};
use crate::protocol::{decode_line, encode_line, ClientMessage, ServerMessage};
use crate::transport::{Session, Transport};
use crate::DiscoveryError;

const QUEUE_DEPTH: usize = 64;

#[derive(Clone, Debug)]
pub struct TcpTransport {
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn Session>, DiscoveryError> {
        if endpoint.protocol == Protocol::Tls {
            return Err(DiscoveryError::connection(endpoint, "tls is not supported by the tcp transport"));
        }
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(endpoint.address()))
            .await
            .map_err(|_| DiscoveryError::connection(endpoint, "connect timed out"))?
            .map_err(|e| DiscoveryError::connection(endpoint, e))?;
        let _ = stream.set_nodelay(true);
        debug!(endpoint = %endpoint, "tcp session open");

        let (tx_recv, rx_recv) = mpsc::channel(QUEUE_DEPTH);
        let (tx_send, rx_send) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(run_line_pump(stream, endpoint.clone(), tx_recv, rx_send));
        Ok(Box::new(TcpSession {
            rx: rx_recv,
            tx: tx_send,
            endpoint: endpoint.clone(),
        }))
    }
}

struct TcpSession {
    rx: mpsc::Receiver<Result<ServerMessage, DiscoveryError>>,
    tx: mpsc::Sender<Vec<u8>>,
    endpoint: Endpoint,
}

#[async_trait]
impl Session for TcpSession {
    async fn send(&mut self, msg: ClientMessage) -> Result<(), DiscoveryError> {
        let line = encode_line(&msg)?;
        self.tx
            .send(line)
            .await
            .map_err(|_| DiscoveryError::connection(&self.endpoint, "session closed"))
    }

    async fn recv(&mut self) -> Result<Option<ServerMessage>, DiscoveryError> {
        match self.rx.recv().await {
            Some(Ok(msg)) => Ok(Some(msg)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

/// Reads lines into `tx_recv`, writes queued lines from `rx_send`. Ends when either side closes.
async fn run_line_pump(
    stream: TcpStream,
    endpoint: Endpoint,
    tx_recv: mpsc::Sender<Result<ServerMessage, DiscoveryError>>,
    mut rx_send: mpsc::Receiver<Vec<u8>>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let mapped = match line {
                    Ok(None) => break,
                    Ok(Some(l)) if l.trim().is_empty() => continue,
                    Ok(Some(l)) => decode_line::<ServerMessage>(l.as_bytes()),
                    Err(e) => Err(DiscoveryError::connection(&endpoint, e)),
                };
                let fatal = mapped.is_err();
                if tx_recv.send(mapped).await.is_err() || fatal {
                    break;
                }
            }
            out = rx_send.recv() => {
                let Some(bytes) = out else { break };
                if let Err(e) = write_half.write_all(&bytes).await {
                    let _ = tx_recv.send(Err(DiscoveryError::connection(&endpoint, e))).await;
                    break;
                }
            }
        }
    }
    let _ = write_half.shutdown().await;
    debug!(endpoint = %endpoint, "tcp session closed");
}
