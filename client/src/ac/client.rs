use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;
use wgac_shared::ac::{Command, MAX_MESSAGE_LEN, Message};

use super::AcError;

/// One TCP connection to an auto-configure server
pub struct AcConnection {
    stream: TcpStream,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    io_timeout: Duration,
}

impl AcConnection {
    pub async fn connect(
        address: &str,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> Result<Self, AcError> {
        let stream = match timeout(connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(AcError::Connect {
                    address: address.to_string(),
                    source,
                });
            }
            Err(_) => return Err(AcError::Timeout("connecting")),
        };

        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;
        debug!("Connected to {} from {}", remote_addr, local_addr);

        Ok(Self {
            stream,
            local_addr,
            remote_addr,
            io_timeout,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    async fn send(&mut self, message: &Message) -> Result<(), AcError> {
        let data = message.encode();
        timeout(self.io_timeout, self.stream.write_all(data.as_bytes()))
            .await
            .map_err(|_| AcError::Timeout("sending"))??;
        debug!(">>> {} sent to {}", message.cmd, self.remote_addr);
        Ok(())
    }

    /// A reply is whatever a single read of up to [`MAX_MESSAGE_LEN`] returns.
    async fn recv(&mut self) -> Result<Message, AcError> {
        let mut buf = vec![0u8; MAX_MESSAGE_LEN];
        let n = timeout(self.io_timeout, self.stream.read(&mut buf))
            .await
            .map_err(|_| AcError::Timeout("waiting for reply"))??;
        if n == 0 {
            return Err(AcError::Closed);
        }

        let reply = Message::decode(&buf[..n])?;
        if reply.cmd == Command::Unknown {
            debug!("<<< UNKNOWN message received from {}", self.remote_addr);
        } else {
            debug!("<<< {} received from {}", reply.cmd, self.remote_addr);
        }
        Ok(reply)
    }

    /// Send `message` and wait for the reply; a `NOK` reply is an error.
    pub async fn exchange(&mut self, message: &Message) -> Result<Message, AcError> {
        self.send(message).await?;
        let reply = self.recv().await?;
        if reply.cmd == Command::Nok {
            return Err(AcError::Rejected(message.cmd));
        }
        Ok(reply)
    }

    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }
}
