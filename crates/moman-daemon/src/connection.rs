//! One-shot framed conversations over Unix domain sockets.
//!
//! A message ends when its sender shuts down the write half of the
//! stream, so reading means draining to EOF and writing means
//! write-all followed by a half-close. Each connection carries at most
//! one request and one reply.

use std::io;
use std::path::Path;
use std::time::Duration;

use moman_core::{
    decode_cmd, decode_response, encode_cmd, encode_response, Cmd, CodecError, ErrorCode, Response,
};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

/// Upper bound on a single message; anything larger is a protocol
/// violation, not a legitimate payload.
const MAX_MESSAGE_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("socket does not exist")]
    SocketDoesntExist,
    #[error("could not connect to socket: {0}")]
    CouldntConnect(io::Error),
    #[error("timed out waiting for peer")]
    Timeout,
    #[error("message exceeds {MAX_MESSAGE_BYTES} bytes")]
    TooLarge,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl ConnError {
    /// Wire error code this failure maps to when reported back to a
    /// client.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ConnError::SocketDoesntExist => ErrorCode::SocketDoesntExist,
            ConnError::CouldntConnect(_) => ErrorCode::SocketCouldntConnect,
            ConnError::Timeout => ErrorCode::SocketTimeout,
            ConnError::TooLarge | ConnError::Codec(_) => ErrorCode::BadPayload,
            ConnError::Io(_) => ErrorCode::OtherError,
        }
    }
}

#[derive(Debug)]
pub struct Connection {
    stream: UnixStream,
    read_timeout: Duration,
}

impl Connection {
    pub fn new(stream: UnixStream, read_timeout: Duration) -> Self {
        Self {
            stream,
            read_timeout,
        }
    }

    pub async fn connect(path: &Path, read_timeout: Duration) -> Result<Self, ConnError> {
        match UnixStream::connect(path).await {
            Ok(stream) => Ok(Self::new(stream, read_timeout)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(ConnError::SocketDoesntExist),
            Err(err) => Err(ConnError::CouldntConnect(err)),
        }
    }

    /// Drains the stream to EOF under one deadline covering the whole
    /// message, so a peer dripping bytes cannot hold the connection
    /// open past the timeout.
    async fn read_message(&mut self) -> Result<Vec<u8>, ConnError> {
        let stream = &mut self.stream;
        let drain = async move {
            let mut buf = Vec::with_capacity(1024);
            let mut chunk = [0u8; 1024];
            loop {
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    return Ok::<_, ConnError>(buf);
                }
                if buf.len() + n > MAX_MESSAGE_BYTES {
                    return Err(ConnError::TooLarge);
                }
                buf.extend_from_slice(&chunk[..n]);
            }
        };
        tokio::time::timeout(self.read_timeout, drain)
            .await
            .map_err(|_| ConnError::Timeout)?
    }

    async fn write_message(&mut self, bytes: &[u8]) -> Result<(), ConnError> {
        self.stream.write_all(bytes).await?;
        // Half-close signals end-of-message; the read half stays open
        // for the reply.
        self.stream.shutdown().await?;
        Ok(())
    }

    pub async fn recv_cmd(&mut self) -> Result<Cmd, ConnError> {
        let bytes = self.read_message().await?;
        Ok(decode_cmd(&bytes)?)
    }

    pub async fn send_cmd(&mut self, cmd: &Cmd) -> Result<(), ConnError> {
        self.write_message(&encode_cmd(cmd)?).await
    }

    pub async fn recv_response(&mut self) -> Result<Response, ConnError> {
        let bytes = self.read_message().await?;
        Ok(decode_response(&bytes)?)
    }

    pub async fn send_response(&mut self, response: &Response) -> Result<(), ConnError> {
        self.write_message(&encode_response(response)?).await
    }
}

/// Connects to `path`, sends `cmd` and waits for the reply.
pub async fn request(path: &Path, cmd: &Cmd, timeout: Duration) -> Result<Response, ConnError> {
    let mut conn = Connection::connect(path, timeout).await?;
    conn.send_cmd(cmd).await?;
    conn.recv_response().await
}
