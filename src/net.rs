//! TCP plumbing with per-operation timeouts.
//!
//! Registry data is always `host:port`, so there is no unix-socket path
//! here. A zero `Duration` disables the timeout for that operation.

use crate::error::RpcError;
use bytes::BytesMut;
use log::*;
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufStream},
    net::{TcpListener, TcpStream},
};

pub const ZERO_TIME: Duration = Duration::from_secs(0);

const STREAM_BUF_SIZE: usize = 8 * 1024;

// paths are fully qualified so call sites in other modules need no imports
macro_rules! io_with_timeout {
    ($timeout: expr, $f: expr) => {{
        if $timeout == crate::net::ZERO_TIME {
            $f.await
        } else {
            match tokio::time::timeout($timeout, $f).await {
                Ok(Ok(r)) => Ok(r),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(std::io::ErrorKind::TimedOut.into()),
            }
        }
    }};
}
pub(crate) use io_with_timeout;

#[inline]
pub async fn connect_timeout(addr: &str, connect_timeout: Duration) -> io::Result<TcpStream> {
    io_with_timeout!(connect_timeout, TcpStream::connect(addr))
}

pub async fn listen_on_addr(addr: &str) -> io::Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => {
            info!("listen on {:?}", addr);
            Ok(listener)
        }
        Err(e) => {
            error!("bind addr {:?} err: {}", addr, e);
            Err(e)
        }
    }
}

/// Buffered stream whose read/write operations take an explicit timeout.
pub struct RpcStream {
    peer: String,
    stream: BufStream<TcpStream>,
}

impl fmt::Display for RpcStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer {}", self.peer)
    }
}

impl RpcStream {
    pub fn new(stream: TcpStream) -> Self {
        let peer = match stream.peer_addr() {
            Ok(a) => a.to_string(),
            Err(_) => "unknown".to_string(),
        };
        Self { peer, stream: BufStream::with_capacity(STREAM_BUF_SIZE, STREAM_BUF_SIZE, stream) }
    }

    pub async fn connect(addr: &str, d: Duration) -> io::Result<Self> {
        let stream = connect_timeout(addr, d).await?;
        Ok(Self::new(stream))
    }

    #[inline]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    #[inline(always)]
    pub async fn read_exact_timeout(
        &mut self, dst: &mut [u8], read_timeout: Duration,
    ) -> io::Result<usize> {
        io_with_timeout!(read_timeout, self.stream.read_exact(dst))
    }

    /// Reads whatever is available into `buf`; returns 0 on EOF.
    #[inline(always)]
    pub async fn read_buf_timeout(
        &mut self, buf: &mut BytesMut, read_timeout: Duration,
    ) -> io::Result<usize> {
        io_with_timeout!(read_timeout, self.stream.read_buf(buf))
    }

    pub async fn read_to_end_timeout(
        &mut self, buf: &mut Vec<u8>, read_timeout: Duration,
    ) -> io::Result<usize> {
        io_with_timeout!(read_timeout, self.stream.read_to_end(buf))
    }

    #[inline(always)]
    pub async fn write_timeout(&mut self, src: &[u8], write_timeout: Duration) -> io::Result<()> {
        io_with_timeout!(write_timeout, self.stream.write_all(src))
    }

    #[inline(always)]
    pub async fn flush_timeout(&mut self, write_timeout: Duration) -> io::Result<()> {
        io_with_timeout!(write_timeout, self.stream.flush())
    }

    /// Half-close: flushes buffered output and shuts the write side down,
    /// leaving the read side open for the response.
    pub async fn shutdown_write(&mut self) -> io::Result<()> {
        self.stream.flush().await?;
        self.stream.get_mut().shutdown().await
    }

    pub async fn close(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

/// Collapses IO failures into the two kinds the retry loop distinguishes:
/// timeouts are retryable, everything else is a connection error.
pub fn map_io_error(e: io::Error, what: &str) -> RpcError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => RpcError::Timeout,
        _ => RpcError::Connection(format!("{}: {}", what, e)),
    }
}
