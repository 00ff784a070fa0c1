//! Pipelined transport.
//!
//! At most one persistent connection per address, shared by every
//! in-flight call. Requests are framed onto the shared write half;
//! a receive loop decodes response frames as they arrive and completes
//! the matching pending call by request id, so responses may return in
//! any order. Each call observes exactly one of: its response, a timeout,
//! or a connection error when the stream dies with calls outstanding.

use super::CallTransport;
use crate::codec::{Codec, MsgpCodec};
use crate::config::RpcConfig;
use crate::error::RpcError;
use crate::frame::{self, FrameDecoder};
use crate::message::{Request, Response};
use crate::net::{ZERO_TIME, connect_timeout, io_with_timeout, map_io_error};
use captains_log::filter::LogFilter;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex as AsyncMutex, oneshot};

pub struct PipelineTransport {
    config: RpcConfig,
    logger: Arc<LogFilter>,
    conns: AsyncMutex<HashMap<String, Arc<PipelineConn>>>,
}

impl PipelineTransport {
    pub fn new(config: RpcConfig) -> Self {
        Self {
            config,
            logger: Arc::new(LogFilter::new()),
            conns: AsyncMutex::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn set_log_level(&self, level: log::Level) {
        self.logger.set_level(level);
    }

    /// Reuses the live connection for `addr` or dials a fresh one,
    /// replacing a dead entry in place.
    async fn checkout(&self, addr: &str) -> Result<Arc<PipelineConn>, RpcError> {
        let mut conns = self.conns.lock().await;
        if let Some(conn) = conns.get(addr) {
            if conn.is_healthy() {
                return Ok(conn.clone());
            }
        }
        let conn = PipelineConn::connect(addr, &self.config, self.logger.clone()).await?;
        conns.insert(addr.to_string(), conn.clone());
        Ok(conn)
    }

    async fn evict(&self, addr: &str, dead: &Arc<PipelineConn>) {
        let mut conns = self.conns.lock().await;
        if let Some(conn) = conns.get(addr) {
            if Arc::ptr_eq(conn, dead) {
                conns.remove(addr);
            }
        }
    }
}

impl CallTransport for PipelineTransport {
    async fn send(&self, addr: &str, req: &Request) -> Result<Response, RpcError> {
        let conn = self.checkout(addr).await?;
        let r = conn.call(req, self.config.timeout).await;
        if let Err(RpcError::Connection(_)) = &r {
            self.evict(addr, &conn).await;
        }
        r
    }
}

#[derive(Default)]
struct Pending {
    map: HashMap<String, oneshot::Sender<Response>>,
    /// Set once when the receive loop dies; the reason every later call
    /// and drained waiter sees.
    closed: Option<String>,
}

pub struct PipelineConn {
    addr: String,
    logger: Arc<LogFilter>,
    codec: MsgpCodec,
    writer: AsyncMutex<BufWriter<OwnedWriteHalf>>,
    pending: Mutex<Pending>,
    write_timeout: Duration,
}

impl fmt::Display for PipelineConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipeline {}", self.addr)
    }
}

impl PipelineConn {
    async fn connect(
        addr: &str, config: &RpcConfig, logger: Arc<LogFilter>,
    ) -> Result<Arc<Self>, RpcError> {
        let stream = connect_timeout(addr, config.connect_timeout)
            .await
            .map_err(|e| map_io_error(e, "connect"))?;
        let _ = stream.set_nodelay(true);
        let (rd, wr) = stream.into_split();
        let conn = Arc::new(Self {
            addr: addr.to_string(),
            logger,
            codec: MsgpCodec::default(),
            writer: AsyncMutex::new(BufWriter::new(wr)),
            pending: Mutex::new(Pending::default()),
            write_timeout: config.timeout,
        });
        logger_debug!(conn.logger, "{} connected", conn);
        tokio::spawn(receive_loop(Arc::downgrade(&conn), rd));
        Ok(conn)
    }

    #[inline]
    fn is_healthy(&self) -> bool {
        self.pending.lock().expect("lock").closed.is_none()
    }

    fn close_reason(&self) -> String {
        match &self.pending.lock().expect("lock").closed {
            Some(reason) => reason.clone(),
            None => "connection closed".to_string(),
        }
    }

    /// Hands the response to its waiter. A late response whose caller
    /// already timed out has no entry left and is dropped.
    fn complete(&self, resp: Response) {
        let tx = self.pending.lock().expect("lock").map.remove(&resp.request_id);
        match tx {
            Some(tx) => {
                let _ = tx.send(resp);
            }
            None => {
                logger_trace!(self.logger, "{} dropped late response {}", self, resp.request_id);
            }
        }
    }

    /// Marks the connection dead and wakes every outstanding call with a
    /// connection error (their senders drop here).
    fn shutdown(&self, reason: String) {
        let mut pending = self.pending.lock().expect("lock");
        if pending.closed.is_none() {
            pending.closed = Some(reason);
        }
        pending.map.clear();
    }

    fn remove_pending(&self, request_id: &str) {
        self.pending.lock().expect("lock").map.remove(request_id);
    }

    async fn write_frame(&self, buf: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        io_with_timeout!(self.write_timeout, async {
            writer.write_all(buf).await?;
            writer.flush().await
        })
    }

    async fn call(&self, req: &Request, timeout: Duration) -> Result<Response, RpcError> {
        let buf = frame::encode_frame(&self.codec, req)?;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("lock");
            if let Some(reason) = &pending.closed {
                return Err(RpcError::Connection(reason.clone()));
            }
            pending.map.insert(req.request_id.clone(), tx);
        }
        if let Err(e) = self.write_frame(&buf).await {
            self.remove_pending(&req.request_id);
            return Err(map_io_error(e, "write request"));
        }
        logger_trace!(self.logger, "{} sent {}", self, req);

        if timeout == ZERO_TIME {
            match rx.await {
                Ok(resp) => return Ok(resp),
                Err(_) => return Err(RpcError::Connection(self.close_reason())),
            }
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(RpcError::Connection(self.close_reason())),
            Err(_) => {
                self.remove_pending(&req.request_id);
                Err(RpcError::Timeout)
            }
        }
    }
}

/// Owns the read half. Exits when the peer closes, the stream errors, a
/// frame is malformed, or every handle to the connection is gone.
async fn receive_loop(conn: Weak<PipelineConn>, mut rd: OwnedReadHalf) {
    let mut decoder = FrameDecoder::new();
    let reason = 'recv: loop {
        match rd.read_buf(decoder.buf_mut()).await {
            Ok(0) => break 'recv "closed by peer".to_string(),
            Ok(_) => {}
            Err(e) => break 'recv e.to_string(),
        }
        loop {
            match decoder.next_frame() {
                Ok(Some(payload)) => {
                    let Some(c) = conn.upgrade() else { return };
                    match c.codec.decode::<Response>(&payload) {
                        Ok(resp) => c.complete(resp),
                        Err(_) => break 'recv "undecodable response payload".to_string(),
                    }
                }
                Ok(None) => break,
                Err(e) => break 'recv e.to_string(),
            }
        }
    };
    if let Some(c) = conn.upgrade() {
        logger_debug!(c.logger, "{} receive loop ended: {}", c, reason);
        c.shutdown(reason);
    }
}
