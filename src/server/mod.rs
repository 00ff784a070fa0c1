//! The accepting side.
//!
//! [`RpcServer`] owns a [`Dispatcher`] and serves every accepted connection
//! in one of two modes. [`ServeMode::Sequential`] answers one request at a
//! time on the connection task, which is the shape connection-per-call
//! clients produce. [`ServeMode::Pipelined`] decodes frames as they arrive,
//! runs each request on its own task bounded by
//! [`ServerConfig::max_inflight`](crate::config::ServerConfig), and writes
//! responses in completion order.

mod dispatch;
pub use dispatch::{Dispatcher, DuplicateMethod, ServiceMap, ServiceTable};

use crate::codec::{Codec, MsgpCodec};
use crate::config::ServerConfig;
use crate::error::RemoteError;
use crate::frame::{self, FrameDecoder};
use crate::message::{Request, Response};
use crate::net::{RpcStream, io_with_timeout, listen_on_addr};
use crate::registry::{NamingError, NamingService, ServiceRegistry};
use captains_log::filter::LogFilter;
use futures::FutureExt;
use futures::future::{AbortHandle, Abortable};
use log::*;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Semaphore, mpsc, watch};

/// How requests on one connection are driven.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServeMode {
    /// Read a request, dispatch it inline, write the response, repeat.
    Sequential,
    /// Dispatch every decoded request on its own task and answer in
    /// completion order.
    Pipelined,
}

pub struct RpcServer {
    dispatcher: Arc<Dispatcher>,
    config: ServerConfig,
    logger: Arc<LogFilter>,
    conn_ref_count: Arc<()>,
    listeners_abort: Vec<(AbortHandle, String)>,
    server_close_tx: Option<watch::Sender<()>>,
    server_close_rx: watch::Receiver<()>,
}

impl RpcServer {
    pub fn new(services: ServiceMap, config: ServerConfig) -> Self {
        let (tx, rx) = watch::channel(());
        Self {
            dispatcher: Arc::new(Dispatcher::new(services)),
            config,
            logger: Arc::new(LogFilter::new()),
            conn_ref_count: Arc::new(()),
            listeners_abort: Vec::new(),
            server_close_tx: Some(tx),
            server_close_rx: rx,
        }
    }

    /// Connection-level logs go through this filter.
    pub fn set_log_level(&self, level: log::Level) {
        self.logger.set_level(level);
    }

    /// Binds `addr` and starts accepting in the background. Returns the
    /// bound address, which is what gets published to the registry when
    /// `addr` carried port 0.
    pub async fn listen(&mut self, addr: &str, mode: ServeMode) -> io::Result<String> {
        let listener = listen_on_addr(addr).await?;
        let local_addr = listener.local_addr()?.to_string();
        let (abort_handle, abort_registration) = AbortHandle::new_pair();
        let listener_info = format!("listener {}", local_addr);
        let dispatcher = self.dispatcher.clone();
        let config = self.config.clone();
        let logger = self.logger.clone();
        let conn_ref_count = self.conn_ref_count.clone();
        let server_close_rx = self.server_close_rx.clone();
        debug!("listening on {} ({:?})", local_addr, mode);
        let accept_loop = Abortable::new(
            async move {
                loop {
                    match listener.accept().await {
                        Err(e) => {
                            warn!("listener accept error: {}", e);
                            return;
                        }
                        Ok((stream, _)) => {
                            let guard = conn_ref_count.clone();
                            let dispatcher = dispatcher.clone();
                            let config = config.clone();
                            let logger = logger.clone();
                            let close_rx = server_close_rx.clone();
                            tokio::spawn(async move {
                                let _guard = guard;
                                match mode {
                                    ServeMode::Sequential => {
                                        serve_sequential(
                                            stream, dispatcher, config, logger, close_rx,
                                        )
                                        .await
                                    }
                                    ServeMode::Pipelined => {
                                        serve_pipelined(
                                            stream, dispatcher, config, logger, close_rx,
                                        )
                                        .await
                                    }
                                }
                            });
                        }
                    }
                }
            },
            abort_registration,
        );
        tokio::spawn(accept_loop);
        self.listeners_abort.push((abort_handle, listener_info));
        Ok(local_addr)
    }

    /// Publishes every registered service key at `advertise_addr`.
    pub async fn register_services<N: NamingService>(
        &self, registry: &ServiceRegistry<N>, advertise_addr: &str,
    ) -> Result<(), NamingError> {
        for key in self.dispatcher.service_keys() {
            let _ = registry.register(&key, advertise_addr).await?;
        }
        Ok(())
    }

    #[inline]
    fn alive_conns(&self) -> usize {
        Arc::strong_count(&self.conn_ref_count) - 1
    }

    /// Gracefully close the server.
    ///
    /// Steps:
    /// - abort the listener tasks
    /// - drop the close channel to notify connection tasks; in-flight
    ///   requests still get their responses
    /// - wait for connections to drain, bounded by
    ///   `ServerConfig.server_close_wait`
    pub async fn close(&mut self) {
        for (handle, info) in self.listeners_abort.drain(..) {
            handle.abort();
            logger_info!(self.logger, "{} has closed", info);
        }
        let _ = self.server_close_tx.take();

        let start = Instant::now();
        let mut alive = self.alive_conns();
        while alive > 0 {
            if start.elapsed() > self.config.server_close_wait {
                logger_warn!(
                    self.logger,
                    "closed as wait too long for all conn closed voluntarily ({} conn left)",
                    alive
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            alive = self.alive_conns();
        }
        logger_info!(self.logger, "server closed");
    }
}

/// Runs `f` against the server close signal; `None` means the server is
/// closing.
async fn unless_closed<F>(f: F, close_rx: &mut watch::Receiver<()>) -> Option<F::Output>
where
    F: Future,
{
    let f = f.fuse();
    futures::pin_mut!(f);
    let close = close_rx.changed().fuse();
    futures::pin_mut!(close);
    futures::select! {
        r = f => Some(r),
        _ = close => None,
    }
}

/// Picks the deadline for the next read. A started frame must keep
/// arriving within `read_timeout`; between requests the connection may sit
/// quiet up to `idle_timeout`.
#[inline]
fn read_wait(config: &ServerConfig, pending: usize) -> Duration {
    if pending > 0 { config.read_timeout } else { config.idle_timeout }
}

/// Folds one read outcome into bytes gained or a reason to stop serving.
fn classify_read(
    read: Option<io::Result<usize>>, pending: usize, waited: Duration,
) -> Result<usize, String> {
    match read {
        None => Err("server closing".to_string()),
        Some(Ok(0)) if pending > 0 => {
            Err(format!("peer ended mid frame with {} bytes pending", pending))
        }
        Some(Ok(0)) => Err("closed by peer".to_string()),
        Some(Ok(n)) => Ok(n),
        Some(Err(e)) if e.kind() == io::ErrorKind::TimedOut => {
            if pending > 0 {
                Err(format!("frame stalled for {:?} with {} bytes pending", waited, pending))
            } else {
                Err(format!("idle for {:?}", waited))
            }
        }
        Some(Err(e)) => Err(format!("read failed: {}", e)),
    }
}

/// Encodes a response frame. On failure substitutes an in-band error so the
/// caller is not left waiting on a silently skipped reply.
fn encode_response(codec: &MsgpCodec, resp: &Response) -> Result<Vec<u8>, crate::error::RpcError> {
    match frame::encode_frame(codec, resp) {
        Ok(buf) => Ok(buf),
        Err(e) => {
            error!("response {} encoding failed: {}", resp.request_id, e);
            let fallback = Response::err(
                resp.request_id.clone(),
                RemoteError::app("response serialization failed"),
            );
            frame::encode_frame(codec, &fallback)
        }
    }
}

async fn serve_sequential(
    stream: TcpStream, dispatcher: Arc<Dispatcher>, config: ServerConfig, logger: Arc<LogFilter>,
    mut close_rx: watch::Receiver<()>,
) {
    let mut stream = RpcStream::new(stream);
    logger_debug!(logger, "conn {} serving sequential", stream);
    let codec = MsgpCodec::default();
    let mut decoder = FrameDecoder::new();
    loop {
        let payload = loop {
            match decoder.next_frame() {
                Err(e) => {
                    logger_warn!(logger, "conn {}: {}", stream, e);
                    return;
                }
                Ok(Some(payload)) => break payload,
                Ok(None) => {}
            }
            let wait = read_wait(&config, decoder.pending());
            let read =
                unless_closed(stream.read_buf_timeout(decoder.buf_mut(), wait), &mut close_rx)
                    .await;
            match classify_read(read, decoder.pending(), wait) {
                Ok(_) => {}
                Err(reason) => {
                    logger_debug!(logger, "conn {} done: {}", stream, reason);
                    return;
                }
            }
        };
        let req: Request = match codec.decode(&payload) {
            Ok(req) => req,
            Err(_) => {
                logger_warn!(logger, "conn {} sent an undecodable request", stream);
                return;
            }
        };
        logger_trace!(logger, "conn {} {}", stream, req);
        let resp = dispatcher.dispatch(req).await;
        let buf = match encode_response(&codec, &resp) {
            Ok(buf) => buf,
            Err(_) => return,
        };
        let write = async {
            stream.write_timeout(&buf, config.write_timeout).await?;
            stream.flush_timeout(config.write_timeout).await
        };
        if let Err(e) = write.await {
            logger_debug!(logger, "conn {} write failed: {}", stream, e);
            return;
        }
    }
}

async fn serve_pipelined(
    stream: TcpStream, dispatcher: Arc<Dispatcher>, config: ServerConfig, logger: Arc<LogFilter>,
    mut close_rx: watch::Receiver<()>,
) {
    let peer = match stream.peer_addr() {
        Ok(a) => a.to_string(),
        Err(_) => "unknown".to_string(),
    };
    logger_debug!(logger, "conn peer {} serving pipelined", peer);
    let (mut rd, wr) = stream.into_split();
    let (resp_tx, resp_rx) = mpsc::channel::<Response>(config.max_inflight);
    let writer =
        tokio::spawn(write_responses(wr, resp_rx, config.clone(), logger.clone(), peer.clone()));

    let limiter = Arc::new(Semaphore::new(config.max_inflight));
    let codec = MsgpCodec::default();
    let mut decoder = FrameDecoder::new();
    'recv: loop {
        let payload = loop {
            match decoder.next_frame() {
                Err(e) => {
                    logger_warn!(logger, "conn peer {}: {}", peer, e);
                    break 'recv;
                }
                Ok(Some(payload)) => break payload,
                Ok(None) => {}
            }
            let wait = read_wait(&config, decoder.pending());
            let read = unless_closed(
                async { io_with_timeout!(wait, rd.read_buf(decoder.buf_mut())) },
                &mut close_rx,
            )
            .await;
            match classify_read(read, decoder.pending(), wait) {
                Ok(_) => {}
                Err(reason) => {
                    logger_debug!(logger, "conn peer {} done: {}", peer, reason);
                    break 'recv;
                }
            }
        };
        let req: Request = match codec.decode(&payload) {
            Ok(req) => req,
            Err(_) => {
                logger_warn!(logger, "conn peer {} sent an undecodable request", peer);
                break 'recv;
            }
        };
        logger_trace!(logger, "conn peer {} {}", peer, req);
        // backpressure: stop reading when max_inflight requests are running
        let permit = match limiter.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break 'recv,
        };
        let dispatcher = dispatcher.clone();
        let resp_tx = resp_tx.clone();
        tokio::spawn(async move {
            let resp = dispatcher.dispatch(req).await;
            let _ = resp_tx.send(resp).await;
            drop(permit);
        });
    }
    // dropping our sender lets the writer drain in-flight responses and exit
    drop(resp_tx);
    if let Err(e) = writer.await {
        error!("conn peer {} writer task failed: {}", peer, e);
    }
}

async fn write_responses(
    wr: OwnedWriteHalf, mut resp_rx: mpsc::Receiver<Response>, config: ServerConfig,
    logger: Arc<LogFilter>, peer: String,
) {
    let mut writer = BufWriter::new(wr);
    let codec = MsgpCodec::default();
    while let Some(resp) = resp_rx.recv().await {
        if write_response(&mut writer, &codec, &resp, &config, &logger, &peer).await.is_err() {
            return;
        }
        // drain whatever completed in the meantime before paying for a flush
        while let Ok(resp) = resp_rx.try_recv() {
            if write_response(&mut writer, &codec, &resp, &config, &logger, &peer).await.is_err() {
                return;
            }
        }
        if let Err(e) = io_with_timeout!(config.write_timeout, writer.flush()) {
            logger_debug!(logger, "conn peer {} flush failed: {}", peer, e);
            return;
        }
    }
    logger_trace!(logger, "conn peer {} writer exits", peer);
    let _ = writer.shutdown().await;
}

async fn write_response(
    writer: &mut BufWriter<OwnedWriteHalf>, codec: &MsgpCodec, resp: &Response,
    config: &ServerConfig, logger: &LogFilter, peer: &str,
) -> Result<(), ()> {
    let buf = match encode_response(codec, resp) {
        Ok(buf) => buf,
        Err(_) => return Err(()),
    };
    logger_trace!(logger, "conn peer {} answering {}", peer, resp.request_id);
    match io_with_timeout!(config.write_timeout, writer.write_all(&buf)) {
        Ok(_) => Ok(()),
        Err(e) => {
            logger_debug!(logger, "conn peer {} write failed: {}", peer, e);
            Err(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_read() {
        let wait = Duration::from_secs(1);
        assert_eq!(classify_read(Some(Ok(8)), 0, wait), Ok(8));
        assert_eq!(classify_read(None, 0, wait), Err("server closing".to_string()));
        assert_eq!(classify_read(Some(Ok(0)), 0, wait), Err("closed by peer".to_string()));
        let mid = classify_read(Some(Ok(0)), 3, wait).expect_err("mid frame");
        assert!(mid.contains("3 bytes pending"));
        let idle =
            classify_read(Some(Err(io::ErrorKind::TimedOut.into())), 0, wait).expect_err("idle");
        assert!(idle.contains("idle"));
        let stalled = classify_read(Some(Err(io::ErrorKind::TimedOut.into())), 7, wait)
            .expect_err("stalled");
        assert!(stalled.contains("stalled"));
        assert!(classify_read(Some(Err(io::ErrorKind::ConnectionReset.into())), 0, wait).is_err());
    }

    #[test]
    fn test_read_wait_tracks_frame_state() {
        let config = ServerConfig {
            read_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(60),
            ..Default::default()
        };
        assert_eq!(read_wait(&config, 0), config.idle_timeout);
        assert_eq!(read_wait(&config, 5), config.read_timeout);
    }
}
