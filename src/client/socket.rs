//! Connection-per-call transport.
//!
//! One TCP connection per physical attempt: write the framed request,
//! half-close the write side, read the response stream to EOF, decode
//! exactly one frame. No state survives the call, which is what makes the
//! strategy simple and the reason it pays a connection setup per attempt.

use super::CallTransport;
use crate::codec::{Codec, MsgpCodec};
use crate::config::RpcConfig;
use crate::error::RpcError;
use crate::frame;
use crate::message::{Request, Response};
use crate::net::{RpcStream, map_io_error};
use log::*;

pub struct SocketTransport {
    config: RpcConfig,
    codec: MsgpCodec,
}

impl SocketTransport {
    pub fn new(config: RpcConfig) -> Self {
        Self { config, codec: MsgpCodec::default() }
    }
}

impl CallTransport for SocketTransport {
    async fn send(&self, addr: &str, req: &Request) -> Result<Response, RpcError> {
        let frame = frame::encode_frame(&self.codec, req)?;
        let mut stream = RpcStream::connect(addr, self.config.connect_timeout)
            .await
            .map_err(|e| map_io_error(e, "connect"))?;
        stream
            .write_timeout(&frame, self.config.timeout)
            .await
            .map_err(|e| map_io_error(e, "write request"))?;
        stream.shutdown_write().await.map_err(|e| map_io_error(e, "shutdown write"))?;

        let mut buf = Vec::with_capacity(4 * 1024);
        stream
            .read_to_end_timeout(&mut buf, self.config.timeout)
            .await
            .map_err(|e| map_io_error(e, "read response"))?;
        let payload = frame::decode_single(&buf)?;
        let resp: Response = self
            .codec
            .decode(payload)
            .map_err(|_| RpcError::framing("undecodable response payload"))?;
        trace!("{} answered by {} ({} bytes)", req, stream.peer(), buf.len());
        Ok(resp)
    }
}
