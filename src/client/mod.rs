//! Client-side call path.
//!
//! A [`ServiceProxy`] resolves one address per logical call through
//! discovery, then drives the retry state machine over a
//! [`CallTransport`]. The two built-in strategies are
//! [`SocketTransport`] (connection per call) and [`PipelineTransport`]
//! (persistent multiplexed connection per address); tests inject mocks at
//! the same seam.

use crate::codec::{SchemaCache, coerce_return};
use crate::config::RpcConfig;
use crate::error::RpcError;
use crate::message::{Request, Response, TypeDesc, Value, service_key};
use crate::registry::{NamingService, ServiceDiscovery};
use log::*;
use std::future::Future;
use std::sync::Arc;

mod socket;
pub use socket::SocketTransport;
mod pipeline;
pub use pipeline::PipelineTransport;

/// One physical send of a request to a concrete address, yielding the
/// matching response or a transport-level error.
pub trait CallTransport: Send + Sync + 'static {
    fn send(
        &self, addr: &str, req: &Request,
    ) -> impl Future<Output = Result<Response, RpcError>> + Send;
}

/// One row of a stub's method table: name, declared parameter types and
/// return type, written down once instead of reflected per call.
#[derive(Clone, Copy, Debug)]
pub struct MethodSpec {
    pub name: &'static str,
    pub params: &'static [TypeDesc],
    pub returns: TypeDesc,
}

impl MethodSpec {
    pub const fn new(
        name: &'static str, params: &'static [TypeDesc], returns: TypeDesc,
    ) -> Self {
        Self { name, params, returns }
    }
}

/// Call proxy for one logical service.
pub struct ServiceProxy<N: NamingService, T: CallTransport> {
    interface_name: String,
    service_version: String,
    discovery: ServiceDiscovery<N>,
    transport: T,
    config: RpcConfig,
    schemas: Arc<SchemaCache>,
}

impl<N: NamingService, T: CallTransport> ServiceProxy<N, T> {
    pub fn new<I: Into<String>>(
        interface_name: I, service_version: I, discovery: ServiceDiscovery<N>, transport: T,
        config: RpcConfig,
    ) -> Self {
        Self {
            interface_name: interface_name.into(),
            service_version: service_version.into(),
            discovery,
            transport,
            config,
            schemas: Arc::new(SchemaCache::new()),
        }
    }

    #[inline]
    pub fn service_key(&self) -> String {
        service_key(&self.interface_name, &self.service_version)
    }

    /// Calls through a declared method-table row.
    #[inline]
    pub async fn call_spec(&self, spec: &MethodSpec, args: Vec<Value>) -> Result<Value, RpcError> {
        self.call(spec.name, spec.params, args, spec.returns).await
    }

    /// Full call path: validate args against the declared signature,
    /// resolve an address, send with retry, match the response id, re-raise
    /// in-band errors, coerce the result to the declared return type.
    pub async fn call(
        &self, method: &str, signature: &[TypeDesc], args: Vec<Value>, returns: TypeDesc,
    ) -> Result<Value, RpcError> {
        let schema = self.schemas.get(signature);
        let args = schema.coerce(args).map_err(RpcError::encode)?;
        let mut req = Request::new(
            self.interface_name.clone(),
            self.service_version.clone(),
            method,
            signature.to_vec(),
            args,
        )?;
        let addr = self.discovery.discover(&req.service_key()).await?;
        let resp = match send_with_retry(&self.transport, &addr, &mut req, &self.config).await? {
            Some(resp) => resp,
            None => {
                warn!("{} no response from {} after {} attempts", req, addr, req.retry_count);
                return Err(RpcError::NoResponse);
            }
        };
        if resp.request_id != req.request_id {
            return Err(RpcError::framing(format!(
                "response for {} arrived on request {}",
                resp.request_id, req.request_id
            )));
        }
        let value = resp.into_result()?;
        coerce_return(returns, value).map_err(RpcError::encode)
    }
}

/// The retry state machine.
///
/// Under `NoRetry` the request goes out once, `retry_count` left at its
/// unset value of 0, and the outcome propagates as is. Under `Retry`
/// attempt `i` is sent with `retry_count = i`, and only a timeout
/// re-enters the loop: round `i` is allowed while `need_retry(i)` holds,
/// so `max_retries = N` permits N+1 physical attempts. A non-timeout
/// error propagates from whichever attempt produced it. Exhaustion
/// yields `Ok(None)`.
pub async fn send_with_retry<T: CallTransport>(
    transport: &T, addr: &str, req: &mut Request, config: &RpcConfig,
) -> Result<Option<Response>, RpcError> {
    if config.no_retry() {
        return transport.send(addr, req).await.map(Some);
    }
    req.retry_count = 1;
    match transport.send(addr, req).await {
        Ok(resp) => return Ok(Some(resp)),
        Err(e) => {
            if !e.is_timeout() {
                return Err(e);
            }
            debug!("{} attempt 1 timed out", req);
        }
    }
    let mut i: i32 = 1;
    while config.need_retry(i) {
        i += 1;
        req.retry_count = i as u32;
        match transport.send(addr, req).await {
            Ok(resp) => return Ok(Some(resp)),
            Err(e) => {
                if !e.is_timeout() {
                    return Err(e);
                }
                debug!("{} attempt {} timed out", req, i);
            }
        }
    }
    Ok(None)
}
