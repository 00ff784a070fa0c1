//! # switchboard-rpc
//!
//! An RPC framework with registry-based service discovery. Servers publish
//! their addresses to a naming service; clients resolve a provider per
//! call, speak a length-prefixed msgpack protocol, and retry timed-out
//! attempts under a configurable policy.
//!
//! ## Components
//!
//! - [message]: the wire model. [`Request`] and [`Response`], the [`Value`]
//!   parameter model, and the [`TypeDesc`] signatures that drive overload
//!   resolution.
//! - [codec]: msgpack serialization behind the [Codec](codec::Codec) seam,
//!   plus the cached parameter schemas requests are validated against.
//! - [frame]: the `u32` length-prefixed framing both sides share.
//! - [client]: [ServiceProxy](client::ServiceProxy) resolves an address,
//!   enforces the per-attempt timeout and drives retry. Two transports:
//!   [SocketTransport](client::SocketTransport) opens a connection per
//!   call, [PipelineTransport](client::PipelineTransport) multiplexes
//!   calls over one persistent connection per address.
//! - [server]: [RpcServer](server::RpcServer) serves connections
//!   sequentially or pipelined and dispatches requests through explicit
//!   per-service method tables.
//! - [registry]: publication and discovery through a session-oriented
//!   naming service, with
//!   [MemoryNamingService](registry::MemoryNamingService) as the
//!   in-process backend.
//!
//! ## The Design
//!
//! A call is `interface[-version].method(signature)` applied to positional
//! [`Value`] parameters. The parameter-type signature travels with every
//! request, so a server resolves overloads by what actually arrived and a
//! mismatch comes back as a structured remote error instead of a decode
//! failure.
//!
//! Discovery and dispatch stay decoupled: the registry only maps a service
//! key to live `host:port` strings, and every call picks one uniformly at
//! random. Whether the transport dials per call or multiplexes, the proxy
//! behaves the same; only timeout handling differs in cost.
//!
//! Timed-out attempts are the one retryable failure. At-least-once
//! delivery is opt-in through [RetryPolicy](config::RetryPolicy), and each
//! resend carries its attempt number so handlers can spot redelivery.
//!
//! ## Protocol
//!
//! Every message on the wire is a big-endian `u32` payload length followed
//! by exactly that many bytes of msgpack, described in [frame]. Responses
//! carry the request id they answer, which is what lets the pipelined
//! transport complete calls out of order.
//!
//! ## Usage
//!
//! The integration tests under `tests/` register a few services end to
//! end and exercise both transports against both serve modes.

#[macro_use]
extern crate captains_log;

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod message;
pub mod net;
pub mod registry;
pub mod server;

pub use error::{RemoteError, RemoteErrorKind, RpcError};
pub use message::{Request, Response, TypeDesc, Value};
