#![allow(dead_code)]

//! Shared fixtures: a logging test runner, sample services, and helpers
//! that bring up a registered server on an ephemeral port.

use captains_log::{Level, recipe};
use log::*;
use rstest::fixture;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use switchboard_rpc::client::{MethodSpec, PipelineTransport, ServiceProxy, SocketTransport};
use switchboard_rpc::config::{RpcConfig, ServerConfig};
use switchboard_rpc::error::RemoteError;
use switchboard_rpc::message::{TypeDesc, Value};
use switchboard_rpc::registry::{MemoryNamingService, ServiceDiscovery, ServiceRegistry};
use switchboard_rpc::server::{RpcServer, ServeMode, ServiceMap, ServiceTable};

pub struct TestRunner {
    pub rt: tokio::runtime::Runtime,
}

impl fmt::Debug for TestRunner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "")
    }
}

impl TestRunner {
    pub fn new() -> Self {
        recipe::raw_file_logger("/tmp/switchboard_rpc_test.log", Level::Trace)
            .test()
            .build()
            .expect("log");
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .expect("rt");
        Self { rt }
    }

    pub fn block_on<F: Future<Output = ()> + Send + 'static>(&self, f: F) {
        self.rt.block_on(f);
    }
}

#[fixture]
pub fn runner() -> TestRunner {
    TestRunner::new()
}

pub const MATH_INTERFACE: &str = "sample.MathService";
pub const STRING_INTERFACE: &str = "sample.StringService";

pub const SUM_INT: MethodSpec =
    MethodSpec::new("sum", &[TypeDesc::Int, TypeDesc::Int], TypeDesc::Int);
pub const SUM_FLOAT: MethodSpec =
    MethodSpec::new("sum", &[TypeDesc::Float, TypeDesc::Float], TypeDesc::Float);
pub const DELAY_ECHO: MethodSpec =
    MethodSpec::new("delay_echo", &[TypeDesc::Int, TypeDesc::Str], TypeDesc::Str);

pub fn math_table() -> ServiceTable {
    let mut table = ServiceTable::new();
    table
        .method("sum", &[TypeDesc::Int, TypeDesc::Int], |params| async move {
            let a = params[0].as_int().ok_or_else(|| RemoteError::app("not an int"))?;
            let b = params[1].as_int().ok_or_else(|| RemoteError::app("not an int"))?;
            Ok(Value::Int(a + b))
        })
        .expect("sum(int,int)")
        .method("sum", &[TypeDesc::Float, TypeDesc::Float], |params| async move {
            let a = params[0].as_float().ok_or_else(|| RemoteError::app("not a float"))?;
            let b = params[1].as_float().ok_or_else(|| RemoteError::app("not a float"))?;
            Ok(Value::Float(a + b))
        })
        .expect("sum(float,float)")
        .method("div", &[TypeDesc::Int, TypeDesc::Int], |params| async move {
            let a = params[0].as_int().ok_or_else(|| RemoteError::app("not an int"))?;
            let b = params[1].as_int().ok_or_else(|| RemoteError::app("not an int"))?;
            if b == 0 {
                return Err(RemoteError::app("division by zero"));
            }
            Ok(Value::Int(a / b))
        })
        .expect("div(int,int)")
        .method("delay_echo", &[TypeDesc::Int, TypeDesc::Str], |params| async move {
            let ms = params[0].as_int().unwrap_or(0).max(0) as u64;
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(params[1].clone())
        })
        .expect("delay_echo(int,str)");
    table
}

pub fn string_table(tag: &'static str) -> ServiceTable {
    let mut table = ServiceTable::new();
    table
        .method("to_upper", &[TypeDesc::Str], |params| async move {
            match &params[0] {
                Value::Str(s) => Ok(Value::Str(s.to_uppercase())),
                _ => Err(RemoteError::app("not a string")),
            }
        })
        .expect("to_upper(str)")
        .method("tag", &[], move |_| async move { Ok(Value::from(tag)) })
        .expect("tag()")
        .method("ping", &[], |_| async move { Ok(Value::Null) })
        .expect("ping()");
    table
}

pub fn default_services() -> ServiceMap {
    let mut services = ServiceMap::new();
    services.register(MATH_INTERFACE, "", math_table());
    services.register(STRING_INTERFACE, "", string_table("base"));
    services.register(STRING_INTERFACE, "2", string_table("v2"));
    services
}

/// Server on an ephemeral port with all sample services published. The
/// returned registry session keeps the address nodes alive.
pub async fn start_server(
    naming: &MemoryNamingService, mode: ServeMode, config: ServerConfig,
) -> (RpcServer, String, ServiceRegistry<MemoryNamingService>) {
    let mut server = RpcServer::new(default_services(), config);
    let addr = server.listen("127.0.0.1:0", mode).await.expect("listen");
    let registry = ServiceRegistry::connect(naming).await.expect("naming connect");
    server.register_services(&registry, &addr).await.expect("register services");
    info!("test server on {} ({:?})", addr, mode);
    (server, addr, registry)
}

pub fn quick_config() -> RpcConfig {
    RpcConfig {
        timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

pub fn socket_proxy(
    naming: &MemoryNamingService, interface: &str, version: &str, config: RpcConfig,
) -> ServiceProxy<MemoryNamingService, SocketTransport> {
    ServiceProxy::new(
        interface,
        version,
        ServiceDiscovery::new(naming.clone()),
        SocketTransport::new(config.clone()),
        config,
    )
}

pub fn pipeline_proxy(
    naming: &MemoryNamingService, interface: &str, version: &str, config: RpcConfig,
) -> ServiceProxy<MemoryNamingService, PipelineTransport> {
    ServiceProxy::new(
        interface,
        version,
        ServiceDiscovery::new(naming.clone()),
        PipelineTransport::new(config.clone()),
        config,
    )
}
