//! Request dispatch.
//!
//! Services register explicit method tables at startup; no scanning, no
//! reflection. Dispatch is an exact match on (method name, parameter-type
//! signature), so overloads resolve by the types the caller declared.
//! Every failure on this path folds into the response body; a connection
//! never pays for an application problem.

use crate::codec::SchemaCache;
use crate::error::{RemoteError, RemoteErrorKind};
use crate::message::{Request, Response, TypeDesc, Value, service_key, signature_str};
use futures::FutureExt;
use futures::future::BoxFuture;
use log::*;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Invocation closure built once at registration.
type Invoker =
    Box<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, RemoteError>> + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct MethodKey {
    name: String,
    signature: Vec<TypeDesc>,
}

/// Registering the same (name, signature) twice in one table.
#[derive(Clone, Debug, PartialEq)]
pub struct DuplicateMethod {
    pub name: String,
    pub signature: Vec<TypeDesc>,
}

impl fmt::Display for DuplicateMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "duplicate method {}{}", self.name, signature_str(&self.signature))
    }
}

impl std::error::Error for DuplicateMethod {}

/// Method table for one service implementation.
#[derive(Default)]
pub struct ServiceTable {
    methods: HashMap<MethodKey, Invoker>,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one method overload. The handler receives parameters
    /// already validated and coerced against `signature`.
    ///
    /// Returns `&mut Self` so overloads chain:
    /// `table.method(...)?.method(...)?;`
    pub fn method<F, Fut>(
        &mut self, name: &str, signature: &[TypeDesc], handler: F,
    ) -> Result<&mut Self, DuplicateMethod>
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
    {
        let key = MethodKey { name: name.to_string(), signature: signature.to_vec() };
        if self.methods.contains_key(&key) {
            return Err(DuplicateMethod { name: key.name, signature: key.signature });
        }
        self.methods.insert(key, Box::new(move |params| handler(params).boxed()));
        Ok(self)
    }
}

/// All services one server exposes, keyed by `interface[-version]`.
#[derive(Default)]
pub struct ServiceMap {
    services: HashMap<String, ServiceTable>,
}

impl ServiceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a method table under interface + version. Registering the
    /// same key again replaces the previous table.
    pub fn register<I: Into<String>>(
        &mut self, interface_name: I, service_version: I, table: ServiceTable,
    ) {
        let key = service_key(&interface_name.into(), &service_version.into());
        if self.services.insert(key.clone(), table).is_some() {
            warn!("service {} re-registered, previous table replaced", key);
        } else {
            info!("service {} registered", key);
        }
    }

    /// Keys for registry publication.
    pub fn service_keys(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }
}

pub struct Dispatcher {
    services: ServiceMap,
    schemas: Arc<SchemaCache>,
}

impl Dispatcher {
    pub fn new(services: ServiceMap) -> Self {
        Self { services, schemas: Arc::new(SchemaCache::new()) }
    }

    #[inline]
    pub fn service_keys(&self) -> Vec<String> {
        self.services.service_keys()
    }

    /// Never fails outward: every decodable request produces exactly one
    /// response carrying that request's id.
    pub async fn dispatch(&self, req: Request) -> Response {
        let request_id = req.request_id.clone();
        match self.invoke(req).await {
            Ok(value) => Response::ok(request_id, value),
            Err(e) => Response::err(request_id, e),
        }
    }

    async fn invoke(&self, req: Request) -> Result<Value, RemoteError> {
        let key = req.service_key();
        let Some(table) = self.services.services.get(&key) else {
            return Err(RemoteError::new(
                RemoteErrorKind::ServiceNotFound,
                format!("no service registered for {}", key),
            ));
        };
        let method_key =
            MethodKey { name: req.method_name.clone(), signature: req.parameter_types.clone() };
        let Some(invoker) = table.methods.get(&method_key) else {
            return Err(RemoteError::new(
                RemoteErrorKind::MethodNotFound,
                format!(
                    "{} has no method {}{}",
                    key,
                    req.method_name,
                    signature_str(&req.parameter_types)
                ),
            ));
        };
        let schema = self.schemas.get(&req.parameter_types);
        let params = match schema.coerce(req.parameters) {
            Ok(p) => p,
            Err(e) => return Err(RemoteError::new(RemoteErrorKind::BadParameters, e)),
        };
        if req.retry_count > 1 {
            debug!("request {} redelivered (attempt {})", req.request_id, req.retry_count);
        }
        match AssertUnwindSafe(invoker(params)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let msg = panic_message(panic);
                error!("handler {}.{} panicked: {}", key, req.method_name, msg);
                Err(RemoteError::app(format!("handler panicked: {}", msg)))
            }
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = panic.downcast_ref::<String>() {
        return s.clone();
    }
    "non-string panic payload".to_string()
}
