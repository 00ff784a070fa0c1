use crate::error::{RemoteError, RpcError};
use rand::Rng;
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Self-describing value union for parameters and results.
///
/// The wire keeps values tagged so the dispatcher can resolve overloads
/// from what actually arrived, not from what the caller hoped it sent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    #[inline]
    pub fn kind(&self) -> TypeDesc {
        match self {
            Self::Null => TypeDesc::Null,
            Self::Bool(_) => TypeDesc::Bool,
            Self::Int(_) => TypeDesc::Int,
            Self::Float(_) => TypeDesc::Float,
            Self::Str(_) => TypeDesc::Str,
            Self::Bytes(_) => TypeDesc::Bytes,
            Self::List(_) => TypeDesc::List,
            Self::Map(_) => TypeDesc::Map,
        }
    }

    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Float accessor; an `Int` widens losslessly enough for RPC use.
    #[inline]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v.as_str()),
            _ => None,
        }
    }

    #[inline]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(v) => Some(v.as_slice()),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

/// Flat type descriptor, one per `Value` kind. An ordered slice of these is
/// a method signature; signatures distinguish overloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeDesc {
    Null,
    Bool,
    Int,
    Float,
    Str,
    Bytes,
    List,
    Map,
}

impl TypeDesc {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Str => "str",
            Self::Bytes => "bytes",
            Self::List => "list",
            Self::Map => "map",
        }
    }
}

impl fmt::Display for TypeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Renders a signature for error messages, e.g. `(int, float)`.
pub fn signature_str(sig: &[TypeDesc]) -> String {
    let mut s = String::with_capacity(2 + sig.len() * 6);
    s.push('(');
    for (i, t) in sig.iter().enumerate() {
        if i > 0 {
            s.push_str(", ");
        }
        s.push_str(t.as_str());
    }
    s.push(')');
    s
}

/// Joins an interface name and version into the key used by both the
/// dispatch table and the registry path. An empty version means the
/// interface name alone.
#[inline]
pub fn service_key(interface_name: &str, service_version: &str) -> String {
    if service_version.is_empty() {
        interface_name.to_string()
    } else {
        format!("{}-{}", interface_name, service_version)
    }
}

/// 32 hex chars from two random u64s. Unique per logical call; retries of
/// that call reuse it so the server can spot duplicate deliveries.
pub fn new_request_id() -> String {
    let mut rng = rand::thread_rng();
    format!("{:016x}{:016x}", rng.r#gen::<u64>(), rng.r#gen::<u64>())
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub request_id: String,
    pub interface_name: String,
    #[serde(default)]
    pub service_version: String,
    pub method_name: String,
    pub parameter_types: Vec<TypeDesc>,
    pub parameters: Vec<Value>,
    /// 0 when retry is off; under retry, the 1-based attempt number.
    #[serde(default)]
    pub retry_count: u32,
}

impl Request {
    pub fn new<I, M>(
        interface_name: I, service_version: I, method_name: M, parameter_types: Vec<TypeDesc>,
        parameters: Vec<Value>,
    ) -> Result<Self, RpcError>
    where
        I: Into<String>,
        M: Into<String>,
    {
        if parameter_types.len() != parameters.len() {
            return Err(RpcError::encode(format!(
                "parameter count mismatch: {} types, {} values",
                parameter_types.len(),
                parameters.len()
            )));
        }
        Ok(Self {
            request_id: new_request_id(),
            interface_name: interface_name.into(),
            service_version: service_version.into(),
            method_name: method_name.into(),
            parameter_types,
            parameters,
            retry_count: 0,
        })
    }

    #[inline]
    pub fn service_key(&self) -> String {
        service_key(&self.interface_name, &self.service_version)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "req {} {}.{}{}",
            self.request_id,
            self.service_key(),
            self.method_name,
            signature_str(&self.parameter_types)
        )
    }
}

/// Carries exactly one of `result` or `error`; void results travel as
/// `Value::Null`, never as an absent result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub request_id: String,
    pub result: Option<Value>,
    pub error: Option<RemoteError>,
}

impl Response {
    #[inline]
    pub fn ok<S: Into<String>>(request_id: S, result: Value) -> Self {
        Self { request_id: request_id.into(), result: Some(result), error: None }
    }

    #[inline]
    pub fn err<S: Into<String>>(request_id: S, error: RemoteError) -> Self {
        Self { request_id: request_id.into(), result: None, error: Some(error) }
    }

    /// Re-raises an in-band error body, otherwise yields the result value.
    pub fn into_result(self) -> Result<Value, RpcError> {
        if let Some(e) = self.error {
            return Err(RpcError::Remote(e));
        }
        match self.result {
            Some(v) => Ok(v),
            None => Err(RpcError::framing("response carries neither result nor error")),
        }
    }
}
