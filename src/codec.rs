//! Payload serialization and the declared-type schema layer.
//!
//! The `Codec` seam stays byte-oriented and serde-generic; message framing
//! sits above it in [`crate::frame`]. Schema validation lives here because
//! the encoder guard runs against declared parameter types before any bytes
//! are produced.

use crate::message::{TypeDesc, Value, signature_str};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// The codec is immutable; an implementation that needs state (say, a
/// cipher) should carry inner mutability.
pub trait Codec: Default + Send + Sync + Sized + 'static {
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, ()>;

    /// Serializes `msg` onto the end of `buf`, returning the bytes written.
    fn encode_into<T: Serialize>(&self, msg: &T, buf: &mut Vec<u8>) -> Result<usize, ()>;

    fn decode<'a, T: Deserialize<'a>>(&self, buf: &'a [u8]) -> Result<T, ()>;
}

/// MessagePack with named struct fields, the default codec for both
/// transports.
#[derive(Default)]
pub struct MsgpCodec();

impl Codec for MsgpCodec {
    #[inline(always)]
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, ()> {
        match rmp_serde::encode::to_vec_named(msg) {
            Ok(buf) => return Ok(buf),
            Err(e) => {
                log::error!("msgp encode error: {:?}", e);
                return Err(());
            }
        }
    }

    fn encode_into<T: Serialize>(&self, msg: &T, buf: &mut Vec<u8>) -> Result<usize, ()> {
        let pre_len = buf.len();
        match rmp_serde::encode::write_named(buf, msg) {
            Ok(_) => return Ok(buf.len() - pre_len),
            Err(e) => {
                log::error!("msgp encode error: {:?}", e);
                return Err(());
            }
        }
    }

    #[inline(always)]
    fn decode<'a, T: Deserialize<'a>>(&self, buf: &'a [u8]) -> Result<T, ()> {
        match rmp_serde::decode::from_slice::<T>(buf) {
            Ok(msg) => return Ok(msg),
            Err(e) => {
                log::warn!("msgp decode error: {:?}", e);
                return Err(());
            }
        }
    }
}

/// Arity and kind validator for one parameter-type signature.
///
/// Checks are positional and exact, with one widening allowed: an `Int`
/// value satisfies a declared `Float` (integer literals survive msgpack
/// round trips as integers).
pub struct ParamSchema {
    types: Box<[TypeDesc]>,
}

impl ParamSchema {
    fn build(sig: &[TypeDesc]) -> Self {
        Self { types: sig.into() }
    }

    #[inline]
    pub fn types(&self) -> &[TypeDesc] {
        &self.types
    }

    pub fn check(&self, params: &[Value]) -> Result<(), String> {
        if params.len() != self.types.len() {
            return Err(format!(
                "expected {} parameters for {}, got {}",
                self.types.len(),
                signature_str(&self.types),
                params.len()
            ));
        }
        for (i, (declared, value)) in self.types.iter().zip(params.iter()).enumerate() {
            let got = value.kind();
            if got == *declared {
                continue;
            }
            if *declared == TypeDesc::Float && got == TypeDesc::Int {
                continue;
            }
            return Err(format!("parameter {} is {}, declared {}", i, got, declared));
        }
        Ok(())
    }

    /// `check` plus the Int-to-Float widening applied, so handlers see the
    /// kinds the signature promises.
    pub fn coerce(&self, mut params: Vec<Value>) -> Result<Vec<Value>, String> {
        self.check(&params)?;
        for (declared, value) in self.types.iter().zip(params.iter_mut()) {
            if *declared == TypeDesc::Float {
                if let Value::Int(v) = value {
                    *value = Value::Float(*v as f64);
                }
            }
        }
        Ok(params)
    }
}

/// Coerces a result value to the return type a stub declared. `Null`
/// passes for any declared type (void and absent results), and `Int`
/// widens to a declared `Float`.
pub fn coerce_return(declared: TypeDesc, value: Value) -> Result<Value, String> {
    let got = value.kind();
    if got == declared || got == TypeDesc::Null {
        return Ok(value);
    }
    if declared == TypeDesc::Float {
        if let Value::Int(v) = value {
            return Ok(Value::Float(v as f64));
        }
    }
    Err(format!("result is {}, declared {}", got, declared))
}

/// Concurrent read-through cache of signature validators, shared by the
/// client-side encoder guard and the server dispatcher.
///
/// Reads take the read lock only. A miss builds the schema outside any
/// lock, then double-checks under the write lock so racing builders end up
/// sharing one entry.
pub struct SchemaCache {
    inner: RwLock<HashMap<Box<[TypeDesc]>, Arc<ParamSchema>>>,
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaCache {
    pub fn new() -> Self {
        Self { inner: RwLock::new(HashMap::new()) }
    }

    pub fn get(&self, sig: &[TypeDesc]) -> Arc<ParamSchema> {
        {
            let map = self.inner.read().expect("lock");
            if let Some(schema) = map.get(sig) {
                return schema.clone();
            }
        }
        let built = Arc::new(ParamSchema::build(sig));
        let mut map = self.inner.write().expect("lock");
        if let Some(schema) = map.get(sig) {
            return schema.clone();
        }
        map.insert(sig.into(), built.clone());
        built
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.read().expect("lock").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RemoteError, RemoteErrorKind};
    use crate::message::{Request, Response};
    use std::collections::BTreeMap;

    #[test]
    fn test_msgp_request_roundtrip() {
        let codec = MsgpCodec::default();
        let mut map = BTreeMap::new();
        map.insert("k".to_string(), Value::from(1));
        let req = Request::new(
            "sample.MathService",
            "v2",
            "sum",
            vec![TypeDesc::Int, TypeDesc::Float, TypeDesc::List, TypeDesc::Map],
            vec![
                Value::from(2),
                Value::from(3.5),
                Value::List(vec![Value::from("a"), Value::Null]),
                Value::Map(map),
            ],
        )
        .expect("request");
        let buf = codec.encode(&req).expect("encode");
        let back: Request = codec.decode(&buf).expect("decode");
        assert_eq!(back, req);
    }

    #[test]
    fn test_msgp_response_roundtrip() {
        let codec = MsgpCodec::default();
        let ok = Response::ok("id-1", Value::from(5));
        let buf = codec.encode(&ok).expect("encode");
        let back: Response = codec.decode(&buf).expect("decode");
        assert_eq!(back, ok);

        let err =
            Response::err("id-2", RemoteError::new(RemoteErrorKind::ServiceNotFound, "no svc"));
        let buf = codec.encode(&err).expect("encode");
        let back: Response = codec.decode(&buf).expect("decode");
        assert_eq!(back, err);
    }

    #[test]
    fn test_encode_into_appends() {
        let codec = MsgpCodec::default();
        let mut buf = vec![0u8; 4];
        let n = codec.encode_into(&Value::from("hello"), &mut buf).expect("encode");
        assert_eq!(buf.len(), 4 + n);
        let back: Value = codec.decode(&buf[4..]).expect("decode");
        assert_eq!(back, Value::from("hello"));
    }

    #[test]
    fn test_schema_check() {
        let cache = SchemaCache::new();
        let schema = cache.get(&[TypeDesc::Int, TypeDesc::Float]);
        assert!(schema.check(&[Value::from(1), Value::from(2.5)]).is_ok());
        // widening
        assert!(schema.check(&[Value::from(1), Value::from(2)]).is_ok());
        // arity
        assert!(schema.check(&[Value::from(1)]).is_err());
        // kind
        assert!(schema.check(&[Value::from("x"), Value::from(2.5)]).is_err());
        // no narrowing
        assert!(cache.get(&[TypeDesc::Int]).check(&[Value::from(1.5)]).is_err());
    }

    #[test]
    fn test_schema_coerce() {
        let cache = SchemaCache::new();
        let schema = cache.get(&[TypeDesc::Float, TypeDesc::Str]);
        let out = schema.coerce(vec![Value::from(2), Value::from("x")]).expect("coerce");
        assert_eq!(out, vec![Value::Float(2.0), Value::from("x")]);
    }

    #[test]
    fn test_coerce_return() {
        assert_eq!(coerce_return(TypeDesc::Float, Value::from(3)), Ok(Value::Float(3.0)));
        assert_eq!(coerce_return(TypeDesc::Int, Value::Null), Ok(Value::Null));
        assert!(coerce_return(TypeDesc::Int, Value::from("x")).is_err());
    }

    #[test]
    fn test_schema_cache_shares_entries() {
        let cache = Arc::new(SchemaCache::new());
        let a = cache.get(&[TypeDesc::Int, TypeDesc::Int]);
        let b = cache.get(&[TypeDesc::Int, TypeDesc::Int]);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = cache.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    c.get(&[TypeDesc::Str, TypeDesc::Bytes]);
                    c.get(&[TypeDesc::Int, TypeDesc::Int]);
                }
            }));
        }
        for h in handles {
            h.join().expect("join");
        }
        assert_eq!(cache.len(), 2);
    }
}
