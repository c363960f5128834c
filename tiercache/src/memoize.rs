//! Memoization on top of [`IntelligentCache`]
//!
//! A [`Memoized`] wraps an operation and caches its result under a key
//! derived from the operation name and its arguments. Keys are a SHA-256
//! digest of canonical JSON, so map and struct fields hash the same in any
//! order. Arguments holding NaN or an infinity have no stable JSON form and
//! are never cached.

use serde::de::{self, DeserializeOwned, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::marker::PhantomData;
use tracing::{debug, warn};

use crate::cache::{IntelligentCache, PutOptions};
use crate::entry::Priority;
use crate::error::CodecError;

type KeyFn<A> = Box<dyn Fn(&A) -> String + Send + Sync>;

/// Cache key for `function` called with `args`
pub fn derive_key<A: Serialize + ?Sized>(function: &str, args: &A) -> Result<String, CodecError> {
    ensure_finite(args)?;
    let args = serde_json::to_value(args).map_err(|e| CodecError::Encode(e.to_string()))?;
    let document = serde_json::json!({ "function": function, "args": args });

    let mut canonical = String::new();
    write_canonical(&document, &mut canonical)?;

    let digest = Sha256::digest(canonical.as_bytes());
    Ok(hex::encode(digest))
}

/// JSON writes every non-finite float as `null`; MessagePack keeps them
fn ensure_finite<A: Serialize + ?Sized>(args: &A) -> Result<(), CodecError> {
    let packed = rmp_serde::to_vec_named(args).map_err(|e| CodecError::Encode(e.to_string()))?;
    rmp_serde::from_slice::<FiniteFloats>(&packed)
        .map(|_| ())
        .map_err(|e| CodecError::Encode(e.to_string()))
}

/// Any value, as long as every float in it is finite
struct FiniteFloats;

impl<'de> Deserialize<'de> for FiniteFloats {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(FiniteVisitor)
    }
}

struct FiniteVisitor;

impl<'de> Visitor<'de> for FiniteVisitor {
    type Value = FiniteFloats;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a value without NaN or infinite floats")
    }

    fn visit_bool<E: de::Error>(self, _: bool) -> Result<FiniteFloats, E> {
        Ok(FiniteFloats)
    }

    fn visit_i64<E: de::Error>(self, _: i64) -> Result<FiniteFloats, E> {
        Ok(FiniteFloats)
    }

    fn visit_u64<E: de::Error>(self, _: u64) -> Result<FiniteFloats, E> {
        Ok(FiniteFloats)
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<FiniteFloats, E> {
        if v.is_finite() {
            Ok(FiniteFloats)
        } else {
            Err(E::custom(format!("non-finite float {v} has no stable key")))
        }
    }

    fn visit_str<E: de::Error>(self, _: &str) -> Result<FiniteFloats, E> {
        Ok(FiniteFloats)
    }

    fn visit_bytes<E: de::Error>(self, _: &[u8]) -> Result<FiniteFloats, E> {
        Ok(FiniteFloats)
    }

    fn visit_unit<E: de::Error>(self) -> Result<FiniteFloats, E> {
        Ok(FiniteFloats)
    }

    fn visit_none<E: de::Error>(self) -> Result<FiniteFloats, E> {
        Ok(FiniteFloats)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<FiniteFloats, D::Error> {
        FiniteFloats::deserialize(d)
    }

    fn visit_newtype_struct<D: Deserializer<'de>>(self, d: D) -> Result<FiniteFloats, D::Error> {
        FiniteFloats::deserialize(d)
    }

    fn visit_seq<S: SeqAccess<'de>>(self, mut seq: S) -> Result<FiniteFloats, S::Error> {
        while seq.next_element::<FiniteFloats>()?.is_some() {}
        Ok(FiniteFloats)
    }

    fn visit_map<M: MapAccess<'de>>(self, mut map: M) -> Result<FiniteFloats, M::Error> {
        while map.next_entry::<FiniteFloats, FiniteFloats>()?.is_some() {}
        Ok(FiniteFloats)
    }
}

/// Compact JSON with object keys sorted at every depth
fn write_canonical(value: &Value, out: &mut String) -> Result<(), CodecError> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&scalar(&Value::String(key.clone()))?);
                out.push(':');
                write_canonical(&map[key.as_str()], out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        other => out.push_str(&scalar(other)?),
    }
    Ok(())
}

fn scalar(value: &Value) -> Result<String, CodecError> {
    serde_json::to_string(value).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Operation whose results are cached.
///
/// ```ignore
/// let search = Memoized::new(&cache, "search", |q: &Query| run_search(q))
///     .ttl(600)
///     .tags(["search"]);
/// let hits = search.call(&query);
/// ```
pub struct Memoized<A: ?Sized, R, F> {
    cache: IntelligentCache,
    name: String,
    operation: F,
    ttl: Option<u64>,
    tags: BTreeSet<String>,
    priority: Priority,
    key_fn: Option<KeyFn<A>>,
    _result: PhantomData<fn() -> R>,
}

impl<A, R, F> Memoized<A, R, F>
where
    A: Serialize + ?Sized,
    R: Serialize + DeserializeOwned,
    F: Fn(&A) -> R,
{
    pub fn new(cache: &IntelligentCache, name: impl Into<String>, operation: F) -> Self {
        Self {
            cache: cache.clone(),
            name: name.into(),
            operation,
            ttl: None,
            tags: BTreeSet::new(),
            priority: Priority::default(),
            key_fn: None,
            _result: PhantomData,
        }
    }

    pub fn ttl(mut self, secs: u64) -> Self {
        self.ttl = Some(secs);
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Replace the digest with a caller-chosen key
    pub fn key_fn(mut self, key_fn: impl Fn(&A) -> String + Send + Sync + 'static) -> Self {
        self.key_fn = Some(Box::new(key_fn));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_for(&self, args: &A) -> Result<String, CodecError> {
        match &self.key_fn {
            Some(key_fn) => Ok(key_fn(args)),
            None => derive_key(&self.name, args),
        }
    }

    /// Cached result for `args`, running the operation on a miss
    pub fn call(&self, args: &A) -> R {
        let key = match self.key_for(args) {
            Ok(key) => key,
            Err(e) => {
                warn!("{}: arguments not cacheable, running uncached: {}", self.name, e);
                return (self.operation)(args);
            }
        };

        if let Some(result) = self.cache.lookup::<R>(&key) {
            debug!("{}: memoized hit", self.name);
            return result;
        }

        let result = (self.operation)(args);

        let mut options = PutOptions::new()
            .priority(self.priority)
            .tags(self.tags.iter().cloned())
            .metadata("function", Value::String(self.name.clone()));
        options.ttl = self.ttl;
        if !self.cache.put(&key, &result, options) {
            debug!("{}: result not stored", self.name);
        }
        result
    }
}

impl IntelligentCache {
    /// Shorthand for [`Memoized::new`]
    pub fn memoize<A, R, F>(&self, name: impl Into<String>, operation: F) -> Memoized<A, R, F>
    where
        A: Serialize + ?Sized,
        R: Serialize + DeserializeOwned,
        F: Fn(&A) -> R,
    {
        Memoized::new(self, name, operation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};

    #[test]
    fn test_key_is_stable_hex_digest() {
        let a = derive_key("sum", &(1, 2)).unwrap();
        let b = derive_key("sum", &(1, 2)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

        assert_ne!(a, derive_key("sum", &(2, 1)).unwrap());
        assert_ne!(a, derive_key("product", &(1, 2)).unwrap());
    }

    #[test]
    fn test_keyword_order_does_not_matter() {
        #[derive(Serialize)]
        struct Ab {
            a: u32,
            b: &'static str,
        }
        #[derive(Serialize)]
        struct Ba {
            b: &'static str,
            a: u32,
        }

        let first = derive_key("f", &Ab { a: 1, b: "x" }).unwrap();
        let second = derive_key("f", &Ba { b: "x", a: 1 }).unwrap();
        assert_eq!(first, second);

        let mut map = BTreeMap::new();
        map.insert("b", serde_json::json!("x"));
        map.insert("a", serde_json::json!(1));
        assert_eq!(first, derive_key("f", &map).unwrap());
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let value = serde_json::json!({"z": {"y": 1, "x": [ {"b": 2, "a": 1} ]}, "a": null});
        let mut out = String::new();
        write_canonical(&value, &mut out).unwrap();
        assert_eq!(out, r#"{"a":null,"z":{"x":[{"a":1,"b":2}],"y":1}}"#);
    }

    #[test]
    fn test_non_finite_floats_not_cacheable() {
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(matches!(derive_key("f", &Some(bad)), Err(CodecError::Encode(_))));
            assert!(derive_key("f", &vec![1.0, bad]).is_err());
        }
        assert!(derive_key("f", &(f32::NAN, 1)).is_err());

        let none = derive_key("f", &None::<f64>).unwrap();
        assert_ne!(none, derive_key("f", &Some(0.5)).unwrap());
    }

    #[test]
    fn test_non_string_map_keys_not_cacheable() {
        let mut args = HashMap::new();
        args.insert((1, 2), 3);
        assert!(derive_key("f", &args).is_err());
    }
}
