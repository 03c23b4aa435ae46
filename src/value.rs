// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::ast::{Ref, Statement};
use crate::environment::Environment;
use crate::number::Number;

use core::cmp;
use core::fmt;
use std::collections::BTreeMap;
use std::ops;
use std::rc::Rc;
use std::str::FromStr;

use anyhow::{anyhow, bail, Result};
use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

// serde_json::Value cannot be used directly because Stratus values include
// closures, undefined and non-string object keys. BTree keeps object fields
// in a deterministic order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Value {
    // Json data types. serde will automatically map json to these variants.
    Null,
    Bool(bool),
    Number(Number),
    String(Rc<str>),
    Array(Rc<Vec<Value>>),
    Object(Rc<BTreeMap<Value, Value>>),

    // A function value carrying its defining environment.
    Closure(Closure),

    // A value not yet supplied, e.g. a cloud-computed property.
    Undefined,
}

/// The body and captured environment of a Stratus function.
#[derive(Debug)]
pub struct ClosureInternal {
    pub name: Option<Rc<str>>,
    pub params: Vec<Rc<str>>,
    pub body: Vec<Ref<Statement>>,
    /// The environment active at the definition site, not at call time.
    pub env: Environment,
}

/// Shared handle to a function value. Equality and ordering are by identity;
/// two closures are the same value only if they are the same allocation.
#[derive(Clone, Debug)]
pub struct Closure {
    r: Rc<ClosureInternal>,
}

impl Closure {
    pub fn new(c: ClosureInternal) -> Self {
        Self { r: Rc::new(c) }
    }
}

impl ops::Deref for Closure {
    type Target = ClosureInternal;

    fn deref(&self) -> &Self::Target {
        &self.r
    }
}

impl cmp::PartialEq for Closure {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.r, &other.r)
    }
}

impl cmp::Eq for Closure {}

impl cmp::Ord for Closure {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        Rc::as_ptr(&self.r).cmp(&Rc::as_ptr(&other.r))
    }
}

impl cmp::PartialOrd for Closure {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::Error;
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::String(s) => serializer.serialize_str(s.as_ref()),
            Value::Number(n) => n.serialize(serializer),
            Value::Array(a) => a.serialize(serializer),
            Value::Object(fields) => {
                // Non-string keys become their JSON text, since JSON object
                // keys must be strings.
                let mut map = serializer.serialize_map(Some(fields.len()))?;
                for (key, value) in fields.iter() {
                    if matches!(key, Value::String(_)) {
                        map.serialize_entry(key, value)?;
                    } else {
                        let key = serde_json::to_string(key).map_err(Error::custom)?;
                        map.serialize_entry(&key, value)?;
                    }
                }
                map.end()
            }

            // display closures and undefined as special strings
            Value::Closure(_) => serializer.serialize_str("<function>"),
            Value::Undefined => serializer.serialize_str("<undefined>"),
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a value")
    }

    fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Value, E> {
        Ok(Value::from(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Value, E> {
        Ok(Value::from(v))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Value, E> {
        Ok(Value::from(v))
    }

    fn visit_str<E: de::Error>(self, s: &str) -> Result<Value, E> {
        Ok(Value::from(s))
    }

    fn visit_string<E: de::Error>(self, s: String) -> Result<Value, E> {
        Ok(Value::from(s))
    }

    fn visit_seq<V: SeqAccess<'de>>(self, mut visitor: V) -> Result<Value, V::Error> {
        let mut items = Vec::with_capacity(visitor.size_hint().unwrap_or(0));
        while let Some(item) = visitor.next_element()? {
            items.push(item);
        }
        Ok(Value::from(items))
    }

    fn visit_map<V: MapAccess<'de>>(self, mut visitor: V) -> Result<Value, V::Error> {
        let mut map = BTreeMap::new();
        while let Some((key, value)) = visitor.next_entry::<Value, Value>()? {
            // serde_json encodes high-precision numbers as a marker entry.
            if map.is_empty() {
                if let (Value::String(k), Value::String(v)) = (&key, &value) {
                    if k.as_ref() == "$serde_json::private::Number" {
                        return Number::from_str(v)
                            .map(Value::from)
                            .map_err(|_| de::Error::custom("failed to read number"));
                    }
                }
            }
            map.insert(key, value);
        }
        Ok(Value::from(map))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Value, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(ValueVisitor)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(s) => f.write_str(&s),
            Err(_) => Err(fmt::Error),
        }
    }
}

impl Value {
    pub fn new_object() -> Value {
        Value::from(BTreeMap::new())
    }

    pub fn new_array() -> Value {
        Value::from(vec![])
    }

    pub fn from_json_str(json: &str) -> Result<Value> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json_str(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json_file<P: AsRef<std::path::Path>>(path: P) -> Result<Value> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|err| anyhow!("failed to read {}: {err}", path.display()))?;
        Self::from_json_str(&json)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Number> for Value {
    fn from(n: Number) -> Self {
        Value::Number(n)
    }
}

macro_rules! from_via_number {
    ($($ty:ty),*) => {$(
        impl From<$ty> for Value {
            fn from(n: $ty) -> Self {
                Value::Number(Number::from(n))
            }
        }
    )*};
}

from_via_number!(u64, i64, f64, usize);

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s.into())
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(items))
    }
}

impl From<BTreeMap<Value, Value>> for Value {
    fn from(fields: BTreeMap<Value, Value>) -> Self {
        Value::Object(Rc::new(fields))
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_empty_object(&self) -> bool {
        matches!(self, Value::Object(fields) if fields.is_empty())
    }

    fn kind_mismatch(&self, expected: &str) -> anyhow::Error {
        anyhow!("expected {expected}, got {}", self.type_name())
    }

    pub fn as_bool(&self) -> Result<&bool> {
        match self {
            Value::Bool(b) => Ok(b),
            _ => Err(self.kind_mismatch("bool")),
        }
    }

    pub fn as_string(&self) -> Result<&Rc<str>> {
        match self {
            Value::String(s) => Ok(s),
            _ => Err(self.kind_mismatch("string")),
        }
    }

    pub fn as_number(&self) -> Result<&Number> {
        match self {
            Value::Number(n) => Ok(n),
            _ => Err(self.kind_mismatch("number")),
        }
    }

    pub fn as_i64(&self) -> Result<i64> {
        self.as_number()?
            .as_i64()
            .ok_or_else(|| self.kind_mismatch("integer"))
    }

    pub fn as_array(&self) -> Result<&Vec<Value>> {
        match self {
            Value::Array(a) => Ok(a),
            _ => Err(self.kind_mismatch("array")),
        }
    }

    pub fn as_array_mut(&mut self) -> Result<&mut Vec<Value>> {
        match self {
            Value::Array(a) => Ok(Rc::make_mut(a)),
            _ => Err(self.kind_mismatch("array")),
        }
    }

    pub fn as_object(&self) -> Result<&BTreeMap<Value, Value>> {
        match self {
            Value::Object(fields) => Ok(fields),
            _ => Err(self.kind_mismatch("object")),
        }
    }

    pub fn as_object_mut(&mut self) -> Result<&mut BTreeMap<Value, Value>> {
        match self {
            Value::Object(fields) => Ok(Rc::make_mut(fields)),
            _ => Err(self.kind_mismatch("object")),
        }
    }

    pub fn as_closure(&self) -> Result<&Closure> {
        match self {
            Value::Closure(c) => Ok(c),
            _ => Err(self.kind_mismatch("function")),
        }
    }

    /// The kind name used in error messages and by the `type` builtin.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Closure(_) => "function",
            Value::Undefined => "undefined",
        }
    }
}

impl Value {
    /// Navigate to a nested slot, creating intermediate objects on demand.
    /// Used for assignments like `obj.a.b = v` on local object variables.
    pub fn make_or_get_value_mut<'a>(&'a mut self, paths: &[&str]) -> Result<&'a mut Value> {
        let (first, rest) = match paths.split_first() {
            Some(split) => split,
            None => return Ok(self),
        };
        if matches!(self, Value::Undefined | Value::Null) {
            *self = Value::new_object();
        }
        let fields = match self {
            Value::Object(fields) => Rc::make_mut(fields),
            other => bail!(other.kind_mismatch("object")),
        };
        fields
            .entry(Value::String((*first).into()))
            .or_insert(Value::Undefined)
            .make_or_get_value_mut(rest)
    }
}

impl ops::Index<usize> for Value {
    type Output = Value;

    fn index(&self, index: usize) -> &Self::Output {
        match self {
            Value::Array(a) if index < a.len() => &a[index],
            _ => &Value::Undefined,
        }
    }
}

impl ops::Index<&str> for Value {
    type Output = Value;

    fn index(&self, key: &str) -> &Self::Output {
        &self[&Value::String(key.into())]
    }
}

impl ops::Index<&Value> for Value {
    type Output = Value;

    fn index(&self, key: &Value) -> &Self::Output {
        let slot = match (self, key) {
            (Value::Object(fields), _) => fields.get(key),
            (Value::Array(items), Value::Number(n)) => n
                .as_u64()
                .and_then(|index| items.get(index as usize)),
            _ => None,
        };
        slot.unwrap_or(&Value::Undefined)
    }
}
