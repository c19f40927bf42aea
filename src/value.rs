// Copyright Rouven Bauer
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;

use duplicate::duplicate_item;

/// A plain data value exchanged with the DBMS.
///
/// This is the data model for auth token data, routing contexts, and the
/// metadata maps returned by routing requests.
/// Encoding and decoding these values on the wire is the channel
/// implementation's job.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Bytes(Vec<u8>),
    String(String),
    List(Vec<Value>),
    Map(HashMap<String, Value>),
}

impl Value {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    #[inline]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    #[inline]
    pub fn as_string(&self) -> Option<&String> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    #[inline]
    pub fn as_list(&self) -> Option<&Vec<Value>> {
        match self {
            Value::List(v) => Some(v),
            _ => None,
        }
    }

    #[inline]
    pub fn as_map(&self) -> Option<&HashMap<String, Value>> {
        match self {
            Value::Map(v) => Some(v),
            _ => None,
        }
    }

    #[inline]
    pub fn try_into_int(self) -> Result<i64, Self> {
        match self {
            Value::Integer(v) => Ok(v),
            _ => Err(self),
        }
    }

    #[inline]
    pub fn try_into_string(self) -> Result<String, Self> {
        match self {
            Value::String(v) => Ok(v),
            _ => Err(self),
        }
    }

    #[inline]
    pub fn try_into_list(self) -> Result<Vec<Value>, Self> {
        match self {
            Value::List(v) => Ok(v),
            _ => Err(self),
        }
    }

    #[inline]
    pub fn try_into_map(self) -> Result<HashMap<String, Value>, Self> {
        match self {
            Value::Map(v) => Ok(v),
            _ => Err(self),
        }
    }

    /// Compare two values by their data.
    ///
    /// Data equality is defined like the regular equality ([`PartialEq`]),
    /// except for floats ([`f64`]), which are compared by their bit
    /// representation.
    /// Therefore (among other differences), `NaN` == `NaN` and
    /// `-0.0` != `0.0`.
    pub fn eq_data(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(v1), Value::Boolean(v2)) => v1 == v2,
            (Value::Integer(v1), Value::Integer(v2)) => v1 == v2,
            (Value::Float(v1), Value::Float(v2)) => v1.to_bits() == v2.to_bits(),
            (Value::Bytes(v1), Value::Bytes(v2)) => v1 == v2,
            (Value::String(v1), Value::String(v2)) => v1 == v2,
            (Value::List(v1), Value::List(v2)) => {
                v1.len() == v2.len() && v1.iter().zip(v2.iter()).all(|(v1, v2)| v1.eq_data(v2))
            }
            (Value::Map(v1), Value::Map(v2)) => {
                v1.len() == v2.len()
                    && v1
                        .iter()
                        .all(|(k, v1)| v2.get(k).map_or(false, |v2| v1.eq_data(v2)))
            }
            _ => false,
        }
    }
}

impl From<bool> for Value {
    #[inline]
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

#[duplicate_item(
    int_type;
    [ i8 ];
    [ i16 ];
    [ i32 ];
    [ i64 ];
    [ u8 ];
    [ u16 ];
    [ u32 ];
)]
impl From<int_type> for Value {
    #[inline]
    fn from(value: int_type) -> Self {
        Value::Integer(value.into())
    }
}

impl From<f64> for Value {
    #[inline]
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    #[inline]
    fn from(value: &str) -> Self {
        Value::String(String::from(value))
    }
}

impl From<String> for Value {
    #[inline]
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Vec<Value>> for Value {
    #[inline]
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

impl From<HashMap<String, Value>> for Value {
    #[inline]
    fn from(value: HashMap<String, Value>) -> Self {
        Value::Map(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    #[inline]
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => value.into(),
            None => Value::Null,
        }
    }
}
