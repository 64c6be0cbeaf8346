//! Parameter values and text-format value decoding.
//!
//! Every codec hands rows to callers in text format (MySQL binary rows are
//! rendered to text while decoding), so one [`FromValue`] registry serves all
//! protocols.

use crate::error::{Error, Result};

/// A bound parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    /// Size on the wire when sent in text format (PostgreSQL, DRDA).
    pub fn text_len(&self) -> usize {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(i) => i.to_string().len(),
            Value::Float(f) => f.to_string().len(),
            Value::Text(s) => s.len(),
            Value::Bytes(b) => b.len(),
        }
    }

    /// Size on the wire in MySQL's binary protocol, without length prefixes.
    pub fn binary_len(&self) -> usize {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 8,
            Value::Text(s) => s.len(),
            Value::Bytes(b) => b.len(),
        }
    }

    /// Render the value in text format, `None` for NULL.
    pub fn to_text(&self) -> Option<Vec<u8>> {
        match self {
            Value::Null => None,
            Value::Bool(true) => Some(b"t".to_vec()),
            Value::Bool(false) => Some(b"f".to_vec()),
            Value::Int(i) => Some(i.to_string().into_bytes()),
            Value::Float(f) => Some(f.to_string().into_bytes()),
            Value::Text(s) => Some(s.as_bytes().to_vec()),
            Value::Bytes(b) => Some(b.clone()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Trait for types that can be bound as statement parameters.
pub trait ToParams {
    fn to_params(self) -> Vec<Value>;
}

impl ToParams for () {
    fn to_params(self) -> Vec<Value> {
        Vec::new()
    }
}

impl ToParams for Vec<Value> {
    fn to_params(self) -> Vec<Value> {
        self
    }
}

impl ToParams for &[Value] {
    fn to_params(self) -> Vec<Value> {
        self.to_vec()
    }
}

macro_rules! impl_to_params_tuple {
    ($($name:ident),+) => {
        impl<$($name: Into<Value>),+> ToParams for ($($name,)+) {
            #[expect(non_snake_case)]
            fn to_params(self) -> Vec<Value> {
                let ($($name,)+) = self;
                vec![$($name.into()),+]
            }
        }
    };
}

impl_to_params_tuple!(A);
impl_to_params_tuple!(A, B);
impl_to_params_tuple!(A, B, C);
impl_to_params_tuple!(A, B, C, D);
impl_to_params_tuple!(A, B, C, D, E);
impl_to_params_tuple!(A, B, C, D, E, F);

/// Trait for decoding text-format column values into Rust types.
pub trait FromValue<'a>: Sized {
    /// Decode from NULL value.
    ///
    /// Default implementation returns an error. Override for types that can
    /// represent NULL (like `Option<T>`).
    fn from_null() -> Result<Self> {
        Err(Error::Decode("unexpected NULL value".into()))
    }

    /// Decode from text format bytes.
    fn from_text(bytes: &'a [u8]) -> Result<Self>;
}

fn utf8(bytes: &[u8]) -> Result<&str> {
    simdutf8::basic::from_utf8(bytes).map_err(|e| Error::Decode(format!("invalid UTF-8: {}", e)))
}

impl<'a, T: FromValue<'a>> FromValue<'a> for Option<T> {
    fn from_null() -> Result<Self> {
        Ok(None)
    }

    fn from_text(bytes: &'a [u8]) -> Result<Self> {
        T::from_text(bytes).map(Some)
    }
}

impl FromValue<'_> for bool {
    fn from_text(bytes: &[u8]) -> Result<Self> {
        match bytes {
            b"t" | b"true" | b"TRUE" | b"T" | b"1" => Ok(true),
            b"f" | b"false" | b"FALSE" | b"F" | b"0" => Ok(false),
            _ => Err(Error::Decode(format!(
                "invalid boolean: {:?}",
                String::from_utf8_lossy(bytes)
            ))),
        }
    }
}

macro_rules! impl_from_value_parse {
    ($($ty:ty),+) => {
        $(
            impl FromValue<'_> for $ty {
                fn from_text(bytes: &[u8]) -> Result<Self> {
                    utf8(bytes)?.trim().parse().map_err(|e| {
                        Error::Decode(format!("invalid {}: {}", stringify!($ty), e))
                    })
                }
            }
        )+
    };
}

impl_from_value_parse!(i16, i32, i64, u32, u64, f32, f64);

impl FromValue<'_> for String {
    fn from_text(bytes: &[u8]) -> Result<Self> {
        utf8(bytes).map(str::to_owned)
    }
}

impl<'a> FromValue<'a> for &'a str {
    fn from_text(bytes: &'a [u8]) -> Result<Self> {
        utf8(bytes)
    }
}

impl<'a> FromValue<'a> for &'a [u8] {
    fn from_text(bytes: &'a [u8]) -> Result<Self> {
        Ok(bytes)
    }
}

impl FromValue<'_> for Vec<u8> {
    fn from_text(bytes: &[u8]) -> Result<Self> {
        Ok(bytes.to_vec())
    }
}
