//! Dynamic property-list value type.

use std::time::SystemTime;

/// A dynamic property-list value.
///
/// Dictionaries keep insertion order. Inserting an existing key replaces
/// its value in place.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Boolean value.
    Boolean(bool),
    /// Signed integer.
    Integer(i64),
    /// Floating point value.
    Real(f64),
    /// UTF-8 string.
    String(String),
    /// Raw bytes.
    Data(Vec<u8>),
    /// Point in time.
    Date(SystemTime),
    /// Ordered array of values.
    Array(Vec<Value>),
    /// String-keyed dictionary.
    Dictionary(Vec<(String, Value)>),
    /// Keyed-archiver object reference.
    Uid(u64),
}

impl Value {
    /// Create a dictionary value from key/value pairs.
    ///
    /// Later duplicates replace earlier ones.
    pub fn dict<K, I>(pairs: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let mut dict = Value::Dictionary(Vec::new());
        for (key, value) in pairs {
            dict.insert(key, value);
        }
        dict
    }

    /// Create an empty dictionary.
    pub fn empty_dict() -> Self {
        Value::Dictionary(Vec::new())
    }

    /// Insert a key into this dictionary. Returns false if this is not a dictionary.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> bool {
        match self {
            Value::Dictionary(pairs) => {
                let key = key.into();
                match pairs.iter_mut().find(|(k, _)| *k == key) {
                    Some(slot) => slot.1 = value,
                    None => pairs.push((key, value)),
                }
                true
            }
            _ => false,
        }
    }

    /// Remove a key from this dictionary, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        match self {
            Value::Dictionary(pairs) => {
                let index = pairs.iter().position(|(k, _)| k == key)?;
                Some(pairs.remove(index).1)
            }
            _ => None,
        }
    }

    /// Look up a key in this dictionary value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Dictionary(pairs) => pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Get an array element by position.
    pub fn item(&self, index: usize) -> Option<&Value> {
        self.as_array().and_then(|items| items.get(index))
    }

    /// Get this value as a boolean, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Get this value as an integer, if it is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get this value as a real number. Integers are widened.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Real(r) => Some(*r),
            Value::Integer(n) => Some(*n as f64),
            _ => None,
        }
    }

    /// Get this value as a string slice, if it is one.
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get this value as bytes, if it is data.
    pub fn as_data(&self) -> Option<&[u8]> {
        match self {
            Value::Data(b) => Some(b),
            _ => None,
        }
    }

    /// Get this value as a date, if it is one.
    pub fn as_date(&self) -> Option<SystemTime> {
        match self {
            Value::Date(d) => Some(*d),
            _ => None,
        }
    }

    /// Get this value as an array, if it is one.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Get this value's dictionary entries, if it is a dictionary.
    pub fn as_dictionary(&self) -> Option<&[(String, Value)]> {
        match self {
            Value::Dictionary(pairs) => Some(pairs),
            _ => None,
        }
    }

    /// Returns the name of this value's plist type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Real(_) => "real",
            Value::String(_) => "string",
            Value::Data(_) => "data",
            Value::Date(_) => "date",
            Value::Array(_) => "array",
            Value::Dictionary(_) => "dictionary",
            Value::Uid(_) => "uid",
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<f64> for Value {
    fn from(r: f64) -> Self {
        Value::Real(r)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Data(b)
    }
}

impl From<SystemTime> for Value {
    fn from(d: SystemTime) -> Self {
        Value::Date(d)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}
