//! Ordered multi-valued containers for query parameters, form fields, headers
//! and cookies.
//!
//! Every input is normalized to its string wire form on insertion, and keys
//! are kept sorted so encoding is deterministic.

use std::collections::BTreeMap;

use cookie::Cookie;
use serde_json::{Map, Value};
use url::form_urlencoded;

/// A scalar that has a single string wire representation.
pub trait ToValue {
    fn to_value(&self) -> String;
}

/// Anything that can populate one key of a [`Values`] container with zero or
/// more string values.
pub trait IntoValues {
    fn into_values(self) -> Vec<String>;
}

macro_rules! display_values {
    ($($ty:ty),* $(,)?) => {
        $(
            impl ToValue for $ty {
                fn to_value(&self) -> String {
                    self.to_string()
                }
            }

            impl IntoValues for $ty {
                fn into_values(self) -> Vec<String> {
                    vec![self.to_value()]
                }
            }
        )*
    };
}

// `Display` for floats already yields the shortest round-trip decimal without
// exponent notation.
display_values!(
    bool, char, i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64
);

impl ToValue for str {
    fn to_value(&self) -> String {
        self.to_owned()
    }
}

impl ToValue for String {
    fn to_value(&self) -> String {
        self.clone()
    }
}

impl<T: ToValue + ?Sized> ToValue for &T {
    fn to_value(&self) -> String {
        (**self).to_value()
    }
}

impl IntoValues for &str {
    fn into_values(self) -> Vec<String> {
        vec![self.to_owned()]
    }
}

impl IntoValues for String {
    fn into_values(self) -> Vec<String> {
        vec![self]
    }
}

impl IntoValues for &String {
    fn into_values(self) -> Vec<String> {
        vec![self.clone()]
    }
}

impl<T: ToValue> IntoValues for Vec<T> {
    fn into_values(self) -> Vec<String> {
        self.iter().map(ToValue::to_value).collect()
    }
}

impl<T: ToValue> IntoValues for &[T] {
    fn into_values(self) -> Vec<String> {
        self.iter().map(ToValue::to_value).collect()
    }
}

impl<T: ToValue, const N: usize> IntoValues for [T; N] {
    fn into_values(self) -> Vec<String> {
        self.iter().map(ToValue::to_value).collect()
    }
}

/// Sorted multi-valued string mapping.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Values {
    entries: BTreeMap<String, Vec<String>>,
}

/// Query parameters.
pub type Params = Values;
/// URL-encoded form fields.
pub type Form = Values;
/// Request header inputs, converted to a header map when applied.
pub type Headers = Values;

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn get_all(&self, key: &str) -> &[String] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Replaces every value of `key`.
    pub fn set(&mut self, key: impl Into<String>, value: impl IntoValues) -> &mut Self {
        self.entries.insert(key.into(), value.into_values());
        self
    }

    /// Appends to the values of `key`.
    pub fn add(&mut self, key: impl Into<String>, value: impl IntoValues) -> &mut Self {
        self.entries
            .entry(key.into())
            .or_default()
            .extend(value.into_values());
        self
    }

    /// Sets `key` only when it is absent.
    pub fn set_default(&mut self, key: impl Into<String>, value: impl IntoValues) -> &mut Self {
        self.entries
            .entry(key.into())
            .or_insert_with(|| value.into_values());
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        self.entries.remove(key)
    }

    /// Copies every key of `other`, replacing existing values.
    pub fn update(&mut self, other: &Values) -> &mut Self {
        for (key, values) in &other.entries {
            self.entries.insert(key.clone(), values.clone());
        }
        self
    }

    /// Copies keys of `other` that are absent here.
    pub fn merge(&mut self, other: &Values) -> &mut Self {
        for (key, values) in &other.entries {
            self.entries
                .entry(key.clone())
                .or_insert_with(|| values.clone());
        }
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(key, values)| (key.as_str(), values.as_slice()))
    }

    /// Flattened `(key, value)` pairs in key order.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().flat_map(|(key, values)| {
            values
                .iter()
                .map(move |value| (key.as_str(), value.as_str()))
        })
    }

    /// `key=value` pairs joined by `&`, sorted by key. With `url_escaped`
    /// both sides use `application/x-www-form-urlencoded` escaping.
    pub fn encode(&self, url_escaped: bool) -> String {
        if url_escaped {
            let mut serializer = form_urlencoded::Serializer::new(String::new());
            for (key, value) in self.pairs() {
                serializer.append_pair(key, value);
            }
            return serializer.finish();
        }

        self.pairs()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// JSON object view: single values as strings, multiple values as arrays.
    pub fn to_json(&self) -> Value {
        let mut object = Map::new();
        for (key, values) in &self.entries {
            let value = match values.as_slice() {
                [single] => Value::String(single.clone()),
                many => Value::Array(many.iter().cloned().map(Value::String).collect()),
            };
            object.insert(key.clone(), value);
        }
        Value::Object(object)
    }

    pub(crate) fn from_query(query: &str) -> Self {
        let mut values = Self::new();
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            values.add(key.into_owned(), value.into_owned());
        }
        values
    }
}

impl<K, V> FromIterator<(K, V)> for Values
where
    K: Into<String>,
    V: IntoValues,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut values = Self::new();
        for (key, value) in iter {
            values.add(key, value);
        }
        values
    }
}

impl<K, V, const N: usize> From<[(K, V); N]> for Values
where
    K: Into<String>,
    V: IntoValues,
{
    fn from(pairs: [(K, V); N]) -> Self {
        pairs.into_iter().collect()
    }
}

/// Name to value cookie mapping sent as a single `Cookie` header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Cookies {
    entries: BTreeMap<String, String>,
}

impl Cookies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn has(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl ToValue) -> &mut Self {
        self.entries.insert(name.into(), value.to_value());
        self
    }

    pub fn set_default(&mut self, name: impl Into<String>, value: impl ToValue) -> &mut Self {
        self.entries
            .entry(name.into())
            .or_insert_with(|| value.to_value());
        self
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.entries.remove(name)
    }

    pub fn update(&mut self, other: &Cookies) -> &mut Self {
        for (name, value) in &other.entries {
            self.entries.insert(name.clone(), value.clone());
        }
        self
    }

    pub fn merge(&mut self, other: &Cookies) -> &mut Self {
        for (name, value) in &other.entries {
            self.entries
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// Renders `name=value; name2=value2` with percent-encoded names and values.
    pub fn header_value(&self) -> String {
        self.entries
            .iter()
            .map(|(name, value)| {
                Cookie::new(name.as_str(), value.as_str())
                    .encoded()
                    .to_string()
            })
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn to_cookies(&self) -> Vec<Cookie<'static>> {
        self.entries
            .iter()
            .map(|(name, value)| Cookie::new(name.clone(), value.clone()))
            .collect()
    }
}

impl<K, V> FromIterator<(K, V)> for Cookies
where
    K: Into<String>,
    V: ToValue,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut cookies = Self::new();
        for (name, value) in iter {
            cookies.set(name, value);
        }
        cookies
    }
}

impl<K, V, const N: usize> From<[(K, V); N]> for Cookies
where
    K: Into<String>,
    V: ToValue,
{
    fn from(pairs: [(K, V); N]) -> Self {
        pairs.into_iter().collect()
    }
}
