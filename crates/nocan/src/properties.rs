// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Typed key/value system properties published by the daemon.
//!
//! Keys are sorted on the wire so repeated packs of the same map are
//! byte-identical.

use crate::event::EventError;
use std::collections::BTreeMap;
use std::fmt;

/// A single property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Str(String),
    Int32(i32),
    Uint32(u32),
    Float32(f32),
}

const TYPE_NULL: u8 = 0;
const TYPE_BOOL: u8 = 1;
const TYPE_STRING: u8 = 2;
const TYPE_INT32: u8 = 3;
const TYPE_UINT32: u8 = 4;
const TYPE_FLOAT32: u8 = 5;

impl PropertyValue {
    fn type_byte(&self) -> u8 {
        match self {
            Self::Null => TYPE_NULL,
            Self::Bool(_) => TYPE_BOOL,
            Self::Str(_) => TYPE_STRING,
            Self::Int32(_) => TYPE_INT32,
            Self::Uint32(_) => TYPE_UINT32,
            Self::Float32(_) => TYPE_FLOAT32,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(v) => write!(f, "{}", v),
            Self::Str(v) => write!(f, "{}", v),
            Self::Int32(v) => write!(f, "{}", v),
            Self::Uint32(v) => write!(f, "{}", v),
            Self::Float32(v) => write!(f, "{}", v),
        }
    }
}

/// Ordered map of typed properties with a compact wire form.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Properties {
    map: BTreeMap<String, PropertyValue>,
}

impl Properties {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a property; keys longer than 127 bytes are rejected.
    pub fn add(&mut self, key: &str, value: PropertyValue) -> bool {
        if key.len() > 127 {
            return false;
        }
        self.map.insert(key.to_string(), value);
        true
    }

    pub fn add_string(&mut self, key: &str, value: &str) -> bool {
        self.add(key, PropertyValue::Str(value.to_string()))
    }

    pub fn add_bool(&mut self, key: &str, value: bool) -> bool {
        self.add(key, PropertyValue::Bool(value))
    }

    pub fn add_uint32(&mut self, key: &str, value: u32) -> bool {
        self.add(key, PropertyValue::Uint32(value))
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.map.get(key)
    }

    /// Render a property as a string, empty when absent.
    #[must_use]
    pub fn as_string(&self, key: &str) -> String {
        self.map.get(key).map(|v| v.to_string()).unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    #[must_use]
    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for (key, value) in &self.map {
            buf.push(key.len() as u8);
            buf.extend_from_slice(key.as_bytes());
            buf.push(value.type_byte());
            match value {
                PropertyValue::Null => {}
                PropertyValue::Bool(v) => buf.push(u8::from(*v)),
                PropertyValue::Str(s) => {
                    let take = s.len().min(255);
                    buf.push(take as u8);
                    buf.extend_from_slice(&s.as_bytes()[..take]);
                }
                PropertyValue::Int32(v) => buf.extend_from_slice(&v.to_be_bytes()),
                PropertyValue::Uint32(v) => buf.extend_from_slice(&v.to_be_bytes()),
                PropertyValue::Float32(v) => buf.extend_from_slice(&v.to_be_bytes()),
            }
        }
        buf
    }

    pub fn unpack(buf: &[u8]) -> Result<Self, EventError> {
        let mut props = Self::new();
        let mut pos = 0usize;

        while pos < buf.len() {
            let key_len = usize::from(buf[pos]);
            pos += 1;
            if pos + key_len + 1 > buf.len() {
                return Err(EventError::ShortPayload);
            }
            let key = String::from_utf8_lossy(&buf[pos..pos + key_len]).into_owned();
            pos += key_len;
            let type_byte = buf[pos];
            pos += 1;

            let value = match type_byte {
                TYPE_NULL => PropertyValue::Null,
                TYPE_BOOL => {
                    let v = *buf.get(pos).ok_or(EventError::ShortPayload)?;
                    pos += 1;
                    PropertyValue::Bool(v != 0)
                }
                TYPE_STRING => {
                    let len = usize::from(*buf.get(pos).ok_or(EventError::ShortPayload)?);
                    pos += 1;
                    if pos + len > buf.len() {
                        return Err(EventError::ShortPayload);
                    }
                    let s = String::from_utf8_lossy(&buf[pos..pos + len]).into_owned();
                    pos += len;
                    PropertyValue::Str(s)
                }
                TYPE_INT32 => {
                    let v = read_u32(buf, &mut pos)?;
                    PropertyValue::Int32(v as i32)
                }
                TYPE_UINT32 => PropertyValue::Uint32(read_u32(buf, &mut pos)?),
                TYPE_FLOAT32 => PropertyValue::Float32(f32::from_bits(read_u32(buf, &mut pos)?)),
                other => {
                    return Err(EventError::Protocol(format!(
                        "unexpected property type {} for key '{}'",
                        other, key
                    )))
                }
            };
            props.map.insert(key, value);
        }
        Ok(props)
    }
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Result<u32, EventError> {
    if *pos + 4 > buf.len() {
        return Err(EventError::ShortPayload);
    }
    let v = u32::from_be_bytes([buf[*pos], buf[*pos + 1], buf[*pos + 2], buf[*pos + 3]]);
    *pos += 4;
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack_roundtrip() {
        let mut props = Properties::new();
        props.add_string("nocand_version", "0.3.0");
        props.add_bool("termination", true);
        props.add_uint32("spi_speed", 250_000);
        props.add("offset", PropertyValue::Int32(-42));
        props.add("ratio", PropertyValue::Float32(0.5));
        props.add("nothing", PropertyValue::Null);

        let packed = props.pack();
        let unpacked = Properties::unpack(&packed).expect("unpack");
        assert_eq!(unpacked, props);
    }

    #[test]
    fn test_pack_is_deterministic() {
        let mut a = Properties::new();
        a.add_string("b", "2");
        a.add_string("a", "1");

        let mut b = Properties::new();
        b.add_string("a", "1");
        b.add_string("b", "2");

        assert_eq!(a.pack(), b.pack());
    }

    #[test]
    fn test_rejects_long_key() {
        let mut props = Properties::new();
        let key = "k".repeat(128);
        assert!(!props.add(&key, PropertyValue::Null));
        assert!(props.is_empty());
    }

    #[test]
    fn test_as_string() {
        let mut props = Properties::new();
        props.add_uint32("count", 7);
        assert_eq!(props.as_string("count"), "7");
        assert_eq!(props.as_string("missing"), "");
    }

    #[test]
    fn test_unpack_truncated() {
        let mut props = Properties::new();
        props.add_string("key", "value");
        let packed = props.pack();
        assert!(Properties::unpack(&packed[..packed.len() - 1]).is_err());
    }

    #[test]
    fn test_unpack_unknown_type() {
        let buf = [1, b'k', 9];
        assert!(matches!(
            Properties::unpack(&buf),
            Err(EventError::Protocol(_))
        ));
    }
}
