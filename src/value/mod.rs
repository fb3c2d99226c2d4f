//! Printable representation of the values read out of the inferior.

pub mod parser;

use bytes::Bytes;
use indexmap::IndexMap;
use itertools::Itertools;
use std::fmt::{self, Display, Formatter};

// containers print at most this many elements
const MAX_CONTAINER_ITEMS: usize = 8;

/// A parsed value tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Uint(u64),
    Float32(f32),
    Float64(f64),
    Complex64 { re: f32, im: f32 },
    Complex128 { re: f64, im: f64 },
    Bool(bool),
    Ptr { addr: u64, pointee: Option<Box<Value>> },
    Func { addr: u64 },
    String(String),
    Slice { items: Vec<Value>, len: usize },
    Array { items: Vec<Value>, len: usize },
    Struct { fields: IndexMap<String, Value>, abbreviated: bool },
    Interface { type_name: Option<String>, value: Option<Box<Value>>, abbreviated: bool },
    Map { entries: Vec<(Value, Value)>, nil: bool },
    Void(Bytes),
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Uint(v) => write!(f, "{v}"),
            Value::Float32(v) => f.write_str(&format_f32(*v)),
            Value::Float64(v) => f.write_str(&format_f64(*v)),
            Value::Complex64 { re, im } => {
                write!(f, "({}{}i)", format_f32(*re), signed(format_f32(*im)))
            }
            Value::Complex128 { re, im } => {
                write!(f, "({}{}i)", format_f64(*re), signed(format_f64(*im)))
            }
            Value::Bool(v) => write!(f, "{v}"),
            Value::Ptr { addr, pointee } => match pointee {
                Some(pointee) => write!(f, "&{pointee}"),
                None => write!(f, "{addr:#x}"),
            },
            Value::Func { addr } => write!(f, "{addr:#x}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Slice { items, len } => {
                if *len == 0 {
                    return f.write_str("nil");
                }
                let vals = items.iter().join(", ");
                if *len > items.len() {
                    write!(f, "[]{{{vals}, ...}}")
                } else {
                    write!(f, "[]{{{vals}}}")
                }
            }
            Value::Array { items, len } => {
                let vals = items.iter().join(", ");
                if *len > items.len() {
                    write!(f, "[{}]{{{vals}, ...}}", items.len())
                } else {
                    write!(f, "[{len}]{{{vals}}}")
                }
            }
            Value::Struct {
                fields,
                abbreviated,
            } => {
                if *abbreviated {
                    return f.write_str("{...}");
                }
                let vals = fields
                    .iter()
                    .map(|(name, val)| format!("{name}: {val}"))
                    .join(", ");
                write!(f, "{{{vals}}}")
            }
            Value::Interface {
                type_name,
                value,
                abbreviated,
            } => {
                if *abbreviated {
                    return f.write_str("{...}");
                }
                let (Some(type_name), Some(value)) = (type_name, value) else {
                    return f.write_str("nil");
                };
                // "struct main.S" reads better without the keyword
                let type_name = type_name.strip_prefix("struct ").unwrap_or(type_name);
                write!(f, "{type_name}({value})")
            }
            Value::Map { entries, nil } => {
                if *nil {
                    return f.write_str("nil");
                }
                let vals = entries
                    .iter()
                    .map(|(key, val)| format!("{key}: {val}"))
                    .join(", ");
                write!(f, "{{{vals}}}")
            }
            Value::Void(bytes) => {
                write!(f, "[{}]", bytes.iter().join(" "))
            }
        }
    }
}

impl Value {
    /// Look up a field of a struct value.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Struct { fields, .. } => fields.get(name),
            _ => None,
        }
    }

    /// How many elements of a container of length `len` are worth parsing,
    /// everything past the printable count ends up behind `, ...` anyway.
    pub(crate) fn visible_items(len: usize) -> usize {
        len.min(MAX_CONTAINER_ITEMS)
    }
}

fn signed(formatted: String) -> String {
    if formatted.starts_with('-') {
        formatted
    } else {
        format!("+{formatted}")
    }
}

macro_rules! impl_format_float {
    ($name: ident, $ty: ty) => {
        /// Shortest round-trip decimal; scientific notation outside the
        /// `%g` positional range.
        fn $name(v: $ty) -> String {
            if v.is_nan() {
                return "NaN".to_string();
            }
            if v.is_infinite() {
                return if v > 0.0 { "+Inf" } else { "-Inf" }.to_string();
            }

            let sci = format!("{v:e}");
            let (mantissa, exp) = sci.split_once('e').expect("always present");
            let exp: i32 = exp.parse().expect("always a number");
            if exp < -4 || exp >= 6 {
                let sign = if exp < 0 { '-' } else { '+' };
                format!("{mantissa}e{sign}{:02}", exp.abs())
            } else {
                format!("{v}")
            }
        }
    };
}

impl_format_float!(format_f32, f32);
impl_format_float!(format_f64, f64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_values() {
        assert_eq!(Value::Int(0).to_string(), "0");
        assert_eq!(Value::Uint(0).to_string(), "0");
        assert_eq!(Value::Float64(0.0).to_string(), "0");
        assert_eq!(Value::Bool(false).to_string(), "false");
        assert_eq!(Value::String(String::new()).to_string(), "\"\"");
        assert_eq!(
            Value::Slice {
                items: vec![],
                len: 0
            }
            .to_string(),
            "nil"
        );
        // a null pointer never prints dereferenced
        assert_eq!(
            Value::Ptr {
                addr: 0,
                pointee: None
            }
            .to_string(),
            "0x0"
        );
        assert_eq!(
            Value::Map {
                entries: vec![],
                nil: true
            }
            .to_string(),
            "nil"
        );
        assert_eq!(
            Value::Interface {
                type_name: None,
                value: None,
                abbreviated: false
            }
            .to_string(),
            "nil"
        );
    }

    #[test]
    fn test_floats() {
        assert_eq!(Value::Float64(1.5).to_string(), "1.5");
        assert_eq!(Value::Float64(100000.0).to_string(), "100000");
        assert_eq!(Value::Float64(1000000.0).to_string(), "1e+06");
        assert_eq!(Value::Float64(0.0001).to_string(), "0.0001");
        assert_eq!(Value::Float64(0.00001).to_string(), "1e-05");
        assert_eq!(Value::Float64(-2.25).to_string(), "-2.25");
        assert_eq!(Value::Float32(3.5).to_string(), "3.5");
        assert_eq!(Value::Float64(f64::NAN).to_string(), "NaN");
    }

    #[test]
    fn test_complex() {
        assert_eq!(
            Value::Complex128 { re: 1.0, im: 2.0 }.to_string(),
            "(1+2i)"
        );
        assert_eq!(
            Value::Complex64 { re: 0.5, im: -1.5 }.to_string(),
            "(0.5-1.5i)"
        );
    }

    #[test]
    fn test_containers() {
        let slice = Value::Slice {
            items: vec![Value::Int(1), Value::Int(2)],
            len: 2,
        };
        assert_eq!(slice.to_string(), "[]{1, 2}");

        let truncated = Value::Slice {
            items: (0..8).map(Value::Int).collect(),
            len: 20,
        };
        assert_eq!(
            truncated.to_string(),
            "[]{0, 1, 2, 3, 4, 5, 6, 7, ...}"
        );

        let array = Value::Array {
            items: vec![Value::Int(7), Value::Int(8)],
            len: 2,
        };
        assert_eq!(array.to_string(), "[2]{7, 8}");
    }

    #[test]
    fn test_struct_and_pointer() {
        let mut fields = IndexMap::new();
        fields.insert("a".to_string(), Value::Int(1));
        fields.insert("b".to_string(), Value::Bool(true));
        let value = Value::Struct {
            fields,
            abbreviated: false,
        };
        assert_eq!(value.to_string(), "{a: 1, b: true}");

        let ptr = Value::Ptr {
            addr: 0xc000010000,
            pointee: Some(Box::new(value)),
        };
        assert_eq!(ptr.to_string(), "&{a: 1, b: true}");

        let abbreviated = Value::Struct {
            fields: IndexMap::new(),
            abbreviated: true,
        };
        assert_eq!(abbreviated.to_string(), "{...}");
    }

    #[test]
    fn test_interface() {
        let value = Value::Interface {
            type_name: Some("struct main.S".to_string()),
            value: Some(Box::new(Value::Int(42))),
            abbreviated: false,
        };
        assert_eq!(value.to_string(), "main.S(42)");

        let opaque = Value::Interface {
            type_name: None,
            value: None,
            abbreviated: true,
        };
        assert_eq!(opaque.to_string(), "{...}");
    }

    #[test]
    fn test_map_and_void() {
        let map = Value::Map {
            entries: vec![(Value::String("k".to_string()), Value::Int(3))],
            nil: false,
        };
        assert_eq!(map.to_string(), "{\"k\": 3}");

        let void = Value::Void(Bytes::from_static(&[1, 2, 3]));
        assert_eq!(void.to_string(), "[1 2 3]");
    }
}
