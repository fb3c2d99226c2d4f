//! Turns raw bytes read out of the inferior into [`Value`] trees, guided by
//! the Go types recovered from DWARF.

use crate::binary::types::{DieRef, GoType, TypeResolver};
use crate::debugapi::MemoryReader;
use crate::value::Value;
use bytes::Bytes;
use indexmap::IndexMap;
use std::sync::Arc;

// strings longer than this are cut, the tail of a corrupted length word
// would otherwise stall the whole trace
const MAX_STRING_LEN: u64 = 1 << 20;

// overflow bucket chains longer than this are considered corrupted
const MAX_OVERFLOW_BUCKETS: usize = 1024;

/// Value parser. The struct recursion budget (`parse_level`) decrements per
/// struct level; the wrappers of the builtin types (string, slice,
/// interface, map buckets) do not consume it.
pub struct ValueParser<'a> {
    resolver: Option<&'a dyn TypeResolver>,
}

impl<'a> ValueParser<'a> {
    pub fn new(resolver: Option<&'a dyn TypeResolver>) -> Self {
        Self { resolver }
    }

    /// Parse the `buf` bytes as a value of `typ`. `depth` is the remaining
    /// struct recursion budget.
    pub fn parse(
        &self,
        mem: &mut dyn MemoryReader,
        typ: &Arc<GoType>,
        buf: &[u8],
        depth: i64,
    ) -> Value {
        match typ.as_ref() {
            GoType::Int { size, .. } => match (*size, buf.len() >= *size as usize) {
                (1, true) => Value::Int(buf[0] as i8 as i64),
                (2, true) => Value::Int(i16::from_le_bytes(buf[..2].try_into().unwrap()) as i64),
                (4, true) => Value::Int(i32::from_le_bytes(buf[..4].try_into().unwrap()) as i64),
                (8, true) => Value::Int(i64::from_le_bytes(buf[..8].try_into().unwrap())),
                _ => Value::Void(Bytes::copy_from_slice(buf)),
            },
            GoType::Uint { size, .. } => match (*size, buf.len() >= *size as usize) {
                (1, true) => Value::Uint(buf[0] as u64),
                (2, true) => Value::Uint(u16::from_le_bytes(buf[..2].try_into().unwrap()) as u64),
                (4, true) => Value::Uint(u32::from_le_bytes(buf[..4].try_into().unwrap()) as u64),
                (8, true) => Value::Uint(u64::from_le_bytes(buf[..8].try_into().unwrap())),
                _ => Value::Void(Bytes::copy_from_slice(buf)),
            },
            GoType::Float { size, .. } => match (*size, buf.len() >= *size as usize) {
                (4, true) => Value::Float32(f32::from_le_bytes(buf[..4].try_into().unwrap())),
                (8, true) => Value::Float64(f64::from_le_bytes(buf[..8].try_into().unwrap())),
                _ => Value::Void(Bytes::copy_from_slice(buf)),
            },
            GoType::Complex { size, .. } => match (*size, buf.len() >= *size as usize) {
                (8, true) => Value::Complex64 {
                    re: f32::from_le_bytes(buf[..4].try_into().unwrap()),
                    im: f32::from_le_bytes(buf[4..8].try_into().unwrap()),
                },
                (16, true) => Value::Complex128 {
                    re: f64::from_le_bytes(buf[..8].try_into().unwrap()),
                    im: f64::from_le_bytes(buf[8..16].try_into().unwrap()),
                },
                _ => Value::Void(Bytes::copy_from_slice(buf)),
            },
            GoType::Bool { .. } => match buf.first() {
                Some(b) => Value::Bool(*b == 1),
                None => Value::Void(Bytes::new()),
            },
            GoType::Ptr { pointee, .. } => self.parse_ptr(mem, *pointee, buf, depth),
            GoType::Func { .. } => Value::Func {
                addr: read_u64(buf).unwrap_or_default(),
            },
            GoType::Struct { name, members, .. } => {
                if name == "string" {
                    self.parse_string(mem, members, buf)
                } else if name.starts_with("[]") {
                    self.parse_slice(mem, members, buf, depth)
                } else if name == "runtime.iface" {
                    self.parse_interface(mem, typ, buf, depth)
                } else if name == "runtime.eface" {
                    self.parse_empty_interface(mem, typ, buf, depth)
                } else {
                    self.parse_struct(mem, members, buf, depth)
                }
            }
            GoType::Array { elem, count, .. } => self.parse_array(mem, elem, *count, buf, depth),
            GoType::Typedef { name, underlying } => {
                if name.starts_with("map[") {
                    self.parse_map(mem, underlying, buf, depth)
                } else {
                    // virtually transparent, the depth budget stays intact
                    self.parse(mem, underlying, buf, depth)
                }
            }
            GoType::Void { .. } => Value::Void(Bytes::copy_from_slice(buf)),
        }
    }

    fn parse_ptr(
        &self,
        mem: &mut dyn MemoryReader,
        pointee: Option<DieRef>,
        buf: &[u8],
        depth: i64,
    ) -> Value {
        let Some(addr) = read_u64(buf) else {
            return Value::Void(Bytes::copy_from_slice(buf));
        };
        if addr == 0 {
            return Value::Ptr {
                addr: 0,
                pointee: None,
            };
        }

        let pointee_type = pointee
            .and_then(|die| self.resolve(die))
            .filter(|typ| typ.byte_size() > 0);
        let Some(pointee_type) = pointee_type else {
            // unsafe.Pointer and friends print as a bare address
            return Value::Ptr {
                addr,
                pointee: None,
            };
        };

        let mut bytes = vec![0u8; pointee_type.byte_size() as usize];
        if let Err(e) = mem.read_memory(addr, &mut bytes) {
            // the value may be uninitialized yet (or too large)
            log::debug!("failed to read memory at {addr:#x}: {e}");
            return Value::Ptr {
                addr,
                pointee: None,
            };
        }
        Value::Ptr {
            addr,
            pointee: Some(Box::new(self.parse(mem, &pointee_type, &bytes, depth))),
        }
    }

    fn parse_string(
        &self,
        mem: &mut dyn MemoryReader,
        members: &[crate::binary::types::Member],
        buf: &[u8],
    ) -> Value {
        let data_off = member_offset(members, "str").unwrap_or(0) as usize;
        let len_off = member_offset(members, "len").unwrap_or(8) as usize;
        let (Some(addr), Some(len)) = (
            read_u64(buf.get(data_off..).unwrap_or_default()),
            read_u64(buf.get(len_off..).unwrap_or_default()),
        ) else {
            return Value::String(String::new());
        };

        let len = len.min(MAX_STRING_LEN);
        let mut bytes = vec![0u8; len as usize];
        if addr != 0 && !bytes.is_empty() {
            if let Err(e) = mem.read_memory(addr, &mut bytes) {
                log::debug!("failed to read memory at {addr:#x}: {e}");
                return Value::String(String::new());
            }
        }
        Value::String(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn parse_slice(
        &self,
        mem: &mut dyn MemoryReader,
        members: &[crate::binary::types::Member],
        buf: &[u8],
        depth: i64,
    ) -> Value {
        let empty = Value::Slice {
            items: vec![],
            len: 0,
        };

        let Some(array_member) = members.iter().find(|m| m.name == "array") else {
            return empty;
        };
        let len_off = member_offset(members, "len").unwrap_or(8) as usize;

        let addr = read_u64(buf.get(array_member.offset as usize..).unwrap_or_default());
        let len = read_u64(buf.get(len_off..).unwrap_or_default());
        let (Some(addr), Some(len)) = (addr, len) else {
            return empty;
        };
        if addr == 0 || len == 0 {
            return empty;
        }

        let GoType::Ptr {
            pointee: Some(elem_die),
            ..
        } = array_member.typ.as_ref()
        else {
            return empty;
        };
        let Some(elem_type) = self.resolve(*elem_die) else {
            return empty;
        };
        let elem_size = elem_type.byte_size();
        if elem_size == 0 {
            return Value::Slice {
                items: vec![],
                len: len as usize,
            };
        }

        let mut items = vec![];
        for i in 0..Value::visible_items(len as usize) {
            let mut bytes = vec![0u8; elem_size as usize];
            if mem
                .read_memory(addr + i as u64 * elem_size, &mut bytes)
                .is_err()
            {
                break;
            }
            items.push(self.parse(mem, &elem_type, &bytes, depth));
        }
        Value::Slice {
            items,
            len: len as usize,
        }
    }

    fn parse_array(
        &self,
        mem: &mut dyn MemoryReader,
        elem: &Arc<GoType>,
        count: u64,
        buf: &[u8],
        depth: i64,
    ) -> Value {
        let stride = elem.byte_size() as usize;
        let mut items = vec![];
        if stride > 0 {
            for i in 0..Value::visible_items(count as usize) {
                let Some(bytes) = buf.get(i * stride..(i + 1) * stride) else {
                    break;
                };
                items.push(self.parse(mem, elem, bytes, depth));
            }
        }
        Value::Array {
            items,
            len: count as usize,
        }
    }

    fn parse_struct(
        &self,
        mem: &mut dyn MemoryReader,
        members: &[crate::binary::types::Member],
        buf: &[u8],
        depth: i64,
    ) -> Value {
        if depth <= 0 {
            return Value::Struct {
                fields: IndexMap::new(),
                abbreviated: true,
            };
        }

        let mut fields = IndexMap::new();
        for member in members {
            let size = member.typ.byte_size() as usize;
            let start = member.offset as usize;
            let value = match buf.get(start..start + size) {
                Some(bytes) => self.parse(mem, &member.typ, bytes, depth - 1),
                None => Value::Void(Bytes::new()),
            };
            fields.insert(member.name.clone(), value);
        }
        Value::Struct {
            fields,
            abbreviated: false,
        }
    }

    fn parse_interface(
        &self,
        mem: &mut dyn MemoryReader,
        typ: &Arc<GoType>,
        buf: &[u8],
        depth: i64,
    ) -> Value {
        let nil = Value::Interface {
            type_name: None,
            value: None,
            abbreviated: false,
        };

        // the iface and itab wrappers need a budget of two on their own
        let GoType::Struct { members, .. } = typ.as_ref() else {
            return nil;
        };
        let header = self.parse_struct(mem, members, buf, 2);

        let Some(&Value::Ptr {
            pointee: Some(ref itab),
            ..
        }) = header.field("tab")
        else {
            return nil;
        };
        if !self.has_runtime_types() {
            // older toolchains map runtime types differently
            return Value::Interface {
                type_name: None,
                value: None,
                abbreviated: true,
            };
        }

        let Some(&Value::Ptr {
            addr: runtime_type_addr,
            ..
        }) = itab.field("_type")
        else {
            return nil;
        };
        let Some(&Value::Ptr { addr: data_addr, .. }) = header.field("data") else {
            return nil;
        };

        self.parse_concrete(mem, runtime_type_addr, data_addr, depth)
            .unwrap_or(nil)
    }

    fn parse_empty_interface(
        &self,
        mem: &mut dyn MemoryReader,
        typ: &Arc<GoType>,
        buf: &[u8],
        depth: i64,
    ) -> Value {
        let nil = Value::Interface {
            type_name: None,
            value: None,
            abbreviated: false,
        };

        // the eface wrapper needs a budget of one on its own
        let GoType::Struct { members, .. } = typ.as_ref() else {
            return nil;
        };
        let header = self.parse_struct(mem, members, buf, 1);

        let Some(&Value::Ptr { addr: data_addr, .. }) = header.field("data") else {
            return nil;
        };
        if data_addr == 0 {
            return nil;
        }
        if !self.has_runtime_types() {
            return Value::Interface {
                type_name: None,
                value: None,
                abbreviated: true,
            };
        }
        let Some(&Value::Ptr {
            addr: runtime_type_addr,
            ..
        }) = header.field("_type")
        else {
            return nil;
        };

        self.parse_concrete(mem, runtime_type_addr, data_addr, depth)
            .unwrap_or(nil)
    }

    /// Resolve the concrete type behind an interface and render the data it
    /// carries.
    fn parse_concrete(
        &self,
        mem: &mut dyn MemoryReader,
        runtime_type_addr: u64,
        data_addr: u64,
        depth: i64,
    ) -> Option<Value> {
        let resolver = self.resolver?;
        let impl_type = match resolver.runtime_type(runtime_type_addr) {
            Ok(typ) => typ,
            Err(e) => {
                log::debug!(
                    "failed to find the impl type (runtime type addr: {runtime_type_addr:#x}): {e}"
                );
                return None;
            }
        };

        let value = if matches!(impl_type.underlying().as_ref(), GoType::Ptr { .. }) {
            self.parse(mem, &impl_type, &data_addr.to_le_bytes(), depth)
        } else {
            // a non-pointer payload sits behind the data pointer
            let mut bytes = vec![0u8; impl_type.byte_size() as usize];
            if let Err(e) = mem.read_memory(data_addr, &mut bytes) {
                log::debug!("failed to read memory at {data_addr:#x}: {e}");
                return None;
            }
            self.parse(mem, &impl_type, &bytes, depth)
        };

        Some(Value::Interface {
            type_name: Some(impl_type.name().to_string()),
            value: Some(Box::new(value)),
            abbreviated: false,
        })
    }

    fn parse_map(
        &self,
        mem: &mut dyn MemoryReader,
        underlying: &Arc<GoType>,
        buf: &[u8],
        depth: i64,
    ) -> Value {
        let nil = Value::Map {
            entries: vec![],
            nil: true,
        };

        let Some(hmap_addr) = read_u64(buf) else {
            return nil;
        };
        if hmap_addr == 0 {
            return nil;
        }

        let hmap_ptr = underlying.underlying();
        let GoType::Ptr {
            pointee: Some(hmap_die),
            ..
        } = hmap_ptr.as_ref()
        else {
            return nil;
        };
        let Some(hmap_type) = self.resolve(*hmap_die) else {
            return nil;
        };

        let Some(b_member) = hmap_type.member("B") else {
            return nil;
        };
        let (Some(buckets_member), Some(old_member)) =
            (hmap_type.member("buckets"), hmap_type.member("oldbuckets"))
        else {
            return nil;
        };

        let mut b = [0u8];
        if mem.read_memory(hmap_addr + b_member.offset, &mut b).is_err() {
            return nil;
        }
        let Ok(buckets_addr) = mem.read_u64(hmap_addr + buckets_member.offset) else {
            return nil;
        };
        if let Ok(old_buckets) = mem.read_u64(hmap_addr + old_member.offset) {
            if old_buckets != 0 {
                log::debug!("the map is growing, its rendered values may be defective");
            }
        }

        let GoType::Ptr {
            pointee: Some(bucket_die),
            ..
        } = buckets_member.typ.as_ref()
        else {
            return nil;
        };
        let Some(bucket_type) = self.resolve(*bucket_die) else {
            return nil;
        };

        let num_buckets = 1u64 << b[0].min(24);
        let bucket_size = bucket_type.byte_size();
        let mut entries = vec![];
        for i in 0..num_buckets {
            self.parse_bucket(
                mem,
                &bucket_type,
                buckets_addr + i * bucket_size,
                depth,
                &mut entries,
            );
        }
        Value::Map {
            entries,
            nil: false,
        }
    }

    /// Collect the live entries of one bucket and of its overflow chain.
    fn parse_bucket(
        &self,
        mem: &mut dyn MemoryReader,
        bucket_type: &Arc<GoType>,
        mut bucket_addr: u64,
        depth: i64,
        entries: &mut Vec<(Value, Value)>,
    ) {
        let (Some(tophash), Some(keys), Some(values), Some(overflow)) = (
            bucket_type.member("tophash"),
            bucket_type.member("keys"),
            bucket_type.member("values"),
            bucket_type.member("overflow"),
        ) else {
            return;
        };
        let (GoType::Array { elem: key_type, count, .. }, GoType::Array { elem: value_type, .. }) =
            (keys.typ.as_ref(), values.typ.as_ref())
        else {
            return;
        };
        let slots = *count;
        let key_size = key_type.byte_size();
        let value_size = value_type.byte_size();

        for _ in 0..MAX_OVERFLOW_BUCKETS {
            if bucket_addr == 0 {
                return;
            }

            let mut hashes = vec![0u8; slots as usize];
            if mem.read_memory(bucket_addr + tophash.offset, &mut hashes).is_err() {
                return;
            }

            for (slot, hash) in hashes.iter().enumerate() {
                if *hash == 0 {
                    continue;
                }
                let slot = slot as u64;

                let mut key_buf = vec![0u8; key_size as usize];
                let mut value_buf = vec![0u8; value_size as usize];
                let key_addr = bucket_addr + keys.offset + slot * key_size;
                let value_addr = bucket_addr + values.offset + slot * value_size;
                if mem.read_memory(key_addr, &mut key_buf).is_err()
                    || mem.read_memory(value_addr, &mut value_buf).is_err()
                {
                    continue;
                }

                entries.push((
                    self.parse(mem, key_type, &key_buf, depth),
                    self.parse(mem, value_type, &value_buf, depth),
                ));
            }

            bucket_addr = match mem.read_u64(bucket_addr + overflow.offset) {
                Ok(next) => next,
                Err(_) => return,
            };
        }
    }

    fn resolve(&self, die: DieRef) -> Option<Arc<GoType>> {
        let resolver = self.resolver?;
        match resolver.resolve(die) {
            Ok(typ) => Some(typ),
            Err(e) => {
                log::debug!("type resolution failed: {e}");
                None
            }
        }
    }

    fn has_runtime_types(&self) -> bool {
        self.resolver
            .map(|r| r.has_runtime_types())
            .unwrap_or(false)
    }
}

fn member_offset(members: &[crate::binary::types::Member], name: &str) -> Option<u64> {
    members.iter().find(|m| m.name == name).map(|m| m.offset)
}

fn read_u64(buf: &[u8]) -> Option<u64> {
    Some(u64::from_le_bytes(buf.get(..8)?.try_into().ok()?))
}
