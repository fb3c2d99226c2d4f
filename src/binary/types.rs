//! In-memory model of the Go types described by the debug information.
//! Pointee types stay unresolved (a DIE reference) so cyclic type graphs
//! terminate; everything embedded by value resolves eagerly.

use crate::error::Error;
use gimli::UnitOffset;
use std::sync::Arc;

/// Reference to a debug information entry: unit index plus an offset inside
/// the unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DieRef {
    pub unit: usize,
    pub offset: UnitOffset,
}

/// A struct field.
#[derive(Debug, Clone)]
pub struct Member {
    pub name: String,
    pub offset: u64,
    pub typ: Arc<GoType>,
}

/// A Go type reconstructed from DWARF.
#[derive(Debug, Clone)]
pub enum GoType {
    Int { name: String, size: u64 },
    Uint { name: String, size: u64 },
    Float { name: String, size: u64 },
    Complex { name: String, size: u64 },
    Bool { name: String },
    /// `pointee` is `None` for `unsafe.Pointer`-like pointers.
    Ptr { name: String, pointee: Option<DieRef> },
    Func { name: String },
    Struct { name: String, size: u64, members: Vec<Member> },
    Array { name: String, elem: Arc<GoType>, count: u64 },
    Typedef { name: String, underlying: Arc<GoType> },
    Void { name: String, size: u64 },
}

impl GoType {
    pub fn name(&self) -> &str {
        match self {
            GoType::Int { name, .. }
            | GoType::Uint { name, .. }
            | GoType::Float { name, .. }
            | GoType::Complex { name, .. }
            | GoType::Bool { name }
            | GoType::Ptr { name, .. }
            | GoType::Func { name }
            | GoType::Struct { name, .. }
            | GoType::Array { name, .. }
            | GoType::Typedef { name, .. }
            | GoType::Void { name, .. } => name,
        }
    }

    pub fn byte_size(&self) -> u64 {
        match self {
            GoType::Int { size, .. }
            | GoType::Uint { size, .. }
            | GoType::Float { size, .. }
            | GoType::Complex { size, .. }
            | GoType::Void { size, .. } => *size,
            GoType::Bool { .. } => 1,
            GoType::Ptr { .. } | GoType::Func { .. } => 8,
            GoType::Struct { size, .. } => *size,
            GoType::Array { elem, count, .. } => elem.byte_size() * count,
            GoType::Typedef { underlying, .. } => underlying.byte_size(),
        }
    }

    /// Follow typedefs down to the defining type.
    pub fn underlying(self: &Arc<Self>) -> Arc<GoType> {
        let mut typ = Arc::clone(self);
        while let GoType::Typedef { underlying, .. } = typ.as_ref() {
            typ = Arc::clone(underlying);
        }
        typ
    }

    pub fn member(&self, name: &str) -> Option<&Member> {
        match self {
            GoType::Struct { members, .. } => members.iter().find(|m| m.name == name),
            _ => None,
        }
    }
}

/// Resolves type references on demand. Implemented by the DWARF reader; the
/// value parser is written against this trait so it stays testable with a
/// hand-built type table.
pub trait TypeResolver {
    /// Resolve a DIE reference into a type.
    fn resolve(&self, die: DieRef) -> Result<Arc<GoType>, Error>;

    /// Map a runtime type descriptor address to the DWARF type it describes.
    fn runtime_type(&self, addr: u64) -> Result<Arc<GoType>, Error>;

    /// False when the binary carries no runtime type index (older toolchains).
    fn has_runtime_types(&self) -> bool;
}
