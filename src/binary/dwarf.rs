//! Reader over the `.debug_*` sections of a Go binary: function lookup by
//! pc, formal parameters with their stack offsets, the runtime-type index
//! and the toolchain version stamped into the compile units.

use crate::binary::types::{DieRef, GoType, Member, TypeResolver};
use crate::binary::{Function, Parameter};
use crate::error::Error;
use crate::version::GoVersion;
use crate::{muted_error, weak_error};
use gimli::{AttributeValue, Dwarf, Reader, RunTimeEndian, Unit};
use object::{Object, ObjectSection};
use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub type DwarfReader = gimli::EndianArcSlice<RunTimeEndian>;
type Die<'abbrev, 'unit> = gimli::DebuggingInformationEntry<'abbrev, 'unit, DwarfReader>;

// The Go compiler attaches the address of the runtime type descriptor to
// type entries with this vendor attribute.
const DW_AT_GO_RUNTIME_TYPE: gimli::DwAt = gimli::DwAt(0x2904);

const DW_OP_ADDR: u8 = 0x03;
const DW_OP_FBREG: u8 = 0x91;
const DW_OP_CALL_FRAME_CFA: u8 = 0x9c;

const FIRST_MODULE_DATA_NAME: &str = "runtime.firstmoduledata";

#[derive(Debug, Clone)]
struct FuncEntry {
    name: String,
    low_pc: u64,
    high_pc: u64,
    die: DieRef,
}

/// Parsed debug information of the traced binary. Built once at open time,
/// read-only afterwards.
pub struct DwarfInfo {
    dwarf: Dwarf<DwarfReader>,
    units: Vec<Unit<DwarfReader>>,
    // start offset of every unit inside .debug_info, for global reference
    // resolution
    unit_offsets: Vec<usize>,
    functions: Vec<FuncEntry>,
    runtime_types: HashMap<u64, DieRef>,
    first_module_data: Option<u64>,
    go_version: Option<GoVersion>,
    type_cache: RefCell<HashMap<DieRef, Arc<GoType>>>,
    types_in_progress: RefCell<HashSet<DieRef>>,
}

impl DwarfInfo {
    /// Load the DWARF of an object file. `None` when the binary is stripped
    /// of debug information.
    pub fn build(file: &object::File) -> Result<Option<DwarfInfo>, Error> {
        let endian = if file.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        if section_data(file, gimli::SectionId::DebugInfo.name()).is_none() {
            return Ok(None);
        }

        let dwarf = Dwarf::load(|id| -> Result<DwarfReader, Error> {
            let data = section_data(file, id.name()).unwrap_or(Cow::Borrowed(&[]));
            Ok(gimli::EndianArcSlice::new(Arc::from(&*data), endian))
        })?;

        let mut units = vec![];
        let mut unit_offsets = vec![];
        let mut iter = dwarf.units();
        while let Some(header) = iter.next()? {
            let offset = header
                .offset()
                .as_debug_info_offset()
                .map(|o| o.0)
                .unwrap_or(0);
            units.push(dwarf.unit(header)?);
            unit_offsets.push(offset);
        }

        let mut this = DwarfInfo {
            dwarf,
            units,
            unit_offsets,
            functions: vec![],
            runtime_types: HashMap::new(),
            first_module_data: None,
            go_version: None,
            type_cache: RefCell::new(HashMap::new()),
            types_in_progress: RefCell::new(HashSet::new()),
        };
        this.scan()?;
        Ok(Some(this))
    }

    /// One pass over every DIE: the function index, the runtime-type index,
    /// the `firstmoduledata` address and the producer version.
    fn scan(&mut self) -> Result<(), Error> {
        let mut functions = vec![];
        let mut runtime_types = HashMap::new();
        let mut first_module_data = None;
        let mut go_version = None;

        for unit_idx in 0..self.units.len() {
            let unit = &self.units[unit_idx];
            let mut cursor = unit.entries();
            while let Some((_, entry)) = cursor.next_dfs()? {
                match entry.tag() {
                    gimli::DW_TAG_compile_unit => {
                        if go_version.is_none() {
                            go_version = self
                                .die_name_attr(unit_idx, entry, gimli::DW_AT_producer)
                                .and_then(|p| GoVersion::from_producer(&p));
                        }
                    }
                    gimli::DW_TAG_subprogram => {
                        if let Some(func) = self.scan_subprogram(unit_idx, entry)? {
                            functions.push(func);
                        }
                    }
                    gimli::DW_TAG_variable => {
                        if first_module_data.is_none()
                            && self.die_name(unit_idx, entry).as_deref()
                                == Some(FIRST_MODULE_DATA_NAME)
                        {
                            first_module_data = self.variable_address(entry);
                        }
                    }
                    // only these tags may carry the runtime type attribute
                    gimli::DW_TAG_array_type
                    | gimli::DW_TAG_pointer_type
                    | gimli::DW_TAG_structure_type
                    | gimli::DW_TAG_subroutine_type
                    | gimli::DW_TAG_base_type
                    | gimli::DW_TAG_typedef => {
                        if let Some(addr) = runtime_type_addr(entry)? {
                            runtime_types.insert(
                                addr,
                                DieRef {
                                    unit: unit_idx,
                                    offset: entry.offset(),
                                },
                            );
                        }
                    }
                    _ => {}
                }
            }
        }

        functions.sort_by_key(|f| f.low_pc);
        self.functions = functions;
        self.runtime_types = runtime_types;
        self.first_module_data = first_module_data;
        self.go_version = go_version;
        Ok(())
    }

    fn scan_subprogram(
        &self,
        unit_idx: usize,
        entry: &Die,
    ) -> Result<Option<FuncEntry>, Error> {
        // inlined instances have no code range of their own
        if entry.attr_value(gimli::DW_AT_inline)?.is_some() {
            return Ok(None);
        }

        let unit = &self.units[unit_idx];
        let Some(low_pc) = entry
            .attr_value(gimli::DW_AT_low_pc)?
            .and_then(|v| self.dwarf.attr_address(unit, v).ok().flatten())
        else {
            return Ok(None);
        };
        let Some(high_pc) = (match entry.attr_value(gimli::DW_AT_high_pc)? {
            Some(AttributeValue::Addr(addr)) => Some(addr),
            Some(other) => other.udata_value().map(|offset| low_pc + offset),
            None => None,
        }) else {
            return Ok(None);
        };

        let die = DieRef {
            unit: unit_idx,
            offset: entry.offset(),
        };
        let Some(name) = muted_error!(self.chased_name(die), "unnamed subprogram:") else {
            return Ok(None);
        };

        Ok(Some(FuncEntry {
            name,
            low_pc,
            high_pc,
            die,
        }))
    }

    fn variable_address(&self, entry: &Die) -> Option<u64> {
        let loc = entry.attr_value(gimli::DW_AT_location).ok()??;
        let AttributeValue::Exprloc(expr) = loc else {
            return None;
        };
        let bytes = expr.0.to_slice().ok()?;
        if bytes.len() < 9 || bytes[0] != DW_OP_ADDR {
            log::warn!("unexpected location format of {FIRST_MODULE_DATA_NAME}: {bytes:?}");
            return None;
        }
        Some(u64::from_le_bytes(bytes[1..9].try_into().ok()?))
    }

    /// Look up the function covering `pc` and parse its formal parameters.
    pub fn function_by_pc(&self, pc: u64) -> Result<Function, Error> {
        let idx = self.functions.partition_point(|f| f.low_pc <= pc);
        let func = idx
            .checked_sub(1)
            .map(|i| &self.functions[i])
            .filter(|f| pc < f.high_pc)
            .ok_or(Error::FunctionNotFound(pc))?;

        self.check_frame_base(func)?;

        let mut parameters = self.parameters(func.die)?;
        parameters.sort_by_key(|p| p.offset);
        Ok(Function {
            name: func.name.clone(),
            entry: func.low_pc,
            parameters,
        })
    }

    /// Every non-inline subprogram, without parameter info.
    pub fn functions(&self) -> Vec<Function> {
        self.functions
            .iter()
            .map(|f| Function {
                name: f.name.clone(),
                entry: f.low_pc,
                parameters: vec![],
            })
            .collect()
    }

    pub fn first_module_data_addr(&self) -> Result<u64, Error> {
        self.first_module_data
            .ok_or(Error::SymbolNotFound(FIRST_MODULE_DATA_NAME))
    }

    pub fn go_version(&self) -> Option<GoVersion> {
        self.go_version
    }

    fn check_frame_base(&self, func: &FuncEntry) -> Result<(), Error> {
        let unit = &self.units[func.die.unit];
        let entry = unit.entry(func.die.offset)?;
        let frame_base = match entry.attr_value(gimli::DW_AT_frame_base)? {
            Some(AttributeValue::Exprloc(expr)) => expr.0.to_slice()?.into_owned(),
            _ => vec![],
        };
        if frame_base != [DW_OP_CALL_FRAME_CFA] {
            log::warn!(
                "the frame base of {} is not the call frame address, parameter values may be wrong",
                func.name
            );
        }
        Ok(())
    }

    fn parameters(&self, die: DieRef) -> Result<Vec<Parameter>, Error> {
        let unit = &self.units[die.unit];
        let mut tree = unit.entries_tree(Some(die.offset))?;
        let root = tree.root()?;

        let mut params = vec![];
        let mut children = root.children();
        while let Some(child) = children.next()? {
            if child.entry().tag() != gimli::DW_TAG_formal_parameter {
                continue;
            }
            let param_die = DieRef {
                unit: die.unit,
                offset: child.entry().offset(),
            };
            if let Some(param) =
                muted_error!(self.build_parameter(param_die, child.entry()), "parameter:")
            {
                params.push(param);
            }
        }
        Ok(params)
    }

    fn build_parameter(&self, die: DieRef, entry: &Die) -> Result<Parameter, Error> {
        let (name, type_ref, is_output) = self.chased_parameter_parts(die)?;
        let typ = self.resolve(type_ref)?;
        let (offset, exists) = self.parameter_location(die.unit, entry)?;

        Ok(Parameter {
            name,
            typ,
            offset,
            exists,
            is_output,
        })
    }

    fn parameter_location(&self, unit_idx: usize, entry: &Die) -> Result<(i64, bool), Error> {
        let expr = match entry.attr_value(gimli::DW_AT_location)? {
            Some(AttributeValue::Exprloc(expr)) => expr.0.to_slice()?.into_owned(),
            Some(AttributeValue::LocationListsRef(offset)) => {
                self.first_loclist_expr(unit_idx, offset)?
            }
            Some(AttributeValue::SecOffset(offset)) => {
                self.first_loclist_expr(unit_idx, gimli::LocationListsOffset(offset))?
            }
            _ => return Err(Error::AttrNotFound("location")),
        };

        // an empty location description marks a parameter optimized away
        if expr.is_empty() {
            return Ok((0, false));
        }

        match parameter_offset(&expr) {
            Ok(offset) => Ok((offset, true)),
            Err(e) => {
                log::debug!("unsupported parameter location: {e}");
                Ok((0, false))
            }
        }
    }

    fn first_loclist_expr(
        &self,
        unit_idx: usize,
        offset: gimli::LocationListsOffset<usize>,
    ) -> Result<Vec<u8>, Error> {
        let unit = &self.units[unit_idx];
        let mut iter = self.dwarf.locations(unit, offset)?;
        match iter.next()? {
            Some(entry) => Ok(entry.data.0.to_slice()?.into_owned()),
            None => Err(Error::UnsupportedLocation),
        }
    }

    fn die_name(&self, unit_idx: usize, entry: &Die) -> Option<String> {
        self.die_name_attr(unit_idx, entry, gimli::DW_AT_name)
    }

    fn die_name_attr(&self, unit_idx: usize, entry: &Die, attr: gimli::DwAt) -> Option<String> {
        let value = entry.attr_value(attr).ok()??;
        let unit = &self.units[unit_idx];
        let data = self.dwarf.attr_string(unit, value).ok()?;
        Some(data.to_string_lossy().ok()?.into_owned())
    }

    fn type_ref_of(&self, unit_idx: usize, entry: &Die) -> Option<DieRef> {
        match entry.attr_value(gimli::DW_AT_type).ok()?? {
            AttributeValue::UnitRef(offset) => Some(DieRef {
                unit: unit_idx,
                offset,
            }),
            AttributeValue::DebugInfoRef(offset) => self.global_die_ref(offset),
            _ => None,
        }
    }

    fn global_die_ref(&self, offset: gimli::DebugInfoOffset<usize>) -> Option<DieRef> {
        let idx = self
            .unit_offsets
            .partition_point(|&start| start <= offset.0)
            .checked_sub(1)?;
        Some(DieRef {
            unit: idx,
            offset: gimli::UnitOffset(offset.0 - self.unit_offsets[idx]),
        })
    }

    /// Follow the abstract origin chain until `extract` succeeds. The chain
    /// is walked iteratively with a visited set, DIE graphs may be cyclic.
    fn walk_up_origins<T, F>(&self, mut die: DieRef, mut extract: F) -> Result<T, Error>
    where
        F: for<'a, 'b> FnMut(usize, &Die<'a, 'b>) -> Option<T>,
    {
        let mut visited = HashSet::new();
        loop {
            if !visited.insert(die) {
                return Err(Error::AttrNotFound("abstract_origin"));
            }

            let unit = self
                .units
                .get(die.unit)
                .ok_or(Error::AttrNotFound("unit"))?;
            let entry = unit.entry(die.offset)?;
            if let Some(found) = extract(die.unit, &entry) {
                return Ok(found);
            }

            die = match entry.attr_value(gimli::DW_AT_abstract_origin)? {
                Some(AttributeValue::UnitRef(offset)) => DieRef {
                    unit: die.unit,
                    offset,
                },
                Some(AttributeValue::DebugInfoRef(offset)) => self
                    .global_die_ref(offset)
                    .ok_or(Error::AttrNotFound("abstract_origin"))?,
                _ => return Err(Error::AttrNotFound("abstract_origin")),
            };
        }
    }

    fn chased_name(&self, die: DieRef) -> Result<String, Error> {
        self.walk_up_origins(die, |unit_idx, entry| self.die_name(unit_idx, entry))
    }

    fn chased_parameter_parts(&self, die: DieRef) -> Result<(String, DieRef, bool), Error> {
        self.walk_up_origins(die, |unit_idx, entry| {
            let name = self.die_name(unit_idx, entry)?;
            let type_ref = self.type_ref_of(unit_idx, entry)?;
            let is_output = match entry.attr_value(gimli::DW_AT_variable_parameter).ok()? {
                Some(AttributeValue::Flag(flag)) => flag,
                _ => return None,
            };
            Some((name, type_ref, is_output))
        })
    }

    fn build_type(&self, die: DieRef) -> Result<Arc<GoType>, Error> {
        let unit = &self.units[die.unit];
        let entry = unit.entry(die.offset)?;
        let name = self.die_name(die.unit, &entry).unwrap_or_default();
        let size = entry
            .attr_value(gimli::DW_AT_byte_size)?
            .and_then(|v| v.udata_value())
            .unwrap_or(0);

        let typ = match entry.tag() {
            gimli::DW_TAG_base_type => {
                let encoding = match entry.attr_value(gimli::DW_AT_encoding)? {
                    Some(AttributeValue::Encoding(ate)) => ate,
                    _ => gimli::DwAte(0),
                };
                match encoding {
                    gimli::DW_ATE_signed | gimli::DW_ATE_signed_char => {
                        GoType::Int { name, size }
                    }
                    gimli::DW_ATE_unsigned
                    | gimli::DW_ATE_unsigned_char
                    | gimli::DW_ATE_address => GoType::Uint { name, size },
                    gimli::DW_ATE_float => GoType::Float { name, size },
                    gimli::DW_ATE_complex_float => GoType::Complex { name, size },
                    gimli::DW_ATE_boolean => GoType::Bool { name },
                    _ => GoType::Void { name, size },
                }
            }
            gimli::DW_TAG_pointer_type => GoType::Ptr {
                name,
                pointee: self.type_ref_of(die.unit, &entry),
            },
            gimli::DW_TAG_subroutine_type => GoType::Func { name },
            gimli::DW_TAG_structure_type => {
                let members = self.struct_members(die)?;
                GoType::Struct {
                    name,
                    size,
                    members,
                }
            }
            gimli::DW_TAG_array_type => {
                let elem_ref = self.type_ref_of(die.unit, &entry);
                let count = self.array_count(die)?;
                match (elem_ref, count) {
                    (Some(elem_ref), Some(count)) => GoType::Array {
                        name,
                        elem: self.resolve(elem_ref)?,
                        count,
                    },
                    _ => GoType::Void { name, size },
                }
            }
            gimli::DW_TAG_typedef => match self.type_ref_of(die.unit, &entry) {
                Some(under_ref) => GoType::Typedef {
                    name,
                    underlying: self.resolve(under_ref)?,
                },
                None => GoType::Void { name, size },
            },
            _ => GoType::Void { name, size },
        };
        Ok(Arc::new(typ))
    }

    fn struct_members(&self, die: DieRef) -> Result<Vec<Member>, Error> {
        let unit = &self.units[die.unit];
        let mut tree = unit.entries_tree(Some(die.offset))?;
        let root = tree.root()?;

        let mut members = vec![];
        let mut children = root.children();
        while let Some(child) = children.next()? {
            let entry = child.entry();
            if entry.tag() != gimli::DW_TAG_member {
                continue;
            }
            let name = self.die_name(die.unit, entry).unwrap_or_default();
            let offset = entry
                .attr_value(gimli::DW_AT_data_member_location)?
                .and_then(|v| v.udata_value())
                .unwrap_or(0);
            let Some(type_ref) = self.type_ref_of(die.unit, entry) else {
                continue;
            };
            let Some(typ) = weak_error!(self.resolve(type_ref), "struct member type:") else {
                continue;
            };
            members.push(Member { name, offset, typ });
        }
        Ok(members)
    }

    fn array_count(&self, die: DieRef) -> Result<Option<u64>, Error> {
        let unit = &self.units[die.unit];
        let mut tree = unit.entries_tree(Some(die.offset))?;
        let root = tree.root()?;

        let mut children = root.children();
        while let Some(child) = children.next()? {
            let entry = child.entry();
            if entry.tag() != gimli::DW_TAG_subrange_type {
                continue;
            }
            if let Some(count) = entry
                .attr_value(gimli::DW_AT_count)?
                .and_then(|v| v.udata_value())
            {
                return Ok(Some(count));
            }
        }
        Ok(None)
    }
}

impl TypeResolver for DwarfInfo {
    fn resolve(&self, die: DieRef) -> Result<Arc<GoType>, Error> {
        if let Some(typ) = self.type_cache.borrow().get(&die) {
            return Ok(Arc::clone(typ));
        }
        if !self.types_in_progress.borrow_mut().insert(die) {
            // a cycle not broken by a pointer can only come from corrupted
            // debug info
            return Ok(Arc::new(GoType::Void {
                name: String::new(),
                size: 0,
            }));
        }

        let built = self.build_type(die);
        self.types_in_progress.borrow_mut().remove(&die);

        let typ = built?;
        self.type_cache.borrow_mut().insert(die, Arc::clone(&typ));
        Ok(typ)
    }

    fn runtime_type(&self, addr: u64) -> Result<Arc<GoType>, Error> {
        let die = *self
            .runtime_types
            .get(&addr)
            .ok_or(Error::RuntimeTypeNotFound(addr))?;
        self.resolve(die)
    }

    fn has_runtime_types(&self) -> bool {
        !self.runtime_types.is_empty()
    }
}

fn section_data<'a>(file: &'a object::File, name: &str) -> Option<Cow<'a, [u8]>> {
    let section = file.section_by_name(name).or_else(|| {
        // mach-o spells the dwarf sections with a double underscore
        file.section_by_name(&name.replacen('.', "__", 1))
    })?;
    section.uncompressed_data().ok()
}

fn runtime_type_addr(entry: &Die) -> Result<Option<u64>, Error> {
    let addr = match entry.attr_value(DW_AT_GO_RUNTIME_TYPE)? {
        Some(AttributeValue::Addr(addr)) => Some(addr),
        Some(other) => other.udata_value(),
        None => None,
    };
    Ok(addr.filter(|addr| *addr != 0))
}

/// Offset of a parameter from the beginning of the parameter list.
/// Values in registers or separated between locations are not supported.
fn parameter_offset(expr: &[u8]) -> Result<i64, Error> {
    match expr.first() {
        Some(&DW_OP_CALL_FRAME_CFA) => Ok(0),
        Some(&DW_OP_FBREG) => Ok(decode_sleb128(&expr[1..])),
        _ => Err(Error::UnsupportedLocation),
    }
}

fn decode_sleb128(input: &[u8]) -> i64 {
    let mut value: i64 = 0;
    let mut shift = 0u32;
    let mut last = 0u8;
    for &byte in input {
        value |= ((byte & 0x7f) as i64) << shift;
        shift += 7;
        last = byte;
        if byte & 0x80 == 0 {
            break;
        }
    }
    if shift < 64 && last & 0x40 != 0 {
        value |= -1i64 << shift;
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_sleb128() {
        assert_eq!(decode_sleb128(&[0x00]), 0);
        assert_eq!(decode_sleb128(&[0x08]), 8);
        assert_eq!(decode_sleb128(&[0x7f]), -1);
        assert_eq!(decode_sleb128(&[0x80, 0x01]), 128);
        assert_eq!(decode_sleb128(&[0xff, 0x7e]), -129);
        assert_eq!(decode_sleb128(&[0xc0, 0x00]), 64);
    }

    #[test]
    fn test_parameter_offset() {
        assert_eq!(parameter_offset(&[DW_OP_CALL_FRAME_CFA]).unwrap(), 0);
        assert_eq!(parameter_offset(&[DW_OP_FBREG, 0x10]).unwrap(), 16);
        assert_eq!(parameter_offset(&[DW_OP_FBREG, 0x78]).unwrap(), -8);
        assert!(parameter_offset(&[0x50]).is_err());
        assert!(parameter_offset(&[]).is_err());
    }
}
