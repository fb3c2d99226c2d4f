//! The traced program on disk: its functions, parameter layouts and type
//! information. Full fidelity needs DWARF; a stripped binary degrades to the
//! symbol table (function names only).

pub mod dwarf;
pub mod types;

use crate::binary::dwarf::DwarfInfo;
use crate::binary::types::{GoType, TypeResolver};
use crate::error::Error;
use crate::version::GoVersion;
use object::{Object, ObjectSymbol, SymbolKind};
use std::path::Path;
use std::sync::Arc;

/// A function of the traced binary.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub entry: u64,
    pub parameters: Vec<Parameter>,
}

/// A value the function receives or returns, resident on the stack.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub typ: Arc<GoType>,
    /// Offset from the beginning of the parameter list.
    pub offset: i64,
    /// False when the parameter is optimized away.
    pub exists: bool,
    /// True for return slots.
    pub is_output: bool,
}

/// A text symbol, the degraded-mode stand-in for a subprogram entry.
#[derive(Debug, Clone)]
pub struct FuncSym {
    pub name: String,
    pub addr: u64,
    pub size: u64,
}

enum Info {
    Dwarf(DwarfInfo),
    Symbols(Vec<FuncSym>),
}

/// The program the traced process executes.
pub struct Binary {
    info: Info,
    go_version: Option<GoVersion>,
}

impl Binary {
    /// Open a program file and load its debug information. A binary without
    /// DWARF falls back to the symbol table.
    pub fn open(path: &Path) -> Result<Binary, Error> {
        let data = std::fs::read(path)?;
        let file = object::File::parse(&*data)?;

        match DwarfInfo::build(&file)? {
            Some(info) => {
                let go_version = info.go_version();
                Ok(Binary {
                    info: Info::Dwarf(info),
                    go_version,
                })
            }
            None => {
                log::warn!(
                    "{} carries no debug information, function names only",
                    path.display()
                );
                Ok(Binary::from_symbols(text_symbols(&file)))
            }
        }
    }

    /// Build a degraded-mode binary straight from a symbol list.
    pub fn from_symbols(mut syms: Vec<FuncSym>) -> Binary {
        syms.sort_by_key(|s| s.addr);
        // mach-o symbols carry no sizes, close each one at its successor
        for i in 0..syms.len() {
            if syms[i].size == 0 {
                syms[i].size = syms
                    .get(i + 1)
                    .map(|next| next.addr - syms[i].addr)
                    .unwrap_or(u64::MAX - syms[i].addr);
            }
        }
        Binary {
            info: Info::Symbols(syms),
            go_version: None,
        }
    }

    pub fn has_debug_info(&self) -> bool {
        matches!(self.info, Info::Dwarf(_))
    }

    /// Find the function covering the given pc, with parameters when DWARF
    /// is present.
    pub fn function_by_pc(&self, pc: u64) -> Result<Function, Error> {
        match &self.info {
            Info::Dwarf(info) => info.function_by_pc(pc),
            Info::Symbols(syms) => {
                let idx = syms.partition_point(|s| s.addr <= pc);
                let sym = idx
                    .checked_sub(1)
                    .map(|i| &syms[i])
                    .filter(|s| pc < s.addr + s.size)
                    .ok_or(Error::FunctionNotFound(pc))?;
                Ok(Function {
                    name: sym.name.clone(),
                    entry: sym.addr,
                    parameters: vec![],
                })
            }
        }
    }

    /// Every known function, without parameter info.
    pub fn functions(&self) -> Vec<Function> {
        match &self.info {
            Info::Dwarf(info) => info.functions(),
            Info::Symbols(syms) => syms
                .iter()
                .map(|s| Function {
                    name: s.name.clone(),
                    entry: s.addr,
                    parameters: vec![],
                })
                .collect(),
        }
    }

    /// Find a function by its fully qualified name.
    pub fn function_by_name(&self, name: &str) -> Option<Function> {
        self.functions().into_iter().find(|f| f.name == name)
    }

    /// Address of the in-memory module data descriptor of the runtime.
    pub fn first_module_data_addr(&self) -> Result<u64, Error> {
        match &self.info {
            Info::Dwarf(info) => info.first_module_data_addr(),
            Info::Symbols(_) => Err(Error::NoDebugInfo),
        }
    }

    /// Toolchain version stamped into the binary, if detectable.
    pub fn go_version(&self) -> Option<GoVersion> {
        self.go_version
    }

    /// Type lookup interface, absent in degraded mode.
    pub fn type_resolver(&self) -> Option<&dyn TypeResolver> {
        match &self.info {
            Info::Dwarf(info) => Some(info),
            Info::Symbols(_) => None,
        }
    }
}

fn text_symbols(file: &object::File) -> Vec<FuncSym> {
    file.symbols()
        .filter(|sym| sym.kind() == SymbolKind::Text)
        .filter_map(|sym| {
            let name = sym.name().ok()?;
            if name.is_empty() {
                return None;
            }
            Some(FuncSym {
                name: name.to_string(),
                addr: sym.address(),
                size: sym.size(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbols() -> Vec<FuncSym> {
        vec![
            FuncSym {
                name: "main.main".to_string(),
                addr: 0x1000,
                size: 0x100,
            },
            FuncSym {
                name: "main.helper".to_string(),
                addr: 0x1200,
                size: 0,
            },
            FuncSym {
                name: "runtime.morestack".to_string(),
                addr: 0x1400,
                size: 0x80,
            },
        ]
    }

    #[test]
    fn test_symbol_lookup() {
        let binary = Binary::from_symbols(symbols());
        assert!(!binary.has_debug_info());

        let f = binary.function_by_pc(0x1000).unwrap();
        assert_eq!(f.name, "main.main");
        assert_eq!(f.entry, 0x1000);
        assert!(f.parameters.is_empty());

        let f = binary.function_by_pc(0x10ff).unwrap();
        assert_eq!(f.name, "main.main");

        // the gap between main.main and main.helper belongs to no function
        assert!(binary.function_by_pc(0x1100).is_err());
        assert!(binary.function_by_pc(0xfff).is_err());

        // a zero-sized symbol is closed at its successor
        let f = binary.function_by_pc(0x13ff).unwrap();
        assert_eq!(f.name, "main.helper");
    }

    #[test]
    fn test_function_by_name() {
        let binary = Binary::from_symbols(symbols());
        let f = binary.function_by_name("main.helper").unwrap();
        assert_eq!(f.entry, 0x1200);
        assert!(binary.function_by_name("main.absent").is_none());
    }

    #[test]
    fn test_degraded_mode_surface() {
        let binary = Binary::from_symbols(symbols());
        assert!(binary.first_module_data_addr().is_err());
        assert!(binary.type_resolver().is_none());
        assert_eq!(binary.functions().len(), 3);
    }
}
