use crate::debugapi::Tid;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    IO(#[from] io::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // --------------------------------- debug api errors ------------------------------------------
    #[error("debug server spawn: {0}")]
    Spawn(io::Error),
    #[error("debug server exited before accepting a connection")]
    ServerGone,
    #[error("transport: {0}")]
    Transport(#[source] io::Error),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("error reply: {0}")]
    ErrorReply(String),
    #[error("step stopped unexpected tasks {0:?}")]
    UnspecifiedTask(Vec<Tid>),
    #[error("task {0} is not stopped")]
    TaskNotStopped(Tid),
    #[error("memory at {0:#x} is not mapped")]
    UnknownAddress(u64),
    #[error("no task descriptor for thread {0}")]
    NoTask(Tid),
    #[error("process {0} not found")]
    ProcessNotFound(u64),

    // --------------------------------- debug info errors -----------------------------------------
    #[error("dwarf parsing: {0}")]
    DwarfParsing(#[from] gimli::Error),
    #[error("object file parsing: {0}")]
    ObjParsing(#[from] object::Error),
    #[error("no debug information")]
    NoDebugInfo,
    #[error("function not found at {0:#x}")]
    FunctionNotFound(u64),
    #[error("attribute {0} not found")]
    AttrNotFound(&'static str),
    #[error("symbol {0} not found")]
    SymbolNotFound(&'static str),
    #[error("unsupported location expression")]
    UnsupportedLocation,
    #[error("no type entry for runtime type at {0:#x}")]
    RuntimeTypeNotFound(u64),

    // --------------------------------- session lifecycle -----------------------------------------
    #[error("interrupted")]
    Interrupted,
    #[error("process exited with status {0}")]
    Exited(i32),
    #[error("process terminated by signal {0}")]
    Terminated(i32),
}

impl Error {
    /// Return a hint to a caller - continue the tracing session after error or tear it down.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::InvalidConfig(_) => false,
            Error::UnspecifiedTask(_) => false,
            Error::TaskNotStopped(_) => false,
            Error::UnknownAddress(_) => false,
            Error::NoTask(_) => false,
            Error::NoDebugInfo => false,
            Error::FunctionNotFound(_) => false,
            Error::AttrNotFound(_) => false,
            Error::SymbolNotFound(_) => false,
            Error::UnsupportedLocation => false,
            Error::RuntimeTypeNotFound(_) => false,
            Error::Interrupted => false,
            Error::Exited(_) => false,
            Error::Terminated(_) => false,
            // a structured error reply concerns one operation, the
            // connection itself is still good
            Error::ErrorReply(_) => false,

            // currently fatal errors
            Error::IO(_) => true,
            Error::ProcessNotFound(_) => true,
            Error::Spawn(_) => true,
            Error::ServerGone => true,
            Error::Transport(_) => true,
            Error::Protocol(_) => true,
            Error::DwarfParsing(_) => true,
            Error::ObjParsing(_) => true,
        }
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "tracer", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "tracer", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
