//! goshawk traces the function calls of a Go program: it drives the process
//! through a debug server, plants breakpoints at function entries and return
//! sites, decodes arguments and return values against the DWARF type
//! information and prints one line per call, nested the way each goroutine
//! runs.

pub mod binary;
pub mod debugapi;
pub mod error;
pub mod goruntime;
pub mod log;
pub mod service;
pub mod tracer;
pub mod value;
pub mod version;
