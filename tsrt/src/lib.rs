//! A timeshifting specializer: from a program of low-level flow graphs, a portal graph, and which
//! of the portal's arguments are known early, generate x86-64 code specialized to those
//! arguments.
//!
//! Specialization happens in three steps. The [hint annotator](hintannotator) colours every
//! variable green (known at specialization time) or red (known only when the generated code
//! runs). The [timeshifter] rewrites the coloured graphs into graphs that, when interpreted,
//! compute the green values and emit code for the red ones. Finally, each distinct tuple of
//! green portal arguments is compiled, on demand, by interpreting the timeshifted portal.

#![allow(clippy::type_complexity)]
#![allow(clippy::upper_case_acronyms)]
#![allow(clippy::new_without_default)]

pub mod codegen;
pub mod config;
pub mod error;
pub mod flowgraph;
pub mod hintannotator;
mod log;
pub mod lltype;
pub mod timeshifter;

pub use self::config::Config;
pub use self::error::CompilationError;
pub use self::hintannotator::HintPolicy;
pub use self::lltype::take_exception;
pub use self::timeshifter::portal::{PortalArg, Timeshifter};
