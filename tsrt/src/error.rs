use std::error::Error;
use thiserror::Error;

/// A failure to specialize a program or to generate code for it.
#[derive(Error, Debug)]
pub enum CompilationError {
    #[error("General error: {0}")]
    /// Specialization failed for reasons that are probably the fault of the program being
    /// specialized (e.g. a fold that divides by zero, or a call through an unknown function
    /// pointer).
    General(String),
    #[error("Internal error: {0}")]
    /// Something went wrong that is probably the result of a bug in tsrt.
    InternalError(String),
    #[error("Limit exceeded: {0}")]
    /// A limit was exceeded (e.g. too many arguments for the calling convention, or a merge point
    /// that was generalized more often than allowed).
    LimitExceeded(String),
    #[error("Resource exhausted: {0:}")]
    /// An external resource (e.g. executable memory) was exhausted.
    ResourceExhausted(Box<dyn Error>),
    #[error("Code block overflow: {0} bytes requested, {1} available")]
    /// A write to a machine code block would have exceeded its capacity.
    CodeBlockOverflow(usize, usize),
    #[error("Hint error: cannot apply {hints} to {value}")]
    /// A hint (or a combination of hints) that cannot be applied to the value it annotates.
    HintError { hints: String, value: String },
}

impl CompilationError {
    /// Is this error one where the program being specialized, rather than tsrt, is at fault?
    pub fn is_user_error(&self) -> bool {
        matches!(self, Self::General(_) | Self::HintError { .. })
    }
}
