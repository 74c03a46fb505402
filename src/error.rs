//! Runtime error model (spec §7).
//!
//! A `RuntimeError` is data describing a detected memory-safety or
//! pointer-provenance violation in the *traced* program. It is never a Rust
//! `Result::Err` returned by this crate's own functions — it is constructed
//! by a checker, accumulates notes, and is written to the trace.

use std::fmt;

/// Non-exhaustive set of categories a `RuntimeError` can carry (spec §7).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RuntimeErrorKind {
    MemoryUnowned,
    MemoryUninitialized,
    MemoryOverlap,
    BufferSizeMismatch,
    InvalidCString,
    NullTerminatorMissing,
    PointerArithmeticOnInvalidOperand,
    PointerArithmeticOperandOutdated,
    PointerArithmeticResultInvalid,
    ReturnOfLocal,
    DivisionByZero,
    StackOverflow,
    FormatStringMismatch,
    FormatArgumentTypeMismatch,
    StreamInvalid,
    DirectoryInvalid,
    PassedPointerToUnowned,
    OverlappingSourceDestination,
}

impl fmt::Display for RuntimeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuntimeErrorKind::MemoryUnowned => "access to memory not owned by any allocation",
            RuntimeErrorKind::MemoryUninitialized => "read of uninitialized memory",
            RuntimeErrorKind::MemoryOverlap => "overlapping memory regions",
            RuntimeErrorKind::BufferSizeMismatch => "buffer too small for operation",
            RuntimeErrorKind::InvalidCString => "invalid C string",
            RuntimeErrorKind::NullTerminatorMissing => "C string is missing its null terminator",
            RuntimeErrorKind::PointerArithmeticOnInvalidOperand => {
                "pointer arithmetic on an invalid operand"
            }
            RuntimeErrorKind::PointerArithmeticOperandOutdated => {
                "pointer arithmetic on a stale (outdated) pointer"
            }
            RuntimeErrorKind::PointerArithmeticResultInvalid => {
                "pointer arithmetic produced a result outside its allocation"
            }
            RuntimeErrorKind::ReturnOfLocal => "returned a pointer to a local variable",
            RuntimeErrorKind::DivisionByZero => "division or remainder by zero",
            RuntimeErrorKind::StackOverflow => "stack overflow",
            RuntimeErrorKind::FormatStringMismatch => "format string does not match arguments",
            RuntimeErrorKind::FormatArgumentTypeMismatch => {
                "format conversion does not match argument type"
            }
            RuntimeErrorKind::StreamInvalid => "invalid FILE* stream",
            RuntimeErrorKind::DirectoryInvalid => "invalid DIR* handle",
            RuntimeErrorKind::PassedPointerToUnowned => "passed a pointer to unowned memory",
            RuntimeErrorKind::OverlappingSourceDestination => {
                "source and destination ranges overlap"
            }
        };
        f.write_str(s)
    }
}

/// Whether execution continues after the error is recorded, or the
/// synchronized-exit protocol must run (spec §4.8, §4.12).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Fatal,
}

/// A typed argument attached to a `RuntimeError`: an address, a size, a
/// parameter index, or a descriptive select (spec §7).
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Argument {
    Address(u64),
    Size(u64),
    OperandIndex(u32),
    ParameterIndex(u32),
    Select(u32),
}

/// A detected runtime error, plus its permanent/temporary notes
/// (sub-errors) attached by the checker that raised it (spec §4.8 "Errors
/// accumulate permanent and temporary notes").
#[derive(Clone, Debug)]
pub struct RuntimeError {
    kind: RuntimeErrorKind,
    severity: Severity,
    arguments: Vec<Argument>,
    /// Notes attached by the checker for context that always applies to
    /// this kind of error (e.g. "this argument is the `n`th parameter of
    /// `memcpy`").
    permanent_notes: Vec<RuntimeError>,
    /// Notes that apply only to this particular occurrence.
    temporary_notes: Vec<RuntimeError>,
}

impl RuntimeError {
    pub fn new(kind: RuntimeErrorKind, severity: Severity, arguments: Vec<Argument>) -> Self {
        RuntimeError {
            kind,
            severity,
            arguments,
            permanent_notes: Vec::new(),
            temporary_notes: Vec::new(),
        }
    }

    pub fn kind(&self) -> RuntimeErrorKind {
        self.kind
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn arguments(&self) -> &[Argument] {
        &self.arguments
    }

    pub fn arguments_mut(&mut self) -> &mut Vec<Argument> {
        &mut self.arguments
    }

    pub fn add_permanent_note(&mut self, note: RuntimeError) -> &mut Self {
        self.permanent_notes.push(note);
        self
    }

    pub fn add_temporary_note(&mut self, note: RuntimeError) -> &mut Self {
        self.temporary_notes.push(note);
        self
    }

    pub fn permanent_notes(&self) -> &[RuntimeError] {
        &self.permanent_notes
    }

    pub fn temporary_notes(&self) -> &[RuntimeError] {
        &self.temporary_notes
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }

    /// All sub-errors (permanent then temporary), for recursive event
    /// emission (spec §7 "Propagation").
    pub fn sub_errors(&self) -> impl Iterator<Item = &RuntimeError> {
        self.permanent_notes.iter().chain(self.temporary_notes.iter())
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.kind, self.severity)
    }
}

/// Errors internal to the tracer itself (disk I/O, trace-format corruption
/// when reading a trace back in the dump tool) — separate from
/// `RuntimeError`, which describes the *traced program's* misbehaviour
/// (spec-full §3a).
#[derive(Debug)]
pub enum TraceIoError {
    Io(std::io::Error),
    BadMagic,
    UnknownBlockType(u8),
    Truncated,
}

impl fmt::Display for TraceIoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceIoError::Io(e) => write!(f, "I/O error: {e}"),
            TraceIoError::BadMagic => write!(f, "file does not start with the SeeC trace magic"),
            TraceIoError::UnknownBlockType(b) => write!(f, "unknown block type tag {b}"),
            TraceIoError::Truncated => write!(f, "trace file ended unexpectedly"),
        }
    }
}

impl std::error::Error for TraceIoError {}

impl From<std::io::Error> for TraceIoError {
    fn from(e: std::io::Error) -> Self {
        TraceIoError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_errors_are_permanent_then_temporary() {
        let mut err = RuntimeError::new(RuntimeErrorKind::MemoryUnowned, Severity::Fatal, vec![]);
        err.add_permanent_note(RuntimeError::new(
            RuntimeErrorKind::InvalidCString,
            Severity::Warning,
            vec![],
        ));
        err.add_temporary_note(RuntimeError::new(
            RuntimeErrorKind::StackOverflow,
            Severity::Fatal,
            vec![],
        ));
        let kinds: Vec<_> = err.sub_errors().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec![RuntimeErrorKind::InvalidCString, RuntimeErrorKind::StackOverflow]);
    }

    #[test]
    fn severity_distinguishes_fatal() {
        let err = RuntimeError::new(RuntimeErrorKind::DivisionByZero, Severity::Fatal, vec![]);
        assert!(err.is_fatal());
    }
}
