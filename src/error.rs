use std::num::ParseIntError;
use thiserror::Error;

/// Failures raised while decoding or executing an instruction, or while
/// touching the address space.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CpuError {
    #[error("instruction too short: needed {needed} bytes, had {available}")]
    TooShort { needed: usize, available: usize },

    #[error("illegal opcode in instruction word {0:#06x}")]
    IllegalOpcode(u16),

    #[error("bad operand: {0}")]
    BadOperand(&'static str),

    #[error("address {0:#06x} is too high")]
    AddressTooHigh(u16),

    #[error("address {0:#06x} is unaligned")]
    AddressUnaligned(u16),

    #[error("can't fetch an instruction from hooked address {0:#06x}")]
    HookedFetch(u16),

    #[error("a hook is already bound at {0:#06x}")]
    HookConflict(u16),

    #[error("{0} is not implemented")]
    Unsupported(&'static str),

    #[error("CPUOFF set, CPU halted")]
    Halted,

    #[error(transparent)]
    Collaborator(#[from] KvError),
}

impl CpuError {
    /// `Halted` is a clean stop signal rather than a fault.
    pub fn is_halt(&self) -> bool {
        matches!(self, CpuError::Halted)
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            CpuError::TooShort { .. } => "too_short",
            CpuError::IllegalOpcode(_) => "illegal_opcode",
            CpuError::BadOperand(_) => "bad_operand",
            CpuError::AddressTooHigh(_) => "address_too_high",
            CpuError::AddressUnaligned(_) => "address_unaligned",
            CpuError::HookedFetch(_) => "hooked_fetch",
            CpuError::HookConflict(_) => "hook_conflict",
            CpuError::Unsupported(_) => "unsupported",
            CpuError::Halted => "halted",
            CpuError::Collaborator(_) => "collaborator",
        }
    }
}

/// Failures reported by the key/value collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KvError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("wrong kind of value held at key {0}")]
    WrongType(String),

    #[error("key/value store is unavailable")]
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("line {line}: record too short")]
    LineTooShort { line: usize },

    #[error("line {line}: bad hex digits")]
    BadHex {
        line: usize,
        #[source]
        source: ParseIntError,
    },

    #[error("can't read image: {0}")]
    Io(String),

    #[error(transparent)]
    Memory(#[from] CpuError),
}

/// Errors surfaced through the instance control surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("cpu instance {0} is gone")]
    Gone(String),

    #[error("not ready for this operation")]
    NotReady,

    #[error("can't start cpu instance: {0}")]
    Spawn(String),

    #[error(transparent)]
    Cpu(#[from] CpuError),

    #[error(transparent)]
    Image(#[from] LoadError),

    #[error(transparent)]
    Kv(#[from] KvError),
}
