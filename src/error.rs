use thiserror::Error;

/// Everything that can go wrong while translating one object file's
/// `.eh_frame` into FAE. Most of these are per-record: callers that are
/// walking many FDEs log-and-skip rather than abort the whole pass on the
/// first bad one (see `dwarf::cfi::walk`).
#[derive(Debug, Error)]
pub enum FaeError {
    #[error("attempted to read {requested} byte(s) at offset {offset}, but only {available} remain")]
    OutOfRange {
        offset: usize,
        requested: usize,
        available: usize,
    },

    #[error("malformed LEB128 value at offset {offset}")]
    MalformedLeb { offset: usize },

    #[error("unrecognized DWARF pointer encoding 0x{encoding:02x} at offset {offset}")]
    UnknownDwarfEncoding { encoding: u8, offset: usize },

    #[error("unrecognized call frame instruction opcode 0x{opcode:02x} at offset {offset}")]
    UnknownCfiInstruction { opcode: u8, offset: usize },

    #[error("register r{register} is not part of AVR's callee-saved set and cannot be encoded")]
    UnsupportedRegister { register: u8 },

    #[error("CIE augmentation string {augmentation:?} at offset {offset} is not understood")]
    InvalidAugmentation { offset: usize, augmentation: String },

    #[error("FDE at offset {fde_offset} references CIE at offset {cie_offset}, which was never parsed")]
    InconsistentCie { fde_offset: u64, cie_offset: u64 },

    #[error("value overflowed its target range while computing {context}")]
    RangeOverflow { context: &'static str },

    #[error("internal invariant violated: {0}")]
    InvariantViolated(&'static str),

    #[error("failed to read the input object file")]
    ObjectRead(#[from] object::read::Error),

    #[error("failed to construct the output object file")]
    ObjectWrite(#[from] object::write::Error),

    #[error("required section {0:?} is missing from the input object")]
    MissingSection(&'static str),
}

pub type Result<T> = std::result::Result<T, FaeError>;
