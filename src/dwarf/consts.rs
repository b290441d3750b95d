//! DWARF call-frame opcode and pointer-encoding constants.
//!
//! Only the subset actually emitted by avr-gcc's `.eh_frame` is named here;
//! anything else surfaces as [`crate::error::FaeError::UnknownCfiInstruction`].

// Pointer encoding (DW_EH_PE_*) value-format nibble (low 4 bits).
pub const DW_EH_PE_ABSPTR: u8 = 0x00;
pub const DW_EH_PE_ULEB128: u8 = 0x01;
pub const DW_EH_PE_UDATA2: u8 = 0x02;
pub const DW_EH_PE_UDATA4: u8 = 0x03;
pub const DW_EH_PE_UDATA8: u8 = 0x04;
pub const DW_EH_PE_SLEB128: u8 = 0x09;
pub const DW_EH_PE_SDATA2: u8 = 0x0a;
pub const DW_EH_PE_SDATA4: u8 = 0x0b;
pub const DW_EH_PE_SDATA8: u8 = 0x0c;
pub const DW_EH_PE_OMIT: u8 = 0xff;

// Pointer encoding base (high 4 bits, before masking with 0x70).
pub const DW_EH_PE_PCREL: u8 = 0x10;
pub const DW_EH_PE_TEXTREL: u8 = 0x20;
pub const DW_EH_PE_DATAREL: u8 = 0x30;
pub const DW_EH_PE_FUNCREL: u8 = 0x40;
pub const DW_EH_PE_INDIRECT: u8 = 0x80;

// Two-high-bit packed opcodes: low 6 bits carry an operand.
pub const DW_CFA_ADVANCE_LOC: u8 = 0x40;
pub const DW_CFA_OFFSET: u8 = 0x80;
pub const DW_CFA_RESTORE: u8 = 0xc0;

// Extended opcodes (top two bits zero).
pub const DW_CFA_NOP: u8 = 0x00;
pub const DW_CFA_SET_LOC: u8 = 0x01;
pub const DW_CFA_ADVANCE_LOC1: u8 = 0x02;
pub const DW_CFA_ADVANCE_LOC2: u8 = 0x03;
pub const DW_CFA_ADVANCE_LOC4: u8 = 0x04;
pub const DW_CFA_OFFSET_EXTENDED: u8 = 0x05;
pub const DW_CFA_RESTORE_EXTENDED: u8 = 0x06;
pub const DW_CFA_UNDEFINED: u8 = 0x07;
pub const DW_CFA_SAME_VALUE: u8 = 0x08;
pub const DW_CFA_REGISTER: u8 = 0x09;
pub const DW_CFA_REMEMBER_STATE: u8 = 0x0a;
pub const DW_CFA_RESTORE_STATE: u8 = 0x0b;
pub const DW_CFA_DEF_CFA: u8 = 0x0c;
pub const DW_CFA_DEF_CFA_REGISTER: u8 = 0x0d;
pub const DW_CFA_DEF_CFA_OFFSET: u8 = 0x0e;
pub const DW_CFA_DEF_CFA_EXPRESSION: u8 = 0x0f;

/// The non-standard three-byte `0xa4`-prefixed sequence some AVR toolchains
/// were observed to emit for `DW_CFA_GNU_window_save`. See the open question
/// in the design notes: this has not been confirmed against current GCC-AVR.
pub const DW_CFA_GNU_WINDOW_SAVE_ALT_PREFIX: u8 = 0xa4;
pub const DW_CFA_GNU_WINDOW_SAVE: u8 = 0x2d;

/// The DWARF pseudo-register number used by AVR for the return address.
pub const DW_REG_RETURN_ADDRESS: u8 = 36;
