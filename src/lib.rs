//! Translates the DWARF call frame information AVR-GCC emits into `.eh_frame`
//! into the compact AVR Exception Format (FAE): a `pop`/`skip` byte program
//! per function plus a small fixed-size info table, built to fit in the
//! handful of bytes of flash an 8-bit microcontroller can spare for unwind
//! metadata.
//!
//! The pipeline is a straight line from input object to output object:
//!
//!   1. [`input::InputObject`] parses the ELF relocatable object and hands
//!      back `.eh_frame`'s bytes plus an index of its relocations.
//!   2. [`dwarf::walk`] splits that section into CIE/FDE records; for each
//!      FDE, [`dwarf::instruction::run`] replays its call-frame instructions
//!      (seeded by its CIE's initial instructions) into an [`UnwindRule`].
//!   3. [`frame::build`] wraps that walk, validating every rule against
//!      AVR's callee-saved register set and dropping (with a log line) any
//!      frame that fails either step.
//!   4. [`fae::encoder::FaeEncoder`] compiles each surviving rule into a
//!      deduplicated byte program.
//!   5. [`fae::object::emit`] packages the programs and info entries into a
//!      companion ELF object carrying `.fae_entries`, `.fae_info` and
//!      `.rela.fae_info`.
//!
//! [`translate`] drives all five steps for one input buffer. A separate,
//! later build step ([`fae::reader::merge`]) combines many such companion
//! objects into one linked `.fae_table`; that step is not part of this
//! per-object translation and is exposed for the linker-time tool to call
//! directly.
//!
//! [`UnwindRule`]: dwarf::instruction::UnwindRule

pub mod avr;
pub mod dwarf;
pub mod error;
pub mod fae;
pub mod frame;
mod input;
pub mod pointer;
pub mod reader;
pub mod reloc;
pub mod writer;

pub use error::{FaeError, Result};
use input::InputObject;

/// Tunables for one translation run. The return-address width is the one
/// thing that varies across AVR parts: 2 bytes on anything with up to
/// 128KiB of flash, 3 on the handful of parts with more.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub return_address_size: u8,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            return_address_size: 2,
        }
    }
}

/// Translates one ELF relocatable object's `.eh_frame` into a standalone FAE
/// companion object, ready to be linked alongside the input.
///
/// Per-frame failures (a malformed FDE, an unencodable register) are logged
/// and drop only that frame; an error here means something that can't be
/// partially recovered from — the input lacking `.eh_frame` entirely, or the
/// output object failing to serialize.
pub fn translate(input: &[u8], config: Config) -> Result<Vec<u8>> {
    let object = InputObject::parse(input)?;
    let (eh_frame, reloc_tracker) = object.eh_frame()?;

    let frames = frame::build(eh_frame)?;

    let mut encoder = fae::encoder::FaeEncoder::new(config.return_address_size);
    let mut programs = Vec::with_capacity(frames.len());
    for frame in &frames {
        programs.push(encoder.encode(&frame.rule)?);
    }
    let entries = encoder.into_entries();

    let symbol_name = |index: u32| object.symbol_name(index);
    fae::object::emit(fae::object::EmitInput {
        basename: &object.basename(),
        frames: &frames,
        programs: &programs,
        entries,
        reloc_tracker: &reloc_tracker,
        symbol_name: &symbol_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_default_is_two_byte_return_address() {
        assert_eq!(Config::default().return_address_size, 2);
    }
}
