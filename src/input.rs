//! Reads the input ELF relocatable object: pulls out `.eh_frame`'s bytes and
//! indexes its relocations, and resolves symbol names on demand for the
//! emitter. Kept separate from `lib.rs` so the translation pipeline itself
//! never touches `object::read` directly.

use crate::error::{FaeError, Result};
use crate::reloc::{AvrRelocKind, RelocationRecord, RelocationTracker};
use object::{Object, ObjectSection, ObjectSymbol, RelocationFlags, RelocationTarget};

/// A parsed input object, borrowed from the caller's buffer for the
/// lifetime of the translation.
pub struct InputObject<'data> {
    file: object::File<'data>,
}

impl<'data> InputObject<'data> {
    pub fn parse(data: &'data [u8]) -> Result<Self> {
        let file = object::File::parse(data)?;
        Ok(InputObject { file })
    }

    /// Returns `.eh_frame`'s raw bytes together with a tracker indexing
    /// `.rela.eh_frame` by the offset each relocation applies to, so later
    /// passes can ask "does a relocation sit on the pointer I just decoded?"
    pub fn eh_frame(&self) -> Result<(&'data [u8], RelocationTracker)> {
        let section = self
            .file
            .section_by_name(".eh_frame")
            .ok_or(FaeError::MissingSection(".eh_frame"))?;
        let data = section.data()?;

        let mut records = Vec::new();
        for (offset, relocation) in section.relocations() {
            let symbol_index = match relocation.target() {
                RelocationTarget::Symbol(index) => index.0 as u32,
                // Section- and absolute-targeted relocations don't name a
                // symbol the emitter can import by name; FAE only needs the
                // begin/LSDA pointers, which avr-gcc always relocates
                // against a symbol, so these are simply not indexed.
                _ => continue,
            };
            let kind = match relocation.flags() {
                RelocationFlags::Elf { r_type } => AvrRelocKind::from_raw(r_type),
                _ => continue,
            };
            records.push(RelocationRecord {
                offset,
                symbol_index,
                kind,
                addend: relocation.addend(),
            });
        }

        Ok((data, RelocationTracker::from_records(records)))
    }

    /// Resolves a symbol table index (as recorded in a [`RelocationRecord`])
    /// back to its name, for the emitter to re-import into the companion
    /// object.
    pub fn symbol_name(&self, index: u32) -> Result<String> {
        let symbol = self
            .file
            .symbol_by_index(object::SymbolIndex(index as usize))
            .map_err(FaeError::ObjectRead)?;
        Ok(symbol.name().map_err(FaeError::ObjectRead)?.to_string())
    }

    /// The basename the emitter's per-object symbols (`<basename>_fae_frames`
    /// and friends) are derived from, taken from the first `.text` section's
    /// name with the `.text` prefix trimmed, falling back to `"module"` for
    /// an object with no text section at all (e.g. one containing only data).
    pub fn basename(&self) -> String {
        for section in self.file.sections() {
            if let Ok(name) = section.name() {
                if let Some(rest) = name.strip_prefix(".text") {
                    let trimmed = rest.trim_start_matches('.');
                    if !trimmed.is_empty() {
                        return trimmed.to_string();
                    }
                }
            }
        }
        "module".to_string()
    }
}
