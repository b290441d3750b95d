//! Packages encoded frames into a standalone relocatable ELF object carrying
//! `.fae_entries`, `.fae_info` and `.rela.fae_info` — the companion object a
//! build step links alongside the input's own `.o` file. The linker-time
//! merger (`fae::reader::merge`) is what actually stitches many such
//! objects' `.fae_info` tables into one sorted `.fae_table`.
//!
//! Built as a small stage machine (`init` -> `sections_built` ->
//! `relocs_built` -> `written`) rather than one long function, since the
//! underlying `object::write::Object` genuinely cannot accept relocations
//! against a section before that section exists, and cannot be serialized
//! usefully before its relocations are attached.

use crate::error::{FaeError, Result};
use crate::fae::encoder::EncodedProgram;
use crate::fae::{HEADER_SIZE, INFO_ENTRY_SIZE, MAGIC, NO_INSTRUCTIONS};
use crate::frame::Frame;
use crate::reloc::{AvrRelocKind, RelocationTracker};
use crate::writer::Writer;
use object::write::{
    Object as WriteObject, Relocation, Symbol, SymbolFlags, SymbolId, SymbolSection,
};
use object::{Architecture, BinaryFormat, Endianness, RelocationFlags, SectionKind, SymbolKind, SymbolScope};
use std::collections::HashMap;

/// Raw `sh_type` the AVR toolchain reserves for `.fae_info`. Picked in the
/// processor-specific range (`SHT_LOPROC..SHT_HIPROC`) so generic linkers
/// that don't understand it still carry it through unmodified.
const SHT_AVR_FAE_INFO: u32 = 0x8110_0000;

/// One unresolved pointer field inside a not-yet-emitted `.fae_info` entry:
/// "patch the 4 bytes at `field_offset` with a relocation against
/// `symbol_name` + `addend`" instead of a raw value, because the input
/// object's own relocations say this field names a symbol rather than a
/// link-time-constant address.
struct PendingRelocation {
    field_offset: u64,
    symbol_name: String,
    addend: i64,
}

struct InfoEntry {
    offset: u32,
    length: u32,
    begin: u32,
    range: u32,
    lsda_offset: u32,
    cfa_reg: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Init,
    SectionsBuilt,
    RelocsBuilt,
    Written,
}

/// Builds one `.fae_entries`/`.fae_info`/`.rela.fae_info` object. See the
/// module docs for why this is staged rather than a single free function.
pub struct FaeObjectBuilder {
    obj: WriteObject<'static>,
    stage: Stage,
    imported: HashMap<String, SymbolId>,
    info_section: Option<object::write::SectionId>,
}

impl FaeObjectBuilder {
    pub fn new() -> Self {
        FaeObjectBuilder {
            obj: WriteObject::new(BinaryFormat::Elf, Architecture::Avr, Endianness::Little),
            stage: Stage::Init,
            imported: HashMap::new(),
            info_section: None,
        }
    }

    fn require(&self, expected: Stage) -> Result<()> {
        if self.stage != expected {
            return Err(FaeError::InvariantViolated(
                "FAE object builder methods were called out of order",
            ));
        }
        Ok(())
    }

    /// Imports (or reuses a prior import of) `name` as an undefined symbol,
    /// the way a compiler emits an `extern` reference: the linker resolves
    /// it against whatever object defines `name`, which on AVR is always
    /// the same translation unit this companion object travels with.
    fn import_symbol(&mut self, name: &str) -> SymbolId {
        if let Some(&id) = self.imported.get(name) {
            return id;
        }
        let id = self.obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Unknown,
            scope: SymbolScope::Dynamic,
            weak: false,
            section: SymbolSection::Undefined,
            flags: SymbolFlags::None,
        });
        self.imported.insert(name.to_string(), id);
        id
    }

    /// Creates `.fae_entries` and `.fae_info`, and the `<basename>_fae_frames`
    /// symbol anchoring the entries stream so a merged `.fae_table`'s
    /// `data` field can be expressed as a PC-independent offset from it.
    pub fn build_sections(&mut self, basename: &str, entries: &[u8], info_bytes: &[u8]) -> Result<()> {
        self.require(Stage::Init)?;

        let entries_id = self
            .obj
            .add_section(Vec::new(), b".fae_entries".to_vec(), SectionKind::ReadOnlyData);
        self.obj.set_section_data(entries_id, entries.to_vec(), 2);

        let info_id = self
            .obj
            .add_section(Vec::new(), b".fae_info".to_vec(), SectionKind::Elf(SHT_AVR_FAE_INFO));
        self.obj.set_section_data(info_id, info_bytes.to_vec(), 4);
        self.obj.section_mut(info_id).flags = object::write::SectionFlags::Elf {
            sh_flags: object::elf::SHF_GNU_RETAIN as u64,
        };

        self.obj.add_symbol(Symbol {
            name: format!("{basename}_fae_frames").into_bytes(),
            value: 0,
            size: entries.len() as u64,
            kind: SymbolKind::Data,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(entries_id),
            flags: SymbolFlags::None,
        });

        self.info_section = Some(info_id);
        self.stage = Stage::SectionsBuilt;
        Ok(())
    }

    /// Attaches `.rela.fae_info`. Each pending relocation becomes an
    /// `R_AVR_32` against whatever symbol the input's `.eh_frame`
    /// relocations named at that pointer's original file offset.
    fn build_relocations(&mut self, pending: &[PendingRelocation]) -> Result<()> {
        self.require(Stage::SectionsBuilt)?;
        let info_id = self
            .info_section
            .ok_or(FaeError::InvariantViolated("fae_info section missing"))?;

        for reloc in pending {
            let symbol = self.import_symbol(&reloc.symbol_name);
            self.obj
                .add_relocation(
                    info_id,
                    Relocation {
                        offset: reloc.field_offset,
                        symbol,
                        addend: reloc.addend,
                        flags: RelocationFlags::Elf {
                            r_type: AvrRelocKind::R32.to_raw(),
                        },
                    },
                )
                .map_err(FaeError::ObjectWrite)?;
        }

        self.stage = Stage::RelocsBuilt;
        Ok(())
    }

    fn finish(&mut self) -> Result<Vec<u8>> {
        if self.stage != Stage::RelocsBuilt {
            return Err(FaeError::InvariantViolated(
                "attempted to write the FAE object before its relocations were built",
            ));
        }
        let bytes = self.obj.write().map_err(FaeError::ObjectWrite)?;
        self.stage = Stage::Written;
        Ok(bytes)
    }
}

impl Default for FaeObjectBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything [`emit`] needs to resolve a frame's `begin`/`lsda` pointers
/// back to the symbols the input object's relocations named, since the
/// pointer values `pointer::decode_pointer` produced are meaningless outside
/// that context (pc-relative to an unlinked section, or simply absent).
pub struct EmitInput<'a> {
    pub basename: &'a str,
    pub frames: &'a [Frame],
    pub programs: &'a [EncodedProgram],
    pub entries: Vec<u8>,
    pub reloc_tracker: &'a RelocationTracker,
    pub symbol_name: &'a dyn Fn(u32) -> Result<String>,
}

/// Builds the full `.fae_entries` + `.fae_info` + `.rela.fae_info` companion
/// object for one input object's worth of frames.
pub fn emit(input: EmitInput) -> Result<Vec<u8>> {
    assert_eq!(
        input.frames.len(),
        input.programs.len(),
        "emit() requires one encoded program per frame"
    );

    let mut pending = Vec::new();
    let mut entries = Vec::with_capacity(input.frames.len());

    for (index, (frame, program)) in input.frames.iter().zip(input.programs.iter()).enumerate() {
        let field_base = (HEADER_SIZE + index * INFO_ENTRY_SIZE) as u64;

        let begin = match input.reloc_tracker.at(frame.pc_begin.file_offset) {
            Some(record) => {
                pending.push(PendingRelocation {
                    field_offset: field_base + 8, // `begin` field, see InfoEntry layout
                    symbol_name: (input.symbol_name)(record.symbol_index)?,
                    addend: record.addend,
                });
                0
            }
            None => frame.pc_begin.value as u32,
        };

        let lsda_offset = match &frame.lsda {
            Some(lsda_ref) => match input.reloc_tracker.at(lsda_ref.file_offset) {
                Some(record) => {
                    pending.push(PendingRelocation {
                        field_offset: field_base + 16, // `lsda_offset` field
                        symbol_name: (input.symbol_name)(record.symbol_index)?,
                        addend: record.addend,
                    });
                    0
                }
                None => lsda_ref.value as u32,
            },
            None => NO_INSTRUCTIONS,
        };

        entries.push(InfoEntry {
            offset: program.offset,
            length: program.length,
            begin,
            range: frame.pc_range.value as u32,
            lsda_offset,
            cfa_reg: frame.rule.cfa_register as u32,
        });
    }

    let info_bytes = build_info_bytes(&entries);

    let mut builder = FaeObjectBuilder::new();
    builder.build_sections(input.basename, &input.entries, &info_bytes)?;
    builder.build_relocations(&pending)?;
    builder.finish()
}

fn build_info_bytes(entries: &[InfoEntry]) -> Vec<u8> {
    let mut w = Writer::with_capacity(HEADER_SIZE + entries.len() * INFO_ENTRY_SIZE);
    w.write_bytes(&MAGIC);
    w.write_u16_le((entries.len() * INFO_ENTRY_SIZE) as u16);
    for e in entries {
        w.write_u32_le(e.offset);
        w.write_u32_le(e.length);
        w.write_u32_le(e.begin);
        w.write_u32_le(e.range);
        w.write_u32_le(e.lsda_offset);
        w.write_u32_le(e.cfa_reg);
    }
    w.into_bytes()
}
