use crate::dwarf::consts::*;
use crate::error::{FaeError, Result};
use crate::reader::Reader;

/// The bases against which a `pcrel`/`textrel`/`datarel`/`funcrel`-encoded
/// pointer is resolved. All four are section-relative file offsets rather
/// than runtime addresses: the object being processed here hasn't been
/// linked yet, so there is no load address to resolve against. This mirrors
/// how relocations against these pointers get fixed up later by the linker.
#[derive(Debug, Clone, Copy, Default)]
pub struct PointerBases {
    pub text_base: u64,
    pub data_base: u64,
    pub func_base: u64,
}

/// A pointer decoded out of a CIE or FDE, paired with the file offset it was
/// read from. The offset lets a later pass replace the raw value with a
/// relocated symbol reference when one exists at that position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedPointerReference {
    pub value: i64,
    pub file_offset: u64,
}

/// Decodes one `DW_EH_PE_*`-encoded pointer. `self_offset` is the absolute
/// file offset of the encoded value itself, needed for `pcrel`.
pub fn decode_pointer(
    reader: &mut Reader,
    encoding: u8,
    bases: PointerBases,
) -> Result<EncodedPointerReference> {
    if encoding == DW_EH_PE_OMIT {
        return Err(FaeError::InvariantViolated(
            "decode_pointer called with DW_EH_PE_omit",
        ));
    }

    let file_offset = reader.offset() as u64;
    let format = encoding & 0x0f;
    let application = encoding & 0x70;
    let indirect = encoding & DW_EH_PE_INDIRECT != 0;

    let raw: i64 = match format {
        DW_EH_PE_ABSPTR => reader.read_u32()? as i64,
        DW_EH_PE_ULEB128 => reader.read_uleb128()? as i64,
        DW_EH_PE_UDATA2 => reader.read_u16()? as i64,
        DW_EH_PE_UDATA4 => reader.read_u32()? as i64,
        DW_EH_PE_UDATA8 => reader.read_u64()? as i64,
        DW_EH_PE_SLEB128 => reader.read_sleb128()?,
        DW_EH_PE_SDATA2 => reader.read_i16()? as i64,
        DW_EH_PE_SDATA4 => reader.read_i32()? as i64,
        DW_EH_PE_SDATA8 => reader.read_i64()?,
        _ => {
            return Err(FaeError::UnknownDwarfEncoding {
                encoding,
                offset: file_offset as usize,
            })
        }
    };

    let base = match application {
        0x00 => 0,
        DW_EH_PE_PCREL => file_offset as i64,
        DW_EH_PE_TEXTREL => bases.text_base as i64,
        DW_EH_PE_DATAREL => bases.data_base as i64,
        DW_EH_PE_FUNCREL => bases.func_base as i64,
        _ => {
            return Err(FaeError::UnknownDwarfEncoding {
                encoding,
                offset: file_offset as usize,
            })
        }
    };

    let value = if application == 0x00 { raw } else { raw.wrapping_add(base) };

    if indirect {
        // We never dereference at this stage: the value is only ever used
        // either as a relocation lookup key or as a size/offset constant,
        // neither of which benefit from following the indirection here.
        tracing::trace!(encoding, "indirect pointer encoding left unresolved");
    }

    Ok(EncodedPointerReference { value, file_offset })
}

/// The byte width a given encoding occupies, used by callers that need to
/// size a fixed-width field without actually decoding it (e.g. skipping an
/// augmentation data block whose only entry is an FDE pointer encoding).
pub fn encoded_width(encoding: u8) -> Option<usize> {
    match encoding & 0x0f {
        DW_EH_PE_ABSPTR => Some(4),
        DW_EH_PE_UDATA2 | DW_EH_PE_SDATA2 => Some(2),
        DW_EH_PE_UDATA4 | DW_EH_PE_SDATA4 => Some(4),
        DW_EH_PE_UDATA8 | DW_EH_PE_SDATA8 => Some(8),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_absptr() {
        let data = [0x78, 0x56, 0x34, 0x12];
        let mut r = Reader::new(&data);
        let p = decode_pointer(&mut r, DW_EH_PE_ABSPTR, PointerBases::default()).unwrap();
        assert_eq!(p.value, 0x1234_5678);
    }

    #[test]
    fn decodes_pcrel_sdata4_relative_to_its_own_offset() {
        let data = [0xaa, 0x00, 0x10, 0x00, 0x00];
        let mut r = Reader::new(&data);
        r.skip(1).unwrap();
        let p = decode_pointer(
            &mut r,
            DW_EH_PE_PCREL | DW_EH_PE_SDATA4,
            PointerBases::default(),
        )
        .unwrap();
        // offset was 1, encoded delta was 0x10, so value = 0x11.
        assert_eq!(p.value, 1 + 0x10);
        assert_eq!(p.file_offset, 1);
    }

    #[test]
    fn unknown_encoding_is_reported() {
        let data = [0u8; 4];
        let mut r = Reader::new(&data);
        let err = decode_pointer(&mut r, 0x06, PointerBases::default()).unwrap_err();
        assert!(matches!(err, FaeError::UnknownDwarfEncoding { .. }));
    }
}
