use crate::dwarf::cie::Cie;
use crate::error::Result;
use crate::pointer::{decode_pointer, EncodedPointerReference, PointerBases};
use crate::reader::Reader;

/// A Frame Description Entry: one function's (or one contiguous range's)
/// prologue description, expressed as CFA instructions relative to the CIE
/// it points back at.
#[derive(Debug, Clone)]
pub struct Fde {
    pub offset: u64,
    pub cie_offset: u64,
    pub pc_begin: EncodedPointerReference,
    pub pc_range: EncodedPointerReference,
    pub lsda: Option<EncodedPointerReference>,
    /// Byte range of the instruction stream, relative to the start of the
    /// `.eh_frame` section.
    pub instructions: (usize, usize),
}

impl Fde {
    /// Parses one FDE body. `reader` must be positioned just past the
    /// 4-byte CIE-pointer field and scoped to exactly this record's length.
    /// `cie` is the already-parsed CIE `cie_offset` points at.
    pub fn parse(mut reader: Reader, offset: u64, cie_offset: u64, cie: &Cie) -> Result<Fde> {
        let bases = PointerBases::default();
        let pc_begin = decode_pointer(&mut reader, cie.fde_pointer_encoding, bases)?;
        // The range is always stored as an absolute-valued width matching
        // the begin pointer's width, never pc-relative: it is a byte count,
        // not an address.
        let range_encoding = cie.fde_pointer_encoding & 0x0f;
        let pc_range = decode_pointer(&mut reader, range_encoding, bases)?;

        // Gated on the CIE having a personality ('P', per spec.md §4.3 step
        // 4 and original_source/src/parse_obj.cpp's parse_fde), not on 'L'
        // being present: the augmentation data's LSDA-length-then-pointer
        // pair only exists in the FDE when the CIE's augmentation commits to
        // a personality routine at all. The two conditions coincide for
        // every zPLR augmentation avr-gcc actually emits, but P is the
        // correct gate.
        let lsda = if cie.personality_encoding.is_some() {
            let aug_len = reader.read_uleb128()? as usize;
            let mut aug_reader = reader.subreader(aug_len)?;
            let lsda = if let Some(encoding) = cie.lsda_encoding {
                Some(decode_pointer(&mut aug_reader, encoding, bases)?)
            } else {
                None
            };
            reader.skip(aug_len)?;
            lsda
        } else {
            None
        };

        let start = reader.offset();
        let end = start + reader.remaining();

        Ok(Fde {
            offset,
            cie_offset,
            pc_begin,
            pc_range,
            lsda,
            instructions: (start, end),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dwarf::cie::Cie;

    fn test_cie() -> Cie {
        let data = [0x01, b'z', b'R', 0x00, 0x01, 0x7f, 36, 0x01, 0x1b];
        Cie::parse(Reader::new(&data), 0).unwrap()
    }

    #[test]
    fn parses_fde_without_lsda() {
        let cie = test_cie();
        // pc_begin pcrel sdata4 = 0x00000010, pc_range absptr sdata4 = 0x20
        let data = [0x10, 0x00, 0x00, 0x00, 0x20, 0x00, 0x00, 0x00];
        let fde = Fde::parse(Reader::new(&data), 100, 0, &cie).unwrap();
        assert_eq!(fde.pc_range.value, 0x20);
        assert!(fde.lsda.is_none());
    }
}
