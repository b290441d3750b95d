use crate::error::{FaeError, Result};
use crate::reader::Reader;

/// A Common Information Entry: the template shared by every FDE that
/// references it. AVR's `.eh_frame` only ever contains the `zR`/`zPLR`
/// augmentation shapes gcc emits for a `-fexceptions` unit; anything else
/// surfaces as [`FaeError::InvalidAugmentation`] rather than being
/// silently misparsed.
#[derive(Debug, Clone)]
pub struct Cie {
    pub offset: u64,
    pub code_alignment_factor: u64,
    pub data_alignment_factor: i64,
    pub return_address_register: u8,
    pub fde_pointer_encoding: u8,
    pub lsda_encoding: Option<u8>,
    pub personality_encoding: Option<u8>,
    pub personality: Option<crate::pointer::EncodedPointerReference>,
    pub is_signal_frame: bool,
    /// Byte range of the initial instruction stream, relative to the start
    /// of the `.eh_frame` section.
    pub initial_instructions: (usize, usize),
}

impl Cie {
    /// Parses one CIE body. `reader` must already be positioned just past
    /// the 4-byte CIE id field (which the caller used to distinguish a CIE
    /// from an FDE), and scoped to exactly this record's length.
    pub fn parse(mut reader: Reader, offset: u64) -> Result<Cie> {
        let version = reader.read_u8()?;
        if version != 1 && version != 3 {
            return Err(FaeError::InvalidAugmentation {
                offset: offset as usize,
                augmentation: format!("unsupported CIE version {version}"),
            });
        }

        let augmentation = reader.read_cstr()?.to_string();
        let code_alignment_factor = reader.read_uleb128()?;
        let data_alignment_factor = reader.read_sleb128()?;
        let return_address_register = reader.read_uleb128()? as u8;

        let mut fde_pointer_encoding = 0x00; // DW_EH_PE_absptr
        let mut lsda_encoding = None;
        let mut personality_encoding = None;
        let mut personality = None;
        let mut is_signal_frame = false;

        if augmentation.starts_with('z') {
            let aug_len = reader.read_uleb128()? as usize;
            let mut aug_reader = reader.subreader(aug_len)?;

            for c in augmentation.chars().skip(1) {
                match c {
                    'z' => {}
                    'L' => {
                        lsda_encoding = Some(aug_reader.read_u8()?);
                    }
                    'P' => {
                        let encoding = aug_reader.read_u8()?;
                        personality_encoding = Some(encoding);
                        personality = Some(crate::pointer::decode_pointer(
                            &mut aug_reader,
                            encoding,
                            crate::pointer::PointerBases::default(),
                        )?);
                    }
                    'R' => {
                        fde_pointer_encoding = aug_reader.read_u8()?;
                    }
                    'S' => {
                        is_signal_frame = true;
                    }
                    _ => {
                        return Err(FaeError::InvalidAugmentation {
                            offset: offset as usize,
                            augmentation,
                        });
                    }
                }
            }

            reader.skip(aug_len)?;
        } else if !augmentation.is_empty() {
            return Err(FaeError::InvalidAugmentation {
                offset: offset as usize,
                augmentation,
            });
        }

        let start = reader.offset();
        let end = start + reader.remaining();

        Ok(Cie {
            offset,
            code_alignment_factor,
            data_alignment_factor,
            return_address_register,
            fde_pointer_encoding,
            lsda_encoding,
            personality_encoding,
            personality,
            is_signal_frame,
            initial_instructions: (start, end),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_zr_augmentation() {
        // version=1, aug="zR\0", code_align=1, data_align=-1 (0x7f sleb),
        // ra_register=36, aug_len=1, fde_encoding=0x1b (pcrel|sdata4).
        let data = [
            0x01, b'z', b'R', 0x00, 0x01, 0x7f, 36, 0x01, 0x1b,
        ];
        let cie = Cie::parse(Reader::new(&data), 0).unwrap();
        assert_eq!(cie.code_alignment_factor, 1);
        assert_eq!(cie.data_alignment_factor, -1);
        assert_eq!(cie.return_address_register, 36);
        assert_eq!(cie.fde_pointer_encoding, 0x1b);
        assert!(cie.initial_instructions.0 == cie.initial_instructions.1);
    }

    #[test]
    fn rejects_unknown_augmentation_letter() {
        let data = [0x01, b'z', b'Q', 0x00, 0x01, 0x7f, 36, 0x00];
        let err = Cie::parse(Reader::new(&data), 0).unwrap_err();
        assert!(matches!(err, FaeError::InvalidAugmentation { .. }));
    }
}
