pub mod cie;
pub mod consts;
pub mod fde;
pub mod instruction;

use crate::error::{FaeError, Result};
use crate::reader::Reader;
use cie::Cie;
use fde::Fde;
use std::collections::HashMap;

/// One record read out of `.eh_frame`: either a new CIE, entered into the
/// caller's CIE arena, or an FDE referencing one. The FDE variant carries a
/// copy of the CIE it resolved against, since the CFI interpreter needs the
/// CIE's initial instructions and data alignment factor and the arena that
/// produced it is private to `walk`.
pub enum CfiEntry {
    Cie(Cie),
    Fde(Fde, Cie),
}

/// Walks every CIE/FDE in `section`, handing each to `on_entry`. A
/// malformed FDE is logged and skipped rather than aborting the whole
/// section, since one miscompiled or hand-written assembly unit shouldn't
/// take down frame-info generation for an entire object file. A malformed
/// CIE is fatal: every FDE that depends on it would fail anyway, and the
/// error is far more informative raised at the CIE itself.
pub fn walk(section: &[u8], mut on_entry: impl FnMut(CfiEntry)) -> Result<()> {
    let mut cies: HashMap<u64, Cie> = HashMap::new();
    let mut reader = Reader::new(section);

    while !reader.is_empty() {
        let record_offset = reader.offset() as u64;

        // `.eh_frame` uses the GNU 32-bit length form exclusively on AVR;
        // the 0xffffffff 64-bit-DWARF escape never appears in practice for
        // this target, so it is treated as an error rather than supported.
        let length = reader.read_u32()?;
        if length == 0 {
            // A zero-length record is the GNU terminator entry; stop here
            // rather than trying to interpret trailing padding as a record.
            break;
        }
        if length == 0xffff_ffff {
            return Err(FaeError::InvalidAugmentation {
                offset: record_offset as usize,
                augmentation: "64-bit DWARF length escape is not supported".into(),
            });
        }

        let body = reader.subreader(length as usize)?;
        reader.skip(length as usize)?;

        let mut id_reader = body;
        let id = id_reader.read_u32()?;

        if id == 0 {
            let cie = Cie::parse(id_reader, record_offset)?;
            cies.insert(record_offset, cie.clone());
            on_entry(CfiEntry::Cie(cie));
            continue;
        }

        // The CIE pointer is the record's own start offset minus `id`,
        // per the `.eh_frame` (not `.debug_frame`) convention.
        let cie_offset = record_offset
            .checked_add(4)
            .and_then(|v| v.checked_sub(id as u64))
            .ok_or(FaeError::RangeOverflow {
                context: "FDE CIE-pointer subtraction",
            })?;

        // Both ways an FDE can fail to produce an entry - an unresolvable
        // CIE back-reference, or a malformed instruction stream - funnel
        // through the same per-record boundary and the same declared error
        // type, so one bad function never takes down the rest of the walk.
        let outcome: Result<(Fde, Cie)> = cies
            .get(&cie_offset)
            .ok_or(FaeError::InconsistentCie {
                fde_offset: record_offset,
                cie_offset,
            })
            .and_then(|cie| {
                Fde::parse(id_reader, record_offset, cie_offset, cie).map(|fde| (fde, cie.clone()))
            });

        match outcome {
            Ok((fde, cie)) => on_entry(CfiEntry::Fde(fde, cie)),
            Err(err) => {
                tracing::warn!(
                    fde_offset = record_offset,
                    error = %err,
                    "malformed FDE; skipping this record"
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cie_bytes() -> Vec<u8> {
        let body = [0x00u8, 0x00, 0x00, 0x00, b'z', b'R', 0x00, 0x01, 0x7f, 36, 0x01, 0x1b];
        let mut out = Vec::new();
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn walks_a_lone_cie() {
        let section = cie_bytes();
        let mut seen_cie = false;
        walk(&section, |entry| {
            if let CfiEntry::Cie(_) = entry {
                seen_cie = true;
            }
        })
        .unwrap();
        assert!(seen_cie);
    }

    #[test]
    fn stops_at_zero_length_terminator() {
        let section = [0u8, 0, 0, 0];
        let mut count = 0;
        walk(&section, |_| count += 1).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn fde_with_unresolvable_cie_back_reference_is_skipped_not_fatal() {
        // An FDE whose 4-byte CIE pointer doesn't land on any CIE this walk
        // parsed should be dropped (FaeError::InconsistentCie, caught at the
        // per-record boundary), not abort the whole section.
        let mut fde_body = Vec::new();
        // Back-offset of 4 resolves to file offset 0, where this section
        // parses no CIE at all (there is none in the section).
        fde_body.extend_from_slice(&4u32.to_le_bytes());
        fde_body.extend_from_slice(&0u32.to_le_bytes());
        fde_body.extend_from_slice(&0x10u32.to_le_bytes());

        let mut section = Vec::new();
        section.extend_from_slice(&(fde_body.len() as u32).to_le_bytes());
        section.extend_from_slice(&fde_body);
        section.extend_from_slice(&[0u8; 4]);

        let mut count = 0;
        walk(&section, |_| count += 1).unwrap();
        assert_eq!(count, 0);
    }
}
