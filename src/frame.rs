//! Bridges the DWARF walk/interpreter to the FAE encoder: runs the call-frame
//! instruction interpreter over every FDE a `.eh_frame` section yields and
//! validates the resulting unwind rule against AVR's callee-saved register
//! set before handing it onward.

use crate::avr;
use crate::dwarf::instruction::{self, UnwindRule};
use crate::dwarf::{self, CfiEntry};
use crate::error::{FaeError, Result};
use crate::pointer::EncodedPointerReference;

/// One function's (or contiguous PC range's) unwinding rule, together with
/// the encoded pointers needed to recover its begin/range/LSDA symbols from
/// the input object's relocations.
#[derive(Debug, Clone)]
pub struct Frame {
    pub fde_offset: u64,
    pub pc_begin: EncodedPointerReference,
    pub pc_range: EncodedPointerReference,
    pub lsda: Option<EncodedPointerReference>,
    pub rule: UnwindRule,
}

/// Runs every FDE in `eh_frame` through the CFI interpreter, dropping (and
/// logging) any frame whose instructions are malformed or whose rule
/// mentions a register FAE cannot encode. This mirrors the CIE/FDE walker's
/// own partial-failure policy: one bad function does not prevent the rest of
/// the object from getting unwind info.
pub fn build(eh_frame: &[u8]) -> Result<Vec<Frame>> {
    let mut frames = Vec::new();

    dwarf::walk(eh_frame, |entry| {
        let CfiEntry::Fde(fde, cie) = entry else {
            return;
        };

        let rule = match instruction::run(&cie, eh_frame, fde.instructions) {
            Ok(rule) => rule,
            Err(err) => {
                tracing::warn!(
                    fde_offset = fde.offset,
                    error = %err,
                    "failed to interpret call frame instructions; dropping frame"
                );
                return;
            }
        };

        if let Err(err) = validate_rule(&rule) {
            tracing::warn!(
                fde_offset = fde.offset,
                error = %err,
                "unwind rule references an unencodable register; dropping frame"
            );
            return;
        }

        frames.push(Frame {
            fde_offset: fde.offset,
            pc_begin: fde.pc_begin,
            pc_range: fde.pc_range,
            lsda: fde.lsda,
            rule,
        });
    })?;

    Ok(frames)
}

/// Enforces the invariant that only r2-r17, r28, r29, and the
/// return-address pseudo-register may appear in `register_offsets`.
fn validate_rule(rule: &UnwindRule) -> Result<()> {
    for &(reg, _) in rule.register_offsets.iter() {
        if avr::is_frame_bookkeeping_register(reg) {
            continue;
        }
        if reg >= 32 || !avr::is_callee_saved(reg) {
            return Err(FaeError::UnsupportedRegister { register: reg });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dwarf::consts::*;

    fn zr_cie_bytes() -> Vec<u8> {
        // version=1, aug="zR\0", code_align=1, data_align=-1, ra=36,
        // aug_len=1, fde_ptr_encoding=0x1b (pcrel|sdata4).
        let body = [0x00u8, 0x00, 0x00, 0x00, 0x01, b'z', b'R', 0x00, 0x01, 0x7f, 36, 0x01, 0x1b];
        let mut out = Vec::new();
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn drops_fde_with_unsupported_register_but_keeps_walking() {
        let mut section = zr_cie_bytes();
        let cie_len = section.len();

        // FDE whose rule offsets register r1 (not callee-saved): offset
        // r1,1. pc_begin/pc_range decoded via pcrel|sdata4 (4 bytes each).
        let mut fde_body = Vec::new();
        fde_body.extend_from_slice(&(cie_len as u32).to_le_bytes()); // cie back-pointer
        fde_body.extend_from_slice(&0u32.to_le_bytes()); // pc_begin
        fde_body.extend_from_slice(&0x10u32.to_le_bytes()); // pc_range
        fde_body.push(DW_CFA_OFFSET | 1);
        fde_body.push(0x01);

        let mut fde_record = Vec::new();
        fde_record.extend_from_slice(&(fde_body.len() as u32).to_le_bytes());
        fde_record.extend_from_slice(&fde_body);

        section.extend_from_slice(&fde_record);
        section.extend_from_slice(&[0u8; 4]); // terminator

        let frames = build(&section).unwrap();
        assert!(frames.is_empty());
    }

    #[test]
    fn keeps_frame_with_only_callee_saved_registers() {
        let mut section = zr_cie_bytes();
        let cie_len = section.len();

        let mut fde_body = Vec::new();
        fde_body.extend_from_slice(&(cie_len as u32).to_le_bytes());
        fde_body.extend_from_slice(&0u32.to_le_bytes());
        fde_body.extend_from_slice(&0x10u32.to_le_bytes());
        fde_body.push(DW_CFA_DEF_CFA_OFFSET);
        fde_body.push(0x02);
        fde_body.push(DW_CFA_OFFSET | 16);
        fde_body.push(0x01);

        let mut fde_record = Vec::new();
        fde_record.extend_from_slice(&(fde_body.len() as u32).to_le_bytes());
        fde_record.extend_from_slice(&fde_body);

        section.extend_from_slice(&fde_record);
        section.extend_from_slice(&[0u8; 4]);

        let frames = build(&section).unwrap();
        assert_eq!(frames.len(), 1);
        // data_alignment_factor is -1, so def_cfa_offset 2 scales to -2.
        assert_eq!(frames[0].rule.cfa_offset, -2);
    }
}
