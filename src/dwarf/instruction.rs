use crate::dwarf::cie::Cie;
use crate::dwarf::consts::*;
use crate::error::{FaeError, Result};
use crate::reader::Reader;
use smallvec::SmallVec;
use std::hash::{Hash, Hasher};

/// The result of running a CIE's initial instructions followed by one
/// FDE's instructions to completion: where the caller's frame's CFA sits
/// relative to the current function, and where each callee-saved register
/// that got spilled is stored relative to that CFA.
///
/// Two rules that save the same registers at the same offsets are
/// considered equal regardless of the order the underlying CFI opcodes
/// produced them in, which is what lets the FAE encoder deduplicate
/// functions whose prologues are byte-identical modulo instruction
/// ordering.
#[derive(Debug, Clone)]
pub struct UnwindRule {
    pub cfa_register: u8,
    pub cfa_offset: i64,
    pub register_offsets: SmallVec<[(u8, i64); 8]>,
}

impl UnwindRule {
    fn sorted_offsets(&self) -> SmallVec<[(u8, i64); 8]> {
        let mut v = self.register_offsets.clone();
        v.sort_unstable_by_key(|&(reg, _)| reg);
        v
    }
}

impl PartialEq for UnwindRule {
    fn eq(&self, other: &Self) -> bool {
        self.cfa_register == other.cfa_register
            && self.cfa_offset == other.cfa_offset
            && self.sorted_offsets() == other.sorted_offsets()
    }
}
impl Eq for UnwindRule {}

impl Hash for UnwindRule {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.cfa_register.hash(state);
        self.cfa_offset.hash(state);
        // XOR-combine per-register hashes so the result doesn't depend on
        // the order register_offsets was populated in.
        let mut combined: u64 = 0;
        for &(reg, offset) in &self.register_offsets {
            let mut h = std::collections::hash_map::DefaultHasher::new();
            (reg, offset).hash(&mut h);
            combined ^= h.finish();
        }
        combined.hash(state);
    }
}

#[derive(Clone)]
struct RunState {
    cfa_register: u8,
    cfa_offset: i64,
    register_offsets: SmallVec<[(u8, i64); 8]>,
}

impl RunState {
    fn set_register_offset(&mut self, register: u8, offset: i64) {
        if let Some(entry) = self.register_offsets.iter_mut().find(|(r, _)| *r == register) {
            entry.1 = offset;
        } else {
            self.register_offsets.push((register, offset));
        }
    }

    fn restore_register(&mut self, register: u8) {
        self.register_offsets.retain(|(r, _)| *r != register);
    }
}

/// Runs a CIE's initial instructions, then an FDE's instructions, against
/// shared interpreter state, per the DWARF requirement that an FDE program
/// continues where its CIE's left off rather than starting fresh.
///
/// Only the opcode subset avr-gcc is known to emit is implemented; the
/// floating point, vector and architecture-specific register opcodes that
/// a general-purpose CFI interpreter would need for other targets have no
/// AVR equivalent and are treated as unrecognized.
pub fn run(cie: &Cie, eh_frame: &[u8], fde_instructions: (usize, usize)) -> Result<UnwindRule> {
    let mut state = RunState {
        cfa_register: 32, // SP, until a DW_CFA_def_cfa* opcode says otherwise.
        cfa_offset: 0,
        register_offsets: SmallVec::new(),
    };
    let mut remembered: Vec<RunState> = Vec::new();

    let (ci_start, ci_end) = cie.initial_instructions;
    run_program(&mut state, &mut remembered, eh_frame, ci_start, ci_end, cie)?;

    let (fi_start, fi_end) = fde_instructions;
    run_program(&mut state, &mut remembered, eh_frame, fi_start, fi_end, cie)?;

    Ok(UnwindRule {
        cfa_register: state.cfa_register,
        cfa_offset: state.cfa_offset,
        register_offsets: state.register_offsets,
    })
}

fn run_program(
    state: &mut RunState,
    remembered: &mut Vec<RunState>,
    eh_frame: &[u8],
    start: usize,
    end: usize,
    cie: &Cie,
) -> Result<()> {
    let mut reader = Reader::with_base(&eh_frame[start..end], start);

    while !reader.is_empty() {
        let opcode_offset = reader.offset();
        let opcode = reader.read_u8()?;
        let high_bits = opcode & 0xc0;
        let low_bits = opcode & 0x3f;

        if high_bits == DW_CFA_ADVANCE_LOC {
            // Only the CFA/register state matters for FAE, not the
            // program-counter range an opcode takes effect at, so advances
            // are consumed for their byte width and otherwise ignored.
            let _ = low_bits;
            continue;
        }
        if high_bits == DW_CFA_OFFSET {
            let n = reader.read_uleb128()?;
            let offset = n as i64 * cie.data_alignment_factor;
            state.set_register_offset(low_bits, offset);
            continue;
        }
        if high_bits == DW_CFA_RESTORE {
            state.restore_register(low_bits);
            continue;
        }

        match opcode {
            DW_CFA_NOP => {}
            DW_CFA_SET_LOC => {
                let _ = crate::pointer::decode_pointer(
                    &mut reader,
                    cie.fde_pointer_encoding,
                    crate::pointer::PointerBases::default(),
                )?;
            }
            DW_CFA_ADVANCE_LOC1 => {
                reader.read_u8()?;
            }
            DW_CFA_ADVANCE_LOC2 => {
                reader.read_u16()?;
            }
            DW_CFA_ADVANCE_LOC4 => {
                reader.read_u32()?;
            }
            DW_CFA_OFFSET_EXTENDED => {
                let reg = reader.read_uleb128()? as u8;
                let n = reader.read_uleb128()?;
                state.set_register_offset(reg, n as i64 * cie.data_alignment_factor);
            }
            DW_CFA_RESTORE_EXTENDED => {
                let reg = reader.read_uleb128()? as u8;
                state.restore_register(reg);
            }
            DW_CFA_UNDEFINED | DW_CFA_SAME_VALUE => {
                let reg = reader.read_uleb128()? as u8;
                state.restore_register(reg);
            }
            DW_CFA_REGISTER => {
                reader.read_uleb128()?;
                reader.read_uleb128()?;
            }
            DW_CFA_REMEMBER_STATE => {
                remembered.push(state.clone());
            }
            DW_CFA_RESTORE_STATE => {
                *state = remembered.pop().ok_or(FaeError::InvariantViolated(
                    "DW_CFA_restore_state with no matching DW_CFA_remember_state",
                ))?;
            }
            DW_CFA_DEF_CFA => {
                state.cfa_register = reader.read_uleb128()? as u8;
                state.cfa_offset = reader.read_uleb128()? as i64;
            }
            DW_CFA_DEF_CFA_REGISTER => {
                state.cfa_register = reader.read_uleb128()? as u8;
            }
            DW_CFA_DEF_CFA_OFFSET => {
                state.cfa_offset = reader.read_uleb128()? as i64 * cie.data_alignment_factor;
            }
            DW_CFA_GNU_WINDOW_SAVE => {
                // Not observed in practice on AVR (no register-window
                // architecture); recognized only so a bitstream containing
                // it fails with a clear "unknown instruction" rather than
                // silently misparsing the following bytes as an operand.
                return Err(FaeError::UnknownCfiInstruction {
                    opcode,
                    offset: opcode_offset,
                });
            }
            _ => {
                return Err(FaeError::UnknownCfiInstruction {
                    opcode,
                    offset: opcode_offset,
                });
            }
        }
    }

    Ok(())
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
    fn def_cfa_offset_then_two_register_offsets() {
        let cie = test_cie();
        // def_cfa_offset 4; offset r29,1; offset r28,2
        // data_alignment_factor is -1, so def_cfa_offset's ULEB128 operand
        // is scaled to cfa_offset=-4, matching spec.md Scenario B.
        let eh_frame: Vec<u8> = vec![
            DW_CFA_DEF_CFA_OFFSET,
            0x04,
            DW_CFA_OFFSET | 29,
            0x01,
            DW_CFA_OFFSET | 28,
            0x02,
        ];

        let rule = run(&cie, &eh_frame, (0, eh_frame.len())).unwrap();
        assert_eq!(rule.cfa_offset, -4);
        assert!(rule.register_offsets.contains(&(29, -1)));
        assert!(rule.register_offsets.contains(&(28, -2)));
    }

    #[test]
    fn unwind_rule_equality_ignores_insertion_order() {
        let a = UnwindRule {
            cfa_register: 32,
            cfa_offset: -8,
            register_offsets: SmallVec::from_slice(&[(16, -6), (17, -2)]),
        };
        let b = UnwindRule {
            cfa_register: 32,
            cfa_offset: -8,
            register_offsets: SmallVec::from_slice(&[(17, -2), (16, -6)]),
        };
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let cie = test_cie();
        let eh_frame = [0x07u8]; // DW_CFA_undefined needs an operand we omit
        let result = run(&cie, &eh_frame, (0, 1));
        assert!(result.is_err());
    }
}
