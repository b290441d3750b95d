//! Compiles an [`UnwindRule`] into a `pop`/`skip` byte program, deduplicating
//! identical programs across functions.

use crate::avr;
use crate::dwarf::instruction::UnwindRule;
use crate::error::{FaeError, Result};
use crate::fae::opcode::{Opcode, MAX_SKIP};
use crate::fae::NO_INSTRUCTIONS;
use std::collections::HashMap;

/// Where a rule's program lives in the (shared, deduplicated)
/// `.fae_entries` byte stream, or [`NO_INSTRUCTIONS`] if the rule needs no
/// restoration at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedProgram {
    pub offset: u32,
    pub length: u32,
}

/// Accumulates the deduplicated `.fae_entries` byte stream across however
/// many frames get encoded through it. One encoder is used per translated
/// object; it owns the dedup map outright rather than reaching for process
/// state, so nothing needs resetting between objects.
#[derive(Default)]
pub struct FaeEncoder {
    return_address_size: u8,
    entries: Vec<u8>,
    dedup: HashMap<RuleKey, EncodedProgram>,
}

/// `UnwindRule` already implements order-independent `Hash`/`Eq` (see
/// `dwarf::instruction`); this wrapper exists only so the encoder's map key
/// type is spelled out once rather than repeating the bound everywhere.
type RuleKey = UnwindRule;

impl FaeEncoder {
    /// `return_address_size` is the byte width of the return address the
    /// call instruction pushes — 2 on most AVR parts, 3 on those with more
    /// than 128KiB of flash. Hard-coded to 2 upstream; exposed as a
    /// parameter here so larger parts can be configured without a fork.
    pub fn new(return_address_size: u8) -> Self {
        FaeEncoder {
            return_address_size,
            entries: Vec::new(),
            dedup: HashMap::new(),
        }
    }

    /// Encodes (or reuses a prior encoding of) `rule`, returning where its
    /// program lives in the entries stream.
    pub fn encode(&mut self, rule: &UnwindRule) -> Result<EncodedProgram> {
        if let Some(existing) = self.dedup.get(rule) {
            return Ok(*existing);
        }

        let bytes = build_program(rule, self.return_address_size)?;
        let program = if bytes.is_empty() {
            EncodedProgram {
                offset: NO_INSTRUCTIONS,
                length: 0,
            }
        } else {
            let offset = self.entries.len() as u32;
            self.entries.extend_from_slice(&bytes);
            EncodedProgram {
                offset,
                length: bytes.len() as u32,
            }
        };

        self.dedup.insert(rule.clone(), program);
        Ok(program)
    }

    /// Consumes the encoder, yielding the deduplicated `.fae_entries`
    /// contents built up across every call to [`encode`](Self::encode).
    pub fn into_entries(self) -> Vec<u8> {
        self.entries
    }

    pub fn entries_len(&self) -> usize {
        self.entries.len()
    }
}

/// Builds the byte program for one rule. A leaf function with no saved
/// registers (`cfa_offset == 0`, or an empty register set once the
/// return-address pseudo-register is filtered out) needs no program at all.
///
/// The walk proceeds from the register closest to the CFA down to the
/// bottom of the frame, emitting a `pop` at each register's position and a
/// `skip` for every gap between them (and from the initial stack pointer to
/// the first register, and from the last register to the bottom of the
/// frame). This guarantees every saved register gets exactly one `pop`
/// opcode, which the upstream C++ implementation's single-pass "walk from
/// the top, bail out once the counter hits zero" loop does not: a frame
/// whose deepest register sits above the bottom of the frame can exhaust
/// the counter before the shallowest register is ever visited, silently
/// dropping it from the program. See DESIGN.md.
fn build_program(rule: &UnwindRule, return_address_size: u8) -> Result<Vec<u8>> {
    if rule.cfa_offset == 0 {
        return Ok(Vec::new());
    }

    let mut regs: Vec<(i64, u8)> = Vec::new();
    for &(reg, offset) in rule.register_offsets.iter() {
        if reg >= 32 {
            // The return-address pseudo-register (36) and SP/CFA
            // bookkeeping are not pop targets.
            continue;
        }
        if !avr::is_callee_saved(reg) {
            return Err(FaeError::UnsupportedRegister { register: reg });
        }
        regs.push((-offset, reg));
    }

    if regs.is_empty() {
        return Ok(Vec::new());
    }

    // Descending stack position: the register closest to the CFA (hence
    // encountered first while walking down from `sp`) comes first.
    regs.sort_unstable_by(|a, b| b.0.cmp(&a.0));

    let mut sp = -rule.cfa_offset - return_address_size as i64;
    if sp < 0 {
        return Err(FaeError::RangeOverflow {
            context: "stack frame size computed as negative while encoding FAE program",
        });
    }

    let mut out = Vec::new();
    for (stack_pos, reg) in regs {
        if stack_pos < 0 || stack_pos > sp {
            return Err(FaeError::RangeOverflow {
                context: "register offset falls outside the function's stack frame",
            });
        }
        emit_skip(&mut out, sp - stack_pos);
        sp = stack_pos;
        out.push(Opcode::pop_for_dwarf_register(reg)?.to_byte());
        sp -= 1;
    }
    emit_skip(&mut out, sp);

    out.push(Opcode::Skip(0).to_byte());
    if out.len() % 2 != 0 {
        out.push(Opcode::Skip(0).to_byte());
    }

    Ok(out)
}

/// Emits `n` bytes of stack as a run of `skip` opcodes, chunked at
/// [`MAX_SKIP`] since a single opcode's operand is only 7 bits wide.
fn emit_skip(out: &mut Vec<u8>, mut n: i64) {
    while n > 0 {
        let chunk = n.min(MAX_SKIP as i64);
        out.push(Opcode::Skip(chunk as u8).to_byte());
        n -= chunk;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::SmallVec;

    fn rule(cfa_offset: i64, offsets: &[(u8, i64)]) -> UnwindRule {
        UnwindRule {
            cfa_register: 32,
            cfa_offset,
            register_offsets: SmallVec::from_slice(offsets),
        }
    }

    #[test]
    fn leaf_function_needs_no_instructions() {
        let mut enc = FaeEncoder::new(2);
        let program = enc.encode(&rule(0, &[])).unwrap();
        assert_eq!(program.offset, NO_INSTRUCTIONS);
        assert_eq!(program.length, 0);
    }

    #[test]
    fn two_adjacent_registers_pop_back_to_back() {
        // cfa_offset=-4, ret_size=2 -> sp=2; r28 at stack_pos 2, r29 at 1.
        // r28/r29 are dense indices 16/17 (avr::dense_index), so pop bytes
        // are 0x80|16=0x90 and 0x80|17=0x91; the two-byte skip(0) terminator
        // pads the odd post-pop length of 2 up to an even 4.
        let mut enc = FaeEncoder::new(2);
        let program = enc
            .encode(&rule(-4, &[(28, -2), (29, -1), (36, 0)]))
            .unwrap();
        assert_ne!(program.offset, NO_INSTRUCTIONS);
        let entries = enc.into_entries();
        let bytes = &entries[program.offset as usize..(program.offset + program.length) as usize];
        assert_eq!(bytes, &[0x90, 0x91, 0x00, 0x00]);
    }

    #[test]
    fn gap_between_stack_pointer_and_first_register_is_skipped() {
        // cfa_offset=-8, ret_size=2 -> sp=6; single register at stack_pos 6.
        let mut enc = FaeEncoder::new(2);
        let program = enc.encode(&rule(-8, &[(16, -6)])).unwrap();
        let entries = enc.into_entries();
        let bytes = &entries[program.offset as usize..(program.offset + program.length) as usize];
        // pop r16 (dense 14), then skip the remaining 5 bytes down to 0,
        // then the skip(0) terminator padded to even length.
        assert_eq!(bytes, &[0x8e, 0x05, 0x00, 0x00]);
    }

    #[test]
    fn identical_rules_deduplicate_to_the_same_program() {
        let mut enc = FaeEncoder::new(2);
        let a = enc.encode(&rule(-4, &[(28, -2), (29, -1)])).unwrap();
        let b = enc.encode(&rule(-4, &[(29, -1), (28, -2)])).unwrap();
        assert_eq!(a, b);
        assert_eq!(enc.entries_len(), a.length as usize);
    }

    #[test]
    fn large_gap_is_chunked_at_max_skip() {
        // cfa_offset=-260, ret_size=2 -> sp=258; one register at stack_pos
        // 1, leaving a 257-byte gap that must split across two max-size
        // skips plus a remainder.
        let mut enc = FaeEncoder::new(2);
        let program = enc.encode(&rule(-260, &[(16, -1)])).unwrap();
        let entries = enc.into_entries();
        let bytes = &entries[program.offset as usize..(program.offset + program.length) as usize];
        assert_eq!(bytes, &[0x7f, 0x7f, 0x03, 0x8e, 0x00, 0x00]);
    }

    #[test]
    fn unsupported_register_is_rejected() {
        let mut enc = FaeEncoder::new(2);
        let err = enc.encode(&rule(-4, &[(1, -1)])).unwrap_err();
        assert!(matches!(err, FaeError::UnsupportedRegister { register: 1 }));
    }
}
