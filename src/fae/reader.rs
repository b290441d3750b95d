//! Inverse of [`crate::fae::object`]: parses an already-emitted `.fae_info`
//! section back into structured records, and merges several
//! translation-units' worth of them into one global, PC-sorted `.fae_table`.
//!
//! The reader half is grounded directly on how the emitter lays bytes out —
//! there is no ambiguity to resolve here, only a mirror of `fae::object`'s
//! writes. The merger (the part of this module the linker's custom step
//! invokes) has no working reference implementation to follow; its bones are
//! the prose description of the combined table plus the testable ordering
//! invariant that merged ranges never overlap.

use crate::error::{FaeError, Result};
use crate::fae::{HEADER_SIZE, INFO_ENTRY_SIZE, MAGIC, NO_INSTRUCTIONS, TABLE_ENTRY_SIZE};
use crate::reader::Reader;
use crate::writer::Writer;

/// One parsed record out of a `.fae_info` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaeInfoEntry {
    pub offset: u32,
    pub length: u32,
    pub begin: u32,
    pub range: u32,
    pub lsda_offset: u32,
    pub cfa_reg: u32,
}

impl FaeInfoEntry {
    pub fn has_instructions(&self) -> bool {
        self.offset != NO_INSTRUCTIONS
    }
}

/// Parses a `.fae_info` section's bytes (header + entry array), checking the
/// magic and the length-is-a-multiple-of-24 invariant before trusting the
/// entry count.
pub fn read_info(section: &[u8]) -> Result<Vec<FaeInfoEntry>> {
    let mut reader = Reader::new(section);
    let magic = reader.read_bytes(MAGIC.len())?;
    if magic != MAGIC.as_slice() {
        return Err(FaeError::InvalidAugmentation {
            offset: 0,
            augmentation: "fae_info section does not start with the expected magic".into(),
        });
    }

    let length = reader.read_u16()? as usize;
    if length % INFO_ENTRY_SIZE != 0 {
        return Err(FaeError::RangeOverflow {
            context: "fae_info length is not a multiple of the info-entry size",
        });
    }
    let count = length / INFO_ENTRY_SIZE;

    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(FaeInfoEntry {
            offset: reader.read_u32()?,
            length: reader.read_u32()?,
            begin: reader.read_u32()?,
            range: reader.read_u32()?,
            lsda_offset: reader.read_u32()?,
            cfa_reg: reader.read_u32()?,
        });
    }
    Ok(entries)
}

/// Returns the bytes of one entry's unwind program out of `.fae_entries`, or
/// `None` for an entry that needs no restoration.
pub fn get_instructions<'a>(entries_section: &'a [u8], entry: &FaeInfoEntry) -> Result<Option<&'a [u8]>> {
    if !entry.has_instructions() {
        return Ok(None);
    }
    let start = entry.offset as usize;
    let end = start
        .checked_add(entry.length as usize)
        .ok_or(FaeError::RangeOverflow {
            context: "fae_info entry offset+length overflowed",
        })?;
    entries_section
        .get(start..end)
        .map(Some)
        .ok_or(FaeError::OutOfRange {
            offset: start,
            requested: entry.length as usize,
            available: entries_section.len().saturating_sub(start),
        })
}

/// One object's contribution to the merge: its `.fae_info` entries, its
/// `.fae_entries` bytes, and a resolver from a raw `begin`/`lsda` field
/// (already fixed up by the object-level linker pass to a real PC) into the
/// merged table's 16-bit representation.
pub struct MergeInput<'a> {
    pub info: &'a [FaeInfoEntry],
    pub entries: &'a [u8],
}

/// One entry of the merged, downstream `.fae_table`: everything needed at
/// runtime to find and run the right unwind program for a given PC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableEntry {
    pub pc_begin: u16,
    pub pc_end: u16,
    pub data: u16,
    pub frame_reg: u8,
    pub length: u8,
    pub lsda: u16,
}

/// Merges N translation units' `.fae_info`/`.fae_entries` pairs into one
/// PC-sorted `.fae_table`. `.fae_entries` bytes are concatenated in input
/// order (each object's programs get a cumulative offset added on top of
/// its own local `offset`); entries with no program are left at
/// `data == 0xFFFF`. A PC range wider than 16 bits, or one that overlaps its
/// predecessor once sorted, is an error: the AVR program counter this table
/// indexes is itself only 16 bits wide.
pub fn merge(inputs: &[MergeInput]) -> Result<(Vec<u8>, Vec<TableEntry>)> {
    let mut merged_entries_bytes = Vec::new();
    let mut cumulative_offsets = Vec::with_capacity(inputs.len());
    for input in inputs {
        cumulative_offsets.push(merged_entries_bytes.len() as u32);
        merged_entries_bytes.extend_from_slice(input.entries);
    }

    let mut table = Vec::new();
    for (input, base_offset) in inputs.iter().zip(cumulative_offsets.iter()) {
        for entry in input.info {
            let pc_begin = u16::try_from(entry.begin).map_err(|_| FaeError::RangeOverflow {
                context: "merged table pc_begin exceeds 16 bits",
            })?;
            let pc_end_wide = entry.begin as u64 + entry.range as u64;
            let pc_end = u16::try_from(pc_end_wide).map_err(|_| FaeError::RangeOverflow {
                context: "merged table pc_end exceeds 16 bits",
            })?;

            let data = if entry.has_instructions() {
                u16::try_from(entry.offset + base_offset).map_err(|_| FaeError::RangeOverflow {
                    context: "merged table data offset exceeds 16 bits",
                })?
            } else {
                0xffff
            };

            let lsda = if entry.lsda_offset == NO_INSTRUCTIONS {
                0xffff
            } else {
                u16::try_from(entry.lsda_offset).map_err(|_| FaeError::RangeOverflow {
                    context: "merged table lsda offset exceeds 16 bits",
                })?
            };

            table.push(TableEntry {
                pc_begin,
                pc_end,
                data,
                frame_reg: entry.cfa_reg as u8,
                length: entry.length as u8,
                lsda,
            });
        }
    }

    table.sort_unstable_by_key(|e| e.pc_begin);

    for window in table.windows(2) {
        if window[0].pc_end > window[1].pc_begin {
            return Err(FaeError::InvariantViolated(
                "merged fae table contains overlapping PC ranges",
            ));
        }
    }

    Ok((merged_entries_bytes, table))
}

/// Serializes a merged table into the on-disk `.fae_table` layout: the same
/// 10-byte `{magic, length}` header the per-object `.fae_info` sections use,
/// followed by one 10-byte record per entry.
pub fn write_table(table: &[TableEntry]) -> Vec<u8> {
    let mut w = Writer::with_capacity(HEADER_SIZE + table.len() * TABLE_ENTRY_SIZE);
    w.write_bytes(&MAGIC);
    w.write_u16_le((table.len() * TABLE_ENTRY_SIZE) as u16);
    for e in table {
        w.write_u16_le(e.pc_begin);
        w.write_u16_le(e.pc_end);
        w.write_u16_le(e.data);
        w.write_u8(e.frame_reg);
        w.write_u8(e.length);
        w.write_u16_le(e.lsda);
    }
    w.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info_bytes(entries: &[FaeInfoEntry]) -> Vec<u8> {
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

    #[test]
    fn reads_back_what_was_written() {
        let entries = vec![FaeInfoEntry {
            offset: 0,
            length: 3,
            begin: 0x100,
            range: 0x10,
            lsda_offset: NO_INSTRUCTIONS,
            cfa_reg: 32,
        }];
        let bytes = sample_info_bytes(&entries);
        let parsed = read_info(&bytes).unwrap();
        assert_eq!(parsed, entries);
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = [0u8; 10];
        let err = read_info(&bytes).unwrap_err();
        assert!(matches!(err, FaeError::InvalidAugmentation { .. }));
    }

    #[test]
    fn get_instructions_returns_none_for_sentinel_offset() {
        let entry = FaeInfoEntry {
            offset: NO_INSTRUCTIONS,
            length: 0,
            begin: 0,
            range: 0,
            lsda_offset: NO_INSTRUCTIONS,
            cfa_reg: 32,
        };
        assert!(get_instructions(&[], &entry).unwrap().is_none());
    }

    #[test]
    fn merges_two_objects_with_cumulative_offsets() {
        let obj_a_entries = vec![0x8e, 0x8f, 0x00];
        let obj_a_info = vec![FaeInfoEntry {
            offset: 0,
            length: 3,
            begin: 0x0000,
            range: 0x10,
            lsda_offset: NO_INSTRUCTIONS,
            cfa_reg: 28,
        }];

        let obj_b_entries = vec![0x00];
        let obj_b_info = vec![FaeInfoEntry {
            offset: 0,
            length: 1,
            begin: 0x0020,
            range: 0x10,
            lsda_offset: NO_INSTRUCTIONS,
            cfa_reg: 32,
        }];

        let (merged_entries, table) = merge(&[
            MergeInput {
                info: &obj_a_info,
                entries: &obj_a_entries,
            },
            MergeInput {
                info: &obj_b_info,
                entries: &obj_b_entries,
            },
        ])
        .unwrap();

        assert_eq!(merged_entries, vec![0x8e, 0x8f, 0x00, 0x00]);
        assert_eq!(table.len(), 2);
        assert_eq!(table[0].pc_begin, 0x0000);
        assert_eq!(table[0].data, 0);
        assert_eq!(table[1].pc_begin, 0x0020);
        // second object's program lives after the first object's 3 bytes.
        assert_eq!(table[1].data, 3);
    }

    #[test]
    fn rejects_overlapping_ranges_after_sort() {
        let info_a = vec![FaeInfoEntry {
            offset: NO_INSTRUCTIONS,
            length: 0,
            begin: 0,
            range: 0x20,
            lsda_offset: NO_INSTRUCTIONS,
            cfa_reg: 32,
        }];
        let info_b = vec![FaeInfoEntry {
            offset: NO_INSTRUCTIONS,
            length: 0,
            begin: 0x10,
            range: 0x10,
            lsda_offset: NO_INSTRUCTIONS,
            cfa_reg: 32,
        }];

        let result = merge(&[
            MergeInput {
                info: &info_a,
                entries: &[],
            },
            MergeInput {
                info: &info_b,
                entries: &[],
            },
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn write_table_round_trips_through_read_info_layout() {
        let table = vec![TableEntry {
            pc_begin: 0x10,
            pc_end: 0x20,
            data: 0,
            frame_reg: 28,
            length: 3,
            lsda: 0xffff,
        }];
        let bytes = write_table(&table);
        assert_eq!(&bytes[0..8], &MAGIC);
        assert_eq!(u16::from_le_bytes([bytes[8], bytes[9]]), TABLE_ENTRY_SIZE as u16);
        assert_eq!(bytes.len(), HEADER_SIZE + TABLE_ENTRY_SIZE);
    }
}
