//! Basic-block discovery over the raw source instruction stream
//!
//! A single decoding scan collects every split point: branch and switch
//! targets, the offset after any block-ending instruction, and every
//! try/handler/filter boundary declared by the exception clauses. Blocks
//! are the maximal straight-line runs between consecutive split points.
//! Because split points come from whole-instruction decoding, a block
//! boundary can never land inside a multi-byte operand.

use std::collections::BTreeSet;

use crate::il::{IlOp, IlReader, Operand};
use crate::metadata::IlExceptionClause;

use super::EmitError;

/// One basic block of the source stream.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    /// IL offset of the first instruction.
    pub il_start: u32,
    /// IL offset one past the last instruction.
    pub il_end: u32,
    /// Final IR offset (instruction index) once the block is emitted.
    pub ir_offset: u32,
    pub visited: bool,
    pub in_worklist: bool,
}

/// Sorted block table with O(log n) offset lookup.
#[derive(Debug)]
pub struct BlockMap {
    blocks: Vec<BasicBlock>,
}

impl BlockMap {
    /// Scan the stream once and partition it into blocks.
    pub fn build(code: &[u8], clauses: &[IlExceptionClause]) -> Result<Self, EmitError> {
        let len = code.len() as u32;
        let mut splits: BTreeSet<u32> = BTreeSet::new();
        splits.insert(0);

        for c in clauses {
            splits.insert(c.try_start);
            splits.insert(c.try_end());
            splits.insert(c.handler_start);
            splits.insert(c.handler_end());
            if let Some(fs) = c.filter_start {
                splits.insert(fs);
            }
        }

        let mut reader = IlReader::new(code);
        while !reader.at_end() {
            let instr = reader.fetch()?;
            if let Some(target) = instr.branch_target() {
                if target >= len {
                    return Err(EmitError::BranchTargetOutOfRange {
                        offset: instr.offset,
                        target,
                    });
                }
                splits.insert(target);
            }
            if let (IlOp::Switch, Operand::Targets(targets)) = (instr.op, &instr.operand) {
                for &t in targets {
                    if t >= len {
                        return Err(EmitError::BranchTargetOutOfRange {
                            offset: instr.offset,
                            target: t,
                        });
                    }
                    splits.insert(t);
                }
            }
            if instr.op.ends_block() && instr.next_offset() < len {
                splits.insert(instr.next_offset());
            }
        }

        let starts: Vec<u32> = splits.into_iter().filter(|&s| s < len).collect();
        let mut blocks = Vec::with_capacity(starts.len());
        for (i, &start) in starts.iter().enumerate() {
            let end = starts.get(i + 1).copied().unwrap_or(len);
            blocks.push(BasicBlock {
                il_start: start,
                il_end: end,
                ir_offset: 0,
                visited: false,
                in_worklist: false,
            });
        }
        Ok(Self { blocks })
    }

    /// Index of the block starting exactly at `offset`.
    pub fn index_at(&self, offset: u32) -> Option<usize> {
        self.blocks
            .binary_search_by_key(&offset, |b| b.il_start)
            .ok()
    }

    /// Index of the block containing `offset`.
    pub fn index_containing(&self, offset: u32) -> Option<usize> {
        match self.blocks.binary_search_by_key(&offset, |b| b.il_start) {
            Ok(i) => Some(i),
            Err(0) => None,
            Err(i) => {
                let b = &self.blocks[i - 1];
                (offset < b.il_end).then_some(i - 1)
            }
        }
    }

    #[inline]
    pub fn get(&self, index: usize) -> &BasicBlock {
        &self.blocks[index]
    }

    #[inline]
    pub fn get_mut(&mut self, index: usize) -> &mut BasicBlock {
        &mut self.blocks[index]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ClauseKind;

    #[test]
    fn test_straight_line_is_one_block() {
        // ldc.i4.1; ldc.i4.2; add; ret
        let code = [0x17, 0x18, 0x58, 0x2A];
        let map = BlockMap::build(&code, &[]).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(0).il_start, 0);
        assert_eq!(map.get(0).il_end, 4);
    }

    #[test]
    fn test_branch_splits_at_target_and_after() {
        // 0: br.s +1 ; 2: nop ; 3: ret
        let code = [0x2B, 1, 0x00, 0x2A];
        let map = BlockMap::build(&code, &[]).unwrap();
        // blocks: [0,2) [2,3) [3,4) -- target 3 and post-branch 2
        assert_eq!(map.len(), 3);
        assert_eq!(map.index_at(0), Some(0));
        assert_eq!(map.index_at(2), Some(1));
        assert_eq!(map.index_at(3), Some(2));
    }

    #[test]
    fn test_conditional_branch_fallthrough_split() {
        // 0: ldc.i4.0 ; 1: brtrue.s +1 ; 3: nop ; 4: ret
        let code = [0x16, 0x2D, 1, 0x00, 0x2A];
        let map = BlockMap::build(&code, &[]).unwrap();
        assert_eq!(map.index_at(0), Some(0));
        assert!(map.index_at(3).is_some());
        assert!(map.index_at(4).is_some());
    }

    #[test]
    fn test_switch_targets_split() {
        // switch [2] -> 14, 16 ; then nops and ret
        let mut code = vec![0x45];
        code.extend_from_slice(&2u32.to_le_bytes());
        code.extend_from_slice(&1i32.to_le_bytes());
        code.extend_from_slice(&3i32.to_le_bytes());
        code.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x2A]); // 13..=17
        let map = BlockMap::build(&code, &[]).unwrap();
        assert!(map.index_at(13).is_some());
        assert!(map.index_at(14).is_some());
        assert!(map.index_at(16).is_some());
    }

    #[test]
    fn test_clause_boundaries_split() {
        // 8 nops then ret; clause try [2,4) handler [4,6)
        let code = [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x2A];
        let clauses = [IlExceptionClause {
            kind: ClauseKind::Catch,
            try_start: 2,
            try_len: 2,
            handler_start: 4,
            handler_len: 2,
            filter_start: None,
            catch_type: None,
        }];
        let map = BlockMap::build(&code, &clauses).unwrap();
        assert!(map.index_at(2).is_some());
        assert!(map.index_at(4).is_some());
        assert!(map.index_at(6).is_some());
    }

    #[test]
    fn test_target_out_of_range_is_fatal() {
        // br.s +100 beyond the stream
        let code = [0x2B, 100, 0x2A];
        let err = BlockMap::build(&code, &[]).unwrap_err();
        assert!(matches!(err, EmitError::BranchTargetOutOfRange { .. }));
    }

    #[test]
    fn test_containing_lookup() {
        // 0: br.s +1 ; 2: nop ; 3: ret
        let code = [0x2B, 1, 0x00, 0x2A];
        let map = BlockMap::build(&code, &[]).unwrap();
        assert_eq!(map.index_containing(1), Some(0));
        assert_eq!(map.index_containing(2), Some(1));
        assert_eq!(map.index_containing(3), Some(2));
    }
}
