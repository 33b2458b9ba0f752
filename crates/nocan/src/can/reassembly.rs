// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Segmented-frame reassembly.
//!
//! Each node owns one reassembly slot. A message opens on a frame carrying
//! the FIRST marker, grows on markerless frames, and closes on a frame
//! carrying LAST. Violations never poison the slot for longer than the
//! offending exchange: the slot is cleared so the node can retry.

use super::frame::CanFrame;
use super::message::{
    Message, NodeId, MAX_MESSAGE_SIZE, MAX_NODE_COUNT, NOCANID_MASK_FIRST, NOCANID_MASK_LAST,
};
use thiserror::Error;

/// Frame ingest error; the caller logs it and drops the frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReassemblyError {
    /// Only extended frames carry NoCAN ids.
    #[error("expected extended CAN frame")]
    NotExtended,
    /// DLC above the CAN maximum of 8.
    #[error("frame DLC is greater than 8 (got {0})")]
    OversizeDlc(u8),
    /// FIRST marker while a partial message is already open.
    #[error("node {0}: frame with inconsistent first bit indicator")]
    UnexpectedFirst(NodeId),
    /// Continuation frame with no open partial message.
    #[error("node {0}: continuation frame with missing first bit indicator")]
    MissingFirst(NodeId),
    /// Cumulative payload would exceed the 64-byte message cap.
    #[error("node {0}: reassembled message would exceed {max} bytes", max = MAX_MESSAGE_SIZE)]
    Overflow(NodeId),
}

/// Per-node reassembly state for the whole bus.
pub struct Reassembler {
    pending: [Option<Message>; MAX_NODE_COUNT],
}

/// Result of ingesting one frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Ingest {
    /// Frame absorbed, message still open.
    Incomplete,
    /// Frame carried the LAST marker; the message is complete.
    Complete(Message),
}

impl Reassembler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: std::array::from_fn(|_| None),
        }
    }

    /// Ingest one frame, possibly completing a message for the frame's node.
    pub fn ingest(&mut self, frame: &CanFrame) -> Result<Ingest, ReassemblyError> {
        if !frame.is_extended() {
            return Err(ReassemblyError::NotExtended);
        }
        if frame.dlc > 8 {
            return Err(ReassemblyError::OversizeDlc(frame.dlc));
        }

        let node = ((frame.can_id >> 21) & 0x7F) as usize;
        let slot = &mut self.pending[node];

        if frame.can_id & NOCANID_MASK_FIRST != 0 {
            if slot.is_some() {
                *slot = None;
                return Err(ReassemblyError::UnexpectedFirst(node as NodeId));
            }
            *slot = Some(Message::new(frame.can_id, frame.payload()));
        } else {
            match slot.as_mut() {
                None => return Err(ReassemblyError::MissingFirst(node as NodeId)),
                Some(partial) => {
                    if !partial.append(frame.payload()) {
                        *slot = None;
                        return Err(ReassemblyError::Overflow(node as NodeId));
                    }
                }
            }
        }

        if frame.can_id & NOCANID_MASK_LAST != 0 {
            // The slot is necessarily occupied here.
            let msg = slot.take().expect("open partial message");
            return Ok(Ingest::Complete(msg));
        }
        Ok(Ingest::Incomplete)
    }

    /// Number of nodes with an open partial message.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.pending.iter().filter(|slot| slot.is_some()).count()
    }

    /// Drop any partial message held for `node`.
    pub fn clear(&mut self, node: NodeId) {
        self.pending[usize::from(node) % MAX_NODE_COUNT] = None;
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::frame::CANID_MASK_EXTENDED;
    use crate::can::message::NOCANID_MASK_SYSTEM;

    fn frame(node: NodeId, first: bool, last: bool, data: &[u8]) -> CanFrame {
        let mut can_id = CANID_MASK_EXTENDED | (u32::from(node) << 21);
        if first {
            can_id |= NOCANID_MASK_FIRST;
        }
        if last {
            can_id |= NOCANID_MASK_LAST;
        }
        CanFrame::new(can_id, data).expect("frame")
    }

    #[test]
    fn test_single_frame_message() {
        let mut reasm = Reassembler::new();
        let result = reasm.ingest(&frame(4, true, true, b"ping")).expect("ingest");
        match result {
            Ingest::Complete(msg) => {
                assert_eq!(msg.node_id(), 4);
                assert_eq!(msg.bytes(), b"ping");
            }
            Ingest::Incomplete => panic!("expected complete message"),
        }
        assert_eq!(reasm.open_count(), 0);
    }

    #[test]
    fn test_multi_frame_message() {
        let mut reasm = Reassembler::new();
        assert_eq!(
            reasm.ingest(&frame(9, true, false, &[0, 1, 2, 3, 4, 5, 6, 7])),
            Ok(Ingest::Incomplete)
        );
        assert_eq!(
            reasm.ingest(&frame(9, false, false, &[8, 9, 10, 11, 12, 13, 14, 15])),
            Ok(Ingest::Incomplete)
        );
        let result = reasm
            .ingest(&frame(9, false, true, &[16, 17]))
            .expect("ingest");
        match result {
            Ingest::Complete(msg) => {
                let expected: Vec<u8> = (0..18).collect();
                assert_eq!(msg.bytes(), &expected[..]);
            }
            Ingest::Incomplete => panic!("expected complete message"),
        }
    }

    #[test]
    fn test_interleaved_nodes() {
        let mut reasm = Reassembler::new();
        reasm.ingest(&frame(1, true, false, b"aaaa")).expect("ingest");
        reasm.ingest(&frame(2, true, false, b"bbbb")).expect("ingest");
        let m2 = reasm.ingest(&frame(2, false, true, b"BB")).expect("ingest");
        let m1 = reasm.ingest(&frame(1, false, true, b"AA")).expect("ingest");
        assert_eq!(m1, Ingest::Complete(Message::new(
            CANID_MASK_EXTENDED | NOCANID_MASK_FIRST | (1 << 21),
            b"aaaaAA",
        )));
        match m2 {
            Ingest::Complete(msg) => assert_eq!(msg.bytes(), b"bbbbBB"),
            Ingest::Incomplete => panic!("expected complete message"),
        }
    }

    #[test]
    fn test_rejects_standard_frame() {
        let mut reasm = Reassembler::new();
        let std_frame = CanFrame::new(1 << 21, b"x").expect("frame");
        assert_eq!(reasm.ingest(&std_frame), Err(ReassemblyError::NotExtended));
    }

    #[test]
    fn test_rejects_oversize_dlc() {
        let mut reasm = Reassembler::new();
        let mut bad = frame(1, true, true, &[]);
        bad.dlc = 9;
        assert_eq!(reasm.ingest(&bad), Err(ReassemblyError::OversizeDlc(9)));
    }

    #[test]
    fn test_duplicate_first_clears_slot() {
        let mut reasm = Reassembler::new();
        reasm.ingest(&frame(3, true, false, b"part")).expect("ingest");
        assert_eq!(
            reasm.ingest(&frame(3, true, false, b"again")),
            Err(ReassemblyError::UnexpectedFirst(3))
        );
        assert_eq!(reasm.open_count(), 0);
    }

    #[test]
    fn test_continuation_without_first() {
        let mut reasm = Reassembler::new();
        assert_eq!(
            reasm.ingest(&frame(3, false, true, b"tail")),
            Err(ReassemblyError::MissingFirst(3))
        );
    }

    #[test]
    fn test_cumulative_overflow_rejected() {
        let mut reasm = Reassembler::new();
        let full = [0u8; 8];
        reasm.ingest(&frame(7, true, false, &full)).expect("ingest");
        for _ in 0..7 {
            reasm.ingest(&frame(7, false, false, &full)).expect("ingest");
        }
        // 64 bytes accumulated; one more byte must overflow and clear the slot.
        assert_eq!(
            reasm.ingest(&frame(7, false, true, &[0xFF])),
            Err(ReassemblyError::Overflow(7))
        );
        assert_eq!(reasm.open_count(), 0);
    }

    #[test]
    fn test_system_bit_preserved() {
        let mut reasm = Reassembler::new();
        let mut can_id = CANID_MASK_EXTENDED
            | NOCANID_MASK_FIRST
            | NOCANID_MASK_LAST
            | NOCANID_MASK_SYSTEM
            | (5 << 21);
        can_id |= 1 << 8; // function 1
        let f = CanFrame::new(can_id, &[1, 2, 3, 4, 5, 6, 7, 8]).expect("frame");
        match reasm.ingest(&f).expect("ingest") {
            Ingest::Complete(msg) => {
                assert!(msg.is_system());
                assert_eq!(msg.sys_function_param().0, 1);
            }
            Ingest::Incomplete => panic!("expected complete message"),
        }
    }
}
