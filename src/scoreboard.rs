//! Virtual register scoreboard for linear-scan allocation.
//!
//! Slots are handed out lowest-first so the callee register file stays dense.
//! Preserved locals pin their slots up front and never return to the free
//! pool. Liveness is reference-count driven, but counted on the side: each
//! `use_node` call ticks the slot's use count toward the node's reference
//! count, and the tick that reaches it releases the slot for the very node
//! that killed the operand. The graph itself is never mutated.

use std::collections::BTreeSet;

use crate::graph::{Graph, NodeId, VirtualRegister};

/// Use-count sentinel for slots that must never be recycled.
const PINNED: u32 = u32::MAX;

pub struct ScoreBoard {
    free: BTreeSet<u32>,
    /// Per-slot use count, compared against the occupying node's reference
    /// count. The vector's length is the high watermark.
    used: Vec<u32>,
}

impl ScoreBoard {
    pub fn new(preserved_locals: &BTreeSet<u32>) -> Self {
        let pinned_end = preserved_locals
            .iter()
            .next_back()
            .map(|&slot| slot + 1)
            .unwrap_or(0);
        let mut used = vec![0; pinned_end as usize];
        let mut free = BTreeSet::new();
        for slot in 0..pinned_end {
            if preserved_locals.contains(&slot) {
                used[slot as usize] = PINNED;
            } else {
                free.insert(slot);
            }
        }
        ScoreBoard { free, used }
    }

    /// Hand out a slot, reusing the lowest freed one before growing.
    pub fn allocate(&mut self) -> VirtualRegister {
        if let Some(&slot) = self.free.iter().next() {
            self.free.remove(&slot);
            self.used[slot as usize] = 0;
            return VirtualRegister(slot);
        }
        let slot = self.used.len() as u32;
        self.used.push(0);
        VirtualRegister(slot)
    }

    /// Record one use of an operand slot; absent operands are ignored.
    pub fn use_child(&mut self, graph: &Graph, child: Option<NodeId>) {
        if let Some(child) = child {
            self.use_node(graph, child);
        }
    }

    pub fn use_node(&mut self, graph: &Graph, id: NodeId) {
        let node = &graph[id];
        let register = node
            .virtual_register
            .expect("operand used before it was allocated a register");
        let count = &mut self.used[register.0 as usize];
        if *count == PINNED {
            return;
        }
        *count += 1;
        assert!(
            *count <= node.ref_count(),
            "{} uses recorded for {} with {} references",
            *count,
            register,
            node.ref_count()
        );
        if *count == node.ref_count() {
            // Last use; the slot is reusable from here on.
            self.free.insert(register.0);
        }
    }

    /// The number of slots the function needs for locals and temporaries.
    pub fn high_watermark(&self) -> u32 {
        self.used.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::opcode::Op;

    #[test]
    fn freed_slots_are_reused_lowest_first() {
        let mut builder = GraphBuilder::new(2);
        let x = builder.get_local(0);
        let y = builder.get_local(1);
        builder.binary(Op::ArithAdd, x, y);
        builder.ret(None);
        let (mut graph, _) = builder.finish();

        let mut board = ScoreBoard::new(&BTreeSet::new());
        let a = board.allocate();
        let b = board.allocate();
        assert_eq!((a.0, b.0), (0, 1));
        graph[x].virtual_register = Some(a);
        graph[y].virtual_register = Some(b);

        board.use_node(&graph, x);
        board.use_node(&graph, y);
        assert_eq!(board.allocate().0, 0);
        assert_eq!(board.allocate().0, 1);
        assert_eq!(board.high_watermark(), 2);
    }

    #[test]
    fn preserved_locals_pin_their_slots() {
        let preserved = BTreeSet::from([0, 2]);
        let mut board = ScoreBoard::new(&preserved);
        // Slot 1 sits in the gap; slots 0 and 2 are never handed out.
        assert_eq!(board.allocate().0, 1);
        assert_eq!(board.allocate().0, 3);
        assert_eq!(board.high_watermark(), 4);
    }

    #[test]
    fn uses_below_the_reference_count_do_not_free() {
        let mut builder = GraphBuilder::new(1);
        let x = builder.get_local(0);
        let u1 = builder.unary(Op::ArithAbs, x);
        let u2 = builder.unary(Op::ArithSqrt, x);
        builder.binary(Op::ArithAdd, u1, u2);
        builder.ret(None);
        let (mut graph, _) = builder.finish();

        let mut board = ScoreBoard::new(&BTreeSet::new());
        let slot = board.allocate();
        graph[x].virtual_register = Some(slot);
        assert_eq!(graph[x].ref_count(), 2);

        board.use_node(&graph, x);
        // One use still outstanding: the slot must not be recycled yet.
        assert_eq!(board.allocate().0, 1);
        board.use_node(&graph, x);
        assert_eq!(board.allocate().0, 0);
    }
}
