//! Abstract interpretation state for the global control-flow analysis.
//!
//! Abstract values live in the same lattice as predictions: a set of
//! dynamic-type categories, bottom = empty. The state tracks one value per
//! local and one per node; guards and speculating arithmetic narrow operand
//! values, and a value narrowed to bottom proves the rest of the block
//! unreachable.

use std::fmt::Write as _;

use crate::graph::{BlockIndex, Graph, Id, NodeId};
use crate::opcode::Op;
use crate::prediction::{prediction_from_value, Prediction};
use crate::runtime::CodeBlock;

// ─── Abstract value ─────────────────────────────────────────────────────────

/// A lattice element approximating the dynamic types a value may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AbstractValue {
    value_type: Prediction,
}

impl AbstractValue {
    pub fn bottom() -> Self {
        AbstractValue {
            value_type: Prediction::empty(),
        }
    }

    pub fn top() -> Self {
        AbstractValue {
            value_type: Prediction::TOP,
        }
    }

    pub fn from_type(value_type: Prediction) -> Self {
        AbstractValue { value_type }
    }

    pub fn value_type(self) -> Prediction {
        self.value_type
    }

    pub fn is_bottom(self) -> bool {
        self.value_type.is_empty()
    }

    /// Join. Returns whether this value grew.
    pub fn merge(&mut self, other: AbstractValue) -> bool {
        let old = self.value_type;
        self.value_type |= other.value_type;
        self.value_type != old
    }

    /// Narrow to the given categories. Returns false when nothing remains:
    /// the speculation this filter models can never pass.
    pub fn filter(&mut self, mask: Prediction) -> bool {
        self.value_type &= mask;
        !self.value_type.is_empty()
    }
}

/// What [`AbstractState::end_basic_block`] does with the computed exit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Record the tail state only.
    MergeToTail,
    /// Record the tail state and join it into every successor's head,
    /// flagging changed successors for revisiting.
    MergeToSuccessors,
}

// ─── State ──────────────────────────────────────────────────────────────────

pub struct AbstractState {
    variables: Vec<AbstractValue>,
    node_values: Vec<AbstractValue>,
    block: Option<BlockIndex>,
    is_valid: bool,
}

impl AbstractState {
    /// Prime a graph for analysis: the entry block starts from all-unknown
    /// locals and is flagged for a visit; every other block starts at bottom.
    pub fn initialize(graph: &mut Graph) {
        for block in &mut graph.blocks {
            block.cfa_should_revisit = false;
            block.cfa_has_visited = false;
            for value in &mut block.values_at_head {
                *value = AbstractValue::bottom();
            }
            for value in &mut block.values_at_tail {
                *value = AbstractValue::bottom();
            }
        }
        if let Some(entry) = graph.blocks.first_mut() {
            entry.cfa_should_revisit = true;
            for value in &mut entry.values_at_head {
                *value = AbstractValue::top();
            }
        }
    }

    pub fn new(graph: &Graph) -> Self {
        AbstractState {
            variables: vec![AbstractValue::bottom(); graph.num_locals as usize],
            node_values: vec![AbstractValue::bottom(); graph.size() as usize],
            block: None,
            is_valid: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub fn begin_basic_block(&mut self, graph: &mut Graph, block_index: BlockIndex) {
        assert!(self.block.is_none(), "basic block already in progress");
        let block = &mut graph.blocks[block_index as usize];
        self.variables.clone_from(&block.values_at_head);
        block.cfa_should_revisit = false;
        block.cfa_has_visited = true;
        self.block = Some(block_index);
        self.is_valid = true;
    }

    fn value_of(&self, id: NodeId) -> AbstractValue {
        self.node_values[id.index()]
    }

    fn set_node(&mut self, id: NodeId, value_type: Prediction) {
        self.node_values[id.index()] = AbstractValue::from_type(value_type);
    }

    /// Narrow a node's value; on an empty result the state becomes invalid.
    fn filter_node(&mut self, id: NodeId, mask: Prediction) -> bool {
        if self.node_values[id.index()].filter(mask) {
            return true;
        }
        self.is_valid = false;
        false
    }

    /// The static result type for ops whose transfer is just "whatever was
    /// predicted".
    fn predicted_or_top(graph: &Graph, id: NodeId) -> Prediction {
        let prediction = graph[id].prediction;
        if prediction.is_empty() {
            Prediction::TOP
        } else {
            prediction
        }
    }

    /// Interpret one node. Returns false when the abstract state proves that
    /// control cannot continue past it.
    pub fn execute(&mut self, graph: &Graph, code_block: &CodeBlock, index: u32) -> bool {
        assert!(self.block.is_some(), "no basic block in progress");
        let id: NodeId = Id::new(index);
        let node = &graph[id];
        match node.op {
            Op::JsConstant | Op::WeakJsConstant => {
                let value = graph.value_of_js_constant(code_block, id);
                self.set_node(id, prediction_from_value(value));
            }

            Op::GetLocal => {
                let operand = graph.variables.operand(node.variable());
                self.node_values[id.index()] = self.variables[operand as usize];
            }
            Op::SetLocal => {
                let operand = graph.variables.operand(node.variable());
                let value = self.value_of(node.child1().expect("SetLocal needs a value"));
                self.variables[operand as usize] = value;
            }
            Op::Phi | Op::Flush | Op::SetArgument => {}

            Op::BitAnd
            | Op::BitOr
            | Op::BitXor
            | Op::BitLShift
            | Op::BitRShift
            | Op::BitURShift
            | Op::ValueToInt32 => {
                self.set_node(id, Prediction::INT32);
            }
            Op::UInt32ToNumber => {
                if node.arith_flags.can_speculate_integer() {
                    self.set_node(id, Prediction::INT32);
                } else {
                    self.set_node(id, Prediction::NUMBER_MASK);
                }
            }

            Op::ArithAdd | Op::ArithSub => {
                let left = node.child1().expect("arith needs operands");
                let right = node.child2().expect("arith needs operands");
                if !self.filter_node(left, Prediction::NUMBER_MASK)
                    || !self.filter_node(right, Prediction::NUMBER_MASK)
                {
                    return false;
                }
                if graph.add_should_speculate_integer(code_block, id) {
                    self.set_node(id, Prediction::INT32);
                } else {
                    self.set_node(id, Prediction::DOUBLE);
                }
            }
            Op::ValueAdd => {
                let left = node.child1().expect("ValueAdd needs operands");
                let right = node.child2().expect("ValueAdd needs operands");
                let numeric = self.value_of(left).value_type().is_number()
                    && self.value_of(right).value_type().is_number();
                if graph.add_should_speculate_integer(code_block, id) {
                    if !self.filter_node(left, Prediction::NUMBER_MASK)
                        || !self.filter_node(right, Prediction::NUMBER_MASK)
                    {
                        return false;
                    }
                    self.set_node(id, Prediction::INT32);
                } else if numeric {
                    self.set_node(id, Prediction::DOUBLE);
                } else {
                    self.set_node(id, Self::predicted_or_top(graph, id));
                }
            }
            Op::ArithMul | Op::ArithDiv | Op::ArithMod | Op::ArithMin | Op::ArithMax => {
                let left = node.child1().expect("arith needs operands");
                let right = node.child2().expect("arith needs operands");
                if !self.filter_node(left, Prediction::NUMBER_MASK)
                    || !self.filter_node(right, Prediction::NUMBER_MASK)
                {
                    return false;
                }
                let int32 = self.value_of(left).value_type().is_int32()
                    && self.value_of(right).value_type().is_int32()
                    && node.arith_flags.can_speculate_integer();
                self.set_node(
                    id,
                    if int32 {
                        Prediction::INT32
                    } else {
                        Prediction::DOUBLE
                    },
                );
            }
            Op::ArithAbs => {
                let child = node.child1().expect("ArithAbs needs an operand");
                if !self.filter_node(child, Prediction::NUMBER_MASK) {
                    return false;
                }
                let int32 = self.value_of(child).value_type().is_int32()
                    && node.arith_flags.can_speculate_integer();
                self.set_node(
                    id,
                    if int32 {
                        Prediction::INT32
                    } else {
                        Prediction::DOUBLE
                    },
                );
            }
            Op::ArithSqrt => {
                let child = node.child1().expect("ArithSqrt needs an operand");
                if !self.filter_node(child, Prediction::NUMBER_MASK) {
                    return false;
                }
                self.set_node(id, Prediction::DOUBLE);
            }

            Op::CompareLess
            | Op::CompareLessEq
            | Op::CompareGreater
            | Op::CompareGreaterEq
            | Op::CompareEq
            | Op::CompareStrictEq
            | Op::LogicalNot
            | Op::InstanceOf => {
                self.set_node(id, Prediction::BOOLEAN);
            }

            Op::CheckStructure => {
                let base = node.child1().expect("CheckStructure needs a base");
                if !self.filter_node(base, Prediction::OBJECT_MASK) {
                    return false;
                }
            }
            Op::CheckFunction => {
                let base = node.child1().expect("CheckFunction needs a base");
                if !self.filter_node(base, Prediction::FUNCTION) {
                    return false;
                }
            }
            Op::CheckHasInstance => {
                let base = node.child1().expect("CheckHasInstance needs a base");
                if !self.filter_node(base, Prediction::CELL_MASK) {
                    return false;
                }
            }

            Op::ConvertThis => {
                let child = node.child1().expect("ConvertThis needs an operand");
                let mut this_type = self.value_of(child).value_type();
                if this_type.is_empty() {
                    this_type = Prediction::TOP;
                }
                if this_type.intersects(!Prediction::OBJECT_MASK) {
                    this_type =
                        (this_type & Prediction::OBJECT_MASK) | Prediction::OBJECT_OTHER;
                }
                self.set_node(id, this_type);
            }
            Op::ToPrimitive => {
                let child = node.child1().expect("ToPrimitive needs an operand");
                let mut child_type = self.value_of(child).value_type();
                if child_type.is_empty() {
                    child_type = Prediction::TOP;
                }
                let result = if child_type.is_object() {
                    Prediction::STRING
                } else if child_type.intersects(Prediction::OBJECT_MASK) {
                    (child_type & !Prediction::OBJECT_MASK) | Prediction::STRING
                } else {
                    child_type
                };
                self.set_node(id, result);
            }

            Op::StringCharAt => {
                let base = node.child1().expect("StringCharAt needs a base");
                if !self.filter_node(base, Prediction::STRING) {
                    return false;
                }
                self.set_node(id, Prediction::STRING);
            }
            Op::StringCharCodeAt => {
                let base = node.child1().expect("StringCharCodeAt needs a base");
                if !self.filter_node(base, Prediction::STRING) {
                    return false;
                }
                self.set_node(id, Prediction::INT32);
            }

            Op::GetArrayLength
            | Op::GetStringLength
            | Op::GetByteArrayLength
            | Op::GetInt8ArrayLength
            | Op::GetInt16ArrayLength
            | Op::GetInt32ArrayLength
            | Op::GetUint8ArrayLength
            | Op::GetUint8ClampedArrayLength
            | Op::GetUint16ArrayLength
            | Op::GetUint32ArrayLength
            | Op::GetFloat32ArrayLength
            | Op::GetFloat64ArrayLength => {
                let base = node.child1().expect("length getter needs a base");
                let container = match node.op {
                    Op::GetArrayLength => Prediction::ARRAY,
                    Op::GetStringLength => Prediction::STRING,
                    Op::GetByteArrayLength => Prediction::BYTE_ARRAY,
                    Op::GetInt8ArrayLength => Prediction::INT8_ARRAY,
                    Op::GetInt16ArrayLength => Prediction::INT16_ARRAY,
                    Op::GetInt32ArrayLength => Prediction::INT32_ARRAY,
                    Op::GetUint8ArrayLength => Prediction::UINT8_ARRAY,
                    Op::GetUint8ClampedArrayLength => Prediction::UINT8_CLAMPED_ARRAY,
                    Op::GetUint16ArrayLength => Prediction::UINT16_ARRAY,
                    Op::GetUint32ArrayLength => Prediction::UINT32_ARRAY,
                    Op::GetFloat32ArrayLength => Prediction::FLOAT32_ARRAY,
                    _ => Prediction::FLOAT64_ARRAY,
                };
                if !self.filter_node(base, container) {
                    return false;
                }
                self.set_node(id, Prediction::INT32);
            }

            // Stores, terminals, and bookkeeping nodes leave the tracked
            // state alone; world clobbers cannot touch locals.
            Op::PutById
            | Op::PutByIdDirect
            | Op::PutByVal
            | Op::PutByValAlias
            | Op::PutByOffset
            | Op::PutStructure
            | Op::PutGlobalVar
            | Op::PutScopedVar
            | Op::Jump
            | Op::Branch
            | Op::Return
            | Op::Throw
            | Op::ThrowReferenceError
            | Op::Breakpoint
            | Op::ForceOsrExit
            | Op::InlineStart
            | Op::Phantom
            | Op::Nop => {}

            // Everything else produces whatever its prediction says.
            _ => {
                if node.has_result() {
                    self.set_node(id, Self::predicted_or_top(graph, id));
                }
            }
        }
        true
    }

    /// Finish the in-progress block. Returns whether any recorded state (the
    /// tail, or a successor's head) changed.
    pub fn end_basic_block(&mut self, graph: &mut Graph, mode: MergeMode) -> bool {
        let block_index = self.block.take().expect("no basic block in progress");
        if !self.is_valid {
            // Control provably cannot reach the block exit; nothing flows on.
            return false;
        }

        let mut changed = false;
        {
            let block = &mut graph.blocks[block_index as usize];
            for (tail, value) in block.values_at_tail.iter_mut().zip(&self.variables) {
                changed |= tail.merge(*value);
            }
        }

        if mode == MergeMode::MergeToSuccessors {
            for successor in graph.successors(block_index) {
                let succ = &mut graph.blocks[successor as usize];
                let mut head_changed = false;
                for (head, value) in succ.values_at_head.iter_mut().zip(&self.variables) {
                    head_changed |= head.merge(*value);
                }
                if !succ.cfa_has_visited && !succ.cfa_should_revisit {
                    head_changed = true;
                }
                if head_changed {
                    succ.cfa_should_revisit = true;
                    changed = true;
                }
            }
        }
        changed
    }

    /// One-line rendering of the tracked locals, for trace logs.
    pub fn dump(&self) -> String {
        let mut out = String::from("locals: [");
        for (i, value) in self.variables.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            let _ = write!(out, "{}", value.value_type());
        }
        out.push(']');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::runtime::{JsValue, StructureId, StructureSet};

    #[test]
    fn merge_and_filter_move_along_the_lattice() {
        let mut value = AbstractValue::bottom();
        assert!(value.merge(AbstractValue::from_type(Prediction::INT32)));
        assert!(!value.merge(AbstractValue::from_type(Prediction::INT32)));
        assert!(value.merge(AbstractValue::from_type(Prediction::STRING)));
        assert!(value.filter(Prediction::NUMBER_MASK));
        assert_eq!(value.value_type(), Prediction::INT32);
        assert!(!value.filter(Prediction::STRING));
        assert!(value.is_bottom());
    }

    #[test]
    fn a_guard_on_an_impossible_type_halts_the_block() {
        let mut builder = GraphBuilder::new(1);
        let c = builder.js_constant(JsValue::Int32(5));
        let store = builder.set_local(0, c);
        let load = builder.get_local(0);
        let check = builder.check_structure(load, StructureSet::single(StructureId(1)));
        builder.ret(None);
        let (mut graph, code_block) = builder.finish();

        AbstractState::initialize(&mut graph);
        let mut state = AbstractState::new(&graph);
        state.begin_basic_block(&mut graph, 0);
        assert!(state.execute(&graph, &code_block, c.index() as u32));
        assert!(state.execute(&graph, &code_block, store.index() as u32));
        assert!(state.execute(&graph, &code_block, load.index() as u32));
        // An int32 can never pass a structure check.
        assert!(!state.execute(&graph, &code_block, check.index() as u32));
        assert!(!state.is_valid());
        assert!(!state.end_basic_block(&mut graph, MergeMode::MergeToSuccessors));
    }

    #[test]
    fn set_local_flows_into_successor_heads() {
        let mut builder = GraphBuilder::new(1);
        let c = builder.js_constant(JsValue::Int32(1));
        builder.set_local(0, c);
        builder.jump(1);
        builder.end_block();
        builder.ret(None);
        let (mut graph, code_block) = builder.finish();

        AbstractState::initialize(&mut graph);
        let mut state = AbstractState::new(&graph);
        state.begin_basic_block(&mut graph, 0);
        for index in graph.blocks[0].begin..graph.blocks[0].end {
            assert!(state.execute(&graph, &code_block, index));
        }
        assert!(state.end_basic_block(&mut graph, MergeMode::MergeToSuccessors));
        assert!(graph.blocks[1].cfa_should_revisit);
        assert_eq!(
            graph.blocks[1].values_at_head[0].value_type(),
            Prediction::INT32
        );
    }
}
