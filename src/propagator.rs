//! The type-propagation and local optimization pipeline.
//!
//! Six passes over one graph, in fixed order: arithmetic use-flag
//! propagation, prediction propagation interleaved with double voting, opcode
//! fixup, per-block common subexpression elimination, virtual register
//! allocation, and a global abstract-interpretation fixpoint. Passes
//! communicate only through node state, and every per-node quantity
//! (predictions, flags) moves monotonically up its lattice, which is what
//! bounds the fixpoints.

use log::{debug, trace};

use crate::abstract_state::{AbstractState, MergeMode};
use crate::graph::{BlockIndex, Children, Graph, Id, NodeId};
use crate::opcode::{ArithFlags, Op, OpFlags, OP_COUNT};
use crate::prediction::{prediction_from_value, Prediction};
use crate::runtime::{CodeBlock, GlobalData, GlobalObjectId};
use crate::scoreboard::ScoreBoard;
use crate::variables::Ballot;

/// Bound on how far back a CSE candidate search may look within a block.
const CSE_LOOKBACK_LIMIT: u32 = 300;

/// Run the pipeline. Mutates the graph in place and raises
/// `code_block.num_callee_registers` as needed; the profiled alternative must
/// be attached.
pub fn propagate(graph: &mut Graph, global_data: &GlobalData, code_block: &mut CodeBlock) {
    assert!(
        code_block.alternative.is_some(),
        "optimizing compilation requires a profiled alternative"
    );
    let mut propagator = Propagator::new(graph, global_data, code_block);
    propagator.run();
}

struct Propagator<'a> {
    graph: &'a mut Graph,
    global_data: &'a GlobalData,
    code_block: &'a mut CodeBlock,

    /// CSE replacement table: `replacements[i] = Some(j)` redirects later
    /// uses of `i` to `j`. Never chains.
    replacements: Vec<Option<NodeId>>,
    /// Index of the most recently visited node per opcode tag, bounding pure
    /// CSE searches.
    last_seen: [Option<u32>; OP_COUNT],

    /// First node index of the block being processed.
    block_start: u32,
    /// The node the current pass is looking at.
    current: u32,
    changed: bool,
}

impl<'a> Propagator<'a> {
    fn new(
        graph: &'a mut Graph,
        global_data: &'a GlobalData,
        code_block: &'a mut CodeBlock,
    ) -> Self {
        let replacements = vec![None; graph.size() as usize];
        let mut propagator = Propagator {
            graph,
            global_data,
            code_block,
            replacements,
            last_seen: [None; OP_COUNT],
            block_start: 0,
            current: 0,
            changed: false,
        };
        propagator.seed_overflow_evidence();
        propagator
    }

    fn run(&mut self) {
        debug!(
            "propagate: begin, {} nodes in {} blocks",
            self.graph.size(),
            self.graph.blocks.len()
        );
        trace!("graph before propagation:\n{}", self.graph.display(self.code_block));

        self.propagate_arith_flags();
        self.propagate_predictions();
        self.fixup();
        trace!("graph after fixup:\n{}", self.graph.display(self.code_block));

        self.local_cse();
        trace!("graph after CSE:\n{}", self.graph.display(self.code_block));

        self.allocate_virtual_registers();
        trace!(
            "graph after virtual register allocation:\n{}",
            self.graph.display(self.code_block)
        );

        self.global_cfa();
        debug!("propagate: end");
    }

    /// Record baseline overflow exits on the arithmetic nodes they belong to,
    /// before anything consults the flags.
    fn seed_overflow_evidence(&mut self) {
        let profiled = self.code_block.profiled_block();
        for id in self.graph.node_ids().collect::<Vec<_>>() {
            let node = &self.graph[id];
            let arithmetic = matches!(
                node.op,
                Op::ValueAdd
                    | Op::ArithAdd
                    | Op::ArithSub
                    | Op::ArithMul
                    | Op::UInt32ToNumber
            );
            if arithmetic && profiled.did_overflow_at(node.origin) {
                self.graph[id].merge_arith_flags(ArithFlags::MAY_OVERFLOW);
            }
        }
    }

    // ─── Constant classification ────────────────────────────────────

    /// The operand is a number constant other than negative zero. Adding such
    /// a constant can never produce `-0`, so the other operand's sign of zero
    /// stops mattering.
    fn is_not_neg_zero(&self, id: NodeId) -> bool {
        if !self.graph.is_number_constant(self.code_block, id) {
            return false;
        }
        let value = self.graph.value_of_number_constant(self.code_block, id);
        !(value == 0.0 && value.is_sign_negative())
    }

    fn is_not_zero(&self, id: NodeId) -> bool {
        if !self.graph.is_number_constant(self.code_block, id) {
            return false;
        }
        self.graph.value_of_number_constant(self.code_block, id) != 0.0
    }

    // ─── Pass 1: arithmetic use flags ───────────────────────────────

    fn merge_flags(&mut self, child: Option<NodeId>, flags: ArithFlags) -> bool {
        match child {
            Some(child) => self.graph[child].merge_arith_flags(flags),
            None => false,
        }
    }

    fn propagate_arith_flags_for_node(&mut self, index: u32) {
        let id: NodeId = Id::new(index);
        if !self.graph[id].should_generate() {
            return;
        }
        let op = self.graph[id].op;
        let mut flags = self.graph[id].arith_flags & ArithFlags::USED_AS_MASK;
        let mut changed = false;

        match op {
            // Happy with truncated integers; demand nothing of producers.
            Op::ValueToInt32
            | Op::BitAnd
            | Op::BitOr
            | Op::BitXor
            | Op::BitLShift
            | Op::BitRShift
            | Op::BitURShift => {}

            Op::UInt32ToNumber => {
                changed |= self.merge_flags(self.graph[id].child1(), flags);
            }

            Op::ArithAdd | Op::ValueAdd => {
                let child1 = self.graph[id].child1();
                let child2 = self.graph[id].child2();
                if child1.is_some_and(|c| self.is_not_neg_zero(c))
                    || child2.is_some_and(|c| self.is_not_neg_zero(c))
                {
                    flags.remove(ArithFlags::NEEDS_NEG_ZERO);
                }
                changed |= self.merge_flags(child1, flags);
                changed |= self.merge_flags(child2, flags);
            }

            Op::ArithSub => {
                let child1 = self.graph[id].child1();
                let child2 = self.graph[id].child2();
                if child1.is_some_and(|c| self.is_not_zero(c))
                    || child2.is_some_and(|c| self.is_not_zero(c))
                {
                    flags.remove(ArithFlags::NEEDS_NEG_ZERO);
                }
                changed |= self.merge_flags(child1, flags);
                changed |= self.merge_flags(child2, flags);
            }

            // A multiply can move values into the part of the double domain
            // where truncation placement changes the outcome, so operands
            // must behave as full numbers no matter how the result is used.
            Op::ArithMul | Op::ArithDiv => {
                flags |= ArithFlags::USED_AS_NUMBER | ArithFlags::NEEDS_NEG_ZERO;
                changed |= self.merge_flags(self.graph[id].child1(), flags);
                changed |= self.merge_flags(self.graph[id].child2(), flags);
            }

            Op::ArithMin | Op::ArithMax => {
                flags |= ArithFlags::USED_AS_NUMBER;
                changed |= self.merge_flags(self.graph[id].child1(), flags);
                changed |= self.merge_flags(self.graph[id].child2(), flags);
            }

            Op::ArithAbs => {
                flags.remove(ArithFlags::NEEDS_NEG_ZERO);
                changed |= self.merge_flags(self.graph[id].child1(), flags);
            }

            Op::PutByVal | Op::PutByValAlias => {
                changed |= self.merge_flags(
                    self.graph[id].child1(),
                    flags | ArithFlags::USED_AS_NUMBER | ArithFlags::NEEDS_NEG_ZERO,
                );
                changed |= self.merge_flags(
                    self.graph[id].child2(),
                    flags | ArithFlags::USED_AS_NUMBER,
                );
                changed |= self.merge_flags(
                    self.graph[id].child3(),
                    flags | ArithFlags::USED_AS_NUMBER | ArithFlags::NEEDS_NEG_ZERO,
                );
            }

            Op::GetByVal => {
                changed |= self.merge_flags(
                    self.graph[id].child1(),
                    flags | ArithFlags::USED_AS_NUMBER | ArithFlags::NEEDS_NEG_ZERO,
                );
                changed |= self.merge_flags(
                    self.graph[id].child2(),
                    flags | ArithFlags::USED_AS_NUMBER,
                );
            }

            // Kept only for reference integrity; not numeric uses.
            Op::Phantom | Op::Nop => {}

            _ => {
                flags |= ArithFlags::USED_AS_NUMBER | ArithFlags::NEEDS_NEG_ZERO;
                for child in self.graph.child_ids(id) {
                    changed |= self.graph[child].merge_arith_flags(flags);
                }
            }
        }

        self.changed |= changed;
    }

    fn propagate_arith_flags_forward(&mut self) {
        for index in 0..self.graph.size() {
            self.current = index;
            self.propagate_arith_flags_for_node(index);
        }
    }

    fn propagate_arith_flags_backward(&mut self) {
        for index in (0..self.graph.size()).rev() {
            self.current = index;
            self.propagate_arith_flags_for_node(index);
        }
    }

    fn propagate_arith_flags(&mut self) {
        debug!("arith flag propagation: begin");
        let mut rounds = 0u32;
        loop {
            rounds += 1;
            // Demand flows from consumers to producers, so the backward
            // sweep tends to converge first.
            self.changed = false;
            self.propagate_arith_flags_backward();
            if !self.changed {
                break;
            }
            self.changed = false;
            self.propagate_arith_flags_forward();
            if !self.changed {
                break;
            }
        }
        debug!("arith flag propagation: end after {rounds} round(s)");
    }

    // ─── Pass 2: predictions ────────────────────────────────────────

    /// Assert-checked variant of [`Propagator::merge_prediction`] for nodes
    /// whose prediction can never change once made.
    fn set_prediction(&mut self, prediction: Prediction) -> bool {
        let id: NodeId = Id::new(self.current);
        let node = &mut self.graph[id];
        assert!(node.has_result(), "prediction on resultless {}", node.op);
        assert!(
            node.prediction.is_empty() || node.prediction == prediction,
            "prediction conflict on {}: had {}, now {}",
            node.op,
            node.prediction,
            prediction
        );
        node.predict(prediction)
    }

    fn merge_prediction(&mut self, prediction: Prediction) -> bool {
        let id: NodeId = Id::new(self.current);
        let node = &mut self.graph[id];
        assert!(node.has_result(), "prediction on resultless {}", node.op);
        node.predict(prediction)
    }

    fn prediction_of(&self, child: NodeId) -> Prediction {
        self.graph[child].prediction
    }

    fn propagate_node_predictions(&mut self, index: u32) {
        let id: NodeId = Id::new(index);
        if !self.graph[id].should_generate() {
            return;
        }
        let op = self.graph[id].op;
        let mut changed = false;

        match op {
            Op::JsConstant | Op::WeakJsConstant => {
                let value = self.graph.value_of_js_constant(self.code_block, id);
                let prediction = prediction_from_value(value);
                changed |= self.set_prediction(prediction);
            }

            Op::GetLocal => {
                let variable = self.graph[id].variable();
                let prediction = self.graph.variables.prediction(variable);
                if !prediction.is_empty() {
                    changed |= self.merge_prediction(prediction);
                }
            }

            Op::SetLocal => {
                let variable = self.graph[id].variable();
                let value = self.graph[id].child1().expect("SetLocal needs a value");
                let prediction = self.prediction_of(value);
                changed |= self.graph.variables.predict(variable, prediction);
            }

            Op::BitAnd
            | Op::BitOr
            | Op::BitXor
            | Op::BitRShift
            | Op::BitLShift
            | Op::BitURShift
            | Op::ValueToInt32 => {
                changed |= self.set_prediction(Prediction::INT32);
            }

            Op::ArrayPop | Op::ArrayPush => {
                let hint = self.graph[id].heap_prediction;
                if !hint.is_empty() {
                    changed |= self.merge_prediction(hint);
                }
            }

            Op::StringCharCodeAt => {
                changed |= self.merge_prediction(Prediction::INT32);
            }

            Op::ArithMod | Op::ArithMul | Op::ArithMin | Op::ArithMax | Op::ArithDiv => {
                let left = self.prediction_of(self.graph[id].child1().expect("binary arith"));
                let right = self.prediction_of(self.graph[id].child2().expect("binary arith"));
                if !left.is_empty() && !right.is_empty() {
                    if (left | right).is_int32()
                        && self.graph[id].arith_flags.can_speculate_integer()
                    {
                        changed |= self.merge_prediction(Prediction::INT32);
                    } else {
                        changed |= self.merge_prediction(Prediction::DOUBLE);
                    }
                }
            }

            Op::UInt32ToNumber => {
                if self.graph[id].arith_flags.can_speculate_integer() {
                    changed |= self.set_prediction(Prediction::INT32);
                } else {
                    changed |= self.set_prediction(Prediction::NUMBER_MASK);
                }
            }

            Op::ValueAdd => {
                let left = self.prediction_of(self.graph[id].child1().expect("ValueAdd"));
                let right = self.prediction_of(self.graph[id].child2().expect("ValueAdd"));
                if !left.is_empty() && !right.is_empty() {
                    if left.is_number() && right.is_number() {
                        if self.graph.add_should_speculate_integer(self.code_block, id) {
                            changed |= self.merge_prediction(Prediction::INT32);
                        } else {
                            changed |= self.merge_prediction(Prediction::DOUBLE);
                        }
                    } else if !left.intersects(Prediction::NUMBER_MASK)
                        || !right.intersects(Prediction::NUMBER_MASK)
                    {
                        // One side is definitely not a number, so this is a
                        // concatenation.
                        changed |= self.merge_prediction(Prediction::STRING);
                    } else {
                        changed |= self.merge_prediction(
                            Prediction::STRING | Prediction::INT32 | Prediction::DOUBLE,
                        );
                    }
                }
            }

            Op::ArithAdd | Op::ArithSub => {
                let left = self.prediction_of(self.graph[id].child1().expect("binary arith"));
                let right = self.prediction_of(self.graph[id].child2().expect("binary arith"));
                if !left.is_empty() && !right.is_empty() {
                    if self.graph.add_should_speculate_integer(self.code_block, id) {
                        changed |= self.merge_prediction(Prediction::INT32);
                    } else {
                        changed |= self.merge_prediction(Prediction::DOUBLE);
                    }
                }
            }

            Op::ArithSqrt => {
                changed |= self.set_prediction(Prediction::DOUBLE);
            }

            Op::ArithAbs => {
                let child = self.prediction_of(self.graph[id].child1().expect("ArithAbs"));
                if !child.is_empty() {
                    if self.graph[id].arith_flags.can_speculate_integer() {
                        changed |= self.merge_prediction(child);
                    } else {
                        changed |= self.set_prediction(Prediction::DOUBLE);
                    }
                }
            }

            Op::LogicalNot
            | Op::CompareLess
            | Op::CompareLessEq
            | Op::CompareGreater
            | Op::CompareGreaterEq
            | Op::CompareEq
            | Op::CompareStrictEq
            | Op::InstanceOf => {
                changed |= self.set_prediction(Prediction::BOOLEAN);
            }

            Op::GetById => {
                let hint = self.graph[id].heap_prediction;
                if !hint.is_empty() {
                    changed |= self.merge_prediction(hint);
                } else {
                    // No profile; a length read of a known container kind is
                    // inferable on our own.
                    let number = self.graph[id].identifier_number();
                    if self.code_block.identifier(number) == self.global_data.property_names.length
                    {
                        let base = self.graph[id].child1().expect("GetById needs a base");
                        if self.prediction_of(base).length_specialization().is_some() {
                            changed |= self.merge_prediction(Prediction::INT32);
                        }
                    }
                }
            }

            Op::GetByIdFlush => {
                let hint = self.graph[id].heap_prediction;
                if !hint.is_empty() {
                    changed |= self.merge_prediction(hint);
                }
            }

            Op::GetByVal => {
                let base = self.prediction_of(self.graph[id].child1().expect("GetByVal"));
                let hint = self.graph[id].heap_prediction;
                if base == Prediction::UINT32_ARRAY
                    || base == Prediction::FLOAT32_ARRAY
                    || base == Prediction::FLOAT64_ARRAY
                {
                    changed |= self.merge_prediction(Prediction::DOUBLE);
                } else if !hint.is_empty() {
                    changed |= self.merge_prediction(hint);
                }
            }

            Op::GetPropertyStorage | Op::GetIndexedPropertyStorage => {
                changed |= self.set_prediction(Prediction::OTHER);
            }

            Op::GetByOffset | Op::Call | Op::Construct => {
                let hint = self.graph[id].heap_prediction;
                if !hint.is_empty() {
                    changed |= self.merge_prediction(hint);
                }
            }

            Op::ConvertThis => {
                let mut prediction =
                    self.prediction_of(self.graph[id].child1().expect("ConvertThis"));
                if !prediction.is_empty() {
                    if prediction.intersects(!Prediction::OBJECT_MASK) {
                        prediction = (prediction & Prediction::OBJECT_MASK)
                            | Prediction::OBJECT_OTHER;
                    }
                    changed |= self.merge_prediction(prediction);
                }
            }

            Op::GetGlobalVar => {
                let prediction = self
                    .graph
                    .global_var_prediction(self.graph[id].global_var_number());
                if !prediction.is_empty() {
                    changed |= self.merge_prediction(prediction);
                }
            }

            Op::PutGlobalVar => {
                let value = self.graph[id].child1().expect("PutGlobalVar needs a value");
                let prediction = self.prediction_of(value);
                let var_number = self.graph[id].global_var_number();
                changed |= self.graph.predict_global_var(var_number, prediction);
            }

            Op::GetScopedVar
            | Op::Resolve
            | Op::ResolveBase
            | Op::ResolveBaseStrictPut
            | Op::ResolveGlobal => {
                let hint = self.graph[id].heap_prediction;
                if !hint.is_empty() {
                    changed |= self.merge_prediction(hint);
                }
            }

            Op::GetScopeChain => {
                changed |= self.set_prediction(Prediction::CELL_OTHER);
            }

            Op::GetCallee => {
                changed |= self.set_prediction(Prediction::FUNCTION);
            }

            Op::CreateThis | Op::NewObject => {
                changed |= self.set_prediction(Prediction::FINAL_OBJECT);
            }

            Op::NewArray | Op::NewArrayBuffer => {
                changed |= self.set_prediction(Prediction::ARRAY);
            }

            Op::NewRegexp => {
                changed |= self.set_prediction(Prediction::OBJECT_OTHER);
            }

            Op::StringCharAt | Op::StrCat => {
                changed |= self.set_prediction(Prediction::STRING);
            }

            Op::ToPrimitive => {
                let child = self.prediction_of(self.graph[id].child1().expect("ToPrimitive"));
                if !child.is_empty() {
                    if child.is_object() {
                        changed |= self.merge_prediction(Prediction::STRING);
                    } else if child.intersects(Prediction::OBJECT_MASK) {
                        // Objects become strings, so hints of objectness turn
                        // into hints of stringiness.
                        changed |= self.merge_prediction(
                            (child & !Prediction::OBJECT_MASK) | Prediction::STRING,
                        );
                    } else {
                        changed |= self.merge_prediction(child);
                    }
                }
            }

            // Length getters are inserted by fixup; on the first pipeline run
            // none exist yet, and on a re-run their prediction is already the
            // int32 this confirms.
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
                changed |= self.merge_prediction(Prediction::INT32);
            }

            // No result to predict.
            Op::PutScopedVar
            | Op::Jump
            | Op::Branch
            | Op::Breakpoint
            | Op::Return
            | Op::CheckHasInstance
            | Op::Phi
            | Op::Flush
            | Op::Throw
            | Op::ThrowReferenceError
            | Op::ForceOsrExit
            | Op::SetArgument
            | Op::PutByVal
            | Op::PutByValAlias
            | Op::PutById
            | Op::PutByIdDirect
            | Op::CheckStructure
            | Op::CheckFunction
            | Op::PutStructure
            | Op::PutByOffset
            | Op::Phantom
            | Op::InlineStart
            | Op::Nop => {}
        }

        self.changed |= changed;
    }

    fn propagate_predictions_forward(&mut self) {
        for index in 0..self.graph.size() {
            self.current = index;
            self.propagate_node_predictions(index);
        }
    }

    fn propagate_predictions_backward(&mut self) {
        for index in (0..self.graph.size()).rev() {
            self.current = index;
            self.propagate_node_predictions(index);
        }
    }

    // ─── Double voting ──────────────────────────────────────────────

    /// Cast a ballot on the local behind an operand, looking through int32
    /// conversion wrappers.
    fn vote_child(&mut self, child: NodeId, ballot: Ballot) {
        let mut id = child;
        if matches!(self.graph[id].op, Op::ValueToInt32 | Op::UInt32ToNumber) {
            match self.graph[id].child1() {
                Some(inner) => id = inner,
                None => return,
            }
        }
        if self.graph[id].op == Op::GetLocal {
            let variable = self.graph[id].variable();
            self.graph.variables.vote(variable, ballot);
        }
    }

    fn vote_children(&mut self, id: NodeId, ballot: Ballot) {
        for child in self.graph.child_ids(id) {
            self.vote_child(child, ballot);
        }
    }

    fn do_round_of_double_voting(&mut self) {
        trace!("voting on double representation of locals");
        for variable in self.graph.variables.ids().collect::<Vec<_>>() {
            self.graph.variables.clear_votes(variable);
        }
        for index in 0..self.graph.size() {
            let id: NodeId = Id::new(index);
            match self.graph[id].op {
                Op::ValueAdd | Op::ArithAdd | Op::ArithSub => {
                    let child1 = self.graph[id].child1().expect("binary arith");
                    let child2 = self.graph[id].child2().expect("binary arith");
                    let left = self.prediction_of(child1);
                    let right = self.prediction_of(child2);

                    let ballot = if left.is_number()
                        && right.is_number()
                        && !self.graph.add_should_speculate_integer(self.code_block, id)
                    {
                        Ballot::Double
                    } else {
                        Ballot::Value
                    };
                    self.vote_child(child1, ballot);
                    self.vote_child(child2, ballot);
                }

                Op::ArithMul | Op::ArithMin | Op::ArithMax | Op::ArithMod | Op::ArithDiv => {
                    let child1 = self.graph[id].child1().expect("binary arith");
                    let child2 = self.graph[id].child2().expect("binary arith");
                    let left = self.prediction_of(child1);
                    let right = self.prediction_of(child2);

                    let int32 = left.is_int32()
                        && right.is_int32()
                        && self.graph[id].arith_flags.can_speculate_integer();
                    let ballot = if left.is_number() && right.is_number() && !int32 {
                        Ballot::Double
                    } else {
                        Ballot::Value
                    };
                    self.vote_child(child1, ballot);
                    self.vote_child(child2, ballot);
                }

                Op::ArithAbs => {
                    let child1 = self.graph[id].child1().expect("ArithAbs");
                    let int32 = self.prediction_of(child1).is_int32()
                        && self.graph[id].arith_flags.can_speculate_integer();
                    let ballot = if int32 { Ballot::Value } else { Ballot::Double };
                    self.vote_child(child1, ballot);
                }

                Op::ArithSqrt => {
                    let child1 = self.graph[id].child1().expect("ArithSqrt");
                    self.vote_child(child1, Ballot::Double);
                }

                Op::SetLocal => {
                    let value = self.graph[id].child1().expect("SetLocal needs a value");
                    let prediction = self.prediction_of(value);
                    let variable = self.graph[id].variable();
                    if prediction.is_double() {
                        self.graph.variables.vote(variable, Ballot::Double);
                    } else if !prediction.is_number() || prediction.is_int32() {
                        self.graph.variables.vote(variable, Ballot::Value);
                    }
                }

                _ => {
                    self.vote_children(id, Ballot::Value);
                }
            }
        }
        for variable in self.graph.variables.ids().collect::<Vec<_>>() {
            self.changed |= self
                .graph
                .variables
                .tally_votes_for_should_use_double_format(variable);
        }
    }

    fn propagate_predictions(&mut self) {
        debug!("prediction propagation: begin");

        // Stage one: plain propagation to a fixpoint. Forward is near-optimal
        // for topologically-ordered code; the backward sweep both detects
        // convergence and short-circuits loop-shaped flow.
        loop {
            self.changed = false;
            self.propagate_predictions_forward();
            if !self.changed {
                break;
            }
            self.changed = false;
            self.propagate_predictions_backward();
            if !self.changed {
                break;
            }
        }

        // Stage two: interleave double voting with further propagation until
        // neither moves.
        loop {
            self.changed = false;
            self.do_round_of_double_voting();
            self.propagate_predictions_forward();
            if !self.changed {
                break;
            }
            self.changed = false;
            self.do_round_of_double_voting();
            self.propagate_predictions_backward();
            if !self.changed {
                break;
            }
        }
        debug!("prediction propagation: end");
    }

    // ─── Pass 3: fixup ──────────────────────────────────────────────

    fn fixup_node(&mut self, index: u32) {
        let id: NodeId = Id::new(index);
        if !self.graph[id].should_generate() {
            return;
        }
        match self.graph[id].op {
            Op::GetById => {
                if !self.graph[id].prediction.is_int32() {
                    return;
                }
                let number = self.graph[id].identifier_number();
                if self.code_block.identifier(number) != self.global_data.property_names.length {
                    return;
                }
                let base = self.graph[id].child1().expect("GetById needs a base");
                let Some(length_op) = self.prediction_of(base).length_specialization() else {
                    return;
                };
                trace!("fixup: n{index} GetById -> {length_op}");
                self.graph[id].op = length_op;
                // The specialized op is pure; drop the must-generate
                // obligation.
                self.graph.deref(id);
            }

            Op::GetIndexedPropertyStorage => {
                let index_child = self.graph[id]
                    .child2()
                    .expect("GetIndexedPropertyStorage needs an index");
                let index_prediction = self.prediction_of(index_child);
                if !index_prediction.intersects(Prediction::INT32)
                    && !index_prediction.is_empty()
                {
                    trace!("fixup: n{index} GetIndexedPropertyStorage -> Nop");
                    self.graph[id].op = Op::Nop;
                    self.graph.clear_and_deref_child(id, 0);
                    self.graph.clear_and_deref_child(id, 1);
                    self.graph.clear_and_deref_child(id, 2);
                    self.graph[id].set_ref_count(0);
                }
            }

            Op::GetByVal | Op::StringCharAt | Op::StringCharCodeAt => {
                if let Some(storage) = self.graph[id].child3() {
                    if self.graph[storage].op == Op::Nop {
                        self.graph[id].set_child(2, None);
                    }
                }
            }

            _ => {}
        }
    }

    fn fixup(&mut self) {
        debug!("fixup: begin");
        for index in 0..self.graph.size() {
            self.current = index;
            self.fixup_node(index);
        }
        debug!("fixup: end");
    }

    // ─── Pass 4: local CSE ──────────────────────────────────────────

    /// Strip an int32 conversion wrapper so `x` and `ValueToInt32(x)` compare
    /// equal as CSE operands.
    fn canonicalize(&self, child: Option<NodeId>) -> Option<NodeId> {
        let id = child?;
        if self.graph[id].op == Op::ValueToInt32 {
            self.graph[id].child1()
        } else {
            Some(id)
        }
    }

    /// Lowest index a candidate search may reach: the block start, clamped by
    /// the lookback window, and never below the operands themselves.
    fn start_index_for_children(&self, children: [Option<NodeId>; 3]) -> u32 {
        let mut start = self.block_start;
        if self.current - start > CSE_LOOKBACK_LIMIT {
            start = self.current - CSE_LOOKBACK_LIMIT;
        }
        for child in children {
            let Some(child) = self.canonicalize(child) else {
                break;
            };
            let child_index = child.index() as u32;
            if start < child_index {
                start = child_index;
            }
        }
        start
    }

    fn start_index(&self) -> u32 {
        let id: NodeId = Id::new(self.current);
        let node = &self.graph[id];
        self.start_index_for_children([node.child1(), node.child2(), node.child3()])
    }

    /// One past the last same-tag node, bounding pure CSE. Search ranges from
    /// prior blocks collapse to empty because the start index never drops
    /// below the block start.
    fn end_index_for_pure_cse(&self) -> u32 {
        let op = self.graph[Id::new(self.current)].op;
        let result = match self.last_seen[op.index()] {
            None => 0,
            Some(index) => index + 1,
        };
        assert!(result <= self.current);
        result
    }

    fn pure_cse(&mut self) -> Option<NodeId> {
        let id: NodeId = Id::new(self.current);
        let op = self.graph[id].op;
        let flags = self.graph[id].arith_flags;
        let child1 = self.canonicalize(self.graph[id].child1());
        let child2 = self.canonicalize(self.graph[id].child2());
        let child3 = self.canonicalize(self.graph[id].child3());

        let start = self.start_index();
        let mut index = self.end_index_for_pure_cse();
        while index > start {
            index -= 1;
            let other_id: NodeId = Id::new(index);
            let other = &self.graph[other_id];
            if other.op != op {
                continue;
            }
            if other.arith_flags != flags {
                continue;
            }

            let other_child = self.canonicalize(other.child1());
            let Some(other_child) = other_child else {
                return Some(other_id);
            };
            if Some(other_child) != child1 {
                continue;
            }

            let other_child = self.canonicalize(self.graph[other_id].child2());
            let Some(other_child) = other_child else {
                return Some(other_id);
            };
            if Some(other_child) != child2 {
                continue;
            }

            let other_child = self.canonicalize(self.graph[other_id].child3());
            let Some(other_child) = other_child else {
                return Some(other_id);
            };
            if Some(other_child) != child3 {
                continue;
            }

            return Some(other_id);
        }
        None
    }

    // ── Conditional purity ──────────────────────────────────────────

    fn is_predicted_numerical(&self, id: NodeId) -> bool {
        let node = &self.graph[id];
        let left = self.prediction_of(node.child1().expect("binary node"));
        let right = self.prediction_of(node.child2().expect("binary node"));
        left.is_number() && right.is_number()
    }

    fn logical_not_is_pure(&self, id: NodeId) -> bool {
        let prediction = self.prediction_of(self.graph[id].child1().expect("LogicalNot"));
        prediction.is_boolean() || prediction.is_empty()
    }

    fn by_val_is_pure(&self, id: NodeId) -> bool {
        let node = &self.graph[id];
        let base = self.prediction_of(node.child1().expect("by-val base"));
        let index = self.prediction_of(node.child2().expect("by-val index"));
        index.is_int32()
            && if matches!(node.op, Op::PutByVal | Op::PutByValAlias) {
                base.is_actionable_mutable_array()
            } else {
                base.is_actionable_array()
            }
    }

    /// Shared clobber classifier: unconditional flags first, then the
    /// prediction-dependent cases. An unhandled might-clobber opcode
    /// pessimizes rather than crashes in release.
    fn clobbers_world(&self, index: u32) -> bool {
        let id: NodeId = Id::new(index);
        let flags = self.graph[id].op.flags();
        if flags.contains(OpFlags::CLOBBERS_WORLD) {
            return true;
        }
        if !flags.contains(OpFlags::MIGHT_CLOBBER) {
            return false;
        }
        match self.graph[id].op {
            Op::ValueAdd
            | Op::CompareLess
            | Op::CompareLessEq
            | Op::CompareGreater
            | Op::CompareGreaterEq
            | Op::CompareEq => !self.is_predicted_numerical(id),
            Op::LogicalNot => !self.logical_not_is_pure(id),
            Op::GetByVal => !self.by_val_is_pure(id),
            op => {
                debug_assert!(false, "unhandled might-clobber opcode {op}");
                true
            }
        }
    }

    fn impure_cse(&mut self) -> Option<NodeId> {
        let id: NodeId = Id::new(self.current);
        let op = self.graph[id].op;
        let flags = self.graph[id].arith_flags;
        let child1 = self.canonicalize(self.graph[id].child1());
        let child2 = self.canonicalize(self.graph[id].child2());
        let child3 = self.canonicalize(self.graph[id].child3());

        let start = self.start_index();
        let mut index = self.current;
        while index > start {
            index -= 1;
            let other_id: NodeId = Id::new(index);
            if self.graph[other_id].op == op && self.graph[other_id].arith_flags == flags {
                let other_child = self.canonicalize(self.graph[other_id].child1());
                match other_child {
                    None => return Some(other_id),
                    Some(c) if Some(c) == child1 => {
                        let other_child = self.canonicalize(self.graph[other_id].child2());
                        match other_child {
                            None => return Some(other_id),
                            Some(c) if Some(c) == child2 => {
                                let other_child = self.canonicalize(self.graph[other_id].child3());
                                match other_child {
                                    None => return Some(other_id),
                                    Some(c) if Some(c) == child3 => return Some(other_id),
                                    _ => {}
                                }
                            }
                            _ => {}
                        }
                    }
                    _ => {}
                }
            }
            if self.clobbers_world(index) {
                break;
            }
        }
        None
    }

    // ── Specialized load eliminators ────────────────────────────────

    fn global_var_load_elimination(
        &mut self,
        var_number: u32,
        global_object: GlobalObjectId,
    ) -> Option<NodeId> {
        let start = self.start_index_for_children([None, None, None]);
        let mut index = self.current;
        while index > start {
            index -= 1;
            let id: NodeId = Id::new(index);
            let node = &self.graph[id];
            match node.op {
                Op::GetGlobalVar => {
                    if node.global_var_number() == var_number
                        && self.code_block.global_object_for(node.origin) == global_object
                    {
                        return Some(id);
                    }
                }
                Op::PutGlobalVar => {
                    if node.global_var_number() == var_number
                        && self.code_block.global_object_for(node.origin) == global_object
                    {
                        return node.child1();
                    }
                }
                _ => {}
            }
            if self.clobbers_world(index) {
                break;
            }
        }
        None
    }

    fn get_by_val_load_elimination(
        &mut self,
        child1: NodeId,
        child2: NodeId,
    ) -> Option<NodeId> {
        let start = self.start_index_for_children([Some(child1), Some(child2), None]);
        let mut index = self.current;
        while index > start {
            index -= 1;
            let id: NodeId = Id::new(index);
            match self.graph[id].op {
                Op::GetByVal => {
                    if !self.by_val_is_pure(id) {
                        return None;
                    }
                    if self.graph[id].child1() == Some(child1)
                        && self.canonicalize(self.graph[id].child2())
                            == self.canonicalize(Some(child2))
                    {
                        return Some(id);
                    }
                }
                Op::PutByVal | Op::PutByValAlias => {
                    if !self.by_val_is_pure(id) {
                        return None;
                    }
                    if self.graph[id].child1() == Some(child1)
                        && self.canonicalize(self.graph[id].child2())
                            == self.canonicalize(Some(child2))
                    {
                        return self.graph[id].child3();
                    }
                    // A store to unknown coordinates may hit the location
                    // we're loading from.
                    return None;
                }
                // An integer-indexed load cannot be affected by structure
                // changes or property-storage writes.
                Op::PutStructure | Op::PutByOffset => {}
                // A push cannot affect elements that already existed.
                Op::ArrayPush => {}
                _ => {
                    if self.clobbers_world(index) {
                        return None;
                    }
                }
            }
        }
        None
    }

    fn check_function_elimination(
        &mut self,
        function: crate::runtime::FunctionId,
        child1: NodeId,
    ) -> bool {
        let start = self.start_index_for_children([Some(child1), None, None]);
        let mut index = self.end_index_for_pure_cse();
        while index > start {
            index -= 1;
            let id: NodeId = Id::new(index);
            let node = &self.graph[id];
            if node.op == Op::CheckFunction
                && node.child1() == Some(child1)
                && node.function() == function
            {
                return true;
            }
        }
        false
    }

    fn check_structure_load_elimination(
        &mut self,
        structure_set: &crate::runtime::StructureSet,
        child1: NodeId,
    ) -> bool {
        let start = self.start_index_for_children([Some(child1), None, None]);
        let mut index = self.current;
        while index > start {
            index -= 1;
            let id: NodeId = Id::new(index);
            match self.graph[id].op {
                Op::CheckStructure => {
                    // The earlier check is at least as strong as this one.
                    if self.graph[id].child1() == Some(child1)
                        && structure_set.is_superset_of(self.graph[id].structure_set())
                    {
                        return true;
                    }
                }
                Op::PutStructure => {
                    let (previous, next) = self.graph[id].transition();
                    if self.graph[id].child1() == Some(child1) && structure_set.contains(next) {
                        return true;
                    }
                    if structure_set.contains(previous) {
                        return false;
                    }
                }
                // Setting a property cannot change the structure.
                Op::PutByOffset => {}
                Op::PutByVal | Op::PutByValAlias => {
                    if !self.by_val_is_pure(id) {
                        return false;
                    }
                    // An integer-indexed store cannot change the structure.
                }
                _ => {
                    if self.clobbers_world(index) {
                        return false;
                    }
                }
            }
        }
        false
    }

    fn get_by_offset_load_elimination(
        &mut self,
        identifier_number: u32,
        child1: NodeId,
    ) -> Option<NodeId> {
        let start = self.start_index_for_children([Some(child1), None, None]);
        let mut index = self.current;
        while index > start {
            index -= 1;
            let id: NodeId = Id::new(index);
            match self.graph[id].op {
                Op::GetByOffset => {
                    let access = self.graph[id].storage_access_index();
                    if self.graph[id].child1() == Some(child1)
                        && self.graph.storage_access_data[access as usize].identifier_number
                            == identifier_number
                    {
                        return Some(id);
                    }
                }
                Op::PutByOffset => {
                    let access = self.graph[id].storage_access_index();
                    if self.graph.storage_access_data[access as usize].identifier_number
                        == identifier_number
                    {
                        if self.graph[id].child2() == Some(child1) {
                            return self.graph[id].child3();
                        }
                        return None;
                    }
                }
                // Changing the structure cannot change a property's value.
                Op::PutStructure => {}
                Op::PutByVal | Op::PutByValAlias => {
                    if !self.by_val_is_pure(id) {
                        return None;
                    }
                }
                _ => {
                    if self.clobbers_world(index) {
                        return None;
                    }
                }
            }
        }
        None
    }

    fn get_property_storage_load_elimination(&mut self, child1: NodeId) -> Option<NodeId> {
        let start = self.start_index_for_children([Some(child1), None, None]);
        let mut index = self.current;
        while index > start {
            index -= 1;
            let id: NodeId = Id::new(index);
            match self.graph[id].op {
                Op::GetPropertyStorage => {
                    if self.graph[id].child1() == Some(child1) {
                        return Some(id);
                    }
                }
                // Neither a structure change nor a write through the storage
                // moves the storage pointer.
                Op::PutByOffset | Op::PutStructure => {}
                Op::PutByVal | Op::PutByValAlias => {
                    if !self.by_val_is_pure(id) {
                        return None;
                    }
                }
                _ => {
                    if self.clobbers_world(index) {
                        return None;
                    }
                }
            }
        }
        None
    }

    fn get_indexed_property_storage_load_elimination(
        &mut self,
        child1: NodeId,
        has_integer_index_prediction: bool,
    ) -> Option<NodeId> {
        let start = self.start_index_for_children([Some(child1), None, None]);
        let mut index = self.current;
        while index > start {
            index -= 1;
            let id: NodeId = Id::new(index);
            match self.graph[id].op {
                Op::GetIndexedPropertyStorage => {
                    let other_index = self.graph[id]
                        .child2()
                        .expect("GetIndexedPropertyStorage needs an index");
                    let prediction = self.prediction_of(other_index);
                    let other_has_integer_index =
                        prediction.is_empty() || prediction.intersects(Prediction::INT32);
                    if self.graph[id].child1() == Some(child1)
                        && has_integer_index_prediction == other_has_integer_index
                    {
                        return Some(id);
                    }
                }
                Op::PutByOffset | Op::PutStructure => {}
                // An alias store targets a location that already existed, so
                // the storage pointer is unchanged.
                Op::PutByValAlias => {}
                Op::PutByVal => {
                    let base = self.graph[id].child1().expect("PutByVal base");
                    if self.prediction_of(base).has_fixed_indexed_storage()
                        && self.by_val_is_pure(id)
                    {
                        continue;
                    }
                    return None;
                }
                _ => {
                    if self.clobbers_world(index) {
                        return None;
                    }
                }
            }
        }
        None
    }

    fn get_scope_chain_load_elimination(&mut self, depth: u32) -> Option<NodeId> {
        let start = self.start_index_for_children([None, None, None]);
        let mut index = self.end_index_for_pure_cse();
        while index > start {
            index -= 1;
            let id: NodeId = Id::new(index);
            let node = &self.graph[id];
            if node.op == Op::GetScopeChain && node.scope_chain_depth() == depth {
                return Some(id);
            }
        }
        None
    }

    // ── Rewrites ────────────────────────────────────────────────────

    /// Redirect every operand of the current node through the replacement
    /// table. Generating nodes take a reference on the substituted target.
    fn perform_substitution(&mut self, id: NodeId, add_ref: bool) {
        match self.graph[id].children {
            Children::Fixed(slots) => {
                for (slot, child) in slots.iter().enumerate() {
                    let Some(child) = child else { break };
                    let Some(replacement) = self.replacements[child.index()] else {
                        continue;
                    };
                    assert!(
                        self.replacements[replacement.index()].is_none(),
                        "replacement table must not chain"
                    );
                    self.graph[id].set_child(slot, Some(replacement));
                    if add_ref {
                        self.graph[replacement].add_ref();
                    }
                }
            }
            Children::Variable { first, count } => {
                for slot in first..first + count {
                    let child = self.graph.var_arg_children[slot as usize];
                    let Some(replacement) = self.replacements[child.index()] else {
                        continue;
                    };
                    assert!(
                        self.replacements[replacement.index()].is_none(),
                        "replacement table must not chain"
                    );
                    self.graph.var_arg_children[slot as usize] = replacement;
                    if add_ref {
                        self.graph[replacement].add_ref();
                    }
                }
            }
        }
    }

    fn set_replacement(&mut self, replacement: Option<NodeId>) {
        let Some(replacement) = replacement else {
            return;
        };
        let id: NodeId = Id::new(self.current);

        // Don't substitute when the predictions disagree; downstream
        // speculation decisions would silently change.
        if self.graph[id].prediction != self.graph[replacement].prediction {
            return;
        }

        trace!("cse: n{} -> n{}", self.current, replacement.index());
        self.graph[id].op = Op::Phantom;
        self.graph[id].set_ref_count(1);
        self.replacements[id.index()] = Some(replacement);
    }

    /// Drop a guard that a prior guard already covers. The node keeps its
    /// operand references but emits nothing.
    fn eliminate(&mut self) {
        let id: NodeId = Id::new(self.current);
        trace!("cse: eliminating n{}", self.current);
        assert_eq!(self.graph[id].ref_count(), 1);
        assert!(self.graph[id].must_generate());
        self.graph[id].op = Op::Phantom;
    }

    fn perform_node_cse(&mut self, index: u32) {
        let id: NodeId = Id::new(index);
        let should_generate = self.graph[id].should_generate();

        self.perform_substitution(id, should_generate);

        if !should_generate {
            return;
        }

        // Some nodes are deliberately left out even though they could be
        // matched (StrCat, ToPrimitive): there is no evidence deduplicating
        // them wins anything, so matching them is just wasted work.
        match self.graph[id].op {
            // Pure nodes, never any side effects.
            Op::BitAnd
            | Op::BitOr
            | Op::BitXor
            | Op::BitRShift
            | Op::BitLShift
            | Op::BitURShift
            | Op::ArithAdd
            | Op::ArithSub
            | Op::ArithMul
            | Op::ArithMod
            | Op::ArithDiv
            | Op::ArithAbs
            | Op::ArithMin
            | Op::ArithMax
            | Op::ArithSqrt
            | Op::GetByteArrayLength
            | Op::GetInt8ArrayLength
            | Op::GetInt16ArrayLength
            | Op::GetInt32ArrayLength
            | Op::GetUint8ArrayLength
            | Op::GetUint8ClampedArrayLength
            | Op::GetUint16ArrayLength
            | Op::GetUint32ArrayLength
            | Op::GetFloat32ArrayLength
            | Op::GetFloat64ArrayLength
            | Op::GetCallee
            | Op::GetStringLength
            | Op::StringCharAt
            | Op::StringCharCodeAt => {
                let replacement = self.pure_cse();
                self.set_replacement(replacement);
            }

            // Array length changes on any store to the array.
            Op::GetArrayLength => {
                let replacement = self.impure_cse();
                self.set_replacement(replacement);
            }

            Op::GetScopeChain => {
                let depth = self.graph[id].scope_chain_depth();
                let replacement = self.get_scope_chain_load_elimination(depth);
                self.set_replacement(replacement);
            }

            // Conditionally pure: only when the predictions keep the generic
            // paths (and their side effects) unreachable.
            Op::ValueAdd
            | Op::CompareLess
            | Op::CompareLessEq
            | Op::CompareGreater
            | Op::CompareGreaterEq
            | Op::CompareEq => {
                if self.is_predicted_numerical(id) {
                    if let Some(replacement) = self.pure_cse() {
                        if self.is_predicted_numerical(replacement) {
                            self.set_replacement(Some(replacement));
                        }
                    }
                }
            }

            Op::LogicalNot => {
                if self.logical_not_is_pure(id) {
                    if let Some(replacement) = self.pure_cse() {
                        if self.logical_not_is_pure(replacement) {
                            self.set_replacement(Some(replacement));
                        }
                    }
                }
            }

            // Heap accesses; eliminable under the subtler conditions the
            // dedicated walkers check.
            Op::GetGlobalVar => {
                let var_number = self.graph[id].global_var_number();
                let global = self.code_block.global_object_for(self.graph[id].origin);
                let replacement = self.global_var_load_elimination(var_number, global);
                self.set_replacement(replacement);
            }

            Op::GetByVal => {
                if self.by_val_is_pure(id) {
                    let base = self.graph[id].child1().expect("GetByVal base");
                    let key = self.graph[id].child2().expect("GetByVal index");
                    let replacement = self.get_by_val_load_elimination(base, key);
                    self.set_replacement(replacement);
                }
            }

            Op::PutByVal => {
                if self.by_val_is_pure(id) {
                    let base = self.graph[id].child1().expect("PutByVal base");
                    let key = self.graph[id].child2().expect("PutByVal index");
                    if self.get_by_val_load_elimination(base, key).is_some() {
                        // The target location was just read or written, so
                        // this store cannot be creating a new element.
                        self.graph[id].op = Op::PutByValAlias;
                    }
                }
            }

            Op::CheckStructure => {
                let set = self.graph[id].structure_set().clone();
                let base = self.graph[id].child1().expect("CheckStructure base");
                if self.check_structure_load_elimination(&set, base) {
                    self.eliminate();
                }
            }

            Op::CheckFunction => {
                let function = self.graph[id].function();
                let base = self.graph[id].child1().expect("CheckFunction base");
                if self.check_function_elimination(function, base) {
                    self.eliminate();
                }
            }

            Op::GetIndexedPropertyStorage => {
                let index_child = self.graph[id]
                    .child2()
                    .expect("GetIndexedPropertyStorage needs an index");
                let prediction = self.prediction_of(index_child);
                let has_integer_index =
                    prediction.is_empty() || prediction.intersects(Prediction::INT32);
                let base = self.graph[id].child1().expect("storage base");
                let replacement =
                    self.get_indexed_property_storage_load_elimination(base, has_integer_index);
                self.set_replacement(replacement);
            }

            Op::GetPropertyStorage => {
                let base = self.graph[id].child1().expect("storage base");
                let replacement = self.get_property_storage_load_elimination(base);
                self.set_replacement(replacement);
            }

            Op::GetByOffset => {
                let access = self.graph[id].storage_access_index();
                let identifier_number =
                    self.graph.storage_access_data[access as usize].identifier_number;
                let base = self.graph[id].child1().expect("GetByOffset base");
                let replacement = self.get_by_offset_load_elimination(identifier_number, base);
                self.set_replacement(replacement);
            }

            _ => {}
        }

        let op = self.graph[id].op;
        self.last_seen[op.index()] = Some(index);
    }

    fn perform_block_cse(&mut self, begin: u32, end: u32) {
        self.block_start = begin;
        for index in begin..end {
            self.current = index;
            self.perform_node_cse(index);
        }
    }

    fn local_cse(&mut self) {
        debug!("local CSE: begin");
        for block_index in 0..self.graph.blocks.len() {
            let block = &self.graph.blocks[block_index];
            let (begin, end) = (block.begin, block.end);
            self.perform_block_cse(begin, end);
        }
        debug!("local CSE: end");
    }

    // ─── Pass 5: virtual registers ──────────────────────────────────

    fn allocate_virtual_registers(&mut self) {
        debug!("virtual register allocation: begin");
        let mut scoreboard = ScoreBoard::new(&self.graph.preserved_locals);
        // Phi-region nodes past the last block never generate code here.
        let end = self.graph.blocks.last().map(|block| block.end).unwrap_or(0);
        for index in 0..end {
            let id: NodeId = Id::new(index);
            if !self.graph[id].should_generate() {
                continue;
            }

            // GetLocal children are phi references naming values from prior
            // blocks; their liveness is not ours to account. For everything
            // else, use the children first so a dying child's slot can be
            // reused by the node that killed it.
            if self.graph[id].op != Op::GetLocal {
                match self.graph[id].children {
                    Children::Fixed(slots) => {
                        for child in slots {
                            scoreboard.use_child(self.graph, child);
                        }
                    }
                    Children::Variable { first, count } => {
                        for slot in first..first + count {
                            let child = self.graph.var_arg_children[slot as usize];
                            scoreboard.use_node(self.graph, child);
                        }
                    }
                }
            }

            if !self.graph[id].has_result() {
                continue;
            }

            let register = scoreboard.allocate();
            self.graph[id].virtual_register = Some(register);
            // Must-generate nodes carry a synthetic self-reference; account
            // for it now.
            if self.graph[id].must_generate() {
                scoreboard.use_node(self.graph, id);
            }
        }

        // More temporaries may be needed than the unoptimized allocation
        // reserved; the watermark only ever rises.
        let callee_registers = scoreboard.high_watermark() + self.graph.parameter_slots;
        if self.code_block.num_callee_registers < callee_registers {
            self.code_block.num_callee_registers = callee_registers;
        }
        debug!(
            "virtual register allocation: end, {} callee registers",
            self.code_block.num_callee_registers
        );
    }

    // ─── Pass 6: global CFA ─────────────────────────────────────────

    fn perform_block_cfa(&mut self, state: &mut AbstractState, block_index: BlockIndex) {
        if !self.graph.blocks[block_index as usize].cfa_should_revisit {
            return;
        }
        trace!("cfa: block #{block_index}");
        state.begin_basic_block(self.graph, block_index);
        let block = &self.graph.blocks[block_index as usize];
        let (begin, end) = (block.begin, block.end);
        for index in begin..end {
            if !self.graph[Id::new(index)].should_generate() {
                continue;
            }
            if !state.execute(self.graph, self.code_block, index) {
                trace!("cfa: block #{block_index} unreachable past n{index}");
                break;
            }
        }
        trace!("cfa: {}", state.dump());
        self.changed |= state.end_basic_block(self.graph, MergeMode::MergeToSuccessors);
    }

    fn global_cfa(&mut self) {
        debug!("global CFA: begin");
        // A pseudo-worklist: blocks are visited in program order (nearly
        // topological), and the revisit flag stands in for queue membership.
        // Only loops cause revisits, proportionally to their depth.
        AbstractState::initialize(self.graph);
        let mut state = AbstractState::new(self.graph);
        loop {
            self.changed = false;
            for block_index in 0..self.graph.blocks.len() as BlockIndex {
                self.perform_block_cfa(&mut state, block_index);
            }
            if !self.changed {
                break;
            }
        }
        debug!("global CFA: end");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::runtime::{FunctionId, JsValue, StructureId, StructureSet};

    fn run(builder: GraphBuilder) -> (Graph, CodeBlock) {
        let (mut graph, mut code_block) = builder.finish();
        let global_data = GlobalData::new();
        propagate(&mut graph, &global_data, &mut code_block);
        (graph, code_block)
    }

    #[test]
    fn predicts_int32_for_add_of_two_int_locals() {
        let mut builder = GraphBuilder::new(3);
        builder.seed_local_prediction(0, Prediction::INT32);
        builder.seed_local_prediction(1, Prediction::INT32);
        let a = builder.get_local(0);
        let b = builder.get_local(1);
        let sum = builder.binary(Op::ValueAdd, a, b);
        builder.set_local(2, sum);
        let (graph, code_block) = run(builder);

        assert_eq!(graph[a].prediction, Prediction::INT32);
        assert_eq!(graph[b].prediction, Prediction::INT32);
        assert_eq!(graph[sum].prediction, Prediction::INT32);
        assert_eq!(graph[a].op, Op::GetLocal);
        assert_eq!(graph[sum].op, Op::ValueAdd);

        // Three allocations over two slots: the add reuses the slot its
        // dying operand vacated.
        let slot_a = graph[a].virtual_register.expect("a needs a register");
        let slot_b = graph[b].virtual_register.expect("b needs a register");
        let slot_sum = graph[sum].virtual_register.expect("sum needs a register");
        assert_ne!(slot_a, slot_b);
        assert_eq!(slot_sum, slot_a);
        assert_eq!(code_block.num_callee_registers, 2);
    }

    #[test]
    fn rewrites_length_of_array_to_dedicated_opcode() {
        let mut builder = GraphBuilder::new(2);
        builder.seed_local_prediction(0, Prediction::ARRAY);
        let a = builder.get_local(0);
        let length = builder.get_by_id(a, "length");
        builder.set_local(1, length);
        let (graph, _) = run(builder);

        assert_eq!(graph[length].op, Op::GetArrayLength);
        assert_eq!(graph[length].prediction, Prediction::INT32);
        // The must-generate obligation is gone; only the SetLocal use keeps
        // the node alive.
        assert_eq!(graph[length].ref_count(), 1);
    }

    #[test]
    fn rewrites_length_of_string_and_typed_arrays() {
        let mut builder = GraphBuilder::new(4);
        builder.seed_local_prediction(0, Prediction::STRING);
        builder.seed_local_prediction(1, Prediction::FLOAT64_ARRAY);
        let s = builder.get_local(0);
        let s_len = builder.get_by_id(s, "length");
        builder.set_local(2, s_len);
        let f = builder.get_local(1);
        let f_len = builder.get_by_id(f, "length");
        builder.set_local(3, f_len);
        let (graph, _) = run(builder);

        assert_eq!(graph[s_len].op, Op::GetStringLength);
        assert_eq!(graph[f_len].op, Op::GetFloat64ArrayLength);
    }

    #[test]
    fn eliminates_redundant_structure_check() {
        let mut builder = GraphBuilder::new(2);
        builder.seed_local_prediction(0, Prediction::FINAL_OBJECT);
        let x = builder.get_local(0);
        let first = builder.check_structure(x, StructureSet::single(StructureId(1)));
        let y = builder.get_local(1);
        builder.binary(Op::ArithAdd, y, y);
        let second = builder.check_structure(x, StructureSet::single(StructureId(1)));
        let (graph, _) = run(builder);

        assert_eq!(graph[first].op, Op::CheckStructure);
        assert_eq!(graph[second].op, Op::Phantom);
        assert_eq!(graph[second].ref_count(), 1);
    }

    #[test]
    fn structure_check_subsumption_is_directional() {
        // The earlier check admits more structures than the later one, so
        // the later check still filters and must survive.
        let mut builder = GraphBuilder::new(1);
        builder.seed_local_prediction(0, Prediction::FINAL_OBJECT);
        let x = builder.get_local(0);
        let wide = builder.check_structure(
            x,
            StructureSet::new(vec![StructureId(1), StructureId(2)]),
        );
        let narrow = builder.check_structure(x, StructureSet::single(StructureId(1)));
        let (graph, _) = run(builder);

        assert_eq!(graph[wide].op, Op::CheckStructure);
        assert_eq!(graph[narrow].op, Op::CheckStructure);
    }

    #[test]
    fn structure_transition_validates_and_invalidates_checks() {
        let mut builder = GraphBuilder::new(1);
        builder.seed_local_prediction(0, Prediction::FINAL_OBJECT);
        let x = builder.get_local(0);
        builder.check_structure(x, StructureSet::single(StructureId(1)));
        builder.put_structure(x, StructureId(1), StructureId(2));
        // Covered by the transition's new structure.
        let covered = builder.check_structure(x, StructureSet::single(StructureId(2)));
        // Not covered: the object left structure 1.
        let stale = builder.check_structure(x, StructureSet::single(StructureId(1)));
        let (graph, _) = run(builder);

        assert_eq!(graph[covered].op, Op::Phantom);
        assert_eq!(graph[stale].op, Op::CheckStructure);
    }

    #[test]
    fn forwards_load_across_store_to_different_identifier() {
        let mut builder = GraphBuilder::new(3);
        builder.seed_local_prediction(0, Prediction::FINAL_OBJECT);
        let obj = builder.get_local(0);
        let storage = builder.get_property_storage(obj);
        let v1 = builder.get_by_offset(obj, Some(storage), "a", 0);
        let val = builder.js_constant(JsValue::Int32(9));
        builder.put_by_offset(storage, obj, val, "b", 8);
        let v2 = builder.get_by_offset(obj, Some(storage), "a", 0);
        let user = builder.set_local(1, v2);
        let (graph, _) = run(builder);

        assert_eq!(graph[v1].op, Op::GetByOffset);
        assert_eq!(graph[v2].op, Op::Phantom);
        // The consumer now reads the first load directly.
        assert_eq!(graph[user].child1(), Some(v1));
    }

    #[test]
    fn store_forwarding_requires_matching_predictions() {
        let mut builder = GraphBuilder::new(3);
        builder.seed_local_prediction(0, Prediction::FINAL_OBJECT);
        let obj = builder.get_local(0);
        let storage = builder.get_property_storage(obj);
        let val = builder.js_constant(JsValue::Int32(9));
        builder.put_by_offset(storage, obj, val, "a", 0);
        let load = builder.get_by_offset(obj, Some(storage), "a", 0);
        let user = builder.set_local(1, load);
        let (graph, _) = run(builder);

        // The walker finds the store and would forward the stored value, but
        // the load has no prediction (no heap hint) while the constant
        // predicts Int32; the prediction guard rejects the substitution and
        // the load survives.
        assert_eq!(graph[load].op, Op::GetByOffset);
        assert_eq!(graph[user].child1(), Some(load));
    }

    #[test]
    fn call_between_indexed_loads_blocks_elimination() {
        let mut builder = GraphBuilder::new(4);
        builder.seed_local_prediction(0, Prediction::ARRAY);
        builder.seed_local_prediction(1, Prediction::INT32);
        let a = builder.get_local(0);
        let i = builder.get_local(1);
        let v1 = builder.get_by_val(a, i);
        builder.set_local(2, v1);
        builder.call(&[a]);
        let v2 = builder.get_by_val(a, i);
        builder.set_local(3, v2);
        let (graph, _) = run(builder);

        assert_eq!(graph[v1].op, Op::GetByVal);
        assert_eq!(graph[v2].op, Op::GetByVal);
    }

    #[test]
    fn indexed_load_is_eliminated_without_intervening_clobber() {
        let mut builder = GraphBuilder::new(4);
        builder.seed_local_prediction(0, Prediction::ARRAY);
        builder.seed_local_prediction(1, Prediction::INT32);
        let a = builder.get_local(0);
        let i = builder.get_local(1);
        let v1 = builder.get_by_val(a, i);
        builder.set_local(2, v1);
        let v2 = builder.get_by_val(a, i);
        let user = builder.set_local(3, v2);
        let (graph, _) = run(builder);

        assert_eq!(graph[v2].op, Op::Phantom);
        assert_eq!(graph[user].child1(), Some(v1));
    }

    #[test]
    fn matching_store_after_load_becomes_alias() {
        let mut builder = GraphBuilder::new(3);
        builder.seed_local_prediction(0, Prediction::ARRAY);
        builder.seed_local_prediction(1, Prediction::INT32);
        let a = builder.get_local(0);
        let i = builder.get_local(1);
        let v1 = builder.get_by_val(a, i);
        builder.set_local(2, v1);
        let val = builder.js_constant(JsValue::Int32(3));
        let store = builder.put_by_val(a, i, val);
        let (graph, _) = run(builder);

        assert_eq!(graph[store].op, Op::PutByValAlias);
    }

    #[test]
    fn double_voting_flips_local_to_double_format() {
        let mut builder = GraphBuilder::new(5);
        builder.seed_local_prediction(0, Prediction::INT32);
        builder.seed_local_prediction(2, Prediction::DOUBLE);
        let x = builder.get_local(0);
        let sqrt = builder.unary(Op::ArithSqrt, x);
        builder.set_local(1, sqrt);
        let x2 = builder.get_local(0);
        let d = builder.get_local(2);
        let add = builder.binary(Op::ArithAdd, x2, d);
        builder.set_local(3, add);
        let (graph, _) = run(builder);

        let variable = graph[x].variable();
        assert!(graph.variables.should_use_double_format(variable));
        // The flip feeds the next propagation round: loads of the local now
        // predict double as well.
        assert!(graph[x].prediction.contains(Prediction::DOUBLE));
        assert!(graph[x].prediction.contains(Prediction::INT32));
    }

    #[test]
    fn int_only_local_keeps_value_format() {
        let mut builder = GraphBuilder::new(3);
        builder.seed_local_prediction(0, Prediction::INT32);
        builder.seed_local_prediction(1, Prediction::INT32);
        let a = builder.get_local(0);
        let b = builder.get_local(1);
        let sum = builder.binary(Op::ArithAdd, a, b);
        builder.set_local(2, sum);
        let (graph, _) = run(builder);

        assert!(!graph.variables.should_use_double_format(graph[a].variable()));
        assert!(!graph.variables.should_use_double_format(graph[b].variable()));
    }

    #[test]
    fn overflow_evidence_forbids_integer_speculation() {
        let mut builder = GraphBuilder::new(3);
        builder.seed_local_prediction(0, Prediction::INT32);
        builder.seed_local_prediction(1, Prediction::INT32);
        builder.add_overflow_site(7);
        let a = builder.get_local(0);
        let b = builder.get_local(1);
        builder.set_origin(7);
        let sum = builder.binary(Op::ArithAdd, a, b);
        builder.set_origin(8);
        builder.set_local(2, sum);
        let (graph, _) = run(builder);

        assert!(graph[sum].arith_flags.contains(ArithFlags::MAY_OVERFLOW));
        assert_eq!(graph[sum].prediction, Prediction::DOUBLE);
    }

    #[test]
    fn multiply_forces_full_number_flags_onto_operands() {
        let mut builder = GraphBuilder::new(3);
        let a = builder.get_local(0);
        let b = builder.get_local(1);
        let product = builder.binary(Op::ArithMul, a, b);
        builder.set_local(2, product);
        let (graph, _) = run(builder);

        let full = ArithFlags::USED_AS_NUMBER | ArithFlags::NEEDS_NEG_ZERO;
        assert!(graph[a].arith_flags.contains(full));
        assert!(graph[b].arith_flags.contains(full));
    }

    #[test]
    fn abs_strips_negative_zero_demand_from_its_operand() {
        let mut builder = GraphBuilder::new(2);
        let x = builder.get_local(0);
        let abs = builder.unary(Op::ArithAbs, x);
        builder.set_local(1, abs);
        let (graph, _) = run(builder);

        assert!(graph[abs]
            .arith_flags
            .contains(ArithFlags::NEEDS_NEG_ZERO));
        assert!(graph[x].arith_flags.contains(ArithFlags::USED_AS_NUMBER));
        assert!(!graph[x].arith_flags.contains(ArithFlags::NEEDS_NEG_ZERO));
    }

    #[test]
    fn adding_a_nonzero_constant_strips_negative_zero_demand() {
        let mut builder = GraphBuilder::new(2);
        builder.seed_local_prediction(0, Prediction::INT32);
        let x = builder.get_local(0);
        let one = builder.js_constant(JsValue::Int32(1));
        let sum = builder.binary(Op::ArithAdd, x, one);
        builder.set_local(1, sum);
        let (graph, _) = run(builder);

        assert!(!graph[x].arith_flags.contains(ArithFlags::NEEDS_NEG_ZERO));
        assert!(graph[x].arith_flags.contains(ArithFlags::USED_AS_NUMBER));
    }

    #[test]
    fn pure_cse_strips_int32_conversion_wrappers() {
        let mut builder = GraphBuilder::new(4);
        builder.seed_local_prediction(0, Prediction::INT32);
        builder.seed_local_prediction(1, Prediction::INT32);
        let x = builder.get_local(0);
        let y = builder.get_local(1);
        let first = builder.binary(Op::BitAnd, x, y);
        builder.set_local(2, first);
        let wrapped = builder.unary(Op::ValueToInt32, x);
        let second = builder.binary(Op::BitAnd, wrapped, y);
        let user = builder.set_local(3, second);
        let (graph, _) = run(builder);

        assert_eq!(graph[second].op, Op::Phantom);
        assert_eq!(graph[user].child1(), Some(first));
    }

    #[test]
    fn cse_stays_within_the_basic_block() {
        let mut builder = GraphBuilder::new(3);
        builder.seed_local_prediction(0, Prediction::INT32);
        builder.seed_local_prediction(1, Prediction::INT32);
        let x = builder.get_local(0);
        let y = builder.get_local(1);
        let first = builder.binary(Op::BitAnd, x, y);
        builder.set_local(2, first);
        builder.jump(1);
        builder.end_block();
        let x2 = builder.get_local(0);
        let y2 = builder.get_local(1);
        let again = builder.binary(Op::BitAnd, x2, y2);
        builder.set_local(2, again);
        builder.ret(None);
        let (graph, _) = run(builder);

        assert_eq!(graph[first].op, Op::BitAnd);
        assert_eq!(graph[again].op, Op::BitAnd);
    }

    #[test]
    fn replacements_never_chain() {
        let mut builder = GraphBuilder::new(4);
        builder.seed_local_prediction(0, Prediction::INT32);
        builder.seed_local_prediction(1, Prediction::INT32);
        let x = builder.get_local(0);
        let y = builder.get_local(1);
        let e1 = builder.binary(Op::BitXor, x, y);
        builder.set_local(2, e1);
        let e2 = builder.binary(Op::BitXor, x, y);
        let u2 = builder.set_local(3, e2);
        let e3 = builder.binary(Op::BitXor, x, y);
        let u3 = builder.set_local(3, e3);
        let (graph, _) = run(builder);

        assert_eq!(graph[e2].op, Op::Phantom);
        assert_eq!(graph[e3].op, Op::Phantom);
        // Both duplicates resolve straight to the first occurrence, not to
        // each other.
        assert_eq!(graph[u2].child1(), Some(e1));
        assert_eq!(graph[u3].child1(), Some(e1));
    }

    #[test]
    fn scope_chain_and_function_guard_deduplication() {
        let mut builder = GraphBuilder::new(2);
        builder.seed_local_prediction(0, Prediction::FUNCTION);
        let scope1 = builder.get_scope_chain(0);
        builder.set_local(1, scope1);
        let scope2 = builder.get_scope_chain(0);
        builder.set_local(1, scope2);
        let deep = builder.get_scope_chain(2);
        builder.set_local(1, deep);
        let f = builder.get_local(0);
        builder.check_function(f, FunctionId(4));
        let guard2 = builder.check_function(f, FunctionId(4));
        let other = builder.check_function(f, FunctionId(5));
        let (graph, _) = run(builder);

        assert_eq!(graph[scope2].op, Op::Phantom);
        assert_eq!(graph[deep].op, Op::GetScopeChain);
        assert_eq!(graph[guard2].op, Op::Phantom);
        assert_eq!(graph[other].op, Op::CheckFunction);
    }

    #[test]
    fn global_var_load_elimination_respects_stores_and_globals() {
        let mut builder = GraphBuilder::new(3);
        let g1 = builder.get_global_var(4);
        builder.set_local(0, g1);
        let g2 = builder.get_global_var(4);
        let user = builder.set_local(1, g2);
        let val = builder.js_constant(JsValue::Int32(1));
        builder.put_global_var(4, val);
        let g3 = builder.get_global_var(4);
        let forwarded = builder.set_local(2, g3);
        let (graph, _) = run(builder);

        assert_eq!(graph[g2].op, Op::Phantom);
        assert_eq!(graph[user].child1(), Some(g1));
        // The load after the store forwards the stored value (predictions
        // agree: both Int32 via the global prediction table).
        assert_eq!(graph[g3].op, Op::Phantom);
        assert_eq!(graph[forwarded].child1(), Some(val));
    }

    #[test]
    fn nonintegral_index_demotes_indexed_storage_to_nop() {
        let mut builder = GraphBuilder::new(3);
        builder.seed_local_prediction(0, Prediction::ARRAY);
        builder.seed_local_prediction(1, Prediction::STRING);
        let a = builder.get_local(0);
        let i = builder.get_local(1);
        let storage = builder.get_indexed_property_storage(a, i);
        let load = builder.raw(
            Op::GetByVal,
            &[a, i, storage],
            crate::graph::Payload::None,
        );
        builder.set_local(2, load);
        let (graph, _) = run(builder);

        assert_eq!(graph[storage].op, Op::Nop);
        assert_eq!(graph[storage].ref_count(), 0);
        assert_eq!(graph[storage].child1(), None);
        // The consumer's auxiliary operand slot was cleared by fixup.
        assert_eq!(graph[load].child3(), None);
        assert_eq!(graph[load].op, Op::GetByVal);
    }

    #[test]
    fn cfa_skips_blocks_no_edge_reaches() {
        let mut builder = GraphBuilder::new(1);
        builder.jump(2);
        builder.end_block();
        // Nothing targets this block.
        builder.ret(None);
        builder.end_block();
        builder.ret(None);
        let (graph, _) = run(builder);

        assert!(graph.blocks[0].cfa_has_visited);
        assert!(!graph.blocks[1].cfa_has_visited);
        assert!(graph.blocks[2].cfa_has_visited);
    }

    #[test]
    fn cfa_reaches_a_loop_fixpoint() {
        let mut builder = GraphBuilder::new(2);
        builder.seed_local_prediction(0, Prediction::INT32);
        builder.seed_local_prediction(1, Prediction::BOOLEAN);
        let x = builder.get_local(0);
        builder.set_local(0, x);
        builder.jump(1);
        builder.end_block();
        // Loop body: keeps local 0 live and branches back or out.
        let x2 = builder.get_local(0);
        builder.set_local(0, x2);
        let cond = builder.get_local(1);
        builder.branch(cond, 1, 2);
        builder.end_block();
        builder.ret(None);
        let (graph, _) = run(builder);

        assert!(graph.blocks[1].cfa_has_visited);
        assert!(graph.blocks[2].cfa_has_visited);
        assert!(!graph.blocks[1].cfa_should_revisit);
    }

    #[test]
    fn predictions_and_flags_only_grow_across_a_second_run() {
        let mut builder = GraphBuilder::new(3);
        builder.seed_local_prediction(0, Prediction::ARRAY);
        builder.seed_local_prediction(1, Prediction::INT32);
        let a = builder.get_local(0);
        let i = builder.get_local(1);
        let v1 = builder.get_by_val(a, i);
        builder.set_local(2, v1);
        let length = builder.get_by_id(a, "length");
        builder.set_local(2, length);
        let (mut graph, mut code_block) = builder.finish();
        let global_data = GlobalData::new();
        propagate(&mut graph, &global_data, &mut code_block);

        let before: Vec<(Prediction, ArithFlags)> = graph
            .node_ids()
            .map(|id| (graph[id].prediction, graph[id].arith_flags))
            .collect();
        propagate(&mut graph, &global_data, &mut code_block);
        for (id, (prediction, flags)) in graph.node_ids().zip(before) {
            assert!(graph[id].prediction.contains(prediction));
            assert!(graph[id].arith_flags.contains(flags));
        }
    }

    #[test]
    fn pipeline_is_idempotent() {
        let mut builder = GraphBuilder::new(4);
        builder.seed_local_prediction(0, Prediction::ARRAY);
        builder.seed_local_prediction(1, Prediction::INT32);
        builder.seed_local_prediction(2, Prediction::FINAL_OBJECT);
        let a = builder.get_local(0);
        let i = builder.get_local(1);
        let v1 = builder.get_by_val(a, i);
        builder.set_local(3, v1);
        let v2 = builder.get_by_val(a, i);
        builder.set_local(3, v2);
        let length = builder.get_by_id(a, "length");
        builder.set_local(3, length);
        let obj = builder.get_local(2);
        builder.check_structure(obj, StructureSet::single(StructureId(8)));
        builder.check_structure(obj, StructureSet::single(StructureId(8)));
        let (mut graph, mut code_block) = builder.finish();
        let global_data = GlobalData::new();

        propagate(&mut graph, &global_data, &mut code_block);
        let first = graph.display(&code_block).to_string();
        let first_registers = code_block.num_callee_registers;
        propagate(&mut graph, &global_data, &mut code_block);
        let second = graph.display(&code_block).to_string();

        assert_eq!(first, second);
        assert_eq!(first_registers, code_block.num_callee_registers);
    }
}
