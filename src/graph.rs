//! The data-flow graph.
//!
//! A graph is an append-only arena of [`Node`]s partitioned into basic blocks
//! by index range. Nodes reference each other by [`NodeId`] only, never by
//! pointer, so rewriting an operand is a table write and the arena never
//! reallocates behind a borrow. Nodes are never removed or reordered: dead
//! nodes are demoted to `Phantom` (kept for reference integrity) or `Nop`
//! (fully dead).
//!
//! [`GraphBuilder`] maintains the construction invariants (reference counts,
//! packed child slots, block ranges) for tests and tooling; the real frontend
//! lives outside this crate.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use crate::abstract_state::AbstractValue;
use crate::opcode::{ArithFlags, Op};
use crate::prediction::Prediction;
use crate::runtime::{
    CodeBlock, CodeOrigin, FunctionId, GlobalObjectId, JsValue, StructureId, StructureSet,
};
use crate::variables::{VariableId, VariablePool};

// ─── Arena and ID types ─────────────────────────────────────────────────────

/// Typed index into an [`Arena`]. Equality and hashing depend only on the
/// index, not on `T`, hence the manual impls.
pub struct Id<T> {
    index: u32,
    _phantom: PhantomData<T>,
}

impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Id<T> {}

impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Id<T> {}

impl<T> std::hash::Hash for Id<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<T> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index)
    }
}

impl<T> Id<T> {
    pub(crate) fn new(index: u32) -> Self {
        Self {
            index,
            _phantom: PhantomData,
        }
    }

    /// The raw index into the arena.
    pub fn index(self) -> usize {
        self.index as usize
    }
}

/// Vec-backed arena with typed indexing via [`Id`].
#[derive(Debug)]
pub struct Arena<T> {
    items: Vec<T>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T> Arena<T> {
    pub fn push(&mut self, item: T) -> Id<T> {
        let id = Id::new(self.items.len() as u32);
        self.items.push(item);
        id
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Id<T>, &T)> {
        self.items
            .iter()
            .enumerate()
            .map(|(i, item)| (Id::new(i as u32), item))
    }
}

impl<T> std::ops::Index<Id<T>> for Arena<T> {
    type Output = T;
    fn index(&self, id: Id<T>) -> &T {
        &self.items[id.index()]
    }
}

impl<T> std::ops::IndexMut<Id<T>> for Arena<T> {
    fn index_mut(&mut self, id: Id<T>) -> &mut T {
        &mut self.items[id.index()]
    }
}

pub type NodeId = Id<Node>;

/// Index of a basic block in [`Graph::blocks`].
pub type BlockIndex = u32;

/// A slot in the callee register file, assigned by register allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualRegister(pub u32);

impl fmt::Display for VirtualRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

// ─── Children ───────────────────────────────────────────────────────────────

/// A node's operands: up to three fixed slots, or a slice into the graph's
/// var-args pool for opcodes flagged `HAS_VAR_ARGS`.
///
/// Fixed slots are packed: a `None` slot implies all later slots are `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Children {
    Fixed([Option<NodeId>; 3]),
    Variable { first: u32, count: u32 },
}

// ─── Payload ────────────────────────────────────────────────────────────────

/// Per-opcode immediate data.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    None,
    /// Index into the code block's constant pool.
    Constant(u32),
    /// Handle into the graph's variable-access pool.
    Variable(VariableId),
    /// Identifier number in the code block's identifier table.
    Identifier(u32),
    GlobalVar(u32),
    ScopedVar { depth: u32, slot: u32 },
    ScopeChain { depth: u32 },
    /// Index into [`Graph::storage_access_data`].
    StorageAccess(u32),
    /// The structures a `CheckStructure` admits.
    Structures(StructureSet),
    /// A `PutStructure` transition record.
    Transition {
        previous: StructureId,
        next: StructureId,
    },
    Function(FunctionId),
    Jump { target: BlockIndex },
    Branch {
        taken: BlockIndex,
        not_taken: BlockIndex,
    },
}

/// Field-offset metadata shared by `GetByOffset`/`PutByOffset` nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageAccessData {
    pub identifier_number: u32,
    pub offset: u32,
}

// ─── Node ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Node {
    pub op: Op,
    pub children: Children,
    pub payload: Payload,
    pub origin: CodeOrigin,
    pub prediction: Prediction,
    pub arith_flags: ArithFlags,
    /// Result-type hint attached by the external profiler; empty if absent.
    pub heap_prediction: Prediction,
    ref_count: u32,
    pub virtual_register: Option<VirtualRegister>,
}

impl Node {
    pub fn has_result(&self) -> bool {
        self.op.has_result()
    }

    pub fn must_generate(&self) -> bool {
        self.op.must_generate()
    }

    /// A node with no remaining references produces no code.
    pub fn should_generate(&self) -> bool {
        self.ref_count > 0
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn set_ref_count(&mut self, count: u32) {
        self.ref_count = count;
    }

    pub fn add_ref(&mut self) {
        self.ref_count += 1;
    }

    /// Drop one reference. Returns true when this was the last one.
    pub fn deref(&mut self) -> bool {
        assert!(self.ref_count > 0, "deref of dead {} node", self.op);
        self.ref_count -= 1;
        self.ref_count == 0
    }

    // ── Fixed-child accessors ───────────────────────────────────────

    fn fixed(&self) -> &[Option<NodeId>; 3] {
        match &self.children {
            Children::Fixed(slots) => slots,
            Children::Variable { .. } => {
                panic!("fixed-child access on var-args {} node", self.op)
            }
        }
    }

    pub fn child1(&self) -> Option<NodeId> {
        self.fixed()[0]
    }

    pub fn child2(&self) -> Option<NodeId> {
        self.fixed()[1]
    }

    pub fn child3(&self) -> Option<NodeId> {
        self.fixed()[2]
    }

    pub fn set_child(&mut self, slot: usize, child: Option<NodeId>) {
        match &mut self.children {
            Children::Fixed(slots) => slots[slot] = child,
            Children::Variable { .. } => {
                panic!("fixed-child write on var-args {} node", self.op)
            }
        }
    }

    /// Join a prediction. Returns whether it grew.
    pub fn predict(&mut self, prediction: Prediction) -> bool {
        let old = self.prediction;
        self.prediction |= prediction;
        self.prediction != old
    }

    /// Join arithmetic use flags. Returns whether they grew.
    pub fn merge_arith_flags(&mut self, flags: ArithFlags) -> bool {
        let old = self.arith_flags;
        self.arith_flags |= flags;
        self.arith_flags != old
    }

    // ── Payload accessors ───────────────────────────────────────────

    pub fn constant_index(&self) -> u32 {
        match self.payload {
            Payload::Constant(index) => index,
            _ => panic!("{} node has no constant payload", self.op),
        }
    }

    pub fn variable(&self) -> VariableId {
        match self.payload {
            Payload::Variable(id) => id,
            _ => panic!("{} node has no variable payload", self.op),
        }
    }

    pub fn identifier_number(&self) -> u32 {
        match self.payload {
            Payload::Identifier(number) => number,
            _ => panic!("{} node has no identifier payload", self.op),
        }
    }

    pub fn global_var_number(&self) -> u32 {
        match self.payload {
            Payload::GlobalVar(number) => number,
            _ => panic!("{} node has no global-var payload", self.op),
        }
    }

    pub fn scope_chain_depth(&self) -> u32 {
        match self.payload {
            Payload::ScopeChain { depth } => depth,
            _ => panic!("{} node has no scope-chain payload", self.op),
        }
    }

    pub fn storage_access_index(&self) -> u32 {
        match self.payload {
            Payload::StorageAccess(index) => index,
            _ => panic!("{} node has no storage-access payload", self.op),
        }
    }

    pub fn structure_set(&self) -> &StructureSet {
        match &self.payload {
            Payload::Structures(set) => set,
            _ => panic!("{} node has no structure-set payload", self.op),
        }
    }

    pub fn transition(&self) -> (StructureId, StructureId) {
        match self.payload {
            Payload::Transition { previous, next } => (previous, next),
            _ => panic!("{} node has no transition payload", self.op),
        }
    }

    pub fn function(&self) -> FunctionId {
        match self.payload {
            Payload::Function(function) => function,
            _ => panic!("{} node has no function payload", self.op),
        }
    }
}

// ─── Basic block ────────────────────────────────────────────────────────────

/// A half-open node index range `[begin, end)`, plus the control-flow
/// analysis state attached to it.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub begin: u32,
    pub end: u32,
    pub cfa_should_revisit: bool,
    pub cfa_has_visited: bool,
    /// Per-local abstract values at block entry.
    pub values_at_head: Vec<AbstractValue>,
    /// Per-local abstract values at block exit.
    pub values_at_tail: Vec<AbstractValue>,
}

// ─── Graph ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct Graph {
    nodes: Arena<Node>,
    pub blocks: Vec<BasicBlock>,
    /// Operand pool for var-args nodes.
    pub var_arg_children: Vec<NodeId>,
    pub variables: VariablePool,
    pub storage_access_data: Vec<StorageAccessData>,
    /// Locals that stay live for the whole function; their register slots
    /// are never recycled.
    pub preserved_locals: BTreeSet<u32>,
    pub parameter_slots: u32,
    pub num_locals: u32,
    global_var_predictions: HashMap<u32, Prediction>,
}

impl std::ops::Index<NodeId> for Graph {
    type Output = Node;
    fn index(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }
}

impl std::ops::IndexMut<NodeId> for Graph {
    fn index_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }
}

impl Graph {
    pub fn size(&self) -> u32 {
        self.nodes.len() as u32
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len() as u32).map(Id::new)
    }

    pub(crate) fn append(&mut self, node: Node) -> NodeId {
        self.nodes.push(node)
    }

    /// All operands of a node, in slot order. Fixed slots stop at the first
    /// empty one (slots are packed).
    pub fn child_ids(&self, id: NodeId) -> Vec<NodeId> {
        match self.nodes[id].children {
            Children::Fixed(slots) => slots.iter().map_while(|c| *c).collect(),
            Children::Variable { first, count } => {
                self.var_arg_children[first as usize..(first + count) as usize].to_vec()
            }
        }
    }

    // ── Constants ───────────────────────────────────────────────────

    pub fn is_js_constant(&self, id: NodeId) -> bool {
        matches!(self.nodes[id].op, Op::JsConstant | Op::WeakJsConstant)
    }

    pub fn value_of_js_constant<'a>(&self, code_block: &'a CodeBlock, id: NodeId) -> &'a JsValue {
        code_block.constant(self.nodes[id].constant_index())
    }

    pub fn is_number_constant(&self, code_block: &CodeBlock, id: NodeId) -> bool {
        self.is_js_constant(id) && self.value_of_js_constant(code_block, id).is_number()
    }

    pub fn value_of_number_constant(&self, code_block: &CodeBlock, id: NodeId) -> f64 {
        self.value_of_js_constant(code_block, id).as_number()
    }

    // ── Speculation heuristics ──────────────────────────────────────

    /// Whether an addition-shaped node (`ValueAdd`, `ArithAdd`, `ArithSub`)
    /// should speculate an int32 result: both operands must speculate int32
    /// (an int32-representable immediate also qualifies) and the node's own
    /// flag use must permit it.
    pub fn add_should_speculate_integer(&self, code_block: &CodeBlock, id: NodeId) -> bool {
        let node = &self.nodes[id];
        debug_assert!(matches!(
            node.op,
            Op::ValueAdd | Op::ArithAdd | Op::ArithSub
        ));
        let left = node.child1().expect("addition must have a left operand");
        let right = node.child2().expect("addition must have a right operand");

        if self.is_number_constant(code_block, left) {
            return self.add_immediate_should_speculate_integer(code_block, id, right, left);
        }
        if self.is_number_constant(code_block, right) {
            return self.add_immediate_should_speculate_integer(code_block, id, left, right);
        }
        self.nodes[left].prediction.is_int32()
            && self.nodes[right].prediction.is_int32()
            && node.arith_flags.can_speculate_integer()
    }

    fn add_immediate_should_speculate_integer(
        &self,
        code_block: &CodeBlock,
        id: NodeId,
        variable: NodeId,
        immediate: NodeId,
    ) -> bool {
        self.value_of_js_constant(code_block, immediate).is_int32()
            && self.nodes[variable].prediction.is_int32()
            && self.nodes[id].arith_flags.can_speculate_integer()
    }

    // ── Global variable predictions ─────────────────────────────────

    pub fn predict_global_var(&mut self, var_number: u32, prediction: Prediction) -> bool {
        let slot = self
            .global_var_predictions
            .entry(var_number)
            .or_insert(Prediction::empty());
        let old = *slot;
        *slot |= prediction;
        *slot != old
    }

    pub fn global_var_prediction(&self, var_number: u32) -> Prediction {
        self.global_var_predictions
            .get(&var_number)
            .copied()
            .unwrap_or(Prediction::empty())
    }

    // ── Reference counting ──────────────────────────────────────────

    /// Drop one reference; when it was the last, release the node's operands
    /// as well.
    pub fn deref(&mut self, id: NodeId) {
        if self.nodes[id].deref() {
            for child in self.child_ids(id) {
                self.deref(child);
            }
        }
    }

    /// Empty a fixed child slot, releasing the reference it held.
    pub fn clear_and_deref_child(&mut self, id: NodeId, slot: usize) {
        let Some(child) = self.nodes[id].fixed()[slot] else {
            return;
        };
        self.nodes[id].set_child(slot, None);
        self.deref(child);
    }

    // ── Control flow ────────────────────────────────────────────────

    /// Successor blocks, read off the block's terminal node.
    pub fn successors(&self, block_index: BlockIndex) -> Vec<BlockIndex> {
        let block = &self.blocks[block_index as usize];
        assert!(block.end > block.begin, "empty basic block #{block_index}");
        let terminal = &self.nodes[Id::new(block.end - 1)];
        match terminal.payload {
            Payload::Jump { target } => vec![target],
            Payload::Branch { taken, not_taken } => vec![taken, not_taken],
            _ => Vec::new(),
        }
    }

    /// The block containing a node index, if any (phi-region nodes past the
    /// last block have none).
    pub fn block_of(&self, index: u32) -> Option<BlockIndex> {
        self.blocks
            .iter()
            .position(|b| b.begin <= index && index < b.end)
            .map(|i| i as BlockIndex)
    }

    pub fn display<'a>(&'a self, code_block: &'a CodeBlock) -> GraphDisplay<'a> {
        GraphDisplay {
            graph: self,
            code_block,
        }
    }
}

// ─── Builder ────────────────────────────────────────────────────────────────

/// Constructs graphs while maintaining reference counts, block ranges, and
/// variable-access unification. Test and tooling surface; the bytecode
/// frontend is external to this crate.
pub struct GraphBuilder {
    graph: Graph,
    code_block: CodeBlock,
    current_origin: CodeOrigin,
    block_start: u32,
    locals: HashMap<u32, VariableId>,
}

impl GraphBuilder {
    pub fn new(num_locals: u32) -> Self {
        GraphBuilder {
            graph: Graph {
                num_locals,
                ..Graph::default()
            },
            code_block: CodeBlock::new(),
            current_origin: 0,
            block_start: 0,
            locals: HashMap::new(),
        }
    }

    pub fn set_origin(&mut self, origin: CodeOrigin) {
        self.current_origin = origin;
    }

    /// The unified variable-access descriptor for a local.
    pub fn local(&mut self, operand: u32) -> VariableId {
        if let Some(&id) = self.locals.get(&operand) {
            return id;
        }
        let id = self.graph.variables.make(operand);
        self.locals.insert(operand, id);
        id
    }

    /// Seed a local's prediction from the external value profile.
    pub fn seed_local_prediction(&mut self, operand: u32, prediction: Prediction) {
        let id = self.local(operand);
        self.graph.variables.predict(id, prediction);
    }

    /// Record a baseline overflow exit at an origin.
    pub fn add_overflow_site(&mut self, origin: CodeOrigin) {
        self.code_block
            .alternative
            .as_mut()
            .expect("builder always carries a profiled alternative")
            .add_overflow_site(origin);
    }

    pub fn set_heap_prediction(&mut self, id: NodeId, prediction: Prediction) {
        self.graph[id].heap_prediction = prediction;
    }

    pub fn preserve_local(&mut self, operand: u32) {
        self.graph.preserved_locals.insert(operand);
    }

    pub fn set_parameter_slots(&mut self, slots: u32) {
        self.graph.parameter_slots = slots;
    }

    pub fn set_global_object_for(&mut self, origin: CodeOrigin, global: GlobalObjectId) {
        self.code_block.set_global_object_for(origin, global);
    }

    // ── Node construction ───────────────────────────────────────────

    /// Append a node. Fixed-arity opcodes take up to three children;
    /// var-args opcodes spill into the graph's operand pool. Children gain a
    /// reference each; must-generate opcodes are born with a synthetic
    /// self-reference.
    pub fn raw(&mut self, op: Op, children: &[NodeId], payload: Payload) -> NodeId {
        for &child in children {
            self.graph[child].add_ref();
        }
        let children = if op.has_var_args() {
            let first = self.graph.var_arg_children.len() as u32;
            self.graph.var_arg_children.extend_from_slice(children);
            Children::Variable {
                first,
                count: children.len() as u32,
            }
        } else {
            assert!(
                children.len() <= 3,
                "{op} takes at most three fixed children"
            );
            let mut slots = [None; 3];
            for (slot, &child) in children.iter().enumerate() {
                slots[slot] = Some(child);
            }
            Children::Fixed(slots)
        };
        let ref_count = if op.must_generate() { 1 } else { 0 };
        self.graph.append(Node {
            op,
            children,
            payload,
            origin: self.current_origin,
            prediction: Prediction::empty(),
            arith_flags: ArithFlags::empty(),
            heap_prediction: Prediction::empty(),
            ref_count,
            virtual_register: None,
        })
    }

    pub fn js_constant(&mut self, value: JsValue) -> NodeId {
        let index = self.code_block.add_constant(value);
        self.raw(Op::JsConstant, &[], Payload::Constant(index))
    }

    pub fn weak_js_constant(&mut self, value: JsValue) -> NodeId {
        let index = self.code_block.add_constant(value);
        self.raw(Op::WeakJsConstant, &[], Payload::Constant(index))
    }

    pub fn get_local(&mut self, operand: u32) -> NodeId {
        let variable = self.local(operand);
        self.raw(Op::GetLocal, &[], Payload::Variable(variable))
    }

    pub fn set_local(&mut self, operand: u32, value: NodeId) -> NodeId {
        let variable = self.local(operand);
        self.raw(Op::SetLocal, &[value], Payload::Variable(variable))
    }

    pub fn unary(&mut self, op: Op, a: NodeId) -> NodeId {
        self.raw(op, &[a], Payload::None)
    }

    pub fn binary(&mut self, op: Op, a: NodeId, b: NodeId) -> NodeId {
        self.raw(op, &[a, b], Payload::None)
    }

    pub fn get_by_id(&mut self, base: NodeId, name: &str) -> NodeId {
        let number = self.code_block.add_identifier(name);
        self.raw(Op::GetById, &[base], Payload::Identifier(number))
    }

    pub fn get_by_id_flush(&mut self, base: NodeId, name: &str) -> NodeId {
        let number = self.code_block.add_identifier(name);
        self.raw(Op::GetByIdFlush, &[base], Payload::Identifier(number))
    }

    pub fn put_by_id(&mut self, base: NodeId, value: NodeId, name: &str) -> NodeId {
        let number = self.code_block.add_identifier(name);
        self.raw(Op::PutById, &[base, value], Payload::Identifier(number))
    }

    pub fn get_by_val(&mut self, base: NodeId, index: NodeId) -> NodeId {
        self.raw(Op::GetByVal, &[base, index], Payload::None)
    }

    pub fn put_by_val(&mut self, base: NodeId, index: NodeId, value: NodeId) -> NodeId {
        self.raw(Op::PutByVal, &[base, index, value], Payload::None)
    }

    fn storage_access(&mut self, name: &str, offset: u32) -> u32 {
        let identifier_number = self.code_block.add_identifier(name);
        if let Some(pos) = self.graph.storage_access_data.iter().position(|d| {
            d.identifier_number == identifier_number && d.offset == offset
        }) {
            return pos as u32;
        }
        self.graph.storage_access_data.push(StorageAccessData {
            identifier_number,
            offset,
        });
        (self.graph.storage_access_data.len() - 1) as u32
    }

    /// `GetByOffset(base, storage)`; the storage operand may be omitted when
    /// the load reads inline storage.
    pub fn get_by_offset(
        &mut self,
        base: NodeId,
        storage: Option<NodeId>,
        name: &str,
        offset: u32,
    ) -> NodeId {
        let access = self.storage_access(name, offset);
        match storage {
            Some(storage) => self.raw(
                Op::GetByOffset,
                &[base, storage],
                Payload::StorageAccess(access),
            ),
            None => self.raw(Op::GetByOffset, &[base], Payload::StorageAccess(access)),
        }
    }

    /// `PutByOffset(storage, base, value)`.
    pub fn put_by_offset(
        &mut self,
        storage: NodeId,
        base: NodeId,
        value: NodeId,
        name: &str,
        offset: u32,
    ) -> NodeId {
        let access = self.storage_access(name, offset);
        self.raw(
            Op::PutByOffset,
            &[storage, base, value],
            Payload::StorageAccess(access),
        )
    }

    pub fn get_property_storage(&mut self, base: NodeId) -> NodeId {
        self.raw(Op::GetPropertyStorage, &[base], Payload::None)
    }

    pub fn get_indexed_property_storage(&mut self, base: NodeId, index: NodeId) -> NodeId {
        self.raw(Op::GetIndexedPropertyStorage, &[base, index], Payload::None)
    }

    pub fn check_structure(&mut self, base: NodeId, set: StructureSet) -> NodeId {
        self.raw(Op::CheckStructure, &[base], Payload::Structures(set))
    }

    pub fn put_structure(
        &mut self,
        base: NodeId,
        previous: StructureId,
        next: StructureId,
    ) -> NodeId {
        self.raw(Op::PutStructure, &[base], Payload::Transition { previous, next })
    }

    pub fn check_function(&mut self, base: NodeId, function: FunctionId) -> NodeId {
        self.raw(Op::CheckFunction, &[base], Payload::Function(function))
    }

    pub fn get_global_var(&mut self, var_number: u32) -> NodeId {
        self.raw(Op::GetGlobalVar, &[], Payload::GlobalVar(var_number))
    }

    pub fn put_global_var(&mut self, var_number: u32, value: NodeId) -> NodeId {
        self.raw(Op::PutGlobalVar, &[value], Payload::GlobalVar(var_number))
    }

    pub fn get_scoped_var(&mut self, depth: u32, slot: u32) -> NodeId {
        self.raw(Op::GetScopedVar, &[], Payload::ScopedVar { depth, slot })
    }

    pub fn put_scoped_var(&mut self, depth: u32, slot: u32, value: NodeId) -> NodeId {
        self.raw(Op::PutScopedVar, &[value], Payload::ScopedVar { depth, slot })
    }

    pub fn get_scope_chain(&mut self, depth: u32) -> NodeId {
        self.raw(Op::GetScopeChain, &[], Payload::ScopeChain { depth })
    }

    pub fn call(&mut self, args: &[NodeId]) -> NodeId {
        self.raw(Op::Call, args, Payload::None)
    }

    pub fn construct(&mut self, args: &[NodeId]) -> NodeId {
        self.raw(Op::Construct, args, Payload::None)
    }

    pub fn jump(&mut self, target: BlockIndex) -> NodeId {
        self.raw(Op::Jump, &[], Payload::Jump { target })
    }

    pub fn branch(&mut self, condition: NodeId, taken: BlockIndex, not_taken: BlockIndex) -> NodeId {
        self.raw(Op::Branch, &[condition], Payload::Branch { taken, not_taken })
    }

    pub fn ret(&mut self, value: Option<NodeId>) -> NodeId {
        match value {
            Some(value) => self.raw(Op::Return, &[value], Payload::None),
            None => self.raw(Op::Return, &[], Payload::None),
        }
    }

    /// Close the current basic block at the current node index.
    pub fn end_block(&mut self) {
        let end = self.graph.size();
        assert!(
            end > self.block_start,
            "basic block would be empty at node {end}"
        );
        let num_locals = self.graph.num_locals as usize;
        self.graph.blocks.push(BasicBlock {
            begin: self.block_start,
            end,
            cfa_should_revisit: false,
            cfa_has_visited: false,
            values_at_head: vec![AbstractValue::bottom(); num_locals],
            values_at_tail: vec![AbstractValue::bottom(); num_locals],
        });
        self.block_start = end;
    }

    pub fn finish(mut self) -> (Graph, CodeBlock) {
        if self.graph.size() > self.block_start {
            self.end_block();
        }
        (self.graph, self.code_block)
    }
}

// ─── Display ────────────────────────────────────────────────────────────────

/// Human-readable graph dump, used by the verbose logging hooks.
pub struct GraphDisplay<'a> {
    graph: &'a Graph,
    code_block: &'a CodeBlock,
}

impl fmt::Display for GraphDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (block_index, block) in self.graph.blocks.iter().enumerate() {
            writeln!(f, "block #{block_index}:")?;
            for index in block.begin..block.end {
                self.fmt_node(f, Id::new(index))?;
            }
        }
        Ok(())
    }
}

impl GraphDisplay<'_> {
    fn fmt_node(&self, f: &mut fmt::Formatter<'_>, id: NodeId) -> fmt::Result {
        let node = &self.graph[id];
        write!(f, "  n{}: {}(", id.index(), node.op)?;
        let mut first = true;
        let mut sep = |f: &mut fmt::Formatter<'_>| -> fmt::Result {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            Ok(())
        };
        match &node.payload {
            Payload::None => {}
            Payload::Constant(index) => {
                sep(f)?;
                write!(f, "{:?}", self.code_block.constant(*index))?;
            }
            Payload::Variable(variable) => {
                sep(f)?;
                write!(f, "local{}", self.graph.variables.operand(*variable))?;
            }
            Payload::Identifier(number) => {
                sep(f)?;
                write!(f, "id{}({:?})", number, self.code_block.identifier(*number))?;
            }
            Payload::GlobalVar(number) => {
                sep(f)?;
                write!(f, "g{number}")?;
            }
            Payload::ScopedVar { depth, slot } => {
                sep(f)?;
                write!(f, "depth={depth}, slot={slot}")?;
            }
            Payload::ScopeChain { depth } => {
                sep(f)?;
                write!(f, "depth={depth}")?;
            }
            Payload::StorageAccess(index) => {
                let data = &self.graph.storage_access_data[*index as usize];
                sep(f)?;
                write!(f, "id{}+{}", data.identifier_number, data.offset)?;
            }
            Payload::Structures(set) => {
                sep(f)?;
                write!(f, "{set}")?;
            }
            Payload::Transition { previous, next } => {
                sep(f)?;
                write!(f, "s{} -> s{}", previous.0, next.0)?;
            }
            Payload::Function(function) => {
                sep(f)?;
                write!(f, "f{}", function.0)?;
            }
            Payload::Jump { target } => {
                sep(f)?;
                write!(f, "-> #{target}")?;
            }
            Payload::Branch { taken, not_taken } => {
                sep(f)?;
                write!(f, "-> #{taken}, #{not_taken}")?;
            }
        }
        for child in self.graph.child_ids(id) {
            sep(f)?;
            write!(f, "n{}", child.index())?;
        }
        write!(f, ") [rc={}", node.ref_count())?;
        if !node.prediction.is_empty() {
            write!(f, ", pred={}", node.prediction)?;
        }
        if !node.arith_flags.is_empty() {
            write!(f, ", flags={}", node.arith_flags)?;
        }
        if let Some(vr) = node.virtual_register {
            write!(f, ", {vr}")?;
        }
        writeln!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Op;

    #[test]
    fn builder_maintains_reference_counts() {
        let mut builder = GraphBuilder::new(3);
        let a = builder.get_local(0);
        let b = builder.get_local(1);
        let sum = builder.binary(Op::ValueAdd, a, b);
        let store = builder.set_local(2, sum);
        builder.ret(Some(sum));
        let (graph, _code_block) = builder.finish();

        assert_eq!(graph[a].ref_count(), 1);
        assert_eq!(graph[b].ref_count(), 1);
        // ValueAdd: self-reference (must generate) + SetLocal + Return.
        assert_eq!(graph[sum].ref_count(), 3);
        assert_eq!(graph[store].ref_count(), 1);
        assert_eq!(graph.blocks.len(), 1);
        assert_eq!(graph.blocks[0].begin, 0);
        assert_eq!(graph.blocks[0].end, 5);
    }

    #[test]
    fn var_args_children_live_in_the_pool() {
        let mut builder = GraphBuilder::new(1);
        let callee = builder.get_local(0);
        let x = builder.js_constant(JsValue::Int32(1));
        let y = builder.js_constant(JsValue::Int32(2));
        let call = builder.call(&[callee, x, y]);
        builder.ret(Some(call));
        let (graph, _) = builder.finish();

        assert!(matches!(
            graph[call].children,
            Children::Variable { count: 3, .. }
        ));
        assert_eq!(graph.child_ids(call), vec![callee, x, y]);
        assert_eq!(graph[x].ref_count(), 1);
    }

    #[test]
    fn deref_releases_children_recursively() {
        let mut builder = GraphBuilder::new(1);
        let a = builder.get_local(0);
        let abs = builder.unary(Op::ArithAbs, a);
        builder.ret(Some(abs));
        let (mut graph, _) = builder.finish();

        assert_eq!(graph[abs].ref_count(), 1);
        graph.deref(abs);
        assert_eq!(graph[abs].ref_count(), 0);
        assert_eq!(graph[a].ref_count(), 0);
    }

    #[test]
    fn successors_follow_terminal_payloads() {
        let mut builder = GraphBuilder::new(1);
        let c = builder.get_local(0);
        builder.branch(c, 1, 2);
        builder.end_block();
        builder.jump(2);
        builder.end_block();
        builder.ret(None);
        let (graph, _) = builder.finish();

        assert_eq!(graph.successors(0), vec![1, 2]);
        assert_eq!(graph.successors(1), vec![2]);
        assert!(graph.successors(2).is_empty());
    }

    #[test]
    fn display_names_operands_and_payloads() {
        let mut builder = GraphBuilder::new(1);
        let base = builder.get_local(0);
        builder.get_by_id(base, "length");
        builder.ret(None);
        let (graph, code_block) = builder.finish();

        let dump = graph.display(&code_block).to_string();
        assert!(dump.contains("GetLocal(local0)"));
        assert!(dump.contains("GetById(id0(\"length\"), n0)"));
    }
}
