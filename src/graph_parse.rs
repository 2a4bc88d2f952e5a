//! Textual graph parser.
//!
//! Parses a small text format for data-flow graphs, used by tests and
//! debugging tools to build inputs without hand-wiring builder calls. Two
//! passes: parse text → AST, then resolve references through
//! [`GraphBuilder`]. Node operands are written `@N`; the node's number also
//! becomes its code origin, so `overflow N` directives line up with the
//! numbers in the listing.
//!
//! ```text
//! profile local0 Int32
//! profile local1 Int32
//! block {
//!   n0 = GetLocal local0
//!   n1 = GetLocal local1
//!   n2 = ValueAdd @0 @1
//!   n3 = SetLocal local2 @2
//! }
//! ```

use std::collections::HashMap;
use std::fmt;

use chumsky::prelude::*;

use crate::graph::{Graph, GraphBuilder, NodeId, Payload};
use crate::opcode::Op;
use crate::prediction::Prediction;
use crate::runtime::{CodeBlock, FunctionId, JsValue, ObjectKind, StructureId, StructureSet};

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum ParseError {
    /// The text did not match the grammar.
    Syntax(String),
    /// The text parsed but the references or arities do not make sense.
    Resolve(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Syntax(msg) => write!(f, "syntax error: {msg}"),
            ParseError::Resolve(msg) => write!(f, "resolve error: {msg}"),
        }
    }
}

impl std::error::Error for ParseError {}

// ─── AST types (first pass) ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum AstOperand {
    /// `@3`: a reference to node n3.
    Node(u32),
    /// `local2`
    Local(u32),
    /// `c0`: a reference to a `const` directive.
    Const(u32),
    /// `g4`: a global variable number.
    Global(u32),
    /// `s1`: a structure.
    Structure(u32),
    /// `f1`: a function cell.
    Function(u32),
    /// `#2`: a basic block target.
    Block(u32),
    /// A bare integer (scope depth, slot, field offset).
    Int(u64),
    /// `"name"`: an identifier.
    Str(String),
    /// `{s1, s2}`: a structure set.
    Set(Vec<u32>),
    /// `[@1, @2]`: var-args operands.
    Args(Vec<u32>),
    /// `hint=Double`: a heap prediction.
    Hint(String),
}

#[derive(Debug, Clone)]
struct AstNode {
    id: u32,
    op: String,
    operands: Vec<AstOperand>,
}

#[derive(Debug, Clone)]
enum AstDirective {
    Const(u32, JsValue),
    Profile { local: u32, atom: String },
    Overflow(u32),
    Preserve(u32),
    Params(u32),
}

#[derive(Debug, Clone)]
struct AstGraph {
    directives: Vec<AstDirective>,
    blocks: Vec<Vec<AstNode>>,
}

// ─── Parsers ────────────────────────────────────────────────────────────────

type Extra<'src> = extra::Err<Rich<'src, char>>;

fn ws<'src>() -> impl Parser<'src, &'src str, (), Extra<'src>> + Clone {
    any()
        .filter(|c: &char| c.is_whitespace())
        .repeated()
        .ignored()
}

fn uint32<'src>() -> impl Parser<'src, &'src str, u32, Extra<'src>> + Clone {
    text::int::<_, Extra<'_>>(10).map(|s: &str| s.parse::<u32>().unwrap())
}

fn uint64<'src>() -> impl Parser<'src, &'src str, u64, Extra<'src>> + Clone {
    text::int::<_, Extra<'_>>(10).map(|s: &str| s.parse::<u64>().unwrap())
}

/// A float with optional sign and fraction, e.g. `-0.5`, `3`, `2.25`.
fn float64<'src>() -> impl Parser<'src, &'src str, f64, Extra<'src>> + Clone {
    just('-')
        .or_not()
        .then(text::int::<_, Extra<'_>>(10))
        .then(just('.').then(text::int::<_, Extra<'_>>(10)).or_not())
        .to_slice()
        .map(|s: &str| s.parse::<f64>().unwrap())
}

fn quoted<'src>() -> impl Parser<'src, &'src str, String, Extra<'src>> + Clone {
    just('"')
        .ignore_then(any().filter(|c: &char| *c != '"').repeated().to_slice())
        .then_ignore(just('"'))
        .map(|s: &str| s.to_string())
}

/// A bare name: an opcode tag or a prediction atom.
fn name<'src>() -> impl Parser<'src, &'src str, String, Extra<'src>> + Clone {
    any()
        .filter(|c: &char| c.is_ascii_alphanumeric())
        .repeated()
        .at_least(1)
        .to_slice()
        .map(|s: &str| s.to_string())
}

fn structure_ref<'src>() -> impl Parser<'src, &'src str, u32, Extra<'src>> + Clone {
    just('s').ignore_then(uint32())
}

fn operand<'src>() -> impl Parser<'src, &'src str, AstOperand, Extra<'src>> + Clone {
    let set = structure_ref()
        .separated_by(just(',').padded_by(ws()))
        .at_least(1)
        .collect::<Vec<_>>()
        .delimited_by(just('{').then(ws()), ws().then(just('}')))
        .map(AstOperand::Set);
    let args = just('@')
        .ignore_then(uint32())
        .separated_by(just(',').padded_by(ws()))
        .collect::<Vec<_>>()
        .delimited_by(just('[').then(ws()), ws().then(just(']')))
        .map(AstOperand::Args);

    choice((
        just("hint=").ignore_then(name()).map(AstOperand::Hint),
        just("local").ignore_then(uint32()).map(AstOperand::Local),
        just('@').ignore_then(uint32()).map(AstOperand::Node),
        just('#').ignore_then(uint32()).map(AstOperand::Block),
        just('c').ignore_then(uint32()).map(AstOperand::Const),
        just('g').ignore_then(uint32()).map(AstOperand::Global),
        structure_ref().map(AstOperand::Structure),
        just('f').ignore_then(uint32()).map(AstOperand::Function),
        quoted().map(AstOperand::Str),
        set,
        args,
        uint64().map(AstOperand::Int),
    ))
}

fn node_line<'src>() -> impl Parser<'src, &'src str, AstNode, Extra<'src>> + Clone {
    just('n')
        .ignore_then(uint32())
        .then_ignore(just('=').padded_by(ws()))
        .then(name())
        .then(operand().padded_by(ws()).repeated().collect::<Vec<_>>())
        .map(|((id, op), operands)| AstNode { id, op, operands })
}

fn const_value<'src>() -> impl Parser<'src, &'src str, JsValue, Extra<'src>> + Clone {
    choice((
        just("int")
            .then(ws())
            .ignore_then(just('-').or_not().then(uint64()).to_slice())
            .map(|s: &str| JsValue::Int32(s.parse::<i32>().unwrap())),
        just("double").then(ws()).ignore_then(float64()).map(JsValue::Double),
        just("string").then(ws()).ignore_then(quoted()).map(JsValue::Str),
        just("true").to(JsValue::Boolean(true)),
        just("false").to(JsValue::Boolean(false)),
        just("undefined").to(JsValue::Undefined),
        just("null").to(JsValue::Null),
        just("object").to(JsValue::Object(ObjectKind::FinalObject)),
        just("array").to(JsValue::Object(ObjectKind::Array)),
        just("function").to(JsValue::Object(ObjectKind::Function)),
    ))
}

fn directive<'src>() -> impl Parser<'src, &'src str, AstDirective, Extra<'src>> + Clone {
    let const_decl = just("const")
        .then(ws())
        .ignore_then(just('c').ignore_then(uint32()))
        .then_ignore(just('=').padded_by(ws()))
        .then(const_value())
        .map(|(index, value)| AstDirective::Const(index, value));
    let profile = just("profile")
        .then(ws())
        .ignore_then(just("local").ignore_then(uint32()))
        .then_ignore(ws())
        .then(name())
        .map(|(local, atom)| AstDirective::Profile { local, atom });
    let overflow = just("overflow")
        .then(ws())
        .ignore_then(uint32())
        .map(AstDirective::Overflow);
    let preserve = just("preserve")
        .then(ws())
        .ignore_then(just("local").ignore_then(uint32()))
        .map(AstDirective::Preserve);
    let params = just("params")
        .then(ws())
        .ignore_then(uint32())
        .map(AstDirective::Params);

    choice((const_decl, profile, overflow, preserve, params))
}

fn block<'src>() -> impl Parser<'src, &'src str, Vec<AstNode>, Extra<'src>> + Clone {
    just("block")
        .then(ws())
        .then(just('{'))
        .ignore_then(node_line().padded_by(ws()).repeated().collect::<Vec<_>>())
        .then_ignore(just('}'))
}

fn program<'src>() -> impl Parser<'src, &'src str, AstGraph, Extra<'src>> + Clone {
    ws().ignore_then(
        directive()
            .padded_by(ws())
            .repeated()
            .collect::<Vec<_>>()
            .then(block().padded_by(ws()).repeated().at_least(1).collect::<Vec<_>>())
            .map(|(directives, blocks)| AstGraph { directives, blocks })
            .then_ignore(end()),
    )
}

// ─── Resolution (second pass) ───────────────────────────────────────────────

struct Resolver {
    builder: GraphBuilder,
    constants: HashMap<u32, JsValue>,
    nodes: HashMap<u32, NodeId>,
}

fn resolve_error(node: &AstNode, message: &str) -> ParseError {
    ParseError::Resolve(format!("n{} = {}: {message}", node.id, node.op))
}

fn atom(name: &str, node: &AstNode) -> Result<Prediction, ParseError> {
    Prediction::from_atom_name(name)
        .ok_or_else(|| resolve_error(node, &format!("unknown prediction atom {name:?}")))
}

impl Resolver {
    fn node_ref(&self, node: &AstNode, id: u32) -> Result<NodeId, ParseError> {
        self.nodes
            .get(&id)
            .copied()
            .ok_or_else(|| resolve_error(node, &format!("reference to undefined node @{id}")))
    }

    fn resolve_node(&mut self, node: &AstNode) -> Result<(), ParseError> {
        // Operand shapes per opcode family. The hint suffix is peeled first
        // so every family below sees only its positional operands.
        let mut operands = node.operands.clone();
        let mut hint = None;
        if let Some(AstOperand::Hint(name)) = operands.last() {
            hint = Some(atom(name, node)?);
            operands.pop();
        }

        use AstOperand as A;
        self.builder.set_origin(node.id);

        let id = match (node.op.as_str(), operands.as_slice()) {
            ("JSConstant", [A::Const(c)]) | ("WeakJSConstant", [A::Const(c)]) => {
                let value = self
                    .constants
                    .get(c)
                    .cloned()
                    .ok_or_else(|| resolve_error(node, "reference to undeclared constant"))?;
                if node.op == "JSConstant" {
                    self.builder.js_constant(value)
                } else {
                    self.builder.weak_js_constant(value)
                }
            }
            ("GetLocal", [A::Local(local)]) => self.builder.get_local(*local),
            ("SetLocal", [A::Local(local), A::Node(value)]) => {
                let value = self.node_ref(node, *value)?;
                self.builder.set_local(*local, value)
            }

            (
                op @ ("BitAnd" | "BitOr" | "BitXor" | "BitLShift" | "BitRShift" | "BitURShift"
                | "ValueAdd" | "ArithAdd" | "ArithSub" | "ArithMul" | "ArithDiv" | "ArithMod"
                | "ArithMin" | "ArithMax" | "CompareLess" | "CompareLessEq" | "CompareGreater"
                | "CompareGreaterEq" | "CompareEq" | "CompareStrictEq" | "InstanceOf"
                | "ArrayPush" | "StringCharAt" | "StringCharCodeAt"),
                [A::Node(left), A::Node(right)],
            ) => {
                let left = self.node_ref(node, *left)?;
                let right = self.node_ref(node, *right)?;
                self.builder.binary(op_by_name(op), left, right)
            }

            (
                op @ ("ValueToInt32" | "UInt32ToNumber" | "ArithAbs" | "ArithSqrt" | "LogicalNot"
                | "ToPrimitive" | "ConvertThis" | "ArrayPop" | "CreateThis" | "Throw"),
                [A::Node(child)],
            ) => {
                let child = self.node_ref(node, *child)?;
                self.builder.unary(op_by_name(op), child)
            }

            ("GetById", [A::Node(base), A::Str(name)]) => {
                let base = self.node_ref(node, *base)?;
                self.builder.get_by_id(base, name)
            }
            ("GetByIdFlush", [A::Node(base), A::Str(name)]) => {
                let base = self.node_ref(node, *base)?;
                self.builder.get_by_id_flush(base, name)
            }
            ("PutById", [A::Node(base), A::Node(value), A::Str(name)]) => {
                let base = self.node_ref(node, *base)?;
                let value = self.node_ref(node, *value)?;
                self.builder.put_by_id(base, value, name)
            }

            ("GetByVal", [A::Node(base), A::Node(index)]) => {
                let base = self.node_ref(node, *base)?;
                let index = self.node_ref(node, *index)?;
                self.builder.get_by_val(base, index)
            }
            ("GetByVal", [A::Node(base), A::Node(index), A::Node(storage)]) => {
                let base = self.node_ref(node, *base)?;
                let index = self.node_ref(node, *index)?;
                let storage = self.node_ref(node, *storage)?;
                self.builder
                    .raw(Op::GetByVal, &[base, index, storage], Payload::None)
            }
            ("PutByVal", [A::Node(base), A::Node(index), A::Node(value)]) => {
                let base = self.node_ref(node, *base)?;
                let index = self.node_ref(node, *index)?;
                let value = self.node_ref(node, *value)?;
                self.builder.put_by_val(base, index, value)
            }

            ("GetByOffset", [A::Node(base), A::Str(name), A::Int(offset)]) => {
                let base = self.node_ref(node, *base)?;
                self.builder
                    .get_by_offset(base, None, name, *offset as u32)
            }
            ("GetByOffset", [A::Node(base), A::Node(storage), A::Str(name), A::Int(offset)]) => {
                let base = self.node_ref(node, *base)?;
                let storage = self.node_ref(node, *storage)?;
                self.builder
                    .get_by_offset(base, Some(storage), name, *offset as u32)
            }
            (
                "PutByOffset",
                [A::Node(storage), A::Node(base), A::Node(value), A::Str(name), A::Int(offset)],
            ) => {
                let storage = self.node_ref(node, *storage)?;
                let base = self.node_ref(node, *base)?;
                let value = self.node_ref(node, *value)?;
                self.builder
                    .put_by_offset(storage, base, value, name, *offset as u32)
            }

            ("GetPropertyStorage", [A::Node(base)]) => {
                let base = self.node_ref(node, *base)?;
                self.builder.get_property_storage(base)
            }
            ("GetIndexedPropertyStorage", [A::Node(base), A::Node(index)]) => {
                let base = self.node_ref(node, *base)?;
                let index = self.node_ref(node, *index)?;
                self.builder.get_indexed_property_storage(base, index)
            }

            ("CheckStructure", [A::Node(base), A::Set(structures)]) => {
                let base = self.node_ref(node, *base)?;
                let set = StructureSet::new(structures.iter().map(|&s| StructureId(s)).collect());
                self.builder.check_structure(base, set)
            }
            ("PutStructure", [A::Node(base), A::Structure(previous), A::Structure(next)]) => {
                let base = self.node_ref(node, *base)?;
                self.builder
                    .put_structure(base, StructureId(*previous), StructureId(*next))
            }
            ("CheckFunction", [A::Node(base), A::Function(function)]) => {
                let base = self.node_ref(node, *base)?;
                self.builder.check_function(base, FunctionId(*function))
            }

            ("GetGlobalVar", [A::Global(number)]) => self.builder.get_global_var(*number),
            ("PutGlobalVar", [A::Global(number), A::Node(value)]) => {
                let value = self.node_ref(node, *value)?;
                self.builder.put_global_var(*number, value)
            }
            ("GetScopeChain", [A::Int(depth)]) => self.builder.get_scope_chain(*depth as u32),
            ("GetScopedVar", [A::Int(depth), A::Int(slot)]) => {
                self.builder.get_scoped_var(*depth as u32, *slot as u32)
            }
            ("GetCallee", []) => self.builder.raw(Op::GetCallee, &[], Payload::None),
            ("NewObject", []) => self.builder.raw(Op::NewObject, &[], Payload::None),

            (op @ ("Call" | "Construct" | "StrCat" | "NewArray"), [A::Args(args)]) => {
                let args = args
                    .iter()
                    .map(|&a| self.node_ref(node, a))
                    .collect::<Result<Vec<_>, _>>()?;
                self.builder.raw(op_by_name(op), &args, Payload::None)
            }

            ("Jump", [A::Block(target)]) => self.builder.jump(*target),
            ("Branch", [A::Node(condition), A::Block(taken), A::Block(not_taken)]) => {
                let condition = self.node_ref(node, *condition)?;
                self.builder.branch(condition, *taken, *not_taken)
            }
            ("Return", []) => self.builder.ret(None),
            ("Return", [A::Node(value)]) => {
                let value = self.node_ref(node, *value)?;
                self.builder.ret(Some(value))
            }

            _ => {
                return Err(resolve_error(
                    node,
                    "unknown opcode or wrong operands for it",
                ));
            }
        };

        if let Some(hint) = hint {
            self.builder.set_heap_prediction(id, hint);
        }
        if self.nodes.insert(node.id, id).is_some() {
            return Err(resolve_error(node, "node number defined twice"));
        }
        Ok(())
    }
}

/// Opcode tags the generic binary/unary/var-args arms accept.
fn op_by_name(name: &str) -> Op {
    match name {
        "BitAnd" => Op::BitAnd,
        "BitOr" => Op::BitOr,
        "BitXor" => Op::BitXor,
        "BitLShift" => Op::BitLShift,
        "BitRShift" => Op::BitRShift,
        "BitURShift" => Op::BitURShift,
        "ValueAdd" => Op::ValueAdd,
        "ArithAdd" => Op::ArithAdd,
        "ArithSub" => Op::ArithSub,
        "ArithMul" => Op::ArithMul,
        "ArithDiv" => Op::ArithDiv,
        "ArithMod" => Op::ArithMod,
        "ArithMin" => Op::ArithMin,
        "ArithMax" => Op::ArithMax,
        "CompareLess" => Op::CompareLess,
        "CompareLessEq" => Op::CompareLessEq,
        "CompareGreater" => Op::CompareGreater,
        "CompareGreaterEq" => Op::CompareGreaterEq,
        "CompareEq" => Op::CompareEq,
        "CompareStrictEq" => Op::CompareStrictEq,
        "InstanceOf" => Op::InstanceOf,
        "ArrayPush" => Op::ArrayPush,
        "ArrayPop" => Op::ArrayPop,
        "StringCharAt" => Op::StringCharAt,
        "StringCharCodeAt" => Op::StringCharCodeAt,
        "ValueToInt32" => Op::ValueToInt32,
        "UInt32ToNumber" => Op::UInt32ToNumber,
        "ArithAbs" => Op::ArithAbs,
        "ArithSqrt" => Op::ArithSqrt,
        "LogicalNot" => Op::LogicalNot,
        "ToPrimitive" => Op::ToPrimitive,
        "ConvertThis" => Op::ConvertThis,
        "CreateThis" => Op::CreateThis,
        "Throw" => Op::Throw,
        "Call" => Op::Call,
        "Construct" => Op::Construct,
        "StrCat" => Op::StrCat,
        "NewArray" => Op::NewArray,
        _ => unreachable!("op name {name} not routed through a generic arm"),
    }
}

/// Parse a textual graph into a [`Graph`] and its [`CodeBlock`].
pub fn parse_graph(source: &str) -> Result<(Graph, CodeBlock), ParseError> {
    let ast = program()
        .parse(source)
        .into_result()
        .map_err(|errors| {
            let rendered = errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            ParseError::Syntax(rendered)
        })?;

    // Locals must exist before any node mentions them; size the pool from
    // everything the text names.
    let mut num_locals = 0;
    for directive in &ast.directives {
        match directive {
            AstDirective::Profile { local, .. } | AstDirective::Preserve(local) => {
                num_locals = num_locals.max(*local + 1);
            }
            _ => {}
        }
    }
    for block in &ast.blocks {
        for node in block {
            for operand in &node.operands {
                if let AstOperand::Local(local) = operand {
                    num_locals = num_locals.max(local + 1);
                }
            }
        }
    }

    let mut resolver = Resolver {
        builder: GraphBuilder::new(num_locals),
        constants: HashMap::new(),
        nodes: HashMap::new(),
    };

    for directive in &ast.directives {
        match directive {
            AstDirective::Const(index, value) => {
                resolver.constants.insert(*index, value.clone());
            }
            AstDirective::Profile { local, atom } => {
                let prediction = Prediction::from_atom_name(atom).ok_or_else(|| {
                    ParseError::Resolve(format!("unknown prediction atom {atom:?}"))
                })?;
                resolver.builder.seed_local_prediction(*local, prediction);
            }
            AstDirective::Overflow(origin) => resolver.builder.add_overflow_site(*origin),
            AstDirective::Preserve(local) => resolver.builder.preserve_local(*local),
            AstDirective::Params(slots) => resolver.builder.set_parameter_slots(*slots),
        }
    }

    for block in &ast.blocks {
        if block.is_empty() {
            return Err(ParseError::Resolve("empty basic block".to_string()));
        }
        for node in block {
            resolver.resolve_node(node)?;
        }
        resolver.builder.end_block();
    }

    Ok(resolver.builder.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::propagator::propagate;
    use crate::runtime::GlobalData;

    #[test]
    fn parses_and_propagates_an_integer_add() {
        let (mut graph, mut code_block) = parse_graph(
            r#"
            profile local0 Int32
            profile local1 Int32
            block {
              n0 = GetLocal local0
              n1 = GetLocal local1
              n2 = ValueAdd @0 @1
              n3 = SetLocal local2 @2
            }
            "#,
        )
        .expect("graph should parse");
        assert_eq!(graph.size(), 4);
        assert_eq!(graph.blocks.len(), 1);

        propagate(&mut graph, &GlobalData::new(), &mut code_block);
        let add = graph.node_ids().nth(2).unwrap();
        assert_eq!(graph[add].prediction, Prediction::INT32);
    }

    #[test]
    fn overflow_directive_keys_off_node_numbers() {
        let (mut graph, mut code_block) = parse_graph(
            r#"
            profile local0 Int32
            profile local1 Int32
            overflow 2
            block {
              n0 = GetLocal local0
              n1 = GetLocal local1
              n2 = ArithAdd @0 @1
              n3 = SetLocal local2 @2
            }
            "#,
        )
        .expect("graph should parse");
        propagate(&mut graph, &GlobalData::new(), &mut code_block);
        let add = graph.node_ids().nth(2).unwrap();
        assert_eq!(graph[add].prediction, Prediction::DOUBLE);
    }

    #[test]
    fn parses_constants_guards_and_control_flow() {
        let (graph, code_block) = parse_graph(
            r#"
            const c0 = int 41
            const c1 = double 0.5
            block {
              n0 = JSConstant c0
              n1 = JSConstant c1
              n2 = GetLocal local0
              n3 = CheckStructure @2 {s1, s2}
              n4 = GetById @2 "length" hint=Int32
              n5 = CompareLess @0 @1
              n6 = Branch @5 #1 #2
            }
            block {
              n7 = Call [@0, @1]
              n8 = Return @7
            }
            block {
              n9 = Return
            }
            "#,
        )
        .expect("graph should parse");
        assert_eq!(graph.blocks.len(), 3);
        assert_eq!(graph.successors(0), vec![1, 2]);
        let get_by_id = graph.node_ids().nth(4).unwrap();
        assert_eq!(graph[get_by_id].heap_prediction, Prediction::INT32);
        assert_eq!(code_block.constant(0), &JsValue::Int32(41));
    }

    #[test]
    fn rejects_references_to_undefined_nodes() {
        let error = parse_graph(
            r#"
            block {
              n0 = ArithAbs @3
            }
            "#,
        )
        .expect_err("forward references are invalid");
        assert!(matches!(error, ParseError::Resolve(_)));
    }

    #[test]
    fn rejects_unknown_opcodes_and_bad_arity() {
        assert!(parse_graph("block { n0 = FrobnicateFast local0 }").is_err());
        assert!(parse_graph("block { n0 = GetLocal }").is_err());
        assert!(parse_graph("block { }").is_err());
    }
}
