//! spate: speculative type propagation and local optimization for a
//! data-flow-graph JIT tier.
//!
//! A frontend (external to this crate) lowers profiled bytecode into a graph
//! of SSA-like nodes; [`propagate`] then annotates and locally optimizes that
//! graph so the backend (also external) can emit type-specialized code:
//!
//! 1. arithmetic use-flag propagation (full-number vs. truncated-integer
//!    demand, negative-zero observability),
//! 2. prediction propagation fusing profile hints with per-opcode transfer
//!    rules, interleaved with voting on double representation of locals,
//! 3. opcode fixup (e.g. `GetById "length"` of a known container becomes a
//!    dedicated pure length opcode),
//! 4. per-block common subexpression and redundant-load/guard elimination,
//! 5. linear-scan virtual register allocation,
//! 6. a global forward abstract-interpretation fixpoint over basic blocks.
//!
//! Graphs are built externally (or via [`graph::GraphBuilder`] /
//! [`graph_parse::parse_graph`] in tests and tools). Failure modes are
//! internal invariant violations only, reported by panicking; a caller is
//! expected to discard the graph and fall back to unoptimized execution.
//! Verbose per-phase dumps go through the `log` crate at debug/trace level.

pub mod abstract_state;
pub mod graph;
pub mod graph_parse;
pub mod opcode;
pub mod prediction;
pub mod propagator;
pub mod runtime;
pub mod scoreboard;
pub mod variables;

pub use propagator::propagate;
