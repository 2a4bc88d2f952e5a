use divan::{black_box, Bencher};

use spate::graph::{Graph, GraphBuilder};
use spate::opcode::Op;
use spate::prediction::Prediction;
use spate::runtime::{CodeBlock, GlobalData, JsValue};

fn main() {
    divan::main();
}

/// A loop-shaped graph with enough arithmetic and redundant heap traffic to
/// exercise every pass: int adds, double math, duplicate indexed loads, and a
/// length read that fixup specializes.
fn build_workload() -> (Graph, CodeBlock) {
    let mut builder = GraphBuilder::new(8);
    builder.seed_local_prediction(0, Prediction::ARRAY);
    builder.seed_local_prediction(1, Prediction::INT32);
    builder.seed_local_prediction(2, Prediction::DOUBLE);
    builder.seed_local_prediction(3, Prediction::BOOLEAN);

    let array = builder.get_local(0);
    let length = builder.get_by_id(array, "length");
    builder.set_local(4, length);
    builder.jump(1);
    builder.end_block();

    let array = builder.get_local(0);
    let index = builder.get_local(1);
    let first = builder.get_by_val(array, index);
    builder.set_local(5, first);
    let again = builder.get_by_val(array, index);
    builder.set_local(6, again);
    let one = builder.js_constant(JsValue::Int32(1));
    let next = builder.binary(Op::ArithAdd, index, one);
    builder.set_local(1, next);
    let scale = builder.get_local(2);
    let scaled = builder.binary(Op::ArithMul, scale, scale);
    builder.set_local(2, scaled);
    let done = builder.get_local(3);
    builder.branch(done, 2, 1);
    builder.end_block();

    builder.ret(None);
    builder.finish()
}

#[divan::bench]
fn propagate_loop_workload(bencher: Bencher) {
    let global_data = GlobalData::new();
    bencher.bench(|| {
        let (mut graph, mut code_block) = build_workload();
        spate::propagate(black_box(&mut graph), &global_data, &mut code_block);
        black_box(code_block.num_callee_registers)
    });
}

#[divan::bench]
fn propagate_already_optimized(bencher: Bencher) {
    let global_data = GlobalData::new();
    let (mut graph, mut code_block) = build_workload();
    spate::propagate(&mut graph, &global_data, &mut code_block);
    bencher.bench_local(move || {
        spate::propagate(black_box(&mut graph), &global_data, &mut code_block);
        black_box(code_block.num_callee_registers)
    });
}
