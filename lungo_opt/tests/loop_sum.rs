//! `static int sum(int n) { int s = 0; for (int i = 0; i < n; i++) s += i; return s; }`:
//! the loop header has two predecessors and one phi per loop-stored local, and the backward
//! branch carries a safepoint.

mod util;

use lungo_opt::Result;
use lungo_opt::graph::build_graph;
use lungo_opt::hir::ValueTag;
use util::TestRuntime;

fn sum_code() -> Vec<u8> {
    vec![
        0x03, // 0: iconst_0
        0x3c, // 1: istore_1           s = 0
        0x03, // 2: iconst_0
        0x3d, // 3: istore_2           i = 0
        0x1c, // 4: iload_2            loop header
        0x1a, // 5: iload_0
        0xa2, 0x00, 0x0d, // 6: if_icmpge -> 19
        0x1b, // 9: iload_1
        0x1c, // 10: iload_2
        0x60, // 11: iadd
        0x3c, // 12: istore_1          s += i
        0x84, 0x02, 0x01, // 13: iinc 2 1
        0xa7, 0xff, 0xf4, // 16: goto -> 4
        0x1b, // 19: iload_1
        0xac, // 20: ireturn
    ]
}

#[test]
fn loop_header_phis() -> Result<()> {
    let method = util::static_method("(I)I", sum_code(), 2, 3);
    let runtime = TestRuntime::new();
    let options = lungo_opt::Options::default();
    let ir = build_graph(&runtime, &options, method, None)?;
    assert_eq!(Ok(()), ir.verify());

    let header = (0..ir.block_count())
        .map(|index| lungo_opt::hir::BlockId(u32::try_from(index).expect("index")))
        .find(|block| ir.block(*block).is_loop_header())
        .expect("loop header");
    let block = ir.block(header);
    // Entry path and latch
    assert_eq!(2, block.predecessors.len());
    // One phi for s, one for i; local 0 is never stored inside the loop
    assert_eq!(2, block.phis.len());
    for phi in &block.phis {
        let ValueTag::Phi { inputs, .. } = &ir.value(*phi).tag else {
            panic!("not a phi");
        };
        assert_eq!(2, inputs.len());
    }
    Ok(())
}

#[test]
fn backward_branch_has_safepoint() -> Result<()> {
    let method = util::static_method("(I)I", sum_code(), 2, 3);
    let compiled = util::compiler().compile(&method, None)?;
    assert!(!compiled.safepoints().is_empty());
    assert!(compiled.exception_handlers().is_empty());
    // Safepoints are stop positions
    for safepoint in compiled.safepoints() {
        assert!(compiled.stop_positions().contains(&safepoint.position));
    }
    Ok(())
}
