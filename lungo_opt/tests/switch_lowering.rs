//! Switch range lowering: contiguous keys sharing a successor collapse into one range, and the
//! resulting compare chain is shorter than one compare per case.

mod util;

use lungo_code::Target;
use lungo_opt::Result;
use lungo_opt::graph::build_graph;
use lungo_opt::lir::{LirOp, generate_lir};
use util::TestRuntime;

/// `switch (x) { case 0: case 1: case 2: return 10; case 5: return 20; default: return 30 }`
fn switch_code() -> Vec<u8> {
    let mut code = vec![
        0x1a, // 0: iload_0
        0xab, // 1: lookupswitch
        0, 0, // padding to 4
    ];
    // Case blocks land at 44 (A), 47 (B) and 50 (default); offsets are switch-relative
    let a = 43i32;
    let b = 46i32;
    let default = 49i32;
    code.extend_from_slice(&default.to_be_bytes());
    code.extend_from_slice(&4i32.to_be_bytes());
    for (key, offset) in [(0i32, a), (1, a), (2, a), (5, b)] {
        code.extend_from_slice(&key.to_be_bytes());
        code.extend_from_slice(&offset.to_be_bytes());
    }
    assert_eq!(44, code.len());
    code.extend_from_slice(&[0x10, 10, 0xac]); // 44: bipush 10, ireturn
    code.extend_from_slice(&[0x10, 20, 0xac]); // 47: bipush 20, ireturn
    code.extend_from_slice(&[0x10, 30, 0xac]); // 50: bipush 30, ireturn
    code
}

fn count_ops(ops: &[LirOp]) -> (usize, usize) {
    let branches = ops
        .iter()
        .filter(|op| matches!(op, LirOp::Branch { .. }))
        .count();
    let local_branches = ops
        .iter()
        .filter(|op| matches!(op, LirOp::BranchLocal { .. }))
        .count();
    (branches, local_branches)
}

fn lower_with(table_ranges: bool) -> Result<(usize, usize)> {
    let method = util::static_method("(I)I", switch_code(), 1, 1);
    let runtime = TestRuntime::new();
    let options = lungo_opt::Options {
        gen_table_ranges: table_ranges,
        ..lungo_opt::Options::default()
    };
    let target = Target::amd64();
    let mut ir = build_graph(&runtime, &options, method.clone(), None)?;
    let lir = generate_lir(&mut ir, &runtime, &options, &target, &method)?;
    let mut totals = (0, 0);
    for list in lir.lists.values() {
        let (branches, local_branches) = count_ops(list);
        totals.0 += branches;
        totals.1 += local_branches;
    }
    Ok(totals)
}

#[test]
fn ranges_shorten_the_compare_chain() -> Result<()> {
    // Range {0..2} -> A: a bound pair; range {5} -> B: one equality
    let (range_branches, range_locals) = lower_with(true)?;
    assert_eq!(2, range_branches);
    assert_eq!(1, range_locals);

    // One compare per case
    let (case_branches, case_locals) = lower_with(false)?;
    assert_eq!(4, case_branches);
    assert_eq!(0, case_locals);
    Ok(())
}

#[test]
fn switch_compiles_end_to_end() -> Result<()> {
    let method = util::static_method("(I)I", switch_code(), 1, 1);
    let compiled = util::compiler().compile(&method, None)?;
    assert!(compiled.exception_handlers().is_empty());
    assert!(compiled.safepoints().is_empty());
    Ok(())
}
