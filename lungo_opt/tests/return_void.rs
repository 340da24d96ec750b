//! An empty static method returning void: one block, a prologue, an epilogue and nothing else
//! in the side tables.

mod util;

use lungo_opt::Result;
use lungo_opt::backend::BASELINE_ENTRY_PAD;

#[test]
fn return_void() -> Result<()> {
    // return
    let method = util::static_method("()V", vec![0xb1], 0, 0);
    let compiled = util::compiler().compile(&method, None)?;

    assert!(compiled.direct_calls().is_empty());
    assert!(compiled.indirect_calls().is_empty());
    assert!(compiled.safepoints().is_empty());
    assert!(compiled.exception_handlers().is_empty());
    assert!(compiled.stop_positions().is_empty());
    // No variables, no monitors, no outgoing arguments
    assert_eq!(0, compiled.frame_size());
    assert_eq!(0, compiled.baseline_entry());
    assert_eq!(
        u32::try_from(BASELINE_ENTRY_PAD).expect("pad"),
        compiled.opt_entry()
    );
    // The method ends in a return
    assert_eq!(Some(&0xc3), compiled.code().last());
    Ok(())
}

#[test]
fn return_void_is_deterministic() -> Result<()> {
    let method = util::static_method("()V", vec![0xb1], 0, 0);
    let compiler = util::compiler();
    let first = compiler.compile(&method, None)?;
    let second = compiler.compile(&method, None)?;
    assert_eq!(first.code(), second.code());
    assert_eq!(first.frame_size(), second.frame_size());
    Ok(())
}
