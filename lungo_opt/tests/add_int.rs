//! `static int add(int a, int b) { return a + b; }`: two locals, one add, one return, and an
//! otherwise empty set of side tables.

mod util;

use lungo_opt::Result;

#[test]
fn add_int() -> Result<()> {
    // iload_0, iload_1, iadd, ireturn
    let method = util::static_method("(II)I", vec![0x1a, 0x1b, 0x60, 0xac], 2, 2);
    let compiled = util::compiler().compile(&method, None)?;

    assert!(compiled.safepoints().is_empty());
    assert!(compiled.exception_handlers().is_empty());
    assert!(compiled.direct_calls().is_empty());
    assert!(compiled.stop_positions().is_empty());
    // 32 bit add of two registers appears exactly once
    let adds = compiled
        .code()
        .windows(2)
        .filter(|window| window[0] == 0x01 && window[1] == 0xc8)
        .count();
    assert_eq!(1, adds);
    assert_eq!(Some(&0xc3), compiled.code().last());
    assert_eq!(0, compiled.frame_size() % 16);
    Ok(())
}

#[test]
fn add_constants_is_folded() -> Result<()> {
    // iconst_2, iconst_3, iadd, ireturn: canonicalization folds the add away
    let method = util::static_method("()I", vec![0x05, 0x06, 0x60, 0xac], 2, 0);
    let compiled = util::compiler().compile(&method, None)?;
    let adds = compiled
        .code()
        .windows(2)
        .filter(|window| window[0] == 0x01 && window[1] == 0xc8)
        .count();
    assert_eq!(0, adds);
    Ok(())
}
