//! Field access through XIR snippets, with the volatile barrier rules of a strongly ordered
//! machine: stores keep their store-load fence, loads need none, and back-to-back volatile
//! reads never accumulate extra barriers.

mod util;

use lungo_code::{Constant, ConstantPool};
use lungo_opt::Result;

const MFENCE: [u8; 3] = [0x0f, 0xae, 0xf0];

fn pool_with_field(name: &str, descriptor: &str) -> (ConstantPool, u8) {
    let mut pool = ConstantPool::new();
    let index = pool.push(Constant::FieldRef {
        class: "Test".to_string(),
        name: name.to_string(),
        descriptor: descriptor.to_string(),
    });
    (pool, u8::try_from(index).expect("index"))
}

fn count_mfence(code: &[u8]) -> usize {
    code.windows(3).filter(|window| *window == MFENCE).count()
}

#[test]
fn volatile_store_keeps_the_store_load_fence() -> Result<()> {
    let (pool, index) = pool_with_field("volatileCount", "I");
    // aload_0, iconst_1, putfield #1, return
    let method = util::static_method_with_pool(
        "(Ljava/lang/Object;)V",
        vec![0x2a, 0x04, 0xb5, 0x00, index, 0xb1],
        2,
        1,
        pool,
    );
    let compiled = util::compiler().compile(&method, None)?;
    assert_eq!(1, count_mfence(compiled.code()));
    Ok(())
}

#[test]
fn back_to_back_volatile_reads_emit_no_extra_barriers() -> Result<()> {
    let (pool, index) = pool_with_field("volatileCount", "I");
    // aload_0, getfield #1, pop, aload_0, getfield #1, pop, return
    let method = util::static_method_with_pool(
        "(Ljava/lang/Object;)V",
        vec![
            0x2a, 0xb4, 0x00, index, 0x57, 0x2a, 0xb4, 0x00, index, 0x57, 0xb1,
        ],
        1,
        1,
        pool,
    );
    let compiled = util::compiler().compile(&method, None)?;
    // Reads require no fence at all on this target, so twice nothing is still nothing
    assert_eq!(0, count_mfence(compiled.code()));
    Ok(())
}

#[test]
fn plain_store_has_no_fence() -> Result<()> {
    let (pool, index) = pool_with_field("count", "I");
    let method = util::static_method_with_pool(
        "(Ljava/lang/Object;)V",
        vec![0x2a, 0x04, 0xb5, 0x00, index, 0xb1],
        2,
        1,
        pool,
    );
    let compiled = util::compiler().compile(&method, None)?;
    assert_eq!(0, count_mfence(compiled.code()));
    Ok(())
}

#[test]
fn object_store_compiles_with_write_barrier() -> Result<()> {
    let (pool, index) = pool_with_field("next", "Ljava/lang/Object;");
    // aload_0, aload_0, putfield #1, return
    let method = util::static_method_with_pool(
        "(Ljava/lang/Object;)V",
        vec![0x2a, 0x2a, 0xb5, 0x00, index, 0xb1],
        2,
        1,
        pool,
    );
    let compiled = util::compiler().compile(&method, None)?;
    // The card mark of the write barrier is a byte store through the card table base
    let byte_stores = compiled
        .code()
        .windows(2)
        .filter(|window| *window == [0x41, 0x88])
        .count();
    assert_eq!(1, byte_stores);
    Ok(())
}
