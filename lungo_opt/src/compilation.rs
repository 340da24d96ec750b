//! The compile entry and the per-VM compiler context.
//!
//! One [`Compiler`] is shared by every compilation thread; each call to
//! [`compile`](Compiler::compile) owns its own IR arena, operand pool and code buffer, so
//! compilations proceed in parallel without touching each other. Only the stub cache is shared,
//! behind its own lock.

use crate::backend::{FrameMap, StubCache, emit};
use crate::error::Result;
use crate::graph::build_graph;
use crate::hir::Ir;
use crate::lir::generate_lir;
use crate::options::Options;
use lungo_code::{Method, Runtime, Target, TargetMethod};
use std::sync::Arc;
use tracing::{debug, warn};

/// Process wide compiler state: the target description, the runtime interface, the options and
/// the shared stub cache.
pub struct CompilerContext {
    pub target: Target,
    pub runtime: Arc<dyn Runtime>,
    pub options: Options,
    pub stubs: StubCache,
}

impl std::fmt::Debug for CompilerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilerContext")
            .field("target", &self.target)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// The optimizing method compiler.
#[derive(Clone, Debug)]
pub struct Compiler {
    context: Arc<CompilerContext>,
}

impl Compiler {
    /// Create a compiler for `target`, querying `runtime` for resolution and XIR templates.
    #[must_use]
    pub fn new(target: Target, runtime: Arc<dyn Runtime>, options: Options) -> Compiler {
        Compiler {
            context: Arc::new(CompilerContext {
                target,
                runtime,
                options,
                stubs: StubCache::new(),
            }),
        }
    }

    /// Return the shared compiler context.
    #[must_use]
    pub fn context(&self) -> &Arc<CompilerContext> {
        &self.context
    }

    /// Compile `method` into a sealed target method, entering at `osr_bci` instead of the
    /// method entry when given.
    ///
    /// # Errors
    ///
    /// Any error is a bailout: the caller is expected to fall back to the baseline compiler or
    /// the interpreter. Nothing of a failed compilation is observable.
    pub fn compile(&self, method: &Arc<Method>, osr_bci: Option<u32>) -> Result<TargetMethod> {
        let context = &self.context;
        let filtered = context.options.matches_filter(&method.name)
            || context.options.matches_filter(&method.holder);
        if filtered {
            debug!(method = %method, ?osr_bci, "compiling");
        }
        let result = self.compile_inner(method, osr_bci);
        match &result {
            Ok(target_method) => {
                if filtered {
                    debug!(method = %method, code = target_method.code().len(), "compiled");
                }
            }
            Err(error) => {
                warn!(method = %method, %error, "compilation bailed out");
            }
        }
        result
    }

    fn compile_inner(&self, method: &Arc<Method>, osr_bci: Option<u32>) -> Result<TargetMethod> {
        let context = &self.context;
        let mut ir: Ir = build_graph(
            context.runtime.as_ref(),
            &context.options,
            Arc::clone(method),
            osr_bci,
        )?;
        debug_assert_eq!(Ok(()), ir.verify(), "graph invariants after build");
        let lir = generate_lir(
            &mut ir,
            context.runtime.as_ref(),
            &context.options,
            &context.target,
            method,
        )?;
        let frame = FrameMap::build(
            &lir.variables,
            ir.max_locks,
            lir.stack_alloc_bytes,
            lir.max_outgoing_slots,
            &context.target,
        );
        emit(&ir, &lir, &frame, &context.target, method.to_string())
    }
}
