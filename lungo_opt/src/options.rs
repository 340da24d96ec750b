//! Compiler options.

/// Tunable options of the optimizing compiler.
///
/// Defaults match production settings; tests flip individual options to steer code generation.
#[derive(Clone, Debug)]
pub struct Options {
    /// 0 disables everything optional, 1 adds canonicalization, 2 adds inlining, 3 reserved
    pub opt_level: u8,
    /// Emit array range checks
    pub gen_bounds_checks: bool,
    /// Emit store type checks for object arrays
    pub gen_array_store_check: bool,
    /// Emit explicit division by zero checks instead of relying on a hardware trap
    pub gen_explicit_div0_checks: bool,
    /// Lower switches through switch ranges; one compare per case when disabled
    pub gen_table_ranges: bool,
    /// Reserve a scratch register for biased locking in monitor enter
    pub use_biased_locking: bool,
    /// Emit the call site snippet after argument materialization
    pub invoke_snippet_after_arguments: bool,
    /// SSE generation on x86: 0, 1 or 2
    pub sse_version: u8,
    /// Force patching paths even when resolution would succeed
    pub test_patching: bool,
    /// Restrict diagnostic output to methods whose name contains the filter
    pub print_filter: Option<String>,
    /// Maximum bytecode size of an inlinable callee
    pub max_inline_size: u16,
    /// Maximum depth of nested inlining scopes
    pub max_inline_depth: u32,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            opt_level: 2,
            gen_bounds_checks: true,
            gen_array_store_check: true,
            gen_explicit_div0_checks: true,
            gen_table_ranges: true,
            use_biased_locking: false,
            invoke_snippet_after_arguments: true,
            sse_version: 2,
            test_patching: false,
            print_filter: None,
            max_inline_size: 35,
            max_inline_depth: 9,
        }
    }
}

impl Options {
    /// Return whether diagnostics should be printed for `method_name`.
    #[must_use]
    pub fn matches_filter(&self, method_name: &str) -> bool {
        match &self.print_filter {
            Some(filter) => method_name.contains(filter.as_str()),
            None => false,
        }
    }

    /// Return whether canonicalization is enabled.
    #[must_use]
    pub fn canonicalize(&self) -> bool {
        self.opt_level >= 1
    }

    /// Return whether inlining is enabled.
    #[must_use]
    pub fn inline(&self) -> bool {
        self.opt_level >= 2
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert_eq!(2, options.opt_level);
        assert!(options.gen_bounds_checks);
        assert!(options.gen_table_ranges);
        assert!(!options.test_patching);
        assert!(options.canonicalize());
        assert!(options.inline());
    }

    #[test]
    fn test_opt_level_gates() {
        let options = Options {
            opt_level: 0,
            ..Options::default()
        };
        assert!(!options.canonicalize());
        assert!(!options.inline());
        let options = Options {
            opt_level: 1,
            ..Options::default()
        };
        assert!(options.canonicalize());
        assert!(!options.inline());
    }

    #[test]
    fn test_print_filter() {
        let options = Options {
            print_filter: Some("hashCode".to_string()),
            ..Options::default()
        };
        assert!(options.matches_filter("java/lang/Object.hashCode()I"));
        assert!(!options.matches_filter("java/lang/Object.equals(Ljava/lang/Object;)Z"));
        assert!(!Options::default().matches_filter("anything"));
    }
}
