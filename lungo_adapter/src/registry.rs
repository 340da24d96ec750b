//! The process wide adapter registry.

use crate::generator::{AdapterGenerator, Direction};
use lungo_code::{ConventionKind, Method, Target};
use std::sync::Arc;

/// Both adapter generators, registered once at startup and keyed by the calling convention of
/// the entry point they adapt into.
#[derive(Debug)]
pub struct AdapterRegistry {
    opt2baseline: Arc<AdapterGenerator>,
    baseline2opt: Arc<AdapterGenerator>,
}

impl AdapterRegistry {
    /// Initialize both directions for `target`. Called once at VM startup.
    #[must_use]
    pub fn init(target: &Target) -> AdapterRegistry {
        AdapterRegistry {
            opt2baseline: Arc::new(AdapterGenerator::new(
                Direction::Opt2Baseline,
                target.clone(),
            )),
            baseline2opt: Arc::new(AdapterGenerator::new(
                Direction::Baseline2Opt,
                target.clone(),
            )),
        }
    }

    /// The generator adapting callers into the entry point of the given convention.
    #[must_use]
    pub fn for_entry(&self, entry: ConventionKind) -> &Arc<AdapterGenerator> {
        match entry {
            ConventionKind::Baseline => &self.opt2baseline,
            ConventionKind::Optimized => &self.baseline2opt,
        }
    }

    /// The generator for `callee`'s entry, or `None` for callees that are never adapted.
    #[must_use]
    pub fn generator_for(
        &self,
        callee: &Method,
        entry: ConventionKind,
    ) -> Option<&Arc<AdapterGenerator>> {
        let generator = self.for_entry(entry);
        if generator.adaptation_elided(callee) {
            None
        } else {
            Some(generator)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use lungo_code::{ConstantPool, MethodFlags};

    #[test]
    fn test_registry_directions() {
        let registry = AdapterRegistry::init(&Target::amd64());
        assert_eq!(
            Direction::Opt2Baseline,
            registry.for_entry(ConventionKind::Baseline).direction()
        );
        assert_eq!(
            Direction::Baseline2Opt,
            registry.for_entry(ConventionKind::Optimized).direction()
        );
    }

    #[test]
    fn test_never_adapted_callees_have_no_generator() {
        let registry = AdapterRegistry::init(&Target::amd64());
        let stub = Method {
            holder: "Foo".to_string(),
            name: "stub".to_string(),
            descriptor: "(I)V".to_string(),
            flags: MethodFlags::STATIC | MethodFlags::NATIVE_STUB,
            code: Vec::new(),
            max_stack: 0,
            max_locals: 0,
            constant_pool: ConstantPool::new(),
            exception_handlers: Vec::new(),
            line_numbers: Vec::new(),
        };
        assert!(
            registry
                .generator_for(&stub, ConventionKind::Optimized)
                .is_none()
        );
    }
}
