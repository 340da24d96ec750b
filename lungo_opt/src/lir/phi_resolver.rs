//! Parallel move resolution for phi inputs at block exits.
//!
//! All moves destined for a successor's phis happen conceptually in parallel. The resolver
//! orders them so no move clobbers the source of a later one, breaking cycles by spilling one
//! participant to a fresh temporary.

use crate::lir::LirOp;
use lungo_code::{Kind, Operand, Variable};

/// Collects pending phi moves and emits them in a safe order.
#[derive(Debug, Default)]
pub struct PhiResolver {
    pending: Vec<(Operand, Variable)>,
}

impl PhiResolver {
    #[must_use]
    pub fn new() -> PhiResolver {
        PhiResolver::default()
    }

    /// Queue a move of `src` into the phi variable `dest`.
    pub fn add_move(&mut self, src: Operand, dest: Variable) {
        self.pending.push((src, dest));
    }

    /// Return whether any moves are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Emit the queued moves into `ops`, allocating cycle-breaking temporaries through
    /// `new_temp`.
    pub fn resolve(mut self, ops: &mut Vec<LirOp>, mut new_temp: impl FnMut(Kind) -> Variable) {
        while !self.pending.is_empty() {
            let mut progressed = false;
            let mut index = 0;
            while index < self.pending.len() {
                let dest = self.pending[index].1;
                let blocked = self.pending.iter().enumerate().any(|(other, (src, _))| {
                    other != index && *src == Operand::Variable(dest)
                });
                if blocked {
                    index += 1;
                    continue;
                }
                let (src, dest) = self.pending.remove(index);
                // A self move would be a no-op
                if src != Operand::Variable(dest) {
                    ops.push(LirOp::Move {
                        src,
                        dest: Operand::Variable(dest),
                    });
                }
                progressed = true;
            }
            if self.pending.is_empty() {
                break;
            }
            if !progressed {
                // Every pending destination is read by another pending move: a cycle.
                // Spill one destination to a temporary and redirect its readers.
                let victim = self.pending[0].1;
                let temp = new_temp(victim.kind);
                ops.push(LirOp::Move {
                    src: Operand::Variable(victim),
                    dest: Operand::Variable(temp),
                });
                for (src, _) in &mut self.pending {
                    if *src == Operand::Variable(victim) {
                        *src = Operand::Variable(temp);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn variable(index: u32) -> Variable {
        Variable {
            index,
            kind: Kind::Int,
        }
    }

    fn moves(ops: &[LirOp]) -> Vec<(Operand, Operand)> {
        ops.iter()
            .map(|op| match op {
                LirOp::Move { src, dest } => (src.clone(), dest.clone()),
                _ => panic!("expected move"),
            })
            .collect()
    }

    #[test]
    fn test_independent_moves() {
        let mut resolver = PhiResolver::new();
        resolver.add_move(Operand::Variable(variable(0)), variable(10));
        resolver.add_move(Operand::Variable(variable(1)), variable(11));
        let mut ops = Vec::new();
        resolver.resolve(&mut ops, |_| panic!("no temp needed"));
        assert_eq!(2, ops.len());
    }

    #[test]
    fn test_chain_is_ordered() {
        // v1 -> v2 and v0 -> v1: the v1 -> v2 move must come first
        let mut resolver = PhiResolver::new();
        resolver.add_move(Operand::Variable(variable(0)), variable(1));
        resolver.add_move(Operand::Variable(variable(1)), variable(2));
        let mut ops = Vec::new();
        resolver.resolve(&mut ops, |_| panic!("no temp needed"));
        let ordered = moves(&ops);
        assert_eq!(
            vec![
                (Operand::Variable(variable(1)), Operand::Variable(variable(2))),
                (Operand::Variable(variable(0)), Operand::Variable(variable(1))),
            ],
            ordered
        );
    }

    #[test]
    fn test_swap_cycle_uses_temp() {
        // v0 -> v1 and v1 -> v0 need a temporary
        let mut resolver = PhiResolver::new();
        resolver.add_move(Operand::Variable(variable(0)), variable(1));
        resolver.add_move(Operand::Variable(variable(1)), variable(0));
        let mut ops = Vec::new();
        let mut temps = 0;
        resolver.resolve(&mut ops, |kind| {
            temps += 1;
            Variable { index: 99, kind }
        });
        assert_eq!(1, temps);
        assert_eq!(3, ops.len());
        let ordered = moves(&ops);
        // Spill first, then both moves can run
        assert_eq!(
            (Operand::Variable(variable(1)), Operand::Variable(variable(99))),
            ordered[0]
        );
    }

    #[test]
    fn test_self_move_elided() {
        let mut resolver = PhiResolver::new();
        resolver.add_move(Operand::Variable(variable(3)), variable(3));
        let mut ops = Vec::new();
        resolver.resolve(&mut ops, |_| panic!("no temp needed"));
        assert!(ops.is_empty());
    }

    #[test]
    fn test_constant_sources() {
        let mut resolver = PhiResolver::new();
        resolver.add_move(Operand::Const(lungo_code::ConstValue::Int(7)), variable(0));
        let mut ops = Vec::new();
        resolver.resolve(&mut ops, |_| panic!("no temp needed"));
        assert_eq!(1, ops.len());
    }
}
