//! The four IR optimization passes, run to a fixed point. Grounded on
//! `x64::ir::Optimizer`/`OptimizationPass` — one pass type per struct,
//! each returning whether it changed anything so the driver can keep
//! iterating until none do.

use super::ir::{Ir, IrFlags, Operand, VReg};
use std::collections::HashSet;

#[derive(Debug, Default, Clone, Copy)]
pub struct OptimizerStats {
    pub removed_instructions: u32,
    pub dead_code: u32,
    pub immediate_readback: u32,
    pub delayed_readback: u32,
    pub duplicate_instruction: u32,
}

pub trait OptimizationPass {
    fn optimize(&mut self, ir: &mut Ir, stats: &mut OptimizerStats) -> bool;
}

/// Removes instructions whose result is never read and that have no side
/// effect worth preserving (no memory write, no flags the block still
/// needs, no trap).
pub struct DeadCodeElimination;

impl OptimizationPass for DeadCodeElimination {
    fn optimize(&mut self, ir: &mut Ir, stats: &mut OptimizerStats) -> bool {
        let mut live: HashSet<VReg> = HashSet::new();
        for instr in ir.instructions.iter().rev() {
            if instr.dst.is_valid() && !live.contains(&instr.dst) && !instr.flags.intersects(IrFlags::SIDE_EFFECT | IrFlags::MEM_WRITE | IrFlags::MAY_TRAP | IrFlags::TERMINATOR) {
                continue;
            }
            for reg in instr.reads() {
                live.insert(reg);
            }
        }
        let mut removable = Vec::new();
        for (idx, instr) in ir.instructions.iter().enumerate() {
            if instr.dst.is_valid() && !live.contains(&instr.dst) && !instr.flags.intersects(IrFlags::SIDE_EFFECT | IrFlags::MEM_WRITE | IrFlags::MAY_TRAP | IrFlags::TERMINATOR) {
                removable.push(idx);
            }
        }
        let changed = !removable.is_empty();
        stats.dead_code += removable.len() as u32;
        stats.removed_instructions += removable.len() as u32;
        ir.remove_instructions(removable);
        changed
    }
}

/// A `StoreGpr` immediately followed (with no intervening read) by a
/// `LoadGpr` of the same register is replaced by reusing the stored
/// value directly — an "immediate" readback because no other instruction
/// comes between the store and the load.
pub struct ImmediateReadBackElimination;

impl OptimizationPass for ImmediateReadBackElimination {
    fn optimize(&mut self, ir: &mut Ir, stats: &mut OptimizerStats) -> bool {
        let mut removable = Vec::new();
        let mut replacements: Vec<(usize, Operand)> = Vec::new();
        for i in 0..ir.instructions.len().saturating_sub(1) {
            let (stored_reg, stored_value) = match (ir.instructions[i].op, ir.instructions[i].in1) {
                (super::ir::IrOp::StoreGpr(r), v) => (r, v),
                _ => continue,
            };
            if let super::ir::IrOp::LoadGpr(r) = ir.instructions[i + 1].op {
                if r == stored_reg {
                    replacements.push((i + 1, stored_value));
                    removable.push(i + 1);
                }
            }
        }
        for (idx, value) in &replacements {
            let dst = ir.instructions[*idx].dst;
            for instr in ir.instructions.iter_mut() {
                if instr.in1 == Operand::Vreg(dst) {
                    instr.in1 = *value;
                }
                if instr.in2 == Operand::Vreg(dst) {
                    instr.in2 = *value;
                }
            }
        }
        let changed = !removable.is_empty();
        stats.immediate_readback += removable.len() as u32;
        stats.removed_instructions += removable.len() as u32;
        ir.remove_instructions(removable);
        changed
    }
}

/// Like immediate readback elimination, but the load may be separated from
/// the store by any number of instructions that don't touch the same
/// register — the value is still known without re-reading it.
pub struct DelayedReadBackElimination;

impl OptimizationPass for DelayedReadBackElimination {
    fn optimize(&mut self, ir: &mut Ir, stats: &mut OptimizerStats) -> bool {
        use super::ir::IrOp;
        let mut removable = Vec::new();
        let mut replacements = Vec::new();
        for i in 0..ir.instructions.len() {
            let (stored_reg, stored_value) = match (ir.instructions[i].op, ir.instructions[i].in1) {
                (IrOp::StoreGpr(r), v) => (r, v),
                _ => continue,
            };
            for j in (i + 1)..ir.instructions.len() {
                match ir.instructions[j].op {
                    IrOp::StoreGpr(r) if r == stored_reg => break,
                    IrOp::LoadGpr(r) if r == stored_reg => {
                        replacements.push((j, stored_value));
                        removable.push(j);
                    }
                    _ if ir.instructions[j].flags.contains(IrFlags::SIDE_EFFECT) => break,
                    _ => {}
                }
            }
        }
        for (idx, value) in &replacements {
            let dst = ir.instructions[*idx].dst;
            for instr in ir.instructions.iter_mut() {
                if instr.in1 == Operand::Vreg(dst) {
                    instr.in1 = *value;
                }
                if instr.in2 == Operand::Vreg(dst) {
                    instr.in2 = *value;
                }
            }
        }
        let changed = !removable.is_empty();
        stats.delayed_readback += removable.len() as u32;
        stats.removed_instructions += removable.len() as u32;
        ir.remove_instructions(removable);
        changed
    }
}

/// Two adjacent instructions computing the identical operation over the
/// identical operands collapse into one, with every user of the second
/// redirected to the first's result.
pub struct DuplicateInstructionElimination;

impl OptimizationPass for DuplicateInstructionElimination {
    fn optimize(&mut self, ir: &mut Ir, stats: &mut OptimizerStats) -> bool {
        let mut removable = Vec::new();
        let mut replacements = Vec::new();
        for i in 0..ir.instructions.len() {
            for j in (i + 1)..ir.instructions.len() {
                let a = &ir.instructions[i];
                let b = &ir.instructions[j];
                if b.flags.contains(IrFlags::SIDE_EFFECT) || b.flags.contains(IrFlags::MEM_WRITE) {
                    break;
                }
                if a.op == b.op && a.in1 == b.in1 && a.in2 == b.in2 && a.dst.is_valid() && b.dst.is_valid() {
                    replacements.push((j, a.dst));
                    removable.push(j);
                }
            }
        }
        for (idx, canonical) in &replacements {
            let dst = ir.instructions[*idx].dst;
            for instr in ir.instructions.iter_mut() {
                if instr.in1 == Operand::Vreg(dst) {
                    instr.in1 = Operand::Vreg(*canonical);
                }
                if instr.in2 == Operand::Vreg(dst) {
                    instr.in2 = Operand::Vreg(*canonical);
                }
            }
        }
        let changed = !removable.is_empty();
        stats.duplicate_instruction += removable.len() as u32;
        stats.removed_instructions += removable.len() as u32;
        ir.remove_instructions(removable);
        changed
    }
}

/// Runs the four passes to a fixed point, in the order the original
/// registers them: dead code, immediate readback, delayed readback,
/// duplicate instruction.
pub struct Optimizer {
    passes: Vec<Box<dyn OptimizationPass>>,
}

impl Default for Optimizer {
    fn default() -> Self {
        Self {
            passes: vec![
                Box::new(DeadCodeElimination),
                Box::new(ImmediateReadBackElimination),
                Box::new(DelayedReadBackElimination),
                Box::new(DuplicateInstructionElimination),
            ],
        }
    }
}

impl Optimizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn optimize(&mut self, ir: &mut Ir) -> OptimizerStats {
        let mut stats = OptimizerStats::default();
        loop {
            let mut changed = false;
            for pass in &mut self.passes {
                changed |= pass.optimize(ir, &mut stats);
            }
            if !changed {
                break;
            }
        }
        stats
    }
}
