//! Dead code removal on a [`World`].
//!
//! `cleanup` repeats its sub-passes until none of them changes anything, so
//! running it on an already clean world is a no-op.

use super::*;
use hashbrown::{HashMap, HashSet};

/// Remove everything that cannot influence an exported function.
pub fn cleanup(world: &mut World) {
    let before = world.inst_count();
    let mut rounds = 0;

    loop {
        rounds += 1;
        let mut changed = remove_unreachable_functions(world);
        for func in world.functions.iter_mut().filter(|f| !f.is_declaration()) {
            changed |= remove_unreachable_blocks(func);
            changed |= remove_dead_slots(func);
            changed |= remove_dead_insts(func);
        }
        if !changed {
            break;
        }
    }

    log::debug!(
        "cleanup: {} -> {} instructions, {} functions, {} round(s)",
        before,
        world.inst_count(),
        world.functions.len(),
        rounds
    );
}

/// Drop functions (including imports) that no export can call.
fn remove_unreachable_functions(world: &mut World) -> bool {
    let mut live = HashSet::new();
    let mut worklist: Vec<FuncId> = (0..world.functions.len() as u32)
        .map(FuncId)
        .filter(|&id| world.function(id).linkage == Linkage::Export)
        .collect();

    while let Some(id) = worklist.pop() {
        if !live.insert(id) {
            continue;
        }
        for block in &world.function(id).blocks {
            for inst in &block.insts {
                if let InstKind::Call(callee, _) = inst.kind {
                    if !live.contains(&callee) {
                        worklist.push(callee);
                    }
                }
            }
        }
    }

    if live.len() == world.functions.len() {
        return false;
    }

    let mut remap = HashMap::new();
    let mut kept = Vec::with_capacity(live.len());
    for (index, func) in std::mem::take(&mut world.functions).into_iter().enumerate() {
        let old = FuncId(index as u32);
        if live.contains(&old) {
            remap.insert(old, FuncId(kept.len() as u32));
            kept.push(func);
        } else {
            log::trace!("cleanup: removing unreachable function `{}`", func.name);
        }
    }

    for func in &mut kept {
        for block in &mut func.blocks {
            for inst in &mut block.insts {
                if let InstKind::Call(callee, _) = &mut inst.kind {
                    *callee = remap[&*callee];
                }
            }
        }
    }

    world.functions = kept;
    true
}

fn remove_unreachable_blocks(func: &mut Function) -> bool {
    let mut reachable = vec![false; func.blocks.len()];
    let mut stack = vec![BlockId::ENTRY];
    while let Some(id) = stack.pop() {
        if std::mem::replace(&mut reachable[id.index()], true) {
            continue;
        }
        stack.extend(func.block(id).term.successors());
    }

    if reachable.iter().all(|&r| r) {
        return false;
    }

    let mut remap = vec![None; func.blocks.len()];
    let mut next = 0u32;
    for (index, &live) in reachable.iter().enumerate() {
        if live {
            remap[index] = Some(BlockId(next));
            next += 1;
        }
    }

    let blocks = std::mem::take(&mut func.blocks);
    func.blocks = blocks
        .into_iter()
        .zip(reachable)
        .filter_map(|(block, live)| live.then_some(block))
        .collect();

    for block in &mut func.blocks {
        // Successors of a reachable block are reachable.
        block
            .term
            .map_blocks(|b| remap[b.index()].unwrap_or(BlockId::ENTRY));
    }
    true
}

/// Delete stack slots that are written but never read.
fn remove_dead_slots(func: &mut Function) -> bool {
    let mut loaded = HashSet::new();
    let mut slots = HashSet::new();
    for block in &func.blocks {
        for inst in &block.insts {
            match inst.kind {
                InstKind::Load(ptr) => {
                    loaded.insert(ptr);
                }
                InstKind::Alloca(_) => {
                    if let Some(result) = inst.result {
                        slots.insert(result);
                    }
                }
                _ => {}
            }
        }
    }

    let dead: HashSet<Value> = slots.difference(&loaded).copied().collect();
    if dead.is_empty() {
        return false;
    }

    for block in &mut func.blocks {
        block.insts.retain(|inst| match inst.kind {
            InstKind::Alloca(_) => !inst.result.is_some_and(|r| dead.contains(&r)),
            InstKind::Store { ptr, .. } => !dead.contains(&ptr),
            _ => true,
        });
    }
    true
}

/// Delete side-effect free instructions whose result is never used.
fn remove_dead_insts(func: &mut Function) -> bool {
    let mut changed = false;

    loop {
        let mut uses = vec![0u32; func.value_types.len()];
        for block in &func.blocks {
            for inst in &block.insts {
                for op in inst.kind.operands() {
                    uses[op.index()] += 1;
                }
            }
            for op in block.term.operands() {
                uses[op.index()] += 1;
            }
        }

        let mut removed = false;
        for block in &mut func.blocks {
            let before = block.insts.len();
            block.insts.retain(|inst| match inst.result {
                Some(result) => inst.kind.has_side_effects() || uses[result.index()] > 0,
                None => true,
            });
            removed |= block.insts.len() != before;
        }

        if !removed {
            return changed;
        }
        changed = true;
    }
}
