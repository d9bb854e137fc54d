//! Dereference Instrumentation Pass (§4.G): inserts a coverage-recording
//! call at every interesting memory access, skipping instructions F marked
//! "no-instrument" and accesses inside allocator/constructor/destructor
//! helpers.
//!
//! The real sequence (cast pointer to integer, shift/mask out the tag, read
//! the return address, hash, conditionally bump the coverage byte) lives at
//! runtime in [`crate::access`]; this IR abstraction has no bitwise
//! operators to model that sequence as instructions, so each instrumented
//! site gets a single synthetic call to `on_access` as a stand-in for it.
//! The call is inserted after the analysis pass has already decided which
//! sites qualify, so it never feeds back into the pass's own dedup
//! tracking.

use std::collections::HashSet;

use crate::config::Sensitivity;
use crate::ir::{Callee, Function, Instruction, InstructionKind, Module, Type, Value};

const ON_ACCESS: &str = "on_access";

/// One site the pass chose to instrument, returned for test and driver
/// introspection rather than only left as a side effect on the module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentedSite {
    pub function: String,
    pub instruction: crate::ir::ValueId,
}

fn is_read(kind: &InstructionKind) -> bool {
    matches!(kind, InstructionKind::Load { .. } | InstructionKind::MaskedLoad { .. })
}

fn is_write(kind: &InstructionKind) -> bool {
    matches!(kind, InstructionKind::Store { .. } | InstructionKind::MaskedStore { .. })
}

/// Atomic RMW and compare-exchange both read and write, so they qualify
/// under every `Sensitivity` variant that covers memory access at all.
fn is_read_modify_write(kind: &InstructionKind) -> bool {
    matches!(kind, InstructionKind::AtomicRmw { .. } | InstructionKind::CmpXchg { .. })
}

fn matches_sensitivity(kind: &InstructionKind, sensitivity: Sensitivity) -> bool {
    if is_read_modify_write(kind) {
        return true;
    }
    if is_read(kind) {
        return sensitivity.includes_reads();
    }
    if is_write(kind) {
        return sensitivity.includes_writes();
    }
    false
}

/// Chooses which instructions in `function` to instrument, applying the
/// per-block "touched underlying object" dedup (§4.G): an access is skipped
/// if this block already instrumented the same pointer value since the last
/// instruction that may clobber memory. Masked accesses are always
/// instrumented and never update the touched set, since a different mask
/// may still select previously-untouched bytes.
///
/// "Underlying object" is approximated here as pointer-value identity
/// (`Value` equality) rather than true alias analysis — this IR has none,
/// and the spec's own dedup description ("set of underlying objects")
/// tolerates the coarser approximation collapsing to exact-value identity.
fn select_sites(function: &Function, sensitivity: Sensitivity) -> Vec<(crate::ir::BlockId, usize)> {
    let mut sites = Vec::new();
    if function.is_instrumentation_helper {
        return sites;
    }

    for block in &function.blocks {
        let mut touched: HashSet<Value> = HashSet::new();
        for (idx, inst) in block.instructions.iter().enumerate() {
            if !inst.kind.is_memory_access() {
                if inst.kind.may_clobber_memory() {
                    touched.clear();
                }
                continue;
            }
            if inst.meta.no_instrument {
                continue;
            }
            if !matches_sensitivity(&inst.kind, sensitivity) {
                continue;
            }
            let Some(pointer) = inst.kind.accessed_pointer() else { continue };

            if inst.kind.is_masked() {
                sites.push((block.id, idx));
                continue;
            }
            if touched.insert(pointer.clone()) {
                sites.push((block.id, idx));
            }
        }
    }
    sites
}

fn build_call(function: &mut Function, pointer: Value) -> Instruction {
    let id = function.fresh_value_id();
    let mut call = Instruction::new(id, InstructionKind::Call { callee: Callee::Direct(ON_ACCESS.into()), args: vec![pointer] }, Type::Void);
    call.meta.nosanitize = true;
    call.meta.no_instrument = true;
    call
}

fn instrument_function(function: &mut Function, sensitivity: Sensitivity) -> Vec<InstrumentedSite> {
    let sites = select_sites(function, sensitivity);
    let mut recorded = Vec::with_capacity(sites.len());

    for &(block_id, idx) in &sites {
        let access_id = function.block_mut(block_id).instructions[idx].id;
        recorded.push(InstrumentedSite { function: function.name.clone(), instruction: access_id });
    }

    // Insert back-to-front per block so earlier indices stay valid; multiple
    // sites never share a block index, so a single reverse pass suffices.
    for &(block_id, idx) in sites.iter().rev() {
        let pointer = function.block_mut(block_id).instructions[idx].kind.accessed_pointer().cloned().expect("selected sites are memory accesses");
        let call = build_call(function, pointer);
        function.block_mut(block_id).instructions.insert(idx + 1, call);
    }

    recorded
}

/// Runs the pass over every function in `module`, returning the sites it
/// instrumented (§4.G).
pub fn run(module: &mut Module, sensitivity: Sensitivity) -> Vec<InstrumentedSite> {
    let mut recorded = Vec::new();
    for function in &mut module.functions {
        recorded.extend(instrument_function(function, sensitivity));
    }
    recorded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Constant, Function, Instruction, Module, Type, Value};

    fn function_with_two_loads_same_pointer() -> Function {
        let mut f = Function::new("f", vec![Type::Ptr(Box::new(Type::i8()))], Type::Void);
        let entry = f.push_block("entry");
        for _ in 0..2 {
            let id = f.fresh_value_id();
            f.block_mut(entry).push(Instruction::new(id, InstructionKind::Load { pointer: Value::Argument(0), ty: Type::i8() }, Type::i8()));
        }
        let ret_id = f.fresh_value_id();
        f.block_mut(entry).push(Instruction::new(ret_id, InstructionKind::Return { value: None }, Type::Void));
        f
    }

    #[test]
    fn dedups_repeated_load_of_same_pointer_in_block() {
        let mut module = Module::new("m");
        module.add_function(function_with_two_loads_same_pointer());
        let sites = run(&mut module, Sensitivity::MemAccess);
        assert_eq!(sites.len(), 1);

        let f = module.function("f").unwrap();
        let calls: Vec<_> = f.find_calls(ON_ACCESS).collect();
        assert_eq!(calls.len(), 1);
    }

    #[test]
    fn call_between_loads_resets_dedup() {
        let mut module = Module::new("m");
        let mut f = Function::new("f", vec![Type::Ptr(Box::new(Type::i8()))], Type::Void);
        let entry = f.push_block("entry");
        let load1_id = f.fresh_value_id();
        f.block_mut(entry).push(Instruction::new(load1_id, InstructionKind::Load { pointer: Value::Argument(0), ty: Type::i8() }, Type::i8()));
        let call_id = f.fresh_value_id();
        f.block_mut(entry).push(Instruction::new(
            call_id,
            InstructionKind::Call { callee: Callee::Direct("might_alias".into()), args: vec![] },
            Type::Void,
        ));
        let load2_id = f.fresh_value_id();
        f.block_mut(entry).push(Instruction::new(load2_id, InstructionKind::Load { pointer: Value::Argument(0), ty: Type::i8() }, Type::i8()));
        module.add_function(f);

        let sites = run(&mut module, Sensitivity::MemAccess);
        assert_eq!(sites.len(), 2);
    }

    #[test]
    fn no_instrument_marker_is_honored() {
        let mut module = Module::new("m");
        let mut f = Function::new("f", vec![Type::Ptr(Box::new(Type::i8()))], Type::Void);
        let entry = f.push_block("entry");
        let mut load = Instruction::new(f.fresh_value_id(), InstructionKind::Load { pointer: Value::Argument(0), ty: Type::i8() }, Type::i8());
        load.meta.no_instrument = true;
        f.block_mut(entry).push(load);
        module.add_function(f);

        let sites = run(&mut module, Sensitivity::MemAccess);
        assert!(sites.is_empty());
    }

    #[test]
    fn read_only_sensitivity_skips_stores() {
        let mut module = Module::new("m");
        let mut f = Function::new("f", vec![Type::Ptr(Box::new(Type::i8()))], Type::Void);
        let entry = f.push_block("entry");
        let store_id = f.fresh_value_id();
        f.block_mut(entry).push(Instruction::new(
            store_id,
            InstructionKind::Store { pointer: Value::Argument(0), value: Value::Constant(Constant::Int(1)) },
            Type::Void,
        ));
        module.add_function(f);

        let sites = run(&mut module, Sensitivity::MemRead);
        assert!(sites.is_empty());
    }

    #[test]
    fn masked_access_is_always_instrumented() {
        let mut module = Module::new("m");
        let mut f = Function::new("f", vec![Type::Ptr(Box::new(Type::i8()))], Type::Void);
        let entry = f.push_block("entry");
        for _ in 0..2 {
            let id = f.fresh_value_id();
            f.block_mut(entry).push(Instruction::new(
                id,
                InstructionKind::MaskedLoad { pointer: Value::Argument(0), mask: Value::Constant(Constant::Int(1)), ty: Type::i8() },
                Type::i8(),
            ));
        }
        module.add_function(f);

        let sites = run(&mut module, Sensitivity::MemAccess);
        assert_eq!(sites.len(), 2);
    }

    #[test]
    fn instrumentation_helper_function_is_skipped() {
        let mut module = Module::new("m");
        let mut f = function_with_two_loads_same_pointer();
        f.is_instrumentation_helper = true;
        module.add_function(f);

        let sites = run(&mut module, Sensitivity::MemAccess);
        assert!(sites.is_empty());
    }
}
