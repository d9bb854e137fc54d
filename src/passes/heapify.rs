//! Heapification Pass (§4.F): promotes eligible fixed-size stack and
//! global arrays to dynamic allocations served by the tagged allocator.

use std::collections::{HashMap, HashSet};

use crate::config::HeapifyPolicy;
use crate::ir::{
    BlockId, Callee, Constant, Function, GlobalVariable, Instruction, InstructionKind, Linkage, Module, StructRegistry,
    Type, Value, ValueId,
};
use crate::passes::tagging::TagAssigner;

fn eligible_array(ty: &Type, policy: &HeapifyPolicy) -> Option<(Type, usize)> {
    match ty {
        Type::Array(elem, n) if *n >= policy.min_elements && *n <= policy.max_elements => Some(((**elem).clone(), *n)),
        _ => None,
    }
}

/// Drops the leading "index 0" a fixed-array GEP carried and reroutes the
/// base through a freshly inserted load of the (now-pointer-typed) slot
/// (§4.F: "load the pointer first, then index the loaded pointer, skipping
/// the leading index 0").
fn rewrite_geps(function: &mut Function, alloca_id: ValueId, pointee_ty: &Type) {
    let mut sites: Vec<(BlockId, usize)> = Vec::new();
    for block in &function.blocks {
        for (idx, inst) in block.instructions.iter().enumerate() {
            if let InstructionKind::GetElementPtr { base: Value::Result(base_id), .. } = &inst.kind {
                if *base_id == alloca_id {
                    sites.push((block.id, idx));
                }
            }
        }
    }
    // Insert from the back so earlier indices in the same block stay valid.
    for (block_id, idx) in sites.into_iter().rev() {
        let load_id = function.fresh_value_id();
        let mut load = Instruction::new(
            load_id,
            InstructionKind::Load { pointer: Value::Result(alloca_id), ty: pointee_ty.clone() },
            pointee_ty.clone(),
        );
        load.meta.no_instrument = true;
        let block = function.block_mut(block_id);
        if let InstructionKind::GetElementPtr { base, indices } = &mut block.instructions[idx].kind {
            *base = Value::Result(load_id);
            if !indices.is_empty() {
                indices.remove(0);
            }
        }
        block.instructions.insert(idx, load);
    }
}

fn make_malloc_call(function: &mut Function, tag: u16, byte_size: i64, result_ty: Type) -> Instruction {
    let id = function.fresh_value_id();
    let mut call = Instruction::new(
        id,
        InstructionKind::Call {
            callee: Callee::Direct("tagged_malloc".into()),
            args: vec![Value::Constant(Constant::Int(tag as i64)), Value::Constant(Constant::Int(byte_size))],
        },
        result_ty,
    );
    call.meta.no_instrument = true;
    call
}

fn make_free_call(function: &mut Function, pointer: Value) -> Instruction {
    let id = function.fresh_value_id();
    let mut call = Instruction::new(id, InstructionKind::Call { callee: Callee::Direct("free".into()), args: vec![pointer] }, Type::Void);
    call.meta.no_instrument = true;
    call
}

/// Returns a description of the first use of `alloca_id` that this pass's
/// GEP/lifetime-marker rewrite schema doesn't cover, if any. §4.F's
/// per-object transformation also covers stores of the array's address,
/// phi/select/return edges carrying it, calls taking it, and memory
/// intrinsics or atomics targeting it directly — none of which get the
/// pointer cast + load they'd need here, so such an object is left alone
/// rather than silently mis-rewritten.
fn unsupported_user(function: &Function, alloca_id: ValueId) -> Option<&'static str> {
    let is_self = |v: &Value| matches!(v, Value::Result(id) if *id == alloca_id);
    for block in &function.blocks {
        for inst in &block.instructions {
            match &inst.kind {
                InstructionKind::GetElementPtr { base, .. } if is_self(base) => {}
                InstructionKind::LifetimeStart { object } | InstructionKind::LifetimeEnd { object } if is_self(object) => {}
                InstructionKind::Load { pointer, .. } if is_self(pointer) => return Some("a load of the array's address"),
                InstructionKind::Store { value, .. } if is_self(value) => return Some("a store of the array's address"),
                InstructionKind::Return { value: Some(v) } if is_self(v) => return Some("a return of the array's address"),
                InstructionKind::Phi { incoming } if incoming.iter().any(|(_, v)| is_self(v)) => return Some("a phi carrying the array"),
                InstructionKind::Select { if_true, if_false, .. } if is_self(if_true) || is_self(if_false) => {
                    return Some("a select carrying the array")
                }
                InstructionKind::Call { args, .. } if args.iter().any(is_self) => return Some("a call taking the array's address"),
                InstructionKind::MemIntrinsic { dest, .. } if is_self(dest) => return Some("a memory intrinsic targeting the array"),
                InstructionKind::AtomicRmw { pointer, value } if is_self(pointer) || is_self(value) => {
                    return Some("an atomicrmw on the array")
                }
                InstructionKind::CmpXchg { pointer, expected, new } if is_self(pointer) || is_self(expected) || is_self(new) => {
                    return Some("a cmpxchg on the array")
                }
                InstructionKind::MaskedLoad { pointer, mask, .. } if is_self(pointer) || is_self(mask) => {
                    return Some("a masked load on the array")
                }
                InstructionKind::MaskedStore { pointer, value, mask } if is_self(pointer) || is_self(value) || is_self(mask) => {
                    return Some("a masked store on the array")
                }
                _ => {}
            }
        }
    }
    None
}

/// Promotes one eligible `alloca` in `function` to a heap allocation,
/// handling lifetime markers per §4.F's lifetime-handling bullets. Returns
/// `false` without modifying `function` if the alloca has a user this pass
/// doesn't know how to rewrite.
fn heapify_alloca(
    function: &mut Function,
    block_id: BlockId,
    idx: usize,
    alloca_id: ValueId,
    elem_ty: Type,
    n: usize,
    registry: &StructRegistry,
    assigner: &mut TagAssigner,
) -> bool {
    if let Some(reason) = unsupported_user(function, alloca_id) {
        log::warn!("fuzzalloc: leaving array alloca unpromoted in `{}`: {reason} is not supported by heapification", function.name);
        return false;
    }

    let tag = assigner.next_tag();
    let ptr_ty = elem_ty.clone().ptr_to();
    let byte_size = (registry.size_of(&elem_ty).unwrap_or(8) * n) as i64;

    {
        let block = function.block_mut(block_id);
        block.instructions[idx].kind = InstructionKind::Alloca { ty: ptr_ty.clone() };
        block.instructions[idx].ty = ptr_ty.clone();
    }

    let lifetime_starts: Vec<(BlockId, usize)> = function
        .blocks
        .iter()
        .flat_map(|b| b.instructions.iter().enumerate().map(move |(i, inst)| (b.id, i, inst)))
        .filter(|(_, _, inst)| matches!(&inst.kind, InstructionKind::LifetimeStart { object: Value::Result(id) } if *id == alloca_id))
        .map(|(block, i, _)| (block, i))
        .collect();
    let lifetime_ends: Vec<(BlockId, usize)> = function
        .blocks
        .iter()
        .flat_map(|b| b.instructions.iter().enumerate().map(move |(i, inst)| (b.id, i, inst)))
        .filter(|(_, _, inst)| matches!(&inst.kind, InstructionKind::LifetimeEnd { object: Value::Result(id) } if *id == alloca_id))
        .map(|(block, i, _)| (block, i))
        .collect();

    if lifetime_starts.is_empty() {
        let malloc = make_malloc_call(function, tag, byte_size, ptr_ty.clone());
        let malloc_id = malloc.id;
        let mut store = Instruction::new(
            function.fresh_value_id(),
            InstructionKind::Store { pointer: Value::Result(alloca_id), value: Value::Result(malloc_id) },
            Type::Void,
        );
        store.meta.no_instrument = true;
        let block = function.block_mut(block_id);
        block.instructions.insert(idx + 1, store);
        block.instructions.insert(idx + 1, malloc);

        // Free before every function-exit instruction (return-based frees;
        // §4.F: "one free before every function-exit instruction").
        let return_sites: Vec<(BlockId, usize)> = function
            .blocks
            .iter()
            .flat_map(|b| b.instructions.iter().enumerate().map(move |(i, inst)| (b.id, i, inst)))
            .filter(|(_, _, inst)| matches!(inst.kind, InstructionKind::Return { .. }))
            .map(|(block, i, _)| (block, i))
            .collect();
        for (ret_block, ret_idx) in return_sites.into_iter().rev() {
            let load_id = function.fresh_value_id();
            let mut load = Instruction::new(load_id, InstructionKind::Load { pointer: Value::Result(alloca_id), ty: ptr_ty.clone() }, ptr_ty.clone());
            load.meta.no_instrument = true;
            let free = make_free_call(function, Value::Result(load_id));
            let block = function.block_mut(ret_block);
            block.instructions.insert(ret_idx, free);
            block.instructions.insert(ret_idx, load);
        }
    } else {
        // Insert malloc right after each lifetime.start, free right before
        // each matching lifetime.end; no return-based free (double-free
        // avoidance, §4.F).
        for (start_block, start_idx) in lifetime_starts.into_iter().rev() {
            let malloc = make_malloc_call(function, tag, byte_size, ptr_ty.clone());
            let malloc_id = malloc.id;
            let mut store = Instruction::new(
                function.fresh_value_id(),
                InstructionKind::Store { pointer: Value::Result(alloca_id), value: Value::Result(malloc_id) },
                Type::Void,
            );
            store.meta.no_instrument = true;
            let block = function.block_mut(start_block);
            block.instructions.insert(start_idx + 1, store);
            block.instructions.insert(start_idx + 1, malloc);
        }
        for (end_block, end_idx) in lifetime_ends.into_iter().rev() {
            let load_id = function.fresh_value_id();
            let mut load = Instruction::new(load_id, InstructionKind::Load { pointer: Value::Result(alloca_id), ty: ptr_ty.clone() }, ptr_ty.clone());
            load.meta.no_instrument = true;
            let free = make_free_call(function, Value::Result(load_id));
            let block = function.block_mut(end_block);
            block.instructions.insert(end_idx, free);
            block.instructions.insert(end_idx, load);
        }
    }

    rewrite_geps(function, alloca_id, &ptr_ty);
    true
}

fn heapify_function(function: &mut Function, policy: &HeapifyPolicy, registry: &StructRegistry, assigner: &mut TagAssigner) {
    let promotions: Vec<(BlockId, usize, ValueId, Type, usize)> = function
        .blocks
        .iter()
        .flat_map(|b| b.instructions.iter().enumerate().map(move |(i, inst)| (b.id, i, inst)))
        .filter_map(|(block_id, idx, inst)| match &inst.kind {
            InstructionKind::Alloca { ty } => eligible_array(ty, policy).map(|(elem, n)| (block_id, idx, inst.id, elem, n)),
            _ => None,
        })
        .collect();

    for (block_id, idx, alloca_id, elem_ty, n) in promotions {
        heapify_alloca(function, block_id, idx, alloca_id, elem_ty, n, registry, assigner);
    }
}

/// Orders promotable globals so that any global whose initializer refers to
/// another promotable global is rewritten after its dependency (§9:
/// "model the dependency as a DAG over globals and topologically order the
/// rewrite" — DESIGN.md's open-question #3: explicit, not left to a
/// downstream dead-constant pass).
fn topo_sort_promotable(module: &Module, promotable: &[usize]) -> Vec<usize> {
    let index_by_name: HashMap<&str, usize> = promotable.iter().map(|&i| (module.globals[i].name.as_str(), i)).collect();
    let mut in_degree: HashMap<usize, usize> = promotable.iter().map(|&i| (i, 0)).collect();
    let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();

    for &i in promotable {
        if let Some(Constant::GlobalRef(dep_name)) = &module.globals[i].initializer {
            if let Some(&dep_idx) = index_by_name.get(dep_name.as_str()) {
                *in_degree.get_mut(&i).unwrap() += 1;
                dependents.entry(dep_idx).or_default().push(i);
            }
        }
    }

    let mut ready: Vec<usize> = promotable.iter().copied().filter(|i| in_degree[i] == 0).collect();
    let mut order = Vec::new();
    let mut seen = HashSet::new();
    while let Some(i) = ready.pop() {
        if !seen.insert(i) {
            continue;
        }
        order.push(i);
        for &dependent in dependents.get(&i).into_iter().flatten() {
            let degree = in_degree.get_mut(&dependent).unwrap();
            *degree -= 1;
            if *degree == 0 {
                ready.push(dependent);
            }
        }
    }
    // Any leftover entries share a cycle; emit them in original order
    // rather than dropping them silently.
    for &i in promotable {
        if !seen.contains(&i) {
            order.push(i);
        }
    }
    order
}

const CTOR_NAME: &str = "fuzzalloc_heapify_ctor";
const DTOR_NAME: &str = "fuzzalloc_heapify_dtor";

/// Promotes eligible module-global arrays via a module constructor/
/// destructor pair (§4.F globals bullets).
fn heapify_globals(module: &mut Module, policy: &HeapifyPolicy, registry: &StructRegistry, assigner: &mut TagAssigner) {
    let promotable: Vec<usize> = module
        .globals
        .iter()
        .enumerate()
        .filter(|(_, g)| !g.is_constant && eligible_array(&g.ty, policy).is_some())
        .map(|(i, _)| i)
        .collect();
    if promotable.is_empty() {
        return;
    }
    let order = topo_sort_promotable(module, &promotable);

    let mut ctor = Function::new(CTOR_NAME, vec![], Type::Void);
    ctor.linkage = Linkage::Internal;
    ctor.is_instrumentation_helper = true;
    let ctor_entry = ctor.push_block("entry");

    let mut dtor = Function::new(DTOR_NAME, vec![], Type::Void);
    dtor.linkage = Linkage::Internal;
    dtor.is_instrumentation_helper = true;
    let dtor_entry = dtor.push_block("entry");

    for i in order {
        let (elem_ty, n, name, initializer, linkage) = {
            let g = &module.globals[i];
            let (elem_ty, n) = eligible_array(&g.ty, policy).expect("filtered above");
            (elem_ty, n, g.name.clone(), g.initializer.clone(), g.linkage)
        };
        let tag = assigner.next_tag();
        let ptr_ty = elem_ty.clone().ptr_to();
        let companion_name = format!("{name}__heap");

        module.globals.push(GlobalVariable {
            name: companion_name.clone(),
            ty: ptr_ty.clone(),
            initializer: Some(Constant::Null),
            linkage,
            is_constant: false,
        });

        let byte_size = (registry.size_of(&elem_ty).unwrap_or(8) * n) as i64;
        let malloc = make_malloc_call(&mut ctor, tag, byte_size, ptr_ty.clone());
        let malloc_id = malloc.id;
        ctor.block_mut(ctor_entry).push(malloc);
        let store_id = ctor.fresh_value_id();
        ctor.block_mut(ctor_entry).push(Instruction::new(
            store_id,
            InstructionKind::Store { pointer: Value::Global(companion_name.clone()), value: Value::Result(malloc_id) },
            Type::Void,
        ));
        if matches!(initializer, None | Some(Constant::ZeroInitializer)) {
            let memset_id = ctor.fresh_value_id();
            ctor.block_mut(ctor_entry).push(Instruction::new(
                memset_id,
                InstructionKind::MemIntrinsic { name: "memset".into(), dest: Value::Result(malloc_id), align: 1 },
                Type::Void,
            ));
        }

        let load_id = dtor.fresh_value_id();
        dtor.block_mut(dtor_entry).push(Instruction::new(
            load_id,
            InstructionKind::Load { pointer: Value::Global(companion_name.clone()), ty: ptr_ty.clone() },
            ptr_ty.clone(),
        ));
        let free = make_free_call(&mut dtor, Value::Result(load_id));
        dtor.block_mut(dtor_entry).push(free);
    }

    module.add_function(ctor);
    module.add_function(dtor);
}

pub fn run(module: &mut Module, policy: &HeapifyPolicy, seed: u64) {
    let registry = StructRegistry::from_module(module);
    let mut assigner = TagAssigner::new(seed);
    for function in &mut module.functions {
        heapify_function(function, policy, &registry, &mut assigner);
    }
    heapify_globals(module, policy, &registry, &mut assigner);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Function, Instruction, Module};

    fn default_policy() -> HeapifyPolicy {
        HeapifyPolicy { min_elements: 8, max_elements: 1 << 20 }
    }

    #[test]
    fn promotes_eligible_stack_array() {
        let mut module = Module::new("m");
        let mut main = Function::new("main", vec![], Type::Int(32));
        let entry = main.push_block("entry");
        let alloca_id = main.fresh_value_id();
        main.block_mut(entry).push(Instruction::new(alloca_id, InstructionKind::Alloca { ty: Type::Array(Box::new(Type::Int(32)), 32) }, Type::Array(Box::new(Type::Int(32)), 32)));
        let gep_id = main.fresh_value_id();
        main.block_mut(entry).push(Instruction::new(
            gep_id,
            InstructionKind::GetElementPtr { base: Value::Result(alloca_id), indices: vec![Value::Constant(Constant::Int(0)), Value::Constant(Constant::Int(7))] },
            Type::Ptr(Box::new(Type::Int(32))),
        ));
        let ret_id = main.fresh_value_id();
        main.block_mut(entry).push(Instruction::new(ret_id, InstructionKind::Return { value: None }, Type::Void));
        module.add_function(main);

        run(&mut module, &default_policy(), 11);

        let main = module.function("main").unwrap();
        let alloca = main.instructions().find(|i| i.id == alloca_id).unwrap();
        assert_eq!(alloca.kind, InstructionKind::Alloca { ty: Type::Int(32).ptr_to() });

        let has_malloc = main.find_calls("tagged_malloc").next().is_some();
        assert!(has_malloc);
        let has_free = main.find_calls("free").next().is_some();
        assert!(has_free);

        let gep = main.instructions().find(|i| i.id == gep_id).unwrap();
        if let InstructionKind::GetElementPtr { indices, .. } = &gep.kind {
            assert_eq!(indices.len(), 1);
        } else {
            panic!("expected gep");
        }
    }

    #[test]
    fn small_array_is_left_alone() {
        let mut module = Module::new("m");
        let mut main = Function::new("main", vec![], Type::Void);
        let entry = main.push_block("entry");
        let alloca_id = main.fresh_value_id();
        main.block_mut(entry).push(Instruction::new(
            alloca_id,
            InstructionKind::Alloca { ty: Type::Array(Box::new(Type::Int(32)), 2) },
            Type::Array(Box::new(Type::Int(32)), 2),
        ));
        module.add_function(main);

        run(&mut module, &default_policy(), 1);
        let main = module.function("main").unwrap();
        assert!(main.find_calls("tagged_malloc").next().is_none());
    }

    #[test]
    fn lifetime_markers_suppress_return_based_free() {
        let mut module = Module::new("m");
        let mut main = Function::new("main", vec![], Type::Void);
        let entry = main.push_block("entry");
        let alloca_id = main.fresh_value_id();
        main.block_mut(entry).push(Instruction::new(alloca_id, InstructionKind::Alloca { ty: Type::Array(Box::new(Type::Int(8)), 16) }, Type::Array(Box::new(Type::Int(8)), 16)));
        let lt_start_id = main.fresh_value_id();
        main.block_mut(entry).push(Instruction::new(lt_start_id, InstructionKind::LifetimeStart { object: Value::Result(alloca_id) }, Type::Void));
        let lt_end_id = main.fresh_value_id();
        main.block_mut(entry).push(Instruction::new(lt_end_id, InstructionKind::LifetimeEnd { object: Value::Result(alloca_id) }, Type::Void));
        let ret_id = main.fresh_value_id();
        main.block_mut(entry).push(Instruction::new(ret_id, InstructionKind::Return { value: None }, Type::Void));
        module.add_function(main);

        run(&mut module, &default_policy(), 3);
        let main = module.function("main").unwrap();
        let free_calls: Vec<_> = main.find_calls("free").collect();
        assert_eq!(free_calls.len(), 1);
    }

    #[test]
    fn malloc_size_scales_with_element_type_not_a_fixed_word() {
        let mut module = Module::new("m");
        let mut main = Function::new("main", vec![], Type::Void);
        let entry = main.push_block("entry");
        let alloca_id = main.fresh_value_id();
        main.block_mut(entry).push(Instruction::new(
            alloca_id,
            InstructionKind::Alloca { ty: Type::Array(Box::new(Type::i8()), 64) },
            Type::Array(Box::new(Type::i8()), 64),
        ));
        module.add_function(main);

        run(&mut module, &default_policy(), 9);

        let main = module.function("main").unwrap();
        let malloc = main.find_calls("tagged_malloc").next().unwrap();
        let InstructionKind::Call { args, .. } = &malloc.kind else { panic!("expected call") };
        assert_eq!(args[1], Value::Constant(Constant::Int(64)), "one byte per i8 element, not 8");
    }

    #[test]
    fn bookkeeping_store_and_load_are_marked_no_instrument() {
        let mut module = Module::new("m");
        let mut main = Function::new("main", vec![], Type::Void);
        let entry = main.push_block("entry");
        let alloca_id = main.fresh_value_id();
        main.block_mut(entry).push(Instruction::new(alloca_id, InstructionKind::Alloca { ty: Type::Array(Box::new(Type::Int(32)), 32) }, Type::Array(Box::new(Type::Int(32)), 32)));
        let gep_id = main.fresh_value_id();
        main.block_mut(entry).push(Instruction::new(
            gep_id,
            InstructionKind::GetElementPtr { base: Value::Result(alloca_id), indices: vec![Value::Constant(Constant::Int(0)), Value::Constant(Constant::Int(3))] },
            Type::Int(32).ptr_to(),
        ));
        let ret_id = main.fresh_value_id();
        main.block_mut(entry).push(Instruction::new(ret_id, InstructionKind::Return { value: None }, Type::Void));
        module.add_function(main);

        run(&mut module, &default_policy(), 11);

        let main = module.function("main").unwrap();
        for inst in main.instructions() {
            match &inst.kind {
                InstructionKind::Store { .. } | InstructionKind::Load { .. } => {
                    assert!(inst.meta.no_instrument, "heapification bookkeeping access {:?} should be no_instrument", inst.kind)
                }
                InstructionKind::Call { callee: Callee::Direct(name), .. } if name == "tagged_malloc" || name == "free" => {
                    assert!(inst.meta.no_instrument)
                }
                _ => {}
            }
        }
    }

    #[test]
    fn array_returned_by_value_is_left_unpromoted() {
        let mut module = Module::new("m");
        let mut main = Function::new("main", vec![], Type::Array(Box::new(Type::Int(32)), 32).ptr_to());
        let entry = main.push_block("entry");
        let alloca_id = main.fresh_value_id();
        main.block_mut(entry).push(Instruction::new(alloca_id, InstructionKind::Alloca { ty: Type::Array(Box::new(Type::Int(32)), 32) }, Type::Array(Box::new(Type::Int(32)), 32)));
        let ret_id = main.fresh_value_id();
        main.block_mut(entry).push(Instruction::new(ret_id, InstructionKind::Return { value: Some(Value::Result(alloca_id)) }, Type::Void));
        module.add_function(main);

        run(&mut module, &default_policy(), 1);

        let main = module.function("main").unwrap();
        assert!(main.find_calls("tagged_malloc").next().is_none());
        let alloca = main.instructions().find(|i| i.id == alloca_id).unwrap();
        assert_eq!(alloca.kind, InstructionKind::Alloca { ty: Type::Array(Box::new(Type::Int(32)), 32) });
    }

    #[test]
    fn promotes_global_array_via_ctor_dtor() {
        let mut module = Module::new("m");
        module.globals.push(GlobalVariable {
            name: "g_buf".into(),
            ty: Type::Array(Box::new(Type::Int(8)), 64),
            initializer: Some(Constant::ZeroInitializer),
            linkage: Linkage::Internal,
            is_constant: false,
        });

        run(&mut module, &default_policy(), 5);

        assert!(module.global("g_buf__heap").is_some());
        let ctor = module.function(CTOR_NAME).expect("constructor emitted");
        assert!(ctor.find_calls("tagged_malloc").next().is_some());
        let dtor = module.function(DTOR_NAME).expect("destructor emitted");
        assert!(dtor.find_calls("free").next().is_some());
    }
}
