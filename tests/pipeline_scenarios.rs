//! End-to-end coverage of the D-G transformation pipeline, composing all
//! four passes through `passes::run_pipeline` rather than exercising them
//! one at a time (each pass already has its own unit tests alongside its
//! implementation).

use fuzzalloc::config::Config;
use fuzzalloc::ir::{
    Callee, Constant, Function, GlobalVariable, Instruction, InstructionKind, Linkage, Module, Type, Value,
};
use fuzzalloc::passes;
use fuzzalloc::tag::{TAG_MAX, TAG_MIN};
use fuzzalloc::taglog;

fn default_config() -> Config {
    Config { tag_log_path: None, whitelist_path: None, ..Config::default() }
}

fn module_with_malloc_and_deref() -> Module {
    let mut module = Module::new("m");
    let mut main = Function::new("main", vec![], Type::i8().ptr_to());
    let entry = main.push_block("entry");

    let malloc_id = main.fresh_value_id();
    main.block_mut(entry).push(Instruction::new(
        malloc_id,
        InstructionKind::Call { callee: Callee::Direct("malloc".into()), args: vec![Value::Constant(Constant::Int(64))] },
        Type::i8().ptr_to(),
    ));
    let load_id = main.fresh_value_id();
    main.block_mut(entry).push(Instruction::new(
        load_id,
        InstructionKind::Load { pointer: Value::Result(malloc_id), ty: Type::i8() },
        Type::i8(),
    ));
    let ret_id = main.fresh_value_id();
    main.block_mut(entry).push(Instruction::new(
        ret_id,
        InstructionKind::Return { value: Some(Value::Result(malloc_id)) },
        Type::Void,
    ));
    module.add_function(main);
    module
}

#[test]
fn malloc_call_is_tagged_and_its_use_instrumented() {
    let mut module = module_with_malloc_and_deref();
    let sites = passes::run_pipeline(&mut module, &default_config(), 100).unwrap();

    let main = module.function("main").unwrap();
    let tagged: Vec<_> = main.instructions().filter_map(|i| i.meta.tagged_allocation).collect();
    assert_eq!(tagged.len(), 1);
    assert!((TAG_MIN..=TAG_MAX).contains(&tagged[0]));
    assert!(main.find_calls("tagged_malloc").next().is_some());

    // The load off the tagged pointer should have been instrumented.
    assert!(!sites.is_empty());
    assert!(main.find_calls("on_access").next().is_some());
}

#[test]
fn heapifies_stack_array_end_to_end() {
    let mut module = Module::new("m");
    let mut main = Function::new("main", vec![], Type::Void);
    let entry = main.push_block("entry");
    let alloca_id = main.fresh_value_id();
    main.block_mut(entry).push(Instruction::new(
        alloca_id,
        InstructionKind::Alloca { ty: Type::Array(Box::new(Type::Int(32)), 32) },
        Type::Array(Box::new(Type::Int(32)), 32),
    ));
    let gep_id = main.fresh_value_id();
    main.block_mut(entry).push(Instruction::new(
        gep_id,
        InstructionKind::GetElementPtr {
            base: Value::Result(alloca_id),
            indices: vec![Value::Constant(Constant::Int(0)), Value::Constant(Constant::Int(3))],
        },
        Type::Int(32).ptr_to(),
    ));
    let store_id = main.fresh_value_id();
    main.block_mut(entry).push(Instruction::new(
        store_id,
        InstructionKind::Store { pointer: Value::Result(gep_id), value: Value::Constant(Constant::Int(7)) },
        Type::Void,
    ));
    let ret_id = main.fresh_value_id();
    main.block_mut(entry).push(Instruction::new(ret_id, InstructionKind::Return { value: None }, Type::Void));
    module.add_function(main);

    passes::run_pipeline(&mut module, &default_config(), 11).unwrap();

    let main = module.function("main").unwrap();
    let alloca = main.instructions().find(|i| i.id == alloca_id).unwrap();
    assert_eq!(alloca.kind, InstructionKind::Alloca { ty: Type::Int(32).ptr_to() });
    assert!(main.find_calls("tagged_malloc").next().is_some());
    assert!(main.find_calls("free").next().is_some());

    let gep = main.instructions().find(|i| i.id == gep_id).unwrap();
    let InstructionKind::GetElementPtr { indices, .. } = &gep.kind else { panic!("expected gep") };
    assert_eq!(indices.len(), 1, "leading index-0 should be dropped once the alloca is a scalar pointer");

    // The store through the rewritten pointer should have been instrumented too.
    assert!(main.find_calls("on_access").next().is_some());
}

#[test]
fn wrapper_function_is_collected_and_folded_to_tagged_malloc() {
    let mut module = Module::new("m");
    let mut main = Function::new("main", vec![], Type::Void);
    let entry = main.push_block("entry");
    let call_id = main.fresh_value_id();
    main.block_mut(entry).push(Instruction::new(
        call_id,
        InstructionKind::Call { callee: Callee::Direct("my_alloc".into()), args: vec![Value::Constant(Constant::Int(40))] },
        Type::i8().ptr_to(),
    ));
    module.add_function(main);

    let whitelist_file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(whitelist_file.path(), "[fuzzalloc]\nfun:my_alloc\n").unwrap();
    let tag_log_file = tempfile::NamedTempFile::new().unwrap();

    let config = Config {
        whitelist_path: Some(whitelist_file.path().to_str().unwrap().to_string()),
        tag_log_path: Some(tag_log_file.path().to_str().unwrap().to_string()),
        ..Config::default()
    };

    passes::run_pipeline(&mut module, &config, 7).unwrap();

    let main = module.function("main").unwrap();
    let inst = main.instructions().next().unwrap();
    match &inst.kind {
        InstructionKind::Call { callee: Callee::Direct(name), args } => {
            assert_eq!(name, "tagged_malloc");
            assert_eq!(args.len(), 2);
        }
        other => panic!("expected a call, got {other:?}"),
    }

    let records = taglog::read_all(tag_log_file.path().to_str().unwrap()).unwrap();
    assert!(records.contains(&taglog::TagLogRecord::Function { name: "my_alloc".into() }));
}

#[test]
fn lifetime_end_frees_instead_of_the_return_based_free() {
    let mut module = Module::new("m");
    let mut main = Function::new("main", vec![], Type::Void);
    let entry = main.push_block("entry");
    let alloca_id = main.fresh_value_id();
    main.block_mut(entry).push(Instruction::new(
        alloca_id,
        InstructionKind::Alloca { ty: Type::Array(Box::new(Type::Int(8)), 16) },
        Type::Array(Box::new(Type::Int(8)), 16),
    ));
    let lt_start_id = main.fresh_value_id();
    main.block_mut(entry).push(Instruction::new(lt_start_id, InstructionKind::LifetimeStart { object: Value::Result(alloca_id) }, Type::Void));
    let lt_end_id = main.fresh_value_id();
    main.block_mut(entry).push(Instruction::new(lt_end_id, InstructionKind::LifetimeEnd { object: Value::Result(alloca_id) }, Type::Void));
    let ret_id = main.fresh_value_id();
    main.block_mut(entry).push(Instruction::new(ret_id, InstructionKind::Return { value: None }, Type::Void));
    module.add_function(main);

    passes::run_pipeline(&mut module, &default_config(), 3).unwrap();

    let main = module.function("main").unwrap();
    let frees: Vec<_> = main.find_calls("free").collect();
    assert_eq!(frees.len(), 1, "lifetime.end should own the single free; the return site must not get a second one");
}

#[test]
fn collecting_the_same_module_twice_does_not_grow_the_tag_log() {
    let tag_log_file = tempfile::NamedTempFile::new().unwrap();
    let path = tag_log_file.path().to_str().unwrap().to_string();
    let config = Config { tag_log_path: Some(path.clone()), whitelist_path: None, ..Config::default() };

    let mut first = module_with_malloc_and_deref();
    passes::run_pipeline(&mut first, &config, 1).unwrap();
    let after_first = taglog::read_all(&path).unwrap();

    let mut second = module_with_malloc_and_deref();
    passes::run_pipeline(&mut second, &config, 1).unwrap();
    let after_second = taglog::read_all(&path).unwrap();

    assert_eq!(after_first, after_second, "re-collecting an unchanged module must be idempotent up to duplicates");
}

#[test]
fn heapified_global_array_gets_a_ctor_dtor_pair() {
    let mut module = Module::new("m");
    module.globals.push(GlobalVariable {
        name: "g_buf".into(),
        ty: Type::Array(Box::new(Type::Int(8)), 64),
        initializer: Some(Constant::ZeroInitializer),
        linkage: Linkage::Internal,
        is_constant: false,
    });

    passes::run_pipeline(&mut module, &default_config(), 5).unwrap();

    assert!(module.global("g_buf__heap").is_some());
    let ctor = module.function("fuzzalloc_heapify_ctor").expect("constructor emitted");
    assert!(ctor.find_calls("tagged_malloc").next().is_some());
    let dtor = module.function("fuzzalloc_heapify_dtor").expect("destructor emitted");
    assert!(dtor.find_calls("free").next().is_some());
}
