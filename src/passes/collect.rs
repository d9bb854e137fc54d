//! Tag Collection Pass (§4.D): walks a module once, finds every use of an
//! allocation entry point, and emits tag log records for them.

use crate::ir::{Constant, Module};
use crate::taglog::{self, TagLogRecord};
use crate::whitelist::Whitelist;
use crate::error::FuzzallocError;

/// The allocation entry points every translation unit gets for free,
/// before any caller-supplied whitelist is consulted (§4.D).
pub const BUILTIN_ALLOCATORS: &[&str] = &["malloc", "calloc", "realloc"];

fn entry_points(whitelist: &Whitelist) -> Vec<String> {
    BUILTIN_ALLOCATORS
        .iter()
        .map(|s| s.to_string())
        .chain(whitelist.functions().map(String::from))
        .collect()
}

/// Builds the set of tag log records this module contributes, without
/// writing anything to disk — kept pure so `passes::tagging` and tests can
/// drive it directly against an in-memory `Module`.
pub fn collect(module: &Module, whitelist: &Whitelist) -> Vec<TagLogRecord> {
    let mut records = Vec::new();

    for symbol in entry_points(whitelist) {
        let referenced = module.find_direct_calls(&symbol).next().is_some()
            || module
                .globals
                .iter()
                .any(|g| matches!(&g.initializer, Some(Constant::GlobalRef(name)) if name == &symbol))
            || module.aliases.iter().any(|a| a.aliasee == symbol)
            || module.struct_field_assignments.iter().any(|s| s.function_name == symbol)
            || module.function(&symbol).is_some();

        if !referenced {
            continue;
        }

        // Step 1: record the function itself.
        records.push(TagLogRecord::Function { name: symbol.clone() });

        // Step 2: walk all uses.
        for global in &module.globals {
            if matches!(&global.initializer, Some(Constant::GlobalRef(name)) if name == &symbol) {
                records.push(TagLogRecord::GlobalVariable { name: global.name.clone() });
            }
        }
        for alias in &module.aliases {
            if alias.aliasee == symbol {
                records.push(TagLogRecord::GlobalAlias { name: alias.name.clone() });
            }
        }
        for assignment in &module.struct_field_assignments {
            if assignment.function_name == symbol {
                records.push(TagLogRecord::StructField {
                    type_name: assignment.type_name.clone(),
                    element_index: assignment.element_index,
                    function_name: assignment.function_name.clone(),
                });
            }
        }
        // Directly called: no action (§4.D step 2).
    }

    records
}

/// Loads the whitelist (fatal if configured but missing, per §4.D),
/// collects records, and appends them to the tag log, deduplicated so
/// re-running collection over the same module is idempotent (§8 invariant
/// 8).
pub fn run(module: &Module, whitelist_path: Option<&str>, tag_log_path: &str) -> Result<(), FuzzallocError> {
    let whitelist = match whitelist_path {
        Some(path) => Whitelist::load(path)?,
        None => Whitelist::default(),
    };
    let records = collect(module, &whitelist);
    taglog::append_deduplicated(tag_log_path, &records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Callee, Function, GlobalAlias, GlobalVariable, Instruction, InstructionKind, Linkage, StructFieldAssignment, Type, Value};

    fn module_with_malloc_call() -> Module {
        let mut module = Module::new("m");
        let mut main = Function::new("main", vec![], Type::Int(32));
        let entry = main.push_block("entry");
        let id = main.fresh_value_id();
        main.block_mut(entry).push(Instruction::new(
            id,
            InstructionKind::Call { callee: Callee::Direct("malloc".into()), args: vec![Value::Constant(Constant::Int(8))] },
            Type::Ptr(Box::new(Type::i8())),
        ));
        module.add_function(main);
        module
    }

    #[test]
    fn records_direct_malloc_call() {
        let module = module_with_malloc_call();
        let records = collect(&module, &Whitelist::default());
        assert_eq!(records, vec![TagLogRecord::Function { name: "malloc".into() }]);
    }

    #[test]
    fn records_global_and_alias_uses() {
        let mut module = module_with_malloc_call();
        module.globals.push(GlobalVariable {
            name: "g_alloc".into(),
            ty: Type::Ptr(Box::new(Type::i8())),
            initializer: Some(Constant::GlobalRef("malloc".into())),
            linkage: Linkage::Internal,
            is_constant: false,
        });
        module.aliases.push(GlobalAlias { name: "malloc_alias".into(), aliasee: "malloc".into() });
        module.struct_field_assignments.push(StructFieldAssignment {
            type_name: "Allocator".into(),
            element_index: 0,
            function_name: "malloc".into(),
        });

        let records = collect(&module, &Whitelist::default());
        assert!(records.contains(&TagLogRecord::Function { name: "malloc".into() }));
        assert!(records.contains(&TagLogRecord::GlobalVariable { name: "g_alloc".into() }));
        assert!(records.contains(&TagLogRecord::GlobalAlias { name: "malloc_alias".into() }));
        assert!(records.contains(&TagLogRecord::StructField {
            type_name: "Allocator".into(),
            element_index: 0,
            function_name: "malloc".into(),
        }));
    }

    #[test]
    fn unreferenced_builtin_is_skipped() {
        let module = Module::new("empty");
        let records = collect(&module, &Whitelist::default());
        assert!(records.is_empty());
    }
}
