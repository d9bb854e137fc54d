//! A minimal, line-oriented textual encoding for [`crate::ir::Module`]
//! (SPEC_FULL §4 EXPANSION: "reads a ... line-based IR module dump").
//!
//! This is not a general compiler IR serialization — it covers exactly the
//! instruction subset the D-G passes read or generate, hand-parsed in the
//! same split-on-delimiter style as [`crate::taglog`] and
//! [`crate::whitelist`] rather than pulled in through a general object-graph
//! format (ir.rs's own [`crate::ir::Type`] `Display` impl is the type
//! grammar here verbatim, so types round-trip for free). Instruction kinds
//! outside this subset (e.g. `Phi`, `Select` are supported; aggregate
//! `Constant::Array` values are not) are exercised directly against the
//! `ir::Module` builder API in the pass unit tests instead.

use crate::error::FuzzallocError;
use crate::ir::{
    BlockId, Callee, Constant, Function, GlobalAlias, GlobalVariable, Instruction, InstructionKind, Linkage, Module,
    StructFieldAssignment, StructType, Type, Value, ValueId,
};

fn fail(detail: impl Into<String>) -> FuzzallocError {
    FuzzallocError::UnsupportedConstruct { pass: "ir_text", detail: detail.into() }
}

fn parse_type(raw: &str) -> Result<Type, FuzzallocError> {
    let s = raw.trim();
    if let Some(inner) = s.strip_suffix('*') {
        return Ok(Type::Ptr(Box::new(parse_type(inner)?)));
    }
    if let Some(inside) = s.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
        let (count, elem) = inside.split_once(" x ").ok_or_else(|| fail(format!("malformed array type {s}")))?;
        let count: usize = count.trim().parse().map_err(|_| fail(format!("bad array length in {s}")))?;
        return Ok(Type::Array(Box::new(parse_type(elem)?), count));
    }
    if s == "void" {
        return Ok(Type::Void);
    }
    if let Some(bits) = s.strip_prefix('i') {
        if let Ok(bits) = bits.parse() {
            return Ok(Type::Int(bits));
        }
    }
    if let Some(name) = s.strip_prefix('%') {
        return Ok(Type::Struct(name.to_string()));
    }
    Err(fail(format!("unrecognized type {s}")))
}

fn render_type(ty: &Type) -> String {
    ty.to_string()
}

fn parse_linkage(raw: &str) -> Result<Linkage, FuzzallocError> {
    match raw {
        "external" => Ok(Linkage::External),
        "internal" => Ok(Linkage::Internal),
        "private" => Ok(Linkage::Private),
        "weak" => Ok(Linkage::Weak),
        "common" => Ok(Linkage::Common),
        other => Err(fail(format!("unrecognized linkage {other}"))),
    }
}

fn render_linkage(linkage: Linkage) -> &'static str {
    match linkage {
        Linkage::External => "external",
        Linkage::Internal => "internal",
        Linkage::Private => "private",
        Linkage::Weak => "weak",
        Linkage::Common => "common",
    }
}

fn parse_value(raw: &str) -> Result<Value, FuzzallocError> {
    let s = raw.trim();
    if let Some(rest) = s.strip_prefix('%') {
        return rest.parse().map(|n| Value::Result(ValueId(n))).map_err(|_| fail(format!("bad value id {s}")));
    }
    if let Some(rest) = s.strip_prefix("arg") {
        return rest.parse().map(Value::Argument).map_err(|_| fail(format!("bad argument index {s}")));
    }
    if let Some(rest) = s.strip_prefix('@') {
        return Ok(Value::Global(rest.to_string()));
    }
    match s {
        "null" => return Ok(Value::Constant(Constant::Null)),
        "zeroinit" => return Ok(Value::Constant(Constant::ZeroInitializer)),
        "undef" => return Ok(Value::Constant(Constant::Undef)),
        _ => {}
    }
    s.parse::<i64>().map(|n| Value::Constant(Constant::Int(n))).map_err(|_| fail(format!("unrecognized value {s}")))
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Result(id) => format!("%{}", id.0),
        Value::Argument(n) => format!("arg{n}"),
        Value::Global(name) => format!("@{name}"),
        Value::Constant(Constant::Int(n)) => n.to_string(),
        Value::Constant(Constant::Null) => "null".to_string(),
        Value::Constant(Constant::ZeroInitializer) => "zeroinit".to_string(),
        Value::Constant(Constant::Undef) => "undef".to_string(),
        Value::Constant(Constant::GlobalRef(name)) => format!("@{name}"),
        Value::Constant(Constant::Array(_)) => "<array>".to_string(),
    }
}

fn parse_initializer(raw: &str) -> Result<Constant, FuzzallocError> {
    let s = raw.trim();
    if let Some(rest) = s.strip_prefix('@') {
        return Ok(Constant::GlobalRef(rest.to_string()));
    }
    match s {
        "null" => Ok(Constant::Null),
        "zeroinit" => Ok(Constant::ZeroInitializer),
        "undef" => Ok(Constant::Undef),
        other => other.parse::<i64>().map(Constant::Int).map_err(|_| fail(format!("unrecognized initializer {other}"))),
    }
}

fn render_initializer(c: &Constant) -> String {
    match c {
        Constant::GlobalRef(name) => format!("@{name}"),
        Constant::Null => "null".to_string(),
        Constant::ZeroInitializer => "zeroinit".to_string(),
        Constant::Undef => "undef".to_string(),
        Constant::Int(n) => n.to_string(),
        Constant::Array(_) => "<array>".to_string(),
    }
}

/// Splits a top-level comma list, respecting one level of bracket/paren
/// nesting (enough for `[i1, i2]`-shaped operand lists; this grammar never
/// nests further).
fn split_top_level(s: &str) -> Vec<String> {
    let s = s.trim();
    if s.is_empty() {
        return Vec::new();
    }
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for ch in s.chars() {
        match ch {
            '(' | '[' => {
                depth += 1;
                current.push(ch);
            }
            ')' | ']' => {
                depth -= 1;
                current.push(ch);
            }
            ',' if depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

fn strip_delims<'a>(s: &'a str, open: char, close: char) -> Result<&'a str, FuzzallocError> {
    let s = s.trim();
    s.strip_prefix(open)
        .and_then(|r| r.strip_suffix(close))
        .ok_or_else(|| fail(format!("expected `{open}...{close}` in {s}")))
}

struct PendingInstruction {
    block: BlockId,
    id: Option<ValueId>,
    opcode: String,
    rest: String,
}

fn parse_function_body(lines: &[&str], f: &mut Function) -> Result<(), FuzzallocError> {
    let mut block_by_name = std::collections::HashMap::new();
    for line in lines {
        let trimmed = line.trim();
        if let Some(name) = trimmed.strip_prefix("block ") {
            let id = f.push_block(name.trim());
            block_by_name.insert(name.trim().to_string(), id);
        }
    }

    let mut pending = Vec::new();
    let mut current: Option<BlockId> = None;
    let mut max_id = 0u32;
    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some(name) = trimmed.strip_prefix("block ") {
            current = Some(block_by_name[name.trim()]);
            continue;
        }
        let block = current.ok_or_else(|| fail(format!("instruction outside any block: {trimmed}")))?;

        let (lhs, body) = match trimmed.split_once(" = ") {
            Some((lhs, body)) => (Some(lhs.trim()), body.trim()),
            None => (None, trimmed),
        };
        let id = match lhs {
            Some(raw) => {
                let raw = raw.strip_prefix('%').ok_or_else(|| fail(format!("expected %id on lhs of {trimmed}")))?;
                let n: u32 = raw.parse().map_err(|_| fail(format!("bad value id {raw}")))?;
                max_id = max_id.max(n + 1);
                Some(ValueId(n))
            }
            None => None,
        };
        let (opcode, rest) = body.split_once(' ').unwrap_or((body, ""));
        pending.push(PendingInstruction { block, id, opcode: opcode.to_string(), rest: rest.to_string() });
    }

    for p in pending {
        let id = p.id.unwrap_or_else(|| {
            let n = max_id;
            max_id += 1;
            ValueId(n)
        });
        let (kind, ty) = parse_instruction(&p.opcode, &p.rest, &block_by_name)?;
        f.block_mut(p.block).push(Instruction::new(id, kind, ty));
    }
    f.set_next_value_id(max_id);
    Ok(())
}

fn parse_instruction(
    opcode: &str,
    rest: &str,
    blocks: &std::collections::HashMap<String, BlockId>,
) -> Result<(InstructionKind, Type), FuzzallocError> {
    let (operands, ty) = match rest.rsplit_once(" : ") {
        Some((ops, ty)) => (ops.trim(), parse_type(ty)?),
        None => (rest.trim(), Type::Void),
    };

    match opcode {
        "alloca" => {
            let allocated = parse_type(operands)?;
            Ok((InstructionKind::Alloca { ty: allocated.clone() }, allocated))
        }
        "load" => Ok((InstructionKind::Load { pointer: parse_value(operands)?, ty: ty.clone() }, ty)),
        "store" => {
            let parts = split_top_level(operands);
            let [pointer, value] = parts.as_slice() else { return Err(fail(format!("store needs 2 operands: {operands}"))) };
            Ok((InstructionKind::Store { pointer: parse_value(pointer)?, value: parse_value(value)? }, Type::Void))
        }
        "gep" => {
            let (base, idx_list) = operands.split_once('[').ok_or_else(|| fail(format!("gep needs [idx,...]: {operands}")))?;
            let idx_list = idx_list.strip_suffix(']').ok_or_else(|| fail(format!("unterminated gep index list: {operands}")))?;
            let indices = split_top_level(idx_list).iter().map(|s| parse_value(s)).collect::<Result<Vec<_>, _>>()?;
            Ok((InstructionKind::GetElementPtr { base: parse_value(base)?, indices }, ty))
        }
        "call" => {
            let (callee_raw, args_raw) = operands.split_once('(').ok_or_else(|| fail(format!("call needs (...): {operands}")))?;
            let args_raw = args_raw.strip_suffix(')').ok_or_else(|| fail(format!("unterminated call args: {operands}")))?;
            let args = split_top_level(args_raw).iter().map(|s| parse_value(s)).collect::<Result<Vec<_>, _>>()?;
            let callee_raw = callee_raw.trim();
            let callee = if let Some(name) = callee_raw.strip_prefix('@') {
                Callee::Direct(name.to_string())
            } else if let Some(ptr) = callee_raw.strip_prefix('*') {
                Callee::Indirect(parse_value(ptr)?)
            } else {
                return Err(fail(format!("call target must be @name or *value: {callee_raw}")));
            };
            Ok((InstructionKind::Call { callee, args }, ty))
        }
        "atomicrmw" => {
            let parts = split_top_level(operands);
            let [pointer, value] = parts.as_slice() else { return Err(fail(format!("atomicrmw needs 2 operands: {operands}"))) };
            Ok((InstructionKind::AtomicRmw { pointer: parse_value(pointer)?, value: parse_value(value)? }, ty))
        }
        "cmpxchg" => {
            let parts = split_top_level(operands);
            let [pointer, expected, new] = parts.as_slice() else {
                return Err(fail(format!("cmpxchg needs 3 operands: {operands}")));
            };
            Ok((InstructionKind::CmpXchg { pointer: parse_value(pointer)?, expected: parse_value(expected)?, new: parse_value(new)? }, ty))
        }
        "maskedload" => {
            let parts = split_top_level(operands);
            let [pointer, mask] = parts.as_slice() else { return Err(fail(format!("maskedload needs 2 operands: {operands}"))) };
            Ok((InstructionKind::MaskedLoad { pointer: parse_value(pointer)?, mask: parse_value(mask)?, ty: ty.clone() }, ty))
        }
        "maskedstore" => {
            let parts = split_top_level(operands);
            let [pointer, value, mask] = parts.as_slice() else {
                return Err(fail(format!("maskedstore needs 3 operands: {operands}")));
            };
            Ok((
                InstructionKind::MaskedStore { pointer: parse_value(pointer)?, value: parse_value(value)?, mask: parse_value(mask)? },
                Type::Void,
            ))
        }
        "lifetime.start" => Ok((InstructionKind::LifetimeStart { object: parse_value(operands)? }, Type::Void)),
        "lifetime.end" => Ok((InstructionKind::LifetimeEnd { object: parse_value(operands)? }, Type::Void)),
        "memintrinsic" => {
            let parts = split_top_level(operands);
            let [name, dest, align] = parts.as_slice() else {
                return Err(fail(format!("memintrinsic needs name, dest, align: {operands}")));
            };
            let align = align.strip_prefix("align:").unwrap_or(align).parse().map_err(|_| fail(format!("bad align in {operands}")))?;
            Ok((InstructionKind::MemIntrinsic { name: name.trim_start_matches('@').to_string(), dest: parse_value(dest)?, align }, Type::Void))
        }
        "phi" => {
            let list = strip_delims(operands, '[', ']')?;
            let incoming = split_top_level(list)
                .iter()
                .map(|pair| {
                    let inner = strip_delims(pair, '(', ')')?;
                    let (block_name, value) = inner.split_once(',').ok_or_else(|| fail(format!("bad phi entry {pair}")))?;
                    let block_id = *blocks.get(block_name.trim()).ok_or_else(|| fail(format!("unknown block {block_name}")))?;
                    Ok((block_id, parse_value(value)?))
                })
                .collect::<Result<Vec<_>, FuzzallocError>>()?;
            Ok((InstructionKind::Phi { incoming }, ty))
        }
        "select" => {
            let parts = split_top_level(operands);
            let [cond, if_true, if_false] = parts.as_slice() else {
                return Err(fail(format!("select needs 3 operands: {operands}")));
            };
            Ok((InstructionKind::Select { cond: parse_value(cond)?, if_true: parse_value(if_true)?, if_false: parse_value(if_false)? }, ty))
        }
        "br" => {
            let target = *blocks.get(operands.trim()).ok_or_else(|| fail(format!("unknown block {operands}")))?;
            Ok((InstructionKind::Br { target }, Type::Void))
        }
        "condbr" => {
            let parts = split_top_level(operands);
            let [cond, if_true, if_false] = parts.as_slice() else {
                return Err(fail(format!("condbr needs 3 operands: {operands}")));
            };
            let if_true = *blocks.get(if_true.as_str()).ok_or_else(|| fail(format!("unknown block {if_true}")))?;
            let if_false = *blocks.get(if_false.as_str()).ok_or_else(|| fail(format!("unknown block {if_false}")))?;
            Ok((InstructionKind::CondBr { cond: parse_value(cond)?, if_true, if_false }, Type::Void))
        }
        "ret" => {
            let value = if operands.is_empty() { None } else { Some(parse_value(operands)?) };
            Ok((InstructionKind::Return { value }, Type::Void))
        }
        "opaque" => Ok((InstructionKind::Opaque { mnemonic: operands.to_string() }, Type::Void)),
        other => Err(fail(format!("unrecognized opcode {other}"))),
    }
}

fn render_instruction(inst: &Instruction, block_names: &[(BlockId, String)]) -> String {
    fn block_name(block_names: &[(BlockId, String)], id: BlockId) -> String {
        block_names.iter().find(|(b, _)| *b == id).map(|(_, n)| n.clone()).unwrap_or_else(|| format!("bb{}", id.0))
    }

    let lhs = format!("%{} = ", inst.id.0);
    match &inst.kind {
        InstructionKind::Alloca { ty } => format!("{lhs}alloca {}", render_type(ty)),
        InstructionKind::Load { pointer, ty } => format!("{lhs}load {} : {}", render_value(pointer), render_type(ty)),
        InstructionKind::Store { pointer, value } => format!("store {}, {}", render_value(pointer), render_value(value)),
        InstructionKind::GetElementPtr { base, indices } => {
            let idx = indices.iter().map(render_value).collect::<Vec<_>>().join(", ");
            format!("{lhs}gep {}[{idx}] : {}", render_value(base), render_type(&inst.ty))
        }
        InstructionKind::Call { callee, args } => {
            let callee = match callee {
                Callee::Direct(name) => format!("@{name}"),
                Callee::Indirect(v) => format!("*{}", render_value(v)),
            };
            let args = args.iter().map(render_value).collect::<Vec<_>>().join(", ");
            format!("{lhs}call {callee}({args}) : {}", render_type(&inst.ty))
        }
        InstructionKind::AtomicRmw { pointer, value } => {
            format!("{lhs}atomicrmw {}, {} : {}", render_value(pointer), render_value(value), render_type(&inst.ty))
        }
        InstructionKind::CmpXchg { pointer, expected, new } => {
            format!("{lhs}cmpxchg {}, {}, {} : {}", render_value(pointer), render_value(expected), render_value(new), render_type(&inst.ty))
        }
        InstructionKind::MaskedLoad { pointer, mask, ty } => {
            format!("{lhs}maskedload {}, {} : {}", render_value(pointer), render_value(mask), render_type(ty))
        }
        InstructionKind::MaskedStore { pointer, value, mask } => {
            format!("maskedstore {}, {}, {}", render_value(pointer), render_value(value), render_value(mask))
        }
        InstructionKind::LifetimeStart { object } => format!("lifetime.start {}", render_value(object)),
        InstructionKind::LifetimeEnd { object } => format!("lifetime.end {}", render_value(object)),
        InstructionKind::MemIntrinsic { name, dest, align } => format!("memintrinsic @{name}, {}, align:{align}", render_value(dest)),
        InstructionKind::Phi { incoming } => {
            let entries = incoming
                .iter()
                .map(|(b, v)| format!("({}, {})", block_name(block_names, *b), render_value(v)))
                .collect::<Vec<_>>()
                .join(", ");
            format!("{lhs}phi [{entries}] : {}", render_type(&inst.ty))
        }
        InstructionKind::Select { cond, if_true, if_false } => {
            format!("{lhs}select {}, {}, {} : {}", render_value(cond), render_value(if_true), render_value(if_false), render_type(&inst.ty))
        }
        InstructionKind::Br { target } => format!("br {}", block_name(block_names, *target)),
        InstructionKind::CondBr { cond, if_true, if_false } => {
            format!("condbr {}, {}, {}", render_value(cond), block_name(block_names, *if_true), block_name(block_names, *if_false))
        }
        InstructionKind::Return { value } => match value {
            Some(v) => format!("ret {}", render_value(v)),
            None => "ret".to_string(),
        },
        InstructionKind::Opaque { mnemonic } => format!("opaque {mnemonic}"),
    }
}

/// Parses a module dump in this crate's line-oriented textual form.
pub fn parse_module(text: &str) -> Result<Module, FuzzallocError> {
    let lines: Vec<&str> = text.lines().collect();
    let mut module_name = "module".to_string();
    let mut module = None;

    let mut i = 0;
    while i < lines.len() {
        let trimmed = lines[i].trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            i += 1;
            continue;
        }
        if let Some(name) = trimmed.strip_prefix("module ") {
            module_name = name.trim().to_string();
            module = Some(Module::new(module_name.clone()));
            i += 1;
            continue;
        }
        let module = module.get_or_insert_with(|| Module::new(module_name.clone()));

        if let Some(rest) = trimmed.strip_prefix("struct ") {
            let mut parts = rest.split_whitespace();
            let name = parts.next().ok_or_else(|| fail("struct needs a name"))?.to_string();
            let fields = parts.map(parse_type).collect::<Result<Vec<_>, _>>()?;
            module.structs.push(StructType { name, fields });
        } else if let Some(rest) = trimmed.strip_prefix("global ") {
            let (name, rest) = rest.split_once(" : ").ok_or_else(|| fail(format!("global needs `: type`: {rest}")))?;
            let (ty_raw, rest) = rest.split_once(" = ").ok_or_else(|| fail(format!("global needs `= init`: {rest}")))?;
            let mut tokens = rest.split_whitespace();
            let init_raw = tokens.next().ok_or_else(|| fail("global needs an initializer"))?;
            let linkage_raw = tokens.next().unwrap_or("external");
            let is_constant = tokens.next() == Some("const");
            module.globals.push(GlobalVariable {
                name: name.trim().to_string(),
                ty: parse_type(ty_raw)?,
                initializer: Some(parse_initializer(init_raw)?),
                linkage: parse_linkage(linkage_raw)?,
                is_constant,
            });
        } else if let Some(rest) = trimmed.strip_prefix("alias ") {
            let (name, target) = rest.split_once(" = ").ok_or_else(|| fail(format!("alias needs `= target`: {rest}")))?;
            let target = target.trim().strip_prefix('@').ok_or_else(|| fail(format!("alias target must be @name: {target}")))?;
            module.aliases.push(GlobalAlias { name: name.trim().to_string(), aliasee: target.to_string() });
        } else if let Some(rest) = trimmed.strip_prefix("structfield ") {
            let (head, target) = rest.split_once(" = ").ok_or_else(|| fail(format!("structfield needs `= fn`: {rest}")))?;
            let mut head = head.split_whitespace();
            let type_name = head.next().ok_or_else(|| fail("structfield needs a type name"))?.to_string();
            let index: usize = head.next().ok_or_else(|| fail("structfield needs an index"))?.parse().map_err(|_| fail("bad struct field index"))?;
            let target = target.trim().strip_prefix('@').ok_or_else(|| fail(format!("structfield target must be @name: {target}")))?;
            module.struct_field_assignments.push(StructFieldAssignment { type_name, element_index: index, function_name: target.to_string() });
        } else if let Some(rest) = trimmed.strip_prefix("function ") {
            let (head, ret_and_flags) = rest.split_once(" -> ").ok_or_else(|| fail(format!("function needs `-> rettype`: {rest}")))?;
            let (name, params_raw) = head.split_once('(').ok_or_else(|| fail(format!("function needs `(params)`: {head}")))?;
            let params_raw = params_raw.strip_suffix(')').ok_or_else(|| fail(format!("unterminated params: {head}")))?;
            let params = split_top_level(params_raw).iter().map(|s| parse_type(s)).collect::<Result<Vec<_>, _>>()?;
            let mut flags = ret_and_flags.split_whitespace();
            let ret_ty = parse_type(flags.next().ok_or_else(|| fail("function needs a return type"))?)?;
            let mut linkage = Linkage::External;
            let mut is_helper = false;
            for flag in flags {
                match flag {
                    "helper" => is_helper = true,
                    other => linkage = parse_linkage(other)?,
                }
            }

            let end = lines[i..].iter().position(|l| l.trim() == "endfunction").map(|off| i + off).ok_or_else(|| fail("missing endfunction"))?;
            let mut f = Function::new(name.trim(), params, ret_ty);
            f.linkage = linkage;
            f.is_instrumentation_helper = is_helper;
            parse_function_body(&lines[i + 1..end], &mut f)?;
            module.add_function(f);
            i = end;
        } else {
            return Err(fail(format!("unrecognized top-level line: {trimmed}")));
        }
        i += 1;
    }

    Ok(module.unwrap_or_else(|| Module::new(module_name)))
}

/// Renders `module` back into this crate's textual form — the inverse of
/// [`parse_module`] for the supported instruction subset.
pub fn render_module(module: &Module) -> String {
    let mut out = format!("module {}\n", module.name);

    for s in &module.structs {
        let fields = s.fields.iter().map(render_type).collect::<Vec<_>>().join(" ");
        out.push_str(&format!("struct {} {fields}\n", s.name));
    }
    for g in &module.globals {
        let init = g.initializer.as_ref().map(render_initializer).unwrap_or_else(|| "undef".to_string());
        let constness = if g.is_constant { " const" } else { "" };
        out.push_str(&format!("global {} : {} = {} {}{}\n", g.name, render_type(&g.ty), init, render_linkage(g.linkage), constness));
    }
    for a in &module.aliases {
        out.push_str(&format!("alias {} = @{}\n", a.name, a.aliasee));
    }
    for sf in &module.struct_field_assignments {
        out.push_str(&format!("structfield {} {} = @{}\n", sf.type_name, sf.element_index, sf.function_name));
    }

    for f in &module.functions {
        let params = f.params.iter().map(render_type).collect::<Vec<_>>().join(", ");
        let helper = if f.is_instrumentation_helper { " helper" } else { "" };
        out.push_str(&format!("function {}({params}) -> {} {}{}\n", f.name, render_type(&f.return_ty), render_linkage(f.linkage), helper));
        let block_names: Vec<(BlockId, String)> = f.blocks.iter().map(|b| (b.id, b.name.clone())).collect();
        for block in &f.blocks {
            out.push_str(&format!("  block {}\n", block.name));
            for inst in &block.instructions {
                out.push_str(&format!("    {}\n", render_instruction(inst, &block_names)));
            }
        }
        out.push_str("endfunction\n");
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Callee, Instruction, InstructionKind, Type, Value};

    #[test]
    fn round_trips_a_module_with_a_malloc_call() {
        let mut module = Module::new("sample");
        let mut main = Function::new("main", vec![], Type::Int(32));
        let entry = main.push_block("entry");
        let id = main.fresh_value_id();
        main.block_mut(entry).push(Instruction::new(
            id,
            InstructionKind::Call { callee: Callee::Direct("malloc".into()), args: vec![Value::Constant(Constant::Int(16))] },
            Type::Ptr(Box::new(Type::i8())),
        ));
        let ret_id = main.fresh_value_id();
        main.block_mut(entry).push(Instruction::new(ret_id, InstructionKind::Return { value: Some(Value::Result(id)) }, Type::Void));
        module.add_function(main);

        let text = render_module(&module);
        let parsed = parse_module(&text).unwrap();

        let f = parsed.function("main").unwrap();
        assert_eq!(f.find_calls("malloc").count(), 1);
        assert!(matches!(f.instructions().last().unwrap().kind, InstructionKind::Return { value: Some(Value::Result(_)) }));
    }

    #[test]
    fn parses_globals_aliases_and_struct_fields() {
        let text = "module m\n\
                     global g_alloc : i8* = @malloc internal\n\
                     alias a = @malloc\n\
                     structfield Allocator 0 = @malloc\n";
        let module = parse_module(text).unwrap();
        assert_eq!(module.global("g_alloc").unwrap().initializer, Some(Constant::GlobalRef("malloc".into())));
        assert_eq!(module.aliases[0].aliasee, "malloc");
        assert_eq!(module.struct_field_assignments[0].function_name, "malloc");
    }

    #[test]
    fn parses_alloca_and_branch_over_two_blocks() {
        let text = "module m\n\
                     function f() -> void external\n\
                     block entry\n\
                       %0 = alloca [32 x i32]\n\
                       br exit\n\
                     block exit\n\
                       ret\n\
                     endfunction\n";
        let module = parse_module(text).unwrap();
        let f = module.function("f").unwrap();
        assert_eq!(f.blocks.len(), 2);
        assert!(matches!(f.blocks[0].instructions[0].kind, InstructionKind::Alloca { .. }));
        assert!(matches!(f.blocks[0].instructions[1].kind, InstructionKind::Br { .. }));
    }

    #[test]
    fn rejects_unknown_opcode() {
        let text = "module m\nfunction f() -> void external\nblock entry\n  frobnicate\nendfunction\n";
        let err = parse_module(text).unwrap_err();
        assert!(matches!(err, FuzzallocError::UnsupportedConstruct { .. }));
    }

    #[test]
    fn type_round_trip_matches_display() {
        let ty = Type::Array(Box::new(Type::Ptr(Box::new(Type::Int(8)))), 4);
        assert_eq!(parse_type(&ty.to_string()).unwrap(), ty);
    }
}
