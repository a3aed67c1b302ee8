//! Emission pass: walks a `MethodDef`'s body against the `Binding`s
//! `scope.rs` resolved, emitting bytecode through `bytecode::Assembler` and
//! producing a `CompiledMethod` heap object — generalizing
//! `axiom/src/compiler.rs`'s `Codegen` (which walks its own scope table and
//! calls into its own `Assembler`) from register ABC emission to SistaV1
//! stack emission.
//!
//! Closure captures: a function that owns captured locals allocates one
//! heap `Array` ("vector") at entry, filled with each captured local's
//! initial value in declaration order (see `scope::FunctionInfo::captured_index`).
//! A nested block receives, at creation time, its enclosing activation's own
//! vector (or nil) consed onto the enclosing activation's own received
//! `outerVectors` array — see `emit_closure_push` below for the exact stack
//! protocol `Opcode::PushClosure` expects. Reading/writing a variable
//! captured by the *referencing* function uses the dedicated
//! `*TemporaryInVector` opcodes; reaching into an ancestor's vector falls
//! back to ordinary `at:`/`at:put:` sends against the `outerVectors` array,
//! since that indirection is rare enough not to warrant its own opcode.

pub mod optimize;
pub mod scope;

use std::cell::RefCell;
use std::collections::HashMap;

use crate::ast::{Expr, MethodDef, Stmt};
use crate::bytecode::{special_selector_index, Assembler, MethodHeader, Opcode};
use crate::classes::{ClassTable, COMPILED_METHOD_CLASS_INDEX};
use crate::errors::CompileError;
use crate::heap::Heap;
use crate::object::ObjectFormat;
use crate::value::Value;

use scope::{Binding, FunctionId, FunctionInfo, SemanticAnalyzer, SemanticInfo};

use tracing::trace;

/// A name the compiler could not resolve lexically resolves here instead —
/// either a user-declared class or a materialized runtime singleton (e.g.
/// `Transcript`).
pub enum GlobalRef {
    Class(u32),
    Value(Value),
}

/// Everything the emitter needs that lives outside a single method's AST:
/// the class table (for instance-variable layout and class-value lookups),
/// the global resolver, and the two process-wide interning caches that must
/// be shared across every `compile_method` call so that identity-sensitive
/// comparisons (`Foo == Foo`, `#at: == #at:`) hold.
pub struct CompileContext<'a> {
    pub classes: &'a ClassTable,
    pub instance_variables: &'a [String],
    pub resolve_global: &'a dyn Fn(&str) -> Option<GlobalRef>,
    pub class_values: &'a RefCell<HashMap<u32, Value>>,
    pub symbols: &'a RefCell<HashMap<String, Value>>,
}

pub fn compile_method(heap: &mut Heap, ctx: &CompileContext, method: &MethodDef) -> Result<Value, CompileError> {
    let known_globals = |name: &str| (ctx.resolve_global)(name).is_some();
    let info = SemanticAnalyzer::analyze(method, ctx.instance_variables, &known_globals)?;
    compile_function(heap, ctx, &info, 0, &method.body, false, Some(&method.selector))
}

fn compile_function(
    heap: &mut Heap,
    ctx: &CompileContext,
    info: &SemanticInfo,
    fid: FunctionId,
    body: &[Stmt],
    is_block: bool,
    selector: Option<&str>,
) -> Result<Value, CompileError> {
    let mut asm = Assembler::new();
    {
        let mut emitter = Emitter { asm: &mut asm, heap, ctx, info, current: fid, is_block };
        emitter.emit_prologue();
        emitter.emit_function_body(body)?;
    }
    let func = info.get(fid);
    let bytecode = asm.finish();
    let header = MethodHeader {
        literal_count: asm.literals().len() as u16,
        has_primitive: false,
        needs_large_frame: frame_temp_count(func) > 32,
        temporary_count: frame_temp_count(func).min(u8::MAX as u32) as u8,
        argument_count: func.params.len() as u8,
        alternate_bytecode_set: false,
    };
    if let Some(selector) = selector {
        trace!(
            selector,
            literal_count = header.literal_count,
            temporary_count = header.temporary_count,
            bytecode_len = bytecode.len(),
            "compiled method"
        );
    }
    Ok(allocate_compiled_method(heap, header, asm.literals(), &bytecode))
}

fn own_vector_slot(func: &FunctionInfo) -> Option<u32> {
    func.has_vector().then_some((func.params.len() + func.temps.len()) as u32)
}

fn outer_vectors_slot(func: &FunctionInfo) -> u32 {
    (func.params.len() + func.temps.len() + if func.has_vector() { 1 } else { 0 }) as u32
}

fn frame_temp_count(func: &FunctionInfo) -> u32 {
    outer_vectors_slot(func) + 1
}

fn allocate_compiled_method(heap: &mut Heap, header: MethodHeader, literals: &[Value], bytecode: &[u8]) -> Value {
    let fixed = 1 + literals.len();
    let v = heap
        .new_object(fixed, bytecode.len(), ObjectFormat::CompiledMethod(0), COMPILED_METHOD_CLASS_INDEX, Value::NIL)
        .expect("heap exhausted while compiling");
    heap.set_slot_at(v, 0, header.encode());
    for (i, lit) in literals.iter().enumerate() {
        heap.set_slot_at(v, 1 + i, *lit);
    }
    for (i, byte) in bytecode.iter().enumerate() {
        heap.set_slot_at(v, fixed + i, Value(*byte as u64));
    }
    v
}

struct Emitter<'a> {
    asm: &'a mut Assembler,
    heap: &'a mut Heap,
    ctx: &'a CompileContext<'a>,
    info: &'a SemanticInfo,
    current: FunctionId,
    is_block: bool,
}

impl<'a> Emitter<'a> {
    /// Returns a reference borrowed from `self.info` (lifetime `'a`, not
    /// tied to `&self`) so callers can hold it alongside later `&mut
    /// self.asm`/`&mut self.heap` calls without a borrow-checker conflict.
    fn func(&self) -> &'a FunctionInfo {
        self.info.get(self.current)
    }

    fn resolve(&self, name: &str) -> Binding {
        scope::resolve_binding(self.info, self.current, name, self.ctx.instance_variables)
    }

    fn intern_symbol(&mut self, name: &str) -> Value {
        if let Some(v) = self.ctx.symbols.borrow().get(name) {
            return *v;
        }
        let bytes = name.as_bytes();
        let v = self
            .heap
            .new_object(0, bytes.len(), ObjectFormat::Indexable8(0), crate::classes::BYTE_SYMBOL_CLASS_INDEX, Value::NIL)
            .expect("heap exhausted while compiling");
        for (i, b) in bytes.iter().enumerate() {
            self.heap.set_slot_at(v, i, Value(*b as u64));
        }
        self.ctx.symbols.borrow_mut().insert(name.to_string(), v);
        v
    }

    fn class_value(&mut self, class_index: u32) -> Value {
        if let Some(v) = self.ctx.class_values.borrow().get(&class_index) {
            return *v;
        }
        let metaclass_index =
            self.ctx.classes.get(class_index).metaclass_index.unwrap_or(crate::classes::CLASS_CLASS_INDEX);
        let v = self
            .heap
            .new_object(1, 0, ObjectFormat::FixedSize, metaclass_index, Value::NIL)
            .expect("heap exhausted while compiling");
        self.heap.set_slot_at(v, 0, Value::from_small_int(class_index as i64));
        self.ctx.class_values.borrow_mut().insert(class_index, v);
        v
    }

    // ---- entry / exit -----------------------------------------------------

    /// Method activations always carry a nil `outerVectors` (methods are
    /// never lexically nested); block activations have theirs installed by
    /// the interpreter directly from the activating `BlockClosure`, ahead of
    /// bytecode 0, so no instructions are needed here for that case.
    fn emit_prologue(&mut self) {
        let func = self.func();
        if !self.is_block {
            let slot = outer_vectors_slot(func);
            self.asm.emit(Opcode::PushNil, 0);
            self.asm.emit(Opcode::StoreTemporary, slot as i64);
            self.asm.emit(Opcode::Pop, 0);
        }
        if func.has_vector() {
            let captured_order: Vec<String> = func
                .params
                .iter()
                .chain(func.temps.iter())
                .filter(|n| func.captured.contains(n.as_str()))
                .cloned()
                .collect();
            for name in &captured_order {
                if let Some(idx) = func.params.iter().position(|p| p == name) {
                    self.asm.emit(Opcode::PushTemporary, idx as i64);
                } else {
                    self.asm.emit(Opcode::PushNil, 0);
                }
            }
            let slot = own_vector_slot(func).unwrap();
            self.asm.emit(Opcode::PushNClosureTemps, captured_order.len() as i64);
            self.asm.emit(Opcode::StoreTemporary, slot as i64);
            self.asm.emit(Opcode::Pop, 0);
        }
    }

    /// A method with no explicit `^` falls through to an implicit `^self`.
    /// A block with no explicit `^` falls through to an implicit return of
    /// its last statement's value (`BlockReturnTop`) — an empty body
    /// evaluates to nil.
    fn emit_function_body(&mut self, body: &[Stmt]) -> Result<(), CompileError> {
        if body.is_empty() {
            if self.is_block {
                self.asm.emit(Opcode::PushNil, 0);
                self.asm.emit(Opcode::BlockReturnTop, 0);
            } else {
                self.asm.emit(Opcode::PushReceiver, 0);
                self.asm.emit(Opcode::ReturnReceiver, 0);
            }
            return Ok(());
        }
        for (i, stmt) in body.iter().enumerate() {
            let is_last = i == body.len() - 1;
            match stmt {
                Stmt::Return(e) => {
                    self.emit_expr(e)?;
                    self.asm.emit(Opcode::ReturnTop, 0);
                }
                Stmt::Expr(e) => {
                    self.emit_expr(e)?;
                    if is_last && self.is_block {
                        self.asm.emit(Opcode::BlockReturnTop, 0);
                    } else if is_last {
                        self.asm.emit(Opcode::Pop, 0);
                        self.asm.emit(Opcode::PushReceiver, 0);
                        self.asm.emit(Opcode::ReturnReceiver, 0);
                    } else {
                        self.asm.emit(Opcode::Pop, 0);
                    }
                }
            }
        }
        Ok(())
    }

    /// Like `emit_function_body`, but for an inlined conditional/loop
    /// branch: always leaves exactly one value on the stack (nil for an
    /// empty body), and never appends an implicit return — control simply
    /// falls through to whatever the inlining site emits next.
    fn emit_body_as_value(&mut self, body: &[Stmt]) -> Result<(), CompileError> {
        if body.is_empty() {
            self.asm.emit(Opcode::PushNil, 0);
            return Ok(());
        }
        for (i, stmt) in body.iter().enumerate() {
            let is_last = i == body.len() - 1;
            match stmt {
                Stmt::Return(e) => {
                    self.emit_expr(e)?;
                    self.asm.emit(Opcode::ReturnTop, 0);
                }
                Stmt::Expr(e) => {
                    self.emit_expr(e)?;
                    if !is_last {
                        self.asm.emit(Opcode::Pop, 0);
                    }
                }
            }
        }
        Ok(())
    }

    // ---- bindings -----------------------------------------------------

    fn emit_push_small_int(&mut self, n: i64) {
        match n {
            0 => self.asm.emit(Opcode::PushZero, 0),
            1 => self.asm.emit(Opcode::PushOne, 0),
            _ => self.asm.emit(Opcode::PushSmallInt, n),
        }
    }

    fn emit_special_send(&mut self, selector: &str) {
        let idx = special_selector_index(selector).expect("selector must be in the special-selector table");
        self.asm.emit(Opcode::SpecialSelectorSend, idx as i64);
    }

    fn emit_push_binding(&mut self, binding: &Binding) {
        match binding {
            Binding::LocalDirect(idx) => self.asm.emit(Opcode::PushTemporary, *idx as i64),
            Binding::InstanceVariable(idx) => self.asm.emit(Opcode::PushReceiverVariable, *idx as i64),
            Binding::LocalInVector(idx) => self.asm.emit(Opcode::PushTemporaryInVector, *idx as i64),
            Binding::OuterInVector { depth, vector_index } => {
                let slot = outer_vectors_slot(self.func());
                self.asm.emit(Opcode::PushTemporary, slot as i64);
                self.emit_push_small_int(*depth as i64 + 1);
                self.emit_special_send("at:");
                self.emit_push_small_int(*vector_index as i64 + 1);
                self.emit_special_send("at:");
            }
            Binding::Global(name) => self.emit_global_push(name),
        }
    }

    fn emit_global_push(&mut self, name: &str) {
        match (self.ctx.resolve_global)(name) {
            Some(GlobalRef::Class(idx)) => {
                let v = self.class_value(idx);
                let lit = self.asm.add_literal(v, false);
                self.asm.emit(Opcode::PushLiteral, lit as i64);
            }
            Some(GlobalRef::Value(v)) => {
                let lit = self.asm.add_literal(v, false);
                self.asm.emit(Opcode::PushLiteral, lit as i64);
            }
            None => unreachable!("undeclared global {name:?} survived semantic analysis"),
        }
    }

    fn emit_assignment(&mut self, name: &str, value: &Expr, span: crate::errors::Span) -> Result<(), CompileError> {
        let binding = self.resolve(name);
        match binding {
            Binding::LocalDirect(idx) => {
                self.emit_expr(value)?;
                self.asm.emit(Opcode::StoreTemporary, idx as i64);
            }
            Binding::InstanceVariable(idx) => {
                self.emit_expr(value)?;
                self.asm.emit(Opcode::StoreReceiverVariable, idx as i64);
            }
            Binding::LocalInVector(idx) => {
                self.emit_expr(value)?;
                self.asm.emit(Opcode::StoreTemporaryInVector, idx as i64);
            }
            Binding::OuterInVector { depth, vector_index } => {
                let slot = outer_vectors_slot(self.func());
                self.asm.emit(Opcode::PushTemporary, slot as i64);
                self.emit_push_small_int(depth as i64 + 1);
                self.emit_special_send("at:");
                self.emit_push_small_int(vector_index as i64 + 1);
                self.emit_expr(value)?;
                self.emit_special_send("at:put:");
            }
            Binding::Global(name) => {
                return Err(CompileError::AssignToImmutable { name, span });
            }
        }
        Ok(())
    }

    // ---- expressions -----------------------------------------------------

    fn emit_expr(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::Identifier { name, .. } => {
                let binding = self.resolve(name);
                self.emit_push_binding(&binding);
            }
            Expr::LiteralInt { value, .. } => self.emit_push_small_int(*value),
            Expr::LiteralChar { value, .. } => {
                let lit = self.asm.add_literal(Value::from_char(*value as u32), false);
                self.asm.emit(Opcode::PushLiteral, lit as i64);
            }
            Expr::LiteralBool { value, .. } => {
                self.asm.emit(if *value { Opcode::PushTrue } else { Opcode::PushFalse }, 0);
            }
            Expr::LiteralNil { .. } => self.asm.emit(Opcode::PushNil, 0),
            Expr::SelfExpr { .. } | Expr::SuperExpr { .. } => self.asm.emit(Opcode::PushReceiver, 0),
            Expr::Assignment { name, value, span } => self.emit_assignment(name, value, *span)?,
            Expr::MessageSend { receiver, selector, args, .. } => self.emit_send(receiver, selector, args)?,
            Expr::Block { span, .. } => self.emit_closure(expr, *span)?,
        }
        Ok(())
    }

    fn emit_send(&mut self, receiver: &Expr, selector: &str, args: &[Expr]) -> Result<(), CompileError> {
        if let Some(form) = optimize::detect(receiver, selector, args) {
            return self.emit_inlined(form);
        }
        if let Some((expected, actual, span)) = optimize::detect_arity_mismatch(receiver, selector, args) {
            return Err(CompileError::BlockArityMismatch { expected, actual, span });
        }
        let is_super = matches!(receiver, Expr::SuperExpr { .. });
        if is_super {
            self.asm.emit(Opcode::PushReceiver, 0);
        } else {
            self.emit_expr(receiver)?;
        }
        for a in args {
            self.emit_expr(a)?;
        }
        if is_super {
            let sym = self.intern_symbol(selector);
            let lit = self.asm.add_literal(sym, false);
            let operand = ((args.len() as i64) << 16) | lit as i64;
            self.asm.emit(Opcode::SuperSend, operand);
        } else if let Some(idx) = special_selector_index(selector) {
            self.asm.emit(Opcode::SpecialSelectorSend, idx as i64);
        } else {
            let sym = self.intern_symbol(selector);
            let lit = self.asm.add_literal(sym, false);
            match args.len() {
                0 => self.asm.emit(Opcode::ShortSend0, lit as i64),
                1 => self.asm.emit(Opcode::ShortSend1, lit as i64),
                2 => self.asm.emit(Opcode::ShortSend2, lit as i64),
                n => {
                    let operand = ((n as i64) << 16) | lit as i64;
                    self.asm.emit(Opcode::Send, operand);
                }
            }
        }
        Ok(())
    }

    /// Compile an escaping block into its own `CompiledMethod` and emit the
    /// closure-creation sequence. Stack protocol for `Opcode::PushClosure`:
    /// the emitter pushes this activation's own vector (or nil) followed by
    /// this activation's received `outerVectors` array (or nil); the
    /// interpreter pops both (outerVectors on top), conses the own-vector
    /// onto outerVectors when it is non-nil (reusing the same array
    /// reference unchanged otherwise), and stores the result as the new
    /// `BlockClosure`'s `outerVectors`. The operand packs
    /// `(literal_index << 8) | numArgs`.
    fn emit_closure(&mut self, block_expr: &Expr, span: crate::errors::Span) -> Result<(), CompileError> {
        let Expr::Block { params, body, .. } = block_expr else { unreachable!() };
        let child_fid = *self.info.block_functions.get(&span).expect("block must have been analyzed");
        let child_value = compile_function(&mut *self.heap, self.ctx, self.info, child_fid, body, true, None)?;
        let lit = self.asm.add_literal(child_value, false);

        let func = self.func();
        match own_vector_slot(func) {
            Some(slot) => self.asm.emit(Opcode::PushTemporary, slot as i64),
            None => self.asm.emit(Opcode::PushNil, 0),
        }
        self.asm.emit(Opcode::PushTemporary, outer_vectors_slot(func) as i64);
        let operand = (lit as i64) << 8 | (params.len() as i64 & 0xFF);
        self.asm.emit(Opcode::PushClosure, operand);
        Ok(())
    }

    // ---- inlined control flow -----------------------------------------------------

    fn emit_inlined(&mut self, form: optimize::InlinedForm) -> Result<(), CompileError> {
        use optimize::InlinedForm::*;
        match form {
            IfTrue { cond, then_body } => {
                self.emit_expr(cond)?;
                let l_false = self.asm.new_label();
                let l_end = self.asm.new_label();
                self.asm.emit_jump(Opcode::JumpFalse, l_false);
                self.emit_body_as_value(then_body)?;
                self.asm.emit_jump(Opcode::JumpShort, l_end);
                self.asm.bind_label(l_false);
                self.asm.emit(Opcode::PushNil, 0);
                self.asm.bind_label(l_end);
            }
            IfFalse { cond, else_body } => {
                self.emit_expr(cond)?;
                let l_true = self.asm.new_label();
                let l_end = self.asm.new_label();
                self.asm.emit_jump(Opcode::JumpTrue, l_true);
                self.emit_body_as_value(else_body)?;
                self.asm.emit_jump(Opcode::JumpShort, l_end);
                self.asm.bind_label(l_true);
                self.asm.emit(Opcode::PushNil, 0);
                self.asm.bind_label(l_end);
            }
            IfTrueIfFalse { cond, then_body, else_body } => {
                self.emit_expr(cond)?;
                let l_false = self.asm.new_label();
                let l_end = self.asm.new_label();
                self.asm.emit_jump(Opcode::JumpFalse, l_false);
                self.emit_body_as_value(then_body)?;
                self.asm.emit_jump(Opcode::JumpShort, l_end);
                self.asm.bind_label(l_false);
                self.emit_body_as_value(else_body)?;
                self.asm.bind_label(l_end);
            }
            IfNil { receiver, nil_body } => {
                self.emit_expr(receiver)?;
                self.asm.emit(Opcode::Duplicate, 0);
                self.asm.emit(Opcode::PushNil, 0);
                self.emit_special_send("==");
                let l_keep = self.asm.new_label();
                let l_end = self.asm.new_label();
                self.asm.emit_jump(Opcode::JumpFalse, l_keep);
                self.asm.emit(Opcode::Pop, 0);
                self.emit_body_as_value(nil_body)?;
                self.asm.emit_jump(Opcode::JumpShort, l_end);
                self.asm.bind_label(l_keep);
                self.asm.bind_label(l_end);
            }
            IfNotNil { receiver, not_nil_body } => {
                self.emit_expr(receiver)?;
                self.asm.emit(Opcode::Duplicate, 0);
                self.asm.emit(Opcode::PushNil, 0);
                self.emit_special_send("==");
                let l_not_nil = self.asm.new_label();
                let l_end = self.asm.new_label();
                self.asm.emit_jump(Opcode::JumpFalse, l_not_nil);
                self.asm.emit(Opcode::Pop, 0);
                self.asm.emit(Opcode::PushNil, 0);
                self.asm.emit_jump(Opcode::JumpShort, l_end);
                self.asm.bind_label(l_not_nil);
                self.asm.emit(Opcode::Pop, 0);
                self.emit_body_as_value(not_nil_body)?;
                self.asm.bind_label(l_end);
            }
            WhileTrue { cond_body, body } => self.emit_while(cond_body, body, Opcode::JumpFalse)?,
            WhileFalse { cond_body, body } => self.emit_while(cond_body, body, Opcode::JumpTrue)?,
            ToDo { start, stop, loop_var, body } => self.emit_to_do(start, stop, None, loop_var, body)?,
            ToByDo { start, stop, step, loop_var, body } => {
                self.emit_to_do(start, stop, Some(step), loop_var, body)?
            }
        }
        Ok(())
    }

    fn emit_while(&mut self, cond_body: &[Stmt], body: &[Stmt], exit_on: Opcode) -> Result<(), CompileError> {
        let l_top = self.asm.new_label();
        let l_end = self.asm.new_label();
        self.asm.bind_label(l_top);
        self.emit_body_as_value(cond_body)?;
        self.asm.emit_jump(exit_on, l_end);
        self.emit_body_as_value(body)?;
        self.asm.emit(Opcode::Pop, 0);
        self.asm.emit_jump(Opcode::JumpShort, l_top);
        self.asm.bind_label(l_end);
        self.asm.emit(Opcode::PushNil, 0);
        Ok(())
    }

    /// Loop-variable store/read always resolve to `LocalDirect` or
    /// `LocalInVector` — `to:do:`'s loop variable is merged into the
    /// surrounding function's own locals (never an ancestor's), per
    /// `optimize::merged_locals`.
    fn emit_loop_var_store(&mut self, binding: &Binding, pop: bool) {
        match binding {
            Binding::LocalDirect(idx) => {
                self.asm.emit(if pop { Opcode::PopStoreTemporary } else { Opcode::StoreTemporary }, *idx as i64)
            }
            Binding::LocalInVector(idx) => self.asm.emit(
                if pop { Opcode::PopStoreTemporaryInVector } else { Opcode::StoreTemporaryInVector },
                *idx as i64,
            ),
            _ => unreachable!("to:do: loop variable must be a merged local"),
        }
    }

    /// `stop`/`step` are re-evaluated on every iteration rather than cached
    /// once at loop entry — a deliberate simplification for expressions
    /// assumed side-effect-free (see DESIGN.md). A literal integer `step`
    /// picks the comparison selector once, at compile time; a dynamic step
    /// defaults to ascending (`<=`).
    fn emit_to_do(
        &mut self,
        start: &Expr,
        stop: &Expr,
        step: Option<&Expr>,
        loop_var: &str,
        body: &[Stmt],
    ) -> Result<(), CompileError> {
        let binding = self.resolve(loop_var);
        self.emit_expr(start)?;
        self.emit_loop_var_store(&binding, false);

        let descending = matches!(step, Some(Expr::LiteralInt { value, .. }) if *value < 0);
        let cmp = if descending { ">=" } else { "<=" };

        let l_top = self.asm.new_label();
        let l_end = self.asm.new_label();
        self.asm.bind_label(l_top);
        self.emit_push_binding(&binding);
        self.emit_expr(stop)?;
        self.emit_special_send(cmp);
        self.asm.emit_jump(Opcode::JumpFalse, l_end);
        self.emit_body_as_value(body)?;
        self.asm.emit(Opcode::Pop, 0);
        self.emit_push_binding(&binding);
        match step {
            Some(e) => self.emit_expr(e)?,
            None => self.emit_push_small_int(1),
        }
        self.emit_special_send("+");
        self.emit_loop_var_store(&binding, true);
        self.asm.emit_jump(Opcode::JumpShort, l_top);
        self.asm.bind_label(l_end);
        Ok(())
    }
}
