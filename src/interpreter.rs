//! The send/dispatch loop: a stack-of-`Frame`s VM core executing the
//! bytecode `compiler::mod` emits.
//!
//! Generalizes `axiom/src/vm_core.rs`'s `run()` loop (`Vec`-backed frame
//! stack, `continue`-after-push idiom) from register operands to the stack
//! operands this bytecode set uses, cross-checked against
//! `Lodtalk/vm/StackInterpreter.cpp` for send/primitive/return protocol.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::trace;

use crate::bytecode::{self, compiled_method_literal_count, decode_instruction, MethodHeader, Opcode};
use crate::classes::{
    Callee, ClassTable, ARRAY_CLASS_INDEX, BLOCK_CLOSURE_CLASS_INDEX, BYTE_STRING_CLASS_INDEX,
    BYTE_SYMBOL_CLASS_INDEX, CLASS_CLASS_INDEX, MESSAGE_CLASS_INDEX, OBJECT_CLASS_INDEX,
    UNDEFINED_OBJECT_CLASS_INDEX, immediate_class_index,
};
use crate::config::Config;
use crate::errors::InterpError;
use crate::gc::{GarbageCollector, GcStats, RootVisitor};
use crate::heap::Heap;
use crate::object::ObjectFormat;
use crate::primitives;
use crate::stack::StackMemory;
use crate::value::Value;

/// The outcome of a message send, before the caller decides whether a new
/// frame needs the dispatch loop re-entered or a value can be pushed right
/// back onto the sender's operand stack.
enum SendOutcome {
    Pushed,
    Value(Value),
}

/// A root-visitor wrapper over a `HashMap<_, Value>`'s value column, used to
/// keep the symbol and class-value interning caches correct across a moving
/// collection without copying them out and back in.
struct MapValueRoots<'a, K>(&'a mut HashMap<K, Value>);

impl<'a, K> RootVisitor for MapValueRoots<'a, K> {
    fn for_each_root(&self, f: &mut dyn FnMut(Value)) {
        for v in self.0.values() {
            f(*v);
        }
    }

    fn for_each_root_mut(&mut self, f: &mut dyn FnMut(&mut Value)) {
        for v in self.0.values_mut() {
            f(v);
        }
    }
}

pub struct Interpreter {
    heap: Heap,
    classes: ClassTable,
    stack: StackMemory,
    gc: GarbageCollector,
    true_value: Value,
    false_value: Value,
    global_context: Value,
    transcript: Value,
    trace_send: bool,
    symbols: Rc<RefCell<HashMap<String, Value>>>,
    class_values: Rc<RefCell<HashMap<u32, Value>>>,
    /// The class a compiled method was installed under, keyed by the
    /// method's heap address — consulted only by `super` sends, which can't
    /// recover "the class this method lives in" from the receiver.
    method_home_class: HashMap<u64, u32>,
}

impl Interpreter {
    pub fn new(config: &Config) -> Interpreter {
        let mut heap = Heap::new(config.heap_words);
        let classes = ClassTable::new();
        let stack = StackMemory::new(config.stack_page_words);
        let true_value = heap
            .new_object(0, 0, ObjectFormat::FixedSize, crate::classes::TRUE_CLASS_INDEX, Value::NIL)
            .expect("heap exhausted during bootstrap");
        let false_value = heap
            .new_object(0, 0, ObjectFormat::FixedSize, crate::classes::FALSE_CLASS_INDEX, Value::NIL)
            .expect("heap exhausted during bootstrap");
        let global_context = heap
            .new_object(0, 0, ObjectFormat::FixedSize, OBJECT_CLASS_INDEX, Value::NIL)
            .expect("heap exhausted during bootstrap");

        let mut interp = Interpreter {
            heap,
            classes,
            stack,
            gc: GarbageCollector::new(),
            true_value,
            false_value,
            global_context,
            transcript: Value::NIL,
            trace_send: config.trace_send,
            symbols: Rc::new(RefCell::new(HashMap::new())),
            class_values: Rc::new(RefCell::new(HashMap::new())),
            method_home_class: HashMap::new(),
        };
        primitives::install(&mut interp);
        interp
    }

    // ---- Accessors used by script_host / primitives -----------------------

    pub(crate) fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn classes(&self) -> &ClassTable {
        &self.classes
    }

    pub fn global_context(&self) -> Value {
        self.global_context
    }

    pub fn transcript(&self) -> Value {
        self.transcript
    }

    pub(crate) fn set_transcript(&mut self, v: Value) {
        self.transcript = v;
    }

    pub fn register_method_home_class(&mut self, method: Value, class_index: u32) {
        self.method_home_class.insert(method.0, class_index);
    }

    /// Send `main` to `receiver` if some installed class understands it;
    /// scripts with no entry point simply finish after their top-level
    /// statements run.
    pub fn send_main_if_present(&mut self, receiver: Value) -> Result<(), InterpError> {
        let class_index = self.class_index_of(receiver);
        let understands = self.classes.get(class_index).resolve_method(&self.classes, "main").is_some();
        if understands {
            self.send_message_with_selector(receiver, "main", &[])?;
        }
        Ok(())
    }

    // ---- Compiling and running source --------------------------------

    /// Instance variables declared by `class_index` and every class above
    /// it, root-to-leaf — the layout order `Behavior::instance_variable_offset`
    /// assumes.
    pub(crate) fn all_instance_variables(&self, class_index: u32) -> Vec<String> {
        let mut chain = Vec::new();
        let mut current = Some(class_index);
        while let Some(idx) = current {
            chain.push(idx);
            current = self.classes.get(idx).superclass;
        }
        chain.reverse();
        chain.into_iter().flat_map(|idx| self.classes.get(idx).instance_variables.clone()).collect()
    }

    fn compile_against(&mut self, instance_variables: &[String], method: &crate::ast::MethodDef) -> Result<Value, crate::errors::CompileError> {
        let transcript = self.transcript;
        let classes_ref: &ClassTable = &self.classes;
        let resolver = |name: &str| {
            if name == "Transcript" {
                Some(crate::compiler::GlobalRef::Value(transcript))
            } else {
                classes_ref.lookup_by_name(name).map(crate::compiler::GlobalRef::Class)
            }
        };
        let class_values = RefCell::new(HashMap::new());
        let symbols = RefCell::new(HashMap::new());
        let ctx = crate::compiler::CompileContext {
            classes: classes_ref,
            instance_variables,
            resolve_global: &resolver,
            class_values: &class_values,
            symbols: &symbols,
        };
        crate::compiler::compile_method(&mut self.heap, &ctx, method)
    }

    /// Compile `method` against `class_index`'s instance-variable layout and
    /// install it into that class's method dictionary.
    pub(crate) fn compile_and_install_method(&mut self, class_index: u32, method: &crate::ast::MethodDef) -> Result<(), crate::errors::CompileError> {
        let instance_variables = self.all_instance_variables(class_index);
        let compiled = self.compile_against(&instance_variables, method)?;
        self.register_method_home_class(compiled, class_index);
        self.classes.with_mut(class_index, |b| {
            b.method_dict.insert(method.selector.clone(), Callee::Compiled(compiled));
        });
        Ok(())
    }

    /// Compile a single top-level statement as a synthetic zero-argument
    /// `doIt` method and run it to completion against `global_context`.
    pub fn run_top_level_statement(&mut self, stmt: &crate::ast::Stmt) -> Result<Value, crate::errors::TalonError> {
        let synthetic =
            crate::ast::MethodDef { selector: "doIt".to_string(), params: vec![], temps: vec![], body: vec![stmt.clone()] };
        let compiled = self.compile_against(&[], &synthetic)?;
        let base_depth = self.stack.frame_count();
        let receiver = self.global_context;
        self.stack.activate_method_frame(&mut self.heap, compiled, receiver, Value::NIL, false, &[])?;
        Ok(self.execute(base_depth)?)
    }

    // ---- Allocation ---------------------------------------------------

    pub(crate) fn allocate(
        &mut self,
        fixed_slots: usize,
        indexable_words: usize,
        format: ObjectFormat,
        class_index: u32,
    ) -> Result<Value, InterpError> {
        match self.heap.new_object(fixed_slots, indexable_words, format, class_index, Value::NIL) {
            Ok(v) => Ok(v),
            Err(InterpError::OutOfMemory) => {
                self.force_collect();
                self.heap.new_object(fixed_slots, indexable_words, format, class_index, Value::NIL)
            }
            Err(e) => Err(e),
        }
    }

    /// Attempt a collection on the `OutOfMemory` rescue path, rooting the
    /// VM's own singletons and interning caches alongside the stack. Honors
    /// an active `DisableGuard` scope the same as any other caller of
    /// `maybe_collect` — a disabled scope means this is a no-op and the
    /// `OutOfMemory` the caller just saw is allowed to stand.
    fn force_collect(&mut self) -> GcStats {
        let mut misc = crate::gc::RootList(vec![
            self.true_value,
            self.false_value,
            self.global_context,
            self.transcript,
        ]);
        let mut symbols_ref = self.symbols.borrow_mut();
        let mut class_values_ref = self.class_values.borrow_mut();
        let mut symbol_roots = MapValueRoots(&mut symbols_ref);
        let mut class_value_roots = MapValueRoots(&mut class_values_ref);
        let mut roots: Vec<&mut dyn RootVisitor> =
            vec![&mut self.stack, &mut misc, &mut symbol_roots, &mut class_value_roots];
        let stats = self.gc.maybe_collect(&mut self.heap, &self.classes, &mut roots);
        drop(symbols_ref);
        drop(class_values_ref);
        trace!(objects_collected = stats.objects_collected, aborted = stats.aborted, "forced gc on OOM");
        self.true_value = misc.0[0];
        self.false_value = misc.0[1];
        self.global_context = misc.0[2];
        self.transcript = misc.0[3];
        stats
    }

    fn allocate_array_from(&mut self, items: &[Value]) -> Result<Value, InterpError> {
        let arr = self.allocate(0, items.len(), ObjectFormat::VariableSizeNoIvars, ARRAY_CLASS_INDEX)?;
        for (i, v) in items.iter().enumerate() {
            self.heap.set_slot_at(arr, i, *v);
        }
        Ok(arr)
    }

    pub(crate) fn basic_new(&mut self, class_index: u32) -> Result<Value, InterpError> {
        let ivar_count = self.classes.get(class_index).total_instance_variable_count(&self.classes) as usize;
        let format = self.classes.get(class_index).format;
        self.allocate(ivar_count, 0, format, class_index)
    }

    pub(crate) fn basic_new_with_size(&mut self, class_index: u32, size: usize) -> Result<Value, InterpError> {
        let ivar_count = self.classes.get(class_index).total_instance_variable_count(&self.classes) as usize;
        self.allocate(ivar_count, size, ObjectFormat::VariableSizeIvars, class_index)
    }

    // ---- Class/identity helpers -----------------------------------------

    fn class_index_of(&self, v: Value) -> u32 {
        if v == Value::NIL {
            return UNDEFINED_OBJECT_CLASS_INDEX;
        }
        if let Some(idx) = immediate_class_index(v) {
            return idx;
        }
        self.heap.header(v).class_index()
    }

    fn class_value_of(&mut self, class_index: u32) -> Value {
        if let Some(v) = self.class_values.borrow().get(&class_index) {
            return *v;
        }
        let metaclass_index = self.classes.get(class_index).metaclass_index.unwrap_or(CLASS_CLASS_INDEX);
        let v = self
            .allocate(1, 0, ObjectFormat::FixedSize, metaclass_index)
            .expect("heap exhausted materializing class value");
        self.heap.set_slot_at(v, 0, Value::from_small_int(class_index as i64));
        self.class_values.borrow_mut().insert(class_index, v);
        v
    }

    pub(crate) fn class_index_from_class_value(&self, class_value: Value) -> u32 {
        self.heap
            .slot_at(class_value, 0)
            .as_small_int()
            .expect("class value slot 0 must hold a SmallInteger") as u32
    }

    fn intern_symbol(&mut self, name: &str) -> Value {
        if let Some(v) = self.symbols.borrow().get(name) {
            return *v;
        }
        let bytes = name.as_bytes().to_vec();
        let v = self
            .allocate(0, bytes.len(), ObjectFormat::Indexable8(0), BYTE_SYMBOL_CLASS_INDEX)
            .expect("heap exhausted interning symbol");
        for (i, b) in bytes.iter().enumerate() {
            self.heap.set_slot_at(v, i, Value(*b as u64));
        }
        self.symbols.borrow_mut().insert(name.to_string(), v);
        v
    }

    fn symbol_string(&self, sym: Value) -> String {
        let len = self.heap.slot_count(sym);
        let bytes: Vec<u8> = (0..len).map(|i| self.heap.slot_at(sym, i).0 as u8).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub(crate) fn display_string(&self, v: Value) -> String {
        if v == Value::NIL {
            return "nil".to_string();
        }
        if v == self.true_value {
            return "true".to_string();
        }
        if v == self.false_value {
            return "false".to_string();
        }
        if let Some(n) = v.as_small_int() {
            return n.to_string();
        }
        if let Some(c) = v.as_char() {
            return char::from_u32(c).map(|c| c.to_string()).unwrap_or_default();
        }
        if let Some(f) = v.as_small_float() {
            return f.to_string();
        }
        let class_index = self.class_index_of(v);
        if class_index == BYTE_STRING_CLASS_INDEX || class_index == BYTE_SYMBOL_CLASS_INDEX {
            return self.symbol_string(v);
        }
        format!("a {}", self.classes.get(class_index).name)
    }

    // ---- Bytecode decoding ------------------------------------------------

    fn bytecode_bytes(&self, method: Value) -> Vec<u8> {
        let literal_count = compiled_method_literal_count(&self.heap, method);
        let fixed = 1 + literal_count;
        let total = self.heap.slot_count(method);
        (fixed..total).map(|i| self.heap.slot_at(method, i).0 as u8).collect()
    }

    fn decode_at(&self, method: Value, pc: usize) -> Result<(Opcode, i64, usize), InterpError> {
        let bytes = self.bytecode_bytes(method);
        decode_instruction(&bytes, pc)
    }

    fn literal_at(&self, method: Value, index: usize) -> Value {
        self.heap.slot_at(method, 1 + index)
    }

    // ---- Closure vector plumbing ------------------------------------------

    fn own_vector(&self) -> Value {
        let method = self.stack.current().method;
        let header = MethodHeader::decode(self.heap.slot_at(method, 0));
        let slot = header.temporary_count as usize - 2;
        self.stack.get_temporary(slot)
    }

    fn store_in_own_vector(&mut self, idx: usize, v: Value) {
        let vector = self.own_vector();
        self.heap.set_slot_at(vector, idx, v);
    }

    fn read_from_own_vector(&self, idx: usize) -> Value {
        let vector = self.own_vector();
        self.heap.slot_at(vector, idx)
    }

    /// Cons `own` onto the front of `outer` (or wrap it alone if `outer` is
    /// nil), the way the emitted `pushClosure` sequence expects its two
    /// popped operands to combine into the new closure's `outerVectors`.
    fn cons_vector(&mut self, own: Value, outer: Value) -> Result<Value, InterpError> {
        let existing_len = if outer == Value::NIL { 0 } else { self.heap.slot_count(outer) };
        let new_vec = self.allocate(0, existing_len + 1, ObjectFormat::VariableSizeNoIvars, ARRAY_CLASS_INDEX)?;
        self.heap.set_slot_at(new_vec, 0, own);
        for i in 0..existing_len {
            let v = self.heap.slot_at(outer, i);
            self.heap.set_slot_at(new_vec, i + 1, v);
        }
        Ok(new_vec)
    }

    fn activate_block(&mut self, closure: Value, args: &[Value]) -> Result<(), InterpError> {
        let compiled_block = self.heap.slot_at(closure, 2);
        let outer_vectors = self.heap.slot_at(closure, 0);
        let home_context = self.heap.slot_at(closure, 1);
        let receiver = self.heap.slot_at(home_context, 5);
        self.stack.activate_method_frame(&mut self.heap, compiled_block, receiver, closure, true, args)?;
        let header = MethodHeader::decode(self.heap.slot_at(compiled_block, 0));
        let outer_slot = header.temporary_count as usize - 1;
        self.stack.set_temporary(outer_slot, outer_vectors);
        Ok(())
    }

    // ---- Indexable-object fast path ---------------------------------------

    fn is_indexable(&self, v: Value) -> bool {
        v.is_pointer() && v != Value::NIL && self.heap.header(v).format().is_pointer_format()
    }

    fn array_at(&self, receiver: Value, idx: i64) -> Result<Value, InterpError> {
        let size = self.heap.slot_count(receiver) as i64;
        if idx < 1 || idx > size {
            return Err(InterpError::IndexOutOfBounds { index: idx, size: size as usize });
        }
        Ok(self.heap.slot_at(receiver, (idx - 1) as usize))
    }

    fn array_at_put(&mut self, receiver: Value, idx: i64, v: Value) -> Result<Value, InterpError> {
        let size = self.heap.slot_count(receiver) as i64;
        if idx < 1 || idx > size {
            return Err(InterpError::IndexOutOfBounds { index: idx, size: size as usize });
        }
        self.heap.set_slot_at(receiver, (idx - 1) as usize, v);
        Ok(v)
    }

    // ---- Sends --------------------------------------------------------

    fn bool_value(&self, b: bool) -> Value {
        if b {
            self.true_value
        } else {
            self.false_value
        }
    }

    fn inline_arith(&self, selector: &str, a: i64, b: i64) -> Value {
        match selector {
            "+" => Value::from_small_int(a.wrapping_add(b)),
            "-" => Value::from_small_int(a.wrapping_sub(b)),
            "*" => Value::from_small_int(a.wrapping_mul(b)),
            "/" => Value::from_small_int(a / b),
            "\\\\" => Value::from_small_int(a.rem_euclid(b)),
            "//" => Value::from_small_int(a.div_euclid(b)),
            "<" => self.bool_value(a < b),
            ">" => self.bool_value(a > b),
            "<=" => self.bool_value(a <= b),
            ">=" => self.bool_value(a >= b),
            "=" => self.bool_value(a == b),
            "~=" => self.bool_value(a != b),
            _ => unreachable!("not an arithmetic/compare selector: {selector}"),
        }
    }

    fn try_inline_special(&mut self, receiver: Value, selector: &str, args: &[Value]) -> Result<Option<Value>, InterpError> {
        match (selector, args.len()) {
            ("+", 1) | ("-", 1) | ("*", 1) | ("<", 1) | (">", 1) | ("<=", 1) | (">=", 1) | ("=", 1) | ("~=", 1) => {
                if let (Some(a), Some(b)) = (receiver.as_small_int(), args[0].as_small_int()) {
                    return Ok(Some(self.inline_arith(selector, a, b)));
                }
                Ok(None)
            }
            ("/", 1) | ("\\\\", 1) | ("//", 1) => {
                if let (Some(a), Some(b)) = (receiver.as_small_int(), args[0].as_small_int()) {
                    if b == 0 {
                        return Ok(None);
                    }
                    return Ok(Some(self.inline_arith(selector, a, b)));
                }
                Ok(None)
            }
            ("==", 1) => Ok(Some(self.bool_value(receiver.0 == args[0].0))),
            ("~~", 1) => Ok(Some(self.bool_value(receiver.0 != args[0].0))),
            ("class", 0) => {
                let class_index = self.class_index_of(receiver);
                Ok(Some(self.class_value_of(class_index)))
            }
            ("size", 0) => {
                if !self.is_indexable(receiver) {
                    return Ok(None);
                }
                Ok(Some(Value::from_small_int(self.heap.slot_count(receiver) as i64)))
            }
            ("at:", 1) => {
                if !self.is_indexable(receiver) {
                    return Ok(None);
                }
                match args[0].as_small_int() {
                    Some(idx) => Ok(Some(self.array_at(receiver, idx)?)),
                    None => Ok(None),
                }
            }
            ("at:put:", 2) => {
                if !self.is_indexable(receiver) {
                    return Ok(None);
                }
                match args[0].as_small_int() {
                    Some(idx) => Ok(Some(self.array_at_put(receiver, idx, args[1])?)),
                    None => Ok(None),
                }
            }
            _ => Ok(None),
        }
    }

    fn block_value_arity(selector: &str) -> Option<usize> {
        match selector {
            "value" => Some(0),
            "value:" => Some(1),
            "value:value:" => Some(2),
            "value:value:value:" => Some(3),
            "value:value:value:value:" => Some(4),
            "value:value:value:value:value:" => Some(5),
            "value:value:value:value:value:value:" => Some(6),
            _ => None,
        }
    }

    fn special_selector_arity(selector: &str) -> usize {
        match selector {
            "size" | "next" | "atEnd" | "class" | "value" | "new" | "basicNew" => 0,
            "at:put:" => 2,
            _ => 1,
        }
    }

    fn activate_send(
        &mut self,
        receiver: Value,
        selector: &str,
        selector_symbol: Option<Value>,
        args: &[Value],
        is_super: bool,
    ) -> Result<SendOutcome, InterpError> {
        if !is_super {
            if let Some(expected) = Self::block_value_arity(selector) {
                if expected == args.len() && self.class_index_of(receiver) == BLOCK_CLOSURE_CLASS_INDEX {
                    let compiled_block = self.heap.slot_at(receiver, 2);
                    let header = MethodHeader::decode(self.heap.slot_at(compiled_block, 0));
                    if header.argument_count as usize == args.len() {
                        self.activate_block(receiver, args)?;
                        return Ok(SendOutcome::Pushed);
                    }
                }
            }
            if let Some(v) = self.try_inline_special(receiver, selector, args)? {
                return Ok(SendOutcome::Value(v));
            }
        }

        let receiver_class = self.class_index_of(receiver);
        let start_class = if is_super {
            let current_method = self.stack.current().method;
            self.method_home_class
                .get(&current_method.0)
                .and_then(|&home| self.classes.get(home).superclass)
                .unwrap_or(receiver_class)
        } else {
            receiver_class
        };

        let callee: Option<Callee> = self.classes.get(start_class).resolve_method(&self.classes, selector);
        match callee {
            Some(Callee::Compiled(m)) => {
                self.stack.activate_method_frame(&mut self.heap, m, receiver, Value::NIL, false, args)?;
                Ok(SendOutcome::Pushed)
            }
            Some(Callee::Native(idx)) => {
                let v = primitives::invoke(idx, self, receiver, args)?;
                Ok(SendOutcome::Value(v))
            }
            None => {
                let v = self.does_not_understand(receiver, receiver_class, selector, selector_symbol, args)?;
                Ok(SendOutcome::Value(v))
            }
        }
    }

    fn does_not_understand(
        &mut self,
        receiver: Value,
        receiver_class: u32,
        selector: &str,
        selector_symbol: Option<Value>,
        args: &[Value],
    ) -> Result<Value, InterpError> {
        let handler: Option<Callee> =
            self.classes.get(receiver_class).resolve_method(&self.classes, "doesNotUnderstand:");
        match handler {
            Some(callee) => {
                let sym = selector_symbol.unwrap_or_else(|| self.intern_symbol(selector));
                let args_array = self.allocate_array_from(args)?;
                let message = self.allocate(2, 0, ObjectFormat::FixedSize, MESSAGE_CLASS_INDEX)?;
                self.heap.set_slot_at(message, 0, sym);
                self.heap.set_slot_at(message, 1, args_array);
                match callee {
                    Callee::Compiled(m) => {
                        let base_depth = self.stack.frame_count();
                        self.stack.activate_method_frame(&mut self.heap, m, receiver, Value::NIL, false, &[message])?;
                        self.execute(base_depth)
                    }
                    Callee::Native(idx) => primitives::invoke(idx, self, receiver, &[message]),
                }
            }
            None => {
                let class_name = self.classes.get(receiver_class).name.clone();
                Err(InterpError::DoesNotUnderstand { receiver_class: class_name, selector: selector.to_string() })
            }
        }
    }

    /// Drive a single synchronous send to completion — used for the rare
    /// sends the interpreter itself issues outside the ordinary bytecode
    /// stream (`mustBeBoolean`, `doesNotUnderstand:`'s recursive re-entry).
    pub fn send_message_with_selector(&mut self, receiver: Value, selector: &str, args: &[Value]) -> Result<Value, InterpError> {
        let base_depth = self.stack.frame_count();
        match self.activate_send(receiver, selector, None, args, false)? {
            SendOutcome::Value(v) => Ok(v),
            SendOutcome::Pushed => self.execute(base_depth),
        }
    }

    fn perform_send(&mut self, selector: &str, selector_symbol: Option<Value>, arg_count: usize, is_super: bool) -> Result<(), InterpError> {
        let mut args = Vec::with_capacity(arg_count);
        for _ in 0..arg_count {
            args.push(self.stack.pop_oop()?);
        }
        args.reverse();
        let receiver = self.stack.pop_oop()?;
        match self.activate_send(receiver, selector, selector_symbol, &args, is_super)? {
            SendOutcome::Pushed => {}
            SendOutcome::Value(v) => self.stack.push_oop(v),
        }
        Ok(())
    }

    fn evaluate_condition(&mut self, v: Value) -> Result<bool, InterpError> {
        if v == self.true_value {
            return Ok(true);
        }
        if v == self.false_value {
            return Ok(false);
        }
        let result = self.send_message_with_selector(v, "mustBeBoolean", &[])?;
        if result == self.true_value {
            Ok(true)
        } else if result == self.false_value {
            Ok(false)
        } else {
            Err(InterpError::MustBeBoolean)
        }
    }

    // ---- Returns ------------------------------------------------------

    fn complete_return(&mut self, base_depth: usize, value: Value, non_local: bool) -> Result<Option<Value>, InterpError> {
        let return_pc = if non_local {
            let closure = self.stack.current().closure_or_nil;
            let home_context = self.heap.slot_at(closure, 1);
            self.stack.unwind_non_local(home_context)?.return_pc
        } else {
            self.stack.pop_frame().return_pc
        };
        if self.stack.frame_count() == base_depth {
            return Ok(Some(value));
        }
        let return_pc = return_pc.expect("a non-root frame always has a return_pc");
        self.stack.current_mut().pc = return_pc;
        self.stack.push_oop(value);
        Ok(None)
    }

    // ---- Dispatch loop --------------------------------------------------

    pub fn execute(&mut self, base_depth: usize) -> Result<Value, InterpError> {
        loop {
            if let Some(v) = self.dispatch_one(base_depth)? {
                return Ok(v);
            }
        }
    }

    fn dispatch_one(&mut self, base_depth: usize) -> Result<Option<Value>, InterpError> {
        let method = self.stack.current().method;
        let pc = self.stack.current().pc;
        let (opcode, operand, next_pc) = self.decode_at(method, pc)?;
        self.stack.current_mut().pc = next_pc;

        if self.trace_send {
            if matches!(
                opcode,
                Opcode::Send | Opcode::SuperSend | Opcode::ShortSend0 | Opcode::ShortSend1 | Opcode::ShortSend2 | Opcode::SpecialSelectorSend
            ) {
                trace!(?opcode, operand, pc, "send");
            }
        }

        match opcode {
            Opcode::PushReceiverVariable => {
                let receiver = self.stack.get_receiver();
                let v = self.heap.slot_at(receiver, operand as usize);
                self.stack.push_oop(v);
            }
            Opcode::PushLiteralVariable => {
                let assoc = self.literal_at(method, operand as usize);
                let v = self.heap.slot_at(assoc, 1);
                self.stack.push_oop(v);
            }
            Opcode::PushLiteral => {
                let v = self.literal_at(method, operand as usize);
                self.stack.push_oop(v);
            }
            Opcode::PushTemporary => {
                let v = self.stack.get_temporary(operand as usize);
                self.stack.push_oop(v);
            }
            Opcode::PushReceiver => {
                let v = self.stack.get_receiver();
                self.stack.push_oop(v);
            }
            Opcode::PushNil => self.stack.push_oop(Value::NIL),
            Opcode::PushTrue => {
                let v = self.true_value;
                self.stack.push_oop(v);
            }
            Opcode::PushFalse => {
                let v = self.false_value;
                self.stack.push_oop(v);
            }
            Opcode::PushSmallInt => self.stack.push_oop(Value::from_small_int(operand)),
            Opcode::PushZero => self.stack.push_oop(Value::from_small_int(0)),
            Opcode::PushOne => self.stack.push_oop(Value::from_small_int(1)),
            Opcode::Duplicate => self.stack.duplicate()?,
            Opcode::Pop => {
                self.stack.pop_oop()?;
            }
            Opcode::PushNewArray => {
                let count = operand as usize;
                let arr = self.allocate(0, count, ObjectFormat::VariableSizeNoIvars, ARRAY_CLASS_INDEX)?;
                self.stack.push_oop(arr);
            }
            Opcode::PushNClosureTemps => {
                let count = operand as usize;
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    values.push(self.stack.pop_oop()?);
                }
                values.reverse();
                let arr = self.allocate_array_from(&values)?;
                self.stack.push_oop(arr);
            }
            Opcode::StoreReceiverVariable => {
                let v = self.stack.stack_oop_at(0)?;
                let receiver = self.stack.get_receiver();
                self.heap.set_slot_at(receiver, operand as usize, v);
            }
            Opcode::PopStoreReceiverVariable => {
                let v = self.stack.pop_oop()?;
                let receiver = self.stack.get_receiver();
                self.heap.set_slot_at(receiver, operand as usize, v);
            }
            Opcode::StoreLiteralVariable => {
                let v = self.stack.stack_oop_at(0)?;
                let assoc = self.literal_at(method, operand as usize);
                self.heap.set_slot_at(assoc, 1, v);
            }
            Opcode::PopStoreLiteralVariable => {
                let v = self.stack.pop_oop()?;
                let assoc = self.literal_at(method, operand as usize);
                self.heap.set_slot_at(assoc, 1, v);
            }
            Opcode::StoreTemporary => {
                let v = self.stack.stack_oop_at(0)?;
                self.stack.set_temporary(operand as usize, v);
            }
            Opcode::PopStoreTemporary => {
                let v = self.stack.pop_oop()?;
                self.stack.set_temporary(operand as usize, v);
            }
            Opcode::StoreTemporaryInVector => {
                let v = self.stack.stack_oop_at(0)?;
                self.store_in_own_vector(operand as usize, v);
            }
            Opcode::PopStoreTemporaryInVector => {
                let v = self.stack.pop_oop()?;
                self.store_in_own_vector(operand as usize, v);
            }
            Opcode::PushTemporaryInVector => {
                let v = self.read_from_own_vector(operand as usize);
                self.stack.push_oop(v);
            }
            Opcode::PushClosure => {
                let outer_vectors = self.stack.pop_oop()?;
                let own_vector_or_nil = self.stack.pop_oop()?;
                let new_outer_vectors = if own_vector_or_nil != Value::NIL {
                    self.cons_vector(own_vector_or_nil, outer_vectors)?
                } else {
                    outer_vectors
                };
                let lit_index = (operand >> 8) as usize;
                let compiled_block = self.literal_at(method, lit_index);
                let home_context = self.stack.marry_current_frame(&mut self.heap)?;
                let closure = self.allocate(3, 0, ObjectFormat::FixedSize, BLOCK_CLOSURE_CLASS_INDEX)?;
                self.heap.set_slot_at(closure, 0, new_outer_vectors);
                self.heap.set_slot_at(closure, 1, home_context);
                self.heap.set_slot_at(closure, 2, compiled_block);
                self.stack.push_oop(closure);
            }
            Opcode::Send => {
                let lit = (operand & 0xFFFF) as usize;
                let arg_count = (operand >> 16) as usize;
                let sym = self.literal_at(method, lit);
                let selector = self.symbol_string(sym);
                self.perform_send(&selector, Some(sym), arg_count, false)?;
            }
            Opcode::SuperSend => {
                let lit = (operand & 0xFFFF) as usize;
                let arg_count = (operand >> 16) as usize;
                let sym = self.literal_at(method, lit);
                let selector = self.symbol_string(sym);
                self.perform_send(&selector, Some(sym), arg_count, true)?;
            }
            Opcode::ShortSend0 | Opcode::ShortSend1 | Opcode::ShortSend2 => {
                let arg_count = match opcode {
                    Opcode::ShortSend0 => 0,
                    Opcode::ShortSend1 => 1,
                    _ => 2,
                };
                let sym = self.literal_at(method, operand as usize);
                let selector = self.symbol_string(sym);
                self.perform_send(&selector, Some(sym), arg_count, false)?;
            }
            Opcode::SpecialSelectorSend => {
                let selector = bytecode::SPECIAL_SELECTORS[operand as usize];
                let arg_count = Self::special_selector_arity(selector);
                self.perform_send(selector, None, arg_count, false)?;
            }
            Opcode::JumpShort | Opcode::JumpLong => {
                self.stack.current_mut().pc = (next_pc as i64 + operand) as usize;
            }
            Opcode::JumpTrue => {
                let cond = self.stack.pop_oop()?;
                if self.evaluate_condition(cond)? {
                    self.stack.current_mut().pc = (next_pc as i64 + operand) as usize;
                }
            }
            Opcode::JumpFalse => {
                let cond = self.stack.pop_oop()?;
                if !self.evaluate_condition(cond)? {
                    self.stack.current_mut().pc = (next_pc as i64 + operand) as usize;
                }
            }
            Opcode::ReturnReceiver => {
                let v = self.stack.get_receiver();
                return self.complete_return(base_depth, v, false);
            }
            Opcode::ReturnTrue => {
                let v = self.true_value;
                return self.complete_return(base_depth, v, false);
            }
            Opcode::ReturnFalse => {
                let v = self.false_value;
                return self.complete_return(base_depth, v, false);
            }
            Opcode::ReturnNil => {
                return self.complete_return(base_depth, Value::NIL, false);
            }
            Opcode::ReturnTop => {
                let v = self.stack.pop_oop()?;
                let non_local = self.stack.current().metadata.is_block;
                return self.complete_return(base_depth, v, non_local);
            }
            Opcode::BlockReturnTop => {
                let v = self.stack.pop_oop()?;
                return self.complete_return(base_depth, v, false);
            }
            Opcode::ExtA | Opcode::ExtB => {
                return Err(InterpError::MalformedBytecode { pc, detail: "unconsumed extension prefix".into() });
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classes::OBJECT_CLASS_INDEX;
    use crate::compiler::{self, CompileContext, GlobalRef};
    use crate::parser::Parser;

    fn make_interp() -> Interpreter {
        Interpreter::new(&Config { heap_words: 1 << 16, ..Config::default() })
    }

    fn compile_and_run(interp: &mut Interpreter, source: &str) -> Value {
        let method_def = Parser::from_source(source).unwrap().parse_method_fragment().unwrap();
        let class_values = RefCell::new(HashMap::new());
        let symbols = RefCell::new(HashMap::new());
        let resolver = |_: &str| -> Option<GlobalRef> { None };
        let ctx = CompileContext {
            classes: &interp.classes,
            instance_variables: &[],
            resolve_global: &resolver,
            class_values: &class_values,
            symbols: &symbols,
        };
        let compiled = compiler::compile_method(&mut interp.heap, &ctx, &method_def).unwrap();
        let base_depth = interp.stack.frame_count();
        interp.stack.activate_method_frame(&mut interp.heap, compiled, interp.global_context, Value::NIL, false, &[]).unwrap();
        interp.execute(base_depth).unwrap()
    }

    #[test]
    fn simple_arithmetic_and_return() {
        let mut interp = make_interp();
        let v = compile_and_run(&mut interp, "doIt [ | x | x := 2 + 3. ^ x ]");
        assert_eq!(v.as_small_int(), Some(5));
    }

    #[test]
    fn block_value_with_two_args() {
        let mut interp = make_interp();
        let v = compile_and_run(&mut interp, "doIt [ ^ [:a :b | a * b] value: 4 value: 5 ]");
        assert_eq!(v.as_small_int(), Some(20));
    }

    #[test]
    fn if_true_if_false_inlining() {
        let mut interp = make_interp();
        let v = compile_and_run(&mut interp, "doIt [ ^ true ifTrue: [1] ifFalse: [2] ]");
        assert_eq!(v.as_small_int(), Some(1));
        let v = compile_and_run(&mut interp, "doIt [ ^ false ifTrue: [1] ifFalse: [2] ]");
        assert_eq!(v.as_small_int(), Some(2));
    }

    #[test]
    fn instance_creation_reads_nil_ivar() {
        let mut interp = make_interp();
        let class_index = interp.classes().declare_class("A", OBJECT_CLASS_INDEX, vec!["x".to_string()]);
        let method_def = Parser::from_source("x [ ^ x ]").unwrap().parse_method_fragment().unwrap();
        let class_values = RefCell::new(HashMap::new());
        let symbols = RefCell::new(HashMap::new());
        let resolver = |_: &str| -> Option<GlobalRef> { None };
        let ctx = CompileContext {
            classes: &interp.classes,
            instance_variables: &["x".to_string()],
            resolve_global: &resolver,
            class_values: &class_values,
            symbols: &symbols,
        };
        let compiled = compiler::compile_method(&mut interp.heap, &ctx, &method_def).unwrap();
        interp.register_method_home_class(compiled, class_index);
        interp.classes().with_mut(class_index, |b| b.method_dict.insert("x".to_string(), Callee::Compiled(compiled)));
        let instance = interp.basic_new(class_index).unwrap();
        let v = interp.send_message_with_selector(instance, "x", &[]).unwrap();
        assert_eq!(v, Value::NIL);
    }

    #[test]
    fn disabled_gc_scope_skips_collection_and_preserves_live_data() {
        let mut interp = make_interp();
        let arr = interp.allocate_array_from(&[Value::from_small_int(1), Value::from_small_int(2)]).unwrap();
        let guard = interp.gc.disable();
        let stats = interp.force_collect();
        drop(guard);
        // `force_collect` must have been a no-op while disabled: nothing
        // scanned or collected, and the live array survives untouched.
        assert_eq!(stats.objects_scanned, 0);
        assert_eq!(stats.objects_collected, 0);
        assert_eq!(interp.heap.slot_at(arr, 0).as_small_int(), Some(1));
        assert_eq!(interp.heap.slot_at(arr, 1).as_small_int(), Some(2));
    }
}
