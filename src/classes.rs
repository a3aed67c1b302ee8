//! Class Table and the Behavior/ClassDescription/Class/Metaclass hierarchy.
//!
//! Classes are not heap objects in this design (unlike every other built-in
//! entity); they live in a process-wide table indexed by `classIndex`, grown
//! in fixed-size pages, the way `axiom/src/core/oop.rs`'s `AxClass` registry
//! is looked up by name but generalized here to an index the way
//! `Lodtalk/vm/ClassBuilder.cpp` wires its special-object table.

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::value::Value;

pub const CLASS_TABLE_PAGE_SIZE: usize = 512;

// Reserved special class indices, mirroring the Lodtalk special-object table.
pub const NIL_CLASS_INDEX: u32 = 0;
pub const UNDEFINED_OBJECT_CLASS_INDEX: u32 = 0;
pub const TRUE_CLASS_INDEX: u32 = 1;
pub const FALSE_CLASS_INDEX: u32 = 2;
pub const SMALL_INTEGER_CLASS_INDEX: u32 = 3;
pub const CHARACTER_CLASS_INDEX: u32 = 4;
pub const SMALL_FLOAT_CLASS_INDEX: u32 = 5;
pub const ARRAY_CLASS_INDEX: u32 = 6;
pub const BYTE_STRING_CLASS_INDEX: u32 = 7;
pub const BYTE_SYMBOL_CLASS_INDEX: u32 = 8;
pub const COMPILED_METHOD_CLASS_INDEX: u32 = 9;
pub const BLOCK_CLOSURE_CLASS_INDEX: u32 = 10;
pub const CONTEXT_CLASS_INDEX: u32 = 11;
pub const METHOD_DICTIONARY_CLASS_INDEX: u32 = 12;
pub const METACLASS_CLASS_INDEX: u32 = 13;
pub const CLASS_CLASS_INDEX: u32 = 14;
pub const ASSOCIATION_CLASS_INDEX: u32 = 15;
pub const OBJECT_CLASS_INDEX: u32 = 16;
/// Reified `doesNotUnderstand:` argument: `[selector, arguments]`.
pub const MESSAGE_CLASS_INDEX: u32 = 17;
pub const FIRST_USER_CLASS_INDEX: u32 = 64;

/// Three-kind callable discriminant, resolved by a MethodDictionary probe.
#[derive(Clone)]
pub enum Callee {
    Compiled(Value),
    /// Index into the process-wide primitive table (see `primitives.rs`).
    Native(u32),
}

#[derive(Clone)]
pub struct MethodDictionary {
    keys: Vec<Option<String>>,
    values: Vec<Option<Callee>>,
    tally: usize,
}

impl MethodDictionary {
    pub fn new() -> MethodDictionary {
        MethodDictionary::with_capacity(8)
    }

    fn with_capacity(capacity: usize) -> MethodDictionary {
        MethodDictionary {
            keys: vec![None; capacity],
            values: vec![None; capacity],
            tally: 0,
        }
    }

    pub fn tally(&self) -> usize {
        self.tally
    }

    pub fn capacity(&self) -> usize {
        self.keys.len()
    }

    fn index_for(&self, selector: &str) -> usize {
        let mut idx = (fnv1a(selector) as usize) % self.keys.len();
        loop {
            match &self.keys[idx] {
                Some(k) if k == selector => return idx,
                None => return idx,
                Some(_) => idx = (idx + 1) % self.keys.len(),
            }
        }
    }

    pub fn lookup(&self, selector: &str) -> Option<&Callee> {
        let idx = self.index_for(selector);
        self.values[idx].as_ref()
    }

    pub fn insert(&mut self, selector: String, callee: Callee) {
        if (self.tally + 1) as f64 > 0.8 * self.capacity() as f64 {
            self.grow();
        }
        let idx = self.index_for(&selector);
        if self.keys[idx].is_none() {
            self.tally += 1;
        }
        self.keys[idx] = Some(selector);
        self.values[idx] = Some(callee);
    }

    fn grow(&mut self) {
        let new_capacity = self.capacity() * 2;
        let old_keys = std::mem::replace(&mut self.keys, vec![None; new_capacity]);
        let old_values = std::mem::replace(&mut self.values, vec![None; new_capacity]);
        self.tally = 0;
        for (key, value) in old_keys.into_iter().zip(old_values) {
            if let (Some(k), Some(v)) = (key, value) {
                self.insert(k, v);
            }
        }
    }

    /// Visit every compiled method this dictionary holds — the GC root walk
    /// over class tables needs these (a method reachable only by being
    /// installed here still has to survive a collection).
    fn for_each_compiled_value(&self, f: &mut dyn FnMut(Value)) {
        for v in &self.values {
            if let Some(Callee::Compiled(method)) = v {
                f(*method);
            }
        }
    }

    fn for_each_compiled_value_mut(&mut self, f: &mut dyn FnMut(&mut Value)) {
        for v in &mut self.values {
            if let Some(Callee::Compiled(method)) = v {
                f(method);
            }
        }
    }
}

fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in s.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Behavior: the shape shared by every class-like entity (superclass link,
/// method dictionary, instance layout).
pub struct Behavior {
    pub superclass: Option<u32>,
    pub method_dict: MethodDictionary,
    pub format: crate::object::ObjectFormat,
    pub fixed_variable_count: u32,
    pub name: String,
    pub instance_variables: Vec<String>,
    /// Index of this class's metaclass; `None` for the metaclass itself.
    pub metaclass_index: Option<u32>,
}

impl Behavior {
    pub fn new(name: impl Into<String>, superclass: Option<u32>) -> Behavior {
        Behavior {
            superclass,
            method_dict: MethodDictionary::new(),
            format: crate::object::ObjectFormat::FixedSize,
            fixed_variable_count: 0,
            name: name.into(),
            instance_variables: Vec::new(),
            metaclass_index: None,
        }
    }

    /// Total instance-variable count including all inherited ones, per the
    /// "walk the class description chain, summing inherited lengths" rule
    /// used by the compiler's instance-variable scope resolution.
    pub fn total_instance_variable_count(&self, table: &ClassTable) -> u32 {
        let inherited = self
            .superclass
            .map(|idx| table.get(idx).total_instance_variable_count(table))
            .unwrap_or(0);
        inherited + self.instance_variables.len() as u32
    }

    /// Resolve `selector` by walking superclass → superclass → …, the way
    /// `axiom/src/core/oop.rs`'s `AxClass::resolve_method` walks its vtable
    /// chain.
    pub fn resolve_method(&self, table: &ClassTable, selector: &str) -> Option<Callee> {
        if let Some(callee) = self.method_dict.lookup(selector) {
            return Some(callee.clone());
        }
        self.superclass.and_then(|idx| table.get(idx).resolve_method(table, selector))
    }

    pub fn instance_variable_offset(&self, table: &ClassTable, name: &str) -> Option<u32> {
        let inherited = self
            .superclass
            .map(|idx| table.get(idx).total_instance_variable_count(table))
            .unwrap_or(0);
        self.instance_variables
            .iter()
            .position(|v| v == name)
            .map(|pos| inherited + pos as u32)
    }
}

/// Paged array of class pointers indexed by class index, guarded by a
/// many-readers/single-writer lock (reads sit on the interpreter hot path).
pub struct ClassTableInner {
    pages: Vec<Vec<Option<Behavior>>>,
    by_name: HashMap<String, u32>,
}

impl ClassTableInner {
    fn new() -> ClassTableInner {
        ClassTableInner { pages: Vec::new(), by_name: HashMap::new() }
    }

    fn ensure_page_for(&mut self, index: u32) {
        let page = index as usize / CLASS_TABLE_PAGE_SIZE;
        while self.pages.len() <= page {
            let mut new_page = Vec::with_capacity(CLASS_TABLE_PAGE_SIZE);
            for _ in 0..CLASS_TABLE_PAGE_SIZE {
                new_page.push(None);
            }
            self.pages.push(new_page);
        }
    }

    fn set(&mut self, index: u32, behavior: Behavior) {
        self.ensure_page_for(index);
        let page = index as usize / CLASS_TABLE_PAGE_SIZE;
        let offset = index as usize % CLASS_TABLE_PAGE_SIZE;
        self.by_name.insert(behavior.name.clone(), index);
        self.pages[page][offset] = Some(behavior);
    }

    fn get(&self, index: u32) -> &Behavior {
        let page = index as usize / CLASS_TABLE_PAGE_SIZE;
        let offset = index as usize % CLASS_TABLE_PAGE_SIZE;
        self.pages[page][offset].as_ref().expect("class index out of bounds")
    }

    fn get_mut(&mut self, index: u32) -> &mut Behavior {
        let page = index as usize / CLASS_TABLE_PAGE_SIZE;
        let offset = index as usize % CLASS_TABLE_PAGE_SIZE;
        self.pages[page][offset].as_mut().expect("class index out of bounds")
    }
}

pub struct ClassTable {
    inner: RwLock<ClassTableInner>,
    next_user_index: std::sync::atomic::AtomicU32,
}

impl ClassTable {
    pub fn new() -> ClassTable {
        let table = ClassTable {
            inner: RwLock::new(ClassTableInner::new()),
            next_user_index: std::sync::atomic::AtomicU32::new(FIRST_USER_CLASS_INDEX),
        };
        table.bootstrap();
        table
    }

    fn bootstrap(&self) {
        let builtins: &[(u32, &str, Option<u32>)] = &[
            (UNDEFINED_OBJECT_CLASS_INDEX, "UndefinedObject", Some(OBJECT_CLASS_INDEX)),
            (TRUE_CLASS_INDEX, "True", Some(OBJECT_CLASS_INDEX)),
            (FALSE_CLASS_INDEX, "False", Some(OBJECT_CLASS_INDEX)),
            (SMALL_INTEGER_CLASS_INDEX, "SmallInteger", Some(OBJECT_CLASS_INDEX)),
            (CHARACTER_CLASS_INDEX, "Character", Some(OBJECT_CLASS_INDEX)),
            (SMALL_FLOAT_CLASS_INDEX, "SmallFloat", Some(OBJECT_CLASS_INDEX)),
            (ARRAY_CLASS_INDEX, "Array", Some(OBJECT_CLASS_INDEX)),
            (BYTE_STRING_CLASS_INDEX, "ByteString", Some(OBJECT_CLASS_INDEX)),
            (BYTE_SYMBOL_CLASS_INDEX, "ByteSymbol", Some(OBJECT_CLASS_INDEX)),
            (COMPILED_METHOD_CLASS_INDEX, "CompiledMethod", Some(OBJECT_CLASS_INDEX)),
            (BLOCK_CLOSURE_CLASS_INDEX, "BlockClosure", Some(OBJECT_CLASS_INDEX)),
            (CONTEXT_CLASS_INDEX, "Context", Some(OBJECT_CLASS_INDEX)),
            (METHOD_DICTIONARY_CLASS_INDEX, "MethodDictionary", Some(OBJECT_CLASS_INDEX)),
            (METACLASS_CLASS_INDEX, "Metaclass", Some(OBJECT_CLASS_INDEX)),
            (CLASS_CLASS_INDEX, "Class", Some(OBJECT_CLASS_INDEX)),
            (ASSOCIATION_CLASS_INDEX, "Association", Some(OBJECT_CLASS_INDEX)),
            (OBJECT_CLASS_INDEX, "Object", None),
            (MESSAGE_CLASS_INDEX, "Message", Some(OBJECT_CLASS_INDEX)),
        ];
        let mut inner = self.inner.write();
        for (index, name, superclass) in builtins {
            inner.set(*index, Behavior::new(*name, *superclass));
        }
    }

    pub fn get(&self, index: u32) -> parking_lot::MappedRwLockReadGuard<'_, Behavior> {
        parking_lot::RwLockReadGuard::map(self.inner.read(), |inner| inner.get(index))
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<u32> {
        self.inner.read().by_name.get(name).copied()
    }

    pub fn with_mut<R>(&self, index: u32, f: impl FnOnce(&mut Behavior) -> R) -> R {
        let mut inner = self.inner.write();
        f(inner.get_mut(index))
    }

    /// Visit every compiled method value installed in any class's method
    /// dictionary, across every page — the GC root source `collect` folds in
    /// alongside the stack and the VM's own singletons.
    pub fn for_each_method_value(&self, f: &mut dyn FnMut(Value)) {
        let inner = self.inner.read();
        for page in &inner.pages {
            for slot in page {
                if let Some(behavior) = slot {
                    behavior.method_dict.for_each_compiled_value(f);
                }
            }
        }
    }

    pub fn for_each_method_value_mut(&self, f: &mut dyn FnMut(&mut Value)) {
        let mut inner = self.inner.write();
        for page in &mut inner.pages {
            for slot in page {
                if let Some(behavior) = slot {
                    behavior.method_dict.for_each_compiled_value_mut(f);
                }
            }
        }
    }

    /// Declare a new class; its metaclass occupies the slot immediately
    /// after it, resolving the class/metaclass mutual-pointer cycle via
    /// index indirection rather than direct pointers, per the class table's
    /// role in breaking that cycle.
    pub fn declare_class(&self, name: &str, superclass: u32, instance_variables: Vec<String>) -> u32 {
        let class_index = self.next_user_index.fetch_add(2, std::sync::atomic::Ordering::SeqCst);
        let metaclass_index = class_index + 1;

        let mut behavior = Behavior::new(name, Some(superclass));
        behavior.instance_variables = instance_variables;
        behavior.metaclass_index = Some(metaclass_index);

        let metaclass_superclass = self.get(superclass).metaclass_index;
        let metaclass = Behavior::new(format!("{name} class"), metaclass_superclass.or(Some(CLASS_CLASS_INDEX)));

        {
            let mut inner = self.inner.write();
            inner.set(class_index, behavior);
            inner.set(metaclass_index, metaclass);
        }
        class_index
    }
}

impl Default for ClassTable {
    fn default() -> Self {
        ClassTable::new()
    }
}

/// Fixed value class index, used by the interpreter to resolve an
/// immediate's class without a heap header lookup.
pub fn immediate_class_index(v: Value) -> Option<u32> {
    if v.is_small_int() {
        Some(SMALL_INTEGER_CLASS_INDEX)
    } else if v.is_char() {
        Some(CHARACTER_CLASS_INDEX)
    } else if v.is_small_float() {
        Some(SMALL_FLOAT_CLASS_INDEX)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_dictionary_respects_load_factor_on_insert() {
        let mut dict = MethodDictionary::new();
        for i in 0..20 {
            dict.insert(format!("sel{i}"), Callee::Native(i));
        }
        assert_eq!(dict.tally(), 20);
        assert!(dict.tally() as f64 <= 0.8 * dict.capacity() as f64);
    }

    #[test]
    fn method_dictionary_lookup_after_grow() {
        let mut dict = MethodDictionary::new();
        for i in 0..50 {
            dict.insert(format!("sel{i}"), Callee::Native(i));
        }
        for i in 0..50 {
            match dict.lookup(&format!("sel{i}")) {
                Some(Callee::Native(n)) => assert_eq!(*n, i),
                other => panic!("expected Native({i}), got {:?}", other.is_some()),
            }
        }
    }

    #[test]
    fn declare_class_wires_metaclass_adjacent() {
        let table = ClassTable::new();
        let idx = table.declare_class("Point", OBJECT_CLASS_INDEX, vec!["x".into(), "y".into()]);
        let behavior = table.get(idx);
        assert_eq!(behavior.metaclass_index, Some(idx + 1));
        assert_eq!(behavior.total_instance_variable_count(&table), 2);
    }

    #[test]
    fn instance_variable_offsets_sum_inherited_lengths() {
        let table = ClassTable::new();
        let base = table.declare_class("Shape", OBJECT_CLASS_INDEX, vec!["color".into()]);
        let derived = table.declare_class("Circle", base, vec!["radius".into()]);
        let behavior = table.get(derived);
        assert_eq!(behavior.instance_variable_offset(&table, "radius"), Some(1));
    }
}
