//! Mark-compact, stop-the-world, single-generation, precise, moving
//! garbage collector.
//!
//! Generalizes `axiom/src/gc.rs`'s generational semi-space `GC` struct (bump
//! arena, root registration, `GCStats`) down to the single-generation
//! 4-pass algorithm described by `Lodtalk/vm/MemoryManager.cpp`: Mark, Plan,
//! Rewrite, Move.

use tracing::{debug, trace};

use crate::classes::ClassTable;
use crate::heap::{Heap, HEADER_WORDS, PREHEADER_WORDS};
use crate::object::{GcColor, ObjectFormat};
use crate::value::Value;

/// Anything that can hand the collector every `Value`-shaped root it holds.
/// Stack memories, the native-pin list, and registered C-side ranges all
/// implement this so the collector never needs to know their storage shape.
pub trait RootVisitor {
    fn for_each_root(&self, f: &mut dyn FnMut(Value));
    fn for_each_root_mut(&mut self, f: &mut dyn FnMut(&mut Value));
}

/// A plain `Vec<Value>` root list — used for the registered C-side ranges,
/// the native-object pin list, and the symbol dictionary's value column.
#[derive(Default)]
pub struct RootList(pub Vec<Value>);

impl RootVisitor for RootList {
    fn for_each_root(&self, f: &mut dyn FnMut(Value)) {
        for v in &self.0 {
            f(*v);
        }
    }
    fn for_each_root_mut(&mut self, f: &mut dyn FnMut(&mut Value)) {
        for v in &mut self.0 {
            f(v);
        }
    }
}

#[derive(Default, Debug, Clone, Copy)]
pub struct GcStats {
    pub objects_scanned: usize,
    pub objects_collected: usize,
    pub bytes_reclaimed: usize,
    pub aborted: bool,
}

/// RAII scope suppressing collection; nested scopes compose via a counter,
/// the way the original design's raise/lower `disable`/`enable` pair does,
/// expressed idiomatically as a `Drop` guard instead.
pub struct DisableGuard<'a> {
    disabled: &'a std::cell::Cell<usize>,
}

impl Drop for DisableGuard<'_> {
    fn drop(&mut self) {
        self.disabled.set(self.disabled.get() - 1);
    }
}

pub struct GarbageCollector {
    disabled: std::cell::Cell<usize>,
}

impl GarbageCollector {
    pub fn new() -> GarbageCollector {
        GarbageCollector { disabled: std::cell::Cell::new(0) }
    }

    pub fn disable(&self) -> DisableGuard<'_> {
        self.disabled.set(self.disabled.get() + 1);
        DisableGuard { disabled: &self.disabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.disabled.get() == 0
    }

    /// Run one collection cycle unless suppressed by an active `disable`
    /// scope, in which case it is a no-op returning default (zeroed) stats.
    pub fn maybe_collect(
        &mut self,
        heap: &mut Heap,
        classes: &ClassTable,
        roots: &mut [&mut dyn RootVisitor],
    ) -> GcStats {
        if !self.is_enabled() {
            return GcStats::default();
        }
        self.collect(heap, classes, roots)
    }

    pub fn collect(
        &mut self,
        heap: &mut Heap,
        classes: &ClassTable,
        roots: &mut [&mut dyn RootVisitor],
    ) -> GcStats {
        let mut stats = GcStats::default();

        // Pass 0 — Mark: Gray->Black via an explicit worklist (no native
        // recursion, since object graphs may be deep).
        let mut worklist: Vec<Value> = Vec::new();
        for visitor in roots.iter() {
            visitor.for_each_root(&mut |v: Value| {
                if v.is_pointer() && v.0 != 0 {
                    worklist.push(v);
                }
            });
        }
        // Class table method dictionaries are root source #1 alongside the
        // stack: a compiled method reachable only by being installed in some
        // class must survive, even with no live activation or interned
        // symbol pointing at it.
        classes.for_each_method_value(&mut |v: Value| {
            if v.is_pointer() && v.0 != 0 {
                worklist.push(v);
            }
        });
        while let Some(v) = worklist.pop() {
            let mut header = heap.header(v);
            if header.gc_color() == GcColor::Black {
                continue;
            }
            header.set_gc_color(GcColor::Black);
            heap.set_header(v, header);
            stats.objects_scanned += 1;
            for_each_traced_slot(heap, v, header.format(), |slot| {
                if slot.is_pointer() && slot.0 != 0 {
                    worklist.push(slot);
                }
            });
        }

        // Decide up front whether anything is collectible; if not, abort
        // compaction and leave the bump cursor untouched (keeps a steady
        // state cheap and leaves weak slots unrescanned, which is sound
        // because gcColor is never reset to White on this branch).
        let mut anything_white = false;
        for (_, header_addr, _) in HeapWalker::new(heap) {
            if crate::object::ObjectHeader(heap.word_at(header_addr)).gc_color() == GcColor::White {
                anything_white = true;
                break;
            }
        }
        if !anything_white {
            trace!(objects_scanned = stats.objects_scanned, "gc cycle: nothing collectible, compaction aborted");
            stats.aborted = true;
            // Leave objects Black rather than reset to White: a White reset
            // here would require a second walk for no benefit, since the
            // next cycle's mark pass repaints reachable objects anyway.
            reset_colors(heap, GcColor::White);
            return stats;
        }

        // Pass 1 — Plan: assign forwarding addresses to survivors.
        let mut cursor: u64 = 0;
        let plan_snapshot = heap.raw_words().to_vec();
        for (base, header_addr, total_words) in HeapWalker::from_snapshot(&plan_snapshot) {
            let header = crate::object::ObjectHeader(heap.word_at(header_addr));
            if header.gc_color() != GcColor::White {
                let new_header_addr = cursor + PREHEADER_WORDS as u64;
                heap.set_forwarding_pointer(Value::from_pointer(header_addr), new_header_addr);
                cursor += total_words as u64;
            } else {
                stats.objects_collected += 1;
                stats.bytes_reclaimed += total_words * 8;
            }
            let _ = base;
        }

        // Pass 2 — Rewrite: every internal pointer slot, then every root.
        let rewrite_snapshot = heap.raw_words().to_vec();
        for (_, header_addr, _) in HeapWalker::from_snapshot(&rewrite_snapshot) {
            let header = crate::object::ObjectHeader(heap.word_at(header_addr));
            if header.gc_color() == GcColor::White {
                continue;
            }
            let v = Value::from_pointer(header_addr);
            rewrite_slots(heap, v, header.format());
        }
        for visitor in roots.iter_mut() {
            visitor.for_each_root_mut(&mut |slot: &mut Value| {
                if slot.is_pointer() && slot.0 != 0 {
                    if let Some(target) = heap.forwarding_pointer(*slot) {
                        *slot = Value::from_pointer(target);
                    }
                }
            });
        }
        classes.for_each_method_value_mut(&mut |slot: &mut Value| {
            if slot.is_pointer() && slot.0 != 0 {
                if let Some(target) = heap.forwarding_pointer(*slot) {
                    *slot = Value::from_pointer(target);
                }
            }
        });

        // Pass 3 — Move: memmove each live object to its forwarding
        // address, then reset gcColor to White.
        let snapshot = heap.raw_words().to_vec();
        for (base, header_addr, total_words) in HeapWalker::from_snapshot(&snapshot) {
            let header = crate::object::ObjectHeader(snapshot[header_addr as usize]);
            if header.gc_color() == GcColor::White {
                continue;
            }
            let dest_header_addr = heap.forwarding_pointer(Value::from_pointer(header_addr)).unwrap();
            let dest_base = dest_header_addr - PREHEADER_WORDS as u64;
            for i in 0..total_words {
                heap.raw_words_mut()[(dest_base as usize) + i] = snapshot[(base as usize) + i];
            }
            let mut moved_header = crate::object::ObjectHeader(heap.word_at(dest_header_addr));
            moved_header.set_gc_color(GcColor::White);
            heap.set_word_at(dest_header_addr, moved_header.0);
            heap.clear_forwarding_pointer(Value::from_pointer(dest_header_addr));
        }
        heap.raw_words_mut().truncate(cursor as usize);

        debug!(
            objects_scanned = stats.objects_scanned,
            objects_collected = stats.objects_collected,
            bytes_reclaimed = stats.bytes_reclaimed,
            "gc cycle complete"
        );
        stats
    }
}

impl Default for GarbageCollector {
    fn default() -> Self {
        GarbageCollector::new()
    }
}

fn reset_colors(heap: &mut Heap, color: GcColor) {
    let addrs: Vec<u64> = HeapWalker::new(heap).map(|(_, header_addr, _)| header_addr).collect();
    for header_addr in addrs {
        let mut header = crate::object::ObjectHeader(heap.word_at(header_addr));
        header.set_gc_color(color);
        heap.set_word_at(header_addr, header.0);
    }
}

fn for_each_traced_slot(heap: &Heap, v: Value, format: ObjectFormat, mut f: impl FnMut(Value)) {
    match format {
        ObjectFormat::CompiledMethod(_) => {
            let literal_count = crate::bytecode::compiled_method_literal_count(heap, v);
            for i in 1..=literal_count {
                f(heap.slot_at(v, i));
            }
        }
        // Weak slots never keep their target alive: leave them out of the
        // Mark worklist so an object reachable only through a weak slot is
        // still collectible.
        fmt if fmt.is_weak() => {}
        fmt if fmt.is_pointer_format() => {
            let slots = heap.slot_count(v);
            for i in 0..slots {
                f(heap.slot_at(v, i));
            }
        }
        _ => {}
    }
}

fn rewrite_slots(heap: &mut Heap, v: Value, format: ObjectFormat) {
    let targets: Vec<(usize, Value)> = {
        let mut out = Vec::new();
        for_each_traced_slot_indexed(heap, v, format, |i, slot| out.push((i, slot)));
        out
    };
    let weak = format.is_weak();
    for (i, slot) in targets {
        if slot.is_pointer() && slot.0 != 0 {
            match heap.forwarding_pointer(slot) {
                Some(fwd) => heap.set_slot_at(v, i, Value::from_pointer(fwd)),
                // A weak slot whose target never got a forwarding address
                // wasn't marked by anything else either, so it's about to be
                // reclaimed: clear the slot rather than leave a dangling
                // pre-compaction address behind.
                None if weak => heap.set_slot_at(v, i, Value::NIL),
                None => {}
            }
        }
    }
}

fn for_each_traced_slot_indexed(heap: &Heap, v: Value, format: ObjectFormat, mut f: impl FnMut(usize, Value)) {
    match format {
        ObjectFormat::CompiledMethod(_) => {
            let literal_count = crate::bytecode::compiled_method_literal_count(heap, v);
            for i in 1..=literal_count {
                f(i, heap.slot_at(v, i));
            }
        }
        fmt if fmt.is_pointer_format() => {
            let slots = heap.slot_count(v);
            for i in 0..slots {
                f(i, heap.slot_at(v, i));
            }
        }
        _ => {}
    }
}

/// Linear header-stepping heap walker. Yields `(object_base, header_addr,
/// total_words)` for every object from the start of the heap to its cursor.
struct HeapWalker<'a> {
    words: &'a [u64],
    pos: u64,
}

impl<'a> HeapWalker<'a> {
    fn new(heap: &'a Heap) -> HeapWalker<'a> {
        HeapWalker { words: heap.raw_words(), pos: 0 }
    }

    fn from_snapshot(words: &'a [u64]) -> HeapWalker<'a> {
        HeapWalker { words, pos: 0 }
    }
}

impl<'a> Iterator for HeapWalker<'a> {
    type Item = (u64, u64, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos as usize >= self.words.len() {
            return None;
        }
        let base = self.pos;
        let header_addr = base + PREHEADER_WORDS as u64;
        let header = crate::object::ObjectHeader(self.words[header_addr as usize]);
        let extended = header.has_extended_slot_count();
        let slot_count = if extended {
            self.words[(header_addr + HEADER_WORDS as u64) as usize] as usize
        } else {
            header.slot_count() as usize
        };
        let total = PREHEADER_WORDS + HEADER_WORDS + if extended { 1 } else { 0 } + slot_count;
        self.pos += total as u64;
        Some((base, header_addr, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classes::{Callee, ClassTable, NIL_CLASS_INDEX, OBJECT_CLASS_INDEX};

    fn nil() -> Value {
        Value::from_pointer(0)
    }

    #[test]
    fn cycle_with_nothing_collectible_leaves_cursor_unchanged() {
        let mut heap = Heap::new(1 << 16);
        let classes = ClassTable::new();
        let a = heap.new_object(1, 0, ObjectFormat::FixedSize, NIL_CLASS_INDEX, nil()).unwrap();
        let mut roots = RootList(vec![a]);
        let cursor_before = heap.cursor();
        let mut visitors: Vec<&mut dyn RootVisitor> = vec![&mut roots];
        let mut gc = GarbageCollector::new();
        let stats = gc.collect(&mut heap, &classes, &mut visitors);
        assert!(stats.aborted);
        assert_eq!(heap.cursor(), cursor_before);
    }

    #[test]
    fn garbage_object_is_reclaimed_and_survivor_rewritten() {
        let mut heap = Heap::new(1 << 16);
        let classes = ClassTable::new();
        let garbage = heap.new_object(1, 0, ObjectFormat::FixedSize, NIL_CLASS_INDEX, nil()).unwrap();
        let survivor = heap.new_object(1, 0, ObjectFormat::FixedSize, NIL_CLASS_INDEX, nil()).unwrap();
        let _ = garbage;
        let mut roots = RootList(vec![survivor]);
        let mut visitors: Vec<&mut dyn RootVisitor> = vec![&mut roots];
        let mut gc = GarbageCollector::new();
        let stats = gc.collect(&mut heap, &classes, &mut visitors);
        assert!(!stats.aborted);
        assert_eq!(stats.objects_collected, 1);
        // survivor root was rewritten in place and is still readable.
        let rewritten = roots.0[0];
        assert!(rewritten.is_pointer());
        assert_eq!(heap.header(rewritten).gc_color(), GcColor::White);
    }

    #[test]
    fn weak_slot_is_cleared_when_its_target_is_otherwise_unreachable() {
        let mut heap = Heap::new(1 << 16);
        let classes = ClassTable::new();
        let target = heap.new_object(1, 0, ObjectFormat::FixedSize, NIL_CLASS_INDEX, nil()).unwrap();
        let weak_holder = heap.new_object(1, 0, ObjectFormat::WeakFixedSize, NIL_CLASS_INDEX, nil()).unwrap();
        heap.set_slot_at(weak_holder, 0, target);
        let mut roots = RootList(vec![weak_holder]);
        let mut visitors: Vec<&mut dyn RootVisitor> = vec![&mut roots];
        let mut gc = GarbageCollector::new();
        let stats = gc.collect(&mut heap, &classes, &mut visitors);
        assert!(!stats.aborted);
        assert_eq!(stats.objects_collected, 1);
        let rewritten_holder = roots.0[0];
        assert_eq!(heap.slot_at(rewritten_holder, 0), Value::NIL);
    }

    #[test]
    fn compiled_method_installed_only_in_class_dict_survives_and_is_rewritten() {
        let mut heap = Heap::new(1 << 16);
        let classes = ClassTable::new();
        let class_index = classes.declare_class("Foo", OBJECT_CLASS_INDEX, vec![]);
        let method = heap.new_object(1, 0, ObjectFormat::FixedSize, NIL_CLASS_INDEX, nil()).unwrap();
        classes.with_mut(class_index, |b| b.method_dict.insert("bar".to_string(), Callee::Compiled(method)));
        let garbage = heap.new_object(1, 0, ObjectFormat::FixedSize, NIL_CLASS_INDEX, nil()).unwrap();
        let _ = garbage;
        let mut roots = RootList(vec![]);
        let mut visitors: Vec<&mut dyn RootVisitor> = vec![&mut roots];
        let mut gc = GarbageCollector::new();
        let stats = gc.collect(&mut heap, &classes, &mut visitors);
        assert!(!stats.aborted);
        assert_eq!(stats.objects_collected, 1);
        let rewritten = match classes.get(class_index).method_dict.lookup("bar").unwrap() {
            Callee::Compiled(v) => *v,
            Callee::Native(_) => panic!("expected a compiled method"),
        };
        assert!(rewritten.is_pointer());
        assert_eq!(heap.header(rewritten).gc_color(), GcColor::White);
    }

    #[test]
    fn disable_guard_suppresses_collection_until_dropped() {
        let mut heap = Heap::new(1 << 16);
        let classes = ClassTable::new();
        let garbage = heap.new_object(1, 0, ObjectFormat::FixedSize, NIL_CLASS_INDEX, nil()).unwrap();
        let _ = garbage;
        let mut gc = GarbageCollector::new();
        let mut roots = RootList(vec![]);
        {
            let _guard = gc.disable();
            let mut visitors: Vec<&mut dyn RootVisitor> = vec![&mut roots];
            let stats = gc.maybe_collect(&mut heap, &classes, &mut visitors);
            assert_eq!(stats.objects_collected, 0);
            assert_eq!(stats.objects_scanned, 0);
        }
        assert!(gc.is_enabled());
    }
}
