//! Stack memory: the per-activation frame stack the interpreter walks, plus
//! the large-context "page" accounting and frame-marriage bookkeeping
//! layered on top of it.
//!
//! Generalizes `axiom/src/vm_core.rs`'s `Vec<Frame>`/`regs: Vec<Val>` call-
//! frame design (each activation owns its own growable storage, no Rust-stack
//! recursion) to carry every field `Lodtalk/vm/StackMemory.hpp`'s frame
//! layout names (prevFramePointer, returnPc, method, metadata, thisContext,
//! receiver) plus a watermark-triggered "page transition" and context-
//! marriage event. A hosted Rust process has no more business memmove-ing a
//! raw contiguous stack page than `heap.rs` has calling `mmap`, so "page"
//! here is a word-budget counter rather than a literal backing array; each
//! `Frame` owns its own `Vec<Value>` the way the teacher's `regs` does.

use std::sync::Arc;

use crossbeam::queue::SegQueue;

use crate::bytecode::MethodHeader;
use crate::classes::CONTEXT_CLASS_INDEX;
use crate::errors::InterpError;
use crate::gc::RootVisitor;
use crate::heap::Heap;
use crate::object::ObjectFormat;
use crate::value::Value;

pub const DEFAULT_PAGE_WORDS: usize = 512;
pub const LARGE_CONTEXT_WATERMARK_WORDS: usize = 64;

/// Pool of retired frames' backing storage, shared across every
/// `StackMemory` that registers with it (one per OS thread, typically) —
/// the closest a hosted word-arena design gets to the original's free list
/// of committed stack pages.
#[derive(Default)]
pub struct PageFreeList(SegQueue<Vec<Value>>);

impl PageFreeList {
    pub fn new() -> PageFreeList {
        PageFreeList(SegQueue::new())
    }

    fn acquire(&self, words: usize) -> Vec<Value> {
        match self.0.pop() {
            Some(mut data) => {
                data.clear();
                data.resize(words, Value::NIL);
                data
            }
            None => vec![Value::NIL; words],
        }
    }

    fn release(&self, data: Vec<Value>) {
        self.0.push(data);
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FrameMetadata {
    pub argument_count: u32,
    pub is_block: bool,
    pub has_context: bool,
}

/// One activation. `data` holds, in order: argument slots, then every slot
/// `frame_temp_count` reserves (user temporaries, the hidden own-vector and
/// outer-vectors slots — see `compiler::mod`), then the operand stack,
/// growing by ordinary `Vec::push`/`pop`.
pub struct Frame {
    pub method: Value,
    pub closure_or_nil: Value,
    pub receiver: Value,
    pub this_context: Value,
    pub pc: usize,
    /// Sender's pc to resume at on return; `None` marks the root frame.
    pub return_pc: Option<usize>,
    pub metadata: FrameMetadata,
    /// Set when activating this frame triggered `maybe_transition_page` to
    /// marry the prior frame and start a fresh page — mirrors the "saved
    /// previous-frame-pointer is cleared" step of a page transition, since
    /// this frame's predecessor is no longer addressable by a raw pointer
    /// once married.
    pub prev_fp_cleared: bool,
    data: Vec<Value>,
    fixed_count: usize,
    free_list: Arc<PageFreeList>,
}

impl Frame {
    fn new(
        method: Value,
        closure_or_nil: Value,
        receiver: Value,
        return_pc: Option<usize>,
        metadata: FrameMetadata,
        mut data: Vec<Value>,
        args: &[Value],
        free_list: Arc<PageFreeList>,
    ) -> Frame {
        for (i, a) in args.iter().enumerate() {
            data[i] = *a;
        }
        let fixed_count = data.len();
        Frame {
            method,
            closure_or_nil,
            receiver,
            this_context: Value::NIL,
            pc: 0,
            return_pc,
            metadata,
            prev_fp_cleared: false,
            data,
            fixed_count,
            free_list,
        }
    }

    pub fn get_temporary(&self, index: usize) -> Value {
        self.data[index]
    }

    pub fn set_temporary(&mut self, index: usize, v: Value) {
        self.data[index] = v;
    }

    pub fn push(&mut self, v: Value) {
        self.data.push(v);
    }

    pub fn pop(&mut self) -> Result<Value, InterpError> {
        if self.data.len() <= self.fixed_count {
            return Err(InterpError::StackUnderflow { pc: self.pc });
        }
        Ok(self.data.pop().expect("length checked above"))
    }

    pub fn top(&self) -> Result<Value, InterpError> {
        self.data.last().copied().ok_or(InterpError::StackUnderflow { pc: self.pc })
    }

    /// `index` 0 is the top of the operand stack, matching
    /// `StackMemory::stackOopAtOffset`'s "offset from current top" reading.
    pub fn stack_oop_at(&self, index: usize) -> Result<Value, InterpError> {
        let len = self.data.len();
        if index >= len - self.fixed_count.min(len) {
            return Err(InterpError::StackUnderflow { pc: self.pc });
        }
        Ok(self.data[len - 1 - index])
    }

    pub fn duplicate(&mut self) -> Result<(), InterpError> {
        let v = self.top()?;
        self.push(v);
        Ok(())
    }

    pub fn words_in_use(&self) -> usize {
        self.data.len()
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        self.free_list.release(std::mem::take(&mut self.data));
    }
}

/// Linked fixed-size stack pages, frame layout, marriage to heap contexts.
pub struct StackMemory {
    frames: Vec<Frame>,
    page_words: usize,
    page_words_used: usize,
    free_list: Arc<PageFreeList>,
}

impl StackMemory {
    pub fn new(page_words: usize) -> StackMemory {
        StackMemory::with_free_list(page_words, Arc::new(PageFreeList::new()))
    }

    pub fn with_free_list(page_words: usize, free_list: Arc<PageFreeList>) -> StackMemory {
        StackMemory { frames: Vec::new(), page_words, page_words_used: 0, free_list }
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn current(&self) -> &Frame {
        self.frames.last().expect("no active frame")
    }

    pub fn current_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("no active frame")
    }

    pub fn push_oop(&mut self, v: Value) {
        self.current_mut().push(v);
        self.page_words_used += 1;
    }

    pub fn pop_oop(&mut self) -> Result<Value, InterpError> {
        let v = self.current_mut().pop()?;
        self.page_words_used = self.page_words_used.saturating_sub(1);
        Ok(v)
    }

    pub fn stack_oop_at(&self, index: usize) -> Result<Value, InterpError> {
        self.current().stack_oop_at(index)
    }

    pub fn duplicate(&mut self) -> Result<(), InterpError> {
        self.current_mut().duplicate()?;
        self.page_words_used += 1;
        Ok(())
    }

    pub fn get_receiver(&self) -> Value {
        self.current().receiver
    }

    pub fn get_temporary(&self, index: usize) -> Value {
        self.current().get_temporary(index)
    }

    pub fn set_temporary(&mut self, index: usize, v: Value) {
        self.current_mut().set_temporary(index, v)
    }

    /// Activate a new frame for `method`. `args` holds the already-evaluated
    /// argument values in left-to-right order (the sender's receiver/argument
    /// stack slots are popped by the caller before this is called — unlike
    /// the original's raw-pointer overlap between a caller's pushed operands
    /// and a callee's argument region, this is a plain copy into the new
    /// frame's own storage).
    pub fn activate_method_frame(
        &mut self,
        heap: &mut Heap,
        method: Value,
        receiver: Value,
        closure_or_nil: Value,
        is_block: bool,
        args: &[Value],
    ) -> Result<(), InterpError> {
        let header = MethodHeader::decode(heap.slot_at(method, 0));
        let frame_temp_count = header.temporary_count as usize;
        let return_pc = self.frames.last().map(|f| f.pc);
        let metadata =
            FrameMetadata { argument_count: header.argument_count as u32, is_block, has_context: false };
        let transitioned = self.maybe_transition_page(frame_temp_count, heap)?;
        let data = self.free_list.acquire(frame_temp_count);
        let mut frame =
            Frame::new(method, closure_or_nil, receiver, return_pc, metadata, data, args, self.free_list.clone());
        frame.prev_fp_cleared = transitioned;
        self.page_words_used += frame_temp_count;
        self.frames.push(frame);
        Ok(())
    }

    /// When the remaining page budget would fall below the large-context
    /// watermark, marry the current frame (so it stays addressable once its
    /// page is handed to the incoming activation) and start a fresh page.
    /// Returns whether a transition happened, so the caller can mark the
    /// incoming frame's saved previous-frame-pointer cleared.
    fn maybe_transition_page(&mut self, incoming_words: usize, heap: &mut Heap) -> Result<bool, InterpError> {
        if self.page_words_used + incoming_words + LARGE_CONTEXT_WATERMARK_WORDS <= self.page_words {
            return Ok(false);
        }
        if let Some(idx) = self.frames.len().checked_sub(1) {
            self.marry_frame(idx, heap)?;
        }
        self.page_words_used = 0;
        Ok(true)
    }

    /// Allocate a Context object mirroring `self.frames[idx]`'s sender, pc,
    /// stackp, method, closureOrNil and receiver, a no-op if already married.
    /// The sender link walks to the next-older frame's own context, marrying
    /// it first if needed — "both the moved frame and its prior frame are
    /// married with linked contexts".
    fn marry_frame(&mut self, idx: usize, heap: &mut Heap) -> Result<Value, InterpError> {
        if self.frames[idx].metadata.has_context {
            return Ok(self.frames[idx].this_context);
        }
        let sender = if idx == 0 { Value::NIL } else { self.marry_frame(idx - 1, heap)? };
        let f = &self.frames[idx];
        let ctx = heap.new_object(6, 0, ObjectFormat::FixedSize, CONTEXT_CLASS_INDEX, Value::NIL)?;
        heap.set_slot_at(ctx, 0, sender);
        heap.set_slot_at(ctx, 1, Value::from_small_int(f.pc as i64));
        heap.set_slot_at(ctx, 2, Value::from_small_int(f.words_in_use() as i64));
        heap.set_slot_at(ctx, 3, f.method);
        heap.set_slot_at(ctx, 4, f.closure_or_nil);
        heap.set_slot_at(ctx, 5, f.receiver);
        self.frames[idx].this_context = ctx;
        self.frames[idx].metadata.has_context = true;
        Ok(ctx)
    }

    /// Marry the currently active frame, for `pushClosure`'s "marries the
    /// current frame so the closure may outlive the activation" step.
    pub fn marry_current_frame(&mut self, heap: &mut Heap) -> Result<Value, InterpError> {
        let idx = self.frames.len().checked_sub(1).expect("no active frame to marry");
        self.marry_frame(idx, heap)
    }

    /// Pop the active frame on an ordinary (local) return, handing back its
    /// record so the interpreter can resume the sender at `return_pc`.
    pub fn pop_frame(&mut self) -> Frame {
        let frame = self.frames.pop().expect("no active frame to pop");
        self.page_words_used = self.page_words_used.saturating_sub(frame.words_in_use());
        frame
    }

    /// Unwind every frame above and including the one married to
    /// `home_context`, for a non-local `^` executed inside a block whose
    /// home method activation must still be live. Returns the popped home
    /// frame (its `return_pc` is where the *original caller of the home
    /// method* resumes), or `NonLocalReturnToDeadFrame` if no live frame is
    /// married to that context.
    pub fn unwind_non_local(&mut self, home_context: Value) -> Result<Frame, InterpError> {
        let home_idx = self
            .frames
            .iter()
            .position(|f| f.metadata.has_context && f.this_context.0 == home_context.0)
            .ok_or(InterpError::NonLocalReturnToDeadFrame)?;
        let mut popped = self.frames.split_off(home_idx);
        let home = popped.remove(0);
        self.page_words_used = self.page_words_used.saturating_sub(home.words_in_use());
        Ok(home)
    }
}

impl RootVisitor for StackMemory {
    fn for_each_root(&self, f: &mut dyn FnMut(Value)) {
        for frame in &self.frames {
            f(frame.method);
            f(frame.closure_or_nil);
            f(frame.receiver);
            f(frame.this_context);
            for v in &frame.data {
                f(*v);
            }
        }
    }

    fn for_each_root_mut(&mut self, f: &mut dyn FnMut(&mut Value)) {
        for frame in &mut self.frames {
            f(&mut frame.method);
            f(&mut frame.closure_or_nil);
            f(&mut frame.receiver);
            f(&mut frame.this_context);
            for v in &mut frame.data {
                f(v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classes::NIL_CLASS_INDEX;

    fn make_method(heap: &mut Heap, temp_count: u8, arg_count: u8) -> Value {
        let header = MethodHeader {
            literal_count: 0,
            has_primitive: false,
            needs_large_frame: false,
            temporary_count: temp_count,
            argument_count: arg_count,
            alternate_bytecode_set: false,
        };
        let m = heap.new_object(1, 0, ObjectFormat::CompiledMethod(0), NIL_CLASS_INDEX, Value::NIL).unwrap();
        heap.set_slot_at(m, 0, header.encode());
        m
    }

    #[test]
    fn push_pop_round_trips_and_underflows_at_frame_base() {
        let mut heap = Heap::new(1 << 16);
        let mut stack = StackMemory::new(DEFAULT_PAGE_WORDS);
        let method = make_method(&mut heap, 2, 0);
        stack.activate_method_frame(&mut heap, method, Value::NIL, Value::NIL, false, &[]).unwrap();
        stack.push_oop(Value::from_small_int(7));
        assert_eq!(stack.pop_oop().unwrap().as_small_int(), Some(7));
        assert!(matches!(stack.pop_oop(), Err(InterpError::StackUnderflow { .. })));
    }

    #[test]
    fn activated_frame_sees_its_arguments_in_temp_slots() {
        let mut heap = Heap::new(1 << 16);
        let mut stack = StackMemory::new(DEFAULT_PAGE_WORDS);
        let method = make_method(&mut heap, 2, 2);
        let args = [Value::from_small_int(1), Value::from_small_int(2)];
        stack.activate_method_frame(&mut heap, method, Value::NIL, Value::NIL, false, &args).unwrap();
        assert_eq!(stack.get_temporary(0).as_small_int(), Some(1));
        assert_eq!(stack.get_temporary(1).as_small_int(), Some(2));
    }

    #[test]
    fn marrying_root_frame_links_nil_sender() {
        let mut heap = Heap::new(1 << 16);
        let mut stack = StackMemory::new(DEFAULT_PAGE_WORDS);
        let method = make_method(&mut heap, 0, 0);
        let receiver = Value::from_small_int(42);
        stack.activate_method_frame(&mut heap, method, receiver, Value::NIL, false, &[]).unwrap();
        let ctx = stack.marry_current_frame(&mut heap).unwrap();
        assert_eq!(heap.slot_at(ctx, 0), Value::NIL);
        assert_eq!(heap.slot_at(ctx, 5), receiver);
        assert!(stack.current().metadata.has_context);
    }

    #[test]
    fn non_local_return_unwinds_every_frame_above_the_home_context() {
        let mut heap = Heap::new(1 << 16);
        let mut stack = StackMemory::new(DEFAULT_PAGE_WORDS);
        let home_method = make_method(&mut heap, 0, 0);
        stack.activate_method_frame(&mut heap, home_method, Value::NIL, Value::NIL, false, &[]).unwrap();
        let home_ctx = stack.marry_current_frame(&mut heap).unwrap();
        let block_method = make_method(&mut heap, 0, 0);
        stack.activate_method_frame(&mut heap, block_method, Value::NIL, Value::NIL, true, &[]).unwrap();
        assert_eq!(stack.frame_count(), 2);
        let home = stack.unwind_non_local(home_ctx).unwrap();
        assert_eq!(home.method.0, home_method.0);
        assert_eq!(stack.frame_count(), 0);
    }

    #[test]
    fn non_local_return_to_dead_frame_errors() {
        let mut stack = StackMemory::new(DEFAULT_PAGE_WORDS);
        let bogus_context = Value::from_small_int(99);
        assert!(matches!(stack.unwind_non_local(bogus_context), Err(InterpError::NonLocalReturnToDeadFrame)));
    }

    #[test]
    fn large_context_watermark_triggers_marriage_and_resets_page_budget() {
        let mut heap = Heap::new(1 << 16);
        let page_words = 100;
        let mut stack = StackMemory::new(page_words);
        let small = make_method(&mut heap, 2, 0);
        stack.activate_method_frame(&mut heap, small, Value::NIL, Value::NIL, false, &[]).unwrap();
        let huge = make_method(&mut heap, 50, 0);
        stack.activate_method_frame(&mut heap, huge, Value::NIL, Value::NIL, false, &[]).unwrap();
        // the root frame must have been married by the page transition.
        assert_eq!(stack.frame_count(), 2);
        assert!(stack.frames[0].metadata.has_context);
    }

    #[test]
    fn frame_triggering_a_page_transition_has_prev_fp_cleared_set() {
        let mut heap = Heap::new(1 << 16);
        let page_words = 100;
        let mut stack = StackMemory::new(page_words);
        let small = make_method(&mut heap, 2, 0);
        stack.activate_method_frame(&mut heap, small, Value::NIL, Value::NIL, false, &[]).unwrap();
        assert!(!stack.current().prev_fp_cleared);
        let huge = make_method(&mut heap, 50, 0);
        stack.activate_method_frame(&mut heap, huge, Value::NIL, Value::NIL, false, &[]).unwrap();
        assert!(stack.current().prev_fp_cleared);
    }

    #[test]
    fn frame_staying_on_the_same_page_leaves_prev_fp_cleared_false() {
        let mut heap = Heap::new(1 << 16);
        let mut stack = StackMemory::new(DEFAULT_PAGE_WORDS);
        let a = make_method(&mut heap, 1, 0);
        stack.activate_method_frame(&mut heap, a, Value::NIL, Value::NIL, false, &[]).unwrap();
        let b = make_method(&mut heap, 1, 0);
        stack.activate_method_frame(&mut heap, b, Value::NIL, Value::NIL, false, &[]).unwrap();
        assert!(!stack.current().prev_fp_cleared);
    }
}
