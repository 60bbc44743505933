//! The managed heap behind the interpreter's allocation interface.
//!
//! References are word-sized handles into an object table, so they stay
//! valid across a collection. Word 0 is the null reference and the all-ones
//! pattern is the uninitialized sentinel; everything else indexes a live
//! table slot.
//!
//! The collector is a handle-based mark-and-sweep standing in for the real
//! tracing collector: the interpreter only depends on `try_allocate`,
//! `try_allocate_array`, `record_write` and `collect`. Marking discovers
//! stack roots through the per-function stack pointer maps, which is what
//! makes the safepoint protocol observable.

use crate::{
    class::{ClassRef, MetaRef, ValueKind},
    function::FuncRef,
    stack::{Stack, FRAME_CONTROL_SIZE, WORD_SIZE},
    Roots,
};
use silvan_core::{memory_units::Bytes, LittleEndianConvert, Word};

/// A reference value: null, the uninitialized sentinel, or a heap handle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Ref(u64);

impl Ref {
    /// The null reference.
    pub const NULL: Ref = Ref(0);
    /// The uninitialized sentinel, distinguishable from null and from every
    /// valid handle.
    pub const UNINITIALIZED: Ref = Ref(u64::MAX);

    /// Reinterprets a stack word as a reference.
    pub fn from_bits(bits: u64) -> Ref {
        Ref(bits)
    }

    /// The word representation of this reference.
    pub fn to_bits(self) -> u64 {
        self.0
    }

    /// Whether this is the null reference.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Whether this is the uninitialized sentinel.
    pub fn is_uninitialized(self) -> bool {
        self == Ref::UNINITIALIZED
    }
}

impl From<Ref> for Word {
    fn from(r: Ref) -> Word {
        Word::from_bits(r.to_bits())
    }
}

impl From<Word> for Ref {
    fn from(word: Word) -> Ref {
        Ref::from_bits(word.to_bits())
    }
}

pub(crate) enum HeapValue {
    /// A class instance: fixed fields, optionally followed by array elements.
    Object {
        meta: MetaRef,
        data: Box<[u8]>,
        length: u64,
    },
    /// An immutable UTF-8 string.
    String(Box<str>),
    /// The mirror object a class is represented by on the operand stack.
    Class(ClassRef),
}

impl HeapValue {
    fn size(&self) -> usize {
        match self {
            HeapValue::Object { data, .. } => data.len(),
            HeapValue::String(s) => s.len(),
            HeapValue::Class(_) => WORD_SIZE,
        }
    }
}

/// The heap as seen by the interpreter: allocation with explicit failure,
/// a write barrier, and a synchronous collection entry point.
pub struct Heap {
    slots: Vec<Option<HeapValue>>,
    free: Vec<usize>,
    live_bytes: usize,
    capacity: usize,
    remembered: Vec<(Ref, u32, Ref)>,
}

impl Heap {
    pub(crate) fn new(capacity: Bytes) -> Heap {
        Heap {
            // Slot 0 is never handed out; handle 0 is the null reference.
            slots: vec![None],
            free: Vec::new(),
            live_bytes: 0,
            capacity: capacity.0,
            remembered: Vec::new(),
        }
    }

    /// The configured capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Replaces the capacity. Shrinking below the live size makes every
    /// subsequent allocation fail until a collection frees enough.
    pub fn set_capacity(&mut self, capacity: Bytes) {
        self.capacity = capacity.0;
    }

    /// Bytes currently occupied by live values.
    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    /// Number of live heap values.
    pub fn live_objects(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Attempts to allocate a fixed-size instance described by `meta`.
    ///
    /// All fields start zeroed, so reference fields read as null. Returns
    /// `None` if the allocation does not fit; the caller decides whether to
    /// collect and retry.
    pub fn try_allocate(&mut self, meta: &MetaRef) -> Option<Ref> {
        let data = vec![0u8; meta.instance_size() as usize];
        self.insert_sized(HeapValue::Object {
            meta: meta.clone(),
            data: data.into_boxed_slice(),
            length: 0,
        })
    }

    /// Attempts to allocate an instance with `length` array elements.
    pub fn try_allocate_array(&mut self, meta: &MetaRef, length: u64) -> Option<Ref> {
        let data = vec![0u8; meta.data_size(length)];
        self.insert_sized(HeapValue::Object {
            meta: meta.clone(),
            data: data.into_boxed_slice(),
            length,
        })
    }

    /// Attempts to allocate a string.
    pub fn try_allocate_string(&mut self, text: &str) -> Option<Ref> {
        self.insert_sized(HeapValue::String(text.into()))
    }

    pub(crate) fn allocate_class_mirror(&mut self, class: ClassRef) -> Option<Ref> {
        self.insert_sized(HeapValue::Class(class))
    }

    fn insert_sized(&mut self, value: HeapValue) -> Option<Ref> {
        let size = value.size();
        if self.live_bytes + size > self.capacity {
            return None;
        }
        self.live_bytes += size;
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(value);
                index
            }
            None => {
                self.slots.push(Some(value));
                self.slots.len() - 1
            }
        };
        Some(Ref(index as u64))
    }

    /// Records a reference store into an object field for the collector.
    ///
    /// Every `STP` and every reference store performed by a builtin calls
    /// this before the next safepoint.
    pub fn record_write(&mut self, object: Ref, offset: u32, value: Ref) {
        self.remembered.push((object, offset, value));
    }

    /// The writes recorded since the last collection.
    pub fn remembered_writes(&self) -> &[(Ref, u32, Ref)] {
        &self.remembered
    }

    /// Whether `r` is a handle to a live value.
    pub fn is_live(&self, r: Ref) -> bool {
        let index = r.0 as usize;
        !r.is_null()
            && !r.is_uninitialized()
            && index < self.slots.len()
            && self.slots[index].is_some()
    }

    pub(crate) fn get(&self, r: Ref) -> &HeapValue {
        self.slots
            .get(r.0 as usize)
            .and_then(Option::as_ref)
            .unwrap_or_else(|| panic!("dangling heap handle {r:?}"))
    }

    /// The instance metadata of an object.
    ///
    /// # Panics
    ///
    /// Panics on strings and class mirrors; field opcodes are only valid on
    /// class instances.
    pub fn object_meta(&self, r: Ref) -> MetaRef {
        match self.get(r) {
            HeapValue::Object { meta, .. } => meta.clone(),
            _ => panic!("field access on a non-object value"),
        }
    }

    /// The text of a string value, if `r` is one.
    pub fn string(&self, r: Ref) -> Option<&str> {
        match self.get(r) {
            HeapValue::String(text) => Some(text),
            _ => None,
        }
    }

    /// The class behind a class mirror, if `r` is one.
    pub fn class_of_mirror(&self, r: Ref) -> Option<ClassRef> {
        match self.get(r) {
            HeapValue::Class(class) => Some(class.clone()),
            _ => None,
        }
    }

    /// Reads a sized field out of an object.
    pub(crate) fn load<T: LittleEndianConvert>(&self, object: Ref, offset: u32) -> T {
        match self.get(object) {
            HeapValue::Object { data, .. } => {
                let mut raw = T::Bytes::default();
                let len = raw.as_ref().len();
                let offset = offset as usize;
                raw.as_mut().copy_from_slice(&data[offset..offset + len]);
                T::from_le_bytes(raw)
            }
            _ => panic!("field access on a non-object value"),
        }
    }

    /// Writes a sized field into an object.
    pub(crate) fn store<T: LittleEndianConvert>(&mut self, object: Ref, offset: u32, value: T) {
        let index = object.0 as usize;
        match self.slots.get_mut(index).and_then(Option::as_mut) {
            Some(HeapValue::Object { data, .. }) => {
                let raw = value.into_le_bytes();
                let len = raw.as_ref().len();
                let offset = offset as usize;
                data[offset..offset + len].copy_from_slice(raw.as_ref());
            }
            _ => panic!("field store on a non-object value"),
        }
    }

    /// Runs a stop-the-world collection.
    ///
    /// `function` and `pc` locate the innermost frame; the frames beyond it
    /// are walked through their saved control words. Reference slots are
    /// discovered with the per-function stack pointer maps, which must
    /// already be built for every function with a live frame.
    pub(crate) fn collect(&mut self, stack: &Stack, function: &FuncRef, pc: u64, roots: &Roots) {
        log::debug!(
            "collecting garbage: {} values, {} bytes live",
            self.live_objects(),
            self.live_bytes
        );
        let mut pending: Vec<Ref> = Vec::new();
        roots.each_root(|r| pending.push(r));
        let package = function.package();
        package.each_constant(|r| pending.push(r));
        each_stack_ref(stack, function, pc, |r| pending.push(r));

        let mut marked = vec![false; self.slots.len()];
        while let Some(r) = pending.pop() {
            if r.is_null() || r.is_uninitialized() {
                continue;
            }
            let index = r.0 as usize;
            assert!(self.is_live(r), "marked reference {r:?} is not live");
            if marked[index] {
                continue;
            }
            marked[index] = true;
            if let Some(HeapValue::Object { meta, data, length }) = &self.slots[index] {
                for &offset in meta.ref_offsets() {
                    pending.push(read_ref(data, offset as usize));
                }
                if let Some(ValueKind::Ref) = meta.element() {
                    let base = meta.instance_size() as usize;
                    for i in 0..*length as usize {
                        pending.push(read_ref(data, base + i * WORD_SIZE));
                    }
                }
            }
        }

        for index in 1..self.slots.len() {
            if !marked[index] {
                if let Some(value) = self.slots[index].take() {
                    self.live_bytes -= value.size();
                    self.free.push(index);
                }
            }
        }
        self.remembered.clear();
        log::debug!(
            "collection done: {} values, {} bytes live",
            self.live_objects(),
            self.live_bytes
        );
    }
}

fn read_ref(data: &[u8], offset: usize) -> Ref {
    let mut raw = [0u8; WORD_SIZE];
    raw.copy_from_slice(&data[offset..offset + WORD_SIZE]);
    Ref::from_bits(u64::from_le_bytes(raw))
}

/// Calls `f` for every reference slot of every live frame, as reported by
/// the stack pointer maps. Shared by the collector's root scan and the
/// `extra-checks` safepoint verifier.
pub(crate) fn each_stack_ref(stack: &Stack, function: &FuncRef, pc: u64, mut f: impl FnMut(Ref)) {
    let mut function = function.clone();
    let mut pc = pc;
    for frame in stack.frames() {
        let map = function
            .pointer_map()
            .expect("stack pointer map missing at safepoint");
        for (slot, is_ref) in map.params().iter().enumerate() {
            if *is_ref {
                let offset = frame.fp + FRAME_CONTROL_SIZE + slot * WORD_SIZE;
                f(Ref::from_bits(stack.read_word(offset)));
            }
        }
        let slots = map
            .safepoint(pc)
            .unwrap_or_else(|| panic!("no safepoint record at pc {pc}"));
        for (slot, is_ref) in slots.iter().enumerate() {
            if *is_ref {
                let offset = frame.fp - (slot + 1) * WORD_SIZE;
                f(Ref::from_bits(stack.read_word(offset)));
            }
        }
        if frame.caller_function == 0 {
            break;
        }
        pc = frame.caller_pc;
        let caller = (frame.caller_function - 1) as i64;
        function = function.package().function(caller);
    }
}
