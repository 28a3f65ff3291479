//! Heap object model
//!
//! Every heap object starts with a single header word: a strong reference to
//! its `HClass`, itself a first-class heap object describing the object's
//! kind, fixed size, class name, and property layout. The layouts below are
//! wire-stable: the raw-heap binary dump copies object bytes verbatim, and
//! the offline decoder re-derives the graph from them.
//!
//! ```text
//! HClass        [hclass][js_type | object_size << 32][name][layout]   = 32
//! LineString    [hclass][len]            [utf8 bytes, 8-aligned]      = 16 + len
//! TreeString    [hclass][len]            [first][second]              = 32
//! SlicedString  [hclass][start|len<<32]  [parent]                     = 24
//! Object        [hclass][field 0]..[field n-1]                        = hclass.object_size
//! Array         [hclass][len]            [elem 0]..[elem n-1]         = 16 + 8n
//! Function      [hclass][name][env]                                   = 24
//! HeapNumber    [hclass][f64 bits]                                    = 16
//! BigInt        [hclass][len|sign<<32]   [digit 0]..[digit n-1]       = 16 + 8n
//! Symbol        [hclass][description]                                 = 16
//! NativeBinding [hclass][native_size]                                 = 16
//! ```
//!
//! All reads go through [`ObjectRef`]. Addresses handed to it must name a
//! live object in the owning [`Heap`](crate::vm::gc::Heap) or a relocated
//! decode buffer; both sources keep the bytes alive and unaliased for the
//! duration of the borrow, which is what makes the internal raw reads sound.

use crate::vm::value::{ObjAddr, TaggedValue};

/// Size of one tagged slot.
pub const WORD_SIZE: usize = 8;

/// `log2(WORD_SIZE)`, used by the V2 synthetic-address encoding.
pub const TAGGED_TYPE_SIZE_LOG: u32 = 3;

/// Every object starts with its hclass word.
pub const OBJECT_HEADER_SIZE: usize = WORD_SIZE;

/// Fixed object sizes, in bytes.
pub const HCLASS_SIZE: usize = 4 * WORD_SIZE;
pub const TREE_STRING_SIZE: usize = 4 * WORD_SIZE;
pub const SLICED_STRING_SIZE: usize = 3 * WORD_SIZE;
pub const FUNCTION_SIZE: usize = 3 * WORD_SIZE;
pub const HEAP_NUMBER_SIZE: usize = 2 * WORD_SIZE;
pub const SYMBOL_SIZE: usize = 2 * WORD_SIZE;
pub const NATIVE_BINDING_SIZE: usize = 2 * WORD_SIZE;
pub const LINE_STRING_HEADER_SIZE: usize = 2 * WORD_SIZE;

/// Structural self-sizes reported for content-suppressed (private) string
/// nodes: a flat string with up to one payload word, and the fixed rope
/// and slice layouts.
pub const LINE_STRING_STRUCT_SIZE: usize = 24;
pub const TREE_STRING_STRUCT_SIZE: usize = TREE_STRING_SIZE;
pub const SLICED_STRING_STRUCT_SIZE: usize = SLICED_STRING_SIZE;

/// Round `n` up to the next slot boundary.
#[inline]
pub const fn align_word(n: usize) -> usize {
    (n + WORD_SIZE - 1) & !(WORD_SIZE - 1)
}

/// Runtime kind tag stored in an object's hclass.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JsType {
    Hclass = 0,
    LineString = 1,
    TreeString = 2,
    SlicedString = 3,
    Object = 4,
    Array = 5,
    Function = 6,
    HeapNumber = 7,
    BigInt = 8,
    Symbol = 9,
    NativeBinding = 10,
}

impl JsType {
    /// Decode a tag byte read from a dump; unknown values are rejected.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Hclass),
            1 => Some(Self::LineString),
            2 => Some(Self::TreeString),
            3 => Some(Self::SlicedString),
            4 => Some(Self::Object),
            5 => Some(Self::Array),
            6 => Some(Self::Function),
            7 => Some(Self::HeapNumber),
            8 => Some(Self::BigInt),
            9 => Some(Self::Symbol),
            10 => Some(Self::NativeBinding),
            _ => None,
        }
    }

    /// String representations are traversal terminals for the profiler.
    #[inline]
    pub fn is_string(self) -> bool {
        matches!(
            self,
            Self::LineString | Self::TreeString | Self::SlicedString
        )
    }
}

/// Kind of a reference-bearing slot, as reported by [`visit_object_body`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// The header word pointing at the object's hclass.
    Hclass,
    /// A named field; the index selects the name from the hclass layout.
    Property(u32),
    /// An array element.
    Element(u32),
    /// A fixed internal slot with a well-known name.
    Internal(&'static str),
    /// A closure-context slot.
    Context(&'static str),
}

/// One visited slot: its byte offset within the object, the value it holds,
/// and what kind of reference it is.
#[derive(Debug, Clone, Copy)]
pub struct Slot {
    pub offset: usize,
    pub value: TaggedValue,
    pub kind: SlotKind,
}

/// A view over one heap object. Copyable, non-owning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRef(pub ObjAddr);

impl ObjectRef {
    #[inline]
    pub fn addr(self) -> ObjAddr {
        self.0
    }

    /// Read the raw word at `offset`.
    #[inline]
    pub fn read_word(self, offset: usize) -> u64 {
        // SAFETY: module invariant - the address names live, 8-aligned
        // object memory owned by the heap or a decode arena.
        unsafe { std::ptr::read((self.0 as usize + offset) as *const u64) }
    }

    /// Write the raw word at `offset`.
    #[inline]
    pub fn write_word(self, offset: usize, value: u64) {
        // SAFETY: see read_word; mutation only happens from the owning
        // heap's factory methods, the collector, and the decode relocator,
        // all of which hold exclusive access.
        unsafe { std::ptr::write((self.0 as usize + offset) as *mut u64, value) }
    }

    /// Read the slot at `offset` as a tagged value.
    #[inline]
    pub fn slot(self, offset: usize) -> TaggedValue {
        TaggedValue::from_raw(self.read_word(offset))
    }

    /// Store a tagged value into the slot at `offset`.
    #[inline]
    pub fn set_slot(self, offset: usize, value: TaggedValue) {
        self.write_word(offset, value.raw());
    }

    /// The object's hclass address.
    #[inline]
    pub fn hclass(self) -> ObjAddr {
        self.read_word(0)
    }

    #[inline]
    pub fn set_hclass(self, hclass: ObjAddr) {
        self.write_word(0, hclass);
    }

    /// The object's runtime kind, read through its hclass.
    #[inline]
    pub fn js_type(self) -> JsType {
        ObjectRef(self.hclass()).hclass_js_type()
    }

    // ── HClass payload ─────────────────────────────────────────────────

    /// Kind tag stored in this hclass (callable only on hclass objects).
    #[inline]
    pub fn hclass_js_type(self) -> JsType {
        JsType::from_u8(self.read_word(8) as u8).expect("corrupt hclass kind tag")
    }

    /// Fixed byte size of instances, for fixed-size kinds.
    #[inline]
    pub fn hclass_object_size(self) -> usize {
        (self.read_word(8) >> 32) as u32 as usize
    }

    /// Class-name string reference.
    #[inline]
    pub fn hclass_name(self) -> TaggedValue {
        self.slot(16)
    }

    /// Property-name layout array reference (or undefined).
    #[inline]
    pub fn hclass_layout(self) -> TaggedValue {
        self.slot(24)
    }

    pub fn hclass_init(self, js_type: JsType, object_size: usize) {
        self.write_word(8, js_type as u8 as u64 | (object_size as u64) << 32);
        self.set_slot(16, TaggedValue::undefined());
        self.set_slot(24, TaggedValue::undefined());
    }

    // ── Strings ────────────────────────────────────────────────────────

    /// Character length of any string representation.
    #[inline]
    pub fn string_len(self) -> usize {
        match self.js_type() {
            JsType::LineString | JsType::TreeString => self.read_word(8) as u32 as usize,
            JsType::SlicedString => (self.read_word(8) >> 32) as u32 as usize,
            _ => 0,
        }
    }

    /// Byte content of a flat string.
    pub fn line_string_bytes(self) -> &'static [u8] {
        debug_assert_eq!(self.js_type(), JsType::LineString);
        let len = self.read_word(8) as u32 as usize;
        // SAFETY: the bytes live directly after the length word and stay
        // alive as long as the owning heap or decode arena does.
        unsafe {
            std::slice::from_raw_parts(
                (self.0 as usize + LINE_STRING_HEADER_SIZE) as *const u8,
                len,
            )
        }
    }

    #[inline]
    pub fn tree_string_first(self) -> TaggedValue {
        self.slot(16)
    }

    #[inline]
    pub fn tree_string_second(self) -> TaggedValue {
        self.slot(24)
    }

    #[inline]
    pub fn sliced_string_parent(self) -> TaggedValue {
        self.slot(16)
    }

    // ── Arrays and objects ─────────────────────────────────────────────

    #[inline]
    pub fn array_len(self) -> usize {
        self.read_word(8) as u32 as usize
    }

    #[inline]
    pub fn array_element(self, index: usize) -> TaggedValue {
        self.slot(16 + index * WORD_SIZE)
    }

    #[inline]
    pub fn set_array_element(self, index: usize, value: TaggedValue) {
        self.set_slot(16 + index * WORD_SIZE, value);
    }

    /// Number of inline fields of a plain object.
    #[inline]
    pub fn field_count(self) -> usize {
        (ObjectRef(self.hclass()).hclass_object_size() - OBJECT_HEADER_SIZE) / WORD_SIZE
    }

    #[inline]
    pub fn field(self, index: usize) -> TaggedValue {
        self.slot(OBJECT_HEADER_SIZE + index * WORD_SIZE)
    }

    #[inline]
    pub fn set_field(self, index: usize, value: TaggedValue) {
        self.set_slot(OBJECT_HEADER_SIZE + index * WORD_SIZE, value);
    }

    // ── Leaf payloads ──────────────────────────────────────────────────

    #[inline]
    pub fn number_value(self) -> f64 {
        f64::from_bits(self.read_word(8))
    }

    #[inline]
    pub fn native_size(self) -> usize {
        self.read_word(8) as usize
    }

    #[inline]
    pub fn function_name(self) -> TaggedValue {
        self.slot(8)
    }

    #[inline]
    pub fn function_env(self) -> TaggedValue {
        self.slot(16)
    }

    #[inline]
    pub fn symbol_description(self) -> TaggedValue {
        self.slot(8)
    }

    #[inline]
    pub fn bigint_len(self) -> usize {
        self.read_word(8) as u32 as usize
    }

    /// Total allocation size of this object in bytes.
    pub fn size(self) -> usize {
        match self.js_type() {
            JsType::Hclass => HCLASS_SIZE,
            JsType::LineString => LINE_STRING_HEADER_SIZE + align_word(self.string_len()),
            JsType::TreeString => TREE_STRING_SIZE,
            JsType::SlicedString => SLICED_STRING_SIZE,
            JsType::Object | JsType::Function => ObjectRef(self.hclass()).hclass_object_size(),
            JsType::Array => 16 + self.array_len() * WORD_SIZE,
            JsType::HeapNumber => HEAP_NUMBER_SIZE,
            JsType::BigInt => 16 + self.bigint_len() * WORD_SIZE,
            JsType::Symbol => SYMBOL_SIZE,
            JsType::NativeBinding => NATIVE_BINDING_SIZE,
        }
    }
}

/// Visit every reference-bearing slot of `obj`, including the hclass word.
///
/// The visitor sees slots whose declared kind is a reference even when the
/// current value is an immediate; callers filter on the value's tag. String
/// internals (rope children, slice parents) are reported here because the
/// collector must trace and rewrite them; the profiler's marker applies its
/// own string-terminal rule on top.
pub fn visit_object_body(obj: ObjectRef, mut f: impl FnMut(Slot)) {
    f(Slot {
        offset: 0,
        value: TaggedValue::object(obj.hclass()),
        kind: SlotKind::Hclass,
    });

    match obj.js_type() {
        JsType::Hclass => {
            f(Slot {
                offset: 16,
                value: obj.hclass_name(),
                kind: SlotKind::Internal("name"),
            });
            f(Slot {
                offset: 24,
                value: obj.hclass_layout(),
                kind: SlotKind::Internal("layout"),
            });
        }
        JsType::TreeString => {
            f(Slot {
                offset: 16,
                value: obj.tree_string_first(),
                kind: SlotKind::Internal("first"),
            });
            f(Slot {
                offset: 24,
                value: obj.tree_string_second(),
                kind: SlotKind::Internal("second"),
            });
        }
        JsType::SlicedString => {
            f(Slot {
                offset: 16,
                value: obj.sliced_string_parent(),
                kind: SlotKind::Internal("parent"),
            });
        }
        JsType::Object => {
            for i in 0..obj.field_count() {
                f(Slot {
                    offset: OBJECT_HEADER_SIZE + i * WORD_SIZE,
                    value: obj.field(i),
                    kind: SlotKind::Property(i as u32),
                });
            }
        }
        JsType::Array => {
            for i in 0..obj.array_len() {
                f(Slot {
                    offset: 16 + i * WORD_SIZE,
                    value: obj.array_element(i),
                    kind: SlotKind::Element(i as u32),
                });
            }
        }
        JsType::Function => {
            f(Slot {
                offset: 8,
                value: obj.function_name(),
                kind: SlotKind::Internal("name"),
            });
            f(Slot {
                offset: 16,
                value: obj.function_env(),
                kind: SlotKind::Context("env"),
            });
        }
        JsType::Symbol => {
            f(Slot {
                offset: 8,
                value: obj.symbol_description(),
                kind: SlotKind::Internal("description"),
            });
        }
        // Leaf payloads: no reference slots beyond the hclass word.
        JsType::LineString | JsType::HeapNumber | JsType::BigInt | JsType::NativeBinding => {}
    }
}
