//! Heap allocator for tagged objects
//!
//! Bump allocation out of size-aligned regions. The heap also owns the
//! bootstrap hclasses (one per object kind) and the factory methods that
//! build well-formed objects; everything the profiler walks comes from
//! here.

use super::region::{Region, REGION_SIZE};
use super::{GcListener, HeapCounters};
use crate::vm::object::{
    align_word, JsType, ObjectRef, FUNCTION_SIZE, HCLASS_SIZE, HEAP_NUMBER_SIZE,
    LINE_STRING_HEADER_SIZE, NATIVE_BINDING_SIZE, SLICED_STRING_SIZE, SYMBOL_SIZE,
    TREE_STRING_SIZE, WORD_SIZE,
};
use crate::vm::value::{ObjAddr, TaggedValue};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Bootstrap hclass addresses, one per built-in kind.
///
/// These are VM-internal roots: the collector traces and rewrites them like
/// any other root slot.
#[derive(Debug, Clone, Copy)]
pub struct BaseClasses {
    pub hclass: ObjAddr,
    pub line_string: ObjAddr,
    pub tree_string: ObjAddr,
    pub sliced_string: ObjAddr,
    pub array: ObjAddr,
    pub function: ObjAddr,
    pub heap_number: ObjAddr,
    pub bigint: ObjAddr,
    pub symbol: ObjAddr,
    pub native_binding: ObjAddr,
}

impl BaseClasses {
    /// Visit every base-class slot mutably (collector fix-up).
    pub fn for_each_mut(&mut self, mut f: impl FnMut(&mut ObjAddr)) {
        f(&mut self.hclass);
        f(&mut self.line_string);
        f(&mut self.tree_string);
        f(&mut self.sliced_string);
        f(&mut self.array);
        f(&mut self.function);
        f(&mut self.heap_number);
        f(&mut self.bigint);
        f(&mut self.symbol);
        f(&mut self.native_binding);
    }
}

/// Region-based heap for GC-managed tagged objects.
pub struct Heap {
    regions: Vec<Region>,
    base: BaseClasses,
    /// GC hook sink (the heap profiler, when attached).
    listener: Option<Arc<dyn GcListener>>,
    /// Shared counters readable without the heap lock.
    counters: Arc<HeapCounters>,
    object_count: usize,
}

impl Heap {
    /// Create a heap and bootstrap the base hclasses.
    pub fn new() -> Self {
        let mut heap = Self {
            regions: vec![Region::new()],
            base: BaseClasses {
                hclass: 0,
                line_string: 0,
                tree_string: 0,
                sliced_string: 0,
                array: 0,
                function: 0,
                heap_number: 0,
                bigint: 0,
                symbol: 0,
                native_binding: 0,
            },
            listener: None,
            counters: Arc::new(HeapCounters::default()),
            object_count: 0,
        };
        heap.bootstrap();
        heap
    }

    fn bootstrap(&mut self) {
        // The meta hclass describes itself; everything else hangs off it.
        let meta = self.allocate_raw(HCLASS_SIZE);
        let meta_ref = ObjectRef(meta);
        meta_ref.set_hclass(meta);
        meta_ref.hclass_init(JsType::Hclass, HCLASS_SIZE);
        self.base.hclass = meta;

        self.base.line_string = self.new_hclass_raw(JsType::LineString, 0);
        self.base.tree_string = self.new_hclass_raw(JsType::TreeString, TREE_STRING_SIZE);
        self.base.sliced_string = self.new_hclass_raw(JsType::SlicedString, SLICED_STRING_SIZE);
        self.base.array = self.new_hclass_raw(JsType::Array, 0);
        self.base.function = self.new_hclass_raw(JsType::Function, FUNCTION_SIZE);
        self.base.heap_number = self.new_hclass_raw(JsType::HeapNumber, HEAP_NUMBER_SIZE);
        self.base.bigint = self.new_hclass_raw(JsType::BigInt, 0);
        self.base.symbol = self.new_hclass_raw(JsType::Symbol, SYMBOL_SIZE);
        self.base.native_binding = self.new_hclass_raw(JsType::NativeBinding, NATIVE_BINDING_SIZE);

        // Names can only be attached once the string hclass exists.
        let names = [
            (self.base.hclass, "Hclass"),
            (self.base.line_string, "string"),
            (self.base.tree_string, "string"),
            (self.base.sliced_string, "string"),
            (self.base.array, "Array"),
            (self.base.function, "Function"),
            (self.base.heap_number, "number"),
            (self.base.bigint, "bigint"),
            (self.base.symbol, "symbol"),
            (self.base.native_binding, "Native"),
        ];
        for (hclass, name) in names {
            let name_str = self.alloc_string(name);
            ObjectRef(hclass).set_slot(16, TaggedValue::object(name_str));
        }
    }

    fn new_hclass_raw(&mut self, js_type: JsType, object_size: usize) -> ObjAddr {
        let addr = self.allocate_raw(HCLASS_SIZE);
        let obj = ObjectRef(addr);
        obj.set_hclass(self.base.hclass);
        obj.hclass_init(js_type, object_size);
        addr
    }

    /// Attach the GC hook sink. Replaces any previous listener.
    pub fn set_gc_listener(&mut self, listener: Option<Arc<dyn GcListener>>) {
        self.listener = listener;
    }

    pub(crate) fn gc_listener(&self) -> Option<Arc<dyn GcListener>> {
        self.listener.clone()
    }

    /// Shared counters used by the tracking stream thread.
    pub fn counters(&self) -> Arc<HeapCounters> {
        Arc::clone(&self.counters)
    }

    /// Bootstrap hclass table.
    #[inline]
    pub fn base_classes(&self) -> &BaseClasses {
        &self.base
    }

    pub(crate) fn base_classes_mut(&mut self) -> &mut BaseClasses {
        &mut self.base
    }

    // ── Raw allocation ─────────────────────────────────────────────────

    /// Bump-allocate `size` zeroed bytes and fire the allocation hook.
    pub fn allocate_raw(&mut self, size: usize) -> ObjAddr {
        assert!(
            size <= REGION_SIZE,
            "object of {size} bytes exceeds the region size"
        );
        let addr = match self
            .regions
            .last_mut()
            .and_then(|region| region.allocate(size))
        {
            Some(addr) => addr,
            None => {
                let mut region = Region::new();
                let addr = region
                    .allocate(size)
                    .expect("fresh region always fits one object");
                self.regions.push(region);
                addr
            }
        };
        self.object_count += 1;
        self.counters.allocated_bytes.fetch_add(size, Ordering::Relaxed);
        self.counters.object_count.fetch_add(1, Ordering::Relaxed);
        if let Some(listener) = &self.listener {
            listener.allocation_event(addr, size);
        }
        addr
    }

    // ── Object factories ───────────────────────────────────────────────

    /// Allocate a flat string with the given content.
    pub fn alloc_string(&mut self, s: &str) -> ObjAddr {
        let bytes = s.as_bytes();
        let size = LINE_STRING_HEADER_SIZE + align_word(bytes.len());
        let addr = self.allocate_raw(size.max(LINE_STRING_HEADER_SIZE));
        let obj = ObjectRef(addr);
        obj.set_hclass(self.base.line_string);
        obj.write_word(8, bytes.len() as u64);
        // SAFETY: the allocation reserved room for the content right after
        // the header and the region memory is zero-initialized.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                (addr as usize + LINE_STRING_HEADER_SIZE) as *mut u8,
                bytes.len(),
            );
        }
        addr
    }

    /// Allocate a rope node over two existing strings.
    pub fn alloc_tree_string(&mut self, first: ObjAddr, second: ObjAddr) -> ObjAddr {
        let len = ObjectRef(first).string_len() + ObjectRef(second).string_len();
        let addr = self.allocate_raw(TREE_STRING_SIZE);
        let obj = ObjectRef(addr);
        obj.set_hclass(self.base.tree_string);
        obj.write_word(8, len as u64);
        obj.set_slot(16, TaggedValue::object(first));
        obj.set_slot(24, TaggedValue::object(second));
        addr
    }

    /// Allocate a slice view into an existing string.
    pub fn alloc_sliced_string(&mut self, parent: ObjAddr, start: u32, len: u32) -> ObjAddr {
        let addr = self.allocate_raw(SLICED_STRING_SIZE);
        let obj = ObjectRef(addr);
        obj.set_hclass(self.base.sliced_string);
        obj.write_word(8, start as u64 | (len as u64) << 32);
        obj.set_slot(16, TaggedValue::object(parent));
        addr
    }

    /// Allocate a boxed double.
    pub fn alloc_number(&mut self, value: f64) -> ObjAddr {
        let addr = self.allocate_raw(HEAP_NUMBER_SIZE);
        let obj = ObjectRef(addr);
        obj.set_hclass(self.base.heap_number);
        obj.write_word(8, value.to_bits());
        addr
    }

    /// Allocate a big integer from its magnitude words.
    pub fn alloc_bigint(&mut self, negative: bool, digits: &[u64]) -> ObjAddr {
        let addr = self.allocate_raw(16 + digits.len() * WORD_SIZE);
        let obj = ObjectRef(addr);
        obj.set_hclass(self.base.bigint);
        obj.write_word(8, digits.len() as u64 | (negative as u64) << 32);
        for (i, d) in digits.iter().enumerate() {
            obj.write_word(16 + i * WORD_SIZE, *d);
        }
        addr
    }

    /// Allocate a symbol with an optional description value.
    pub fn alloc_symbol(&mut self, description: TaggedValue) -> ObjAddr {
        let addr = self.allocate_raw(SYMBOL_SIZE);
        let obj = ObjectRef(addr);
        obj.set_hclass(self.base.symbol);
        obj.set_slot(8, description);
        addr
    }

    /// Allocate an embedder-bound object carrying `native_size` off-heap
    /// bytes (an ArrayBuffer-style binding).
    pub fn alloc_native(&mut self, native_size: usize) -> ObjAddr {
        let addr = self.allocate_raw(NATIVE_BINDING_SIZE);
        let obj = ObjectRef(addr);
        obj.set_hclass(self.base.native_binding);
        obj.write_word(8, native_size as u64);
        addr
    }

    /// Allocate an array holding the given elements.
    pub fn alloc_array(&mut self, elements: &[TaggedValue]) -> ObjAddr {
        let addr = self.allocate_raw(16 + elements.len() * WORD_SIZE);
        let obj = ObjectRef(addr);
        obj.set_hclass(self.base.array);
        obj.write_word(8, elements.len() as u64);
        for (i, e) in elements.iter().enumerate() {
            obj.set_array_element(i, *e);
        }
        addr
    }

    /// Create a new object class with named fields.
    pub fn new_object_class(&mut self, name: &str, field_names: &[&str]) -> ObjAddr {
        let name_str = self.alloc_string(name);
        let layout = if field_names.is_empty() {
            TaggedValue::undefined()
        } else {
            let names: Vec<TaggedValue> = field_names
                .iter()
                .map(|n| TaggedValue::object(self.alloc_string(n)))
                .collect();
            TaggedValue::object(self.alloc_array(&names))
        };
        let size = (1 + field_names.len()) * WORD_SIZE;
        let hclass = self.new_hclass_raw(JsType::Object, size);
        let obj = ObjectRef(hclass);
        obj.set_slot(16, TaggedValue::object(name_str));
        obj.set_slot(24, layout);
        hclass
    }

    /// Allocate an instance of an object class.
    pub fn alloc_object(&mut self, hclass: ObjAddr, fields: &[TaggedValue]) -> ObjAddr {
        debug_assert_eq!(ObjectRef(hclass).hclass_js_type(), JsType::Object);
        let size = ObjectRef(hclass).hclass_object_size();
        debug_assert_eq!(fields.len(), (size - WORD_SIZE) / WORD_SIZE);
        let addr = self.allocate_raw(size);
        let obj = ObjectRef(addr);
        obj.set_hclass(hclass);
        for (i, f) in fields.iter().enumerate() {
            obj.set_field(i, *f);
        }
        addr
    }

    /// Allocate a function object.
    pub fn alloc_function(&mut self, name: &str, env: TaggedValue) -> ObjAddr {
        let name_str = self.alloc_string(name);
        let addr = self.allocate_raw(FUNCTION_SIZE);
        let obj = ObjectRef(addr);
        obj.set_hclass(self.base.function);
        obj.set_slot(8, TaggedValue::object(name_str));
        obj.set_slot(16, env);
        addr
    }

    // ── Iteration ──────────────────────────────────────────────────────

    /// Visit every allocated object, region by region, in address order
    /// within each region.
    pub fn iterate_over_objects(&self, mut f: impl FnMut(ObjAddr)) {
        for region in &self.regions {
            let mut addr = region.base();
            while addr < region.top() {
                f(addr);
                addr += ObjectRef(addr).size() as u64;
            }
        }
    }

    /// Whether `addr` points into allocated heap memory.
    pub fn contains(&self, addr: ObjAddr) -> bool {
        self.regions.iter().any(|r| r.contains(addr))
    }

    /// Number of live regions.
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Total allocated bytes.
    pub fn allocated_bytes(&self) -> usize {
        self.counters.allocated_bytes.load(Ordering::Relaxed)
    }

    /// Number of allocated objects.
    pub fn object_count(&self) -> usize {
        self.object_count
    }

    /// Replace the region list after compaction.
    pub(crate) fn replace_regions(&mut self, regions: Vec<Region>, objects: usize, bytes: usize) {
        self.regions = regions;
        self.object_count = objects;
        self.counters.allocated_bytes.store(bytes, Ordering::Relaxed);
        self.counters.object_count.store(objects, Ordering::Relaxed);
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: Heap is only accessed from the owning VmContext, either on a
// single mutator thread or with all mutators suspended.
unsafe impl Send for Heap {}
