use log::{debug, trace};

use crate::object::{
    BoundMethodObj, ClassObj, ClosureObj, FunctionObj, Handle, InstanceObj, NativeObj, Obj,
    StrObj, UpvalueObj, Value,
};
use crate::table::Table;

const INITIAL_GC_THRESHOLD: usize = 1024 * 1024;
const GC_GROWTH_FACTOR: usize = 2;

/// FNV-1a over the raw bytes; cached on every interned string.
pub fn hash_str(text: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for b in text.bytes() {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

enum Slot {
    Vacant,
    Occupied { marked: bool, obj: Obj },
}

// ── Heap ─────────────────────────────────────────────────────────────
//
// Slot arena with a free list. Handles are slot indices and stay stable
// across collections; a slot is only recycled after a sweep proved its
// object unreachable. The collector is stop-the-world mark-sweep: the
// owner (the VM, plus the compiler while a compile is in flight) marks
// its roots, then `finish_collect` traces, prunes the weak intern table,
// and sweeps.

pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Intern set: key = string handle, value unused. Weak — unmarked
    /// keys are dropped before each sweep.
    strings: Table,
    /// Gray worklist for the trace phase. Kept explicit so marking depth
    /// never depends on object-graph depth.
    gray: Vec<Handle>,
    bytes_allocated: usize,
    next_gc: usize,
    stress: bool,
    collections: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            strings: Table::new(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_GC_THRESHOLD,
            stress: false,
            collections: 0,
        }
    }

    /// Collect at every allocation point instead of waiting for the
    /// threshold. Exercises the "roots only at safe points" discipline.
    pub fn set_stress(&mut self, stress: bool) {
        self.stress = stress;
    }

    pub fn should_collect(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_gc
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn collection_count(&self) -> usize {
        self.collections
    }

    pub fn object_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Occupied { .. }))
            .count()
    }

    // ---- Allocation ----

    /// The single allocation entry point. Never collects on its own; the
    /// caller runs a collection at a safe point first if the threshold
    /// (or stress mode) demands one.
    pub fn alloc(&mut self, obj: Obj) -> Handle {
        self.bytes_allocated += obj.heap_size();
        let kind = obj.kind_name();
        let handle = match self.free.pop() {
            Some(i) => {
                self.slots[i as usize] = Slot::Occupied { marked: false, obj };
                Handle(i)
            }
            None => {
                self.slots.push(Slot::Occupied { marked: false, obj });
                Handle((self.slots.len() - 1) as u32)
            }
        };
        trace!("alloc slot {} ({kind}), {} bytes live", handle.0, self.bytes_allocated);
        handle
    }

    /// Returns the canonical handle for `text`, allocating at most once
    /// per distinct byte sequence.
    pub fn intern(&mut self, text: &str) -> Handle {
        let hash = hash_str(text);
        let slots = &self.slots;
        let found = self.strings.find_key(hash, |h| {
            matches!(&slots[h.index()], Slot::Occupied { obj: Obj::Str(s), .. } if &*s.text == text)
        });
        if let Some(h) = found {
            return h;
        }
        let h = self.alloc(Obj::Str(StrObj { text: text.into(), hash }));
        self.strings.set(h, hash, Value::Nil);
        h
    }

    #[cfg(test)]
    pub(crate) fn interned_count(&self) -> usize {
        self.strings.iter().count()
    }

    // ---- Accessors ----

    pub fn get(&self, h: Handle) -> &Obj {
        match &self.slots[h.index()] {
            Slot::Occupied { obj, .. } => obj,
            Slot::Vacant => panic!("use of freed handle {}", h.0),
        }
    }

    pub fn get_mut(&mut self, h: Handle) -> &mut Obj {
        match &mut self.slots[h.index()] {
            Slot::Occupied { obj, .. } => obj,
            Slot::Vacant => panic!("use of freed handle {}", h.0),
        }
    }

    pub fn string(&self, h: Handle) -> &StrObj {
        match self.get(h) {
            Obj::Str(s) => s,
            o => panic!("expected string, found {}", o.kind_name()),
        }
    }

    pub fn string_hash(&self, h: Handle) -> u32 {
        self.string(h).hash
    }

    pub fn function(&self, h: Handle) -> &FunctionObj {
        match self.get(h) {
            Obj::Function(f) => f,
            o => panic!("expected function, found {}", o.kind_name()),
        }
    }

    pub fn native(&self, h: Handle) -> &NativeObj {
        match self.get(h) {
            Obj::Native(n) => n,
            o => panic!("expected native, found {}", o.kind_name()),
        }
    }

    pub fn closure(&self, h: Handle) -> &ClosureObj {
        match self.get(h) {
            Obj::Closure(c) => c,
            o => panic!("expected closure, found {}", o.kind_name()),
        }
    }

    pub fn closure_mut(&mut self, h: Handle) -> &mut ClosureObj {
        match self.get_mut(h) {
            Obj::Closure(c) => c,
            o => panic!("expected closure, found {}", o.kind_name()),
        }
    }

    pub fn upvalue(&self, h: Handle) -> &UpvalueObj {
        match self.get(h) {
            Obj::Upvalue(u) => u,
            o => panic!("expected upvalue, found {}", o.kind_name()),
        }
    }

    pub fn upvalue_mut(&mut self, h: Handle) -> &mut UpvalueObj {
        match self.get_mut(h) {
            Obj::Upvalue(u) => u,
            o => panic!("expected upvalue, found {}", o.kind_name()),
        }
    }

    pub fn class(&self, h: Handle) -> &ClassObj {
        match self.get(h) {
            Obj::Class(c) => c,
            o => panic!("expected class, found {}", o.kind_name()),
        }
    }

    pub fn class_mut(&mut self, h: Handle) -> &mut ClassObj {
        match self.get_mut(h) {
            Obj::Class(c) => c,
            o => panic!("expected class, found {}", o.kind_name()),
        }
    }

    pub fn instance(&self, h: Handle) -> &InstanceObj {
        match self.get(h) {
            Obj::Instance(i) => i,
            o => panic!("expected instance, found {}", o.kind_name()),
        }
    }

    pub fn instance_mut(&mut self, h: Handle) -> &mut InstanceObj {
        match self.get_mut(h) {
            Obj::Instance(i) => i,
            o => panic!("expected instance, found {}", o.kind_name()),
        }
    }

    pub fn bound_method(&self, h: Handle) -> &BoundMethodObj {
        match self.get(h) {
            Obj::BoundMethod(b) => b,
            o => panic!("expected bound method, found {}", o.kind_name()),
        }
    }

    /// Copies the superclass's methods into the subclass's (still empty)
    /// method table; later `Method` instructions overwrite overrides.
    pub fn inherit_methods(&mut self, superclass: Handle, subclass: Handle) {
        let mut methods = std::mem::take(&mut self.class_mut(subclass).methods);
        methods.extend_from(&self.class(superclass).methods);
        self.class_mut(subclass).methods = methods;
    }

    // ---- Rendering ----

    pub fn format_value(&self, v: Value) -> String {
        match v {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => {
                if n == (n as i64) as f64 {
                    format!("{}", n as i64)
                } else {
                    format!("{n}")
                }
            }
            Value::Obj(h) => self.format_object(h),
        }
    }

    fn format_object(&self, h: Handle) -> String {
        match self.get(h) {
            Obj::Str(s) => s.text.to_string(),
            Obj::Function(f) => self.format_function(f),
            Obj::Native(_) => "<native fn>".to_string(),
            Obj::Closure(c) => self.format_function(self.function(c.function)),
            Obj::Upvalue(_) => "upvalue".to_string(),
            Obj::Class(c) => self.string(c.name).text.to_string(),
            Obj::Instance(i) => {
                format!("{} instance", self.string(self.class(i.class).name).text)
            }
            Obj::BoundMethod(b) => {
                let closure = self.closure(b.method);
                self.format_function(self.function(closure.function))
            }
        }
    }

    fn format_function(&self, f: &FunctionObj) -> String {
        match f.name {
            Some(n) => format!("<fn {}>", self.string(n).text),
            None => "<script>".to_string(),
        }
    }

    // ---- Collection ----

    pub fn mark_value(&mut self, v: Value) {
        if let Value::Obj(h) = v {
            self.mark_object(h);
        }
    }

    pub fn mark_object(&mut self, h: Handle) {
        if let Slot::Occupied { marked, .. } = &mut self.slots[h.index()] {
            if !*marked {
                *marked = true;
                self.gray.push(h);
            }
        }
    }

    /// Marks every key and value of an externally owned table (the VM's
    /// globals). Tables inside heap objects are traced, not marked here.
    pub fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_object(key);
            self.mark_value(value);
        }
    }

    /// Runs the trace, weak-intern cleanup, and sweep phases. The caller
    /// has already marked its roots.
    pub fn finish_collect(&mut self) {
        let before_bytes = self.bytes_allocated;
        let before_objects = self.object_count();

        self.trace_references();

        // Interned strings are weak: drop any the mark phase missed, or
        // the intern table would keep every dead string alive forever.
        let slots = &self.slots;
        self.strings
            .remove_unmarked(|h| matches!(slots[h.index()], Slot::Occupied { marked: true, .. }));

        self.sweep();
        self.next_gc = self.bytes_allocated * GC_GROWTH_FACTOR;
        self.collections += 1;

        debug!(
            "gc #{}: freed {} objects / {} bytes, {} bytes live, next at {}",
            self.collections,
            before_objects - self.object_count(),
            before_bytes - self.bytes_allocated,
            self.bytes_allocated,
            self.next_gc,
        );
    }

    /// Breadth-first blackening over the gray worklist. Children are
    /// copied out before marking so the arena is never borrowed while
    /// it is being mutated.
    fn trace_references(&mut self) {
        let mut children: Vec<Value> = Vec::new();
        while let Some(h) = self.gray.pop() {
            children.clear();
            if let Slot::Occupied { obj, .. } = &self.slots[h.index()] {
                match obj {
                    Obj::Str(_) => {}
                    Obj::Function(f) => {
                        if let Some(name) = f.name {
                            children.push(Value::Obj(name));
                        }
                        children.extend(f.chunk.constants.iter().copied());
                    }
                    Obj::Native(n) => children.push(Value::Obj(n.name)),
                    Obj::Closure(c) => {
                        children.push(Value::Obj(c.function));
                        children.extend(c.upvalues.iter().map(|&u| Value::Obj(u)));
                    }
                    Obj::Upvalue(u) => {
                        // An open upvalue's slot is marked via the stack
                        // root set; only a closed one owns its value.
                        if let UpvalueObj::Closed(v) = u {
                            children.push(*v);
                        }
                    }
                    Obj::Class(c) => {
                        children.push(Value::Obj(c.name));
                        for (key, value) in c.methods.iter() {
                            children.push(Value::Obj(key));
                            children.push(value);
                        }
                    }
                    Obj::Instance(i) => {
                        children.push(Value::Obj(i.class));
                        for (key, value) in i.fields.iter() {
                            children.push(Value::Obj(key));
                            children.push(value);
                        }
                    }
                    Obj::BoundMethod(b) => {
                        children.push(b.receiver);
                        children.push(Value::Obj(b.method));
                    }
                }
            }
            for &child in &children {
                self.mark_value(child);
            }
        }
    }

    fn sweep(&mut self) {
        let mut freed_bytes = 0;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            match slot {
                Slot::Occupied { marked, .. } if *marked => *marked = false,
                Slot::Occupied { obj, .. } => {
                    freed_bytes += obj.heap_size();
                    *slot = Slot::Vacant;
                    self.free.push(i as u32);
                }
                Slot::Vacant => {}
            }
        }
        self.bytes_allocated = self.bytes_allocated.saturating_sub(freed_bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn str_obj(text: &str) -> Obj {
        Obj::Str(StrObj { text: text.into(), hash: hash_str(text) })
    }

    #[test]
    fn interning_dedups_equal_bytes() {
        let mut heap = Heap::new();
        let a = heap.intern("counter");
        let b = heap.intern("counter");
        let c = heap.intern("other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.object_count(), 2);
        assert_eq!(heap.interned_count(), 2);
    }

    #[test]
    fn collect_frees_unreachable_and_keeps_roots() {
        let mut heap = Heap::new();
        let kept = heap.alloc(str_obj("kept"));
        let _dead = heap.alloc(str_obj("dead"));
        let bytes_before = heap.bytes_allocated();

        heap.mark_object(kept);
        heap.finish_collect();

        assert_eq!(heap.object_count(), 1);
        assert!(heap.bytes_allocated() < bytes_before);
        // The survivor is intact and its handle unchanged.
        assert_eq!(&*heap.string(kept).text, "kept");
    }

    #[test]
    fn collect_clears_marks_for_next_cycle() {
        let mut heap = Heap::new();
        let h = heap.alloc(str_obj("x"));
        heap.mark_object(h);
        heap.finish_collect();
        assert_eq!(heap.object_count(), 1);
        // Without re-marking, the next cycle frees it.
        heap.finish_collect();
        assert_eq!(heap.object_count(), 0);
    }

    #[test]
    fn freed_slots_are_recycled() {
        let mut heap = Heap::new();
        let kept = heap.alloc(str_obj("kept"));
        let dead = heap.alloc(str_obj("dead"));
        heap.mark_object(kept);
        heap.finish_collect();

        let recycled = heap.alloc(str_obj("recycled"));
        assert_eq!(recycled, dead);
        assert_eq!(&*heap.string(kept).text, "kept");
        assert_eq!(&*heap.string(recycled).text, "recycled");
    }

    #[test]
    fn intern_table_is_weak() {
        let mut heap = Heap::new();
        let kept = heap.intern("kept");
        let _dead = heap.intern("dead");
        assert_eq!(heap.interned_count(), 2);

        heap.mark_object(kept);
        heap.finish_collect();

        assert_eq!(heap.interned_count(), 1);
        // A fresh intern of the dead bytes allocates a new object rather
        // than resurrecting the freed slot's contents.
        let again = heap.intern("dead");
        assert_eq!(&*heap.string(again).text, "dead");
        assert_eq!(heap.object_count(), 2);
    }

    #[test]
    fn trace_follows_closure_graph() {
        let mut heap = Heap::new();
        let name = heap.intern("f");
        let function = heap.alloc(Obj::Function(FunctionObj {
            arity: 0,
            upvalue_count: 1,
            chunk: crate::chunk::Chunk::new(),
            name: Some(name),
            kind: crate::object::FunctionKind::Function,
        }));
        let upvalue = heap.alloc(Obj::Upvalue(UpvalueObj::Closed(Value::Obj(name))));
        let closure = heap.alloc(Obj::Closure(ClosureObj {
            function,
            upvalues: vec![upvalue],
        }));

        heap.mark_object(closure);
        heap.finish_collect();
        // Closure, function, upvalue, and name all survive via one root.
        assert_eq!(heap.object_count(), 4);
    }

    #[test]
    fn stress_mode_demands_collection_every_time() {
        let mut heap = Heap::new();
        assert!(!heap.should_collect());
        heap.set_stress(true);
        assert!(heap.should_collect());
    }

    #[test]
    fn marking_is_idempotent() {
        let mut heap = Heap::new();
        let h = heap.alloc(str_obj("x"));
        heap.mark_object(h);
        heap.mark_object(h);
        assert_eq!(heap.gray.len(), 1);
    }
}
