use crate::layout;
use crate::{ClassShape, MemoryError, ObjectFormat, Oop, Storage, StrategyKind, Value};

/// One record in the object arena.
#[derive(Debug, Clone)]
pub struct HeapObject {
    pub class: Oop,
    /// 12-bit identity hash.
    pub hash: u32,
    pub format: ObjectFormat,
    pub named: Vec<Value>,
    pub storage: Storage,
}

impl HeapObject {
    pub fn indexable_len(&self) -> usize {
        self.storage.len()
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        self.storage.as_bytes()
    }

    pub fn words(&self) -> Option<&[u32]> {
        self.storage.as_words()
    }

    /// Shape this record currently has, for class-change checks.
    pub fn shape(&self) -> ClassShape {
        ClassShape::new(self.format, self.named.len())
    }
}

/// Arena of heap objects addressed by stable [`Oop`] indices.
pub struct ObjectMemory {
    pub(crate) objects: Vec<Option<HeapObject>>,
    pub(crate) free: Vec<u32>,
    nil: Value,
    last_hash: u32,
    pub(crate) allocations: usize,
}

impl Default for ObjectMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectMemory {
    pub fn new() -> Self {
        Self {
            objects: Vec::new(),
            free: Vec::new(),
            nil: Value::Object(Oop::from_index(0)),
            last_hash: 0,
            allocations: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut memory = Self::new();
        memory.objects.reserve(capacity);
        memory
    }

    /// Arena holding `objects` at indices `0..len`, as produced by a loader.
    pub fn from_objects(objects: Vec<HeapObject>, nil: Oop, last_hash: u32) -> Self {
        Self {
            objects: objects.into_iter().map(Some).collect(),
            free: Vec::new(),
            nil: Value::Object(nil),
            last_hash,
            allocations: 0,
        }
    }

    #[inline(always)]
    pub fn nil(&self) -> Value {
        self.nil
    }

    pub fn set_nil(&mut self, nil: Oop) {
        self.nil = Value::Object(nil);
    }

    pub fn last_hash(&self) -> u32 {
        self.last_hash
    }

    pub fn set_last_hash(&mut self, hash: u32) {
        self.last_hash = hash;
    }

    /// Next identity hash from a 16-bit linear congruential sequence.
    pub fn next_hash(&mut self) -> u32 {
        self.last_hash = (13849 + 27181 * self.last_hash) & 0xFFFF;
        self.last_hash & 0xFFF
    }

    pub fn allocations_since_gc(&self) -> usize {
        self.allocations
    }

    // ── Allocation ─────────────────────────────────────────────────

    /// Place `object` in the arena, reusing a freed index if possible.
    pub fn insert(&mut self, object: HeapObject) -> Oop {
        self.allocations += 1;
        if let Some(index) = self.free.pop() {
            self.objects[index as usize] = Some(object);
            Oop::from_index(index)
        } else {
            let index = self.objects.len() as u32;
            self.objects.push(Some(object));
            Oop::from_index(index)
        }
    }

    /// Allocate with `named` nil fields and a fresh indexable region.
    pub fn allocate(
        &mut self,
        class: Oop,
        format: ObjectFormat,
        named: usize,
        indexable: usize,
    ) -> Oop {
        let format = format.with_byte_len(indexable);
        let storage = Storage::new(format, indexable, self.nil);
        let hash = self.next_hash();
        self.insert(HeapObject {
            class,
            hash,
            format,
            named: vec![self.nil; named],
            storage,
        })
    }

    /// Allocate with explicit contents.
    pub fn allocate_with(
        &mut self,
        class: Oop,
        format: ObjectFormat,
        named: Vec<Value>,
        storage: Storage,
    ) -> Oop {
        let format = match &storage {
            Storage::Bytes(bytes) => format.with_byte_len(bytes.len()),
            _ => format,
        };
        let hash = self.next_hash();
        self.insert(HeapObject { class, hash, format, named, storage })
    }

    /// Allocate an instance of `class` as described by its format word.
    pub fn instantiate(
        &mut self,
        class: Oop,
        indexable: usize,
    ) -> Result<Oop, MemoryError> {
        let shape = self.class_shape(class)?;
        if indexable > 0 && !shape.inst_spec.is_indexable() {
            return Err(MemoryError::NotIndexable);
        }
        if matches!(shape.inst_spec, ObjectFormat::CompiledMethod { .. }) {
            return Err(MemoryError::ShapeMismatch(
                "compiled methods are created with newMethod:header:",
            ));
        }
        Ok(self.allocate(class, shape.inst_spec, shape.fixed_fields, indexable))
    }

    /// Decode the format word of `class`.
    pub fn class_shape(&self, class: Oop) -> Result<ClassShape, MemoryError> {
        let object = self.object(class)?;
        object
            .named
            .get(layout::class::FORMAT)
            .and_then(|word| word.as_small_int())
            .and_then(ClassShape::decode)
            .ok_or(MemoryError::NotAClass(Value::Object(class)))
    }

    // ── Access ─────────────────────────────────────────────────────

    #[inline]
    pub fn get(&self, oop: Oop) -> Option<&HeapObject> {
        self.objects.get(oop.index()).and_then(Option::as_ref)
    }

    #[inline]
    pub fn get_mut(&mut self, oop: Oop) -> Option<&mut HeapObject> {
        self.objects.get_mut(oop.index()).and_then(Option::as_mut)
    }

    #[inline]
    pub fn object(&self, oop: Oop) -> Result<&HeapObject, MemoryError> {
        self.get(oop).ok_or(MemoryError::InvalidOop(oop))
    }

    #[inline]
    pub fn object_mut(&mut self, oop: Oop) -> Result<&mut HeapObject, MemoryError> {
        self.get_mut(oop).ok_or(MemoryError::InvalidOop(oop))
    }

    /// The heap record behind `value`, failing for immediates.
    pub fn heap_object(&self, value: Value) -> Result<&HeapObject, MemoryError> {
        match value {
            Value::Object(oop) => self.object(oop),
            other => Err(MemoryError::NotAnObject(other)),
        }
    }

    pub fn contains(&self, oop: Oop) -> bool {
        self.get(oop).is_some()
    }

    /// Read named slot `index`.
    pub fn fetch(&self, oop: Oop, index: usize) -> Result<Value, MemoryError> {
        let object = self.object(oop)?;
        object
            .named
            .get(index)
            .copied()
            .ok_or(MemoryError::IndexOutOfBounds {
                index,
                size: object.named.len(),
            })
    }

    /// Write named slot `index`.
    pub fn store(
        &mut self,
        oop: Oop,
        index: usize,
        value: Value,
    ) -> Result<(), MemoryError> {
        let object = self.object_mut(oop)?;
        let size = object.named.len();
        let slot = object
            .named
            .get_mut(index)
            .ok_or(MemoryError::IndexOutOfBounds { index, size })?;
        *slot = value;
        Ok(())
    }

    /// Read element `index` (0-based) of the indexable region.
    pub fn fetch_indexed(&self, oop: Oop, index: usize) -> Result<Value, MemoryError> {
        let object = self.object(oop)?;
        object
            .storage
            .fetch(index, self.nil)
            .ok_or(MemoryError::IndexOutOfBounds {
                index,
                size: object.storage.len(),
            })
    }

    /// Write element `index` (0-based) of the indexable region.
    pub fn store_indexed(
        &mut self,
        oop: Oop,
        index: usize,
        value: Value,
    ) -> Result<(), MemoryError> {
        let nil = self.nil;
        let object = self.object_mut(oop)?;
        let before = object.storage.kind();
        object.storage.store(index, value, nil)?;
        let after = object.storage.kind();
        if before != after {
            log::debug!(
                "{oop:?}: storage {} -> {}",
                before.name(),
                after.name()
            );
        }
        Ok(())
    }

    pub fn indexable_len(&self, oop: Oop) -> Result<usize, MemoryError> {
        Ok(self.object(oop)?.storage.len())
    }

    pub fn strategy(&self, oop: Oop) -> Result<StrategyKind, MemoryError> {
        Ok(self.object(oop)?.storage.kind())
    }

    pub fn class_of(&self, oop: Oop) -> Result<Oop, MemoryError> {
        Ok(self.object(oop)?.class)
    }

    pub fn bytes_of(&self, oop: Oop) -> Option<&[u8]> {
        self.get(oop).and_then(HeapObject::bytes)
    }

    /// Byte contents of `value` read as Latin-1 text.
    pub fn string_of(&self, value: Value) -> Option<String> {
        let bytes = self.bytes_of(value.as_oop()?)?;
        Some(bytes.iter().map(|&b| b as char).collect())
    }

    // ── Shape changes ──────────────────────────────────────────────

    /// Make `oop` an instance of `class` in place.
    ///
    /// The new class must describe the same representation family and
    /// fixed-field count. Adopting a weak class turns the indexable
    /// region weak; leaving one turns it strong again.
    pub fn change_class(&mut self, oop: Oop, class: Oop) -> Result<(), MemoryError> {
        let shape = self.class_shape(class)?;
        let nil = self.nil;
        let object = self.object_mut(oop)?;
        if !object.shape().compatible_with(shape) {
            return Err(MemoryError::ShapeMismatch(
                "class describes a different instance layout",
            ));
        }
        match (shape.inst_spec, object.storage.kind()) {
            (ObjectFormat::Weak, kind) if kind != StrategyKind::Weak => {
                object.storage.transition(StrategyKind::Weak, nil);
            }
            (spec, StrategyKind::Weak) if spec != ObjectFormat::Weak => {
                let values = object.storage.values(nil);
                object.storage = Storage::from_values(values, nil);
            }
            _ => {}
        }
        object.format = match (shape.inst_spec, object.format) {
            (ObjectFormat::Bytes { .. }, ObjectFormat::Bytes { unused }) => {
                ObjectFormat::Bytes { unused }
            }
            (spec, _) => spec,
        };
        object.class = class;
        Ok(())
    }

    /// Two-way identity exchange: every reference to `a` now reaches the
    /// record that was `b`, and vice versa.
    pub fn exchange_identity(&mut self, a: Oop, b: Oop) -> Result<(), MemoryError> {
        if a == b {
            return Err(MemoryError::ShapeMismatch("an object cannot become itself"));
        }
        let fa = self.object(a)?.format.family();
        let fb = self.object(b)?.format.family();
        if fa != fb {
            return Err(MemoryError::ShapeMismatch(
                "become requires the same representation family",
            ));
        }
        self.objects.swap(a.index(), b.index());
        Ok(())
    }

    /// Shallow copy with a fresh identity hash.
    pub fn shallow_copy(&mut self, oop: Oop) -> Result<Oop, MemoryError> {
        let mut copy = self.object(oop)?.clone();
        copy.hash = self.next_hash();
        Ok(self.insert(copy))
    }

    // ── Enumeration ────────────────────────────────────────────────

    pub fn iter(&self) -> impl Iterator<Item = (Oop, &HeapObject)> {
        self.objects
            .iter()
            .enumerate()
            .filter_map(|(i, o)| o.as_ref().map(|o| (Oop::from_index(i as u32), o)))
    }

    /// First live instance of `class` whose index is after `after`.
    pub fn next_instance_of(&self, class: Oop, after: Option<Oop>) -> Option<Oop> {
        let start = after.map_or(0, |o| o.index() + 1);
        self.objects
            .iter()
            .enumerate()
            .skip(start)
            .find(|(_, o)| o.as_ref().is_some_and(|o| o.class == class))
            .map(|(i, _)| Oop::from_index(i as u32))
    }

    pub fn live_count(&self) -> usize {
        self.objects.iter().filter(|o| o.is_some()).count()
    }

    /// Number of arena slots, live or free.
    pub fn capacity(&self) -> usize {
        self.objects.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A memory with nil, a pointers class, a bytes class and a weak class.
    fn memory() -> (ObjectMemory, Oop, Oop, Oop) {
        let mut m = ObjectMemory::new();
        let nil = m.allocate(Oop::from_index(0), ObjectFormat::NoFields, 0, 0);
        m.set_nil(nil);
        let meta = m.allocate(nil, ObjectFormat::Fixed, layout::class::SIZE, 0);
        let class = |m: &mut ObjectMemory, spec, fixed| {
            let c = m.allocate(meta, ObjectFormat::Fixed, layout::class::SIZE, 0);
            let format = ClassShape::new(spec, fixed).encode();
            m.store(c, layout::class::FORMAT, Value::from_i64(format)).unwrap();
            c
        };
        let pointers = class(&mut m, ObjectFormat::FixedIndexable, 2);
        let bytes = class(&mut m, ObjectFormat::Bytes { unused: 0 }, 0);
        let weak = class(&mut m, ObjectFormat::Weak, 2);
        (m, pointers, bytes, weak)
    }

    #[test]
    fn instantiate_uses_class_shape() {
        let (mut m, pointers, bytes, _) = memory();
        let o = m.instantiate(pointers, 3).unwrap();
        let obj = m.object(o).unwrap();
        assert_eq!(obj.named.len(), 2);
        assert_eq!(obj.storage.kind(), StrategyKind::AllNil);
        assert_eq!(obj.indexable_len(), 3);

        let b = m.instantiate(bytes, 5).unwrap();
        let obj = m.object(b).unwrap();
        assert_eq!(obj.format, ObjectFormat::Bytes { unused: 3 });
        assert_eq!(obj.bytes(), Some(&[0u8; 5][..]));
    }

    #[test]
    fn indexed_store_switches_strategy() {
        let (mut m, pointers, _, _) = memory();
        let o = m.instantiate(pointers, 2).unwrap();
        m.store_indexed(o, 0, Value::from_i64(5)).unwrap();
        assert_eq!(m.strategy(o).unwrap(), StrategyKind::SmallIntegerOrNil);
        m.store_indexed(o, 1, Value::Object(pointers)).unwrap();
        assert_eq!(m.strategy(o).unwrap(), StrategyKind::Pointers);
        assert_eq!(m.fetch_indexed(o, 0).unwrap(), Value::from_i64(5));
        assert_eq!(m.fetch_indexed(o, 1).unwrap(), Value::Object(pointers));
    }

    #[test]
    fn change_class_checks_shape() {
        let (mut m, pointers, bytes, weak) = memory();
        let o = m.instantiate(pointers, 2).unwrap();
        m.store_indexed(o, 0, Value::Object(bytes)).unwrap();
        assert!(matches!(
            m.change_class(o, bytes),
            Err(MemoryError::ShapeMismatch(_))
        ));
        assert_eq!(m.class_of(o).unwrap(), pointers);

        m.change_class(o, weak).unwrap();
        assert_eq!(m.strategy(o).unwrap(), StrategyKind::Weak);
        assert_eq!(m.fetch_indexed(o, 0).unwrap(), Value::Object(bytes));
    }

    #[test]
    fn exchange_identity_swaps_records() {
        let (mut m, pointers, bytes, _) = memory();
        let a = m.instantiate(pointers, 1).unwrap();
        let b = m.instantiate(pointers, 4).unwrap();
        m.exchange_identity(a, b).unwrap();
        assert_eq!(m.indexable_len(a).unwrap(), 4);
        assert_eq!(m.indexable_len(b).unwrap(), 1);

        let s = m.instantiate(bytes, 1).unwrap();
        assert!(m.exchange_identity(a, s).is_err());
        assert!(m.exchange_identity(a, a).is_err());
    }

    #[test]
    fn next_instance_walks_in_index_order() {
        let (mut m, pointers, _, _) = memory();
        let a = m.instantiate(pointers, 0).unwrap();
        let b = m.instantiate(pointers, 0).unwrap();
        assert_eq!(m.next_instance_of(pointers, None), Some(a));
        assert_eq!(m.next_instance_of(pointers, Some(a)), Some(b));
        assert_eq!(m.next_instance_of(pointers, Some(b)), None);
    }
}
