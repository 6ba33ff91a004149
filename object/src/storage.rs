use crate::{MemoryError, ObjectFormat, Oop, Value};

/// Nil marker inside a SmallInteger region. Lies outside the 31-bit range.
const INT_NIL: i64 = i64::MAX;
/// Nil marker inside a Float region. Storing this exact float generalizes.
const FLOAT_NIL: f64 = f64::MAX;

/// Tag naming the representation currently used by a [`Storage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    AllNil,
    SmallIntegerOrNil,
    FloatOrNil,
    Pointers,
    Weak,
    Bytes,
    Words,
}

impl StrategyKind {
    pub const fn name(self) -> &'static str {
        match self {
            Self::AllNil => "all-nil",
            Self::SmallIntegerOrNil => "small-integer-or-nil",
            Self::FloatOrNil => "float-or-nil",
            Self::Pointers => "pointers",
            Self::Weak => "weak",
            Self::Bytes => "bytes",
            Self::Words => "words",
        }
    }

    /// The least general pointer strategy that holds everything `self`
    /// holds plus `value`. Never narrower than `self`.
    pub fn widen_for(self, value: Value, nil: Value) -> Self {
        if value == nil {
            return self;
        }
        match (self, value) {
            (Self::AllNil | Self::SmallIntegerOrNil, Value::SmallInteger(_)) => {
                Self::SmallIntegerOrNil
            }
            (Self::AllNil | Self::FloatOrNil, Value::Float(f))
                if f.to_bits() != FLOAT_NIL.to_bits() =>
            {
                Self::FloatOrNil
            }
            (Self::Weak | Self::Bytes | Self::Words, _) => self,
            _ => Self::Pointers,
        }
    }

    /// The most specific strategy able to hold every element of `values`.
    pub fn for_values(values: &[Value], nil: Value) -> Self {
        let mut kind = Self::AllNil;
        for &value in values {
            kind = kind.widen_for(value, nil);
            if kind == Self::Pointers {
                break;
            }
        }
        kind
    }
}

/// Physical representation of an object's indexable region.
///
/// Exactly one variant is active at a time and every stored element is
/// representable under it. Pointer strategies only ever move towards
/// [`Storage::Pointers`].
#[derive(Debug, Clone)]
pub enum Storage {
    AllNil(usize),
    SmallIntegerOrNil(Vec<i64>),
    FloatOrNil(Vec<f64>),
    Pointers(Vec<Value>),
    Weak(Vec<Value>),
    Bytes(Vec<u8>),
    Words(Vec<u32>),
}

impl Storage {
    pub const fn empty() -> Self {
        Self::AllNil(0)
    }

    /// Storage for a fresh region of `len` elements of `format`.
    pub fn new(format: ObjectFormat, len: usize, nil: Value) -> Self {
        match format {
            ObjectFormat::Weak => Self::Weak(vec![nil; len]),
            ObjectFormat::Words => Self::Words(vec![0; len]),
            ObjectFormat::Bytes { .. } | ObjectFormat::CompiledMethod { .. } => {
                Self::Bytes(vec![0; len])
            }
            _ => Self::AllNil(len),
        }
    }

    /// Pointer storage holding `values` under the most specific strategy.
    pub fn from_values(values: Vec<Value>, nil: Value) -> Self {
        let kind = StrategyKind::for_values(&values, nil);
        Self::build(kind, values)
    }

    fn build(kind: StrategyKind, values: Vec<Value>) -> Self {
        match kind {
            StrategyKind::AllNil => Self::AllNil(values.len()),
            StrategyKind::SmallIntegerOrNil => Self::SmallIntegerOrNil(
                values
                    .iter()
                    .map(|v| match v {
                        Value::SmallInteger(n) => *n,
                        _ => INT_NIL,
                    })
                    .collect(),
            ),
            StrategyKind::FloatOrNil => Self::FloatOrNil(
                values
                    .iter()
                    .map(|v| match v {
                        Value::Float(f) => *f,
                        _ => FLOAT_NIL,
                    })
                    .collect(),
            ),
            StrategyKind::Weak => Self::Weak(values),
            StrategyKind::Bytes => Self::Bytes(
                values
                    .iter()
                    .map(|v| v.as_small_int().unwrap_or(0) as u8)
                    .collect(),
            ),
            StrategyKind::Words => Self::Words(
                values
                    .iter()
                    .map(|v| v.as_small_int().unwrap_or(0) as u32)
                    .collect(),
            ),
            StrategyKind::Pointers => Self::Pointers(values),
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::AllNil(_) => StrategyKind::AllNil,
            Self::SmallIntegerOrNil(_) => StrategyKind::SmallIntegerOrNil,
            Self::FloatOrNil(_) => StrategyKind::FloatOrNil,
            Self::Pointers(_) => StrategyKind::Pointers,
            Self::Weak(_) => StrategyKind::Weak,
            Self::Bytes(_) => StrategyKind::Bytes,
            Self::Words(_) => StrategyKind::Words,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::AllNil(len) => *len,
            Self::SmallIntegerOrNil(v) => v.len(),
            Self::FloatOrNil(v) => v.len(),
            Self::Pointers(v) | Self::Weak(v) => v.len(),
            Self::Bytes(v) => v.len(),
            Self::Words(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn holds_pointers(&self) -> bool {
        !matches!(self, Self::Bytes(_) | Self::Words(_))
    }

    /// Read element `index`.
    ///
    /// Word elements are answered as unboxed integers even when they
    /// exceed the SmallInteger range; the interpreter boxes those.
    pub fn fetch(&self, index: usize, nil: Value) -> Option<Value> {
        match self {
            Self::AllNil(len) => (index < *len).then_some(nil),
            Self::SmallIntegerOrNil(v) => v.get(index).map(|&n| {
                if n == INT_NIL { nil } else { Value::SmallInteger(n) }
            }),
            Self::FloatOrNil(v) => v.get(index).map(|&f| {
                if f.to_bits() == FLOAT_NIL.to_bits() {
                    nil
                } else {
                    Value::Float(f)
                }
            }),
            Self::Pointers(v) | Self::Weak(v) => v.get(index).copied(),
            Self::Bytes(v) => v.get(index).map(|&b| Value::SmallInteger(b as i64)),
            Self::Words(v) => v.get(index).map(|&w| Value::SmallInteger(w as i64)),
        }
    }

    /// Write element `index`, switching strategy first if `value` is not
    /// representable under the current one.
    ///
    /// On error nothing has been modified.
    pub fn store(
        &mut self,
        index: usize,
        value: Value,
        nil: Value,
    ) -> Result<(), MemoryError> {
        let size = self.len();
        if index >= size {
            return Err(MemoryError::IndexOutOfBounds { index, size });
        }
        match self {
            Self::Bytes(v) => {
                v[index] = Self::byte_of(value)?;
                return Ok(());
            }
            Self::Words(v) => {
                v[index] = Self::word_of(value)?;
                return Ok(());
            }
            _ => {}
        }

        let current = self.kind();
        let target = current.widen_for(value, nil);
        if target != current {
            self.transition(target, nil);
        }

        match self {
            Self::AllNil(_) => {}
            Self::SmallIntegerOrNil(v) => {
                v[index] = match value {
                    Value::SmallInteger(n) => n,
                    _ => INT_NIL,
                };
            }
            Self::FloatOrNil(v) => {
                v[index] = match value {
                    Value::Float(f) => f,
                    _ => FLOAT_NIL,
                };
            }
            Self::Pointers(v) | Self::Weak(v) => v[index] = value,
            Self::Bytes(_) | Self::Words(_) => {}
        }
        Ok(())
    }

    /// Store `value` into every element.
    pub fn fill(&mut self, value: Value, nil: Value) -> Result<(), MemoryError> {
        match self {
            Self::Bytes(v) => {
                let byte = Self::byte_of(value)?;
                v.iter_mut().for_each(|b| *b = byte);
            }
            Self::Words(v) => {
                let word = Self::word_of(value)?;
                v.iter_mut().for_each(|w| *w = word);
            }
            _ => {
                for index in 0..self.len() {
                    self.store(index, value, nil)?;
                }
            }
        }
        Ok(())
    }

    /// Whether `store` of `value` would succeed on a byte/word region.
    pub fn accepts(&self, value: Value) -> bool {
        match self {
            Self::Bytes(_) => Self::byte_of(value).is_ok(),
            Self::Words(_) => Self::word_of(value).is_ok(),
            _ => true,
        }
    }

    fn byte_of(value: Value) -> Result<u8, MemoryError> {
        value
            .as_small_int()
            .and_then(|n| u8::try_from(n).ok())
            .ok_or(MemoryError::NotRepresentable {
                value,
                strategy: StrategyKind::Bytes.name(),
            })
    }

    fn word_of(value: Value) -> Result<u32, MemoryError> {
        value
            .as_small_int()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or(MemoryError::NotRepresentable {
                value,
                strategy: StrategyKind::Words.name(),
            })
    }

    /// Copy every element into the `target` representation.
    pub fn transition(&mut self, target: StrategyKind, nil: Value) {
        let from = self.kind();
        if from == target {
            return;
        }
        let values = self.values(nil);
        log::trace!(
            "strategy {} -> {} ({} elements)",
            from.name(),
            target.name(),
            values.len()
        );
        *self = Self::build(target, values);
    }

    /// All elements as values, in order.
    pub fn values(&self, nil: Value) -> Vec<Value> {
        (0..self.len()).filter_map(|i| self.fetch(i, nil)).collect()
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes_mut(&mut self) -> Option<&mut Vec<u8>> {
        match self {
            Self::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_words(&self) -> Option<&[u32]> {
        match self {
            Self::Words(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_words_mut(&mut self) -> Option<&mut Vec<u32>> {
        match self {
            Self::Words(v) => Some(v),
            _ => None,
        }
    }

    /// Visit every strongly held heap reference.
    pub fn for_each_strong(&self, mut f: impl FnMut(Oop)) {
        if let Self::Pointers(v) = self {
            for value in v {
                if let Value::Object(oop) = value {
                    f(*oop);
                }
            }
        }
    }

    /// Replace weak references to dead objects with `nil`.
    pub fn clear_dead_weak(
        &mut self,
        is_live: impl Fn(Oop) -> bool,
        nil: Value,
    ) -> usize {
        let mut cleared = 0;
        if let Self::Weak(v) = self {
            for slot in v.iter_mut() {
                if let Value::Object(oop) = *slot {
                    if !is_live(oop) {
                        *slot = nil;
                        cleared += 1;
                    }
                }
            }
        }
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NIL: Value = Value::Object(Oop::from_index(0));
    const OTHER: Value = Value::Object(Oop::from_index(7));

    fn read_all(storage: &Storage) -> Vec<Value> {
        storage.values(NIL)
    }

    // ── Strategy selection ─────────────────────────────────────────

    #[test]
    fn fresh_pointer_region_is_all_nil() {
        let s = Storage::new(ObjectFormat::Indexable, 5, NIL);
        assert_eq!(s.kind(), StrategyKind::AllNil);
        assert_eq!(s.len(), 5);
        assert_eq!(read_all(&s), vec![NIL; 5]);
    }

    #[test]
    fn weak_region_starts_weak() {
        let s = Storage::new(ObjectFormat::Weak, 3, NIL);
        assert_eq!(s.kind(), StrategyKind::Weak);
    }

    #[test]
    fn from_values_picks_most_specific() {
        let ints = vec![Value::from_i64(1), NIL, Value::from_i64(3)];
        assert_eq!(
            Storage::from_values(ints, NIL).kind(),
            StrategyKind::SmallIntegerOrNil
        );

        let floats = vec![Value::Float(1.5), NIL];
        assert_eq!(Storage::from_values(floats, NIL).kind(), StrategyKind::FloatOrNil);

        let mixed = vec![Value::from_i64(1), Value::Float(2.0)];
        assert_eq!(Storage::from_values(mixed, NIL).kind(), StrategyKind::Pointers);

        assert_eq!(Storage::from_values(vec![NIL, NIL], NIL).kind(), StrategyKind::AllNil);
    }

    // ── Transitions ────────────────────────────────────────────────

    #[test]
    fn integer_write_moves_all_nil_to_small_integers() {
        let mut s = Storage::new(ObjectFormat::Indexable, 4, NIL);
        s.store(2, Value::from_i64(-9), NIL).unwrap();
        assert_eq!(s.kind(), StrategyKind::SmallIntegerOrNil);
        assert_eq!(
            read_all(&s),
            vec![NIL, NIL, Value::from_i64(-9), NIL]
        );
    }

    #[test]
    fn object_write_generalizes_and_keeps_contents() {
        let mut s = Storage::new(ObjectFormat::Indexable, 3, NIL);
        s.store(0, Value::from_i64(1), NIL).unwrap();
        s.store(1, Value::from_i64(2), NIL).unwrap();
        s.store(2, OTHER, NIL).unwrap();
        assert_eq!(s.kind(), StrategyKind::Pointers);
        assert_eq!(
            read_all(&s),
            vec![Value::from_i64(1), Value::from_i64(2), OTHER]
        );
    }

    #[test]
    fn float_then_integer_generalizes() {
        let mut s = Storage::new(ObjectFormat::Indexable, 2, NIL);
        s.store(0, Value::Float(0.25), NIL).unwrap();
        assert_eq!(s.kind(), StrategyKind::FloatOrNil);
        s.store(1, Value::from_i64(4), NIL).unwrap();
        assert_eq!(s.kind(), StrategyKind::Pointers);
        assert_eq!(read_all(&s), vec![Value::Float(0.25), Value::from_i64(4)]);
    }

    #[test]
    fn float_sentinel_value_is_not_confused_with_nil() {
        let mut s = Storage::new(ObjectFormat::Indexable, 2, NIL);
        s.store(0, Value::Float(1.0), NIL).unwrap();
        s.store(1, Value::Float(f64::MAX), NIL).unwrap();
        assert_eq!(s.kind(), StrategyKind::Pointers);
        assert_eq!(s.fetch(1, NIL), Some(Value::Float(f64::MAX)));
    }

    #[test]
    fn writing_nil_never_narrows() {
        let mut s = Storage::new(ObjectFormat::Indexable, 2, NIL);
        s.store(0, OTHER, NIL).unwrap();
        s.store(0, NIL, NIL).unwrap();
        assert_eq!(s.kind(), StrategyKind::Pointers);
        assert_eq!(read_all(&s), vec![NIL, NIL]);
    }

    #[test]
    fn random_write_sequences_read_back() {
        let samples = [
            NIL,
            Value::from_i64(0),
            Value::from_i64(-1),
            Value::Float(3.5),
            OTHER,
        ];
        let mut seed = 0x2545_f491u32;
        for _ in 0..64 {
            let mut s = Storage::new(ObjectFormat::Indexable, 6, NIL);
            let mut model = vec![NIL; 6];
            let mut written = StrategyKind::AllNil;
            for _ in 0..10 {
                seed ^= seed << 13;
                seed ^= seed >> 17;
                seed ^= seed << 5;
                let index = (seed % 6) as usize;
                let value = samples[(seed / 7 % samples.len() as u32) as usize];
                s.store(index, value, NIL).unwrap();
                model[index] = value;
                written = written.widen_for(value, NIL);
                assert_eq!(s.kind(), written);
            }
            assert_eq!(read_all(&s), model);
        }
    }

    // ── Byte and word regions ──────────────────────────────────────

    #[test]
    fn byte_region_rejects_out_of_range_without_mutation() {
        let mut s = Storage::new(ObjectFormat::Bytes { unused: 0 }, 2, NIL);
        s.store(0, Value::from_i64(200), NIL).unwrap();
        let err = s.store(0, Value::from_i64(256), NIL).unwrap_err();
        assert!(matches!(err, MemoryError::NotRepresentable { .. }));
        assert_eq!(s.fetch(0, NIL), Some(Value::from_i64(200)));
        assert!(s.store(1, OTHER, NIL).is_err());
        assert_eq!(s.kind(), StrategyKind::Bytes);
    }

    #[test]
    fn out_of_bounds_store_fails() {
        let mut s = Storage::new(ObjectFormat::Indexable, 1, NIL);
        assert_eq!(
            s.store(1, NIL, NIL),
            Err(MemoryError::IndexOutOfBounds { index: 1, size: 1 })
        );
        assert_eq!(s.kind(), StrategyKind::AllNil);
    }

    #[test]
    fn fill_words() {
        let mut s = Storage::new(ObjectFormat::Words, 3, NIL);
        s.fill(Value::from_i64(0x1234), NIL).unwrap();
        assert_eq!(s.as_words(), Some(&[0x1234u32, 0x1234, 0x1234][..]));
    }

    #[test]
    fn weak_slots_cleared_for_dead_referents() {
        let mut s = Storage::from_values(vec![OTHER, NIL], NIL);
        s.transition(StrategyKind::Weak, NIL);
        let cleared = s.clear_dead_weak(|oop| oop.index() != 7, NIL);
        assert_eq!(cleared, 1);
        assert_eq!(read_all(&s), vec![NIL, NIL]);
    }
}
