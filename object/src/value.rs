use core::fmt;

/// Smallest integer representable as an immediate SmallInteger (31-bit).
pub const SMALL_INT_MIN: i64 = -(1 << 30);
/// Largest integer representable as an immediate SmallInteger (31-bit).
pub const SMALL_INT_MAX: i64 = (1 << 30) - 1;

/// Identity of a heap object: a stable index into the object arena.
///
/// An `Oop` never changes for the lifetime of the object it names. Indices
/// are recycled only after the garbage collector frees the object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Oop(u32);

impl Oop {
    #[inline(always)]
    pub const fn from_index(index: u32) -> Self {
        Self(index)
    }

    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline(always)]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for Oop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oop(#{})", self.0)
    }
}

/// A Smalltalk value.
///
/// - **SmallInteger**: 31-bit signed immediate, no heap identity.
/// - **Float**: 64-bit immediate, compared by bit pattern.
/// - **Object**: reference to a heap record.
///
/// `PartialEq` is identity (`==` in Smalltalk): immediates compare by
/// value, heap objects by `Oop`.
#[derive(Clone, Copy)]
pub enum Value {
    SmallInteger(i64),
    Float(f64),
    Object(Oop),
}

impl Value {
    // ── SmallInteger ───────────────────────────────────────────────

    /// Wrap `n` if it fits the SmallInteger range.
    #[inline(always)]
    pub fn small_int(n: i64) -> Option<Self> {
        if (SMALL_INT_MIN..=SMALL_INT_MAX).contains(&n) {
            Some(Self::SmallInteger(n))
        } else {
            None
        }
    }

    /// Wrap `n` as a SmallInteger. The caller guarantees the range.
    #[inline(always)]
    pub fn from_i64(n: i64) -> Self {
        debug_assert!(
            (SMALL_INT_MIN..=SMALL_INT_MAX).contains(&n),
            "SmallInteger overflow: {n}"
        );
        Self::SmallInteger(n)
    }

    #[inline(always)]
    pub const fn is_small_int(self) -> bool {
        matches!(self, Self::SmallInteger(_))
    }

    #[inline(always)]
    pub const fn as_small_int(self) -> Option<i64> {
        match self {
            Self::SmallInteger(n) => Some(n),
            _ => None,
        }
    }

    // ── Float ──────────────────────────────────────────────────────

    #[inline(always)]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::Float(_))
    }

    #[inline(always)]
    pub const fn as_float(self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(f),
            _ => None,
        }
    }

    // ── Object ─────────────────────────────────────────────────────

    #[inline(always)]
    pub const fn is_object(self) -> bool {
        matches!(self, Self::Object(_))
    }

    #[inline(always)]
    pub const fn as_oop(self) -> Option<Oop> {
        match self {
            Self::Object(oop) => Some(oop),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::SmallInteger(a), Self::SmallInteger(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Object(a), Self::Object(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl From<Oop> for Value {
    fn from(oop: Oop) -> Self {
        Self::Object(oop)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SmallInteger(n) => write!(f, "SmallInteger({n})"),
            Self::Float(x) => write!(f, "Float({x})"),
            Self::Object(oop) => write!(f, "{oop:?}"),
        }
    }
}
