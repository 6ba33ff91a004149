/// Physical layout code stored in every object header.
///
/// Codes follow the V3 snapshot encoding:
/// `0` no fields, `1` fixed pointers, `2` indexable pointers,
/// `3` fixed + indexable pointers, `4` weak, `6` 32-bit words,
/// `8..=11` bytes, `12..=15` compiled method. For the byte formats the
/// low two bits count unused trailing bytes in the last word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectFormat {
    NoFields,
    Fixed,
    Indexable,
    FixedIndexable,
    Weak,
    Words,
    Bytes { unused: u8 },
    CompiledMethod { unused: u8 },
}

/// Representation families that `become:` and class changes must respect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Pointers,
    Words,
    Bytes,
    Method,
}

impl ObjectFormat {
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::NoFields,
            1 => Self::Fixed,
            2 => Self::Indexable,
            3 => Self::FixedIndexable,
            4 => Self::Weak,
            6 => Self::Words,
            8..=11 => Self::Bytes { unused: code & 3 },
            12..=15 => Self::CompiledMethod { unused: code & 3 },
            _ => return None,
        })
    }

    pub const fn code(self) -> u8 {
        match self {
            Self::NoFields => 0,
            Self::Fixed => 1,
            Self::Indexable => 2,
            Self::FixedIndexable => 3,
            Self::Weak => 4,
            Self::Words => 6,
            Self::Bytes { unused } => 8 | (unused & 3),
            Self::CompiledMethod { unused } => 12 | (unused & 3),
        }
    }

    pub const fn is_pointers(self) -> bool {
        matches!(
            self,
            Self::NoFields
                | Self::Fixed
                | Self::Indexable
                | Self::FixedIndexable
                | Self::Weak
        )
    }

    pub const fn is_indexable(self) -> bool {
        !matches!(self, Self::NoFields | Self::Fixed)
    }

    pub const fn is_bytes(self) -> bool {
        matches!(self, Self::Bytes { .. })
    }

    pub const fn family(self) -> Family {
        match self {
            Self::Words => Family::Words,
            Self::Bytes { .. } => Family::Bytes,
            Self::CompiledMethod { .. } => Family::Method,
            _ => Family::Pointers,
        }
    }

    /// The format an instance carries once its indexable size is known.
    ///
    /// Byte formats record the padding of the final word.
    pub const fn with_byte_len(self, len: usize) -> Self {
        let unused = ((4 - (len % 4)) % 4) as u8;
        match self {
            Self::Bytes { .. } => Self::Bytes { unused },
            Self::CompiledMethod { .. } => Self::CompiledMethod { unused },
            other => other,
        }
    }
}

/// Instance layout described by the format word of a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassShape {
    pub inst_spec: ObjectFormat,
    pub fixed_fields: usize,
}

impl ClassShape {
    pub const fn new(inst_spec: ObjectFormat, fixed_fields: usize) -> Self {
        Self { inst_spec, fixed_fields }
    }

    /// Decode a Behavior `format` SmallInteger.
    pub fn decode(word: i64) -> Option<Self> {
        let spec = ObjectFormat::from_code(((word >> 7) & 0xF) as u8)?;
        let size = (((word >> 10) & 0xC0) + ((word >> 1) & 0x3F)) as usize;
        Some(Self {
            inst_spec: spec,
            fixed_fields: size.saturating_sub(1),
        })
    }

    pub fn encode(self) -> i64 {
        let size = (self.fixed_fields + 1) as i64;
        ((size & 0xC0) << 10)
            | ((self.inst_spec.code() as i64) << 7)
            | ((size & 0x3F) << 1)
    }

    /// Whether instances of `self` may adopt the class `other` in place.
    pub fn compatible_with(self, other: ClassShape) -> bool {
        self.fixed_fields == other.fixed_fields
            && self.inst_spec.family() == other.inst_spec.family()
            && self.inst_spec.is_indexable() == other.inst_spec.is_indexable()
    }
}
