use std::collections::HashMap;

use object::layout::class;
use object::{
    ClassShape, HeapObject, ObjectFormat, ObjectMemory, Oop, Storage, Value, special_index,
};

use super::{ImageHeader, LoadedImage, PREFIX_LEN, SUPPORTED_VERSIONS, header_type};
use crate::VmError;

/// Nine header words are always present.
const MIN_HEADER_LEN: u32 = 36;

/// Where a record's class comes from.
#[derive(Debug, Clone, Copy)]
enum ClassRef {
    Address(u32),
    Compact(usize),
}

/// An object record as laid out in the file, before any reference is
/// resolved.
#[derive(Debug)]
struct RawObject {
    address: u32,
    class: ClassRef,
    format: u8,
    hash: u32,
    /// Byte offset of the first body word in the file.
    body: usize,
    body_words: usize,
}

/// Bounds-checked access to the snapshot bytes in one byte order.
struct Words<'a> {
    bytes: &'a [u8],
    big_endian: bool,
}

impl Words<'_> {
    fn at(&self, offset: usize) -> Result<u32, VmError> {
        let chunk = offset
            .checked_add(4)
            .and_then(|end| self.bytes.get(offset..end))
            .ok_or_else(|| VmError::corrupt(format!("image ends inside the word at {offset}")))?;
        let word = [chunk[0], chunk[1], chunk[2], chunk[3]];
        Ok(if self.big_endian {
            u32::from_be_bytes(word)
        } else {
            u32::from_le_bytes(word)
        })
    }

    fn raw(&self, offset: usize, len: usize) -> Result<&[u8], VmError> {
        offset
            .checked_add(len)
            .and_then(|end| self.bytes.get(offset..end))
            .ok_or_else(|| VmError::corrupt("image ends inside an object body"))
    }
}

/// Find the header: at the start of the file or after a 512-byte prefix,
/// in either byte order.
fn locate_header(bytes: &[u8]) -> Result<(usize, bool), VmError> {
    for start in [0, PREFIX_LEN] {
        let Some(chunk) = bytes.get(start..start + 4) else {
            continue;
        };
        let word = [chunk[0], chunk[1], chunk[2], chunk[3]];
        if SUPPORTED_VERSIONS.contains(&u32::from_le_bytes(word)) {
            return Ok((start, false));
        }
        if SUPPORTED_VERSIONS.contains(&u32::from_be_bytes(word)) {
            return Ok((start, true));
        }
    }
    Err(VmError::corrupt("unrecognised image version"))
}

fn read_header(words: &Words<'_>, start: usize) -> Result<ImageHeader, VmError> {
    let field = |index: usize| words.at(start + index * 4);
    let header = ImageHeader {
        version: field(0)?,
        big_endian: words.big_endian,
        header_size: field(1)?,
        end_of_memory: field(2)?,
        old_base: field(3)?,
        special_objects: field(4)?,
        last_hash: field(5)?,
        saved_window_size: field(6)?,
        full_screen: field(7)? != 0,
        extra_vm_memory: field(8)?,
    };
    if header.header_size < MIN_HEADER_LEN {
        return Err(VmError::corrupt(format!("header size {} is too small", header.header_size)));
    }
    Ok(header)
}

/// First pass: walk the body and record where every object lives.
fn scan_objects(
    words: &Words<'_>,
    body_start: usize,
    header: &ImageHeader,
) -> Result<Vec<RawObject>, VmError> {
    let body_end = body_start + header.end_of_memory as usize;
    if words.bytes.len() < body_end {
        return Err(VmError::corrupt(format!(
            "image body is {} bytes, header promises {}",
            words.bytes.len() - body_start.min(words.bytes.len()),
            header.end_of_memory
        )));
    }
    let mut objects = Vec::new();
    let mut offset = body_start;
    while offset < body_end {
        let first = words.at(offset)?;
        let (base_offset, class, size_bytes) = match first & 3 {
            header_type::FREE => {
                let size = (first & !3) as usize;
                if size == 0 {
                    return Err(VmError::corrupt(format!("empty free chunk at {offset}")));
                }
                offset += size;
                continue;
            }
            header_type::SIZE_AND_CLASS => {
                let class = words.at(offset + 4)?;
                (offset + 8, Some(class & !3), Some((first & !3) as usize))
            }
            header_type::CLASS => (offset + 4, Some(first & !3), None),
            _ => (offset, None, None),
        };
        let base = words.at(base_offset)?;
        let format = ((base >> 8) & 0xF) as u8;
        let compact = ((base >> 12) & 0x1F) as usize;
        let hash = (base >> 17) & 0xFFF;
        let size_words = match size_bytes {
            Some(bytes) => bytes / 4,
            None => ((base >> 2) & 0x3F) as usize,
        };
        if size_words == 0 {
            return Err(VmError::corrupt(format!("object at {base_offset} has no size")));
        }
        let class = match class {
            Some(address) => ClassRef::Address(address),
            None if compact > 0 => ClassRef::Compact(compact),
            None => {
                return Err(VmError::corrupt(format!(
                    "short header at {base_offset} without a compact class"
                )));
            }
        };
        objects.push(RawObject {
            address: header.old_base + (base_offset - body_start) as u32,
            class,
            format,
            hash,
            body: base_offset + 4,
            body_words: size_words - 1,
        });
        offset = base_offset + size_words * 4;
        if offset > body_end {
            return Err(VmError::corrupt("last object runs past the end of memory"));
        }
    }
    Ok(objects)
}

/// Second pass state: every record is known, references can resolve.
struct Linker<'a> {
    words: Words<'a>,
    header: &'a ImageHeader,
    raw: Vec<RawObject>,
    /// Record address to record position.
    by_address: HashMap<u32, usize>,
    /// Record position to arena index; Float records have none.
    index_of: Vec<Option<u32>>,
    compact_classes: Vec<u32>,
    float_class: Option<u32>,
}

impl Linker<'_> {
    fn record(&self, address: u32) -> Result<&RawObject, VmError> {
        self.by_address
            .get(&address)
            .map(|&i| &self.raw[i])
            .ok_or_else(|| VmError::corrupt(format!("reference to {address:#x} is not an object")))
    }

    fn body_word(&self, object: &RawObject, index: usize) -> Result<u32, VmError> {
        if index >= object.body_words {
            return Err(VmError::corrupt(format!(
                "object {:#x} has no field {index}",
                object.address
            )));
        }
        self.words.at(object.body + index * 4)
    }

    fn class_address(&self, object: &RawObject) -> Result<u32, VmError> {
        match object.class {
            ClassRef::Address(address) => Ok(address),
            ClassRef::Compact(index) => self
                .compact_classes
                .get(index - 1)
                .copied()
                .filter(|word| word & 1 == 0)
                .ok_or_else(|| VmError::corrupt(format!("no compact class {index}"))),
        }
    }

    fn is_float(&self, object: &RawObject) -> Result<bool, VmError> {
        Ok(object.format == ObjectFormat::Words.code()
            && object.body_words == 2
            && Some(self.class_address(object)?) == self.float_class)
    }

    fn float_value(&self, object: &RawObject) -> Result<f64, VmError> {
        let (first, second) = (self.body_word(object, 0)?, self.body_word(object, 1)?);
        let (high, low) = if self.header.floats_low_word_first() {
            (second, first)
        } else {
            (first, second)
        };
        Ok(f64::from_bits(((high as u64) << 32) | low as u64))
    }

    fn resolve(&self, word: u32) -> Result<Value, VmError> {
        if word & 1 == 1 {
            return Ok(Value::SmallInteger(((word as i32) >> 1) as i64));
        }
        let position = *self
            .by_address
            .get(&word)
            .ok_or_else(|| VmError::corrupt(format!("reference to {word:#x} is not an object")))?;
        match self.index_of[position] {
            Some(index) => Ok(Value::Object(Oop::from_index(index))),
            None => Ok(Value::Float(self.float_value(&self.raw[position])?)),
        }
    }

    fn resolve_oop(&self, word: u32) -> Result<Oop, VmError> {
        self.resolve(word)?
            .as_oop()
            .ok_or_else(|| VmError::corrupt(format!("{word:#x} must be an object")))
    }

    /// Named field count of pointer instances of the class at `address`.
    fn fixed_fields(&self, address: u32) -> Result<usize, VmError> {
        let class = self.record(address)?;
        let format = self.body_word(class, class::FORMAT)?;
        if format & 1 == 0 {
            return Err(VmError::corrupt(format!("class {address:#x} has no format word")));
        }
        let shape = ClassShape::decode(((format as i32) >> 1) as i64)
            .ok_or_else(|| VmError::corrupt(format!("class {address:#x} has a bad format")))?;
        Ok(shape.fixed_fields)
    }

    fn pointer_values(&self, object: &RawObject, range: std::ops::Range<usize>) -> Result<Vec<Value>, VmError> {
        range
            .map(|i| self.body_word(object, i).and_then(|word| self.resolve(word)))
            .collect()
    }

    fn link(&self, object: &RawObject, nil: Value) -> Result<HeapObject, VmError> {
        let class_address = self.class_address(object)?;
        let class = self.resolve_oop(class_address)?;
        let format = ObjectFormat::from_code(object.format).ok_or_else(|| {
            VmError::corrupt(format!("object {:#x} has format {}", object.address, object.format))
        })?;
        let len = object.body_words;
        let (named, storage) = match format {
            ObjectFormat::NoFields | ObjectFormat::Fixed => {
                (self.pointer_values(object, 0..len)?, Storage::empty())
            }
            ObjectFormat::Indexable => {
                let values = self.pointer_values(object, 0..len)?;
                (Vec::new(), Storage::from_values(values, nil))
            }
            ObjectFormat::FixedIndexable | ObjectFormat::Weak => {
                let fixed = self.fixed_fields(class_address)?;
                if fixed > len {
                    return Err(VmError::corrupt(format!(
                        "object {:#x} is smaller than its {fixed} fixed fields",
                        object.address
                    )));
                }
                let named = self.pointer_values(object, 0..fixed)?;
                let values = self.pointer_values(object, fixed..len)?;
                let storage = if format == ObjectFormat::Weak {
                    Storage::Weak(values)
                } else {
                    Storage::from_values(values, nil)
                };
                (named, storage)
            }
            ObjectFormat::Words => {
                let words = (0..len)
                    .map(|i| self.body_word(object, i))
                    .collect::<Result<Vec<u32>, _>>()?;
                (Vec::new(), Storage::Words(words))
            }
            ObjectFormat::Bytes { unused } => {
                let count = (len * 4)
                    .checked_sub(unused as usize)
                    .ok_or_else(|| VmError::corrupt("byte object shorter than its padding"))?;
                let bytes = self.words.raw(object.body, count)?.to_vec();
                (Vec::new(), Storage::Bytes(bytes))
            }
            ObjectFormat::CompiledMethod { unused } => {
                let header_word = self.body_word(object, 0)?;
                if header_word & 1 == 0 {
                    return Err(VmError::corrupt(format!(
                        "method {:#x} has no header",
                        object.address
                    )));
                }
                let literals = ((header_word >> 10) & 0xFF) as usize;
                let pointers = literals + 1;
                let count = (len * 4)
                    .checked_sub(pointers * 4 + unused as usize)
                    .ok_or_else(|| VmError::corrupt("method literals overrun its body"))?;
                let named = self.pointer_values(object, 0..pointers)?;
                let bytes = self.words.raw(object.body + pointers * 4, count)?.to_vec();
                (named, Storage::Bytes(bytes))
            }
        };
        Ok(HeapObject {
            class,
            hash: object.hash,
            format,
            named,
            storage,
        })
    }
}

/// Parse and link a complete snapshot. No object is visible until the
/// whole graph has been resolved.
pub fn read_image(bytes: &[u8]) -> Result<LoadedImage, VmError> {
    let (start, big_endian) = locate_header(bytes)?;
    let words = Words { bytes, big_endian };
    let header = read_header(&words, start)?;
    let body_start = start + header.header_size as usize;
    let raw = scan_objects(&words, body_start, &header)?;

    let by_address: HashMap<u32, usize> = raw
        .iter()
        .enumerate()
        .map(|(i, object)| (object.address, i))
        .collect();
    let mut linker = Linker {
        words,
        header: &header,
        raw,
        by_address,
        index_of: Vec::new(),
        compact_classes: Vec::new(),
        float_class: None,
    };

    let specials = linker.record(header.special_objects)?;
    let special_word = |index: usize| {
        (index < specials.body_words)
            .then(|| linker.body_word(specials, index))
            .transpose()
    };
    let float_class = special_word(special_index::CLASS_FLOAT)?;
    let compact_table = special_word(special_index::COMPACT_CLASSES)?;
    let nil_word = special_word(special_index::NIL)?
        .ok_or_else(|| VmError::corrupt("special objects array is empty"))?;
    let compact_classes = match compact_table {
        Some(address) if address & 1 == 0 => {
            let table = linker.record(address)?;
            (0..table.body_words)
                .map(|i| linker.body_word(table, i))
                .collect::<Result<Vec<_>, _>>()?
        }
        _ => Vec::new(),
    };
    linker.float_class = float_class;
    linker.compact_classes = compact_classes;

    let mut next = 0u32;
    let mut index_of = Vec::with_capacity(linker.raw.len());
    for object in &linker.raw {
        if linker.is_float(object)? {
            index_of.push(None);
        } else {
            index_of.push(Some(next));
            next += 1;
        }
    }
    linker.index_of = index_of;

    let nil = linker.resolve(nil_word)?;
    let mut objects = Vec::with_capacity(next as usize);
    for (position, object) in linker.raw.iter().enumerate() {
        if linker.index_of[position].is_some() {
            objects.push(linker.link(object, nil)?);
        }
    }
    let nil = nil
        .as_oop()
        .ok_or_else(|| VmError::corrupt("nil is not an object"))?;
    let specials = linker.resolve_oop(header.special_objects)?;
    let floats = linker.raw.len() - objects.len();

    let memory = ObjectMemory::from_objects(objects, nil, header.last_hash);
    log::info!(
        "read {} objects ({} floats made immediate), version {}, {}",
        memory.live_count(),
        floats,
        header.version,
        if header.big_endian { "big endian" } else { "little endian" }
    );
    Ok(LoadedImage { memory, specials, header })
}
