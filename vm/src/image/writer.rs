use std::collections::{HashMap, HashSet, VecDeque};

use object::{HeapObject, ObjectFormat, ObjectMemory, Oop, Value, special_index};

use super::{HEADER_LEN, ImageHeader, header_type};
use crate::VmError;

/// Largest size, in words including the base header, that fits the size
/// bits of a base header.
const MAX_SHORT_SIZE: usize = 63;
/// Compact class indices are five bits wide.
const MAX_COMPACT_INDEX: usize = 31;

fn put_word(out: &mut Vec<u8>, word: u32, big_endian: bool) {
    let bytes = if big_endian {
        word.to_be_bytes()
    } else {
        word.to_le_bytes()
    };
    out.extend_from_slice(&bytes);
}

/// Where one record goes and how its header is shaped.
struct Placement {
    address: u32,
    compact: usize,
    /// Extra header words before the base header.
    extra: usize,
}

/// Every reachable object in breadth-first order from the special objects
/// array, plus the addresses they and their boxed Floats receive.
struct Layout<'a> {
    memory: &'a ObjectMemory,
    order: Vec<Oop>,
    placements: HashMap<Oop, Placement>,
    float_class: Option<Oop>,
    /// Addresses of Float records, in the order their references are
    /// written.
    floats: Vec<(u32, f64)>,
    compact_classes: Vec<Option<Oop>>,
    end: u32,
}

/// Reference words of a record in file order. Methods contribute their
/// header and literals only.
fn references(object: &HeapObject, nil: Value) -> Vec<Value> {
    let mut values = object.named.clone();
    if object.storage.holds_pointers() {
        values.extend(object.storage.values(nil));
    }
    values
}

/// Body size of a record in words.
fn body_words(object: &HeapObject) -> usize {
    let named = object.named.len();
    match object.format {
        ObjectFormat::Bytes { .. } | ObjectFormat::CompiledMethod { .. } => {
            let bytes = object.bytes().map_or(0, <[u8]>::len);
            named + bytes.div_ceil(4)
        }
        _ => named + object.storage.len(),
    }
}

fn extra_header_words(size: usize, compact: usize) -> usize {
    match (size <= MAX_SHORT_SIZE, compact > 0) {
        (true, true) => 0,
        (true, false) => 1,
        (false, _) => 2,
    }
}

impl<'a> Layout<'a> {
    fn new(memory: &'a ObjectMemory, specials: Oop) -> Result<Self, VmError> {
        let nil = memory.nil();
        let special = |index: usize| {
            memory
                .fetch_indexed(specials, index)
                .ok()
                .and_then(Value::as_oop)
                .filter(|oop| Value::Object(*oop) != nil)
        };
        let float_class = special(special_index::CLASS_FLOAT);
        let compact_classes = match special(special_index::COMPACT_CLASSES) {
            Some(table) => memory
                .object(table)?
                .storage
                .values(nil)
                .into_iter()
                .take(MAX_COMPACT_INDEX)
                .map(Value::as_oop)
                .collect(),
            None => Vec::new(),
        };

        let mut order = Vec::new();
        let mut seen = HashSet::from([specials]);
        let mut queue = VecDeque::from([specials]);
        let mut float_count = 0usize;
        while let Some(oop) = queue.pop_front() {
            let object = memory.object(oop)?;
            order.push(oop);
            let mut visit = |target: Oop| {
                if seen.insert(target) {
                    queue.push_back(target);
                }
            };
            visit(object.class);
            for value in references(object, nil) {
                match value {
                    Value::Object(target) => visit(target),
                    Value::Float(_) => float_count += 1,
                    Value::SmallInteger(_) => {}
                }
            }
        }
        if float_count > 0 && float_class.is_none() {
            return Err(VmError::invariant("Floats are reachable but there is no Float class"));
        }

        let mut layout = Self {
            memory,
            order,
            placements: HashMap::new(),
            float_class,
            floats: Vec::with_capacity(float_count),
            compact_classes,
            end: 0,
        };
        layout.place(nil)?;
        Ok(layout)
    }

    fn placement(&self, oop: Oop) -> Result<&Placement, VmError> {
        self.placements
            .get(&oop)
            .ok_or_else(|| VmError::invariant(format!("{oop:?} was not laid out")))
    }

    fn compact_index(&self, class: Oop) -> usize {
        self.compact_classes
            .iter()
            .position(|c| *c == Some(class))
            .map_or(0, |i| i + 1)
    }

    /// Assign addresses, relative to the start of the body.
    fn place(&mut self, nil: Value) -> Result<(), VmError> {
        let mut offset = 0usize;
        for &oop in &self.order {
            let object = self.memory.object(oop)?;
            let compact = self.compact_index(object.class);
            let extra = extra_header_words(body_words(object) + 1, compact);
            let address = offset + extra * 4;
            offset = address + (body_words(object) + 1) * 4;
            self.placements.insert(
                oop,
                Placement { address: address as u32, compact, extra },
            );
        }
        let float_extra = match self.float_class {
            Some(class) => extra_header_words(3, self.compact_index(class)),
            None => 1,
        };
        for &oop in &self.order {
            for value in references(self.memory.object(oop)?, nil) {
                if let Value::Float(f) = value {
                    let address = offset + float_extra * 4;
                    offset = address + 12;
                    self.floats.push((address as u32, f));
                }
            }
        }
        self.end = u32::try_from(offset)
            .map_err(|_| VmError::invariant("object graph does not fit a 32-bit image"))?;
        Ok(())
    }
}

/// Emits records with absolute addresses.
struct Emitter<'a> {
    layout: &'a Layout<'a>,
    header: &'a ImageHeader,
    out: Vec<u8>,
    next_float: usize,
}

impl Emitter<'_> {
    fn word(&mut self, word: u32) {
        put_word(&mut self.out, word, self.header.big_endian);
    }

    fn address_of(&self, oop: Oop) -> Result<u32, VmError> {
        Ok(self.header.old_base + self.layout.placement(oop)?.address)
    }

    fn reference(&mut self, value: Value) -> Result<u32, VmError> {
        match value {
            Value::SmallInteger(n) => Ok(((n as i32) << 1) as u32 | 1),
            Value::Object(oop) => self.address_of(oop),
            Value::Float(_) => {
                let (address, _) = self
                    .layout
                    .floats
                    .get(self.next_float)
                    .ok_or_else(|| VmError::invariant("Float records out of step"))?;
                self.next_float += 1;
                Ok(self.header.old_base + address)
            }
        }
    }

    fn record_header(
        &mut self,
        class: Oop,
        placement: &Placement,
        format: u8,
        hash: u32,
        size: usize,
    ) -> Result<(), VmError> {
        let tag = match placement.extra {
            0 => header_type::SHORT,
            1 => header_type::CLASS,
            _ => header_type::SIZE_AND_CLASS,
        };
        if placement.extra == 2 {
            self.word(((size * 4) as u32) | tag);
        }
        if placement.extra >= 1 {
            let class = self.address_of(class)?;
            self.word(class | tag);
        }
        let size_bits = if size <= MAX_SHORT_SIZE { size as u32 } else { 0 };
        self.word(
            tag | (size_bits << 2)
                | ((format as u32 & 0xF) << 8)
                | ((placement.compact as u32 & 0x1F) << 12)
                | ((hash & 0xFFF) << 17),
        );
        Ok(())
    }

    fn raw_bytes(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
        let padding = (4 - bytes.len() % 4) % 4;
        self.out.resize(self.out.len() + padding, 0);
    }

    fn object(&mut self, oop: Oop, nil: Value) -> Result<(), VmError> {
        let layout = self.layout;
        let object = layout.memory.object(oop)?;
        let placement = layout.placement(oop)?;
        let size = body_words(object) + 1;
        let format = match object.format {
            ObjectFormat::Bytes { .. } | ObjectFormat::CompiledMethod { .. } => {
                let len = object.bytes().map_or(0, <[u8]>::len);
                object.format.with_byte_len(len)
            }
            other => other,
        };
        self.record_header(object.class, placement, format.code(), object.hash, size)?;
        for value in references(object, nil) {
            let word = self.reference(value)?;
            self.word(word);
        }
        if let Some(words) = object.words() {
            for &word in words {
                self.word(word);
            }
        }
        if let Some(bytes) = object.bytes() {
            self.raw_bytes(bytes);
        }
        Ok(())
    }

    fn float(&mut self, value: f64) -> Result<(), VmError> {
        let class = self
            .layout
            .float_class
            .ok_or_else(|| VmError::invariant("no Float class"))?;
        let compact = self.layout.compact_index(class);
        let placement = Placement {
            address: 0,
            compact,
            extra: extra_header_words(3, compact),
        };
        self.record_header(class, &placement, ObjectFormat::Words.code(), 0, 3)?;
        let bits = value.to_bits();
        let (high, low) = ((bits >> 32) as u32, bits as u32);
        if self.header.floats_low_word_first() {
            self.word(low);
            self.word(high);
        } else {
            self.word(high);
            self.word(low);
        }
        Ok(())
    }
}

/// Serialise every object reachable from `specials` as a snapshot with
/// the byte order and version in `header`.
pub fn write_image(
    memory: &ObjectMemory,
    specials: Oop,
    header: &ImageHeader,
) -> Result<Vec<u8>, VmError> {
    let layout = Layout::new(memory, specials)?;
    let nil = memory.nil();
    let header = ImageHeader {
        header_size: HEADER_LEN,
        end_of_memory: layout.end,
        special_objects: header.old_base + layout.placement(specials)?.address,
        last_hash: memory.last_hash(),
        ..header.clone()
    };

    let mut emitter = Emitter {
        layout: &layout,
        header: &header,
        out: Vec::with_capacity(HEADER_LEN as usize + layout.end as usize),
        next_float: 0,
    };
    for word in [
        header.version,
        header.header_size,
        header.end_of_memory,
        header.old_base,
        header.special_objects,
        header.last_hash,
        header.saved_window_size,
        header.full_screen as u32,
        header.extra_vm_memory,
    ] {
        emitter.word(word);
    }
    emitter.out.resize(HEADER_LEN as usize, 0);

    for &oop in &layout.order {
        emitter.object(oop, nil)?;
    }
    for &(_, value) in &layout.floats {
        emitter.float(value)?;
    }
    log::debug!(
        "wrote {} objects and {} floats, {} bytes",
        layout.order.len(),
        layout.floats.len(),
        emitter.out.len()
    );
    Ok(emitter.out)
}
