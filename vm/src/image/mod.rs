//! Squeak V3 32-bit snapshots.

mod reader;
mod writer;

use std::path::Path;

use object::layout::process;
use object::{ObjectMemory, Oop, Value};

use crate::{VM, VmError};

pub use reader::read_image;
pub use writer::write_image;

/// Pre-closure image format.
pub const VERSION_V3: u32 = 6502;
/// Closure bytecodes, Float words high word first.
pub const VERSION_CLOSURES: u32 = 6504;
/// Closure bytecodes, Float words in the image's byte order.
pub const VERSION_CLOSURES_NATIVE_FLOATS: u32 = 6505;

pub const SUPPORTED_VERSIONS: [u32; 3] = [VERSION_V3, VERSION_CLOSURES, VERSION_CLOSURES_NATIVE_FLOATS];

/// Bytes some platforms prepend to the header.
pub(crate) const PREFIX_LEN: usize = 512;
pub(crate) const HEADER_LEN: u32 = 64;

/// Object header type tags (low two bits of each header word).
pub(crate) mod header_type {
    pub const SIZE_AND_CLASS: u32 = 0;
    pub const CLASS: u32 = 1;
    pub const FREE: u32 = 2;
    pub const SHORT: u32 = 3;
}

/// Fixed header of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    pub version: u32,
    pub big_endian: bool,
    pub header_size: u32,
    /// Size of the object body in bytes.
    pub end_of_memory: u32,
    /// Address the first object had when the image was saved.
    pub old_base: u32,
    /// Address of the special objects array.
    pub special_objects: u32,
    pub last_hash: u32,
    /// Width in the high half, height in the low half.
    pub saved_window_size: u32,
    pub full_screen: bool,
    pub extra_vm_memory: u32,
}

impl Default for ImageHeader {
    fn default() -> Self {
        Self {
            version: VERSION_CLOSURES,
            big_endian: false,
            header_size: HEADER_LEN,
            end_of_memory: 0,
            old_base: 0x1000,
            special_objects: 0,
            last_hash: 0,
            saved_window_size: (640 << 16) | 480,
            full_screen: false,
            extra_vm_memory: 0,
        }
    }
}

impl ImageHeader {
    pub fn window_size(&self) -> (u32, u32) {
        (self.saved_window_size >> 16, self.saved_window_size & 0xFFFF)
    }

    /// Whether Float objects store their low word first.
    pub(crate) fn floats_low_word_first(&self) -> bool {
        self.version == VERSION_CLOSURES_NATIVE_FLOATS && !self.big_endian
    }
}

/// A fully linked object graph read from a snapshot.
pub struct LoadedImage {
    pub memory: ObjectMemory,
    /// The special objects array.
    pub specials: Oop,
    pub header: ImageHeader,
}

impl VM {
    /// Snapshot the reachable object graph to `path`. The active process
    /// resumes in its current context when the file is loaded.
    pub fn save_image(&mut self, path: &Path) -> Result<(), VmError> {
        self.flush_registers()?;
        let active = self.active_process()?;
        let nil = self.nil();
        let ctx = self.state.context.map_or(nil, Value::Object);
        self.memory.store(active, process::SUSPENDED_CONTEXT, ctx)?;
        let written = write_image(&self.memory, self.special.array, &self.header);
        self.memory.store(active, process::SUSPENDED_CONTEXT, nil)?;
        let bytes = written?;
        std::fs::write(path, &bytes)?;
        log::info!("saved {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytecode::{BytecodeBuilder, Constant};
    use object::{ClassShape, ObjectFormat, StrategyKind, special_index};

    use super::*;
    use crate::special::{MethodDef, bootstrap};
    use crate::{Exit, VmConfig};

    const OLD_BASE: u32 = 0x2000;

    /// A body word of a hand-assembled object.
    enum W {
        Int(i32),
        Ref(usize),
        Raw(u32),
    }

    struct Obj {
        class: usize,
        format: u8,
        body: Vec<W>,
    }

    /// Lay `objects` out with two-word headers, as a snapshot whose
    /// special objects array is `objects[specials]`.
    fn assemble(objects: &[Obj], specials: usize, version: u32, big_endian: bool) -> Vec<u8> {
        let mut addresses = Vec::new();
        let mut offset = 0u32;
        for object in objects {
            addresses.push(OLD_BASE + offset + 4);
            offset += (object.body.len() as u32 + 2) * 4;
        }
        let mut out = Vec::new();
        let put = |out: &mut Vec<u8>, word: u32| {
            if big_endian {
                out.extend_from_slice(&word.to_be_bytes());
            } else {
                out.extend_from_slice(&word.to_le_bytes());
            }
        };
        for word in [version, HEADER_LEN, offset, OLD_BASE, addresses[specials], 0, 0, 0, 0] {
            put(&mut out, word);
        }
        out.resize(HEADER_LEN as usize, 0);
        for (i, object) in objects.iter().enumerate() {
            put(&mut out, addresses[object.class] | header_type::CLASS);
            let size = object.body.len() as u32 + 1;
            let hash = i as u32 + 1;
            put(
                &mut out,
                header_type::CLASS | (size << 2) | ((object.format as u32) << 8) | (hash << 17),
            );
            for word in &object.body {
                let raw = match *word {
                    W::Int(n) => ((n << 1) | 1) as u32,
                    W::Ref(target) => addresses[target],
                    W::Raw(raw) => raw,
                };
                put(&mut out, raw);
            }
        }
        out
    }

    /// Specials, a class, nil, an instance with one fixed field and a
    /// Float that the instance references before it is defined.
    fn small_image(float_words: [u32; 2]) -> Vec<Obj> {
        let mut specials = vec![W::Ref(2)];
        specials.extend((1..special_index::CLASS_FLOAT).map(|_| W::Int(0)));
        specials.push(W::Ref(1));
        let format = ClassShape::new(ObjectFormat::FixedIndexable, 1).encode() as i32;
        vec![
            Obj { class: 1, format: 2, body: specials },
            Obj { class: 1, format: 1, body: vec![W::Ref(2), W::Ref(2), W::Int(format)] },
            Obj { class: 1, format: 0, body: vec![] },
            Obj { class: 1, format: 3, body: vec![W::Ref(4), W::Int(5), W::Ref(2)] },
            Obj {
                class: 1,
                format: 6,
                body: float_words.into_iter().map(W::Raw).collect(),
            },
        ]
    }

    fn check_small_image(loaded: &LoadedImage) {
        let memory = &loaded.memory;
        assert_eq!(memory.live_count(), 4);
        let nil = memory.fetch_indexed(loaded.specials, special_index::NIL).unwrap();
        assert_eq!(memory.nil(), nil);
        let instance = memory.object(Oop::from_index(3)).unwrap();
        assert_eq!(instance.named, vec![Value::Float(1.5)]);
        assert_eq!(instance.storage.values(nil), vec![Value::from_i64(5), nil]);
        assert_eq!(instance.storage.kind(), StrategyKind::SmallIntegerOrNil);
        assert_eq!(instance.hash, 4);
    }

    const ONE_AND_A_HALF: [u32; 2] = [0x3FF8_0000, 0];

    #[test]
    fn forward_references_and_floats_resolve() {
        let bytes = assemble(&small_image(ONE_AND_A_HALF), 0, VERSION_CLOSURES, false);
        let loaded = read_image(&bytes).unwrap();
        check_small_image(&loaded);
        assert_eq!(loaded.header.old_base, OLD_BASE);
        assert!(!loaded.header.big_endian);
    }

    #[test]
    fn byte_order_and_prefix_are_detected() {
        let bytes = assemble(&small_image(ONE_AND_A_HALF), 0, VERSION_CLOSURES, true);
        let loaded = read_image(&bytes).unwrap();
        assert!(loaded.header.big_endian);
        check_small_image(&loaded);

        let mut prefixed = vec![0u8; PREFIX_LEN];
        prefixed.extend(assemble(&small_image(ONE_AND_A_HALF), 0, VERSION_V3, false));
        check_small_image(&read_image(&prefixed).unwrap());
    }

    #[test]
    fn native_float_order_swaps_words() {
        let [high, low] = ONE_AND_A_HALF;
        let bytes = assemble(
            &small_image([low, high]),
            0,
            VERSION_CLOSURES_NATIVE_FLOATS,
            false,
        );
        check_small_image(&read_image(&bytes).unwrap());
    }

    fn is_corrupt(bytes: &[u8]) -> bool {
        matches!(read_image(bytes), Err(VmError::CorruptImage(_)))
    }

    #[test]
    fn malformed_images_are_rejected() {
        assert!(is_corrupt(&assemble(&small_image(ONE_AND_A_HALF), 0, 1234, false)));
        assert!(is_corrupt(&[]));

        let mut truncated = assemble(&small_image(ONE_AND_A_HALF), 0, VERSION_CLOSURES, false);
        truncated.truncate(truncated.len() - 4);
        assert!(is_corrupt(&truncated));

        let mut dangling = small_image(ONE_AND_A_HALF);
        dangling[3].body[2] = W::Raw(OLD_BASE + 8);
        assert!(is_corrupt(&assemble(&dangling, 0, VERSION_CLOSURES, false)));

        let mut unknown_format = small_image(ONE_AND_A_HALF);
        unknown_format[3].format = 5;
        assert!(is_corrupt(&assemble(&unknown_format, 0, VERSION_CLOSURES, false)));
    }

    #[test]
    fn bootstrap_image_survives_a_round_trip() {
        let mut vm = bootstrap(VmConfig::default());
        let text = Value::Object(vm.new_string("snapshot"));
        let extras = vm.new_array(vec![Value::Float(2.25), text, Value::from_i64(-3)]);
        vm.memory
            .store_indexed(vm.special.array, special_index::EXTERNAL_OBJECTS, Value::Object(extras))
            .unwrap();

        for (version, big_endian) in [
            (VERSION_CLOSURES, false),
            (VERSION_CLOSURES_NATIVE_FLOATS, false),
            (VERSION_CLOSURES_NATIVE_FLOATS, true),
        ] {
            let header = ImageHeader { version, big_endian, ..ImageHeader::default() };
            let bytes = write_image(&vm.memory, vm.special.array, &header).unwrap();
            let loaded = read_image(&bytes).unwrap();
            assert_eq!(loaded.header.version, version);
            assert_eq!(loaded.header.big_endian, big_endian);
            assert_eq!(loaded.header.last_hash, vm.memory.last_hash());

            let mut reloaded =
                VM::from_image(loaded.memory, loaded.specials, loaded.header, VmConfig::default())
                    .unwrap();
            assert_eq!(reloaded.class_name(reloaded.special.class_array), "Array");
            let extras = reloaded
                .special
                .get(&reloaded.memory, special_index::EXTERNAL_OBJECTS)
                .as_oop()
                .unwrap();
            let nil = reloaded.nil();
            let values = reloaded.memory.object(extras).unwrap().storage.values(nil);
            assert_eq!(values[0], Value::Float(2.25));
            assert_eq!(reloaded.memory.string_of(values[1]).as_deref(), Some("snapshot"));
            assert_eq!(values[2], Value::from_i64(-3));

            let sum = reloaded.send_message(Value::from_i64(3), "+", &[Value::from_i64(4)]);
            assert_eq!(sum.unwrap(), Exit::Returned(Value::from_i64(7)));
        }
    }

    #[test]
    fn saved_process_boots_where_it_stopped() {
        let mut vm = bootstrap(VmConfig::default());
        let object = vm.global("Object").unwrap();
        let mut code = BytecodeBuilder::new();
        code.return_constant(Constant::True);
        let method = vm.define_method(object, "resumeHere", MethodDef::new(code));
        let header = vm.method_header(method).unwrap();
        let nil = vm.nil();
        let ctx = vm.new_context(method, nil, nil, nil, header.initial_pc(), 0).unwrap();
        vm.load_context(ctx).unwrap();

        let path = std::env::temp_dir().join(format!("sqvm-boot-{}.image", std::process::id()));
        vm.save_image(&path).unwrap();
        let active = vm.active_process().unwrap();
        assert_eq!(vm.memory.fetch(active, process::SUSPENDED_CONTEXT).unwrap(), nil);

        let booted = VM::load(&path, VmConfig::default());
        std::fs::remove_file(&path).unwrap();
        let booted = booted.unwrap();
        let resumed = booted.state.method.unwrap();
        assert_eq!(booted.method_header(resumed).unwrap(), header);
        assert_eq!(booted.state.pc, header.initial_pc());
    }

    #[test]
    fn compact_classes_get_short_headers() {
        let vm = bootstrap(VmConfig::default());
        let header = ImageHeader::default();
        let bytes = write_image(&vm.memory, vm.special.array, &header).unwrap();
        let word_at = |offset: usize| u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap());
        let specials = word_at(16);
        let base = (HEADER_LEN + specials - header.old_base) as usize;
        // The special objects array is an Array, compact class 3.
        let word = word_at(base);
        assert_eq!(word & 3, header_type::SHORT);
        assert_eq!((word >> 12) & 0x1F, 3);
        assert_eq!(((word >> 2) & 0x3F) as usize, special_index::COUNT + 1);
        assert!(read_image(&bytes).is_ok());
    }
}
