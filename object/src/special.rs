use crate::{MemoryError, ObjectMemory, Oop, Value};

/// Indices into the special objects array.
pub mod index {
    pub const NIL: usize = 0;
    pub const FALSE: usize = 1;
    pub const TRUE: usize = 2;
    pub const SCHEDULER_ASSOCIATION: usize = 3;
    pub const CLASS_BITMAP: usize = 4;
    pub const CLASS_SMALL_INTEGER: usize = 5;
    pub const CLASS_STRING: usize = 6;
    pub const CLASS_ARRAY: usize = 7;
    pub const SMALLTALK: usize = 8;
    pub const CLASS_FLOAT: usize = 9;
    pub const CLASS_METHOD_CONTEXT: usize = 10;
    pub const CLASS_BLOCK_CONTEXT: usize = 11;
    pub const CLASS_POINT: usize = 12;
    pub const CLASS_LARGE_POSITIVE_INTEGER: usize = 13;
    pub const DISPLAY: usize = 14;
    pub const CLASS_MESSAGE: usize = 15;
    pub const CLASS_COMPILED_METHOD: usize = 16;
    pub const LOW_SPACE_SEMAPHORE: usize = 17;
    pub const CLASS_SEMAPHORE: usize = 18;
    pub const CLASS_CHARACTER: usize = 19;
    pub const SELECTOR_DOES_NOT_UNDERSTAND: usize = 20;
    pub const SELECTOR_CANNOT_RETURN: usize = 21;
    pub const PROCESS_SIGNALING_LOW_SPACE: usize = 22;
    pub const SPECIAL_SELECTORS: usize = 23;
    pub const CHARACTER_TABLE: usize = 24;
    pub const SELECTOR_MUST_BE_BOOLEAN: usize = 25;
    pub const CLASS_BYTE_ARRAY: usize = 26;
    pub const CLASS_PROCESS: usize = 27;
    pub const COMPACT_CLASSES: usize = 28;
    pub const TIMER_SEMAPHORE: usize = 29;
    pub const INTERRUPT_SEMAPHORE: usize = 30;
    pub const FLOAT_PROTO: usize = 31;
    pub const SELECTOR_CANNOT_INTERPRET: usize = 34;
    pub const METHOD_CONTEXT_PROTO: usize = 35;
    pub const CLASS_BLOCK_CLOSURE: usize = 36;
    pub const BLOCK_CONTEXT_PROTO: usize = 37;
    pub const EXTERNAL_OBJECTS: usize = 38;
    pub const PSEUDO_CONTEXT: usize = 39;
    pub const TRANSLATED_METHOD: usize = 40;
    pub const FINALIZATION_SEMAPHORE: usize = 41;
    pub const CLASS_LARGE_NEGATIVE_INTEGER: usize = 42;
    pub const SELECTOR_ABOUT_TO_RETURN: usize = 48;
    pub const SELECTOR_RUN_WITH_IN: usize = 49;

    /// Length of the array the bootstrap image creates.
    pub const COUNT: usize = 50;
}

/// Well-known objects resolved from the special objects array.
///
/// Slots that Smalltalk code rebinds at run time (Display, timer and
/// input semaphores, external objects) are not cached here; read them
/// through [`SpecialObjects::get`].
#[derive(Debug, Clone, Copy)]
pub struct SpecialObjects {
    /// The special objects array itself.
    pub array: Oop,

    // ── Singletons ─────────────────────────────────────────────────
    pub nil: Value,
    pub false_obj: Value,
    pub true_obj: Value,
    pub scheduler_association: Oop,

    // ── Classes ────────────────────────────────────────────────────
    pub class_small_integer: Oop,
    pub class_float: Oop,
    pub class_string: Oop,
    pub class_array: Oop,
    pub class_byte_array: Oop,
    pub class_point: Oop,
    pub class_large_positive_integer: Oop,
    pub class_message: Oop,
    pub class_compiled_method: Oop,
    pub class_method_context: Oop,
    pub class_block_context: Oop,
    /// `None` in images that predate closures.
    pub class_block_closure: Option<Oop>,
    pub class_semaphore: Oop,
    pub class_character: Oop,
    pub class_process: Oop,

    // ── Selectors ──────────────────────────────────────────────────
    pub selector_does_not_understand: Value,
    pub selector_cannot_return: Value,
    pub selector_must_be_boolean: Value,
    /// `None` in images without unwind support.
    pub selector_about_to_return: Option<Value>,

    // ── Tables ─────────────────────────────────────────────────────
    /// 32 (selector, argument count) pairs for bytecodes 176-207.
    pub special_selectors: Oop,
    pub character_table: Oop,
}

impl SpecialObjects {
    /// Resolve the cached entries of the special objects `array`.
    pub fn load(memory: &ObjectMemory, array: Oop) -> Result<Self, MemoryError> {
        let table = memory
            .get(array)
            .ok_or(MemoryError::MissingSpecialObject("special objects array"))?;
        let nil = memory.nil();
        let slot = |index: usize| table.storage.fetch(index, nil);
        let value = |index: usize, name: &'static str| {
            slot(index).ok_or(MemoryError::MissingSpecialObject(name))
        };
        let object = |index: usize, name: &'static str| {
            slot(index)
                .and_then(Value::as_oop)
                .filter(|oop| memory.contains(*oop))
                .ok_or(MemoryError::MissingSpecialObject(name))
        };
        let optional = |index: usize| {
            slot(index).filter(|v| *v != nil && v.is_object())
        };

        let specials = Self {
            array,
            nil: value(index::NIL, "nil")?,
            false_obj: value(index::FALSE, "false")?,
            true_obj: value(index::TRUE, "true")?,
            scheduler_association: object(
                index::SCHEDULER_ASSOCIATION,
                "SchedulerAssociation",
            )?,
            class_small_integer: object(index::CLASS_SMALL_INTEGER, "SmallInteger")?,
            class_float: object(index::CLASS_FLOAT, "Float")?,
            class_string: object(index::CLASS_STRING, "String")?,
            class_array: object(index::CLASS_ARRAY, "Array")?,
            class_byte_array: object(index::CLASS_BYTE_ARRAY, "ByteArray")?,
            class_point: object(index::CLASS_POINT, "Point")?,
            class_large_positive_integer: object(
                index::CLASS_LARGE_POSITIVE_INTEGER,
                "LargePositiveInteger",
            )?,
            class_message: object(index::CLASS_MESSAGE, "Message")?,
            class_compiled_method: object(index::CLASS_COMPILED_METHOD, "CompiledMethod")?,
            class_method_context: object(index::CLASS_METHOD_CONTEXT, "MethodContext")?,
            class_block_context: object(index::CLASS_BLOCK_CONTEXT, "BlockContext")?,
            class_block_closure: optional(index::CLASS_BLOCK_CLOSURE)
                .and_then(Value::as_oop),
            class_semaphore: object(index::CLASS_SEMAPHORE, "Semaphore")?,
            class_character: object(index::CLASS_CHARACTER, "Character")?,
            class_process: object(index::CLASS_PROCESS, "Process")?,
            selector_does_not_understand: value(
                index::SELECTOR_DOES_NOT_UNDERSTAND,
                "#doesNotUnderstand:",
            )?,
            selector_cannot_return: value(index::SELECTOR_CANNOT_RETURN, "#cannotReturn:")?,
            selector_must_be_boolean: value(
                index::SELECTOR_MUST_BE_BOOLEAN,
                "#mustBeBoolean",
            )?,
            selector_about_to_return: optional(index::SELECTOR_ABOUT_TO_RETURN),
            special_selectors: object(index::SPECIAL_SELECTORS, "SpecialSelectors")?,
            character_table: object(index::CHARACTER_TABLE, "CharacterTable")?,
        };

        if specials.nil != nil {
            return Err(MemoryError::MissingSpecialObject("nil"));
        }
        Ok(specials)
    }

    /// Current value of special slot `index`, `nil` if absent.
    pub fn get(&self, memory: &ObjectMemory, index: usize) -> Value {
        memory
            .fetch_indexed(self.array, index)
            .unwrap_or(self.nil)
    }

    pub fn bool_value(&self, b: bool) -> Value {
        if b { self.true_obj } else { self.false_obj }
    }
}
