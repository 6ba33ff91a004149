//! A small image built directly in object memory.
//!
//! It carries the classes and singletons the interpreter names in the
//! special objects array, a scheduler with one running process, and
//! primitive-backed methods for the common selectors. Hosts use it when
//! no snapshot is at hand; tests use it to exercise the interpreter.

use std::collections::HashMap;

use bytecode::{BytecodeBuilder, Constant, SpecialSelector};
use object::layout::{association, class, method_dict, process, scheduler};
use object::{
    ClassShape, MethodHeader, ObjectFormat, ObjectMemory, Oop, SMALL_FRAME, SpecialObjects,
    Storage, Value, special_index,
};

use crate::image::ImageHeader;
use crate::scheduler::PRIORITY_LEVELS;
use crate::{VM, VmConfig};

/// Priority of the process running in a fresh bootstrap image.
pub const USER_PRIORITY: i64 = 4;

/// Stack slots a bootstrap method gets above its temporaries.
const STACK_HEADROOM: usize = 8;

/// Classes whose instances use single-word headers, by compact index.
const COMPACT_CLASSES: [(usize, &str); 11] = [
    (1, "CompiledMethod"),
    (3, "Array"),
    (4, "LargeNegativeInteger"),
    (5, "LargePositiveInteger"),
    (6, "Float"),
    (8, "Association"),
    (9, "Point"),
    (11, "String"),
    (12, "Symbol"),
    (13, "MethodContext"),
    (14, "BlockContext"),
];

/// A method to install with [`VM::define_method`].
pub struct MethodDef {
    code: BytecodeBuilder,
    args: usize,
    temps: usize,
    literals: Vec<Value>,
    primitive: u16,
}

impl MethodDef {
    pub fn new(code: BytecodeBuilder) -> Self {
        Self { code, args: 0, temps: 0, literals: Vec::new(), primitive: 0 }
    }

    pub fn args(mut self, count: usize) -> Self {
        self.args = count;
        self
    }

    /// Temporaries beyond the arguments.
    pub fn temps(mut self, count: usize) -> Self {
        self.temps = count;
        self
    }

    /// Append a literal. The class binding always follows the last one.
    pub fn literal(mut self, value: Value) -> Self {
        self.literals.push(value);
        self
    }

    pub fn primitive(mut self, index: u16) -> Self {
        self.primitive = index;
        self
    }
}

/// Object memory under construction, before the special objects exist.
struct Builder {
    memory: ObjectMemory,
    nil: Oop,
    class_class: Oop,
    symbol_class: Option<Oop>,
    symbols: HashMap<String, Oop>,
    classes: Vec<(Oop, &'static str)>,
}

impl Builder {
    fn new() -> Self {
        let mut memory = ObjectMemory::with_capacity(1024);
        // nil is the first record and briefly its own class.
        let nil = memory.allocate(Oop::from_index(0), ObjectFormat::NoFields, 0, 0);
        memory.set_nil(nil);
        let class_class = memory.allocate(nil, ObjectFormat::Fixed, class::SIZE, 0);
        Self {
            memory,
            nil,
            class_class,
            symbol_class: None,
            symbols: HashMap::new(),
            classes: Vec::new(),
        }
    }

    fn nil(&self) -> Value {
        Value::Object(self.nil)
    }

    fn set_class(&mut self, oop: Oop, class: Oop) {
        if let Some(object) = self.memory.get_mut(oop) {
            object.class = class;
        }
    }

    fn set_named(&mut self, oop: Oop, index: usize, value: Value) {
        if let Some(slot) = self
            .memory
            .get_mut(oop)
            .and_then(|object| object.named.get_mut(index))
        {
            *slot = value;
        }
    }

    fn class_fields(&self, superclass: Option<Oop>, shape: ClassShape) -> Vec<Value> {
        let mut named = vec![self.nil(); class::SIZE];
        named[class::SUPERCLASS] = superclass.map_or(self.nil(), Value::Object);
        named[class::FORMAT] = Value::from_i64(shape.encode());
        named
    }

    fn class(
        &mut self,
        name: &'static str,
        superclass: Option<Oop>,
        inst_spec: ObjectFormat,
        fixed_fields: usize,
    ) -> Oop {
        let named = self.class_fields(superclass, ClassShape::new(inst_spec, fixed_fields));
        let oop = self
            .memory
            .allocate_with(self.class_class, ObjectFormat::Fixed, named, Storage::empty());
        self.classes.push((oop, name));
        oop
    }

    fn symbol(&mut self, name: &str) -> Oop {
        if let Some(&symbol) = self.symbols.get(name) {
            return symbol;
        }
        let class = self.symbol_class.unwrap_or(self.nil);
        let symbol = self.memory.allocate_with(
            class,
            ObjectFormat::Bytes { unused: 0 },
            Vec::new(),
            Storage::Bytes(name.as_bytes().to_vec()),
        );
        self.symbols.insert(name.to_owned(), symbol);
        symbol
    }

    fn instance(&mut self, class: Oop, inst_spec: ObjectFormat, named: Vec<Value>) -> Oop {
        self.memory.allocate_with(class, inst_spec, named, Storage::empty())
    }

    fn array(&mut self, class: Oop, values: Vec<Value>) -> Oop {
        let storage = Storage::from_values(values, self.nil());
        self.memory
            .allocate_with(class, ObjectFormat::Indexable, Vec::new(), storage)
    }
}

/// Build the bootstrap image and wrap it in a VM.
pub fn bootstrap(config: VmConfig) -> VM {
    use ObjectFormat::*;

    let mut b = Builder::new();
    let nil = b.nil();

    // 1. Kernel classes. `Class` describes every class, itself included.
    let object = b.class("Object", None, NoFields, 0);
    let behavior = b.class("Behavior", Some(object), Fixed, class::SIZE);
    let class_class = b.class_class;
    b.classes.push((class_class, "Class"));
    let fields = b.class_fields(Some(behavior), ClassShape::new(Fixed, class::SIZE));
    if let Some(record) = b.memory.get_mut(class_class) {
        record.class = class_class;
        record.named = fields;
    }
    let undefined_object = b.class("UndefinedObject", Some(object), NoFields, 0);
    b.set_class(b.nil, undefined_object);
    let boolean = b.class("Boolean", Some(object), NoFields, 0);
    let true_class = b.class("True", Some(boolean), NoFields, 0);
    let false_class = b.class("False", Some(boolean), NoFields, 0);

    // 2. Numbers and characters.
    let magnitude = b.class("Magnitude", Some(object), NoFields, 0);
    let character = b.class("Character", Some(magnitude), Fixed, 1);
    let number = b.class("Number", Some(magnitude), NoFields, 0);
    let float = b.class("Float", Some(number), Words, 0);
    let integer = b.class("Integer", Some(number), NoFields, 0);
    let small_integer = b.class("SmallInteger", Some(integer), NoFields, 0);
    let large_positive = b.class("LargePositiveInteger", Some(integer), Bytes { unused: 0 }, 0);
    let large_negative = b.class("LargeNegativeInteger", Some(large_positive), Bytes { unused: 0 }, 0);

    // 3. Collections.
    let collection = b.class("Collection", Some(object), NoFields, 0);
    let arrayed = b.class("ArrayedCollection", Some(collection), NoFields, 0);
    let array = b.class("Array", Some(arrayed), Indexable, 0);
    let string = b.class("String", Some(arrayed), Bytes { unused: 0 }, 0);
    let symbol = b.class("Symbol", Some(string), Bytes { unused: 0 }, 0);
    b.symbol_class = Some(symbol);
    let byte_array = b.class("ByteArray", Some(arrayed), Bytes { unused: 0 }, 0);
    let bitmap = b.class("Bitmap", Some(arrayed), Words, 0);
    let system_dictionary = b.class("SystemDictionary", Some(collection), FixedIndexable, 1);
    b.class("MethodDictionary", Some(collection), FixedIndexable, method_dict::SIZE);

    // 4. Everything the interpreter and scheduler touch.
    let lookup_key = b.class("LookupKey", Some(magnitude), Fixed, 1);
    let association_class = b.class("Association", Some(lookup_key), Fixed, association::SIZE);
    let message = b.class("Message", Some(object), Fixed, 2);
    let point = b.class("Point", Some(object), Fixed, 2);
    b.class("Form", Some(object), Fixed, 4);
    let compiled_method = b.class("CompiledMethod", Some(byte_array), CompiledMethod { unused: 0 }, 0);
    let context_part = b.class("ContextPart", Some(object), FixedIndexable, 6);
    let method_context = b.class("MethodContext", Some(context_part), FixedIndexable, 6);
    let block_context = b.class("BlockContext", Some(context_part), FixedIndexable, 6);
    let block_closure = b.class("BlockClosure", Some(object), FixedIndexable, 3);
    let link = b.class("Link", Some(object), Fixed, 1);
    let process_class = b.class("Process", Some(link), Fixed, process::SIZE);
    let linked_list = b.class("LinkedList", Some(collection), Fixed, 2);
    let semaphore = b.class("Semaphore", Some(linked_list), Fixed, 3);
    let processor_scheduler = b.class("ProcessorScheduler", Some(object), Fixed, scheduler::SIZE);

    // 5. Singletons and tables.
    let true_obj = Value::Object(b.instance(true_class, NoFields, Vec::new()));
    let false_obj = Value::Object(b.instance(false_class, NoFields, Vec::new()));
    let characters: Vec<Value> = (0..256)
        .map(|code| Value::Object(b.instance(character, Fixed, vec![Value::from_i64(code)])))
        .collect();
    let character_table = b.array(array, characters);
    let mut selectors = Vec::with_capacity(SpecialSelector::COUNT * 2);
    for index in 0..SpecialSelector::COUNT as u8 {
        if let Some(selector) = SpecialSelector::from_index(index) {
            selectors.push(Value::Object(b.symbol(selector.name())));
            selectors.push(Value::from_i64(selector.arg_count() as i64));
        }
    }
    let special_selectors = b.array(array, selectors);
    let compact: Vec<Value> = (1..=31)
        .map(|index| {
            COMPACT_CLASSES
                .iter()
                .find(|(i, _)| *i == index)
                .and_then(|(_, name)| b.classes.iter().find(|(_, n)| n == name))
                .map_or(nil, |(oop, _)| Value::Object(*oop))
        })
        .collect();
    let compact_classes = b.array(array, compact);
    let external_objects = b.array(array, Vec::new());

    // 6. The scheduler and its running process.
    let run_queues: Vec<Value> = (0..PRIORITY_LEVELS)
        .map(|_| Value::Object(b.instance(linked_list, Fixed, vec![nil, nil])))
        .collect();
    let run_queues = b.array(array, run_queues);
    let active = b.instance(
        process_class,
        Fixed,
        vec![nil, nil, Value::from_i64(USER_PRIORITY), nil],
    );
    let processor = b.instance(
        processor_scheduler,
        Fixed,
        vec![Value::Object(run_queues), Value::Object(active)],
    );

    // 7. Names and globals.
    let mut globals = Vec::new();
    let classes = std::mem::take(&mut b.classes);
    for &(oop, name) in &classes {
        let name_symbol = Value::Object(b.symbol(name));
        b.set_named(oop, class::NAME, name_symbol);
        globals.push((name_symbol, Value::Object(oop)));
    }
    let processor_key = Value::Object(b.symbol("Processor"));
    let scheduler_association = b.instance(
        association_class,
        Fixed,
        vec![processor_key, Value::Object(processor)],
    );
    let smalltalk = b.memory.allocate_with(
        system_dictionary,
        FixedIndexable,
        vec![Value::from_i64(0)],
        Storage::empty(),
    );
    globals.push((Value::Object(b.symbol("Smalltalk")), Value::Object(smalltalk)));
    let mut entries = vec![Value::Object(scheduler_association)];
    for (key, value) in globals {
        entries.push(Value::Object(b.instance(association_class, Fixed, vec![key, value])));
    }
    let tally = Value::from_i64(entries.len() as i64);
    if let Some(record) = b.memory.get_mut(smalltalk) {
        record.named[0] = tally;
        record.storage = Storage::from_values(entries, nil);
    }

    // 8. The special objects array.
    let selector = |b: &mut Builder, name: &str| Value::Object(b.symbol(name));
    let dnu = selector(&mut b, "doesNotUnderstand:");
    let cannot_return = selector(&mut b, "cannotReturn:");
    let must_be_boolean = selector(&mut b, "mustBeBoolean");
    let about_to_return = selector(&mut b, "aboutToReturn:through:");
    let mut slots = vec![nil; special_index::COUNT];
    let o = Value::Object;
    for (index, value) in [
        (special_index::NIL, nil),
        (special_index::FALSE, false_obj),
        (special_index::TRUE, true_obj),
        (special_index::SCHEDULER_ASSOCIATION, o(scheduler_association)),
        (special_index::CLASS_BITMAP, o(bitmap)),
        (special_index::CLASS_SMALL_INTEGER, o(small_integer)),
        (special_index::CLASS_STRING, o(string)),
        (special_index::CLASS_ARRAY, o(array)),
        (special_index::SMALLTALK, o(smalltalk)),
        (special_index::CLASS_FLOAT, o(float)),
        (special_index::CLASS_METHOD_CONTEXT, o(method_context)),
        (special_index::CLASS_BLOCK_CONTEXT, o(block_context)),
        (special_index::CLASS_POINT, o(point)),
        (special_index::CLASS_LARGE_POSITIVE_INTEGER, o(large_positive)),
        (special_index::CLASS_MESSAGE, o(message)),
        (special_index::CLASS_COMPILED_METHOD, o(compiled_method)),
        (special_index::CLASS_SEMAPHORE, o(semaphore)),
        (special_index::CLASS_CHARACTER, o(character)),
        (special_index::SELECTOR_DOES_NOT_UNDERSTAND, dnu),
        (special_index::SELECTOR_CANNOT_RETURN, cannot_return),
        (special_index::SPECIAL_SELECTORS, o(special_selectors)),
        (special_index::CHARACTER_TABLE, o(character_table)),
        (special_index::SELECTOR_MUST_BE_BOOLEAN, must_be_boolean),
        (special_index::CLASS_BYTE_ARRAY, o(byte_array)),
        (special_index::CLASS_PROCESS, o(process_class)),
        (special_index::COMPACT_CLASSES, o(compact_classes)),
        (special_index::CLASS_BLOCK_CLOSURE, o(block_closure)),
        (special_index::EXTERNAL_OBJECTS, o(external_objects)),
        (special_index::CLASS_LARGE_NEGATIVE_INTEGER, o(large_negative)),
        (special_index::SELECTOR_ABOUT_TO_RETURN, about_to_return),
    ] {
        slots[index] = value;
    }
    let special_array = b.array(array, slots);

    let special = SpecialObjects {
        array: special_array,
        nil,
        false_obj,
        true_obj,
        scheduler_association,
        class_small_integer: small_integer,
        class_float: float,
        class_string: string,
        class_array: array,
        class_byte_array: byte_array,
        class_point: point,
        class_large_positive_integer: large_positive,
        class_message: message,
        class_compiled_method: compiled_method,
        class_method_context: method_context,
        class_block_context: block_context,
        class_block_closure: Some(block_closure),
        class_semaphore: semaphore,
        class_character: character,
        class_process: process_class,
        selector_does_not_understand: dnu,
        selector_cannot_return: cannot_return,
        selector_must_be_boolean: must_be_boolean,
        selector_about_to_return: Some(about_to_return),
        special_selectors,
        character_table,
    };

    let mut vm = VM::new(b.memory, special, ImageHeader::default(), config);
    install_handlers(&mut vm, object);
    install_primitive_methods(&mut vm);
    log::debug!("bootstrap image has {} objects", vm.memory.live_count());
    vm
}

/// Fallback methods the interpreter sends on its own.
fn install_handlers(vm: &mut VM, object: Oop) {
    // doesNotUnderstand: aMessage  ^aMessage
    let mut code = BytecodeBuilder::new();
    code.push_temporary(0);
    code.return_top();
    vm.define_method(object, "doesNotUnderstand:", MethodDef::new(code).args(1));

    // cannotReturn: aValue  ^aValue
    let mut code = BytecodeBuilder::new();
    code.push_temporary(0);
    code.return_top();
    vm.define_method(object, "cannotReturn:", MethodDef::new(code).args(1));

    let mut code = BytecodeBuilder::new();
    code.return_constant(Constant::Nil);
    vm.define_method(object, "mustBeBoolean", MethodDef::new(code));

    // aboutToReturn: aValue through: aContext  ^aContext
    let mut code = BytecodeBuilder::new();
    code.push_temporary(1);
    code.return_top();
    vm.define_method(object, "aboutToReturn:through:", MethodDef::new(code).args(2));
}

/// `(class, selector, primitive)`; the argument count follows from the
/// selector.
const PRIMITIVE_METHODS: &[(&str, &str, u16)] = &[
    ("Object", "at:", 60),
    ("Object", "at:put:", 61),
    ("Object", "size", 62),
    ("Object", "basicAt:", 60),
    ("Object", "basicAt:put:", 61),
    ("Object", "basicSize", 62),
    ("Object", "become:", 72),
    ("Object", "instVarAt:", 73),
    ("Object", "instVarAt:put:", 74),
    ("Object", "identityHash", 75),
    ("Object", "nextInstance", 78),
    ("Object", "perform:", 83),
    ("Object", "perform:with:", 83),
    ("Object", "perform:with:with:", 83),
    ("Object", "perform:withArguments:", 84),
    ("Object", "perform:withArguments:inSuperclass:", 100),
    ("Object", "replaceFrom:to:with:startingAt:", 105),
    ("Object", "==", 110),
    ("Object", "class", 111),
    ("Object", "primitiveChangeClassTo:", 115),
    ("Object", "atAllPut:", 145),
    ("Object", "shallowCopy", 148),
    ("Object", "~~", 169),
    ("Behavior", "basicNew", 70),
    ("Behavior", "new", 70),
    ("Behavior", "basicNew:", 71),
    ("Behavior", "new:", 71),
    ("Behavior", "someInstance", 77),
    ("Behavior", "newMethod:header:", 79),
    ("SmallInteger", "+", 1),
    ("SmallInteger", "-", 2),
    ("SmallInteger", "<", 3),
    ("SmallInteger", ">", 4),
    ("SmallInteger", "<=", 5),
    ("SmallInteger", ">=", 6),
    ("SmallInteger", "=", 7),
    ("SmallInteger", "~=", 8),
    ("SmallInteger", "*", 9),
    ("SmallInteger", "/", 10),
    ("SmallInteger", "\\\\", 11),
    ("SmallInteger", "//", 12),
    ("SmallInteger", "quo:", 13),
    ("SmallInteger", "bitAnd:", 14),
    ("SmallInteger", "bitOr:", 15),
    ("SmallInteger", "bitXor:", 16),
    ("SmallInteger", "bitShift:", 17),
    ("SmallInteger", "@", 18),
    ("SmallInteger", "asFloat", 40),
    ("Float", "+", 41),
    ("Float", "-", 42),
    ("Float", "<", 43),
    ("Float", ">", 44),
    ("Float", "<=", 45),
    ("Float", ">=", 46),
    ("Float", "=", 47),
    ("Float", "~=", 48),
    ("Float", "*", 49),
    ("Float", "/", 50),
    ("Float", "truncated", 51),
    ("Float", "fractionPart", 52),
    ("Float", "sqrt", 55),
    ("Float", "sin", 56),
    ("Float", "arcTan", 57),
    ("Float", "ln", 58),
    ("Float", "exp", 59),
    ("String", "at:", 63),
    ("String", "at:put:", 64),
    ("CompiledMethod", "objectAt:", 68),
    ("CompiledMethod", "objectAt:put:", 69),
    ("ContextPart", "blockCopy:", 80),
    ("BlockContext", "value", 81),
    ("BlockContext", "value:", 81),
    ("BlockContext", "value:value:", 81),
    ("BlockContext", "valueWithArguments:", 82),
    ("BlockClosure", "value", 201),
    ("BlockClosure", "value:", 202),
    ("BlockClosure", "value:value:", 203),
    ("BlockClosure", "value:value:value:", 204),
    ("BlockClosure", "value:value:value:value:", 205),
    ("BlockClosure", "valueWithArguments:", 206),
    ("Semaphore", "signal", 85),
    ("Semaphore", "wait", 86),
    ("Process", "resume", 87),
    ("Process", "suspend", 88),
    ("Array", "elementsExchangeIdentityWith:", 128),
    ("Form", "beDisplay", 102),
    ("ProcessorScheduler", "signal:atMilliseconds:", 136),
    ("ProcessorScheduler", "yield", 167),
    ("SystemDictionary", "flushCache", 89),
    ("SystemDictionary", "snapshotPrimitive", 97),
    ("SystemDictionary", "bytesLeft", 112),
    ("SystemDictionary", "quitPrimitive", 113),
    ("SystemDictionary", "specialObjectsArray", 129),
    ("SystemDictionary", "garbageCollect", 130),
    ("SystemDictionary", "garbageCollectMost", 131),
    ("SystemDictionary", "millisecondClockValue", 135),
    ("SystemDictionary", "secondsClock", 137),
];

/// Number of arguments a selector spelling takes.
fn selector_arity(selector: &str) -> usize {
    if selector.ends_with(':') {
        selector.matches(':').count()
    } else if selector.chars().all(|c| c.is_alphanumeric()) {
        0
    } else {
        1
    }
}

fn install_primitive_methods(vm: &mut VM) {
    for &(class_name, selector, primitive) in PRIMITIVE_METHODS {
        let Some(class) = vm.global(class_name) else {
            log::warn!("bootstrap has no class {class_name}");
            continue;
        };
        // A failed primitive answers nil.
        let mut code = BytecodeBuilder::new();
        code.return_constant(Constant::Nil);
        let def = MethodDef::new(code)
            .args(selector_arity(selector))
            .primitive(primitive);
        vm.define_method(class, selector, def);
    }
}

impl VM {
    fn global_association(&self, name: &str) -> Option<Oop> {
        let smalltalk = self
            .special
            .get(&self.memory, special_index::SMALLTALK)
            .as_oop()?;
        let nil = self.nil();
        self.memory
            .get(smalltalk)?
            .storage
            .values(nil)
            .into_iter()
            .filter_map(Value::as_oop)
            .find(|entry| {
                self.memory
                    .fetch(*entry, association::KEY)
                    .ok()
                    .and_then(|key| self.memory.string_of(key))
                    .is_some_and(|key| key == name)
            })
    }

    /// The value bound to `name` in the Smalltalk dictionary.
    pub fn global_value(&self, name: &str) -> Option<Value> {
        let binding = self.global_association(name)?;
        self.memory.fetch(binding, association::VALUE).ok()
    }

    /// The object bound to `name`, typically a class.
    pub fn global(&self, name: &str) -> Option<Oop> {
        self.global_value(name).and_then(Value::as_oop)
    }

    fn add_global(&mut self, name: &str, value: Value) -> Oop {
        let key = Value::Object(self.intern(name));
        let association_class = self.memory.class_of(self.special.scheduler_association);
        let binding = match association_class {
            Ok(class) => self.memory.allocate_with(
                class,
                ObjectFormat::Fixed,
                vec![key, value],
                Storage::empty(),
            ),
            Err(_) => self.new_array(vec![key, value]),
        };
        let nil = self.nil();
        let smalltalk = self
            .special
            .get(&self.memory, special_index::SMALLTALK)
            .as_oop();
        match smalltalk.and_then(|oop| self.memory.get_mut(oop)) {
            Some(dictionary) => {
                let mut entries = dictionary.storage.values(nil);
                entries.push(Value::Object(binding));
                if let Some(tally) = dictionary.named.first_mut() {
                    *tally = Value::from_i64(entries.len() as i64);
                }
                dictionary.storage = Storage::from_values(entries, nil);
            }
            None => log::warn!("no Smalltalk dictionary to hold {name}"),
        }
        binding
    }

    /// Create a class named `name` with `fixed_fields` named instance
    /// variables and register it as a global. `superclass` defaults to
    /// Object.
    pub fn define_class(&mut self, name: &str, superclass: Option<Oop>, fixed_fields: usize) -> Oop {
        let nil = self.nil();
        let superclass = superclass
            .or_else(|| self.global("Object"))
            .map_or(nil, Value::Object);
        let inst_spec = if fixed_fields == 0 {
            ObjectFormat::NoFields
        } else {
            ObjectFormat::Fixed
        };
        let metaclass = self
            .global("Class")
            .or_else(|| superclass.as_oop().and_then(|s| self.memory.class_of(s).ok()))
            .unwrap_or(self.special.class_array);
        let mut named = vec![nil; class::SIZE];
        named[class::SUPERCLASS] = superclass;
        named[class::FORMAT] = Value::from_i64(ClassShape::new(inst_spec, fixed_fields).encode());
        named[class::NAME] = Value::Object(self.intern(name));
        let class = self
            .memory
            .allocate_with(metaclass, ObjectFormat::Fixed, named, Storage::empty());
        self.add_global(name, Value::Object(class));
        class
    }

    /// The selectors and methods of `class`'s method dictionary.
    fn method_entries(&self, class: Oop) -> (Vec<Value>, Vec<Value>) {
        let nil = self.nil();
        let Some(dict) = self
            .memory
            .fetch(class, class::METHOD_DICT)
            .ok()
            .and_then(Value::as_oop)
            .and_then(|oop| self.memory.get(oop))
        else {
            return (Vec::new(), Vec::new());
        };
        let selectors = dict.storage.values(nil);
        let methods = dict
            .named
            .get(method_dict::VALUES)
            .and_then(|values| values.as_oop())
            .and_then(|values| self.memory.get(values))
            .map(|values| values.storage.values(nil))
            .unwrap_or_default();
        (selectors, methods)
    }

    /// Replace the method dictionary of `class` with one where `selector`
    /// maps to `method`, or is absent when `method` is `None`.
    fn install(&mut self, class: Oop, selector: Value, method: Option<Oop>) {
        let (mut selectors, mut methods) = self.method_entries(class);
        methods.resize(selectors.len(), self.nil());
        match (selectors.iter().position(|s| *s == selector), method) {
            (Some(i), Some(method)) => methods[i] = Value::Object(method),
            (Some(i), None) => {
                selectors.remove(i);
                methods.remove(i);
            }
            (None, Some(method)) => {
                selectors.push(selector);
                methods.push(Value::Object(method));
            }
            (None, None) => return,
        }
        let dict_class = self
            .global("MethodDictionary")
            .unwrap_or(self.special.class_array);
        let tally = Value::from_i64(selectors.len() as i64);
        let values = Value::Object(self.new_array(methods));
        let nil = self.nil();
        let dict = self.memory.allocate_with(
            dict_class,
            ObjectFormat::FixedIndexable,
            vec![tally, values],
            Storage::from_values(selectors, nil),
        );
        match self
            .memory
            .get_mut(class)
            .and_then(|record| record.named.get_mut(class::METHOD_DICT))
        {
            Some(slot) => *slot = Value::Object(dict),
            None => log::warn!("{class:?} has no method dictionary slot"),
        }
        self.flush_method_cache();
    }

    /// Compile `def` into a CompiledMethod and install it as
    /// `class>>selector`.
    pub fn define_method(&mut self, class: Oop, selector: &str, def: MethodDef) -> Oop {
        let binding = self
            .global_association(&self.class_name(class))
            .filter(|binding| {
                self.memory.fetch(*binding, association::VALUE).ok() == Some(Value::Object(class))
            })
            .map(Value::Object)
            .unwrap_or(Value::Object(class));
        let mut literals = def.literals;
        literals.push(binding);
        let temps = def.args + def.temps;
        let header = MethodHeader {
            primitive: def.primitive,
            literals: literals.len(),
            large_frame: temps + STACK_HEADROOM > SMALL_FRAME,
            temps,
            args: def.args,
        };
        let method = self.new_method(header, literals, def.code.into_bytes());
        let selector = Value::Object(self.intern(selector));
        self.install(class, selector, Some(method));
        method
    }

    pub fn remove_method(&mut self, class: Oop, selector: Value) {
        self.install(class, selector, None);
    }
}
