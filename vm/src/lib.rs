pub mod config;
mod context;
pub mod display;
mod error;
pub mod host;
pub mod image;
mod interpreter;
pub mod primitives;
mod scheduler;
pub mod special;

use std::collections::HashMap;
use std::path::Path;

use object::layout;
use object::{
    GcStats, LookupResult, MemoryError, MethodHeader, ObjectFormat, ObjectMemory, Oop,
    SMALL_INT_MAX, SpecialObjects, Storage, StrategyKind, Value, special_index,
};

pub use config::VmConfig;
pub use display::{DamageListener, DamageRect, DisplayView};
pub use error::{Halt, PrimitiveError, VmError};
pub use host::{HostHandle, InputEvent};
pub use image::ImageHeader;
pub use primitives::{PluginRegistry, PrimitiveDesc, PrimitiveFn, PrimitiveSuccess};

use interpreter::InterpreterState;

/// Why `VM::run` handed control back to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The image executed the quit primitive.
    Quit,
    /// The entry context of `send_message` returned this value.
    Returned(Value),
    /// `max_bytecodes` were executed.
    BytecodeLimit,
}

impl Exit {
    pub fn returned(self) -> Option<Value> {
        match self {
            Exit::Returned(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Statistics {
    pub bytecodes: u64,
    pub sends: u64,
    pub primitive_failures: u64,
    pub process_switches: u64,
    pub collections: u64,
}

/// A running Smalltalk virtual machine.
///
/// The VM owns the object memory and every piece of interpreter and
/// scheduler state. One native thread drives it; other threads talk to it
/// through a [`HostHandle`].
pub struct VM {
    pub memory: ObjectMemory,
    pub special: SpecialObjects,
    pub config: VmConfig,
    pub header: ImageHeader,
    pub plugins: PluginRegistry,
    /// Numbered primitives indexed by primitive number.
    primitive_table: Vec<Option<PrimitiveDesc>>,
    host: HostHandle,
    pub(crate) state: InterpreterState,
    pub(crate) method_cache: HashMap<(Oop, Oop), LookupResult>,
    /// Earlier answers of `intern`; not a GC root.
    symbols: HashMap<String, Oop>,
    /// Context whose return ends the current `send_message`.
    pub(crate) entry_context: Option<Oop>,
    /// Deadline of the timer semaphore in `host::monotonic_millis` time.
    pub(crate) next_wakeup: Option<u64>,
    roots: Vec<Value>,
    damage_listener: Option<DamageListener>,
    pub(crate) stats: Statistics,
    pub(crate) check_countdown: u32,
    /// 1-based ExternalObjects index signalled when input arrives.
    pub(crate) input_semaphore: Option<usize>,
    pub(crate) exit: Option<Exit>,
}

impl VM {
    /// Wrap a loaded object memory whose special objects array is
    /// `specials`.
    pub fn from_image(
        memory: ObjectMemory,
        specials: Oop,
        header: ImageHeader,
        config: VmConfig,
    ) -> Result<Self, VmError> {
        let special = SpecialObjects::load(&memory, specials)
            .map_err(|err| VmError::invariant(err.to_string()))?;
        Ok(Self::new(memory, special, header, config))
    }

    /// Wrap an object memory whose special objects are already resolved.
    pub fn new(
        memory: ObjectMemory,
        special: SpecialObjects,
        header: ImageHeader,
        config: VmConfig,
    ) -> Self {
        let mut primitive_table: Vec<Option<PrimitiveDesc>> = Vec::new();
        for desc in primitives::default_primitives() {
            let index = desc.index as usize;
            if primitive_table.len() <= index {
                primitive_table.resize(index + 1, None);
            }
            primitive_table[index] = Some(desc);
        }
        let state = InterpreterState::new(memory.nil());
        Self {
            memory,
            special,
            check_countdown: config.check_interval.max(1),
            config,
            header,
            plugins: PluginRegistry::default(),
            primitive_table,
            host: HostHandle::new(),
            state,
            method_cache: HashMap::new(),
            symbols: HashMap::new(),
            entry_context: None,
            next_wakeup: None,
            roots: Vec::new(),
            damage_listener: None,
            stats: Statistics::default(),
            input_semaphore: None,
            exit: None,
        }
    }

    /// Read, link and boot the snapshot at `path`.
    pub fn load(path: impl AsRef<Path>, config: VmConfig) -> Result<Self, VmError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let loaded = image::read_image(&bytes)?;
        log::info!(
            "loaded {} (version {}, {} objects)",
            path.display(),
            loaded.header.version,
            loaded.memory.live_count()
        );
        let mut vm = Self::from_image(loaded.memory, loaded.specials, loaded.header, config)?;
        vm.boot()?;
        Ok(vm)
    }

    /// Resume the active process at its suspended context.
    pub fn boot(&mut self) -> Result<(), VmError> {
        let process = self.active_process()?;
        let context = self
            .memory
            .fetch(process, layout::process::SUSPENDED_CONTEXT)?
            .as_oop()
            .filter(|oop| Value::Object(*oop) != self.nil())
            .ok_or_else(|| VmError::invariant("active process has no suspended context"))?;
        let nil = self.nil();
        self.memory
            .store(process, layout::process::SUSPENDED_CONTEXT, nil)?;
        self.load_context(context)?;
        log::info!("booted process {process:?} at {context:?}");
        Ok(())
    }

    /// Execute until the image quits, the entry context returns, the
    /// bytecode limit is reached or a fatal condition occurs.
    pub fn run(&mut self) -> Result<Exit, Halt> {
        loop {
            if let Some(exit) = self.exit.take() {
                if let Err(err) = self.flush_registers() {
                    return Err(self.halt(err));
                }
                log::debug!(
                    "stopped: {exit:?} after {} bytecodes, {} sends",
                    self.stats.bytecodes,
                    self.stats.sends
                );
                return Ok(exit);
            }
            if let Err(err) = self.step() {
                return Err(self.halt(err));
            }
        }
    }

    /// Send `selector` to `receiver` with `args` and run until that send
    /// answers.
    ///
    /// The send runs inside the active process on top of whatever the
    /// interpreter was doing, which is restored afterwards.
    pub fn send_message(
        &mut self,
        receiver: Value,
        selector: &str,
        args: &[Value],
    ) -> Result<Exit, Halt> {
        let entry = match self.entry_method(receiver, selector, args) {
            Ok(context) => context,
            Err(err) => return Err(self.halt(err)),
        };
        let nil = self.nil();
        let saved_state = std::mem::replace(&mut self.state, InterpreterState::new(nil));
        let saved_entry = self.entry_context.replace(entry);
        // The interrupted activation is only reachable from the saved
        // registers while the send runs.
        let root_mark = self.roots.len();
        self.roots.push(saved_state.receiver);
        self.roots.extend(
            [saved_state.context, saved_state.home, saved_state.method, saved_entry]
                .into_iter()
                .flatten()
                .map(Value::Object),
        );
        let result = match self.load_context(entry) {
            Ok(()) => self.run(),
            Err(err) => Err(self.halt(err)),
        };
        self.roots.truncate(root_mark);
        self.state = saved_state;
        self.entry_context = saved_entry;
        result
    }

    fn entry_method(
        &mut self,
        receiver: Value,
        selector: &str,
        args: &[Value],
    ) -> Result<Oop, VmError> {
        let selector = self.intern(selector);
        let mut code = bytecode::BytecodeBuilder::new();
        for i in 0..=args.len() {
            code.push_literal_constant(i as u8 + 1);
        }
        code.send(0, args.len() as u8);
        code.return_top();

        let mut literals = vec![Value::Object(selector), receiver];
        literals.extend_from_slice(args);
        let header = MethodHeader {
            primitive: 0,
            literals: literals.len(),
            large_frame: args.len() + 1 > object::SMALL_FRAME,
            temps: 0,
            args: 0,
        };
        let method = self.new_method(header, literals, code.into_bytes());
        let nil = self.nil();
        self.new_context(method, nil, nil, nil, header.initial_pc(), 0)
    }

    fn halt(&self, error: VmError) -> Halt {
        Halt {
            error,
            bytecode: self.state.last_bytecode,
            pc: self.state.last_pc,
            chain: self.describe_chain(),
        }
    }

    // ── Accessors ──────────────────────────────────────────────────

    #[inline(always)]
    pub fn nil(&self) -> Value {
        self.special.nil
    }

    pub fn host(&self) -> HostHandle {
        self.host.clone()
    }

    pub fn stats(&self) -> Statistics {
        self.stats
    }

    pub fn primitive(&self, index: u16) -> Option<&PrimitiveDesc> {
        self.primitive_table.get(index as usize).and_then(Option::as_ref)
    }

    /// Keep `value` alive across collections.
    pub fn add_root(&mut self, value: Value) {
        self.roots.push(value);
    }

    pub fn set_damage_listener(&mut self, listener: DamageListener) {
        self.damage_listener = Some(listener);
    }

    pub(crate) fn report_damage(&mut self, rect: DamageRect) {
        if let Some(listener) = self.damage_listener.as_mut() {
            listener(rect);
        }
    }

    /// The Display form's bitmap, if the image has installed one.
    pub fn display_buffer(&self) -> Option<DisplayView<'_>> {
        let display = self
            .special
            .get(&self.memory, special_index::DISPLAY)
            .as_oop()?;
        let field = |index| {
            self.memory
                .fetch(display, index)
                .ok()
                .and_then(Value::as_small_int)
                .and_then(|n| u32::try_from(n).ok())
        };
        let width = field(layout::form::WIDTH)?;
        let height = field(layout::form::HEIGHT)?;
        let depth = field(layout::form::DEPTH)?;
        let bits = self.memory.fetch(display, layout::form::BITS).ok()?.as_oop()?;
        let bits = self.memory.get(bits)?.words()?;
        Some(DisplayView { width, height, depth, bits })
    }

    // ── Objects ────────────────────────────────────────────────────

    pub fn class_of_value(&self, value: Value) -> Result<Oop, VmError> {
        Ok(match value {
            Value::SmallInteger(_) => self.special.class_small_integer,
            Value::Float(_) => self.special.class_float,
            Value::Object(oop) => self.memory.class_of(oop)?,
        })
    }

    pub fn is_kind_of(&self, value: Value, class: Oop) -> bool {
        self.class_of_value(value)
            .is_ok_and(|c| object::inherits_from(&self.memory, c, class))
    }

    /// Slot `index` counting the named fields first, then the indexable
    /// region. Words answer positive integers.
    pub fn fetch_pointer(&mut self, oop: Oop, index: usize) -> Result<Value, VmError> {
        let object = self.memory.object(oop)?;
        let named = object.named.len();
        if index < named {
            return Ok(object.named[index]);
        }
        if let Some(words) = object.words() {
            let word = words.get(index - named).copied().ok_or(
                MemoryError::IndexOutOfBounds { index: index - named, size: words.len() },
            )?;
            return self.positive_32bit_value(word);
        }
        Ok(self.memory.fetch_indexed(oop, index - named)?)
    }

    pub fn store_pointer(&mut self, oop: Oop, index: usize, value: Value) -> Result<(), VmError> {
        let object = self.memory.object(oop)?;
        let named = object.named.len();
        if index < named {
            self.memory.store(oop, index, value)?;
            return Ok(());
        }
        let value = if object.words().is_some() {
            let word = self.positive_32bit_integer_of(value).ok_or(
                MemoryError::NotRepresentable { value, strategy: StrategyKind::Words.name() },
            )?;
            Value::SmallInteger(word as i64)
        } else {
            value
        };
        self.memory.store_indexed(oop, index - named, value)?;
        Ok(())
    }

    pub fn new_array(&mut self, values: Vec<Value>) -> Oop {
        let nil = self.nil();
        self.memory.allocate_with(
            self.special.class_array,
            ObjectFormat::Indexable,
            Vec::new(),
            Storage::from_values(values, nil),
        )
    }

    pub fn new_string(&mut self, text: &str) -> Oop {
        self.memory.allocate_with(
            self.special.class_string,
            ObjectFormat::Bytes { unused: 0 },
            Vec::new(),
            Storage::Bytes(text.bytes().collect()),
        )
    }

    pub fn new_point(&mut self, x: Value, y: Value) -> Result<Oop, VmError> {
        let point = self.memory.instantiate(self.special.class_point, 0)?;
        self.memory.store(point, layout::point::X, x)?;
        self.memory.store(point, layout::point::Y, y)?;
        Ok(point)
    }

    /// A CompiledMethod with `literals` and `bytecodes`.
    pub fn new_method(&mut self, header: MethodHeader, literals: Vec<Value>, bytecodes: Vec<u8>) -> Oop {
        let mut named = Vec::with_capacity(literals.len() + 1);
        named.push(Value::from_i64(header.encode()));
        named.extend(literals);
        self.memory.allocate_with(
            self.special.class_compiled_method,
            ObjectFormat::CompiledMethod { unused: 0 },
            named,
            Storage::Bytes(bytecodes),
        )
    }

    pub fn method_header(&self, method: Oop) -> Result<MethodHeader, VmError> {
        self.memory
            .fetch(method, 0)?
            .as_small_int()
            .map(MethodHeader::decode)
            .ok_or_else(|| VmError::invariant(format!("{method:?} has no method header")))
    }

    /// Literal `index` (0-based) of `method`.
    pub fn literal(&self, method: Oop, index: usize) -> Result<Value, VmError> {
        Ok(self.memory.fetch(method, index + 1)?)
    }

    /// The class a method was compiled in: the value of its last literal
    /// when that is an Association, otherwise the literal itself.
    pub fn method_class(&self, method: Oop) -> Option<Oop> {
        let object = self.memory.get(method)?;
        let last = *object.named.last()?;
        let last = last.as_oop()?;
        let literal = self.memory.get(last)?;
        if literal.class == self.association_class()? && literal.named.len() >= 2 {
            literal.named[layout::association::VALUE].as_oop()
        } else {
            Some(last)
        }
    }

    fn association_class(&self) -> Option<Oop> {
        self.memory.class_of(self.special.scheduler_association).ok()
    }

    /// A non-negative integer below 2^32 as a SmallInteger or a
    /// four-byte LargePositiveInteger.
    pub fn positive_32bit_value(&mut self, n: u32) -> Result<Value, VmError> {
        if n as i64 <= SMALL_INT_MAX {
            return Ok(Value::from_i64(n as i64));
        }
        let large = self.memory.allocate_with(
            self.special.class_large_positive_integer,
            ObjectFormat::Bytes { unused: 0 },
            Vec::new(),
            Storage::Bytes(n.to_le_bytes().to_vec()),
        );
        Ok(Value::Object(large))
    }

    pub fn positive_32bit_integer_of(&self, value: Value) -> Option<u32> {
        match value {
            Value::SmallInteger(n) => u32::try_from(n).ok(),
            Value::Object(oop) => {
                let object = self.memory.get(oop)?;
                if object.class != self.special.class_large_positive_integer {
                    return None;
                }
                let bytes = object.bytes()?;
                if bytes.len() > 4 {
                    return None;
                }
                let mut word = [0u8; 4];
                word[..bytes.len()].copy_from_slice(bytes);
                Some(u32::from_le_bytes(word))
            }
            Value::Float(_) => None,
        }
    }

    pub fn character_for(&self, code: u8) -> Result<Value, VmError> {
        Ok(self
            .memory
            .fetch_indexed(self.special.character_table, code as usize)?)
    }

    /// Code point of a Character object.
    pub fn character_value(&self, value: Value) -> Option<i64> {
        let oop = value.as_oop()?;
        if self.memory.class_of(oop).ok()? != self.special.class_character {
            return None;
        }
        self.memory
            .fetch(oop, layout::character::VALUE)
            .ok()?
            .as_small_int()
    }

    // ── Symbols ────────────────────────────────────────────────────

    /// The class of selectors, taken from `#doesNotUnderstand:`.
    pub fn symbol_class(&self) -> Result<Oop, VmError> {
        self.class_of_value(self.special.selector_does_not_understand)
    }

    /// The unique Symbol spelled `name`, creating it if the image has none.
    ///
    /// The heap is the only authority: `symbols` remembers earlier answers
    /// but is not a root, and entries whose Symbol died are dropped by
    /// `collect_garbage`.
    pub fn intern(&mut self, name: &str) -> Oop {
        let class = self.symbol_class().ok();
        if let Some(&symbol) = self.symbols.get(name) {
            let still_valid = self.memory.get(symbol).is_some_and(|o| {
                Some(o.class) == class && o.bytes() == Some(name.as_bytes())
            });
            if still_valid {
                return symbol;
            }
        }
        let existing = class.and_then(|class| {
            self.memory
                .iter()
                .find(|(_, o)| o.class == class && o.bytes() == Some(name.as_bytes()))
                .map(|(oop, _)| oop)
        });
        let symbol = match (existing, class) {
            (Some(symbol), _) => symbol,
            (None, Some(class)) => self.memory.allocate_with(
                class,
                ObjectFormat::Bytes { unused: 0 },
                Vec::new(),
                Storage::Bytes(name.as_bytes().to_vec()),
            ),
            (None, None) => self.new_string(name),
        };
        self.symbols.insert(name.to_owned(), symbol);
        symbol
    }

    /// Printable name of a selector or class-name value.
    pub fn name_of(&self, value: Value) -> String {
        self.memory
            .string_of(value)
            .unwrap_or_else(|| format!("{value:?}"))
    }

    pub fn class_name(&self, class: Oop) -> String {
        self.memory
            .fetch(class, layout::class::NAME)
            .ok()
            .and_then(|name| self.memory.string_of(name))
            .unwrap_or_else(|| format!("{class:?}"))
    }

    // ── Lookup ─────────────────────────────────────────────────────

    pub(crate) fn lookup_cached(&mut self, class: Oop, selector: Value) -> LookupResult {
        let Some(key) = selector.as_oop().map(|s| (class, s)) else {
            return object::lookup(&self.memory, class, selector);
        };
        if let Some(&found) = self.method_cache.get(&key) {
            return found;
        }
        let found = object::lookup(&self.memory, class, selector);
        self.method_cache.insert(key, found);
        found
    }

    pub fn flush_method_cache(&mut self) {
        self.method_cache.clear();
    }

    // ── Garbage collection ─────────────────────────────────────────

    /// Collect everything unreachable from the special objects, the
    /// interpreter registers and host roots.
    pub fn collect_garbage(&mut self) -> GcStats {
        let mut roots = vec![Value::Object(self.special.array), self.state.receiver];
        roots.extend(
            [
                self.state.context,
                self.state.home,
                self.state.method,
                self.state.new_method,
                self.entry_context,
            ]
            .into_iter()
            .flatten()
            .map(Value::Object),
        );
        roots.extend(self.roots.iter().copied());
        let stats = self.memory.collect(&roots);
        let memory = &self.memory;
        self.symbols.retain(|_, symbol| memory.get(*symbol).is_some());
        self.method_cache.clear();
        self.stats.collections += 1;
        stats
    }

    /// Rough free space reported to the image.
    pub(crate) fn bytes_left(&self) -> Value {
        let free_slots = self.memory.capacity() - self.memory.live_count();
        Value::from_i64(((free_slots as i64) * 64).min(SMALL_INT_MAX))
    }
}
