use bytecode::{Constant, Instruction, SpecialSelector, decode_at};
use object::layout::{closure, context};
use object::{LookupResult, Oop, Storage, Value};

use crate::primitives::arith::{ArithOp, Numeric};
use crate::{Exit, PrimitiveError, PrimitiveSuccess, VM, VmError};

/// Unwind marker primitive carried by `ensure:` and `ifCurtailed:`.
pub(crate) const UNWIND_MARKER_PRIMITIVE: u16 = 198;

/// Interpreter registers cached from the active context.
#[derive(Debug, Clone)]
pub(crate) struct InterpreterState {
    pub context: Option<Oop>,
    /// Holder of the temporaries: the home of a BlockContext, otherwise
    /// the active context itself.
    pub home: Option<Oop>,
    pub method: Option<Oop>,
    pub receiver: Value,
    /// 1-based byte index into the method, header and literals included.
    pub pc: usize,
    /// Number of occupied slots of the context's indexable region.
    pub sp: usize,
    /// Bytes of header and literals preceding the first bytecode.
    pub bytecode_base: usize,
    /// Method whose primitive is running.
    pub new_method: Option<Oop>,
    /// No process is runnable; the VM waits for the timer or the host.
    pub idle: bool,
    pub last_bytecode: Option<u8>,
    pub last_pc: usize,
}

impl InterpreterState {
    pub fn new(nil: Value) -> Self {
        Self {
            context: None,
            home: None,
            method: None,
            receiver: nil,
            pc: 0,
            sp: 0,
            bytecode_base: 0,
            new_method: None,
            idle: false,
            last_bytecode: None,
            last_pc: 0,
        }
    }
}

impl VM {
    // ── Registers ──────────────────────────────────────────────────

    pub(crate) fn active_context(&self) -> Result<Oop, VmError> {
        self.state
            .context
            .ok_or_else(|| VmError::invariant("no active context"))
    }

    /// Cache the registers of `ctx` and make it the active context.
    pub(crate) fn load_context(&mut self, ctx: Oop) -> Result<(), VmError> {
        let home = if self.is_block_context(ctx) {
            self.memory
                .fetch(ctx, context::HOME)?
                .as_oop()
                .ok_or_else(|| VmError::invariant("block context without a home"))?
        } else {
            ctx
        };
        let method = self
            .memory
            .fetch(home, context::METHOD)?
            .as_oop()
            .ok_or_else(|| VmError::invariant("context without a method"))?;
        let receiver = self.memory.fetch(home, context::RECEIVER)?;
        let pc = self
            .memory
            .fetch(ctx, context::PC)?
            .as_small_int()
            .ok_or_else(|| VmError::invariant(format!("{ctx:?} has already returned")))?;
        let sp = self
            .memory
            .fetch(ctx, context::STACKP)?
            .as_small_int()
            .ok_or_else(|| VmError::invariant(format!("{ctx:?} has no stack pointer")))?;
        let bytecode_base = self.memory.object(method)?.named.len() * 4;

        self.state.context = Some(ctx);
        self.state.home = Some(home);
        self.state.method = Some(method);
        self.state.receiver = receiver;
        self.state.pc = pc as usize;
        self.state.sp = sp as usize;
        self.state.bytecode_base = bytecode_base;
        self.state.idle = false;
        Ok(())
    }

    /// Write the cached pc and stack pointer back into the active context.
    pub(crate) fn flush_registers(&mut self) -> Result<(), VmError> {
        if let Some(ctx) = self.state.context {
            let pc = Value::from_i64(self.state.pc as i64);
            let sp = Value::from_i64(self.state.sp as i64);
            self.memory.store(ctx, context::PC, pc)?;
            self.memory.store(ctx, context::STACKP, sp)?;
        }
        Ok(())
    }

    /// Save the active context and continue in `ctx`.
    pub(crate) fn activate_context(&mut self, ctx: Oop) -> Result<(), VmError> {
        self.flush_registers()?;
        self.load_context(ctx)
    }

    // ── Stack ──────────────────────────────────────────────────────

    pub(crate) fn push(&mut self, value: Value) -> Result<(), VmError> {
        let ctx = self.active_context()?;
        self.memory.store_indexed(ctx, self.state.sp, value)?;
        self.state.sp += 1;
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Result<Value, VmError> {
        let value = self.stack_value(0)?;
        self.state.sp -= 1;
        Ok(value)
    }

    pub(crate) fn pop_n(&mut self, n: usize) -> Result<(), VmError> {
        if n > self.state.sp {
            return Err(VmError::invariant("stack underflow"));
        }
        self.state.sp -= n;
        Ok(())
    }

    pub(crate) fn pop_then_push(&mut self, n: usize, value: Value) -> Result<(), VmError> {
        self.pop_n(n)?;
        self.push(value)
    }

    /// The value `depth` slots below the top of the stack.
    pub(crate) fn stack_value(&self, depth: usize) -> Result<Value, VmError> {
        let ctx = self.active_context()?;
        if depth >= self.state.sp {
            return Err(VmError::invariant("stack underflow"));
        }
        Ok(self.memory.fetch_indexed(ctx, self.state.sp - 1 - depth)?)
    }

    /// The `n` topmost values, deepest first.
    pub(crate) fn stack_values(&self, n: usize) -> Result<Vec<Value>, VmError> {
        (0..n).rev().map(|depth| self.stack_value(depth)).collect()
    }

    fn pop_values(&mut self, n: usize) -> Result<Vec<Value>, VmError> {
        let values = self.stack_values(n)?;
        self.pop_n(n)?;
        Ok(values)
    }

    // ── Variables ──────────────────────────────────────────────────

    fn receiver_object(&self) -> Result<Oop, VmError> {
        self.state
            .receiver
            .as_oop()
            .ok_or_else(|| VmError::invariant("instance variable access on an immediate receiver"))
    }

    fn temp_holder(&self) -> Result<Oop, VmError> {
        self.state
            .home
            .ok_or_else(|| VmError::invariant("no active context"))
    }

    fn temporary(&self, index: usize) -> Result<Value, VmError> {
        Ok(self.memory.fetch_indexed(self.temp_holder()?, index)?)
    }

    fn set_temporary(&mut self, index: usize, value: Value) -> Result<(), VmError> {
        let home = self.temp_holder()?;
        Ok(self.memory.store_indexed(home, index, value)?)
    }

    fn current_method(&self) -> Result<Oop, VmError> {
        self.state
            .method
            .ok_or_else(|| VmError::invariant("no active method"))
    }

    fn association_of(&self, literal: usize) -> Result<Oop, VmError> {
        self.literal(self.current_method()?, literal)?
            .as_oop()
            .ok_or_else(|| VmError::invariant("literal variable is not an association"))
    }

    fn remote_vector(&self, vector: u8) -> Result<Oop, VmError> {
        self.temporary(vector as usize)?
            .as_oop()
            .ok_or_else(|| VmError::invariant("remote temp vector is not an object"))
    }

    fn constant(&self, constant: Constant) -> Value {
        match constant {
            Constant::True => self.special.true_obj,
            Constant::False => self.special.false_obj,
            Constant::Nil => self.special.nil,
            other => Value::from_i64(other.as_int().unwrap_or(0)),
        }
    }

    // ── Fetch and execute ──────────────────────────────────────────

    /// Execute one bytecode, or wait one round while idle.
    pub(crate) fn step(&mut self) -> Result<(), VmError> {
        if self.state.idle {
            return self.idle_wait();
        }
        let method = self.current_method()?;
        let pc = self.state.pc;
        let bytes = self
            .memory
            .bytes_of(method)
            .ok_or_else(|| VmError::invariant(format!("{method:?} has no bytecodes")))?;
        let offset = pc
            .checked_sub(1 + self.state.bytecode_base)
            .ok_or_else(|| VmError::invariant(format!("pc {pc} points into the literal frame")))?;
        let byte = bytes.get(offset).copied();
        let (instruction, next) = decode_at(bytes, offset)
            .ok_or_else(|| VmError::invariant(format!("pc {pc} runs past the end of the method")))?;

        self.state.last_bytecode = byte;
        self.state.last_pc = pc;
        self.state.pc += next - offset;
        self.stats.bytecodes += 1;
        self.execute(instruction)?;

        if self.config.max_bytecodes != 0
            && self.stats.bytecodes >= self.config.max_bytecodes
            && self.exit.is_none()
        {
            self.exit = Some(Exit::BytecodeLimit);
        }
        if self.memory.allocations_since_gc() >= self.config.gc_threshold {
            self.flush_registers()?;
            self.collect_garbage();
        }
        Ok(())
    }

    fn execute(&mut self, instruction: Instruction) -> Result<(), VmError> {
        match instruction {
            Instruction::PushReceiverVariable { index } => {
                let receiver = self.receiver_object()?;
                let value = self.memory.fetch(receiver, index as usize)?;
                self.push(value)
            }
            Instruction::PushTemporary { index } => {
                let value = self.temporary(index as usize)?;
                self.push(value)
            }
            Instruction::PushLiteralConstant { index } => {
                let value = self.literal(self.current_method()?, index as usize)?;
                self.push(value)
            }
            Instruction::PushLiteralVariable { index } => {
                let association = self.association_of(index as usize)?;
                let value = self.memory.fetch(association, object::layout::association::VALUE)?;
                self.push(value)
            }
            Instruction::StoreReceiverVariable { index, pop } => {
                let value = self.stack_value(0)?;
                let receiver = self.receiver_object()?;
                self.memory.store(receiver, index as usize, value)?;
                self.pop_if(pop)
            }
            Instruction::StoreTemporary { index, pop } => {
                let value = self.stack_value(0)?;
                self.set_temporary(index as usize, value)?;
                self.pop_if(pop)
            }
            Instruction::StoreLiteralVariable { index, pop } => {
                let value = self.stack_value(0)?;
                let association = self.association_of(index as usize)?;
                self.memory
                    .store(association, object::layout::association::VALUE, value)?;
                self.pop_if(pop)
            }
            Instruction::PushReceiver => self.push(self.state.receiver),
            Instruction::PushConstant(constant) => self.push(self.constant(constant)),
            Instruction::ReturnReceiver => self.method_return(self.state.receiver),
            Instruction::ReturnConstant(constant) => self.method_return(self.constant(constant)),
            Instruction::ReturnTop => {
                let value = self.pop()?;
                self.method_return(value)
            }
            Instruction::BlockReturnTop => {
                let value = self.pop()?;
                self.return_to_sender(value)
            }
            Instruction::Send { literal, argc } => {
                let selector = self.literal(self.current_method()?, literal as usize)?;
                self.send_selector(selector, argc as usize)
            }
            Instruction::SuperSend { literal, argc } => {
                let method = self.current_method()?;
                let selector = self.literal(method, literal as usize)?;
                self.send_super(method, selector, argc as usize)
            }
            Instruction::SendSpecial(selector) => self.send_special(selector),
            Instruction::Pop => self.pop_n(1),
            Instruction::Dup => {
                let top = self.stack_value(0)?;
                self.push(top)
            }
            Instruction::PushThisContext => {
                let ctx = self.active_context()?;
                self.push(Value::Object(ctx))
            }
            Instruction::PushNewArray { size, pop } => {
                let values = if pop {
                    self.pop_values(size as usize)?
                } else {
                    vec![self.nil(); size as usize]
                };
                let array = self.new_array(values);
                self.push(Value::Object(array))
            }
            Instruction::PushRemoteTemp { index, vector } => {
                let vector = self.remote_vector(vector)?;
                let value = self.memory.fetch_indexed(vector, index as usize)?;
                self.push(value)
            }
            Instruction::StoreRemoteTemp { index, vector, pop } => {
                let value = self.stack_value(0)?;
                let vector = self.remote_vector(vector)?;
                self.memory.store_indexed(vector, index as usize, value)?;
                self.pop_if(pop)
            }
            Instruction::PushClosure { copied, args, body } => {
                self.push_closure(copied as usize, args as usize)?;
                self.state.pc += body as usize;
                Ok(())
            }
            Instruction::Jump { offset } => self.jump(offset),
            Instruction::JumpIfTrue { offset } => self.conditional_jump(true, offset),
            Instruction::JumpIfFalse { offset } => self.conditional_jump(false, offset),
            Instruction::Unassigned(byte) => {
                Err(VmError::invariant(format!("unassigned bytecode {byte}")))
            }
        }
    }

    fn pop_if(&mut self, pop: bool) -> Result<(), VmError> {
        if pop { self.pop_n(1) } else { Ok(()) }
    }

    fn jump(&mut self, offset: i16) -> Result<(), VmError> {
        let target = self.state.pc as isize + offset as isize;
        if target < 1 {
            return Err(VmError::invariant("jump before the start of the method"));
        }
        self.state.pc = target as usize;
        if offset < 0 { self.tick() } else { Ok(()) }
    }

    fn conditional_jump(&mut self, jump_on: bool, offset: i16) -> Result<(), VmError> {
        let value = self.pop()?;
        if value == self.special.bool_value(jump_on) {
            self.jump(offset)
        } else if value == self.special.bool_value(!jump_on) {
            Ok(())
        } else {
            self.send_must_be_boolean(value)
        }
    }

    /// Send `#mustBeBoolean` to a non-Boolean branch condition. The answer
    /// is left on the stack like that of any other send; a handler that
    /// moves the sender's pc back onto the jump has it consumed there.
    fn send_must_be_boolean(&mut self, value: Value) -> Result<(), VmError> {
        self.push(value)?;
        self.send_selector(self.special.selector_must_be_boolean, 0)
    }

    fn push_closure(&mut self, copied: usize, args: usize) -> Result<(), VmError> {
        let class = self
            .special
            .class_block_closure
            .ok_or_else(|| VmError::invariant("closure bytecode in an image without BlockClosure"))?;
        let values = self.pop_values(copied)?;
        let outer = self.active_context()?;
        let closure = self.memory.instantiate(class, copied)?;
        self.memory
            .store(closure, closure::OUTER_CONTEXT, Value::Object(outer))?;
        self.memory
            .store(closure, closure::START_PC, Value::from_i64(self.state.pc as i64))?;
        self.memory
            .store(closure, closure::NUM_ARGS, Value::from_i64(args as i64))?;
        let nil = self.nil();
        self.memory.object_mut(closure)?.storage = Storage::from_values(values, nil);
        self.push(Value::Object(closure))
    }

    // ── Sends ──────────────────────────────────────────────────────

    /// Send `selector` to the receiver `argc` slots below the top.
    pub(crate) fn send_selector(&mut self, selector: Value, argc: usize) -> Result<(), VmError> {
        let receiver = self.stack_value(argc)?;
        let class = self.class_of_value(receiver)?;
        self.send_to_class(selector, argc, class)
    }

    fn send_super(&mut self, method: Oop, selector: Value, argc: usize) -> Result<(), VmError> {
        let start = self
            .method_class(method)
            .and_then(|class| object::superclass_of(&self.memory, class));
        match start {
            Some(class) => self.send_to_class(selector, argc, class),
            None => {
                let receiver = self.stack_value(argc)?;
                let class = self.class_of_value(receiver)?;
                self.stats.sends += 1;
                self.send_does_not_understand(selector, argc, class)?;
                self.tick()
            }
        }
    }

    /// Send with the lookup starting at `class`.
    pub(crate) fn send_to_class(
        &mut self,
        selector: Value,
        argc: usize,
        class: Oop,
    ) -> Result<(), VmError> {
        self.stats.sends += 1;
        if log::log_enabled!(log::Level::Trace) {
            log::trace!("send #{} to {}", self.name_of(selector), self.class_name(class));
        }
        match self.lookup_cached(class, selector) {
            LookupResult::Found { method, .. } => self.execute_method(method, argc)?,
            LookupResult::NotFound => self.send_does_not_understand(selector, argc, class)?,
        }
        self.tick()
    }

    fn send_does_not_understand(
        &mut self,
        selector: Value,
        argc: usize,
        class: Oop,
    ) -> Result<(), VmError> {
        let args = self.pop_values(argc)?;
        let arguments = self.new_array(args);
        let message = self.memory.instantiate(self.special.class_message, 0)?;
        self.memory
            .store(message, object::layout::message::SELECTOR, selector)?;
        self.memory
            .store(message, object::layout::message::ARGUMENTS, Value::Object(arguments))?;
        self.push(Value::Object(message))?;

        let dnu = self.special.selector_does_not_understand;
        match self.lookup_cached(class, dnu) {
            LookupResult::Found { method, .. } => self.execute_method(method, 1),
            LookupResult::NotFound => Err(VmError::invariant(format!(
                "{} does not understand #doesNotUnderstand: (while sending #{})",
                self.class_name(class),
                self.name_of(selector)
            ))),
        }
    }

    /// Run `method` for the receiver and `argc` arguments on the stack:
    /// its primitive first, its bytecodes if there is none or it fails.
    pub(crate) fn execute_method(&mut self, method: Oop, argc: usize) -> Result<(), VmError> {
        let header = self.method_header(method)?;
        if header.args != argc {
            return Err(VmError::invariant(format!(
                "method expects {} arguments, send supplied {argc}",
                header.args
            )));
        }
        match header.primitive {
            0 => {}
            index @ 256..=519 => {
                let receiver = self.stack_value(argc)?;
                if let Some(value) = self.quick_primitive(index, receiver) {
                    return self.pop_then_push(argc + 1, value);
                }
            }
            index => {
                if self.try_primitive(index, method, argc)? {
                    return Ok(());
                }
            }
        }
        self.activate_method(method, argc)
    }

    fn quick_primitive(&self, index: u16, receiver: Value) -> Option<Value> {
        Some(match index {
            256 => receiver,
            257 => self.special.true_obj,
            258 => self.special.false_obj,
            259 => self.special.nil,
            260..=263 => Value::from_i64(index as i64 - 261),
            _ => self
                .memory
                .fetch(receiver.as_oop()?, index as usize - 264)
                .ok()?,
        })
    }

    /// Run primitive `index`. `Ok(false)` means it failed and the method
    /// body must run.
    fn try_primitive(&mut self, index: u16, method: Oop, argc: usize) -> Result<bool, VmError> {
        let func = self
            .primitive(index)
            .filter(|desc| desc.arity.is_none_or(|arity| arity as usize == argc))
            .map(|desc| desc.func);
        let Some(func) = func else {
            self.stats.primitive_failures += 1;
            return Ok(false);
        };
        let receiver = self.stack_value(argc)?;
        let args = self.stack_values(argc)?;
        let previous = self.state.new_method.replace(method);
        let outcome = func(self, receiver, &args);
        self.state.new_method = previous;
        match outcome {
            Ok(PrimitiveSuccess::Return(value)) => {
                self.pop_then_push(argc + 1, value)?;
                Ok(true)
            }
            Ok(PrimitiveSuccess::Handled) => Ok(true),
            Err(PrimitiveError::Failed) => {
                self.stats.primitive_failures += 1;
                Ok(false)
            }
            Err(PrimitiveError::Fatal(err)) => Err(err),
        }
    }

    /// Build a context for `method` and transfer the receiver and
    /// arguments into it.
    fn activate_method(&mut self, method: Oop, argc: usize) -> Result<(), VmError> {
        let header = self.method_header(method)?;
        let receiver = self.stack_value(argc)?;
        let args = self.stack_values(argc)?;
        let sender = self.active_context()?;
        let nil = self.nil();
        let ctx = self.new_context(
            method,
            receiver,
            Value::Object(sender),
            nil,
            header.initial_pc(),
            header.temps.max(argc),
        )?;
        for (i, arg) in args.into_iter().enumerate() {
            self.memory.store_indexed(ctx, i, arg)?;
        }
        self.pop_n(argc + 1)?;
        self.activate_context(ctx)
    }

    fn send_special(&mut self, selector: SpecialSelector) -> Result<(), VmError> {
        match selector {
            SpecialSelector::Identical => {
                let arg = self.pop()?;
                let receiver = self.pop()?;
                return self.push(self.special.bool_value(receiver == arg));
            }
            SpecialSelector::Class => {
                let receiver = self.pop()?;
                let class = self.class_of_value(receiver)?;
                return self.push(Value::Object(class));
            }
            _ => {}
        }
        if let Some(op) = ArithOp::from_special(selector) {
            let receiver = self.stack_value(1)?;
            let arg = self.stack_value(0)?;
            if let Some(value) = self.inline_arithmetic(op, receiver, arg) {
                return self.pop_then_push(2, value);
            }
        }
        let index = selector.index() as usize * 2;
        let table = self.special.special_selectors;
        let name = self.memory.fetch_indexed(table, index)?;
        let argc = self
            .memory
            .fetch_indexed(table, index + 1)?
            .as_small_int()
            .map_or(selector.arg_count(), |n| n as usize);
        self.send_selector(name, argc)
    }

    fn inline_arithmetic(&self, op: ArithOp, receiver: Value, arg: Value) -> Option<Value> {
        let answer = match (receiver, arg) {
            (Value::SmallInteger(a), Value::SmallInteger(b)) => op.integer(a, b)?,
            _ => op.float(number_as_float(receiver)?, number_as_float(arg)?)?,
        };
        match answer {
            Numeric::Int(n) => Value::small_int(n),
            Numeric::Bool(b) => Some(self.special.bool_value(b)),
            Numeric::Float(f) => Some(Value::Float(f)),
        }
    }

    // ── Returns ────────────────────────────────────────────────────

    /// `^value`: a local return from a method, non-local from a block.
    fn method_return(&mut self, value: Value) -> Result<(), VmError> {
        let ctx = self.active_context()?;
        if self.is_block_activation(ctx)? {
            self.non_local_return(ctx, value)
        } else {
            self.return_to_sender(value)
        }
    }

    /// Return `value` from the active context to its sender.
    fn return_to_sender(&mut self, value: Value) -> Result<(), VmError> {
        let ctx = self.active_context()?;
        let sender = self.memory.fetch(ctx, context::SENDER)?;
        if sender == self.nil() {
            if self.entry_context == Some(ctx) {
                self.mark_returned(ctx)?;
                self.state.context = None;
                self.exit = Some(Exit::Returned(value));
                return Ok(());
            }
            return self.send_cannot_return(value);
        }
        let sender = sender
            .as_oop()
            .ok_or_else(|| VmError::invariant("sender is not a context"))?;
        if self.has_returned(sender)? {
            return self.send_cannot_return(value);
        }
        self.mark_returned(ctx)?;
        self.resume_with(sender, value)
    }

    fn non_local_return(&mut self, ctx: Oop, value: Value) -> Result<(), VmError> {
        let home = self.block_home(ctx)?;
        let target = self.memory.fetch(home, context::SENDER)?;
        let Some(target) = target.as_oop().filter(|t| Value::Object(*t) != self.nil()) else {
            return self.send_cannot_return(value);
        };
        if self.has_returned(home)? {
            return self.send_cannot_return(value);
        }

        // The target must be on our own sender chain.
        let mut unwind = None;
        let mut current = ctx;
        while current != target {
            if unwind.is_none() && current != ctx && self.is_unwind_marker(current)? {
                unwind = Some(current);
            }
            match self.memory.fetch(current, context::SENDER)?.as_oop() {
                Some(next) if Value::Object(next) != self.nil() => current = next,
                _ => return self.send_cannot_return(value),
            }
        }

        if let Some(marker) = unwind {
            if let Some(selector) = self.special.selector_about_to_return {
                self.push(Value::Object(ctx))?;
                self.push(value)?;
                self.push(Value::Object(marker))?;
                return self.send_selector(selector, 2);
            }
        }

        let mut current = ctx;
        while current != target {
            let next = self
                .memory
                .fetch(current, context::SENDER)?
                .as_oop()
                .ok_or_else(|| VmError::invariant("sender chain changed during unwind"))?;
            self.mark_returned(current)?;
            current = next;
        }
        self.resume_with(target, value)
    }

    fn send_cannot_return(&mut self, value: Value) -> Result<(), VmError> {
        let ctx = self.active_context()?;
        log::warn!("{ctx:?} cannot return {value:?}");
        self.push(Value::Object(ctx))?;
        self.push(value)?;
        self.send_selector(self.special.selector_cannot_return, 1)
    }

    /// Continue in `ctx` with `value` as the answer of its pending send.
    pub(crate) fn resume_with(&mut self, ctx: Oop, value: Value) -> Result<(), VmError> {
        self.state.context = None;
        self.load_context(ctx)?;
        self.push(value)
    }
}

fn number_as_float(value: Value) -> Option<f64> {
    match value {
        Value::SmallInteger(n) => Some(n as f64),
        Value::Float(f) => Some(f),
        Value::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use bytecode::{BytecodeBuilder, Constant, SpecialSelector};
    use object::layout;

    use crate::special::{MethodDef, bootstrap};
    use crate::{Exit, VM, VmConfig, VmError};

    use super::*;

    fn vm() -> VM {
        bootstrap(VmConfig::default())
    }

    fn class_named(vm: &VM, name: &str) -> Oop {
        vm.global(name).expect("bootstrap class")
    }

    fn returned(result: Result<Exit, crate::Halt>) -> Value {
        match result {
            Ok(Exit::Returned(value)) => value,
            other => panic!("expected a returned value, got {other:?}"),
        }
    }

    // ── Arithmetic and sends ───────────────────────────────────────

    #[test]
    fn inline_arithmetic_and_comparison() {
        let mut vm = vm();
        let object = class_named(&vm, "Object");
        let mut code = BytecodeBuilder::new();
        code.push_constant(Constant::Two);
        code.push_literal_constant(0);
        code.send_special(SpecialSelector::Mul);
        code.push_constant(Constant::One);
        code.send_special(SpecialSelector::Sub);
        code.return_top();
        vm.define_method(object, "compute", MethodDef::new(code).literal(Value::from_i64(21)));

        let result = returned(vm.send_message(vm.nil(), "compute", &[]));
        assert_eq!(result, Value::from_i64(41));
    }

    #[test]
    fn arithmetic_overflow_falls_back_to_a_send() {
        let mut vm = vm();
        let max = Value::from_i64(object::SMALL_INT_MAX);
        // SmallInteger>>+ has primitive 1, which fails on overflow and
        // answers nil from its fallback code.
        let result = returned(vm.send_message(max, "+", &[Value::from_i64(1)]));
        assert_eq!(result, vm.nil());
    }

    #[test]
    fn inline_arithmetic_mixes_floats() {
        let mut vm = vm();
        let object = class_named(&vm, "Object");
        let mut code = BytecodeBuilder::new();
        code.push_temporary(0);
        code.push_temporary(1);
        code.send_special(SpecialSelector::Add);
        code.return_top();
        vm.define_method(object, "add:to:", MethodDef::new(code).args(2));

        let result = vm.send_message(vm.nil(), "add:to:", &[Value::from_i64(3), Value::Float(0.5)]);
        assert_eq!(returned(result), Value::Float(3.5));
    }

    #[test]
    fn super_send_starts_above_the_method_class() {
        let mut vm = vm();
        let a = vm.define_class("A", None, 0);
        let b = vm.define_class("B", Some(a), 0);
        let c = vm.define_class("C", Some(b), 0);

        let mut code = BytecodeBuilder::new();
        code.push_constant(Constant::One);
        code.return_top();
        vm.define_method(a, "foo", MethodDef::new(code));

        let mut code = BytecodeBuilder::new();
        code.push_receiver();
        code.super_send(0, 0);
        code.push_constant(Constant::Two);
        code.send_special(SpecialSelector::Add);
        code.return_top();
        let foo = Value::Object(vm.intern("foo"));
        vm.define_method(b, "foo", MethodDef::new(code).literal(foo));

        let instance = vm.memory.instantiate(c, 0).unwrap();
        let result = returned(vm.send_message(Value::Object(instance), "foo", &[]));
        assert_eq!(result, Value::from_i64(3));
    }

    #[test]
    fn unknown_selector_reaches_does_not_understand() {
        let mut vm = vm();
        let result = returned(vm.send_message(Value::from_i64(3), "frobnicate:", &[Value::from_i64(4)]));
        // The bootstrap handler answers the Message.
        let message = result.as_oop().unwrap();
        assert_eq!(vm.memory.class_of(message).unwrap(), vm.special.class_message);
        let selector = vm.memory.fetch(message, layout::message::SELECTOR).unwrap();
        assert_eq!(vm.name_of(selector), "frobnicate:");
        let args = vm.memory.fetch(message, layout::message::ARGUMENTS).unwrap();
        assert_eq!(
            vm.memory.fetch_indexed(args.as_oop().unwrap(), 0).unwrap(),
            Value::from_i64(4)
        );
    }

    #[test]
    fn missing_does_not_understand_handler_is_fatal() {
        let mut vm = vm();
        let object = class_named(&vm, "Object");
        let dnu = vm.special.selector_does_not_understand;
        vm.remove_method(object, dnu);
        let err = vm.send_message(Value::from_i64(3), "frobnicate", &[]).unwrap_err();
        assert!(matches!(err.error, VmError::ImageInvariantViolated(_)));
        assert!(!err.chain.is_empty());
    }

    #[test]
    fn failed_primitive_leaves_operands_untouched() {
        let mut vm = vm();
        let array = vm.new_array(vec![Value::from_i64(1), Value::from_i64(2)]);
        // Out of range: primitive 60 fails, the fallback answers nil.
        let result = returned(vm.send_message(Value::Object(array), "at:", &[Value::from_i64(9)]));
        assert_eq!(result, vm.nil());
        let result = returned(vm.send_message(
            Value::Object(array),
            "at:put:",
            &[Value::from_i64(3), Value::from_i64(7)],
        ));
        assert_eq!(result, vm.nil());
        assert_eq!(vm.memory.indexable_len(array).unwrap(), 2);
        assert_eq!(vm.memory.fetch_indexed(array, 1).unwrap(), Value::from_i64(2));
        assert!(vm.stats().primitive_failures >= 2);
    }

    #[test]
    fn perform_dispatches_by_selector() {
        let mut vm = vm();
        let plus = Value::Object(vm.intern("+"));
        let result = returned(vm.send_message(
            Value::from_i64(40),
            "perform:with:",
            &[plus, Value::from_i64(2)],
        ));
        assert_eq!(result, Value::from_i64(42));
    }

    // ── Control flow ───────────────────────────────────────────────

    #[test]
    fn non_boolean_condition_answer_reenters_the_jump() {
        let mut vm = vm();
        let object = class_named(&vm, "Object");
        let small_integer = class_named(&vm, "SmallInteger");
        // ^ (2 + 1) ifTrue: [1] ifFalse: [2] compiled inline.
        let mut code = BytecodeBuilder::new();
        code.push_constant(Constant::Two);
        code.push_constant(Constant::One);
        code.send_special(SpecialSelector::Add);
        let else_branch = code.jump_if_false();
        code.push_constant(Constant::One);
        code.return_top();
        code.bind(else_branch);
        code.push_constant(Constant::Two);
        code.return_top();
        vm.define_method(object, "branch", MethodDef::new(code));

        // mustBeBoolean
        //   | s | s := thisContext instVarAt: 1.
        //   s instVarAt: 2 put: (s instVarAt: 2) - 2.
        //   ^ self > 5
        let inst_var_at = Value::Object(vm.intern("instVarAt:"));
        let inst_var_at_put = Value::Object(vm.intern("instVarAt:put:"));
        let mut handler = BytecodeBuilder::new();
        handler.push_this_context();
        handler.push_constant(Constant::One);
        handler.send(0, 1);
        handler.pop_into_temporary(0);
        handler.push_temporary(0);
        handler.push_constant(Constant::Two);
        handler.push_temporary(0);
        handler.push_constant(Constant::Two);
        handler.send(0, 1);
        handler.push_constant(Constant::Two);
        handler.send_special(SpecialSelector::Sub);
        handler.send(1, 2);
        handler.pop();
        handler.push_receiver();
        handler.push_literal_constant(2);
        handler.send_special(SpecialSelector::Gt);
        handler.return_top();
        vm.define_method(
            small_integer,
            "mustBeBoolean",
            MethodDef::new(handler)
                .temps(1)
                .literal(inst_var_at)
                .literal(inst_var_at_put)
                .literal(Value::from_i64(5)),
        );

        // The handler answers false on the stack, the jump runs again and
        // takes the ifFalse: branch.
        let result = returned(vm.send_message(vm.nil(), "branch", &[]));
        assert_eq!(result, Value::from_i64(2));
    }

    #[test]
    fn non_boolean_condition_answer_stays_on_the_stack() {
        let mut vm = vm();
        let object = class_named(&vm, "Object");
        // The default handler answers nil without rewinding, so the answer
        // is what the method returns after the jump.
        let mut code = BytecodeBuilder::new();
        code.push_literal_constant(0);
        code.push_literal_constant(0);
        let skip = code.jump_if_true();
        code.return_top();
        code.bind(skip);
        code.push_constant(Constant::Zero);
        code.return_top();
        vm.define_method(object, "leftover", MethodDef::new(code).literal(Value::from_i64(9)));

        let result = returned(vm.send_message(vm.nil(), "leftover", &[]));
        assert_eq!(result, vm.nil());
    }

    #[test]
    fn multi_byte_instructions_advance_by_their_length() {
        let mut vm = vm();
        let object = class_named(&vm, "Object");
        // Extended pop-store, extended push and a long jump are two bytes
        // each; the skipped pair must never run.
        let mut code = BytecodeBuilder::new();
        code.push_literal_constant(0);
        code.pop_into_temporary(20);
        code.push_temporary(20);
        let skip = code.jump();
        code.push_constant(Constant::Zero);
        code.return_top();
        code.bind(skip);
        code.return_top();
        vm.define_method(
            object,
            "wide",
            MethodDef::new(code).temps(21).literal(Value::from_i64(7)),
        );

        let before = vm.stats().bytecodes;
        let result = returned(vm.send_message(vm.nil(), "wide", &[]));
        assert_eq!(result, Value::from_i64(7));
        assert_eq!(vm.stats().bytecodes - before, 5);
    }

    #[test]
    fn boolean_condition_jumps_natively() {
        let mut vm = vm();
        let object = class_named(&vm, "Object");
        let mut code = BytecodeBuilder::new();
        code.push_temporary(0);
        let else_branch = code.jump_if_false();
        code.push_constant(Constant::One);
        code.return_top();
        code.bind(else_branch);
        code.push_constant(Constant::Two);
        code.return_top();
        vm.define_method(object, "pick:", MethodDef::new(code).args(1));

        let t = vm.special.true_obj;
        let f = vm.special.false_obj;
        assert_eq!(returned(vm.send_message(vm.nil(), "pick:", &[t])), Value::from_i64(1));
        assert_eq!(returned(vm.send_message(vm.nil(), "pick:", &[f])), Value::from_i64(2));
    }

    #[test]
    fn backward_jump_loops() {
        let mut vm = vm();
        let object = class_named(&vm, "Object");
        // | i | i := 0. [i < 10] whileTrue: [i := i + 1]. ^i
        let mut code = BytecodeBuilder::new();
        code.push_constant(Constant::Zero);
        code.pop_into_temporary(0);
        let top = code.current_offset();
        code.push_temporary(0);
        code.push_literal_constant(0);
        code.send_special(SpecialSelector::Lt);
        let exit = code.jump_if_false();
        code.push_temporary(0);
        code.push_constant(Constant::One);
        code.send_special(SpecialSelector::Add);
        code.pop_into_temporary(0);
        code.jump_back(top);
        code.bind(exit);
        code.push_temporary(0);
        code.return_top();
        vm.define_method(
            object,
            "count",
            MethodDef::new(code).temps(1).literal(Value::from_i64(10)),
        );

        assert_eq!(returned(vm.send_message(vm.nil(), "count", &[])), Value::from_i64(10));
    }

    #[test]
    fn closure_captures_copied_values() {
        let mut vm = vm();
        let object = class_named(&vm, "Object");
        // adder: x  ^[:y | x + y] value: 5
        let mut code = BytecodeBuilder::new();
        code.push_temporary(0);
        let body = code.push_closure(1, 1);
        code.push_temporary(1);
        code.push_temporary(0);
        code.send_special(SpecialSelector::Add);
        code.block_return_top();
        code.bind(body);
        code.push_constant(Constant::Two);
        code.push_constant(Constant::Two);
        code.send_special(SpecialSelector::Add);
        code.push_constant(Constant::One);
        code.send_special(SpecialSelector::Add);
        code.send_special(SpecialSelector::ValueWithArg);
        code.return_top();
        vm.define_method(object, "adder:", MethodDef::new(code).args(1));

        let result = returned(vm.send_message(vm.nil(), "adder:", &[Value::from_i64(10)]));
        assert_eq!(result, Value::from_i64(15));
    }

    #[test]
    fn remote_temps_are_shared_with_blocks() {
        let mut vm = vm();
        let object = class_named(&vm, "Object");
        // | v | v := Array new: 1. [v at: 1 put: 7] value. ^v at: 1
        let mut code = BytecodeBuilder::new();
        code.push_new_array(1, false);
        code.pop_into_temporary(0);
        code.push_temporary(0);
        let body = code.push_closure(1, 0);
        code.push_literal_constant(0);
        code.store_remote_temp(0, 0);
        code.block_return_top();
        code.bind(body);
        code.send_special(SpecialSelector::Value);
        code.pop();
        code.push_remote_temp(0, 0);
        code.return_top();
        vm.define_method(
            object,
            "shared",
            MethodDef::new(code).temps(1).literal(Value::from_i64(7)),
        );

        assert_eq!(returned(vm.send_message(vm.nil(), "shared", &[])), Value::from_i64(7));
    }

    #[test]
    fn non_local_return_unwinds_to_home_sender() {
        let mut vm = vm();
        let object = class_named(&vm, "Object");
        // callBlock: aBlock  aBlock value. ^#notReached
        let mut code = BytecodeBuilder::new();
        code.push_temporary(0);
        code.send_special(SpecialSelector::Value);
        code.pop();
        code.push_constant(Constant::MinusOne);
        code.return_top();
        vm.define_method(object, "callBlock:", MethodDef::new(code).args(1));

        // escape  self callBlock: [^42]. ^0
        let mut code = BytecodeBuilder::new();
        code.push_receiver();
        let body = code.push_closure(0, 0);
        code.push_literal_constant(0);
        code.return_top();
        code.bind(body);
        code.send(1, 1);
        code.pop();
        code.push_constant(Constant::Zero);
        code.return_top();
        let call_block = Value::Object(vm.intern("callBlock:"));
        vm.define_method(
            object,
            "escape",
            MethodDef::new(code).literal(Value::from_i64(42)).literal(call_block),
        );

        assert_eq!(returned(vm.send_message(vm.nil(), "escape", &[])), Value::from_i64(42));
    }

    #[test]
    fn non_local_return_from_dead_home_sends_cannot_return() {
        let mut vm = vm();
        let object = class_named(&vm, "Object");
        // makeBlock  ^[^7]
        let mut code = BytecodeBuilder::new();
        let body = code.push_closure(0, 0);
        code.push_literal_constant(0);
        code.return_top();
        code.block_return_top();
        code.bind(body);
        code.return_top();
        vm.define_method(
            object,
            "makeBlock",
            MethodDef::new(code).literal(Value::from_i64(7)),
        );

        let block = returned(vm.send_message(vm.nil(), "makeBlock", &[]));
        // The home has returned: ^7 sends #cannotReturn:, whose handler
        // answers 7; the block then answers it with its block return.
        let result = returned(vm.send_message(block, "value", &[]));
        assert_eq!(result, Value::from_i64(7));
    }

    #[test]
    fn unwind_marker_diverts_non_local_return() {
        let mut vm = vm();
        let object = class_named(&vm, "Object");
        // protect: aBlock  <primitive: 198>  ^aBlock value
        let mut code = BytecodeBuilder::new();
        code.push_temporary(0);
        code.send_special(SpecialSelector::Value);
        code.return_top();
        vm.define_method(
            object,
            "protect:",
            MethodDef::new(code).args(1).primitive(UNWIND_MARKER_PRIMITIVE),
        );

        // guarded  ^self protect: [^5]
        let mut code = BytecodeBuilder::new();
        code.push_receiver();
        let body = code.push_closure(0, 0);
        code.push_literal_constant(0);
        code.return_top();
        code.block_return_top();
        code.bind(body);
        code.send(1, 1);
        code.return_top();
        let protect = Value::Object(vm.intern("protect:"));
        vm.define_method(
            object,
            "guarded",
            MethodDef::new(code).literal(Value::from_i64(5)).literal(protect),
        );

        // The bootstrap #aboutToReturn:through: answers the unwind context;
        // the block's implicit block return hands it back through protect:.
        let result = returned(vm.send_message(vm.nil(), "guarded", &[]));
        let marker = result.as_oop().expect("unwind context");
        let method = vm.memory.fetch(marker, layout::context::METHOD).unwrap();
        let header = vm.method_header(method.as_oop().unwrap()).unwrap();
        assert_eq!(header.primitive, UNWIND_MARKER_PRIMITIVE);
    }

    #[test]
    fn block_context_value_runs_in_home() {
        let mut vm = vm();
        let object = class_named(&vm, "Object");
        // Pre-closure block: | t | t := 3. ^[t + 1] value
        let mut code = BytecodeBuilder::new();
        code.push_literal_constant(0);
        code.pop_into_temporary(0);
        code.push_this_context();
        code.push_constant(Constant::Zero);
        code.send_special(SpecialSelector::BlockCopy);
        let body = code.jump();
        code.push_temporary(0);
        code.push_constant(Constant::One);
        code.send_special(SpecialSelector::Add);
        code.block_return_top();
        code.bind(body);
        code.send_special(SpecialSelector::Value);
        code.return_top();
        vm.define_method(
            object,
            "oldBlock",
            MethodDef::new(code).temps(1).literal(Value::from_i64(3)),
        );

        assert_eq!(returned(vm.send_message(vm.nil(), "oldBlock", &[])), Value::from_i64(4));
    }

    #[test]
    fn unassigned_bytecode_halts_with_diagnostics() {
        let mut vm = vm();
        let object = class_named(&vm, "Object");
        let mut code = BytecodeBuilder::new();
        code.raw(126);
        vm.define_method(object, "broken", MethodDef::new(code));

        let halt = vm.send_message(vm.nil(), "broken", &[]).unwrap_err();
        assert!(matches!(halt.error, VmError::ImageInvariantViolated(_)));
        assert_eq!(halt.bytecode, Some(126));
        assert!(halt.chain[0].contains("broken"));
    }

    #[test]
    fn bytecode_limit_stops_the_loop() {
        let mut vm = vm();
        vm.config.max_bytecodes = 50;
        let object = class_named(&vm, "Object");
        let mut code = BytecodeBuilder::new();
        let top = code.current_offset();
        code.push_constant(Constant::One);
        code.pop();
        code.jump_back(top);
        vm.define_method(object, "spin", MethodDef::new(code));

        assert_eq!(vm.send_message(vm.nil(), "spin", &[]).unwrap(), Exit::BytecodeLimit);
    }
}
