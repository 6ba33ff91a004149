use object::layout::{closure, context};
use object::{LookupResult, Oop, Value};

use crate::interpreter::UNWIND_MARKER_PRIMITIVE;
use crate::{VM, VmError};

/// Contexts listed by [`VM::describe_chain`] before it gives up.
const MAX_CHAIN_DEPTH: usize = 64;

impl VM {
    /// A fresh MethodContext for `method`, sized by its header.
    pub(crate) fn new_context(
        &mut self,
        method: Oop,
        receiver: Value,
        sender: Value,
        closure: Value,
        pc: usize,
        stackp: usize,
    ) -> Result<Oop, VmError> {
        let header = self.method_header(method)?;
        let size = header.frame_size().max(stackp);
        let ctx = self.memory.instantiate(self.special.class_method_context, size)?;
        let fields = [
            (context::SENDER, sender),
            (context::PC, Value::from_i64(pc as i64)),
            (context::STACKP, Value::from_i64(stackp as i64)),
            (context::METHOD, Value::Object(method)),
            (context::CLOSURE, closure),
            (context::RECEIVER, receiver),
        ];
        for (index, value) in fields {
            self.memory.store(ctx, index, value)?;
        }
        Ok(ctx)
    }

    pub(crate) fn is_block_context(&self, ctx: Oop) -> bool {
        self.memory
            .class_of(ctx)
            .is_ok_and(|class| class == self.special.class_block_context)
    }

    /// Whether `^` in `ctx` is a non-local return: a BlockContext, or a
    /// MethodContext running a closure.
    pub(crate) fn is_block_activation(&self, ctx: Oop) -> Result<bool, VmError> {
        if self.is_block_context(ctx) {
            return Ok(true);
        }
        Ok(self.memory.fetch(ctx, context::CLOSURE)? != self.nil())
    }

    /// A context that has returned has neither a pc nor a sender.
    pub(crate) fn has_returned(&self, ctx: Oop) -> Result<bool, VmError> {
        let nil = self.nil();
        Ok(self.memory.fetch(ctx, context::PC)? == nil
            && self.memory.fetch(ctx, context::SENDER)? == nil)
    }

    pub(crate) fn mark_returned(&mut self, ctx: Oop) -> Result<(), VmError> {
        let nil = self.nil();
        self.memory.store(ctx, context::PC, nil)?;
        self.memory.store(ctx, context::SENDER, nil)?;
        Ok(())
    }

    /// The method activation a block was created in. Closures nested in
    /// closures are followed outwards through their outer contexts.
    pub(crate) fn block_home(&self, ctx: Oop) -> Result<Oop, VmError> {
        let mut current = ctx;
        for _ in 0..MAX_CHAIN_DEPTH * 16 {
            if self.is_block_context(current) {
                return self.context_field(current, context::HOME);
            }
            let closure = self.memory.fetch(current, context::CLOSURE)?;
            if closure == self.nil() {
                return Ok(current);
            }
            let closure = closure
                .as_oop()
                .ok_or_else(|| VmError::invariant("closure slot holds an immediate"))?;
            current = self.context_field(closure, closure::OUTER_CONTEXT)?;
        }
        Err(VmError::invariant("closure nesting does not reach a method context"))
    }

    fn context_field(&self, oop: Oop, index: usize) -> Result<Oop, VmError> {
        self.memory
            .fetch(oop, index)?
            .as_oop()
            .filter(|o| Value::Object(*o) != self.nil())
            .ok_or_else(|| VmError::invariant(format!("{oop:?} slot {index} is not a context")))
    }

    /// Contexts of methods marked for `ensure:`/`ifCurtailed:` unwinding.
    pub(crate) fn is_unwind_marker(&self, ctx: Oop) -> Result<bool, VmError> {
        if self.is_block_context(ctx) {
            return Ok(false);
        }
        let Some(method) = self.memory.fetch(ctx, context::METHOD)?.as_oop() else {
            return Ok(false);
        };
        Ok(self.method_header(method)?.primitive == UNWIND_MARKER_PRIMITIVE)
    }

    /// One line per context from the active one down the sender chain.
    pub(crate) fn describe_chain(&self) -> Vec<String> {
        let mut lines = Vec::new();
        let mut current = self.state.context;
        while let Some(ctx) = current {
            if lines.len() == MAX_CHAIN_DEPTH {
                lines.push("...".to_owned());
                break;
            }
            lines.push(self.describe_context(ctx));
            current = self
                .memory
                .fetch(ctx, context::SENDER)
                .ok()
                .and_then(Value::as_oop)
                .filter(|o| Value::Object(*o) != self.nil());
        }
        lines
    }

    fn describe_context(&self, ctx: Oop) -> String {
        let home = if self.is_block_context(ctx) {
            self.memory.fetch(ctx, context::HOME).ok().and_then(Value::as_oop)
        } else {
            Some(ctx)
        };
        let method = home
            .and_then(|h| self.memory.fetch(h, context::METHOD).ok())
            .and_then(Value::as_oop);
        let in_block = self.is_block_activation(ctx).unwrap_or(false);
        let prefix = if in_block { "[] in " } else { "" };
        let Some(method) = method else {
            return format!("{prefix}{ctx:?} (no method)");
        };
        let Some(class) = self.method_class(method) else {
            return format!("{prefix}{method:?}");
        };
        let selector = self.selector_of(class, method).unwrap_or_else(|| "?".to_owned());
        format!("{prefix}{}>>{selector}", self.class_name(class))
    }

    /// The selector under which `class` holds `method`.
    fn selector_of(&self, class: Oop, method: Oop) -> Option<String> {
        let dict = self
            .memory
            .fetch(class, object::layout::class::METHOD_DICT)
            .ok()?
            .as_oop()?;
        let dict = self.memory.get(dict)?;
        let nil = self.nil();
        (0..dict.storage.len()).find_map(|i| {
            let selector = dict.storage.fetch(i, nil)?;
            match object::lookup(&self.memory, class, selector) {
                LookupResult::Found { method: found, .. } if found == method => {
                    Some(self.name_of(selector))
                }
                _ => None,
            }
        })
    }
}
