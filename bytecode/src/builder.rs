use crate::instruction::Constant;
use crate::op::{SpecialSelector, base};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LabelKind {
    Jump,
    JumpIfTrue,
    JumpIfFalse,
    ClosureBody,
}

/// A forward reference whose offset has not yet been resolved.
///
/// Created by [`BytecodeBuilder::jump`], [`BytecodeBuilder::jump_if_true`],
/// [`BytecodeBuilder::jump_if_false`] and [`BytecodeBuilder::push_closure`].
/// Resolve it with [`BytecodeBuilder::bind`].
#[derive(Debug)]
pub struct Label {
    /// Position of the opcode byte to patch.
    opcode_pos: usize,
    /// Position right after the instruction (base for relative offset).
    base: usize,
    kind: LabelKind,
}

/// Builds a V3 bytecode byte sequence.
///
/// Each operation picks the shortest encoding that fits its operands.
/// Forward jumps always use the two-byte long forms so that they can be
/// patched in place.
pub struct BytecodeBuilder {
    buf: Vec<u8>,
}

impl BytecodeBuilder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Current byte offset in the bytecode stream.
    pub fn current_offset(&self) -> usize {
        self.buf.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    // ── emit helpers ───────────────────────────────────────────────

    fn emit(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn extended(kind: u8, index: u8) -> u8 {
        debug_assert!(index < 64, "extended index out of range: {index}");
        (kind << 6) | index
    }

    fn double_extended(&mut self, op: u8, low: u8, operand: u8) {
        self.emit(&[base::DOUBLE_EXTENDED, (op << 5) | low, operand]);
    }

    /// Append a raw byte. Used to build malformed methods in tests.
    pub fn raw(&mut self, byte: u8) {
        self.buf.push(byte);
    }

    // ── pushes ─────────────────────────────────────────────────────

    pub fn push_receiver_variable(&mut self, index: u8) {
        match index {
            0..=15 => self.emit(&[base::PUSH_RECEIVER_VARIABLE + index]),
            16..=63 => self.emit(&[base::EXTENDED_PUSH, Self::extended(0, index)]),
            _ => self.double_extended(2, 0, index),
        }
    }

    pub fn push_temporary(&mut self, index: u8) {
        match index {
            0..=15 => self.emit(&[base::PUSH_TEMPORARY + index]),
            _ => self.emit(&[base::EXTENDED_PUSH, Self::extended(1, index)]),
        }
    }

    pub fn push_literal_constant(&mut self, index: u8) {
        match index {
            0..=31 => self.emit(&[base::PUSH_LITERAL_CONSTANT + index]),
            32..=63 => self.emit(&[base::EXTENDED_PUSH, Self::extended(2, index)]),
            _ => self.double_extended(3, 0, index),
        }
    }

    /// Push the value of the association at literal `index`.
    pub fn push_literal_variable(&mut self, index: u8) {
        match index {
            0..=31 => self.emit(&[base::PUSH_LITERAL_VARIABLE + index]),
            32..=63 => self.emit(&[base::EXTENDED_PUSH, Self::extended(3, index)]),
            _ => self.double_extended(4, 0, index),
        }
    }

    pub fn push_receiver(&mut self) {
        self.emit(&[base::PUSH_RECEIVER]);
    }

    pub fn push_constant(&mut self, constant: Constant) {
        let offset = match constant {
            Constant::True => 1,
            Constant::False => 2,
            Constant::Nil => 3,
            Constant::MinusOne => 4,
            Constant::Zero => 5,
            Constant::One => 6,
            Constant::Two => 7,
        };
        self.emit(&[base::PUSH_RECEIVER + offset]);
    }

    pub fn push_this_context(&mut self) {
        self.emit(&[base::PUSH_THIS_CONTEXT]);
    }

    /// `138`: push a fresh array of `size` nils, or pop `size` values into it.
    pub fn push_new_array(&mut self, size: u8, pop: bool) {
        debug_assert!(size < 128);
        let flag = if pop { 0x80 } else { 0 };
        self.emit(&[base::PUSH_NEW_ARRAY, flag | size]);
    }

    pub fn push_remote_temp(&mut self, index: u8, vector: u8) {
        self.emit(&[base::PUSH_REMOTE_TEMP, index, vector]);
    }

    // ── stores ─────────────────────────────────────────────────────

    pub fn store_receiver_variable(&mut self, index: u8) {
        match index {
            0..=63 => self.emit(&[base::EXTENDED_STORE, Self::extended(0, index)]),
            _ => self.double_extended(5, 0, index),
        }
    }

    pub fn pop_into_receiver_variable(&mut self, index: u8) {
        match index {
            0..=7 => self.emit(&[base::POP_INTO_RECEIVER_VARIABLE + index]),
            8..=63 => self.emit(&[base::EXTENDED_POP_STORE, Self::extended(0, index)]),
            _ => self.double_extended(6, 0, index),
        }
    }

    pub fn store_temporary(&mut self, index: u8) {
        self.emit(&[base::EXTENDED_STORE, Self::extended(1, index)]);
    }

    pub fn pop_into_temporary(&mut self, index: u8) {
        match index {
            0..=7 => self.emit(&[base::POP_INTO_TEMPORARY + index]),
            _ => self.emit(&[base::EXTENDED_POP_STORE, Self::extended(1, index)]),
        }
    }

    pub fn store_literal_variable(&mut self, index: u8) {
        match index {
            0..=63 => self.emit(&[base::EXTENDED_STORE, Self::extended(3, index)]),
            _ => self.double_extended(7, 0, index),
        }
    }

    pub fn pop_into_literal_variable(&mut self, index: u8) {
        self.emit(&[base::EXTENDED_POP_STORE, Self::extended(3, index)]);
    }

    pub fn store_remote_temp(&mut self, index: u8, vector: u8) {
        self.emit(&[base::STORE_REMOTE_TEMP, index, vector]);
    }

    pub fn pop_into_remote_temp(&mut self, index: u8, vector: u8) {
        self.emit(&[base::POP_INTO_REMOTE_TEMP, index, vector]);
    }

    // ── stack ──────────────────────────────────────────────────────

    pub fn pop(&mut self) {
        self.emit(&[base::POP]);
    }

    pub fn dup(&mut self) {
        self.emit(&[base::DUP]);
    }

    // ── sends ──────────────────────────────────────────────────────

    /// Send the selector at literal `literal` with `argc` arguments.
    pub fn send(&mut self, literal: u8, argc: u8) {
        if argc <= 2 && literal < 16 {
            self.emit(&[base::SEND_LITERAL + argc * 16 + literal]);
        } else if argc < 8 && literal < 32 {
            self.emit(&[base::SINGLE_EXTENDED_SEND, (argc << 5) | literal]);
        } else if argc < 4 && literal < 64 {
            self.emit(&[base::SECOND_EXTENDED_SEND, (argc << 6) | literal]);
        } else {
            debug_assert!(argc < 32);
            self.double_extended(0, argc, literal);
        }
    }

    pub fn super_send(&mut self, literal: u8, argc: u8) {
        if argc < 8 && literal < 32 {
            self.emit(&[base::SINGLE_EXTENDED_SUPER, (argc << 5) | literal]);
        } else {
            debug_assert!(argc < 32);
            self.double_extended(1, argc, literal);
        }
    }

    pub fn send_special(&mut self, selector: SpecialSelector) {
        self.emit(&[base::SEND_SPECIAL + selector.index() as u8]);
    }

    // ── returns ────────────────────────────────────────────────────

    pub fn return_receiver(&mut self) {
        self.emit(&[base::RETURN_RECEIVER]);
    }

    /// Return a constant. `true`, `false` and `nil` have their own
    /// bytecodes; anything else is pushed and returned from the stack.
    pub fn return_constant(&mut self, constant: Constant) {
        let offset = match constant {
            Constant::True => 1,
            Constant::False => 2,
            Constant::Nil => 3,
            other => {
                self.push_constant(other);
                self.return_top();
                return;
            }
        };
        self.emit(&[base::RETURN_RECEIVER + offset]);
    }

    /// `124`: return top of stack from the home method.
    pub fn return_top(&mut self) {
        self.emit(&[base::RETURN_TOP]);
    }

    /// `125`: return top of stack to the block's caller.
    pub fn block_return_top(&mut self) {
        self.emit(&[base::BLOCK_RETURN_TOP]);
    }

    // ── control flow ───────────────────────────────────────────────

    /// `143`: push a closure over the next `body` bytes. Bind the returned
    /// label right after emitting the block body.
    pub fn push_closure(&mut self, copied: u8, args: u8) -> Label {
        debug_assert!(copied < 16 && args < 16);
        let opcode_pos = self.current_offset();
        self.emit(&[base::PUSH_CLOSURE, (copied << 4) | args, 0, 0]);
        Label {
            opcode_pos,
            base: self.current_offset(),
            kind: LabelKind::ClosureBody,
        }
    }

    fn forward(&mut self, opcode: u8, kind: LabelKind) -> Label {
        let opcode_pos = self.current_offset();
        self.emit(&[opcode, 0]);
        Label {
            opcode_pos,
            base: self.current_offset(),
            kind,
        }
    }

    /// Unconditional forward jump.
    pub fn jump(&mut self) -> Label {
        self.forward(base::LONG_JUMP + 4, LabelKind::Jump)
    }

    /// Pop; jump forward if the value was `true`.
    pub fn jump_if_true(&mut self) -> Label {
        self.forward(base::LONG_JUMP_IF_TRUE, LabelKind::JumpIfTrue)
    }

    /// Pop; jump forward if the value was `false`.
    pub fn jump_if_false(&mut self) -> Label {
        self.forward(base::LONG_JUMP_IF_FALSE, LabelKind::JumpIfFalse)
    }

    /// Bind a forward label to the current position.
    pub fn bind(&mut self, label: Label) {
        let offset = self.current_offset() - label.base;
        let pos = label.opcode_pos;
        match label.kind {
            LabelKind::ClosureBody => {
                assert!(offset <= u16::MAX as usize, "block body too large: {offset}");
                self.buf[pos + 2..pos + 4].copy_from_slice(&(offset as u16).to_be_bytes());
            }
            LabelKind::Jump => {
                assert!(offset < 1024, "jump offset too large: {offset}");
                self.buf[pos] = base::LONG_JUMP + 4 + (offset >> 8) as u8;
                self.buf[pos + 1] = offset as u8;
            }
            LabelKind::JumpIfTrue | LabelKind::JumpIfFalse => {
                assert!(offset < 1024, "jump offset too large: {offset}");
                let first = if label.kind == LabelKind::JumpIfTrue {
                    base::LONG_JUMP_IF_TRUE
                } else {
                    base::LONG_JUMP_IF_FALSE
                };
                self.buf[pos] = first + (offset >> 8) as u8;
                self.buf[pos + 1] = offset as u8;
            }
        }
    }

    /// Emit a backward jump to `target` (an earlier offset).
    pub fn jump_back(&mut self, target: usize) {
        let after = self.current_offset() + 2;
        let offset = target as isize - after as isize;
        assert!((-1024..0).contains(&offset), "backward jump out of range: {offset}");
        let high = ((offset >> 8) + 4) as u8;
        self.emit(&[base::LONG_JUMP + high, (offset & 0xFF) as u8]);
    }
}

impl Default for BytecodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
