use crate::instruction::{Constant, Instruction};
use crate::op::{Op, SpecialSelector};

/// Decodes a V3 bytecode byte slice into [`Instruction`]s.
///
/// Unlike the opcode byte, operand bytes may be missing at the end of a
/// malformed method; the decoder then stops instead of reading past the
/// slice.
pub struct BytecodeDecoder<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BytecodeDecoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Start decoding at byte offset `pos`.
    pub fn at(bytes: &'a [u8], pos: usize) -> Self {
        Self { bytes, pos }
    }

    /// Current byte offset in the stream.
    #[inline(always)]
    pub fn offset(&self) -> usize {
        self.pos
    }

    #[inline(always)]
    pub fn is_at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    /// Decode the next instruction, or `None` at the end of the stream or
    /// on a truncated instruction.
    pub fn decode_next(&mut self) -> Option<Instruction> {
        let (instr, next) = decode_at(self.bytes, self.pos)?;
        self.pos = next;
        Some(instr)
    }
}

impl Iterator for BytecodeDecoder<'_> {
    type Item = Instruction;

    fn next(&mut self) -> Option<Instruction> {
        self.decode_next()
    }
}

/// Decode the instruction at `pos`, returning it with the offset of the
/// following instruction.
#[inline]
pub fn decode_at(bytes: &[u8], pos: usize) -> Option<(Instruction, usize)> {
    let byte = *bytes.get(pos)?;
    let op = Op::of(byte);
    let next = pos + op.length();
    if next > bytes.len() {
        return None;
    }
    let b1 = || bytes[pos + 1];
    let b2 = || bytes[pos + 2];

    let instr = match op {
        Op::PushReceiverVariable => Instruction::PushReceiverVariable { index: byte & 0xF },
        Op::PushTemporary => Instruction::PushTemporary { index: byte & 0xF },
        Op::PushLiteralConstant => Instruction::PushLiteralConstant { index: byte & 0x1F },
        Op::PushLiteralVariable => Instruction::PushLiteralVariable { index: byte & 0x1F },
        Op::PopIntoReceiverVariable => {
            Instruction::StoreReceiverVariable { index: byte & 7, pop: true }
        }
        Op::PopIntoTemporary => Instruction::StoreTemporary { index: byte & 7, pop: true },
        Op::PushSpecial => match byte & 7 {
            0 => Instruction::PushReceiver,
            1 => Instruction::PushConstant(Constant::True),
            2 => Instruction::PushConstant(Constant::False),
            3 => Instruction::PushConstant(Constant::Nil),
            4 => Instruction::PushConstant(Constant::MinusOne),
            5 => Instruction::PushConstant(Constant::Zero),
            6 => Instruction::PushConstant(Constant::One),
            _ => Instruction::PushConstant(Constant::Two),
        },
        Op::ReturnSpecial => match byte & 3 {
            0 => Instruction::ReturnReceiver,
            1 => Instruction::ReturnConstant(Constant::True),
            2 => Instruction::ReturnConstant(Constant::False),
            _ => Instruction::ReturnConstant(Constant::Nil),
        },
        Op::ReturnTop => Instruction::ReturnTop,
        Op::BlockReturnTop => Instruction::BlockReturnTop,
        Op::ExtendedPush => {
            let index = b1() & 0x3F;
            match b1() >> 6 {
                0 => Instruction::PushReceiverVariable { index },
                1 => Instruction::PushTemporary { index },
                2 => Instruction::PushLiteralConstant { index },
                _ => Instruction::PushLiteralVariable { index },
            }
        }
        Op::ExtendedStore | Op::ExtendedPopStore => {
            let pop = op == Op::ExtendedPopStore;
            let index = b1() & 0x3F;
            match b1() >> 6 {
                0 => Instruction::StoreReceiverVariable { index, pop },
                1 => Instruction::StoreTemporary { index, pop },
                2 => Instruction::Unassigned(byte),
                _ => Instruction::StoreLiteralVariable { index, pop },
            }
        }
        Op::SingleExtendedSend => Instruction::Send { literal: b1() & 0x1F, argc: b1() >> 5 },
        Op::DoubleExtended => {
            let operand = b2();
            match b1() >> 5 {
                0 => Instruction::Send { literal: operand, argc: b1() & 0x1F },
                1 => Instruction::SuperSend { literal: operand, argc: b1() & 0x1F },
                2 => Instruction::PushReceiverVariable { index: operand },
                3 => Instruction::PushLiteralConstant { index: operand },
                4 => Instruction::PushLiteralVariable { index: operand },
                5 => Instruction::StoreReceiverVariable { index: operand, pop: false },
                6 => Instruction::StoreReceiverVariable { index: operand, pop: true },
                _ => Instruction::StoreLiteralVariable { index: operand, pop: false },
            }
        }
        Op::SingleExtendedSuper => {
            Instruction::SuperSend { literal: b1() & 0x1F, argc: b1() >> 5 }
        }
        Op::SecondExtendedSend => Instruction::Send { literal: b1() & 0x3F, argc: b1() >> 6 },
        Op::Pop => Instruction::Pop,
        Op::Dup => Instruction::Dup,
        Op::PushThisContext => Instruction::PushThisContext,
        Op::PushNewArray => Instruction::PushNewArray { size: b1() & 0x7F, pop: b1() & 0x80 != 0 },
        Op::PushRemoteTemp => Instruction::PushRemoteTemp { index: b1(), vector: b2() },
        Op::StoreRemoteTemp => {
            Instruction::StoreRemoteTemp { index: b1(), vector: b2(), pop: false }
        }
        Op::PopIntoRemoteTemp => {
            Instruction::StoreRemoteTemp { index: b1(), vector: b2(), pop: true }
        }
        Op::PushClosure => Instruction::PushClosure {
            copied: b1() >> 4,
            args: b1() & 0xF,
            body: ((b2() as u16) << 8) | bytes[pos + 3] as u16,
        },
        Op::ShortJump => Instruction::Jump { offset: (byte & 7) as i16 + 1 },
        Op::ShortJumpIfFalse => Instruction::JumpIfFalse { offset: (byte & 7) as i16 + 1 },
        Op::LongJump => Instruction::Jump {
            offset: (((byte & 7) as i16) - 4) * 256 + b1() as i16,
        },
        Op::LongJumpIfTrue => Instruction::JumpIfTrue {
            offset: ((byte & 3) as i16) * 256 + b1() as i16,
        },
        Op::LongJumpIfFalse => Instruction::JumpIfFalse {
            offset: ((byte & 3) as i16) * 256 + b1() as i16,
        },
        Op::SendSpecial => match SpecialSelector::from_index(byte - 176) {
            Some(sel) => Instruction::SendSpecial(sel),
            None => Instruction::Unassigned(byte),
        },
        Op::SendLiteral => Instruction::Send {
            literal: byte & 0xF,
            argc: (byte - 208) >> 4,
        },
        Op::Unassigned => Instruction::Unassigned(byte),
    };
    Some((instr, next))
}
