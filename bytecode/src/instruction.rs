use core::fmt;

use crate::op::SpecialSelector;

/// Constants pushed by `112..=119` and returned by `120..=123`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constant {
    True,
    False,
    Nil,
    MinusOne,
    Zero,
    One,
    Two,
}

impl Constant {
    pub const fn as_int(self) -> Option<i64> {
        match self {
            Constant::MinusOne => Some(-1),
            Constant::Zero => Some(0),
            Constant::One => Some(1),
            Constant::Two => Some(2),
            _ => None,
        }
    }
}

/// A decoded instruction with its operands extracted.
///
/// Jump offsets are relative to the byte following the instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    PushReceiverVariable { index: u8 },
    PushTemporary { index: u8 },
    PushLiteralConstant { index: u8 },
    PushLiteralVariable { index: u8 },
    StoreReceiverVariable { index: u8, pop: bool },
    StoreTemporary { index: u8, pop: bool },
    StoreLiteralVariable { index: u8, pop: bool },
    PushReceiver,
    PushConstant(Constant),
    ReturnReceiver,
    ReturnConstant(Constant),
    ReturnTop,
    BlockReturnTop,
    Send { literal: u8, argc: u8 },
    SuperSend { literal: u8, argc: u8 },
    SendSpecial(SpecialSelector),
    Pop,
    Dup,
    PushThisContext,
    PushNewArray { size: u8, pop: bool },
    PushRemoteTemp { index: u8, vector: u8 },
    StoreRemoteTemp { index: u8, vector: u8, pop: bool },
    PushClosure { copied: u8, args: u8, body: u16 },
    Jump { offset: i16 },
    JumpIfTrue { offset: i16 },
    JumpIfFalse { offset: i16 },
    Unassigned(u8),
}

impl Instruction {
    /// Whether executing this instruction may transfer control backwards.
    pub const fn is_backward_jump(self) -> bool {
        matches!(self, Instruction::Jump { offset } if offset < 0)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pop = |p: &bool| if *p { "Pop" } else { "" };
        match self {
            Self::PushReceiverVariable { index } => write!(f, "PushRcvr {index}"),
            Self::PushTemporary { index } => write!(f, "PushTemp {index}"),
            Self::PushLiteralConstant { index } => write!(f, "PushLit #{index}"),
            Self::PushLiteralVariable { index } => write!(f, "PushLitVar #{index}"),
            Self::StoreReceiverVariable { index, pop: p } => {
                write!(f, "{}StoreRcvr {index}", pop(p))
            }
            Self::StoreTemporary { index, pop: p } => {
                write!(f, "{}StoreTemp {index}", pop(p))
            }
            Self::StoreLiteralVariable { index, pop: p } => {
                write!(f, "{}StoreLitVar #{index}", pop(p))
            }
            Self::PushReceiver => write!(f, "PushSelf"),
            Self::PushConstant(c) => write!(f, "Push {c:?}"),
            Self::ReturnReceiver => write!(f, "ReturnSelf"),
            Self::ReturnConstant(c) => write!(f, "Return {c:?}"),
            Self::ReturnTop => write!(f, "ReturnTop"),
            Self::BlockReturnTop => write!(f, "BlockReturnTop"),
            Self::Send { literal, argc } => write!(f, "Send #{literal}/{argc}"),
            Self::SuperSend { literal, argc } => write!(f, "SuperSend #{literal}/{argc}"),
            Self::SendSpecial(sel) => write!(f, "Send {}", sel.name()),
            Self::Pop => write!(f, "Pop"),
            Self::Dup => write!(f, "Dup"),
            Self::PushThisContext => write!(f, "PushThisContext"),
            Self::PushNewArray { size, pop: p } => {
                if *p {
                    write!(f, "PopIntoArray {size}")
                } else {
                    write!(f, "PushNewArray {size}")
                }
            }
            Self::PushRemoteTemp { index, vector } => {
                write!(f, "PushRemoteTemp {index} @{vector}")
            }
            Self::StoreRemoteTemp { index, vector, pop: p } => {
                write!(f, "{}StoreRemoteTemp {index} @{vector}", pop(p))
            }
            Self::PushClosure { copied, args, body } => {
                write!(f, "PushClosure copy:{copied} args:{args} size:{body}")
            }
            Self::Jump { offset } => write!(f, "Jump {offset}"),
            Self::JumpIfTrue { offset } => write!(f, "JumpIfTrue {offset}"),
            Self::JumpIfFalse { offset } => write!(f, "JumpIfFalse {offset}"),
            Self::Unassigned(byte) => write!(f, "Unassigned {byte}"),
        }
    }
}
