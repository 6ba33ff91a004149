/// Bytecode families of the V3 instruction set.
///
/// Most families pack their operand into the opcode byte itself
/// (`0..=15` push receiver variable `n`, and so on). The extended forms
/// carry one to three operand bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// `0..=15`
    PushReceiverVariable,
    /// `16..=31`
    PushTemporary,
    /// `32..=63`
    PushLiteralConstant,
    /// `64..=95`: pushes the value of a literal association.
    PushLiteralVariable,
    /// `96..=103`
    PopIntoReceiverVariable,
    /// `104..=111`
    PopIntoTemporary,
    /// `112..=119`: self, true, false, nil, -1, 0, 1, 2.
    PushSpecial,
    /// `120..=123`: return self, true, false, nil.
    ReturnSpecial,
    /// `124`
    ReturnTop,
    /// `125`
    BlockReturnTop,
    /// `128 <kind:2 index:6>`
    ExtendedPush,
    /// `129 <kind:2 index:6>`
    ExtendedStore,
    /// `130 <kind:2 index:6>`
    ExtendedPopStore,
    /// `131 <argc:3 literal:5>`
    SingleExtendedSend,
    /// `132 <op:3 argc:5> <operand:8>`
    DoubleExtended,
    /// `133 <argc:3 literal:5>`
    SingleExtendedSuper,
    /// `134 <argc:2 literal:6>`
    SecondExtendedSend,
    /// `135`
    Pop,
    /// `136`
    Dup,
    /// `137`
    PushThisContext,
    /// `138 <pop:1 size:7>`
    PushNewArray,
    /// `140 <index> <vector>`
    PushRemoteTemp,
    /// `141 <index> <vector>`
    StoreRemoteTemp,
    /// `142 <index> <vector>`
    PopIntoRemoteTemp,
    /// `143 <copied:4 args:4> <size_hi> <size_lo>`
    PushClosure,
    /// `144..=151`: forward 1 to 8.
    ShortJump,
    /// `152..=159`: pop, forward 1 to 8 if false.
    ShortJumpIfFalse,
    /// `160..=167 <lo>`: offset `(n - 4) * 256 + lo`.
    LongJump,
    /// `168..=171 <lo>`: pop, forward `n * 256 + lo` if true.
    LongJumpIfTrue,
    /// `172..=175 <lo>`: pop, forward `n * 256 + lo` if false.
    LongJumpIfFalse,
    /// `176..=207`
    SendSpecial,
    /// `208..=255`: literal selector with 0, 1 or 2 arguments.
    SendLiteral,
    /// `126`, `127`, `139`.
    Unassigned,
}

impl Op {
    pub const fn of(byte: u8) -> Self {
        match byte {
            0..=15 => Op::PushReceiverVariable,
            16..=31 => Op::PushTemporary,
            32..=63 => Op::PushLiteralConstant,
            64..=95 => Op::PushLiteralVariable,
            96..=103 => Op::PopIntoReceiverVariable,
            104..=111 => Op::PopIntoTemporary,
            112..=119 => Op::PushSpecial,
            120..=123 => Op::ReturnSpecial,
            124 => Op::ReturnTop,
            125 => Op::BlockReturnTop,
            128 => Op::ExtendedPush,
            129 => Op::ExtendedStore,
            130 => Op::ExtendedPopStore,
            131 => Op::SingleExtendedSend,
            132 => Op::DoubleExtended,
            133 => Op::SingleExtendedSuper,
            134 => Op::SecondExtendedSend,
            135 => Op::Pop,
            136 => Op::Dup,
            137 => Op::PushThisContext,
            138 => Op::PushNewArray,
            140 => Op::PushRemoteTemp,
            141 => Op::StoreRemoteTemp,
            142 => Op::PopIntoRemoteTemp,
            143 => Op::PushClosure,
            144..=151 => Op::ShortJump,
            152..=159 => Op::ShortJumpIfFalse,
            160..=167 => Op::LongJump,
            168..=171 => Op::LongJumpIfTrue,
            172..=175 => Op::LongJumpIfFalse,
            176..=207 => Op::SendSpecial,
            208..=255 => Op::SendLiteral,
            126 | 127 | 139 => Op::Unassigned,
        }
    }

    /// Total instruction length in bytes, opcode included.
    pub const fn length(self) -> usize {
        match self {
            Op::ExtendedPush
            | Op::ExtendedStore
            | Op::ExtendedPopStore
            | Op::SingleExtendedSend
            | Op::SingleExtendedSuper
            | Op::SecondExtendedSend
            | Op::PushNewArray
            | Op::LongJump
            | Op::LongJumpIfTrue
            | Op::LongJumpIfFalse => 2,
            Op::DoubleExtended
            | Op::PushRemoteTemp
            | Op::StoreRemoteTemp
            | Op::PopIntoRemoteTemp => 3,
            Op::PushClosure => 4,
            _ => 1,
        }
    }
}

/// First opcode byte of each family, for encoders.
pub mod base {
    pub const PUSH_RECEIVER_VARIABLE: u8 = 0;
    pub const PUSH_TEMPORARY: u8 = 16;
    pub const PUSH_LITERAL_CONSTANT: u8 = 32;
    pub const PUSH_LITERAL_VARIABLE: u8 = 64;
    pub const POP_INTO_RECEIVER_VARIABLE: u8 = 96;
    pub const POP_INTO_TEMPORARY: u8 = 104;
    pub const PUSH_RECEIVER: u8 = 112;
    pub const RETURN_RECEIVER: u8 = 120;
    pub const RETURN_TOP: u8 = 124;
    pub const BLOCK_RETURN_TOP: u8 = 125;
    pub const EXTENDED_PUSH: u8 = 128;
    pub const EXTENDED_STORE: u8 = 129;
    pub const EXTENDED_POP_STORE: u8 = 130;
    pub const SINGLE_EXTENDED_SEND: u8 = 131;
    pub const DOUBLE_EXTENDED: u8 = 132;
    pub const SINGLE_EXTENDED_SUPER: u8 = 133;
    pub const SECOND_EXTENDED_SEND: u8 = 134;
    pub const POP: u8 = 135;
    pub const DUP: u8 = 136;
    pub const PUSH_THIS_CONTEXT: u8 = 137;
    pub const PUSH_NEW_ARRAY: u8 = 138;
    pub const PUSH_REMOTE_TEMP: u8 = 140;
    pub const STORE_REMOTE_TEMP: u8 = 141;
    pub const POP_INTO_REMOTE_TEMP: u8 = 142;
    pub const PUSH_CLOSURE: u8 = 143;
    pub const SHORT_JUMP: u8 = 144;
    pub const SHORT_JUMP_IF_FALSE: u8 = 152;
    pub const LONG_JUMP: u8 = 160;
    pub const LONG_JUMP_IF_TRUE: u8 = 168;
    pub const LONG_JUMP_IF_FALSE: u8 = 172;
    pub const SEND_SPECIAL: u8 = 176;
    pub const SEND_LITERAL: u8 = 208;
}

/// Selectors sent by bytecodes `176..=207`, in opcode order.
///
/// The selector objects themselves live in the image's special selectors
/// array at `2 * index`, with the argument count at `2 * index + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SpecialSelector {
    Add = 0,
    Sub,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    Mul,
    Div,
    Mod,
    MakePoint,
    BitShift,
    IntDiv,
    BitAnd,
    BitOr,
    At,
    AtPut,
    Size,
    Next,
    NextPut,
    AtEnd,
    Identical,
    Class,
    BlockCopy,
    Value,
    ValueWithArg,
    Do,
    New,
    NewWithArg,
    X,
    Y,
}

impl SpecialSelector {
    pub const COUNT: usize = 32;

    const ALL: [SpecialSelector; Self::COUNT] = {
        use SpecialSelector::*;
        [
            Add, Sub, Lt, Gt, Le, Ge, Eq, Ne, Mul, Div, Mod, MakePoint, BitShift,
            IntDiv, BitAnd, BitOr, At, AtPut, Size, Next, NextPut, AtEnd,
            Identical, Class, BlockCopy, Value, ValueWithArg, Do, New,
            NewWithArg, X, Y,
        ]
    };

    pub const fn from_index(index: u8) -> Option<Self> {
        if (index as usize) < Self::COUNT {
            Some(Self::ALL[index as usize])
        } else {
            None
        }
    }

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn arg_count(self) -> usize {
        use SpecialSelector::*;
        match self {
            AtPut => 2,
            Size | Next | AtEnd | Class | Value | New | X | Y => 0,
            _ => 1,
        }
    }

    pub const fn name(self) -> &'static str {
        use SpecialSelector::*;
        match self {
            Add => "+",
            Sub => "-",
            Lt => "<",
            Gt => ">",
            Le => "<=",
            Ge => ">=",
            Eq => "=",
            Ne => "~=",
            Mul => "*",
            Div => "/",
            Mod => "\\\\",
            MakePoint => "@",
            BitShift => "bitShift:",
            IntDiv => "//",
            BitAnd => "bitAnd:",
            BitOr => "bitOr:",
            At => "at:",
            AtPut => "at:put:",
            Size => "size",
            Next => "next",
            NextPut => "nextPut:",
            AtEnd => "atEnd",
            Identical => "==",
            Class => "class",
            BlockCopy => "blockCopy:",
            Value => "value",
            ValueWithArg => "value:",
            Do => "do:",
            New => "new",
            NewWithArg => "new:",
            X => "x",
            Y => "y",
        }
    }
}
