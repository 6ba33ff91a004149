/// Decoded CompiledMethod header word.
///
/// Bit layout of the SmallInteger stored in the first method slot:
/// primitive low bits `0..=8`, literal count `9..=16`, large frame `17`,
/// temporaries `18..=23`, arguments `24..=27`, primitive high bit `28`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodHeader {
    pub primitive: u16,
    pub literals: usize,
    pub large_frame: bool,
    pub temps: usize,
    pub args: usize,
}

/// Stack slots available to a small frame.
pub const SMALL_FRAME: usize = 16;
/// Stack slots available to a large frame.
pub const LARGE_FRAME: usize = 56;

impl MethodHeader {
    pub fn decode(word: i64) -> Self {
        Self {
            primitive: ((word & 0x1FF) + ((word >> 19) & 0x200)) as u16,
            literals: ((word >> 9) & 0xFF) as usize,
            large_frame: (word >> 17) & 1 == 1,
            temps: ((word >> 18) & 0x3F) as usize,
            args: ((word >> 24) & 0xF) as usize,
        }
    }

    pub fn encode(self) -> i64 {
        let prim = self.primitive as i64;
        (prim & 0x1FF)
            | ((prim & 0x200) << 19)
            | ((self.literals as i64 & 0xFF) << 9)
            | ((self.large_frame as i64) << 17)
            | ((self.temps as i64 & 0x3F) << 18)
            | ((self.args as i64 & 0xF) << 24)
    }

    /// Number of indexable slots a context activating this method needs.
    pub fn frame_size(self) -> usize {
        let base = if self.large_frame { LARGE_FRAME } else { SMALL_FRAME };
        base + self.args
    }

    /// Byte offset of the first bytecode within the method object,
    /// counting the header and literal words.
    pub fn bytecode_offset(self) -> usize {
        (self.literals + 1) * 4
    }

    /// The 1-based pc of the first bytecode.
    pub fn initial_pc(self) -> usize {
        self.bytecode_offset() + 1
    }
}
