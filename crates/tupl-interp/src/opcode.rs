//! Instruction set and word encoding.
//!
//! ```text
//! bits  0..6   opcode
//! bits  6..9   r1
//! bits  9..12  r2
//! bits 12..15  r3
//! bit  15      reserved, must be zero
//! bits 16..32  imm16
//! ```
//!
//! Branch and call targets in `imm16` are word offsets from the start of
//! the region holding the instruction (calls: from the start of the
//! subroutine region).

use std::cmp::Ordering;
use std::fmt;

/// Number of general registers.
pub const NUM_REGS: usize = 8;

/// Instruction opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// `r1 := attr(imm)`; 1 word.
    ReadAttr = 0,
    /// `attr(imm) := r1`; 1 word. Update programs only.
    WriteAttr = 1,
    /// `r1 := NULL`.
    LoadNull = 2,
    /// `r1 := imm` as a 32-bit value.
    LoadConst16 = 3,
    /// `r1 := next word`; 2 words.
    LoadConst32 = 4,
    /// `r1 := next two words (low, high)`; 3 words.
    LoadConst64 = 5,
    /// `r1 := r2 + r3` (64-bit, wrapping).
    Add = 6,
    /// `r1 := r2 - r3` (64-bit, wrapping).
    Sub = 7,
    /// Jump to imm.
    Branch = 8,
    BranchRegNull = 9,
    BranchRegNotNull = 10,
    /// Jump if `r1 <cond r3> r2`.
    BranchRegCmp = 11,
    /// Jump if `attr <cond r3> literal`; word 1 is `attr | len << 16`,
    /// followed by the literal bytes packed into words.
    BranchAttrCmp = 12,
    /// Jump to imm if the attribute in word 1 is NULL; 2 words.
    BranchAttrNull = 13,
    BranchAttrNotNull = 14,
    /// Push return address, jump to subroutine offset imm.
    Call = 15,
    Return = 16,
    ExitOk = 17,
    ExitOkLast = 18,
    /// Refuse the row with code imm.
    ExitRefuse = 19,
}

impl Opcode {
    pub const fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::ReadAttr,
            1 => Self::WriteAttr,
            2 => Self::LoadNull,
            3 => Self::LoadConst16,
            4 => Self::LoadConst32,
            5 => Self::LoadConst64,
            6 => Self::Add,
            7 => Self::Sub,
            8 => Self::Branch,
            9 => Self::BranchRegNull,
            10 => Self::BranchRegNotNull,
            11 => Self::BranchRegCmp,
            12 => Self::BranchAttrCmp,
            13 => Self::BranchAttrNull,
            14 => Self::BranchAttrNotNull,
            15 => Self::Call,
            16 => Self::Return,
            17 => Self::ExitOk,
            18 => Self::ExitOkLast,
            19 => Self::ExitRefuse,
            _ => return None,
        })
    }

    /// Whether `imm16` holds a region-relative jump target.
    pub const fn is_branch(self) -> bool {
        matches!(
            self,
            Self::Branch
                | Self::BranchRegNull
                | Self::BranchRegNotNull
                | Self::BranchRegCmp
                | Self::BranchAttrCmp
                | Self::BranchAttrNull
                | Self::BranchAttrNotNull
        )
    }
}

/// Branch condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cond {
    Eq = 0,
    Ne = 1,
    Lt = 2,
    Le = 3,
    Gt = 4,
    Ge = 5,
    /// Attribute comparisons only.
    Like = 6,
    /// Attribute comparisons only.
    NotLike = 7,
}

impl Cond {
    pub const fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Eq,
            1 => Self::Ne,
            2 => Self::Lt,
            3 => Self::Le,
            4 => Self::Gt,
            5 => Self::Ge,
            6 => Self::Like,
            7 => Self::NotLike,
            _ => return None,
        })
    }

    /// Evaluate an ordering condition. `Like`/`NotLike` never hold here.
    pub const fn holds(self, ord: Ordering) -> bool {
        match self {
            Self::Eq => matches!(ord, Ordering::Equal),
            Self::Ne => !matches!(ord, Ordering::Equal),
            Self::Lt => matches!(ord, Ordering::Less),
            Self::Le => !matches!(ord, Ordering::Greater),
            Self::Gt => matches!(ord, Ordering::Greater),
            Self::Ge => !matches!(ord, Ordering::Less),
            Self::Like | Self::NotLike => false,
        }
    }

    pub const fn is_like(self) -> bool {
        matches!(self, Self::Like | Self::NotLike)
    }
}

/// General register `r0..r7`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg(u8);

impl Reg {
    pub const R0: Self = Self(0);
    pub const R1: Self = Self(1);
    pub const R2: Self = Self(2);
    pub const R3: Self = Self(3);
    pub const R4: Self = Self(4);
    pub const R5: Self = Self(5);
    pub const R6: Self = Self(6);
    pub const R7: Self = Self(7);

    #[allow(clippy::cast_possible_truncation)]
    pub const fn new(n: u8) -> Option<Self> {
        if (n as usize) < NUM_REGS {
            Some(Self(n))
        } else {
            None
        }
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Decoded first word of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr {
    pub op: Opcode,
    pub r1: Reg,
    pub r2: Reg,
    pub r3: u8,
    pub imm: u16,
}

impl Instr {
    /// Encode an instruction word.
    pub const fn encode(op: Opcode, r1: Reg, r2: Reg, r3: u8, imm: u16) -> u32 {
        (op as u32)
            | ((r1.0 as u32) << 6)
            | ((r2.0 as u32) << 9)
            | (((r3 & 0x7) as u32) << 12)
            | ((imm as u32) << 16)
    }

    /// Decode an instruction word; `None` for an unknown opcode or a set
    /// reserved bit.
    #[allow(clippy::cast_possible_truncation)]
    pub const fn decode(word: u32) -> Option<Self> {
        if word & (1 << 15) != 0 {
            return None;
        }
        let Some(op) = Opcode::from_u8((word & 0x3f) as u8) else {
            return None;
        };
        Some(Self {
            op,
            r1: Reg(((word >> 6) & 0x7) as u8),
            r2: Reg(((word >> 9) & 0x7) as u8),
            r3: ((word >> 12) & 0x7) as u8,
            imm: (word >> 16) as u16,
        })
    }

    /// Words this instruction occupies, given its second word when present.
    pub const fn width(self, second: Option<u32>) -> usize {
        match self.op {
            Opcode::LoadConst32 | Opcode::BranchAttrNull | Opcode::BranchAttrNotNull => 2,
            Opcode::LoadConst64 => 3,
            Opcode::BranchAttrCmp => match second {
                Some(w) => 2 + ((w >> 16) as usize).div_ceil(4),
                None => 2,
            },
            _ => 1,
        }
    }
}
