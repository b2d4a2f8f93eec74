//! Instruction decoder and disassembler.
//!
//! Turns up to six little-endian bytes into an [`Instruction`]. Decoding is a
//! pure function of its input; nothing here touches CPU state.

use std::fmt;

use crate::error::CpuError;

/// Largest instruction: one opcode word plus source and destination words.
pub const MAX_INSTRUCTION_BYTES: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    SingleOperand,
    CondJump,
    DoubleOperand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingleOp {
    Rrc,
    Swpb,
    Rra,
    Sxt,
    Push,
    Call,
    Reti,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoubleOp {
    Mov,
    Add,
    Addc,
    Subc,
    Sub,
    Cmp,
    Dadd,
    Bit,
    Bic,
    Bis,
    Xor,
    And,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    NotZero,
    Zero,
    NotCarry,
    Carry,
    Negative,
    GreaterEqual,
    Less,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Single(SingleOp),
    Jump(Condition),
    Double(DoubleOp),
}

/// Constant-generator shortcuts: no register read, no extension word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constant {
    Zero,
    One,
    Two,
    Four,
    Eight,
    MinusOne,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressingMode {
    RegisterDirect,
    Indexed,
    RegisterIndirect,
    IndirectIncrement,
    Absolute,
    Immediate,
    Constant(Constant),
}

/// One decoded fetch.
///
/// `src_*` describes the only operand of a single-operand instruction. Jumps
/// only use `offset`, already converted to a signed byte displacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub operation: Operation,
    /// The B/W bit as encoded; see [`Instruction::is_byte`] for what it means.
    pub byte_flag: bool,
    pub src_mode: AddressingMode,
    pub src_reg: u8,
    pub src_ext: i16,
    pub dst_mode: AddressingMode,
    pub dst_reg: u8,
    pub dst_ext: i16,
    pub offset: i16,
    /// Total size in bytes: 2, 4 or 6.
    pub width: u8,
    raw: [u8; MAX_INSTRUCTION_BYTES],
}

impl Constant {
    pub fn value(self) -> u16 {
        match self {
            Constant::Zero => 0,
            Constant::One => 1,
            Constant::Two => 2,
            Constant::Four => 4,
            Constant::Eight => 8,
            Constant::MinusOne => 0xFFFF,
        }
    }
}

impl AddressingMode {
    pub fn needs_extension_word(self) -> bool {
        matches!(
            self,
            AddressingMode::Indexed | AddressingMode::Absolute | AddressingMode::Immediate
        )
    }
}

impl SingleOp {
    fn from_bits(bits: u16) -> Option<Self> {
        Some(match bits {
            0 => SingleOp::Rrc,
            1 => SingleOp::Swpb,
            2 => SingleOp::Rra,
            3 => SingleOp::Sxt,
            4 => SingleOp::Push,
            5 => SingleOp::Call,
            6 => SingleOp::Reti,
            _ => return None,
        })
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            SingleOp::Rrc => "RRC",
            SingleOp::Swpb => "SWPB",
            SingleOp::Rra => "RRA",
            SingleOp::Sxt => "SXT",
            SingleOp::Push => "PUSH",
            SingleOp::Call => "CALL",
            SingleOp::Reti => "RETI",
        }
    }
}

impl DoubleOp {
    fn from_bits(bits: u16) -> Option<Self> {
        Some(match bits {
            4 => DoubleOp::Mov,
            5 => DoubleOp::Add,
            6 => DoubleOp::Addc,
            7 => DoubleOp::Subc,
            8 => DoubleOp::Sub,
            9 => DoubleOp::Cmp,
            10 => DoubleOp::Dadd,
            11 => DoubleOp::Bit,
            12 => DoubleOp::Bic,
            13 => DoubleOp::Bis,
            14 => DoubleOp::Xor,
            15 => DoubleOp::And,
            _ => return None,
        })
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            DoubleOp::Mov => "MOV",
            DoubleOp::Add => "ADD",
            DoubleOp::Addc => "ADDC",
            DoubleOp::Subc => "SUBC",
            DoubleOp::Sub => "SUB",
            DoubleOp::Cmp => "CMP",
            DoubleOp::Dadd => "DADD",
            DoubleOp::Bit => "BIT",
            DoubleOp::Bic => "BIC",
            DoubleOp::Bis => "BIS",
            DoubleOp::Xor => "XOR",
            DoubleOp::And => "AND",
        }
    }
}

impl Condition {
    fn from_bits(bits: u16) -> Self {
        match bits & 7 {
            0 => Condition::NotZero,
            1 => Condition::Zero,
            2 => Condition::NotCarry,
            3 => Condition::Carry,
            4 => Condition::Negative,
            5 => Condition::GreaterEqual,
            6 => Condition::Less,
            _ => Condition::Always,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Condition::NotZero => "JNZ",
            Condition::Zero => "JZ",
            Condition::NotCarry => "JNC",
            Condition::Carry => "JC",
            Condition::Negative => "JN",
            Condition::GreaterEqual => "JGE",
            Condition::Less => "JL",
            Condition::Always => "JMP",
        }
    }
}

impl Operation {
    pub fn family(self) -> Family {
        match self {
            Operation::Single(_) => Family::SingleOperand,
            Operation::Jump(_) => Family::CondJump,
            Operation::Double(_) => Family::DoubleOperand,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Operation::Single(op) => op.mnemonic(),
            Operation::Jump(cond) => cond.mnemonic(),
            Operation::Double(op) => op.mnemonic(),
        }
    }
}

impl Instruction {
    pub fn family(&self) -> Family {
        self.operation.family()
    }

    /// Whether the instruction operates on bytes. SWPB, SXT, CALL and RETI
    /// always work on words whatever their B/W bit says.
    pub fn is_byte(&self) -> bool {
        match self.operation {
            Operation::Single(SingleOp::Rrc | SingleOp::Rra | SingleOp::Push) => self.byte_flag,
            Operation::Single(_) | Operation::Jump(_) => false,
            Operation::Double(_) => self.byte_flag,
        }
    }

    /// The bytes this instruction was decoded from.
    pub fn bytes(&self) -> &[u8] {
        &self.raw[..self.width as usize]
    }
}

/// Source-side mode table, including the constant generator on r2/r3.
fn source_mode(reg: u8, as_bits: u16) -> AddressingMode {
    match (reg, as_bits) {
        (3, 0) => AddressingMode::Constant(Constant::Zero),
        (3, 1) => AddressingMode::Constant(Constant::One),
        (3, 2) => AddressingMode::Constant(Constant::Two),
        (3, _) => AddressingMode::Constant(Constant::MinusOne),
        (2, 2) => AddressingMode::Constant(Constant::Four),
        (2, 3) => AddressingMode::Constant(Constant::Eight),
        (2, 1) => AddressingMode::Absolute,
        (0, 3) => AddressingMode::Immediate,
        (_, 0) => AddressingMode::RegisterDirect,
        (_, 1) => AddressingMode::Indexed,
        (_, 2) => AddressingMode::RegisterIndirect,
        _ => AddressingMode::IndirectIncrement,
    }
}

fn destination_mode(reg: u8, ad_bit: u16) -> AddressingMode {
    match (reg, ad_bit) {
        (_, 0) => AddressingMode::RegisterDirect,
        (2, _) => AddressingMode::Absolute,
        _ => AddressingMode::Indexed,
    }
}

/// Pulls extension words off the tail of an instruction in order.
struct ExtensionWords<'a> {
    raw: &'a [u8],
    cursor: usize,
}

impl<'a> ExtensionWords<'a> {
    fn new(raw: &'a [u8]) -> Self {
        ExtensionWords { raw, cursor: 2 }
    }

    fn next_if(&mut self, needed: bool) -> Result<i16, CpuError> {
        if !needed {
            return Ok(0);
        }
        let end = self.cursor + 2;
        if self.raw.len() < end {
            return Err(CpuError::TooShort {
                needed: end,
                available: self.raw.len(),
            });
        }
        let word = i16::from_le_bytes([self.raw[self.cursor], self.raw[self.cursor + 1]]);
        self.cursor = end;
        Ok(word)
    }

    fn width(&self) -> u8 {
        self.cursor as u8
    }
}

/// Decode one instruction from the front of `raw`.
///
/// Fails with `TooShort` when `raw` ends before the instruction does.
pub fn decode(raw: &[u8]) -> Result<Instruction, CpuError> {
    if raw.len() < 2 {
        return Err(CpuError::TooShort {
            needed: 2,
            available: raw.len(),
        });
    }

    let word = u16::from_le_bytes([raw[0], raw[1]]);
    let mut ext = ExtensionWords::new(raw);

    let mut insn = match word >> 13 {
        0 => {
            let op = SingleOp::from_bits((word >> 7) & 7).ok_or(CpuError::IllegalOpcode(word))?;
            let src_reg = (word & 0xF) as u8;
            let src_mode = source_mode(src_reg, (word >> 4) & 3);
            let src_ext = ext.next_if(src_mode.needs_extension_word())?;

            Instruction {
                operation: Operation::Single(op),
                byte_flag: (word >> 6) & 1 != 0,
                src_mode,
                src_reg,
                src_ext,
                dst_mode: AddressingMode::RegisterDirect,
                dst_reg: 0,
                dst_ext: 0,
                offset: 0,
                width: 2,
                raw: [0; MAX_INSTRUCTION_BYTES],
            }
        }
        1 => {
            // 10-bit word offset, sign-extended from bit 9, in bytes.
            let mut off = word & 0x3FF;
            if off & 0x200 != 0 {
                off |= 0xFC00;
            }

            Instruction {
                operation: Operation::Jump(Condition::from_bits(word >> 10)),
                byte_flag: false,
                src_mode: AddressingMode::RegisterDirect,
                src_reg: 0,
                src_ext: 0,
                dst_mode: AddressingMode::RegisterDirect,
                dst_reg: 0,
                dst_ext: 0,
                offset: (off as i16).wrapping_mul(2),
                width: 2,
                raw: [0; MAX_INSTRUCTION_BYTES],
            }
        }
        _ => {
            let op = DoubleOp::from_bits(word >> 12).ok_or(CpuError::IllegalOpcode(word))?;
            let src_reg = ((word >> 8) & 0xF) as u8;
            let dst_reg = (word & 0xF) as u8;
            let src_mode = source_mode(src_reg, (word >> 4) & 3);
            let dst_mode = destination_mode(dst_reg, (word >> 7) & 1);
            let src_ext = ext.next_if(src_mode.needs_extension_word())?;
            let dst_ext = ext.next_if(dst_mode.needs_extension_word())?;

            Instruction {
                operation: Operation::Double(op),
                byte_flag: (word >> 6) & 1 != 0,
                src_mode,
                src_reg,
                src_ext,
                dst_mode,
                dst_reg,
                dst_ext,
                offset: 0,
                width: 2,
                raw: [0; MAX_INSTRUCTION_BYTES],
            }
        }
    };

    insn.width = ext.width();
    insn.raw[..insn.width as usize].copy_from_slice(&raw[..insn.width as usize]);
    Ok(insn)
}

fn operand_text(mode: AddressingMode, reg: u8, ext: i16) -> String {
    match mode {
        AddressingMode::RegisterDirect => format!("R{}", reg),
        AddressingMode::Indexed => format!("{}(R{})", ext, reg),
        AddressingMode::RegisterIndirect => format!("@R{}", reg),
        AddressingMode::IndirectIncrement => format!("@R{}+", reg),
        AddressingMode::Absolute => format!("&{:04x}", ext as u16),
        AddressingMode::Immediate => format!("#{}", ext),
        AddressingMode::Constant(Constant::MinusOne) => "#-1".to_string(),
        AddressingMode::Constant(c) => format!("#{}", c.value()),
    }
}

/// Rough MSP430 assembly: hex bytes padded to six columns, then the mnemonic.
impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for k in 0..MAX_INSTRUCTION_BYTES {
            if k < self.width as usize {
                write!(f, "{:02x} ", self.raw[k])?;
            } else {
                f.write_str("   ")?;
            }
        }
        f.write_str("\t")?;

        let suffix = if self.is_byte() { ".B" } else { "" };
        match self.operation {
            Operation::Single(op) => write!(
                f,
                "{}{} {}",
                op.mnemonic(),
                suffix,
                operand_text(self.src_mode, self.src_reg, self.src_ext)
            ),
            Operation::Jump(cond) => write!(f, "{} ${:+}", cond.mnemonic(), self.offset as i32 + 2),
            Operation::Double(op) => write!(
                f,
                "{}{} {}, {}",
                op.mnemonic(),
                suffix,
                operand_text(self.src_mode, self.src_reg, self.src_ext),
                operand_text(self.dst_mode, self.dst_reg, self.dst_ext)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_to_register_mov() {
        // MOV R5, R6
        let insn = decode(&[0x06, 0x45]).unwrap();

        assert_eq!(insn.operation, Operation::Double(DoubleOp::Mov));
        assert_eq!(insn.family(), Family::DoubleOperand);
        assert_eq!(insn.src_mode, AddressingMode::RegisterDirect);
        assert_eq!(insn.src_reg, 5);
        assert_eq!(insn.dst_mode, AddressingMode::RegisterDirect);
        assert_eq!(insn.dst_reg, 6);
        assert_eq!(insn.width, 2);
        assert!(!insn.is_byte());
    }

    #[test]
    fn test_indexed_source_and_destination_is_six_bytes() {
        // MOV 2(R5), 6(R6)
        let insn = decode(&[0x96, 0x45, 0x02, 0x00, 0x06, 0x00]).unwrap();

        assert_eq!(insn.src_mode, AddressingMode::Indexed);
        assert_eq!(insn.src_ext, 2);
        assert_eq!(insn.dst_mode, AddressingMode::Indexed);
        assert_eq!(insn.dst_ext, 6);
        assert_eq!(insn.width, 6);
        assert_eq!(insn.bytes(), &[0x96, 0x45, 0x02, 0x00, 0x06, 0x00]);
    }

    #[test]
    fn test_indexed_destination_only_is_four_bytes() {
        // MOV R5, 0(R6)
        let insn = decode(&[0x86, 0x45, 0x00, 0x00]).unwrap();

        assert_eq!(insn.src_mode, AddressingMode::RegisterDirect);
        assert_eq!(insn.dst_mode, AddressingMode::Indexed);
        assert_eq!(insn.dst_ext, 0);
        assert_eq!(insn.width, 4);
    }

    #[test]
    fn test_immediate_and_absolute() {
        // MOV #0x4400, &0x0200
        let insn = decode(&[0xB2, 0x40, 0x00, 0x44, 0x00, 0x02]).unwrap();

        assert_eq!(insn.src_mode, AddressingMode::Immediate);
        assert_eq!(insn.src_ext, 0x4400);
        assert_eq!(insn.dst_mode, AddressingMode::Absolute);
        assert_eq!(insn.dst_ext, 0x0200);
        assert_eq!(insn.width, 6);
    }

    #[test]
    fn test_negative_extension_is_sign_extended() {
        // MOV -2(R4), R5
        let insn = decode(&[0x15, 0x44, 0xFE, 0xFF]).unwrap();

        assert_eq!(insn.src_mode, AddressingMode::Indexed);
        assert_eq!(insn.src_ext, -2);
    }

    #[test]
    fn test_constant_generator_consumes_no_extension_word() {
        let cases: [(u8, Constant); 6] = [
            (0x03, Constant::Zero),     // MOV #0   (r3, As=0)
            (0x13, Constant::One),      // MOV #1   (r3, As=1)
            (0x23, Constant::Two),      // MOV #2   (r3, As=2)
            (0x33, Constant::MinusOne), // MOV #-1  (r3, As=3)
            (0x22, Constant::Four),     // MOV #4   (r2, As=2)
            (0x32, Constant::Eight),    // MOV #8   (r2, As=3)
        ];

        for (low_nibbles, constant) in cases {
            let src_reg = low_nibbles & 0xF;
            let as_bits = (low_nibbles >> 4) & 3;
            let word: u16 = 0x4005 | ((src_reg as u16) << 8) | ((as_bits as u16) << 4);
            let insn = decode(&word.to_le_bytes()).unwrap();

            assert_eq!(insn.src_mode, AddressingMode::Constant(constant));
            assert_eq!(insn.width, 2);
        }
    }

    #[test]
    fn test_constant_source_with_indexed_destination() {
        // MOV #1, 4(R6): only the destination needs an extension word
        let insn = decode(&[0x96, 0x43, 0x04, 0x00]).unwrap();

        assert_eq!(insn.src_mode, AddressingMode::Constant(Constant::One));
        assert_eq!(insn.dst_mode, AddressingMode::Indexed);
        assert_eq!(insn.dst_ext, 4);
        assert_eq!(insn.width, 4);
    }

    #[test]
    fn test_single_operand_forms() {
        // PUSH R4
        let push = decode(&[0x04, 0x12]).unwrap();
        assert_eq!(push.operation, Operation::Single(SingleOp::Push));
        assert_eq!(push.src_reg, 4);
        assert_eq!(push.width, 2);

        // CALL #0x4500
        let call = decode(&[0xB0, 0x12, 0x00, 0x45]).unwrap();
        assert_eq!(call.operation, Operation::Single(SingleOp::Call));
        assert_eq!(call.src_mode, AddressingMode::Immediate);
        assert_eq!(call.src_ext, 0x4500);
        assert_eq!(call.width, 4);

        // SWPB.B R5 still works on words
        let swpb = decode(&[0xC5, 0x10]).unwrap();
        assert_eq!(swpb.operation, Operation::Single(SingleOp::Swpb));
        assert!(swpb.byte_flag);
        assert!(!swpb.is_byte());

        // RRA.B R5 honours the byte flag
        let rra = decode(&[0x45, 0x11]).unwrap();
        assert_eq!(rra.operation, Operation::Single(SingleOp::Rra));
        assert!(rra.is_byte());
    }

    #[test]
    fn test_jump_offsets() {
        // JNZ -8 words
        let back = decode(&[0xF8, 0x23]).unwrap();
        assert_eq!(back.operation, Operation::Jump(Condition::NotZero));
        assert_eq!(back.offset, -16);

        // JMP +5 words
        let forward = decode(&[0x05, 0x3C]).unwrap();
        assert_eq!(forward.operation, Operation::Jump(Condition::Always));
        assert_eq!(forward.offset, 10);

        // JL with the most negative offset
        let far = decode(&[0x00, 0x3A]).unwrap();
        assert_eq!(far.operation, Operation::Jump(Condition::Less));
        assert_eq!(far.offset, -1024);
    }

    #[test]
    fn test_too_short() {
        assert_eq!(
            decode(&[0x06]),
            Err(CpuError::TooShort { needed: 2, available: 1 })
        );
        assert_eq!(
            decode(&[0xB2, 0x40, 0x00, 0x44]),
            Err(CpuError::TooShort { needed: 6, available: 4 })
        );
        assert_eq!(
            decode(&[0x15, 0x44]),
            Err(CpuError::TooShort { needed: 4, available: 2 })
        );
    }

    #[test]
    fn test_illegal_single_operand_opcode() {
        assert_eq!(decode(&[0x80, 0x13]), Err(CpuError::IllegalOpcode(0x1380)));
    }

    #[test]
    fn test_decode_is_stable() {
        let raw = [0x96, 0x45, 0x02, 0x00, 0x06, 0x00];
        let first = decode(&raw).unwrap();
        let second = decode(&raw).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.to_string(), second.to_string());
    }

    #[test]
    fn test_disassembly_text() {
        let mov = decode(&[0x96, 0x45, 0x02, 0x00, 0x06, 0x00]).unwrap();
        assert_eq!(mov.to_string(), "96 45 02 00 06 00 \tMOV 2(R5), 6(R6)");

        let store = decode(&[0xF2, 0x40, 0x41, 0x00, 0xCE, 0x05]).unwrap();
        assert_eq!(store.to_string(), "f2 40 41 00 ce 05 \tMOV.B #65, &05ce");

        let push = decode(&[0x04, 0x12]).unwrap();
        assert_eq!(push.to_string(), "04 12             \tPUSH R4");

        let jump = decode(&[0xF8, 0x23]).unwrap();
        assert_eq!(jump.to_string(), "f8 23             \tJNZ $-14");

        let incr = decode(&[0x35, 0x41]).unwrap();
        assert_eq!(incr.to_string(), "35 41             \tMOV @R1+, R5");
    }
}
