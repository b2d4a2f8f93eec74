use crate::decoder::{
    decode, AddressingMode, Condition, DoubleOp, Instruction, Operation, SingleOp,
};
use crate::error::CpuError;
use crate::memory::Memory;
use crate::metrics::{record_instruction, record_step, Timer};

// Register roles
pub const PC: usize = 0;
pub const SP: usize = 1;
pub const SR: usize = 2;
pub const CG: usize = 3;

// Status register flags
pub const CARRY: u16 = 0x0001;
pub const ZERO: u16 = 0x0002;
pub const NEGATIVE: u16 = 0x0004;
pub const CPU_OFF: u16 = 0x0010;
pub const OVERFLOW: u16 = 0x0100;

/// Where an operand lives once its addressing mode has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Register(usize),
    Memory(u16),
    Constant(u16),
}

/// Operand width for one instruction.
#[derive(Debug, Clone, Copy)]
struct Width {
    byte: bool,
}

impl Width {
    fn mask(self) -> u16 {
        if self.byte { 0x00FF } else { 0xFFFF }
    }

    fn sign(self) -> u16 {
        if self.byte { 0x0080 } else { 0x8000 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CPU {
    regs: [u16; 16],
}

impl CPU {
    pub fn new() -> Self {
        CPU { regs: [0; 16] }
    }

    /// Fetch, decode and execute one instruction at PC.
    ///
    /// PC is advanced past the instruction before it executes, so jumps and
    /// CALL overwrite the advanced value. Returns `Err(CpuError::Halted)` once
    /// the instruction leaves CPUOFF set.
    pub fn step<M: Memory + ?Sized>(&mut self, memory: &mut M) -> Result<Instruction, CpuError> {
        record_step();

        let pc = self.regs[PC];
        let raw = memory.load_6_bytes(pc)?;
        let insn = decode(&raw)?;
        self.regs[PC] = pc.wrapping_add(insn.width as u16);

        let timer = Timer::new();
        self.execute(&insn, memory)?;

        // Record metrics for this instruction
        record_instruction(insn.operation.mnemonic(), timer.elapsed());

        if self.is_halted() {
            return Err(CpuError::Halted);
        }
        Ok(insn)
    }

    /// Execute an already decoded instruction, with PC already advanced past
    /// it. CPUOFF is not checked here; [`CPU::step`] reports `Halted`.
    pub fn execute<M: Memory + ?Sized>(&mut self, insn: &Instruction, memory: &mut M) -> Result<(), CpuError> {
        match insn.operation {
            Operation::Single(op) => self.execute_single(op, insn, memory),
            Operation::Jump(cond) => {
                if self.condition_holds(cond) {
                    self.regs[PC] = self.regs[PC].wrapping_add(insn.offset as u16);
                }
                Ok(())
            }
            Operation::Double(op) => self.execute_double(op, insn, memory),
        }
    }

    // Getters
    pub fn registers(&self) -> [u16; 16] { self.regs }
    pub fn get_reg(&self, index: usize) -> u16 { self.regs[index] }
    pub fn get_pc(&self) -> u16 { self.regs[PC] }
    pub fn get_sp(&self) -> u16 { self.regs[SP] }
    pub fn get_sr(&self) -> u16 { self.regs[SR] }
    pub fn is_halted(&self) -> bool { self.regs[SR] & CPU_OFF != 0 }

    // Setters
    pub fn set_registers(&mut self, regs: [u16; 16]) { self.regs = regs; }
    pub fn set_reg(&mut self, index: usize, value: u16) { self.regs[index] = value; }
    pub fn set_pc(&mut self, value: u16) { self.regs[PC] = value; }
    pub fn set_sp(&mut self, value: u16) { self.regs[SP] = value; }

    // Flag operations. Each touches only its own bit.
    pub fn set_flag(&mut self, flag: u16, value: bool) {
        if value {
            self.regs[SR] |= flag;
        } else {
            self.regs[SR] &= !flag;
        }
    }

    pub fn get_flag(&self, flag: u16) -> bool {
        (self.regs[SR] & flag) != 0
    }

    fn update_zero_and_negative_flags(&mut self, value: u16, width: Width) {
        self.set_flag(ZERO, value & width.mask() == 0);
        self.set_flag(NEGATIVE, value & width.sign() != 0);
    }

    fn condition_holds(&self, cond: Condition) -> bool {
        let n = self.get_flag(NEGATIVE);
        let v = self.get_flag(OVERFLOW);
        match cond {
            Condition::NotZero => !self.get_flag(ZERO),
            Condition::Zero => self.get_flag(ZERO),
            Condition::NotCarry => !self.get_flag(CARRY),
            Condition::Carry => self.get_flag(CARRY),
            Condition::Negative => n,
            Condition::GreaterEqual => n == v,
            Condition::Less => n != v,
            Condition::Always => true,
        }
    }

    /// The constant generator reads as zero when used as a base or value.
    fn base(&self, reg: usize) -> u16 {
        if reg == CG { 0 } else { self.regs[reg] }
    }

    /// Apply an addressing mode. Autoincrement happens here, once per operand.
    fn resolve(&mut self, mode: AddressingMode, reg: u8, ext: i16, width: Width) -> Location {
        let reg = reg as usize;
        match mode {
            AddressingMode::RegisterDirect => Location::Register(reg),
            AddressingMode::Indexed => Location::Memory(self.base(reg).wrapping_add(ext as u16)),
            AddressingMode::RegisterIndirect => Location::Memory(self.base(reg)),
            AddressingMode::IndirectIncrement => {
                let address = self.base(reg);
                let step = if width.byte { 1 } else { 2 };
                if reg != CG {
                    self.regs[reg] = self.regs[reg].wrapping_add(step);
                }
                Location::Memory(address)
            }
            AddressingMode::Absolute => Location::Memory(ext as u16),
            AddressingMode::Immediate => Location::Constant(ext as u16),
            AddressingMode::Constant(c) => Location::Constant(c.value()),
        }
    }

    fn load<M: Memory + ?Sized>(&self, loc: Location, width: Width, memory: &mut M) -> Result<u16, CpuError> {
        match loc {
            Location::Register(reg) => Ok(self.base(reg) & width.mask()),
            Location::Memory(address) if width.byte => Ok(memory.load_byte(address)? as u16),
            Location::Memory(address) => memory.load_word(address),
            Location::Constant(value) => Ok(value & width.mask()),
        }
    }

    fn store<M: Memory + ?Sized>(&mut self, loc: Location, value: u16, width: Width, memory: &mut M) -> Result<(), CpuError> {
        match loc {
            Location::Register(CG) => Err(CpuError::BadOperand("constant generator can't be written")),
            // Byte writes to a register clear its high byte.
            Location::Register(reg) => {
                self.regs[reg] = value & width.mask();
                Ok(())
            }
            Location::Memory(address) if width.byte => memory.store_byte(address, value as u8),
            Location::Memory(address) => memory.store_word(address, value),
            Location::Constant(_) => Err(CpuError::BadOperand("immediate operand can't be written")),
        }
    }

    fn push_word<M: Memory + ?Sized>(&mut self, value: u16, width: Width, memory: &mut M) -> Result<(), CpuError> {
        self.regs[SP] = self.regs[SP].wrapping_sub(2);
        let sp = self.regs[SP];
        if width.byte {
            memory.store_byte(sp, value as u8)
        } else {
            memory.store_word(sp, value)
        }
    }

    fn execute_single<M: Memory + ?Sized>(&mut self, op: SingleOp, insn: &Instruction, memory: &mut M) -> Result<(), CpuError> {
        let width = Width { byte: insn.is_byte() };
        let loc = self.resolve(insn.src_mode, insn.src_reg, insn.src_ext, width);

        match op {
            SingleOp::Rrc => {
                let src = self.load(loc, width, memory)?;
                let carry_in = if self.get_flag(CARRY) { width.sign() } else { 0 };
                let result = (src >> 1) | carry_in;
                self.set_flag(CARRY, src & 1 != 0);
                self.set_flag(OVERFLOW, false);
                self.update_zero_and_negative_flags(result, width);
                self.store(loc, result, width, memory)
            }
            SingleOp::Rra => {
                let src = self.load(loc, width, memory)?;
                // Logical shift: the top bit comes in as zero rather than
                // being copied, so 0x8000 becomes 0x4000.
                let result = src >> 1;
                self.set_flag(CARRY, src & 1 != 0);
                self.set_flag(OVERFLOW, false);
                self.update_zero_and_negative_flags(result, width);
                self.store(loc, result, width, memory)
            }
            SingleOp::Swpb => {
                let src = self.load(loc, width, memory)?;
                self.store(loc, src.swap_bytes(), width, memory)
            }
            SingleOp::Sxt => {
                let src = self.load(loc, width, memory)?;
                let result = (src as u8) as i8 as i16 as u16;
                self.set_flag(CARRY, result != 0);
                self.set_flag(OVERFLOW, false);
                self.update_zero_and_negative_flags(result, width);
                self.store(loc, result, width, memory)
            }
            SingleOp::Push => {
                let src = self.load(loc, width, memory)?;
                self.push_word(src, width, memory)
            }
            SingleOp::Call => {
                let target = self.load(loc, width, memory)?;
                let ret = self.regs[PC];
                self.push_word(ret, width, memory)?;
                self.regs[PC] = target;
                Ok(())
            }
            SingleOp::Reti => Err(CpuError::Unsupported("RETI")),
        }
    }

    fn execute_double<M: Memory + ?Sized>(&mut self, op: DoubleOp, insn: &Instruction, memory: &mut M) -> Result<(), CpuError> {
        let width = Width { byte: insn.is_byte() };
        let src_loc = self.resolve(insn.src_mode, insn.src_reg, insn.src_ext, width);
        let src = self.load(src_loc, width, memory)?;
        let dst_loc = self.resolve(insn.dst_mode, insn.dst_reg, insn.dst_ext, width);

        // MOV never reads its destination.
        let dst = match op {
            DoubleOp::Mov => 0,
            _ => self.load(dst_loc, width, memory)?,
        };

        let mask = width.mask();
        let result = match op {
            DoubleOp::Mov => src,
            DoubleOp::Add => self.add_with_carry(dst, src, 0, width),
            DoubleOp::Addc => {
                let carry = self.get_flag(CARRY) as u16;
                self.add_with_carry(dst, src, carry, width)
            }
            DoubleOp::Sub | DoubleOp::Cmp => self.add_with_carry(dst, !src & mask, 1, width),
            DoubleOp::Subc => {
                let carry = self.get_flag(CARRY) as u16;
                self.add_with_carry(dst, !src & mask, carry, width)
            }
            DoubleOp::Bit | DoubleOp::And => {
                let result = src & dst;
                self.set_flag(CARRY, result != 0);
                self.set_flag(OVERFLOW, false);
                self.update_zero_and_negative_flags(result, width);
                result
            }
            DoubleOp::Xor => {
                let result = src ^ dst;
                let sign = width.sign();
                self.set_flag(CARRY, result != 0);
                self.set_flag(OVERFLOW, src & sign != 0 && dst & sign != 0);
                self.update_zero_and_negative_flags(result, width);
                result
            }
            DoubleOp::Bic => !src & dst & mask,
            DoubleOp::Bis => src | dst,
            DoubleOp::Dadd => return Err(CpuError::Unsupported("DADD")),
        };

        match op {
            DoubleOp::Cmp | DoubleOp::Bit => Ok(()),
            _ => self.store(dst_loc, result, width, memory),
        }
    }

    /// `a + b + carry` at the instruction width, setting C, V, N and Z.
    fn add_with_carry(&mut self, a: u16, b: u16, carry: u16, width: Width) -> u16 {
        let mask = width.mask();
        let (a, b) = (a & mask, b & mask);
        let sum = a as u32 + b as u32 + carry as u32;
        let result = (sum as u16) & mask;

        self.set_flag(CARRY, sum > mask as u32);
        self.set_flag(OVERFLOW, (a ^ result) & (b ^ result) & width.sign() != 0);
        self.update_zero_and_negative_flags(result, width);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::FlatMemory;

    fn cpu_with_program(program: &[u8]) -> (CPU, FlatMemory) {
        let mut memory = FlatMemory::new();
        for (i, &byte) in program.iter().enumerate() {
            memory.store_byte(0x4400 + i as u16, byte).unwrap();
        }

        let mut cpu = CPU::new();
        cpu.set_pc(0x4400);
        cpu.set_sp(0x4000);
        (cpu, memory)
    }

    #[test]
    fn test_mov_immediate() {
        // MOV #0x1234, R5
        let (mut cpu, mut memory) = cpu_with_program(&[0x35, 0x40, 0x34, 0x12]);
        cpu.step(&mut memory).unwrap();

        assert_eq!(cpu.get_reg(5), 0x1234);
        assert_eq!(cpu.get_pc(), 0x4404);
    }

    #[test]
    fn test_mov_byte_clears_register_high_byte() {
        // MOV.B #0x41, R5
        let (mut cpu, mut memory) = cpu_with_program(&[0x75, 0x40, 0x41, 0x00]);
        cpu.set_reg(5, 0xFFFF);
        cpu.step(&mut memory).unwrap();

        assert_eq!(cpu.get_reg(5), 0x0041);
    }

    #[test]
    fn test_add_byte_wraps() {
        // ADD.B R4, R5
        let (mut cpu, mut memory) = cpu_with_program(&[0x45, 0x54]);
        cpu.set_reg(4, 0x01F0);
        cpu.set_reg(5, 0x02F0);
        cpu.step(&mut memory).unwrap();

        assert_eq!(cpu.get_reg(5), 0x00E0);
        assert!(cpu.get_reg(5) <= 0xFF);
        assert!(cpu.get_flag(CARRY));
        assert!(cpu.get_flag(NEGATIVE));
    }

    #[test]
    fn test_add_word() {
        // ADD R4, R5
        let (mut cpu, mut memory) = cpu_with_program(&[0x05, 0x54]);
        cpu.set_reg(4, 0x01F0);
        cpu.set_reg(5, 0x02F0);
        cpu.step(&mut memory).unwrap();

        assert_eq!(cpu.get_reg(5), 0x04E0);
        assert!(!cpu.get_flag(CARRY));
        assert!(!cpu.get_flag(ZERO));
    }

    #[test]
    fn test_add_signed_overflow() {
        // ADD R4, R5
        let (mut cpu, mut memory) = cpu_with_program(&[0x05, 0x54]);
        cpu.set_reg(4, 0x7FFF);
        cpu.set_reg(5, 0x0001);
        cpu.step(&mut memory).unwrap();

        assert_eq!(cpu.get_reg(5), 0x8000);
        assert!(cpu.get_flag(OVERFLOW));
        assert!(cpu.get_flag(NEGATIVE));
        assert!(!cpu.get_flag(CARRY));
    }

    #[test]
    fn test_sub_borrow() {
        // SUB R4, R5
        let (mut cpu, mut memory) = cpu_with_program(&[0x05, 0x84]);
        cpu.set_reg(4, 1);
        cpu.set_reg(5, 0);
        cpu.step(&mut memory).unwrap();

        assert_eq!(cpu.get_reg(5), 0xFFFF);
        assert!(!cpu.get_flag(CARRY));
        assert!(cpu.get_flag(NEGATIVE));
        assert!(!cpu.get_flag(OVERFLOW));
    }

    #[test]
    fn test_cmp_sets_flags_without_storing() {
        // CMP R4, R5
        let (mut cpu, mut memory) = cpu_with_program(&[0x05, 0x94]);
        cpu.set_reg(4, 5);
        cpu.set_reg(5, 5);
        cpu.step(&mut memory).unwrap();

        assert_eq!(cpu.get_reg(5), 5);
        assert!(cpu.get_flag(ZERO));
        assert!(cpu.get_flag(CARRY));
    }

    #[test]
    fn test_flag_updates_leave_other_status_bits() {
        // CMP R4, R5
        let (mut cpu, mut memory) = cpu_with_program(&[0x05, 0x94]);
        cpu.set_reg(SR, 0x0E00);
        cpu.set_reg(4, 5);
        cpu.set_reg(5, 5);
        cpu.step(&mut memory).unwrap();

        assert_eq!(cpu.get_sr() & 0x0E00, 0x0E00);
    }

    #[test]
    fn test_logic_ops() {
        // AND R4, R5 ; XOR R4, R6 ; BIC R4, R7 ; BIS R4, R8 ; BIT R4, R9
        let (mut cpu, mut memory) = cpu_with_program(&[
            0x05, 0xF4, 0x06, 0xE4, 0x07, 0xC4, 0x08, 0xD4, 0x09, 0xB4,
        ]);
        cpu.set_reg(4, 0x00F0);
        for reg in 5..=9 {
            cpu.set_reg(reg, 0x0F30);
        }

        cpu.step(&mut memory).unwrap();
        assert_eq!(cpu.get_reg(5), 0x0030);
        assert!(cpu.get_flag(CARRY));

        cpu.step(&mut memory).unwrap();
        assert_eq!(cpu.get_reg(6), 0x0FC0);

        cpu.step(&mut memory).unwrap();
        assert_eq!(cpu.get_reg(7), 0x0F00);

        cpu.step(&mut memory).unwrap();
        assert_eq!(cpu.get_reg(8), 0x0FF0);

        cpu.step(&mut memory).unwrap();
        assert_eq!(cpu.get_reg(9), 0x0F30);
        assert!(!cpu.get_flag(ZERO));
    }

    #[test]
    fn test_swpb() {
        // SWPB R5
        let (mut cpu, mut memory) = cpu_with_program(&[0x85, 0x10]);
        cpu.set_reg(5, 0xEFBF);
        cpu.step(&mut memory).unwrap();

        assert_eq!(cpu.get_reg(5), 0xBFEF);
    }

    #[test]
    fn test_sxt() {
        // SXT R5 ; SXT R6
        let (mut cpu, mut memory) = cpu_with_program(&[0x85, 0x11, 0x86, 0x11]);
        cpu.set_reg(5, 0x0080);
        cpu.set_reg(6, 0x007F);

        cpu.step(&mut memory).unwrap();
        assert_eq!(cpu.get_reg(5), 0xFF80);
        assert!(cpu.get_flag(NEGATIVE));
        assert!(cpu.get_flag(CARRY));

        cpu.step(&mut memory).unwrap();
        assert_eq!(cpu.get_reg(6), 0x007F);
        assert!(!cpu.get_flag(NEGATIVE));
    }

    #[test]
    fn test_rra() {
        // RRA R5 ; RRA R6 ; RRA R7
        let (mut cpu, mut memory) = cpu_with_program(&[0x05, 0x11, 0x06, 0x11, 0x07, 0x11]);
        cpu.set_reg(5, 0x8000);
        cpu.set_reg(6, 0x0003);
        cpu.set_reg(7, 0xFFFE);

        cpu.step(&mut memory).unwrap();
        assert_eq!(cpu.get_reg(5), 0x4000);
        assert!(!cpu.get_flag(CARRY));

        cpu.step(&mut memory).unwrap();
        assert_eq!(cpu.get_reg(6), 0x0001);
        assert!(cpu.get_flag(CARRY));

        // the sign bit is not kept
        cpu.step(&mut memory).unwrap();
        assert_eq!(cpu.get_reg(7), 0x7FFF);
        assert!(!cpu.get_flag(NEGATIVE));
    }

    #[test]
    fn test_rrc_rotates_through_carry() {
        // RRC R5
        let (mut cpu, mut memory) = cpu_with_program(&[0x05, 0x10]);
        cpu.set_flag(CARRY, true);
        cpu.set_reg(5, 0x0002);
        cpu.step(&mut memory).unwrap();

        assert_eq!(cpu.get_reg(5), 0x8001);
        assert!(!cpu.get_flag(CARRY));
        assert!(cpu.get_flag(NEGATIVE));
    }

    #[test]
    fn test_push_and_call() {
        // PUSH R4 ; CALL #0x4500
        let (mut cpu, mut memory) = cpu_with_program(&[0x04, 0x12, 0xB0, 0x12, 0x00, 0x45]);
        cpu.set_reg(4, 0xBEEF);

        cpu.step(&mut memory).unwrap();
        assert_eq!(cpu.get_sp(), 0x3FFE);
        assert_eq!(memory.load_word(0x3FFE).unwrap(), 0xBEEF);

        cpu.step(&mut memory).unwrap();
        assert_eq!(cpu.get_sp(), 0x3FFC);
        assert_eq!(memory.load_word(0x3FFC).unwrap(), 0x4406);
        assert_eq!(cpu.get_pc(), 0x4500);
    }

    #[test]
    fn test_jumps() {
        // JMP $+12
        let (mut cpu, mut memory) = cpu_with_program(&[0x05, 0x3C]);
        cpu.step(&mut memory).unwrap();
        assert_eq!(cpu.get_pc(), 0x440C);

        // JNZ with Z set falls through
        let (mut cpu, mut memory) = cpu_with_program(&[0xF8, 0x23]);
        cpu.set_flag(ZERO, true);
        cpu.step(&mut memory).unwrap();
        assert_eq!(cpu.get_pc(), 0x4402);

        // JNZ with Z clear goes backwards
        let (mut cpu, mut memory) = cpu_with_program(&[0xF8, 0x23]);
        cpu.step(&mut memory).unwrap();
        assert_eq!(cpu.get_pc(), 0x43F2);
    }

    #[test]
    fn test_indirect_autoincrement() {
        // MOV @R4+, R5 ; MOV.B @R4+, R6
        let (mut cpu, mut memory) = cpu_with_program(&[0x35, 0x44, 0x76, 0x44]);
        memory.store_word(0x0200, 0x1234).unwrap();
        memory.store_byte(0x0202, 0x56).unwrap();
        cpu.set_reg(4, 0x0200);

        cpu.step(&mut memory).unwrap();
        assert_eq!(cpu.get_reg(5), 0x1234);
        assert_eq!(cpu.get_reg(4), 0x0202);

        cpu.step(&mut memory).unwrap();
        assert_eq!(cpu.get_reg(6), 0x0056);
        assert_eq!(cpu.get_reg(4), 0x0203);
    }

    #[test]
    fn test_indexed_store() {
        // MOV R5, 2(R4)
        let (mut cpu, mut memory) = cpu_with_program(&[0x84, 0x45, 0x02, 0x00]);
        cpu.set_reg(4, 0x0200);
        cpu.set_reg(5, 0xCAFE);
        cpu.step(&mut memory).unwrap();

        assert_eq!(memory.load_word(0x0202).unwrap(), 0xCAFE);
        assert_eq!(cpu.get_pc(), 0x4404);
    }

    #[test]
    fn test_store_to_constant_is_bad_operand() {
        // MOV R4, R3
        let (mut cpu, mut memory) = cpu_with_program(&[0x03, 0x44]);
        assert!(matches!(cpu.step(&mut memory), Err(CpuError::BadOperand(_))));

        // RRC #1
        let (mut cpu, mut memory) = cpu_with_program(&[0x13, 0x10]);
        assert!(matches!(cpu.step(&mut memory), Err(CpuError::BadOperand(_))));
    }

    #[test]
    fn test_cpuoff_halts() {
        // BIS #16, SR
        let (mut cpu, mut memory) = cpu_with_program(&[0x32, 0xD0, 0x10, 0x00]);

        assert_eq!(cpu.step(&mut memory), Err(CpuError::Halted));
        assert!(cpu.is_halted());
        assert_eq!(cpu.get_pc(), 0x4404);
    }

    #[test]
    fn test_execute_leaves_halt_to_step() {
        // BIS #16, SR
        let insn = decode(&[0x32, 0xD0, 0x10, 0x00]).unwrap();
        let mut memory = FlatMemory::new();
        let mut cpu = CPU::new();

        assert_eq!(cpu.execute(&insn, &mut memory), Ok(()));
        assert!(cpu.is_halted());
    }

    #[test]
    fn test_unsupported_instructions() {
        // RETI
        let (mut cpu, mut memory) = cpu_with_program(&[0x00, 0x13]);
        assert_eq!(cpu.step(&mut memory), Err(CpuError::Unsupported("RETI")));

        // DADD R4, R5
        let (mut cpu, mut memory) = cpu_with_program(&[0x05, 0xA4]);
        assert_eq!(cpu.step(&mut memory), Err(CpuError::Unsupported("DADD")));
    }

    #[test]
    fn test_memory_fault_propagates() {
        let mut memory = FlatMemory::new();
        let mut cpu = CPU::new();
        cpu.set_pc(0x4401);

        assert_eq!(cpu.step(&mut memory), Err(CpuError::AddressUnaligned(0x4401)));
    }

    #[test]
    fn test_stack_pop_byte_and_word() {
        // MOV.B @SP+, R5
        let (mut cpu, mut memory) = cpu_with_program(&[0x75, 0x41]);
        memory.store_word(0x4000, 0x1299).unwrap();
        cpu.step(&mut memory).unwrap();

        assert_eq!(cpu.get_reg(5), 0x0099);
        assert_eq!(cpu.get_sp(), 0x4001);

        // MOV @SP+, R5
        let (mut cpu, mut memory) = cpu_with_program(&[0x35, 0x41]);
        memory.store_word(0x4000, 0x1299).unwrap();
        cpu.step(&mut memory).unwrap();

        assert_eq!(cpu.get_reg(5), 0x1299);
        assert_eq!(cpu.get_sp(), 0x4002);
    }

    #[test]
    fn test_addc_uses_carry_in() {
        // ADDC R4, R5
        let (mut cpu, mut memory) = cpu_with_program(&[0x05, 0x64]);
        cpu.set_reg(4, 1);
        cpu.set_reg(5, 2);
        cpu.set_flag(CARRY, true);
        cpu.step(&mut memory).unwrap();
        assert_eq!(cpu.get_reg(5), 4);
        assert!(!cpu.get_flag(CARRY));

        let (mut cpu, mut memory) = cpu_with_program(&[0x05, 0x64]);
        cpu.set_reg(4, 1);
        cpu.set_reg(5, 2);
        cpu.step(&mut memory).unwrap();
        assert_eq!(cpu.get_reg(5), 3);

        // carry in pushes 0xFFFF + 0 over the top
        let (mut cpu, mut memory) = cpu_with_program(&[0x05, 0x64]);
        cpu.set_reg(4, 0xFFFF);
        cpu.set_reg(5, 0);
        cpu.set_flag(CARRY, true);
        cpu.step(&mut memory).unwrap();
        assert_eq!(cpu.get_reg(5), 0);
        assert!(cpu.get_flag(CARRY));
        assert!(cpu.get_flag(ZERO));
    }

    #[test]
    fn test_subc_borrows_without_carry() {
        // SUBC R4, R5
        let (mut cpu, mut memory) = cpu_with_program(&[0x05, 0x74]);
        cpu.set_reg(4, 2);
        cpu.set_reg(5, 5);
        cpu.set_flag(CARRY, true);
        cpu.step(&mut memory).unwrap();
        assert_eq!(cpu.get_reg(5), 3);
        assert!(cpu.get_flag(CARRY));

        let (mut cpu, mut memory) = cpu_with_program(&[0x05, 0x74]);
        cpu.set_reg(4, 2);
        cpu.set_reg(5, 5);
        cpu.step(&mut memory).unwrap();
        assert_eq!(cpu.get_reg(5), 2);
        assert!(cpu.get_flag(CARRY));

        // 0 - 0 - 1 borrows
        let (mut cpu, mut memory) = cpu_with_program(&[0x05, 0x74]);
        cpu.step(&mut memory).unwrap();
        assert_eq!(cpu.get_reg(5), 0xFFFF);
        assert!(!cpu.get_flag(CARRY));
        assert!(cpu.get_flag(NEGATIVE));
    }

    #[test]
    fn test_conditional_jumps() {
        // Each jump is `$+6`: taken lands at 0x4406, not taken at 0x4402.
        let cases: [(&str, u16, u16, bool); 16] = [
            ("JC", 0x2C02, CARRY, true),
            ("JC", 0x2C02, 0, false),
            ("JNC", 0x2802, 0, true),
            ("JNC", 0x2802, CARRY, false),
            ("JN", 0x3002, NEGATIVE, true),
            ("JN", 0x3002, 0, false),
            ("JZ", 0x2402, ZERO, true),
            ("JZ", 0x2402, 0, false),
            ("JGE", 0x3402, 0, true),
            ("JGE", 0x3402, NEGATIVE | OVERFLOW, true),
            ("JGE", 0x3402, NEGATIVE, false),
            ("JGE", 0x3402, OVERFLOW, false),
            ("JL", 0x3802, NEGATIVE, true),
            ("JL", 0x3802, OVERFLOW, true),
            ("JL", 0x3802, 0, false),
            ("JL", 0x3802, NEGATIVE | OVERFLOW, false),
        ];

        for (name, word, flags, taken) in cases {
            let (mut cpu, mut memory) = cpu_with_program(&word.to_le_bytes());
            cpu.set_reg(SR, flags);
            cpu.step(&mut memory).unwrap();

            let expected = if taken { 0x4406 } else { 0x4402 };
            assert_eq!(cpu.get_pc(), expected, "{} with SR={:#06x}", name, flags);
        }
    }

    #[test]
    fn test_byte_results_stay_in_low_byte() {
        let ops: [(u16, &str); 9] = [
            (0x4, "MOV"),
            (0x5, "ADD"),
            (0x6, "ADDC"),
            (0x7, "SUBC"),
            (0x8, "SUB"),
            (0xC, "BIC"),
            (0xD, "BIS"),
            (0xE, "XOR"),
            (0xF, "AND"),
        ];

        for (op, name) in ops {
            // OP.B R4, R5
            let word = (op << 12) | 0x0445;
            let (mut cpu, mut memory) = cpu_with_program(&word.to_le_bytes());
            cpu.set_reg(4, 0xABCD);
            cpu.set_reg(5, 0xF0F7);
            cpu.set_flag(CARRY, true);
            cpu.step(&mut memory).unwrap();
            assert!(cpu.get_reg(5) <= 0xFF, "{}.B left R5={:#06x}", name, cpu.get_reg(5));

            // OP.B R4, 0(R6)
            let [lo, hi] = ((op << 12) | 0x04C6).to_le_bytes();
            let (mut cpu, mut memory) = cpu_with_program(&[lo, hi, 0x00, 0x00]);
            memory.store_word(0x0200, 0x5AC3).unwrap();
            cpu.set_reg(4, 0xABCD);
            cpu.set_reg(6, 0x0200);
            cpu.set_flag(CARRY, true);
            cpu.step(&mut memory).unwrap();
            assert_eq!(memory.load_byte(0x0201).unwrap(), 0x5A, "{}.B touched the next byte", name);
            assert_eq!(cpu.get_reg(4), 0xABCD);
        }
    }
}
