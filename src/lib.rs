//! # MSP430 Debug Service
//!
//! An instruction-level emulator for an MSP430-class 16-bit microcontroller,
//! served as a multi-tenant debugger. Every named CPU instance runs on its own
//! thread and is driven through a mailbox, so free-running execution and
//! inspection never race.
//!
//! ## Features
//!
//! - Decoder and disassembler for the single-operand, jump and double-operand
//!   instruction families, including the constant generator
//! - Execution engine with byte/word operand widths and status flags
//! - Hookable memory for memory-mapped peripherals
//! - Per-instance breakpoints (stop, step, trace) and run states
//! - Intel-HEX style image loading
//! - A small JSON control surface and Prometheus metrics
//!
//! ## Example
//!
//! ```rust
//! use msp430_emulator::cpu::CPU;
//! use msp430_emulator::memory::{FlatMemory, Memory};
//!
//! let mut cpu = CPU::new();
//! let mut memory = FlatMemory::new();
//!
//! // MOV #0x1234, R5
//! for (i, byte) in [0x35, 0x40, 0x34, 0x12].into_iter().enumerate() {
//!     memory.store_byte(0x4400 + i as u16, byte).unwrap();
//! }
//!
//! cpu.set_pc(0x4400);
//! cpu.step(&mut memory).unwrap();
//!
//! assert_eq!(cpu.get_reg(5), 0x1234);
//! assert_eq!(cpu.get_pc(), 0x4404);
//! ```

#![recursion_limit = "2048"]

pub mod config;
pub mod cpu;
pub mod decoder;
pub mod error;
pub mod hookable_memory;
pub mod hooks;
pub mod instance;
pub mod kv;
pub mod loader;
pub mod memory;
pub mod metrics;
pub mod registry;
pub mod server;

pub use cpu::CPU;
pub use error::{ControlError, CpuError, KvError, LoadError};
pub use memory::Memory;
