use crate::error::CpuError;
use tracing::trace;

pub const MEMORY_SIZE: usize = 0x10000;

/// Legacy console port: bytes or words stored here through the flat store are
/// printed instead of written.
pub const CONSOLE_PORT: u16 = 0x05CE;
/// High byte of the console port word, also treated as console output.
pub const CONSOLE_PORT_HIGH: u16 = 0x05CF;

/// Highest address a 6-byte instruction fetch may start at.
const LAST_FETCH_ADDRESS: u16 = 0xFFFA;
/// Highest address a word load/store may start at.
const LAST_WORD_ADDRESS: u16 = 0xFFFC;

/// The address space the CPU boots from, reads and writes.
///
/// Word accesses are little-endian. Loads take `&mut self` because a load may
/// be intercepted by a hook with side effects.
pub trait Memory {
    fn load_6_bytes(&mut self, address: u16) -> Result<[u8; 6], CpuError>;
    fn load_word(&mut self, address: u16) -> Result<u16, CpuError>;
    fn store_word(&mut self, address: u16, value: u16) -> Result<(), CpuError>;
    fn load_byte(&mut self, address: u16) -> Result<u8, CpuError>;
    fn store_byte(&mut self, address: u16, value: u8) -> Result<(), CpuError>;

    /// Bulk read of `len` bytes starting at `address`; never goes through hooks.
    fn read(&self, address: u16, len: u16) -> Result<Vec<u8>, CpuError>;

    /// Zero the whole address space.
    fn clear(&mut self);
}

pub(crate) fn check_fetch(address: u16) -> Result<(), CpuError> {
    if address > LAST_FETCH_ADDRESS {
        return Err(CpuError::AddressTooHigh(address));
    }
    if address & 1 != 0 {
        return Err(CpuError::AddressUnaligned(address));
    }
    Ok(())
}

pub(crate) fn check_word(address: u16) -> Result<(), CpuError> {
    if address & 1 != 0 {
        return Err(CpuError::AddressUnaligned(address));
    }
    if address > LAST_WORD_ADDRESS {
        return Err(CpuError::AddressTooHigh(address));
    }
    Ok(())
}

/// Simplest possible store: a flat 64 KiB byte array.
pub struct FlatMemory {
    data: Box<[u8; MEMORY_SIZE]>,
    console: Vec<u8>,
}

impl FlatMemory {
    pub fn new() -> Self {
        FlatMemory {
            data: Box::new([0; MEMORY_SIZE]),
            console: Vec::new(),
        }
    }

    /// Bytes written to the console ports so far.
    pub fn console_output(&self) -> &[u8] {
        &self.console
    }

    pub fn take_console_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.console)
    }

    fn is_console(address: u16) -> bool {
        address == CONSOLE_PORT || address == CONSOLE_PORT_HIGH
    }

    fn print(&mut self, value: u8) {
        trace!(byte = value, "console output");
        self.console.push(value);
    }
}

impl Default for FlatMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl Memory for FlatMemory {
    fn load_6_bytes(&mut self, address: u16) -> Result<[u8; 6], CpuError> {
        check_fetch(address)?;
        let start = address as usize;
        let mut raw = [0u8; 6];
        raw.copy_from_slice(&self.data[start..start + 6]);
        Ok(raw)
    }

    fn load_word(&mut self, address: u16) -> Result<u16, CpuError> {
        check_word(address)?;
        let low = self.data[address as usize] as u16;
        let high = self.data[address as usize + 1] as u16;
        Ok((high << 8) | low)
    }

    fn store_word(&mut self, address: u16, value: u16) -> Result<(), CpuError> {
        check_word(address)?;
        if Self::is_console(address) {
            self.print(value as u8);
            return Ok(());
        }
        self.data[address as usize] = (value & 0xFF) as u8;
        self.data[address as usize + 1] = (value >> 8) as u8;
        Ok(())
    }

    fn load_byte(&mut self, address: u16) -> Result<u8, CpuError> {
        Ok(self.data[address as usize])
    }

    fn store_byte(&mut self, address: u16, value: u8) -> Result<(), CpuError> {
        if Self::is_console(address) {
            self.print(value);
        } else {
            self.data[address as usize] = value;
        }
        Ok(())
    }

    fn read(&self, address: u16, len: u16) -> Result<Vec<u8>, CpuError> {
        let start = address as usize;
        let end = start + len as usize;
        if end > MEMORY_SIZE {
            return Err(CpuError::AddressTooHigh(address));
        }
        Ok(self.data[start..end].to_vec())
    }

    fn clear(&mut self) {
        self.data.fill(0);
    }
}
