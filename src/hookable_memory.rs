use std::collections::HashMap;

use tracing::debug;

use crate::error::CpuError;
use crate::memory::{FlatMemory, Memory};

/// Intercepts loads from one address. The hook gets the backing store, so
/// anything it reads or writes there bypasses the hook table.
pub trait ReadHook: Send {
    fn read_memory(&mut self, address: u16, store: &mut dyn Memory) -> Result<u16, CpuError>;
}

/// Intercepts stores to one address. Byte stores arrive widened to a word.
pub trait WriteHook: Send {
    fn write_memory(&mut self, address: u16, value: u16, store: &mut dyn Memory) -> Result<(), CpuError>;
}

impl<F> ReadHook for F
where
    F: FnMut(u16, &mut dyn Memory) -> Result<u16, CpuError> + Send,
{
    fn read_memory(&mut self, address: u16, store: &mut dyn Memory) -> Result<u16, CpuError> {
        self(address, store)
    }
}

impl<F> WriteHook for F
where
    F: FnMut(u16, u16, &mut dyn Memory) -> Result<(), CpuError> + Send,
{
    fn write_memory(&mut self, address: u16, value: u16, store: &mut dyn Memory) -> Result<(), CpuError> {
        self(address, value, store)
    }
}

/// A store with hooks bound to individual addresses.
///
/// A hook bound to an address fires for both byte and word accesses there.
/// A failing read hook falls back to the store's own value; a failing write
/// hook is the result of the store.
pub struct HookableMemory<S: Memory = FlatMemory> {
    store: S,
    read_hooks: HashMap<u16, Box<dyn ReadHook>>,
    write_hooks: HashMap<u16, Box<dyn WriteHook>>,
}

impl<S: Memory> HookableMemory<S> {
    pub fn new(store: S) -> Self {
        HookableMemory {
            store,
            read_hooks: HashMap::new(),
            write_hooks: HashMap::new(),
        }
    }

    pub fn bind_read_hook(&mut self, address: u16, hook: impl ReadHook + 'static) -> Result<(), CpuError> {
        if self.read_hooks.contains_key(&address) {
            return Err(CpuError::HookConflict(address));
        }
        self.read_hooks.insert(address, Box::new(hook));
        Ok(())
    }

    pub fn bind_write_hook(&mut self, address: u16, hook: impl WriteHook + 'static) -> Result<(), CpuError> {
        if self.write_hooks.contains_key(&address) {
            return Err(CpuError::HookConflict(address));
        }
        self.write_hooks.insert(address, Box::new(hook));
        Ok(())
    }

    pub fn has_read_hook(&self, address: u16) -> bool {
        self.read_hooks.contains_key(&address)
    }

    pub fn has_write_hook(&self, address: u16) -> bool {
        self.write_hooks.contains_key(&address)
    }

    /// The backing store, with no hooks in the way.
    pub fn direct(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn load_word_direct(&mut self, address: u16) -> Result<u16, CpuError> {
        self.store.load_word(address)
    }

    pub fn store_word_direct(&mut self, address: u16, value: u16) -> Result<(), CpuError> {
        self.store.store_word(address, value)
    }

    pub fn load_byte_direct(&mut self, address: u16) -> Result<u8, CpuError> {
        self.store.load_byte(address)
    }

    pub fn store_byte_direct(&mut self, address: u16, value: u8) -> Result<(), CpuError> {
        self.store.store_byte(address, value)
    }

    fn hooked_load(&mut self, address: u16) -> Option<u16> {
        // Borrow the hook and the store separately so the hook can use the store.
        let hook = self.read_hooks.get_mut(&address)?;
        match hook.read_memory(address, &mut self.store) {
            Ok(value) => Some(value),
            Err(err) => {
                debug!(address, error = %err, "read hook failed, using stored value");
                None
            }
        }
    }
}

impl<S: Memory> Memory for HookableMemory<S> {
    fn load_6_bytes(&mut self, address: u16) -> Result<[u8; 6], CpuError> {
        if self.read_hooks.contains_key(&address) {
            return Err(CpuError::HookedFetch(address));
        }
        self.store.load_6_bytes(address)
    }

    fn load_word(&mut self, address: u16) -> Result<u16, CpuError> {
        match self.hooked_load(address) {
            Some(value) => Ok(value),
            None => self.store.load_word(address),
        }
    }

    fn store_word(&mut self, address: u16, value: u16) -> Result<(), CpuError> {
        match self.write_hooks.get_mut(&address) {
            Some(hook) => hook.write_memory(address, value, &mut self.store),
            None => self.store.store_word(address, value),
        }
    }

    fn load_byte(&mut self, address: u16) -> Result<u8, CpuError> {
        match self.hooked_load(address) {
            Some(value) => Ok((value & 0xFF) as u8),
            None => self.store.load_byte(address),
        }
    }

    fn store_byte(&mut self, address: u16, value: u8) -> Result<(), CpuError> {
        match self.write_hooks.get_mut(&address) {
            Some(hook) => hook.write_memory(address, value as u16, &mut self.store),
            None => self.store.store_byte(address, value),
        }
    }

    fn read(&self, address: u16, len: u16) -> Result<Vec<u8>, CpuError> {
        self.store.read(address, len)
    }

    fn clear(&mut self) {
        self.store.clear();
    }
}
