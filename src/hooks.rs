//! Memory-mapped peripherals, backed by the key/value collaborator.
//!
//! Every peripheral is a write hook. Hooks run on the instance's own thread
//! and make blocking round-trips to the key/value actor, so a slow store stalls
//! only the instance that touched the peripheral.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::IoMap;
use crate::error::{CpuError, KvError};
use crate::hookable_memory::{HookableMemory, WriteHook};
use crate::kv::KvHandle;
use crate::memory::Memory;
use crate::metrics::record_hook_invocation;

const MAX_LOG_ENTRY: usize = 100;
const MAX_LOG_ENTRIES: i64 = 100;
const OUTPUT_WINDOW: (i64, i64) = (-399, 400);

/// What a hook needs to know about the instance it serves.
#[derive(Clone)]
pub struct IoContext {
    pub name: String,
    pub kv: KvHandle,
    pub awaiting_input: Arc<AtomicBool>,
    pub poll_interval: Duration,
    pub io: IoMap,
}

impl IoContext {
    pub fn new(name: &str, kv: KvHandle, poll_interval: Duration, io: IoMap) -> Self {
        IoContext {
            name: name.to_string(),
            kv,
            awaiting_input: Arc::new(AtomicBool::new(false)),
            poll_interval,
            io,
        }
    }

    /// The per-instance key for `suffix`, e.g. `NAME:output`.
    pub fn key(&self, suffix: &str) -> String {
        instance_key(&self.name, suffix)
    }

    /// Append `<unix-seconds>:<entry>` to the instance debug log.
    pub fn debug_log(&self, entry: &[u8]) -> Result<(), KvError> {
        let entry = &entry[..entry.len().min(MAX_LOG_ENTRY)];
        let mut line = format!("{}:", chrono::Utc::now().timestamp()).into_bytes();
        line.extend_from_slice(entry);

        debug!(cpu = %self.name, entry = %String::from_utf8_lossy(entry), "debug log");
        self.kv.blocking_push_bounded(&self.key("debuglog"), line, MAX_LOG_ENTRIES)
    }
}

pub fn instance_key(name: &str, suffix: &str) -> String {
    format!("{}:{}", name, suffix)
}

/// Clears the awaiting-input flag however the input hook exits.
struct AwaitingInput<'a>(&'a AtomicBool);

impl<'a> AwaitingInput<'a> {
    fn begin(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        AwaitingInput(flag)
    }
}

impl Drop for AwaitingInput<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Write to the input-length word: the value is the most bytes wanted. Blocks
/// until `NAME:input` exists, consumes it into the input buffer and writes
/// back how many bytes were copied.
pub struct UserInputHook {
    ctx: IoContext,
}

impl WriteHook for UserInputHook {
    fn write_memory(&mut self, address: u16, max: u16, store: &mut dyn Memory) -> Result<(), CpuError> {
        record_hook_invocation("user_input");
        let buffer = store.load_word(self.ctx.io.input_buffer)?;

        let raw = {
            let _waiting = AwaitingInput::begin(&self.ctx.awaiting_input);
            info!(cpu = %self.ctx.name, max, "waiting for user input");
            loop {
                let key = self.ctx.key("input");
                let input = self.ctx.kv.blocking_call(move |kv| {
                    let value = kv.get(&key)?;
                    if value.is_some() {
                        kv.del(&key)?;
                    }
                    Ok(value)
                })?;
                match input {
                    Some(raw) => break raw,
                    None => thread::sleep(self.ctx.poll_interval),
                }
            }
        };

        let length = raw.len().min(max as usize) as u16;
        debug!(cpu = %self.ctx.name, length, total = raw.len(), "importing user input");
        for (i, &byte) in raw.iter().take(length as usize).enumerate() {
            store.store_byte(buffer.wrapping_add(i as u16), byte)?;
        }
        store.store_word(address, length)
    }
}

/// Write to the output byte: append it to `NAME:output`, keeping roughly the
/// last 400 bytes.
pub struct UserOutputHook {
    ctx: IoContext,
}

impl WriteHook for UserOutputHook {
    fn write_memory(&mut self, _address: u16, value: u16, _store: &mut dyn Memory) -> Result<(), CpuError> {
        record_hook_invocation("user_output");
        let key = self.ctx.key("output");
        self.ctx.kv.blocking_call(move |kv| {
            let mut output = kv.getrange(&key, OUTPUT_WINDOW.0, OUTPUT_WINDOW.1)?;
            output.push(value as u8);
            kv.set(&key, output)
        })?;
        Ok(())
    }
}

/// Write to the debug-log length word: log that many bytes from the buffer
/// whose address is in the debug-log buffer word.
pub struct DebugLogHook {
    ctx: IoContext,
}

impl WriteHook for DebugLogHook {
    fn write_memory(&mut self, _address: u16, length: u16, store: &mut dyn Memory) -> Result<(), CpuError> {
        record_hook_invocation("debug_log");
        let buffer = store.load_word(self.ctx.io.debug_buffer)?;
        let data = store.read(buffer, length)?;
        self.ctx.debug_log(&data)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Lock,
    Alarm,
    Temperature,
    Airflow,
}

impl Device {
    pub fn name(self) -> &'static str {
        match self {
            Device::Lock => "lock",
            Device::Alarm => "alarm",
            Device::Temperature => "temperature",
            Device::Airflow => "airflow",
        }
    }

    pub fn address(self, io: &IoMap) -> u16 {
        match self {
            Device::Lock => io.lock,
            Device::Alarm => io.alarm,
            Device::Temperature => io.temperature,
            Device::Airflow => io.airflow,
        }
    }

    fn message(self, value: u16) -> String {
        match (self, value) {
            (Device::Lock, 0) => "LOCK ENGAGED".to_string(),
            (Device::Lock, _) => "LOCK DISENGAGED".to_string(),
            (Device::Alarm, 0) => "ALARM DISARMED".to_string(),
            (Device::Alarm, _) => "ALARM ARMED".to_string(),
            (Device::Temperature, _) => format!("TEMPERATURE TARGET: {}", value),
            (Device::Airflow, _) => format!("AIRFLOW TARGET: {}", value as u8),
        }
    }
}

/// A device register: keeps the written value, mirrors it to `NAME:<device>`
/// and notes the change in the debug log.
pub struct DeviceHook {
    ctx: IoContext,
    device: Device,
}

impl WriteHook for DeviceHook {
    fn write_memory(&mut self, address: u16, value: u16, store: &mut dyn Memory) -> Result<(), CpuError> {
        record_hook_invocation(self.device.name());
        store.store_word(address, value)?;
        self.ctx
            .kv
            .blocking_set(&self.ctx.key(self.device.name()), value.to_string().into_bytes())?;

        let message = self.device.message(value);
        info!(cpu = %self.ctx.name, device = self.device.name(), value, "{}", message);
        self.ctx.debug_log(message.as_bytes())?;
        Ok(())
    }
}

/// Bind every peripheral hook at the addresses in `ctx.io`.
pub fn install<S: Memory>(memory: &mut HookableMemory<S>, ctx: &IoContext) -> Result<(), CpuError> {
    let io = ctx.io;
    memory.bind_write_hook(io.output, UserOutputHook { ctx: ctx.clone() })?;
    memory.bind_write_hook(io.input_length, UserInputHook { ctx: ctx.clone() })?;
    memory.bind_write_hook(io.debug_length, DebugLogHook { ctx: ctx.clone() })?;

    for device in [Device::Alarm, Device::Airflow, Device::Lock, Device::Temperature] {
        memory.bind_write_hook(
            device.address(&io),
            DeviceHook {
                ctx: ctx.clone(),
                device,
            },
        )?;
    }
    Ok(())
}
