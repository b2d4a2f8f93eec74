//! One emulated CPU per named instance.
//!
//! Each instance is an actor: a dedicated thread owns the [`UserCpu`] and
//! drains a mailbox of closures. While the instance is running the thread
//! checks the mailbox between instructions, so an inspection request always
//! sees a consistent state and never lands mid-instruction.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::config::InstanceConfig;
use crate::cpu::CPU;
use crate::decoder::decode;
use crate::error::{ControlError, CpuError, KvError};
use crate::hookable_memory::HookableMemory;
use crate::hooks::{self, IoContext};
use crate::kv::KvHandle;
use crate::loader::load_hex;
use crate::memory::{FlatMemory, Memory};
use crate::metrics::{
    record_fault, record_image_load, record_instance_reset, update_cpu_registers,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Stopped,
    Running,
    Fault,
    Stepping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakpointKind {
    /// Stop before executing the instruction.
    Stop,
    /// Execute the instruction, then stop.
    Step,
    /// Keep running.
    Trace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Disassembly {
    pub address: u16,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CpuStatus {
    pub name: String,
    pub state: RunState,
    pub registers: [u16; 16],
    pub image: String,
    pub last_fault: Option<String>,
    pub awaiting_input: bool,
    pub breakpoints: BTreeMap<u16, BreakpointKind>,
}

pub type Request = Box<dyn FnOnce(&mut UserCpu) + Send>;

/// The state owned by an instance thread.
pub struct UserCpu {
    name: String,
    cpu: CPU,
    memory: HookableMemory<FlatMemory>,
    state: RunState,
    image: String,
    breakpoints: BTreeMap<u16, BreakpointKind>,
    last_fault: Option<CpuError>,
    kv: KvHandle,
    config: InstanceConfig,
    awaiting_input: Arc<AtomicBool>,
}

impl UserCpu {
    pub fn new(name: &str, kv: KvHandle, config: InstanceConfig) -> Result<Self, CpuError> {
        let ctx = IoContext::new(name, kv.clone(), config.input_poll_interval(), config.io);
        let mut memory = HookableMemory::new(FlatMemory::new());
        hooks::install(&mut memory, &ctx)?;

        let mut cpu = CPU::new();
        cpu.set_pc(config.entry_point);

        Ok(UserCpu {
            name: name.to_string(),
            cpu,
            memory,
            state: RunState::Stopped,
            image: config.boot_image.clone(),
            breakpoints: BTreeMap::new(),
            last_fault: None,
            kv,
            config,
            awaiting_input: ctx.awaiting_input,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn set_state(&mut self, state: RunState) {
        if state != self.state {
            info!(cpu = %self.name, from = ?self.state, to = ?state, "state change");
            self.state = state;
            update_cpu_registers(&self.name, &self.cpu.registers());
        }
    }

    pub fn cpu(&self) -> &CPU {
        &self.cpu
    }

    pub fn memory(&self) -> &HookableMemory<FlatMemory> {
        &self.memory
    }

    pub fn last_fault(&self) -> Option<&CpuError> {
        self.last_fault.as_ref()
    }

    pub fn status(&self) -> CpuStatus {
        CpuStatus {
            name: self.name.clone(),
            state: self.state,
            registers: self.cpu.registers(),
            image: self.image.clone(),
            last_fault: self.last_fault.as_ref().map(|err| err.to_string()),
            awaiting_input: self.awaiting_input.load(Ordering::SeqCst),
            breakpoints: self.breakpoints.clone(),
        }
    }

    /// Overwrite the registers given as `Some`, leaving the others alone.
    pub fn set_registers(&mut self, regs: [Option<u16>; 16]) {
        for (index, value) in regs.iter().enumerate() {
            if let Some(value) = value {
                self.cpu.set_reg(index, *value);
            }
        }
    }

    pub fn read_memory(&self, address: u16, len: u16) -> Result<Vec<u8>, CpuError> {
        self.memory.read(address, len)
    }

    /// Disassemble up to `count` instructions from `address`, stopping at the
    /// first one that can't be fetched or decoded.
    pub fn disassemble(&mut self, address: u16, count: usize) -> Vec<Disassembly> {
        let count = count.min(self.config.max_disassembly);
        let mut out = Vec::with_capacity(count);
        let mut address = address;

        for _ in 0..count {
            let insn = match self.memory.load_6_bytes(address).and_then(|raw| decode(&raw)) {
                Ok(insn) => insn,
                Err(_) => break,
            };
            out.push(Disassembly {
                address,
                text: insn.to_string(),
            });
            address = address.wrapping_add(insn.width as u16);
        }
        out
    }

    pub fn breakpoints(&self) -> &BTreeMap<u16, BreakpointKind> {
        &self.breakpoints
    }

    pub fn set_breakpoint(&mut self, address: u16, kind: BreakpointKind) {
        debug!(cpu = %self.name, address, ?kind, "breakpoint set");
        self.breakpoints.insert(address, kind);
    }

    pub fn clear_breakpoint(&mut self, address: u16) -> bool {
        self.breakpoints.remove(&address).is_some()
    }

    /// Clear memory and load the hex image stored at `key`, bypassing hooks.
    pub fn load_image(&mut self, key: &str) -> Result<usize, ControlError> {
        let raw = self
            .kv
            .blocking_get(key)?
            .ok_or_else(|| KvError::NotFound(key.to_string()))?;
        let written = load_hex(self.memory.direct(), raw.as_slice())?;

        self.image = key.to_string();
        record_image_load(&self.name);
        info!(cpu = %self.name, image = key, bytes = written, "image loaded");
        Ok(written)
    }

    /// Reload the current image and start over from the entry point.
    pub fn reset(&mut self) -> Result<(), ControlError> {
        let image = self.image.clone();
        self.load_image(&image)?;

        let mut regs = [0u16; 16];
        regs[0] = self.config.entry_point;
        self.cpu.set_registers(regs);
        self.last_fault = None;
        self.set_state(RunState::Stopped);

        record_instance_reset(&self.name);
        Ok(())
    }

    /// Execute one instruction with no breakpoint checks. A halt counts as
    /// success; anything else is returned.
    pub fn step_ignoring_breakpoints(&mut self) -> Result<(), CpuError> {
        match self.cpu.step(&mut self.memory) {
            Ok(_) => Ok(()),
            Err(err) if err.is_halt() => {
                debug!(cpu = %self.name, pc = self.cpu.get_pc(), "cpu halted");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Step past whatever stopped the instance, then run. If that step halts
    /// the CPU the instance stops instead.
    pub fn resume(&mut self) -> Result<(), CpuError> {
        self.step_ignoring_breakpoints()?;
        if self.cpu.is_halted() {
            self.set_state(RunState::Stopped);
        } else {
            self.set_state(RunState::Running);
        }
        Ok(())
    }

    /// One iteration of free-running execution.
    pub fn tick(&mut self) {
        let pc = self.cpu.get_pc();
        let mut stop_after = false;

        match self.breakpoints.get(&pc) {
            Some(BreakpointKind::Stop) => {
                debug!(cpu = %self.name, pc, "stop breakpoint");
                self.set_state(RunState::Stopped);
                return;
            }
            Some(BreakpointKind::Step) => stop_after = true,
            Some(BreakpointKind::Trace) => trace!(cpu = %self.name, pc, "trace breakpoint"),
            None => {}
        }

        match self.cpu.step(&mut self.memory) {
            Ok(_) => {}
            Err(err) if err.is_halt() => {
                info!(cpu = %self.name, pc = self.cpu.get_pc(), "cpu halted");
                self.set_state(RunState::Stopped);
            }
            Err(err) => self.fault(err),
        }

        if stop_after && self.state == RunState::Running {
            self.set_state(RunState::Stopped);
        }
    }

    fn fault(&mut self, err: CpuError) {
        warn!(cpu = %self.name, pc = self.cpu.get_pc(), error = %err, "cpu fault");
        record_fault(&self.name, err.kind());
        self.last_fault = Some(err);
        self.set_state(RunState::Fault);
    }
}

fn run(mut ucpu: UserCpu, mut mailbox: mpsc::UnboundedReceiver<Request>) {
    info!(cpu = %ucpu.name, "instance started");
    loop {
        if ucpu.state == RunState::Running {
            match mailbox.try_recv() {
                Ok(request) => request(&mut ucpu),
                Err(TryRecvError::Empty) => ucpu.tick(),
                Err(TryRecvError::Disconnected) => break,
            }
        } else {
            match mailbox.blocking_recv() {
                Some(request) => request(&mut ucpu),
                None => break,
            }
        }
    }
    debug!(cpu = %ucpu.name, "instance stopped");
}

/// Cloneable control surface for one instance.
#[derive(Clone)]
pub struct CpuHandle {
    name: Arc<str>,
    sender: mpsc::UnboundedSender<Request>,
    awaiting_input: Arc<AtomicBool>,
}

impl CpuHandle {
    /// Build the instance and start its thread.
    pub fn spawn(name: &str, kv: KvHandle, config: InstanceConfig) -> Result<CpuHandle, ControlError> {
        let ucpu = UserCpu::new(name, kv, config)?;
        let awaiting_input = ucpu.awaiting_input.clone();
        let (sender, receiver) = mpsc::unbounded_channel();

        thread::Builder::new()
            .name(format!("cpu-{}", name))
            .spawn(move || run(ucpu, receiver))
            .map_err(|err| ControlError::Spawn(err.to_string()))?;

        Ok(CpuHandle {
            name: Arc::from(name),
            sender,
            awaiting_input,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` on the instance thread, in mailbox order.
    pub async fn request<R, F>(&self, f: F) -> Result<R, ControlError>
    where
        R: Send + 'static,
        F: FnOnce(&mut UserCpu) -> R + Send + 'static,
    {
        let (reply, receiver) = oneshot::channel();
        self.sender
            .send(Box::new(move |ucpu: &mut UserCpu| {
                let _ = reply.send(f(ucpu));
            }))
            .map_err(|_| ControlError::Gone(self.name.to_string()))?;
        receiver
            .await
            .map_err(|_| ControlError::Gone(self.name.to_string()))
    }

    pub fn is_awaiting_input(&self) -> bool {
        self.awaiting_input.load(Ordering::SeqCst)
    }

    fn check_ready(&self) -> Result<(), ControlError> {
        if self.is_awaiting_input() {
            return Err(ControlError::NotReady);
        }
        Ok(())
    }

    pub async fn status(&self) -> Result<CpuStatus, ControlError> {
        self.request(|ucpu| ucpu.status()).await
    }

    pub async fn state(&self) -> Result<RunState, ControlError> {
        self.request(|ucpu| ucpu.state()).await
    }

    pub async fn registers(&self) -> Result<[u16; 16], ControlError> {
        self.request(|ucpu| ucpu.cpu().registers()).await
    }

    pub async fn set_registers(&self, regs: [Option<u16>; 16]) -> Result<(), ControlError> {
        self.request(move |ucpu| ucpu.set_registers(regs)).await
    }

    pub async fn read_memory(&self, address: u16, len: u16) -> Result<Vec<u8>, ControlError> {
        Ok(self.request(move |ucpu| ucpu.read_memory(address, len)).await??)
    }

    pub async fn disassemble(&self, address: u16, count: usize) -> Result<Vec<Disassembly>, ControlError> {
        self.request(move |ucpu| ucpu.disassemble(address, count)).await
    }

    pub async fn breakpoints(&self) -> Result<BTreeMap<u16, BreakpointKind>, ControlError> {
        self.request(|ucpu| ucpu.breakpoints().clone()).await
    }

    pub async fn set_breakpoint(&self, address: u16, kind: BreakpointKind) -> Result<(), ControlError> {
        self.request(move |ucpu| ucpu.set_breakpoint(address, kind)).await
    }

    pub async fn clear_breakpoint(&self, address: u16) -> Result<bool, ControlError> {
        self.request(move |ucpu| ucpu.clear_breakpoint(address)).await
    }

    pub async fn boot(&self) -> Result<(), ControlError> {
        self.check_ready()?;
        self.request(|ucpu| ucpu.set_state(RunState::Running)).await
    }

    /// Step past whatever stopped the instance, then let it run.
    pub async fn continue_execution(&self) -> Result<(), ControlError> {
        self.check_ready()?;
        Ok(self.request(|ucpu| ucpu.resume()).await??)
    }

    pub async fn step(&self) -> Result<(), ControlError> {
        self.check_ready()?;
        self.request(|ucpu| {
            let previous = ucpu.state();
            ucpu.set_state(RunState::Stepping);
            match ucpu.step_ignoring_breakpoints() {
                Ok(()) => {
                    ucpu.set_state(RunState::Stopped);
                    Ok(())
                }
                Err(err) => {
                    ucpu.set_state(previous);
                    Err(err)
                }
            }
        })
        .await??;
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ControlError> {
        self.check_ready()?;
        self.request(|ucpu| ucpu.set_state(RunState::Stopped)).await
    }

    pub async fn load_image(&self, key: &str) -> Result<usize, ControlError> {
        let key = key.to_string();
        self.request(move |ucpu| ucpu.load_image(&key)).await?
    }

    pub async fn reset(&self) -> Result<(), ControlError> {
        self.request(|ucpu| ucpu.reset()).await?
    }
}
