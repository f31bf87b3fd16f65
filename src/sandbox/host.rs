//! Per-execution store data and guest memory access.

use crate::guest::InstrumentationBridge;
use std::io::Cursor;
use wasmtime::{Caller, Extern, Memory, StoreLimits};
use wasmtime_wasi::preview1::WasiP1Ctx;

pub(crate) struct HostState {
    pub stdin: Cursor<Vec<u8>>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub max_output: usize,
    pub wasi: WasiP1Ctx,
    pub bridge: InstrumentationBridge,
    pub limits: StoreLimits,
    pub timed_out: bool,
}

impl HostState {
    pub fn stdin_remaining(&self) -> usize {
        let len = self.stdin.get_ref().len() as u64;
        len.saturating_sub(self.stdin.position()) as usize
    }
}

pub(crate) fn guest_memory(caller: &mut Caller<'_, HostState>) -> Option<Memory> {
    match caller.get_export("memory") {
        Some(Extern::Memory(memory)) => Some(memory),
        _ => None,
    }
}

/// Copies `len` bytes out of guest memory, refusing lengths over `max`.
pub(crate) fn read_guest(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32, max: usize) -> Option<Vec<u8>> {
    let len = len as u32 as usize;
    if len > max {
        return None;
    }
    let memory = guest_memory(caller)?;
    let mut buf = vec![0u8; len];
    memory.read(&*caller, ptr as u32 as usize, &mut buf).ok()?;
    Some(buf)
}

pub(crate) fn read_u32(memory: &Memory, caller: &Caller<'_, HostState>, offset: usize) -> Option<u32> {
    let mut raw = [0u8; 4];
    memory.read(caller, offset, &mut raw).ok()?;
    Some(u32::from_le_bytes(raw))
}

pub(crate) fn write_u32(memory: &Memory, caller: &mut Caller<'_, HostState>, offset: usize, value: u32) -> bool {
    memory
        .write(&mut *caller, offset, &value.to_le_bytes())
        .is_ok()
}
