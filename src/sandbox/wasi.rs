//! The stdio/args subset of `wasi_snapshot_preview1` granted to guests.
//!
//! `wasmtime-wasi` provides the preview1 surface; `fd_read` and `fd_write`
//! are shadowed so stdio stays in host memory and feeds the automatic
//! spans. Anything not listed in `IMPORTS` (clocks, randomness, files,
//! sockets) is rejected before instantiation.

use crate::guest::STDOUT_SPAN;
use crate::sandbox::host::{guest_memory, read_u32, write_u32, HostState};
use crate::span::Tag;
use std::io::Read;
use wasmtime::{Caller, Linker};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::WasiCtxBuilder;

pub const WASI_MODULE: &str = "wasi_snapshot_preview1";

pub const IMPORTS: &[&str] = &[
    "args_get",
    "args_sizes_get",
    "environ_get",
    "environ_sizes_get",
    "fd_read",
    "fd_write",
    "fd_close",
    "fd_fdstat_get",
    "fd_seek",
    "proc_exit",
    "sched_yield",
];

const ERRNO_SUCCESS: i32 = 0;
const ERRNO_BADF: i32 = 8;
const ERRNO_FAULT: i32 = 21;
const ERRNO_FBIG: i32 = 22;
const ERRNO_INVAL: i32 = 28;

const STDIN: i32 = 0;
const STDOUT: i32 = 1;
const STDERR: i32 = 2;

/// A WASI context with `args` and nothing else: no preopens, no environment,
/// no inherited stdio.
pub(crate) fn guest_ctx(args: &[String]) -> WasiP1Ctx {
    WasiCtxBuilder::new().args(args).build_p1()
}

pub(crate) fn add_to_linker(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    preview1::add_to_linker_sync(linker, |state: &mut HostState| &mut state.wasi)?;
    linker.allow_shadowing(true);
    linker.func_wrap(WASI_MODULE, "fd_read", fd_read)?;
    linker.func_wrap(WASI_MODULE, "fd_write", fd_write)?;
    linker.allow_shadowing(false);
    Ok(())
}

fn fd_read(mut caller: Caller<'_, HostState>, fd: i32, iovs: i32, iovs_len: i32, nread_ptr: i32) -> i32 {
    if fd != STDIN {
        return ERRNO_BADF;
    }
    if iovs_len < 0 {
        return ERRNO_INVAL;
    }
    let Some(memory) = guest_memory(&mut caller) else {
        return ERRNO_FAULT;
    };

    let mut total = 0usize;
    for i in 0..iovs_len as usize {
        let base = iovs as u32 as usize + i * 8;
        let (Some(ptr), Some(len)) = (
            read_u32(&memory, &caller, base),
            read_u32(&memory, &caller, base + 4),
        ) else {
            return ERRNO_FAULT;
        };
        let len = len as usize;
        if len == 0 {
            continue;
        }

        let chunk = {
            let state = caller.data_mut();
            let want = len.min(state.stdin_remaining());
            let mut buf = vec![0u8; want];
            let n = state.stdin.read(&mut buf).unwrap_or(0);
            buf.truncate(n);
            state.bridge.on_stdin_read(&buf);
            buf
        };
        if chunk.is_empty() {
            break;
        }
        if memory.write(&mut caller, ptr as usize, &chunk).is_err() {
            return ERRNO_FAULT;
        }
        total += chunk.len();
        if chunk.len() < len {
            break;
        }
    }

    if write_u32(&memory, &mut caller, nread_ptr as u32 as usize, total as u32) {
        ERRNO_SUCCESS
    } else {
        ERRNO_FAULT
    }
}

fn fd_write(mut caller: Caller<'_, HostState>, fd: i32, iovs: i32, iovs_len: i32, nwritten_ptr: i32) -> i32 {
    if fd != STDOUT && fd != STDERR {
        return ERRNO_BADF;
    }
    if iovs_len < 0 {
        return ERRNO_INVAL;
    }
    let Some(memory) = guest_memory(&mut caller) else {
        return ERRNO_FAULT;
    };

    let span = if fd == STDOUT {
        caller.data_mut().bridge.auto_begin(STDOUT_SPAN)
    } else {
        None
    };

    let max_output = caller.data().max_output;
    let mut data = Vec::new();
    let mut errno = ERRNO_SUCCESS;
    for i in 0..iovs_len as usize {
        let base = iovs as u32 as usize + i * 8;
        let (Some(ptr), Some(len)) = (
            read_u32(&memory, &caller, base),
            read_u32(&memory, &caller, base + 4),
        ) else {
            errno = ERRNO_FAULT;
            break;
        };
        let len = len as usize;
        if data.len() + len > max_output {
            errno = ERRNO_FBIG;
            break;
        }
        let start = data.len();
        data.resize(start + len, 0);
        if memory.read(&caller, ptr as usize, &mut data[start..]).is_err() {
            errno = ERRNO_FAULT;
            break;
        }
    }

    let written = data.len();
    {
        let state = caller.data_mut();
        if errno == ERRNO_SUCCESS {
            let target = if fd == STDOUT { &mut state.stdout } else { &mut state.stderr };
            if target.len() + written > state.max_output {
                errno = ERRNO_FBIG;
            } else {
                target.extend_from_slice(&data);
            }
        }
        let mut tags = vec![Tag::new("bytes", written.to_string())];
        if errno != ERRNO_SUCCESS {
            tags.push(Tag::new("errno", errno.to_string()));
        }
        state.bridge.auto_end(span, tags);
    }

    if errno != ERRNO_SUCCESS {
        return errno;
    }
    if write_u32(&memory, &mut caller, nwritten_ptr as u32 as usize, written as u32) {
        ERRNO_SUCCESS
    } else {
        ERRNO_FAULT
    }
}
