//! Host side of the guest instrumentation imports.
//!
//! Each import copies its arguments out of guest memory, builds a
//! `GuestCall`, and returns the bridge's reply as a bare integer.

use crate::guest::protocol::{
    decode_text, parse_tags, span_ref, GuestCall, GuestLogLevel, IMPORT_MODULE, MAX_NAME_BYTES,
    MAX_TAG_BYTES,
};
use crate::sandbox::host::{read_guest, HostState};
use wasmtime::{Caller, Linker};

fn read_text(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32, max: usize) -> Option<String> {
    read_guest(caller, ptr, len, max).and_then(|bytes| decode_text(&bytes, max))
}

pub(crate) fn add_to_linker(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    linker.func_wrap(
        IMPORT_MODULE,
        "span_open",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32, parent: i64| -> i64 {
            let reply = match read_text(&mut caller, ptr, len, MAX_NAME_BYTES) {
                Some(name) => caller.data_mut().bridge.handle(GuestCall::OpenSpan {
                    name,
                    parent: span_ref(parent),
                }),
                None => caller.data_mut().bridge.reject("span_open"),
            };
            reply.as_i64()
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "span_close",
        |mut caller: Caller<'_, HostState>, id: i64| -> i32 {
            let reply = match span_ref(id) {
                Some(id) => caller.data_mut().bridge.handle(GuestCall::CloseSpan { id }),
                None => caller.data_mut().bridge.reject("span_close"),
            };
            reply.as_i32()
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "span_tags",
        |mut caller: Caller<'_, HostState>, id: i64, ptr: i32, len: i32| -> i32 {
            let raw = read_text(&mut caller, ptr, len, MAX_TAG_BYTES);
            let reply = match (span_ref(id), raw) {
                (Some(id), Some(raw)) => caller.data_mut().bridge.handle(GuestCall::AttachTags {
                    id,
                    tags: parse_tags(&raw),
                }),
                _ => caller.data_mut().bridge.reject("span_tags"),
            };
            reply.as_i32()
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "span_enter",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> i32 {
            let reply = match read_text(&mut caller, ptr, len, MAX_NAME_BYTES) {
                Some(name) => caller
                    .data_mut()
                    .bridge
                    .handle(GuestCall::EnterSpan { name }),
                None => caller.data_mut().bridge.reject("span_enter"),
            };
            reply.as_i32()
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "span_exit",
        |mut caller: Caller<'_, HostState>| -> i32 {
            caller.data_mut().bridge.handle(GuestCall::ExitSpan).as_i32()
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "span_tags_current",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> i32 {
            let reply = match read_text(&mut caller, ptr, len, MAX_TAG_BYTES) {
                Some(raw) => caller.data_mut().bridge.handle(GuestCall::TagCurrent {
                    tags: parse_tags(&raw),
                }),
                None => caller.data_mut().bridge.reject("span_tags_current"),
            };
            reply.as_i32()
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "log",
        |mut caller: Caller<'_, HostState>, level: i32, ptr: i32, len: i32| -> i32 {
            let message = read_text(&mut caller, ptr, len, MAX_TAG_BYTES);
            let reply = match (GuestLogLevel::from_code(level), message) {
                (Some(level), Some(message)) => caller
                    .data_mut()
                    .bridge
                    .handle(GuestCall::Log { level, message }),
                _ => caller.data_mut().bridge.reject("log"),
            };
            reply.as_i32()
        },
    )?;

    Ok(())
}
