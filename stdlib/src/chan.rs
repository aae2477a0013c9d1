//! Channel module for Lattice
//!
//! Channel construction and operations for communication between spawned
//! tasks. `chan(capacity)` is also a global.

use anyhow::{Result, anyhow};
use lattice_core::module::{Module, ModuleRegistry};
use lattice_core::rt::{Channel, Host, TryRecv};
use lattice_core::val::{NativeFn, Val, ValKind};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct ChannelModule;

impl ChannelModule {
    pub fn new() -> Self {
        Self
    }
}

impl Module for ChannelModule {
    fn name(&self) -> &str {
        "chan"
    }

    fn description(&self) -> &str {
        "Channel operations for inter-task communication"
    }

    fn register(&self, registry: &mut ModuleRegistry) -> Result<()> {
        registry.register_builtin("chan", Val::native("chan", chan_new));
        for (name, value) in self.exports() {
            registry.register_builtin(&format!("{}::{}", self.name(), name), value);
        }
        Ok(())
    }

    fn exports(&self) -> HashMap<String, Val> {
        let natives: [(&str, NativeFn); 10] = [
            ("new", chan_new),
            ("send", chan_send),
            ("recv", chan_recv),
            ("recv_timeout", chan_recv_timeout),
            ("try_send", chan_try_send),
            ("try_recv", chan_try_recv),
            ("close", chan_close),
            ("len", chan_len),
            ("capacity", chan_capacity),
            ("is_closed", chan_is_closed),
        ];
        natives
            .into_iter()
            .map(|(name, func)| (name.to_string(), Val::native(name, func)))
            .collect()
    }
}

fn channel_arg<'a>(args: &'a [Val], func: &str) -> Result<&'a Arc<Channel>> {
    match args.first().map(|v| &v.kind) {
        Some(ValKind::Channel(ch)) => Ok(ch),
        Some(_) | None => Err(anyhow!("chan::{func}() expects a Channel as first argument")),
    }
}

fn value_arg<'a>(args: &'a [Val], func: &str) -> Result<&'a Val> {
    args.get(1)
        .ok_or_else(|| anyhow!("chan::{func}() expects a value to send"))
}

/// `[ok, value]` pair returned by the non-blocking receives.
fn received(ok: bool, value: Val) -> Val {
    Val::array(vec![Val::bool(ok), value])
}

/// chan() or chan(0) is unbounded; chan(n) holds at most n values.
fn chan_new(args: &[Val], _host: &mut dyn Host) -> Result<Val> {
    let capacity = match args.first().map(|v| &v.kind) {
        None | Some(ValKind::Nil) => None,
        Some(ValKind::Int(n)) if *n <= 0 => None,
        Some(ValKind::Int(n)) => Some(*n as usize),
        Some(_) => return Err(anyhow!("chan() capacity must be an integer")),
    };
    Ok(Val::channel(Channel::new(capacity)))
}

fn chan_send(args: &[Val], _host: &mut dyn Host) -> Result<Val> {
    let ch = channel_arg(args, "send")?;
    Ok(Val::bool(ch.send(value_arg(args, "send")?.clone())))
}

/// Blocking receive; nil once the channel is closed and drained.
fn chan_recv(args: &[Val], _host: &mut dyn Host) -> Result<Val> {
    Ok(channel_arg(args, "recv")?.recv().unwrap_or_else(Val::nil))
}

fn chan_recv_timeout(args: &[Val], _host: &mut dyn Host) -> Result<Val> {
    let ch = channel_arg(args, "recv_timeout")?;
    let ms = args
        .get(1)
        .and_then(Val::as_int)
        .ok_or_else(|| anyhow!("chan::recv_timeout() expects a timeout in milliseconds"))?;
    Ok(match ch.recv_timeout(Duration::from_millis(ms.max(0) as u64)) {
        TryRecv::Value(v) => received(true, v),
        TryRecv::Empty | TryRecv::Closed => received(false, Val::nil()),
    })
}

fn chan_try_send(args: &[Val], _host: &mut dyn Host) -> Result<Val> {
    let ch = channel_arg(args, "try_send")?;
    Ok(Val::bool(ch.try_send(value_arg(args, "try_send")?.clone())?))
}

fn chan_try_recv(args: &[Val], _host: &mut dyn Host) -> Result<Val> {
    Ok(match channel_arg(args, "try_recv")?.try_recv() {
        TryRecv::Value(v) => received(true, v),
        TryRecv::Empty | TryRecv::Closed => received(false, Val::nil()),
    })
}

fn chan_close(args: &[Val], _host: &mut dyn Host) -> Result<Val> {
    channel_arg(args, "close")?.close();
    Ok(Val::unit())
}

fn chan_len(args: &[Val], _host: &mut dyn Host) -> Result<Val> {
    Ok(Val::int(channel_arg(args, "len")?.len() as i64))
}

/// Unbounded channels report 0.
fn chan_capacity(args: &[Val], _host: &mut dyn Host) -> Result<Val> {
    Ok(Val::int(channel_arg(args, "capacity")?.capacity().unwrap_or(0) as i64))
}

fn chan_is_closed(args: &[Val], _host: &mut dyn Host) -> Result<Val> {
    Ok(Val::bool(channel_arg(args, "is_closed")?.is_closed()))
}
