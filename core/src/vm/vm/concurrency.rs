use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use tracing::debug;

use crate::rt::channel::select;
use crate::rt::{Channel, Job, Selected};
use crate::val::{Val, ValKind};
use crate::vm::bytecode::Reg;
use crate::vm::vm::Vm;

impl Vm {
    /// `Scope`: start every spawned closure on a forked engine, run the
    /// synchronous body here, then wait for all tasks. A failure of the
    /// synchronous body takes precedence over task failures.
    pub(super) fn run_scope(&mut self, base: usize, start: Reg, spawns: u16) -> Result<Val> {
        let first = base + start as usize;
        let body = self.regs[first].clone();
        let jobs: Vec<Job> = self.regs[first + 1..=first + spawns as usize]
            .iter()
            .map(|closure| {
                let mut engine = self.fork();
                let task = self.detach_value(closure);
                Box::new(move || engine.call(&task, &[])) as Job
            })
            .collect();

        let group = self.scheduler().spawn(jobs);
        debug!(target: "lattice::vm::task", tasks = group.len(), "scope.enter");
        let outcome = match body.kind {
            ValKind::Nil | ValKind::Unit => Ok(Val::unit()),
            _ => self.call_value(&body, &[]),
        };
        let joined = group.join();
        let value = outcome?;
        joined?;
        debug!(target: "lattice::vm::task", "scope.exit");
        Ok(value)
    }

    /// `Select`: wait on the channel arms, then run the handler of whichever
    /// completed. A nil key marks the default arm, an Int key a timeout in
    /// milliseconds.
    pub(super) fn run_select(&mut self, base: usize, start: Reg, arms: u16) -> Result<Val> {
        let first = base + start as usize;
        let mut channels: Vec<Arc<Channel>> = Vec::with_capacity(arms as usize);
        let mut handlers = Vec::with_capacity(arms as usize);
        let mut default = None;
        let mut timeout = None;
        for arm in 0..arms as usize {
            let key = &self.regs[first + 2 * arm];
            let handler = self.regs[first + 2 * arm + 1].clone();
            match &key.kind {
                ValKind::Channel(ch) => {
                    channels.push(ch.clone());
                    handlers.push(handler);
                }
                ValKind::Nil => default = Some(handler),
                ValKind::Int(ms) => timeout = Some((Duration::from_millis((*ms).max(0) as u64), handler)),
                _ => bail!("select arm: expression is not a Channel"),
            }
        }

        let selected = select(&channels, default.is_some(), timeout.as_ref().map(|(d, _)| *d))?;
        debug!(target: "lattice::vm::task", arms, selected = ?selected, "select.done");
        match selected {
            Selected::Value(i, value) => self.fire_arm(&handlers[i], Some(value)),
            Selected::Closed(i) => self.fire_arm(&handlers[i], Some(Val::nil())),
            Selected::Default => self.fire_arm(&default.unwrap_or_else(Val::nil), None),
            Selected::Timeout => self.fire_arm(&timeout.map_or_else(Val::nil, |(_, h)| h), None),
        }
    }

    fn fire_arm(&mut self, handler: &Val, received: Option<Val>) -> Result<Val> {
        if handler.is_nil() {
            return Ok(received.unwrap_or_else(Val::unit));
        }
        match received {
            Some(value) => self.call_value(handler, &[value]),
            None => self.call_value(handler, &[]),
        }
    }
}
