//! Message channels shared between engines.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Select, Sender, TryRecvError, TrySendError};

use crate::val::Val;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Reference-counted message queue. Cloning the `Arc` shares the queue.
pub struct Channel {
    id: u64,
    capacity: Option<usize>,
    /// Dropped on close so receivers observe disconnection once drained.
    sender: Mutex<Option<Sender<Val>>>,
    receiver: Receiver<Val>,
    closed: AtomicBool,
}

/// Result of a non-blocking receive.
#[derive(Debug, PartialEq)]
pub enum TryRecv {
    Value(Val),
    Empty,
    Closed,
}

impl Channel {
    /// `None` capacity means unbounded.
    pub fn new(capacity: Option<usize>) -> Arc<Self> {
        let (sender, receiver) = match capacity {
            Some(cap) => channel::bounded(cap),
            None => channel::unbounded(),
        };
        Arc::new(Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            capacity,
            sender: Mutex::new(Some(sender)),
            receiver,
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    fn sender(&self) -> Option<Sender<Val>> {
        match self.sender.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Blocking send. Returns `false` once the channel is closed.
    pub fn send(&self, value: Val) -> bool {
        match self.sender() {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Non-blocking send. `Ok(false)` when a bounded channel is full.
    pub fn try_send(&self, value: Val) -> Result<bool> {
        let Some(tx) = self.sender() else {
            bail!("channel is closed");
        };
        match tx.try_send(value) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Disconnected(_)) => bail!("channel is closed"),
        }
    }

    pub fn try_recv(&self) -> TryRecv {
        match self.receiver.try_recv() {
            Ok(value) => TryRecv::Value(value),
            Err(TryRecvError::Empty) => TryRecv::Empty,
            Err(TryRecvError::Disconnected) => TryRecv::Closed,
        }
    }

    /// Blocking receive; `None` once closed and drained.
    pub fn recv(&self) -> Option<Val> {
        self.receiver.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> TryRecv {
        match self.receiver.recv_timeout(timeout) {
            Ok(value) => TryRecv::Value(value),
            Err(RecvTimeoutError::Timeout) => TryRecv::Empty,
            Err(RecvTimeoutError::Disconnected) => TryRecv::Closed,
        }
    }

    /// Close the sending side. Buffered values stay receivable.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        match self.sender.lock() {
            Ok(mut guard) => drop(guard.take()),
            Err(poisoned) => drop(poisoned.into_inner().take()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of buffered values.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Which arm of a select completed.
#[derive(Debug, PartialEq)]
pub enum Selected {
    /// Arm `index` received a value.
    Value(usize, Val),
    /// Arm `index` is closed and drained.
    Closed(usize),
    Default,
    Timeout,
}

/// Wait on several channels.
///
/// With `has_default`, arms are polled in order and `Default` is returned when
/// none is ready. Otherwise this blocks until an arm is ready or `timeout`
/// elapses.
pub fn select(channels: &[Arc<Channel>], has_default: bool, timeout: Option<Duration>) -> Result<Selected> {
    if has_default {
        for (index, ch) in channels.iter().enumerate() {
            match ch.try_recv() {
                TryRecv::Value(v) => return Ok(Selected::Value(index, v)),
                TryRecv::Closed => return Ok(Selected::Closed(index)),
                TryRecv::Empty => {}
            }
        }
        return Ok(Selected::Default);
    }

    if channels.is_empty() {
        match timeout {
            Some(t) => {
                std::thread::sleep(t);
                return Ok(Selected::Timeout);
            }
            None => bail!("select has no arms that can ever complete"),
        }
    }

    let mut sel = Select::new();
    for ch in channels {
        sel.recv(&ch.receiver);
    }
    let oper = match timeout {
        Some(t) => match sel.select_timeout(t) {
            Ok(oper) => oper,
            Err(_) => return Ok(Selected::Timeout),
        },
        None => sel.select(),
    };
    let index = oper.index();
    Ok(match oper.recv(&channels[index].receiver) {
        Ok(v) => Selected::Value(index, v),
        Err(_) => Selected::Closed(index),
    })
}
