use crate::rt::Channel;

use super::*;

fn single_threaded() -> Vm {
    let config = VmConfig {
        single_thread: true,
        ..VmConfig::default()
    };
    Vm::with_config(Arc::new(ModuleRegistry::new()), &config)
}

fn invoke(b: &mut ChunkBuilder, dst: u16, obj: u16, method: &str, base: u16, argc: u16) {
    let method = b.k_str(method).unwrap();
    b.emit(Op::Invoke {
        dst,
        obj,
        method,
        base,
        argc,
    });
}

/// `|| ch.send(value)` reading `ch` from globals.
fn sender(value: i32) -> Chunk {
    let mut f = ChunkBuilder::new("producer");
    let ch = f.alloc();
    let v = f.alloc();
    let name = f.k_str("ch").unwrap();
    f.emit(Op::GetGlobal(ch, name));
    f.emit(Op::LoadInt(v, value));
    invoke(&mut f, v, ch, "send", v, 1);
    f.emit(Op::Return(v));
    f.finish().unwrap()
}

/// `scope { spawn producers... }; ch.recv() + ch.recv()`
fn scope_then_sum(values: &[i32]) -> Chunk {
    let mut b = ChunkBuilder::new("<main>");
    let slots = b.alloc_run(1 + values.len() as u16);
    b.emit(Op::LoadNil(slots));
    for (i, v) in values.iter().enumerate() {
        let p = b.proto(sender(*v)).unwrap();
        b.closure(slots + 1 + i as u16, p, &[]).unwrap();
    }
    let out = b.alloc();
    b.emit(Op::Scope {
        dst: out,
        base: slots,
        spawns: values.len() as u16,
    });
    let ch = b.alloc();
    let name = b.k_str("ch").unwrap();
    b.emit(Op::GetGlobal(ch, name));
    let (x, y) = (b.alloc(), b.alloc());
    invoke(&mut b, x, ch, "recv", x, 0);
    invoke(&mut b, y, ch, "recv", y, 0);
    b.emit(Op::Add(x, x, y));
    b.emit(Op::Return(x));
    b.finish().unwrap()
}

#[test]
fn test_scope_waits_for_spawned_tasks() {
    let mut vm = single_threaded();
    vm.set_global("ch", Val::channel(Channel::new(None)));
    assert_eq!(vm.run(Arc::new(scope_then_sum(&[1, 2]))).unwrap(), Val::int(3));
}

#[test]
fn test_scope_on_worker_threads() {
    let mut vm = Vm::default();
    vm.set_global("ch", Val::channel(Channel::new(None)));
    assert_eq!(vm.run(Arc::new(scope_then_sum(&[20, 22]))).unwrap(), Val::int(42));
}

#[test]
fn test_task_failure_fails_the_scope() {
    let mut bad = ChunkBuilder::new("bad");
    let x = bad.alloc();
    let zero = bad.alloc();
    bad.emit(Op::LoadInt(x, 1));
    bad.emit(Op::LoadInt(zero, 0));
    bad.emit(Op::Div(x, x, zero));
    bad.emit(Op::Return(x));
    let bad = bad.finish().unwrap();

    let mut b = ChunkBuilder::new("<main>");
    let slots = b.alloc_run(2);
    b.emit(Op::LoadNil(slots));
    let p = b.proto(bad).unwrap();
    b.closure(slots + 1, p, &[]).unwrap();
    b.emit(Op::Scope {
        dst: slots,
        base: slots,
        spawns: 1,
    });
    b.emit(Op::Return(slots));

    let mut vm = single_threaded();
    let err = vm.run(Arc::new(b.finish().unwrap())).unwrap_err();
    assert!(format!("{err:#}").contains("division by zero"));
    assert_eq!(vm.frame_depth(), 0);
}

#[test]
fn test_scope_body_result_is_returned() {
    let mut b = ChunkBuilder::new("<main>");
    let slot = b.alloc();
    let mut body = ChunkBuilder::new("body");
    let r = body.alloc();
    body.emit(Op::LoadInt(r, 7));
    body.emit(Op::Return(r));
    let p = b.proto(body.finish().unwrap()).unwrap();
    b.closure(slot, p, &[]).unwrap();
    let out = b.alloc();
    b.emit(Op::Scope {
        dst: out,
        base: slot,
        spawns: 0,
    });
    b.emit(Op::Return(out));
    assert_eq!(run_ok(b.finish().unwrap()), Val::int(7));
}

/// `select { ch => handler, <extra arm> }` with `ch` read from globals.
fn select_chunk(extra: impl FnOnce(&mut ChunkBuilder, u16)) -> Chunk {
    let mut b = ChunkBuilder::new("<main>");
    let arms = b.alloc_run(4);
    let name = b.k_str("ch").unwrap();
    b.emit(Op::GetGlobal(arms, name));
    b.emit(Op::LoadNil(arms + 1));
    extra(&mut b, arms + 2);
    let out = b.alloc();
    b.emit(Op::Select {
        dst: out,
        base: arms,
        arms: 2,
    });
    b.emit(Op::Return(out));
    b.finish().unwrap()
}

fn default_arm(b: &mut ChunkBuilder, at: u16) {
    b.emit(Op::LoadNil(at));
    let mut handler = ChunkBuilder::new("fallback");
    let r = handler.alloc();
    let k = handler.k_str("default").unwrap();
    handler.emit(Op::LoadK(r, k));
    handler.emit(Op::Return(r));
    let p = b.proto(handler.finish().unwrap()).unwrap();
    b.closure(at + 1, p, &[]).unwrap();
}

#[test]
fn test_select_receives_ready_value() {
    let ch = Channel::new(None);
    ch.send(Val::int(9));
    let mut vm = Vm::default();
    vm.set_global("ch", Val::channel(ch));
    let out = vm.run(Arc::new(select_chunk(default_arm))).unwrap();
    assert_eq!(out, Val::int(9));
}

#[test]
fn test_select_falls_back_to_default() {
    let mut vm = Vm::default();
    vm.set_global("ch", Val::channel(Channel::new(None)));
    let out = vm.run(Arc::new(select_chunk(default_arm))).unwrap();
    assert_eq!(out, Val::str("default"));
}

#[test]
fn test_select_times_out() {
    let chunk = select_chunk(|b, at| {
        b.emit(Op::LoadInt(at, 5));
        b.emit(Op::LoadNil(at + 1));
    });
    let mut vm = Vm::default();
    vm.set_global("ch", Val::channel(Channel::new(None)));
    assert_eq!(vm.run(Arc::new(chunk)).unwrap(), Val::unit());
}

#[test]
fn test_select_on_closed_channel_passes_nil() {
    let ch = Channel::new(None);
    ch.close();
    let mut vm = Vm::default();
    vm.set_global("ch", Val::channel(ch));
    let out = vm.run(Arc::new(select_chunk(default_arm))).unwrap();
    assert_eq!(out, Val::nil());
}

#[test]
fn test_select_rejects_non_channel_arm() {
    let chunk = select_chunk(|b, at| {
        let k = b.k_str("not a channel").unwrap();
        b.emit(Op::LoadK(at, k));
        b.emit(Op::LoadNil(at + 1));
    });
    let mut vm = Vm::default();
    vm.set_global("ch", Val::channel(Channel::new(None)));
    let err = vm.run(Arc::new(chunk)).unwrap_err();
    assert!(err.to_string().contains("select arm: expression is not a Channel"));
}
