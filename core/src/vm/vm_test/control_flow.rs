use super::*;

#[test]
fn test_counting_loop() {
    // sum = 0; i = 1; while i <= 10 { sum += i; i += 1 }
    let mut b = ChunkBuilder::new("<main>");
    let sum = b.local("sum");
    let i = b.local("i");
    let limit = b.alloc();
    let cond = b.alloc();
    b.emit(Op::LoadInt(sum, 0));
    b.emit(Op::LoadInt(i, 1));
    b.emit(Op::LoadInt(limit, 10));
    let top = b.here();
    b.emit(Op::LtEqInt(cond, i, limit));
    let exit = b.emit_jump(Op::JmpFalse(cond, 0));
    b.emit(Op::AddInt(sum, sum, i));
    b.emit(Op::IncReg(i));
    b.jump_back(top).unwrap();
    b.patch(exit).unwrap();
    b.emit(Op::Return(sum));
    assert_eq!(run_ok(b.finish().unwrap()), Val::int(55));
}

#[test]
fn test_throw_is_caught_by_handler() {
    let mut b = ChunkBuilder::new("<main>");
    let e = b.local("e");
    let msg = b.alloc();
    let handler = b.emit_jump(Op::PushHandler { reg: e, offset: 0 });
    let k = b.k_str("boom").unwrap();
    b.emit(Op::LoadK(msg, k));
    b.emit(Op::Throw(msg));
    b.emit(Op::PopHandler);
    b.emit(Op::Return(msg));
    b.patch(handler).unwrap();
    b.emit(Op::Return(e));
    assert_eq!(run_ok(b.finish().unwrap()), Val::str("boom"));
}

#[test]
fn test_nested_throw_restores_frame_depth() {
    let mut inner = ChunkBuilder::new("inner");
    let v = inner.alloc();
    let k = inner.k(Val::int(7)).unwrap();
    inner.emit(Op::LoadK(v, k));
    inner.emit(Op::Throw(v));
    inner.emit(Op::Return(v));
    let inner = inner.finish().unwrap();

    let mut middle = ChunkBuilder::new("middle");
    let f = middle.alloc();
    let name = middle.k_str("inner").unwrap();
    middle.emit(Op::GetGlobal(f, name));
    middle.emit(Op::Call { func: f, argc: 0 });
    middle.emit(Op::Return(f));
    let middle = middle.finish().unwrap();

    let mut b = ChunkBuilder::new("<main>");
    let e = b.local("e");
    let f = b.alloc();
    let g = b.alloc();
    let pi = b.proto(inner).unwrap();
    let pm = b.proto(middle).unwrap();
    b.closure(f, pi, &[]).unwrap();
    let name = b.k_str("inner").unwrap();
    b.emit(Op::DefineGlobal(f, name));
    b.closure(g, pm, &[]).unwrap();
    let handler = b.emit_jump(Op::PushHandler { reg: e, offset: 0 });
    b.emit(Op::Call { func: g, argc: 0 });
    b.emit(Op::PopHandler);
    b.patch(handler).unwrap();
    b.emit(Op::Return(e));

    let mut vm = Vm::default();
    let out = vm.run(Arc::new(b.finish().unwrap())).unwrap();
    assert_eq!(out, Val::int(7));
    assert_eq!(vm.frame_depth(), 0);
    assert_eq!(vm.handler_depth(), 0);
}

#[test]
fn test_runtime_error_is_caught_as_message() {
    let mut b = ChunkBuilder::new("<main>");
    let e = b.local("e");
    let x = b.alloc();
    let zero = b.alloc();
    let handler = b.emit_jump(Op::PushHandler { reg: e, offset: 0 });
    b.emit(Op::LoadInt(x, 1));
    b.emit(Op::LoadInt(zero, 0));
    b.emit(Op::Div(x, x, zero));
    b.emit(Op::PopHandler);
    b.patch(handler).unwrap();
    b.emit(Op::Return(e));
    assert_eq!(run_ok(b.finish().unwrap()), Val::str("division by zero"));
}

#[test]
fn test_uncaught_error_carries_stack_trace() {
    let mut f = ChunkBuilder::new("divide");
    f.set_line(7);
    let x = f.param("x");
    let zero = f.alloc();
    f.emit(Op::LoadInt(zero, 0));
    f.emit(Op::Div(x, x, zero));
    f.emit(Op::Return(x));
    let f = f.finish().unwrap();

    let mut b = ChunkBuilder::new("<main>");
    b.set_line(2);
    let func = b.alloc();
    let arg = b.alloc();
    let p = b.proto(f).unwrap();
    b.closure(func, p, &[]).unwrap();
    b.emit(Op::LoadInt(arg, 1));
    b.emit(Op::Call { func, argc: 1 });
    b.emit(Op::Return(func));

    let err = run(b.finish().unwrap()).unwrap_err();
    let rt = runtime_error(&err);
    assert_eq!(rt.message, "division by zero");
    assert_eq!(rt.line, 7);
    let functions: Vec<&str> = rt.trace.iter().map(|(name, _)| name.as_ref()).collect();
    assert_eq!(functions, ["divide", "<main>"]);
    assert!(rt.report().contains("at divide (line 7)"));
}

#[test]
fn test_throw_of_non_string_value() {
    let mut b = ChunkBuilder::new("<main>");
    let v = b.alloc();
    b.emit(Op::LoadInt(v, 3));
    b.emit(Op::Throw(v));
    let err = run(b.finish().unwrap()).unwrap_err();
    let rt = runtime_error(&err);
    assert_eq!(rt.message, "unhandled exception: 3");
    assert_eq!(rt.thrown, Some(Val::int(3)));
}

#[test]
fn test_uncaught_throw_reports_its_line() {
    let mut b = ChunkBuilder::new("<main>");
    let v = b.alloc();
    let k = b.k_str("boom").unwrap();
    b.set_line(3);
    b.emit(Op::LoadK(v, k));
    b.emit(Op::Throw(v));
    let err = run(b.finish().unwrap()).unwrap_err();
    let rt = runtime_error(&err);
    assert_eq!(rt.line, 3);
    assert_eq!(rt.to_string(), "[line 3] boom");
}

#[test]
fn test_thrown_value_survives_method_call() {
    // try { {boom: || throw 7}.boom() } catch e { e }
    let mut thrower = ChunkBuilder::new("boom");
    let v = thrower.alloc();
    thrower.emit(Op::LoadInt(v, 7));
    thrower.emit(Op::Throw(v));
    thrower.emit(Op::Return(v));
    let thrower = thrower.finish().unwrap();

    let mut b = ChunkBuilder::new("<main>");
    let e = b.local("e");
    let pair = b.alloc_run(2);
    let name = b.k_str("boom").unwrap();
    b.emit(Op::LoadK(pair, name));
    let p = b.proto(thrower).unwrap();
    b.closure(pair + 1, p, &[]).unwrap();
    let m = b.alloc();
    b.emit(Op::NewMap { dst: m, base: pair, count: 1 });
    let out = b.alloc();
    let handler = b.emit_jump(Op::PushHandler { reg: e, offset: 0 });
    b.emit(Op::Invoke {
        dst: out,
        obj: m,
        method: name,
        base: out,
        argc: 0,
    });
    b.emit(Op::PopHandler);
    b.patch(handler).unwrap();
    b.emit(Op::Return(e));

    let mut vm = Vm::default();
    let caught = vm.run(Arc::new(b.finish().unwrap())).unwrap();
    assert_eq!(caught, Val::int(7));
    assert_eq!(caught.type_name(), "Int");
    assert_eq!(vm.frame_depth(), 0);
    assert_eq!(vm.handler_depth(), 0);
}

#[test]
fn test_defers_run_in_reverse_order() {
    let mut b = ChunkBuilder::new("<main>");
    let s = b.alloc();
    for tag in ["D1", "D2", "D3"] {
        let skip = b.emit_jump(Op::DeferPush { depth: 1, offset: 0 });
        emit_print(&mut b, s, tag);
        b.emit(Op::DeferEnd);
        b.patch(skip).unwrap();
    }
    emit_print(&mut b, s, "body");
    b.emit(Op::LoadUnit(s));
    b.emit(Op::Return(s));

    let out = Output::default();
    let mut vm = Vm::default();
    out.attach(&mut vm);
    vm.run(Arc::new(b.finish().unwrap())).unwrap();
    assert_eq!(out.lines(), ["body", "D3", "D2", "D1"]);
}

#[test]
fn test_defer_runs_while_unwinding() {
    let mut f = ChunkBuilder::new("f");
    let s = f.alloc();
    let skip = f.emit_jump(Op::DeferPush { depth: 1, offset: 0 });
    emit_print(&mut f, s, "cleanup");
    f.emit(Op::DeferEnd);
    f.patch(skip).unwrap();
    let k = f.k_str("bad").unwrap();
    f.emit(Op::LoadK(s, k));
    f.emit(Op::Throw(s));
    f.emit(Op::Return(s));
    let f = f.finish().unwrap();

    let mut b = ChunkBuilder::new("<main>");
    let e = b.local("e");
    let func = b.alloc();
    let p = b.proto(f).unwrap();
    b.closure(func, p, &[]).unwrap();
    let handler = b.emit_jump(Op::PushHandler { reg: e, offset: 0 });
    b.emit(Op::Call { func, argc: 0 });
    b.emit(Op::PopHandler);
    b.patch(handler).unwrap();
    b.emit(Op::Return(e));

    let out = Output::default();
    let mut vm = Vm::default();
    out.attach(&mut vm);
    let caught = vm.run(Arc::new(b.finish().unwrap())).unwrap();
    assert_eq!(caught, Val::str("bad"));
    assert_eq!(out.lines(), ["cleanup"]);
}

#[test]
fn test_scoped_defer_writes_back_to_owner() {
    let mut b = ChunkBuilder::new("<main>");
    let x = b.local("x");
    b.emit(Op::LoadInt(x, 1));
    let skip = b.emit_jump(Op::DeferPush { depth: 2, offset: 0 });
    b.emit(Op::LoadInt(x, 2));
    b.emit(Op::DeferEnd);
    b.patch(skip).unwrap();
    b.emit(Op::DeferRun(2));
    b.emit(Op::Return(x));
    assert_eq!(run_ok(b.finish().unwrap()), Val::int(2));
}

#[test]
fn test_try_unwrap_propagates_errors() {
    let mut f = ChunkBuilder::new("f");
    let r = f.param("r");
    f.emit(Op::TryUnwrap(r));
    f.emit(Op::AddImm(r, r, 1));
    f.emit(Op::Return(r));
    let f = f.finish().unwrap();

    let mut vm = Vm::default();
    let func = vm.run(Arc::new(returning_closure(f))).unwrap();
    let ok = vm.call(&func, &[Val::result(true, Val::int(4))]).unwrap();
    assert_eq!(ok, Val::int(5));

    let failure = Val::result(false, Val::str("nope"));
    assert_eq!(vm.call(&func, std::slice::from_ref(&failure)).unwrap(), failure);

    let err = vm.call(&func, &[Val::int(1)]).unwrap_err();
    assert!(err.to_string().contains("'?' operator requires a Result value, got Int"));
    assert_eq!(vm.frame_depth(), 0);
}

#[test]
fn test_halt_stops_the_run() {
    let mut b = ChunkBuilder::new("<main>");
    let s = b.alloc();
    emit_print(&mut b, s, "before");
    b.emit(Op::Halt);
    emit_print(&mut b, s, "after");
    b.emit(Op::Return(s));

    let out = Output::default();
    let mut vm = Vm::default();
    out.attach(&mut vm);
    assert_eq!(vm.run(Arc::new(b.finish().unwrap())).unwrap(), Val::nil());
    assert!(vm.is_halted());
    assert_eq!(out.lines(), ["before"]);
}
