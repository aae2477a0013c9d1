use super::*;

#[test]
fn test_call_compiled_function() {
    let mut b = ChunkBuilder::new("<main>");
    let f = b.local("f");
    let p = b.proto(add_imm_fn("f", 1)).unwrap();
    b.closure(f, p, &[]).unwrap();
    let arg = b.alloc();
    b.emit(Op::LoadInt(arg, 41));
    b.emit(Op::Call { func: f, argc: 1 });
    b.emit(Op::Return(f));
    assert_eq!(run_ok(b.finish().unwrap()), Val::int(42));
}

#[test]
fn test_defaults_fill_missing_arguments() {
    let mut g = ChunkBuilder::new("g");
    let a = g.param("a");
    let bp = g.param("b");
    g.default_value(Val::int(10));
    g.emit(Op::Add(a, a, bp));
    g.emit(Op::Return(a));
    let g = g.finish().unwrap();

    let mut vm = Vm::default();
    let f = vm.run(Arc::new(returning_closure(g))).unwrap();
    assert_eq!(vm.call(&f, &[Val::int(1)]).unwrap(), Val::int(11));
    assert_eq!(vm.call(&f, &[Val::int(1), Val::int(2)]).unwrap(), Val::int(3));
}

#[test]
fn test_variadic_rest_array() {
    let mut h = ChunkBuilder::new("h");
    h.param("first");
    let rest = h.param("rest");
    h.variadic();
    let n = h.alloc();
    h.emit(Op::Len(n, rest));
    h.emit(Op::Return(n));
    let h = h.finish().unwrap();

    let mut vm = Vm::default();
    let f = vm.run(Arc::new(returning_closure(h))).unwrap();
    let args: Vec<Val> = (0..4).map(Val::int).collect();
    assert_eq!(vm.call(&f, &args).unwrap(), Val::int(3));
    assert_eq!(vm.call(&f, &args[..1]).unwrap(), Val::int(0));
}

#[test]
fn test_phase_constraint_violation() {
    let mut f = ChunkBuilder::new("mutate");
    let xs = f.param_with_phase("xs", PhaseConstraint::Fluid);
    f.emit(Op::Return(xs));
    let f = f.finish().unwrap();

    let mut vm = Vm::default();
    let func = vm.run(Arc::new(returning_closure(f))).unwrap();
    let mut frozen = Val::array(vec![Val::int(1)]);
    frozen.freeze();
    let err = vm.call(&func, &[frozen]).unwrap_err();
    assert!(err.to_string().contains("phase constraint violation in function 'mutate'"));
    assert!(vm.call(&func, &[Val::array(vec![])]).is_ok());
}

#[test]
fn test_overload_picks_best_phase_match() {
    let tagged = |name: &str, phase: PhaseConstraint, tag: &str| {
        let mut c = ChunkBuilder::new(name);
        c.param_with_phase("v", phase);
        let out = c.alloc();
        let k = c.k_str(tag).unwrap();
        c.emit(Op::LoadK(out, k));
        c.emit(Op::Return(out));
        c.finish().unwrap()
    };
    let mut b = ChunkBuilder::new("<main>");
    let fns = b.alloc_run(2);
    let pf = b.proto(tagged("on_fluid", PhaseConstraint::Fluid, "fluid")).unwrap();
    let pc = b.proto(tagged("on_crystal", PhaseConstraint::Crystal, "crystal")).unwrap();
    b.closure(fns, pf, &[]).unwrap();
    b.closure(fns + 1, pc, &[]).unwrap();
    let set = b.alloc();
    b.emit(Op::NewArray { dst: set, base: fns, count: 2 });
    b.emit(Op::Return(set));

    let mut vm = Vm::default();
    let overloads = vm.run(Arc::new(b.finish().unwrap())).unwrap();
    let mut frozen = Val::array(vec![]);
    frozen.freeze();
    assert_eq!(vm.call(&overloads, &[frozen]).unwrap(), Val::str("crystal"));
    assert_eq!(vm.call(&overloads, &[Val::array(vec![])]).unwrap(), Val::str("fluid"));
}

#[test]
fn test_counter_closure_keeps_state() {
    // fn make() { let count = 0; return || { count += 1; count } }
    let mut inc = ChunkBuilder::new("inc");
    let r = inc.alloc();
    inc.emit(Op::GetUpvalue(r, 0));
    inc.emit(Op::AddImm(r, r, 1));
    inc.emit(Op::SetUpvalue(r, 0));
    inc.emit(Op::Return(r));
    let inc = inc.finish().unwrap();

    let mut make = ChunkBuilder::new("make");
    let count = make.local("count");
    make.emit(Op::LoadInt(count, 0));
    let f = make.alloc();
    let p = make.proto(inc).unwrap();
    make.closure(f, p, &[(CaptureKind::Local, count)]).unwrap();
    make.emit(Op::Return(f));
    let make = make.finish().unwrap();

    let mut b = ChunkBuilder::new("<main>");
    let counter = b.local("counter");
    let p = b.proto(make).unwrap();
    b.closure(counter, p, &[]).unwrap();
    b.emit(Op::Call { func: counter, argc: 0 });
    let tmp = b.alloc();
    for _ in 0..3 {
        b.emit(Op::Move(tmp, counter));
        b.emit(Op::Call { func: tmp, argc: 0 });
    }
    b.emit(Op::Return(tmp));
    assert_eq!(run_ok(b.finish().unwrap()), Val::int(3));
}

#[test]
fn test_closures_share_captured_local() {
    let mut set = ChunkBuilder::new("set");
    let r = set.alloc();
    set.emit(Op::LoadInt(r, 5));
    set.emit(Op::SetUpvalue(r, 0));
    set.emit(Op::Return(r));
    let set = set.finish().unwrap();

    let mut get = ChunkBuilder::new("get");
    let r = get.alloc();
    get.emit(Op::GetUpvalue(r, 0));
    get.emit(Op::Return(r));
    let get = get.finish().unwrap();

    let mut b = ChunkBuilder::new("<main>");
    let x = b.local("x");
    b.emit(Op::LoadInt(x, 1));
    let setter = b.alloc();
    let getter = b.alloc();
    let ps = b.proto(set).unwrap();
    let pg = b.proto(get).unwrap();
    b.closure(setter, ps, &[(CaptureKind::Local, x)]).unwrap();
    b.closure(getter, pg, &[(CaptureKind::Local, x)]).unwrap();
    b.emit(Op::Call { func: setter, argc: 0 });
    b.emit(Op::Call { func: getter, argc: 0 });
    // The register itself sees the write while the upvalue is open.
    let both = b.alloc_run(2);
    b.emit(Op::Move(both, getter));
    b.emit(Op::Move(both + 1, x));
    let out = b.alloc();
    b.emit(Op::NewTuple { dst: out, base: both, count: 2 });
    b.emit(Op::Return(out));
    assert_eq!(
        run_ok(b.finish().unwrap()),
        Val::tuple(vec![Val::int(5), Val::int(5)])
    );
}

#[test]
fn test_copy_capture_snapshots_value() {
    let mut get = ChunkBuilder::new("get");
    let r = get.alloc();
    get.emit(Op::GetUpvalue(r, 0));
    get.emit(Op::Return(r));
    let get = get.finish().unwrap();

    let mut b = ChunkBuilder::new("<main>");
    let x = b.local("x");
    b.emit(Op::LoadInt(x, 1));
    let f = b.alloc();
    let p = b.proto(get).unwrap();
    b.closure(f, p, &[(CaptureKind::Copy, x)]).unwrap();
    b.emit(Op::LoadInt(x, 99));
    b.emit(Op::Call { func: f, argc: 0 });
    b.emit(Op::Return(f));
    assert_eq!(run_ok(b.finish().unwrap()), Val::int(1));
}

#[test]
fn test_calling_a_non_function() {
    let mut b = ChunkBuilder::new("<main>");
    let r = b.alloc();
    b.emit(Op::LoadInt(r, 3));
    b.emit(Op::Call { func: r, argc: 0 });
    b.emit(Op::Return(r));
    let err = run(b.finish().unwrap()).unwrap_err();
    assert!(err.to_string().contains("attempt to call a non-function (Int)"));
}

#[test]
fn test_native_function_sees_arguments() {
    fn sum(args: &[Val], _: &mut dyn crate::rt::Host) -> anyhow::Result<Val> {
        Ok(Val::int(args.iter().filter_map(Val::as_int).sum()))
    }
    let mut b = ChunkBuilder::new("<main>");
    let f = b.alloc();
    let name = b.k_str("sum").unwrap();
    b.emit(Op::GetGlobal(f, name));
    let args = b.alloc_run(3);
    for i in 0..3 {
        b.emit(Op::LoadInt(args + i, i as i32 + 1));
    }
    b.emit(Op::Call { func: f, argc: 3 });
    b.emit(Op::Return(f));

    let mut vm = Vm::default();
    vm.set_global("sum", Val::native("sum", sum));
    assert_eq!(vm.run(Arc::new(b.finish().unwrap())).unwrap(), Val::int(6));
}

#[test]
fn test_runaway_recursion_is_fatal_and_uncatchable() {
    let mut f = ChunkBuilder::new("f");
    let r = f.alloc();
    let name = f.k_str("f").unwrap();
    f.emit(Op::GetGlobal(r, name));
    f.emit(Op::Call { func: r, argc: 0 });
    f.emit(Op::Return(r));
    let f = f.finish().unwrap();

    let mut b = ChunkBuilder::new("<main>");
    let func = b.alloc();
    let err_reg = b.alloc();
    let p = b.proto(f).unwrap();
    b.closure(func, p, &[]).unwrap();
    let name = b.k_str("f").unwrap();
    b.emit(Op::DefineGlobal(func, name));
    let handler = b.emit_jump(Op::PushHandler { reg: err_reg, offset: 0 });
    b.emit(Op::Call { func, argc: 0 });
    b.emit(Op::PopHandler);
    b.emit(Op::Return(func));
    b.patch(handler).unwrap();
    b.emit(Op::Return(err_reg));

    let mut vm = Vm::default();
    let err = vm.run(Arc::new(b.finish().unwrap())).unwrap_err();
    let rt = runtime_error(&err);
    assert!(rt.is_fatal());
    assert_eq!(rt.message, "call stack overflow");
    assert_eq!(vm.frame_depth(), 0);
    assert_eq!(vm.handler_depth(), 0);
}
