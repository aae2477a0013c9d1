use super::*;

fn is_even_fn() -> Chunk {
    let mut f = ChunkBuilder::new("is_even");
    let x = f.param("x");
    let t = f.alloc();
    let z = f.alloc();
    f.emit(Op::LoadInt(t, 2));
    f.emit(Op::Mod(t, x, t));
    f.emit(Op::LoadInt(z, 0));
    f.emit(Op::Eq(t, t, z));
    f.emit(Op::Return(t));
    f.finish().unwrap()
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

#[test]
fn test_mixed_arithmetic_promotes() {
    let mut b = ChunkBuilder::new("<main>");
    let a = b.alloc();
    let c = b.alloc();
    let half = b.k(Val::float(0.5)).unwrap();
    b.emit(Op::LoadInt(a, 3));
    b.emit(Op::LoadK(c, half));
    b.emit(Op::Mul(a, a, c));
    b.emit(Op::Return(a));
    assert_eq!(run_ok(b.finish().unwrap()), Val::float(1.5));
}

#[test]
fn test_int_fast_path_falls_back_for_floats() {
    let mut b = ChunkBuilder::new("<main>");
    let a = b.alloc();
    let c = b.alloc();
    let k = b.k(Val::float(1.25)).unwrap();
    b.emit(Op::LoadInt(a, 2));
    b.emit(Op::LoadK(c, k));
    b.emit(Op::AddInt(a, a, c));
    b.emit(Op::Return(a));
    assert_eq!(run_ok(b.finish().unwrap()), Val::float(3.25));
}

#[test]
fn test_concat_uses_display_forms() {
    let mut b = ChunkBuilder::new("<main>");
    let a = b.alloc();
    let c = b.alloc();
    let k = b.k_str("n=").unwrap();
    b.emit(Op::LoadK(a, k));
    b.emit(Op::LoadInt(c, 4));
    b.emit(Op::Concat(a, a, c));
    b.emit(Op::Return(a));
    let out = run_ok(b.finish().unwrap());
    assert_eq!(out, Val::str("n=4"));
}

#[test]
fn test_map_literal_and_index_assignment() {
    let mut b = ChunkBuilder::new("<main>");
    let pairs = b.alloc_run(4);
    let (ka, kb) = (b.k_str("a").unwrap(), b.k_str("b").unwrap());
    b.emit(Op::LoadK(pairs, ka));
    b.emit(Op::LoadInt(pairs + 1, 1));
    b.emit(Op::LoadK(pairs + 2, kb));
    b.emit(Op::LoadInt(pairs + 3, 2));
    let m = b.local("m");
    b.emit(Op::NewMap { dst: m, base: pairs, count: 2 });
    let key = b.alloc();
    let value = b.alloc();
    b.emit(Op::LoadK(key, ka));
    b.emit(Op::LoadInt(value, 10));
    b.emit(Op::SetIndex(m, key, value));
    let sum = b.alloc();
    b.emit(Op::GetIndex(sum, m, key));
    b.emit(Op::GetField(value, m, kb));
    b.emit(Op::Add(sum, sum, value));
    b.emit(Op::Return(sum));
    assert_eq!(run_ok(b.finish().unwrap()), Val::int(12));
}

#[test]
fn test_array_index_out_of_bounds() {
    let mut b = ChunkBuilder::new("<main>");
    let items = b.alloc_run(2);
    b.emit(Op::LoadInt(items, 1));
    b.emit(Op::LoadInt(items + 1, 2));
    let xs = b.alloc();
    b.emit(Op::NewArray { dst: xs, base: items, count: 2 });
    let i = b.alloc();
    b.emit(Op::LoadInt(i, 5));
    b.emit(Op::GetIndex(i, xs, i));
    b.emit(Op::Return(i));
    let err = run(b.finish().unwrap()).unwrap_err();
    assert!(err.to_string().contains("array index 5 out of bounds (len 2)"));
}

#[test]
fn test_range_slices_array() {
    let mut b = ChunkBuilder::new("<main>");
    let items = b.alloc_run(4);
    for i in 0..4 {
        b.emit(Op::LoadInt(items + i, i as i32 * 10));
    }
    let xs = b.alloc();
    b.emit(Op::NewArray { dst: xs, base: items, count: 4 });
    let (lo, hi, r) = (b.alloc(), b.alloc(), b.alloc());
    b.emit(Op::LoadInt(lo, 1));
    b.emit(Op::LoadInt(hi, 3));
    b.emit(Op::BuildRange(r, lo, hi));
    b.emit(Op::GetIndex(r, xs, r));
    b.emit(Op::Return(r));
    assert_eq!(
        run_ok(b.finish().unwrap()),
        Val::array(vec![Val::int(10), Val::int(20)])
    );
}

#[test]
fn test_struct_literal_and_field_update() {
    let mut b = ChunkBuilder::new("<main>");
    b.declare_struct("Point", &["x", "y"]);
    let fields = b.alloc_run(2);
    b.emit(Op::LoadInt(fields, 1));
    b.emit(Op::LoadInt(fields + 1, 2));
    let p = b.alloc();
    let name = b.k_str("Point").unwrap();
    b.emit(Op::NewStruct {
        dst: p,
        name,
        base: fields,
        count: 2,
    });
    let v = b.alloc();
    let fy = b.k_str("y").unwrap();
    b.emit(Op::LoadInt(v, 9));
    b.emit(Op::SetField(p, fy, v));
    b.emit(Op::Return(p));
    let out = run_ok(b.finish().unwrap());
    assert_eq!(
        out,
        Val::structure("Point", vec![("x".into(), Val::int(1)), ("y".into(), Val::int(9))])
    );
    assert_eq!(out.to_string(), "Point { x: 1, y: 9 }");
}

#[test]
fn test_unknown_struct_and_missing_field() {
    let mut b = ChunkBuilder::new("<main>");
    let p = b.alloc();
    let name = b.k_str("Ghost").unwrap();
    b.emit(Op::NewStruct {
        dst: p,
        name,
        base: p,
        count: 0,
    });
    b.emit(Op::Return(p));
    let err = run(b.finish().unwrap()).unwrap_err();
    assert!(err.to_string().contains("unknown struct 'Ghost'"));
}

#[test]
fn test_frozen_struct_field_assignment_fails() {
    let mut b = ChunkBuilder::new("<main>");
    b.declare_struct("Cfg", &["level"]);
    let f = b.alloc();
    b.emit(Op::LoadInt(f, 1));
    let cfg = b.alloc();
    let name = b.k_str("Cfg").unwrap();
    b.emit(Op::NewStruct {
        dst: cfg,
        name,
        base: f,
        count: 1,
    });
    b.emit(Op::Freeze(cfg, cfg));
    let field = b.k_str("level").unwrap();
    b.emit(Op::SetField(cfg, field, f));
    b.emit(Op::Return(cfg));
    let err = run(b.finish().unwrap()).unwrap_err();
    assert!(err.to_string().contains("cannot modify a frozen value"));
}

#[test]
fn test_enum_payload_and_is() {
    let mut b = ChunkBuilder::new("<main>");
    let payload = b.alloc();
    b.emit(Op::LoadInt(payload, 3));
    let e = b.alloc();
    let (name, variant) = (b.k_str("Shape").unwrap(), b.k_str("Circle").unwrap());
    b.emit(Op::NewEnum {
        dst: e,
        name,
        variant,
        base: payload,
        count: 1,
    });
    let arg = b.alloc();
    b.emit(Op::LoadK(arg, variant));
    let out = b.alloc();
    invoke(&mut b, out, e, "is", arg, 1);
    b.emit(Op::Return(out));
    assert_eq!(run_ok(b.finish().unwrap()), Val::bool(true));
}

#[test]
fn test_lazy_iterator_pipeline() {
    // (0..10).iter().filter(is_even).take(3).collect()
    let mut b = ChunkBuilder::new("<main>");
    let (lo, hi, r) = (b.alloc(), b.alloc(), b.alloc());
    b.emit(Op::LoadInt(lo, 0));
    b.emit(Op::LoadInt(hi, 10));
    b.emit(Op::BuildRange(r, lo, hi));
    let it = b.alloc();
    invoke(&mut b, it, r, "iter", it, 0);
    let pred = b.alloc();
    let p = b.proto(is_even_fn()).unwrap();
    b.closure(pred, p, &[]).unwrap();
    invoke(&mut b, it, it, "filter", pred, 1);
    let n = b.alloc();
    b.emit(Op::LoadInt(n, 3));
    invoke(&mut b, it, it, "take", n, 1);
    invoke(&mut b, it, it, "collect", it, 0);
    b.emit(Op::Return(it));
    assert_eq!(
        run_ok(b.finish().unwrap()),
        Val::array(vec![Val::int(0), Val::int(2), Val::int(4)])
    );
}

#[test]
fn test_for_in_loop_over_array() {
    // total = 0; for x in [1, 2, 3] { total += x }
    let mut b = ChunkBuilder::new("<main>");
    let items = b.alloc_run(3);
    for i in 0..3 {
        b.emit(Op::LoadInt(items + i, i as i32 + 1));
    }
    let xs = b.alloc();
    b.emit(Op::NewArray { dst: xs, base: items, count: 3 });
    let total = b.local("total");
    b.emit(Op::LoadInt(total, 0));
    let it = b.alloc();
    b.emit(Op::IterInit(it, xs));
    let x = b.local("x");
    let top = b.here();
    let done = b.emit_jump(Op::IterNext { dst: x, iter: it, offset: 0 });
    b.emit(Op::Add(total, total, x));
    b.jump_back(top).unwrap();
    b.patch(done).unwrap();
    b.emit(Op::Return(total));
    assert_eq!(run_ok(b.finish().unwrap()), Val::int(6));
}

#[test]
fn test_iter_next_requires_iterator() {
    let mut b = ChunkBuilder::new("<main>");
    let items = b.alloc_run(1);
    b.emit(Op::LoadInt(items, 1));
    let xs = b.alloc();
    b.emit(Op::NewArray { dst: xs, base: items, count: 1 });
    let x = b.alloc();
    let done = b.emit_jump(Op::IterNext { dst: x, iter: xs, offset: 0 });
    b.patch(done).unwrap();
    b.emit(Op::Return(x));
    let err = run(b.finish().unwrap()).unwrap_err();
    assert!(err.to_string().contains("IterNext on non-iterator (Array)"));
}

/// `lo..hi` followed by `method()` on it.
fn range_query(lo: &Val, hi: &Val, method: Option<&str>) -> anyhow::Result<Val> {
    let mut b = ChunkBuilder::new("<main>");
    let (l, h, r) = (b.alloc(), b.alloc(), b.alloc());
    let (kl, kh) = (b.k(lo.clone()).unwrap(), b.k(hi.clone()).unwrap());
    b.emit(Op::LoadK(l, kl));
    b.emit(Op::LoadK(h, kh));
    b.emit(Op::BuildRange(r, l, h));
    let out = b.alloc();
    match method {
        Some(method) => invoke(&mut b, out, r, method, out, 0),
        None => {
            b.emit(Op::Len(out, r));
        }
    }
    b.emit(Op::Return(out));
    run(b.finish().unwrap())
}

#[test]
fn test_range_length_saturates_on_wide_bounds() {
    let (lo, hi) = (Val::int(-1), Val::int(i64::MAX));
    assert_eq!(range_query(&lo, &hi, None).unwrap(), Val::int(i64::MAX));
    assert_eq!(range_query(&lo, &hi, Some("len")).unwrap(), Val::int(i64::MAX));
    assert_eq!(range_query(&Val::int(5), &Val::int(2), None).unwrap(), Val::int(0));

    let err = range_query(&lo, &hi, Some("to_array")).unwrap_err();
    assert!(err.to_string().contains("range too large to materialize"));
    assert_eq!(
        range_query(&Val::int(1), &Val::int(4), Some("to_array")).unwrap(),
        Val::array(vec![Val::int(1), Val::int(2), Val::int(3)])
    );
}

#[test]
fn test_eager_range_map() {
    // (1..4).map(inc)
    let mut b = ChunkBuilder::new("<main>");
    let (lo, hi, r) = (b.alloc(), b.alloc(), b.alloc());
    b.emit(Op::LoadInt(lo, 1));
    b.emit(Op::LoadInt(hi, 4));
    b.emit(Op::BuildRange(r, lo, hi));
    let f = b.alloc();
    let p = b.proto(add_imm_fn("inc", 1)).unwrap();
    b.closure(f, p, &[]).unwrap();
    invoke(&mut b, r, r, "map", f, 1);
    b.emit(Op::Return(r));
    assert_eq!(
        run_ok(b.finish().unwrap()),
        Val::array(vec![Val::int(2), Val::int(3), Val::int(4)])
    );
}

#[test]
fn test_eager_array_map() {
    let mut b = ChunkBuilder::new("<main>");
    let items = b.alloc_run(2);
    b.emit(Op::LoadInt(items, 1));
    b.emit(Op::LoadInt(items + 1, 2));
    let xs = b.alloc();
    b.emit(Op::NewArray { dst: xs, base: items, count: 2 });
    let f = b.alloc();
    let p = b.proto(add_imm_fn("inc", 1)).unwrap();
    b.closure(f, p, &[]).unwrap();
    invoke(&mut b, xs, xs, "map", f, 1);
    b.emit(Op::Return(xs));
    assert_eq!(
        run_ok(b.finish().unwrap()),
        Val::array(vec![Val::int(2), Val::int(3)])
    );
}

#[test]
fn test_method_resolves_to_qualified_global() {
    // fn Point::sum(self) { self.x + self.y }
    let mut sum = ChunkBuilder::new("Point::sum");
    let this = sum.param("self");
    let (x, y) = (sum.alloc(), sum.alloc());
    let (fx, fy) = (sum.k_str("x").unwrap(), sum.k_str("y").unwrap());
    sum.emit(Op::GetField(x, this, fx));
    sum.emit(Op::GetField(y, this, fy));
    sum.emit(Op::Add(x, x, y));
    sum.emit(Op::Return(x));
    let sum = sum.finish().unwrap();

    let mut b = ChunkBuilder::new("<main>");
    b.declare_struct("Point", &["x", "y"]);
    let method = b.alloc();
    let p = b.proto(sum).unwrap();
    b.closure(method, p, &[]).unwrap();
    let qualified = b.k_str("Point::sum").unwrap();
    b.emit(Op::DefineGlobal(method, qualified));
    let fields = b.alloc_run(2);
    b.emit(Op::LoadInt(fields, 3));
    b.emit(Op::LoadInt(fields + 1, 4));
    let pt = b.alloc();
    let name = b.k_str("Point").unwrap();
    b.emit(Op::NewStruct {
        dst: pt,
        name,
        base: fields,
        count: 2,
    });
    let out = b.alloc();
    invoke(&mut b, out, pt, "sum", out, 0);
    b.emit(Op::Return(out));
    assert_eq!(run_ok(b.finish().unwrap()), Val::int(7));
}

#[test]
fn test_missing_method() {
    let mut b = ChunkBuilder::new("<main>");
    let v = b.alloc();
    b.emit(Op::LoadInt(v, 1));
    invoke(&mut b, v, v, "explode", v, 0);
    b.emit(Op::Return(v));
    let err = run(b.finish().unwrap()).unwrap_err();
    assert!(err.to_string().contains("no method 'explode' on Int"));
}

#[test]
fn test_ref_is_shared_between_aliases() {
    let mut b = ChunkBuilder::new("<main>");
    let init = b.alloc();
    b.emit(Op::LoadInt(init, 1));
    let r = b.alloc();
    b.emit(Op::NewRef(r, init));
    let alias = b.alloc();
    b.emit(Op::Move(alias, r));
    let v = b.alloc();
    b.emit(Op::LoadInt(v, 5));
    let out = b.alloc();
    invoke(&mut b, out, alias, "set", v, 1);
    invoke(&mut b, out, r, "get", out, 0);
    b.emit(Op::Return(out));
    assert_eq!(run_ok(b.finish().unwrap()), Val::int(5));
}

#[test]
fn test_buffer_from_size() {
    let mut b = ChunkBuilder::new("<main>");
    let n = b.alloc();
    b.emit(Op::LoadInt(n, 4));
    let buf = b.alloc();
    b.emit(Op::NewBuffer(buf, n));
    b.emit(Op::Len(n, buf));
    b.emit(Op::Return(n));
    assert_eq!(run_ok(b.finish().unwrap()), Val::int(4));
}

#[test]
fn test_print_joins_with_spaces() {
    let mut b = ChunkBuilder::new("<main>");
    let args = b.alloc_run(3);
    let k = b.k_str("x").unwrap();
    b.emit(Op::LoadK(args, k));
    b.emit(Op::LoadInt(args + 1, 1));
    b.emit(Op::LoadNil(args + 2));
    b.emit(Op::Print { base: args, count: 3 });
    b.emit(Op::Return(args));

    let out = Output::default();
    let mut vm = Vm::default();
    out.attach(&mut vm);
    vm.run(Arc::new(b.finish().unwrap())).unwrap();
    assert_eq!(out.lines(), ["x 1 nil"]);
}
