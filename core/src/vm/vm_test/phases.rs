use crate::rt::PressureMode;

use super::*;

/// `<main>` with an empty array in a local named `name`.
fn with_array(name: &str) -> (ChunkBuilder, u16) {
    let mut b = ChunkBuilder::new("<main>");
    let xs = b.local(name);
    b.emit(Op::NewArray { dst: xs, base: xs, count: 0 });
    (b, xs)
}

fn emit_push(b: &mut ChunkBuilder, obj: u16, value: i32) {
    let arg = b.alloc();
    let out = b.alloc();
    b.emit(Op::LoadInt(arg, value));
    let push = b.k_str("push").unwrap();
    b.emit(Op::Invoke {
        dst: out,
        obj,
        method: push,
        base: arg,
        argc: 1,
    });
}

fn freeze_local(b: &mut ChunkBuilder, name: &str, slot: u16) {
    let k = b.k_str(name).unwrap();
    b.emit(Op::FreezeVar {
        name: k,
        loc: VarLoc::Local,
        slot,
        consume_seeds: true,
    });
}

#[test]
fn test_frozen_array_rejects_push() {
    let (mut b, xs) = with_array("xs");
    b.emit(Op::Freeze(xs, xs));
    emit_push(&mut b, xs, 1);
    b.emit(Op::Return(xs));
    let err = run(b.finish().unwrap()).unwrap_err();
    assert!(err.to_string().contains("cannot push to a crystal array"));
}

#[test]
fn test_tracked_history_records_each_transition() {
    let (mut b, xs) = with_array("xs");
    emit_push(&mut b, xs, 1);
    emit_push(&mut b, xs, 2);
    freeze_local(&mut b, "xs", xs);
    b.emit(Op::Return(xs));

    let mut vm = Vm::default();
    vm.runtime_mut().track("xs");
    let out = vm.run(Arc::new(b.finish().unwrap())).unwrap();
    assert!(out.is_frozen());

    let history = vm.runtime().history("xs").unwrap();
    let phases: Vec<Phase> = history.iter().map(|h| h.phase).collect();
    assert_eq!(phases, [Phase::Fluid, Phase::Fluid, Phase::Crystal]);
    assert_eq!(history[1].value, Val::array(vec![Val::int(1), Val::int(2)]));
    assert_eq!(history[2].function.as_deref(), Some("<main>"));
}

#[test]
fn test_untracked_names_record_nothing() {
    let (mut b, xs) = with_array("xs");
    emit_push(&mut b, xs, 1);
    b.emit(Op::Return(xs));
    let mut vm = Vm::default();
    vm.run(Arc::new(b.finish().unwrap())).unwrap();
    assert!(vm.runtime().history("xs").is_none());
}

#[test]
fn test_reaction_fires_on_freeze() {
    // react("cfg", |phase, value| { seen = phase })
    let mut cb = ChunkBuilder::new("on_change");
    let phase = cb.param("phase");
    cb.param("value");
    let seen = cb.k_str("seen").unwrap();
    cb.emit(Op::DefineGlobal(phase, seen));
    cb.emit(Op::Return(phase));
    let cb = cb.finish().unwrap();

    let (mut b, cfg) = with_array("cfg");
    let name = b.alloc();
    let callback = b.alloc();
    let k = b.k_str("cfg").unwrap();
    b.emit(Op::LoadK(name, k));
    let p = b.proto(cb).unwrap();
    b.closure(callback, p, &[]).unwrap();
    b.emit(Op::React { name, callback });
    freeze_local(&mut b, "cfg", cfg);
    let out = b.alloc();
    b.emit(Op::IsCrystal(out, cfg));
    b.emit(Op::Return(out));

    let mut vm = Vm::default();
    assert_eq!(vm.run(Arc::new(b.finish().unwrap())).unwrap(), Val::bool(true));
    assert_eq!(vm.global("seen"), Some(&Val::str("crystal")));
}

/// `a` and `b` arrays with `bond(a, "b", strategy)`; returns registers (a, b, strategy).
fn bonded(strategy: Option<&str>) -> (ChunkBuilder, u16, u16) {
    let mut b = ChunkBuilder::new("<main>");
    let a = b.local("a");
    let dep = b.local("b");
    b.emit(Op::NewArray { dst: a, base: a, count: 0 });
    b.emit(Op::NewArray { dst: dep, base: dep, count: 0 });
    let dep_name = b.alloc();
    let strat = b.alloc();
    let k = b.k_str("b").unwrap();
    b.emit(Op::LoadK(dep_name, k));
    match strategy {
        Some(s) => {
            let k = b.k_str(s).unwrap();
            b.emit(Op::LoadK(strat, k));
        }
        None => {
            b.emit(Op::LoadNil(strat));
        }
    }
    let target = b.k_str("a").unwrap();
    b.emit(Op::Bond {
        target,
        dep: dep_name,
        strategy: strat,
    });
    (b, a, dep)
}

#[test]
fn test_mirror_bond_cascades_freeze() {
    let (mut b, a, dep) = bonded(None);
    freeze_local(&mut b, "a", a);
    let out = b.alloc();
    b.emit(Op::IsCrystal(out, dep));
    b.emit(Op::Return(out));
    assert_eq!(run_ok(b.finish().unwrap()), Val::bool(true));
}

/// `fn(phase, value) { seen = phase }`
fn record_phase_fn() -> Chunk {
    let mut cb = ChunkBuilder::new("on_change");
    let phase = cb.param("phase");
    cb.param("value");
    let seen = cb.k_str("seen").unwrap();
    cb.emit(Op::DefineGlobal(phase, seen));
    cb.emit(Op::Return(phase));
    cb.finish().unwrap()
}

#[test]
fn test_inverse_bond_thaws_crystal_dependency() {
    let (mut b, a, dep) = bonded(Some("inverse"));
    freeze_local(&mut b, "b", dep);
    let name = b.alloc();
    let callback = b.alloc();
    let k = b.k_str("b").unwrap();
    b.emit(Op::LoadK(name, k));
    let p = b.proto(record_phase_fn()).unwrap();
    b.closure(callback, p, &[]).unwrap();
    b.emit(Op::React { name, callback });
    freeze_local(&mut b, "a", a);
    let out = b.alloc();
    b.emit(Op::IsFluid(out, dep));
    b.emit(Op::Return(out));

    let mut vm = Vm::default();
    vm.runtime_mut().track("b");
    assert_eq!(vm.run(Arc::new(b.finish().unwrap())).unwrap(), Val::bool(true));
    assert_eq!(vm.global("seen"), Some(&Val::str("fluid")));

    let history = vm.runtime().history("b").unwrap();
    let phases: Vec<Phase> = history.iter().rev().take(2).map(|h| h.phase).collect();
    assert_eq!(phases, [Phase::Fluid, Phase::Crystal]);
    assert!(!history[history.len() - 1].value.is_frozen());
}

#[test]
fn test_gate_bond_blocks_freeze() {
    let (mut b, a, _) = bonded(Some("gate"));
    freeze_local(&mut b, "a", a);
    b.emit(Op::Return(a));
    let err = run(b.finish().unwrap()).unwrap_err();
    assert!(err.to_string().contains("gate bond: 'b' must be crystal before 'a' can freeze"));
}

#[test]
fn test_unknown_bond_strategy() {
    let (mut b, a, _) = bonded(Some("sideways"));
    b.emit(Op::Return(a));
    let err = run(b.finish().unwrap()).unwrap_err();
    assert!(err.to_string().contains("bond: unknown strategy 'sideways'"));
}

#[test]
fn test_seed_contract_gates_freeze() {
    // seed("xs", |v| v.len() > 0)
    let mut contract = ChunkBuilder::new("non_empty");
    let v = contract.param("v");
    let n = contract.alloc();
    let zero = contract.alloc();
    contract.emit(Op::Len(n, v));
    contract.emit(Op::LoadInt(zero, 0));
    contract.emit(Op::Gt(n, n, zero));
    contract.emit(Op::Return(n));
    let contract = contract.finish().unwrap();

    let build = |push_first: bool| {
        let (mut b, xs) = with_array("xs");
        let name = b.alloc();
        let pred = b.alloc();
        let k = b.k_str("xs").unwrap();
        b.emit(Op::LoadK(name, k));
        let p = b.proto(contract.clone()).unwrap();
        b.closure(pred, p, &[]).unwrap();
        b.emit(Op::Seed { name, contract: pred });
        if push_first {
            emit_push(&mut b, xs, 1);
        }
        freeze_local(&mut b, "xs", xs);
        b.emit(Op::Return(xs));
        b.finish().unwrap()
    };

    let err = run(build(false)).unwrap_err();
    assert!(err.to_string().contains("seed contract returned false"));

    let mut vm = Vm::default();
    let out = vm.run(Arc::new(build(true))).unwrap();
    assert!(out.is_frozen());
    assert_eq!(vm.runtime().seed_count("xs"), 0);
}

#[test]
fn test_pressure_blocks_growth_only() {
    let (mut b, xs) = with_array("xs");
    let out = b.alloc();
    let pop = b.k_str("pop").unwrap();
    b.emit(Op::Invoke {
        dst: out,
        obj: xs,
        method: pop,
        base: out,
        argc: 0,
    });
    emit_push(&mut b, xs, 1);
    b.emit(Op::Return(xs));

    let mut vm = Vm::default();
    vm.runtime_mut().set_pressure("xs", PressureMode::NoGrow);
    let err = vm.run(Arc::new(b.finish().unwrap())).unwrap_err();
    assert!(err.to_string().contains("pressurized (no_grow): cannot push 'xs'"));
}

#[test]
fn test_sublimated_value_is_terminal() {
    let (mut b, xs) = with_array("xs");
    let k = b.k_str("xs").unwrap();
    b.emit(Op::SublimateVar {
        name: k,
        loc: VarLoc::Local,
        slot: xs,
    });
    emit_push(&mut b, xs, 1);
    b.emit(Op::Return(xs));
    let err = run(b.finish().unwrap()).unwrap_err();
    assert!(err.to_string().contains("cannot push to a sublimated array"));
}

#[test]
fn test_thaw_of_global_yields_fluid_copy() {
    let mut b = ChunkBuilder::new("<main>");
    let r = b.alloc();
    let name = b.k_str("config").unwrap();
    b.emit(Op::ThawVar {
        name,
        loc: VarLoc::Global,
        slot: 0,
    });
    b.emit(Op::GetGlobal(r, name));
    emit_push(&mut b, r, 3);
    b.emit(Op::Return(r));

    let mut vm = Vm::default();
    let mut frozen = Val::array(vec![Val::int(1)]);
    frozen.freeze();
    vm.set_global("config", frozen.clone());
    let out = vm.run(Arc::new(b.finish().unwrap())).unwrap();
    assert_eq!(out.phase, Phase::Fluid);
    assert_eq!(out, Val::array(vec![Val::int(1), Val::int(3)]));
    assert!(frozen.is_frozen());
}
