use crate::gc::GcConfig;
use crate::vm::RegionAllocator;

use super::*;

fn collecting(stress: bool) -> Vm {
    let config = VmConfig {
        gc: GcConfig {
            enabled: true,
            stress,
            ..GcConfig::default()
        },
        ..VmConfig::default()
    };
    Vm::with_config(Arc::new(ModuleRegistry::new()), &config)
}

/// `let r = Ref(nil); r.set(r)`, optionally publishing `r` as a global,
/// then clearing every register that held it.
fn self_referencing_ref(publish: bool) -> Chunk {
    let mut b = ChunkBuilder::new("<main>");
    let r = b.alloc();
    let arg = b.alloc();
    let out = b.alloc();
    b.emit(Op::LoadNil(arg));
    b.emit(Op::NewRef(r, arg));
    b.emit(Op::Move(arg, r));
    let set = b.k_str("set").unwrap();
    b.emit(Op::Invoke {
        dst: out,
        obj: r,
        method: set,
        base: arg,
        argc: 1,
    });
    if publish {
        let name = b.k_str("keep").unwrap();
        b.emit(Op::DefineGlobal(r, name));
    }
    b.emit(Op::LoadNil(r));
    b.emit(Op::LoadNil(arg));
    b.emit(Op::Return(out));
    b.finish().unwrap()
}

#[test]
fn test_unreachable_ref_cycle_is_collected() {
    let mut vm = collecting(false);
    vm.run(Arc::new(self_referencing_ref(false))).unwrap();
    assert_eq!(vm.gc().live(), 1);
    assert_eq!(vm.collect_garbage(), 1);
    assert_eq!(vm.gc().live(), 0);
    assert_eq!(vm.gc().stats().total_freed, 1);
}

#[test]
fn test_ref_reachable_from_global_survives() {
    let mut vm = collecting(false);
    vm.run(Arc::new(self_referencing_ref(true))).unwrap();
    assert_eq!(vm.collect_garbage(), 0);
    let ValKind::Ref(cell) = &vm.global("keep").unwrap().kind else {
        panic!("global should hold the Ref");
    };
    assert!(matches!(cell.get().kind, ValKind::Ref(_)));
}

#[test]
fn test_collector_disabled_by_default() {
    let mut vm = Vm::default();
    vm.run(Arc::new(self_referencing_ref(false))).unwrap();
    assert_eq!(vm.gc().live(), 0);
    assert_eq!(vm.collect_garbage(), 0);
}

#[test]
fn test_stress_mode_keeps_results_correct() {
    // A counter closure allocates upvalue cells and refs every iteration;
    // collecting at each tracked allocation must not disturb live state.
    let mut inc = ChunkBuilder::new("inc");
    let r = inc.alloc();
    inc.emit(Op::GetUpvalue(r, 0));
    inc.emit(Op::AddImm(r, r, 1));
    inc.emit(Op::SetUpvalue(r, 0));
    inc.emit(Op::Return(r));
    let inc = inc.finish().unwrap();

    let mut b = ChunkBuilder::new("<main>");
    let count = b.local("count");
    b.emit(Op::LoadInt(count, 0));
    let f = b.alloc();
    let p = b.proto(inc).unwrap();
    b.closure(f, p, &[(CaptureKind::Local, count)]).unwrap();
    let (i, limit, cond, tmp, cell) = (b.alloc(), b.alloc(), b.alloc(), b.alloc(), b.alloc());
    b.emit(Op::LoadInt(i, 0));
    b.emit(Op::LoadInt(limit, 20));
    let top = b.here();
    b.emit(Op::LtInt(cond, i, limit));
    let exit = b.emit_jump(Op::JmpFalse(cond, 0));
    b.emit(Op::NewRef(cell, i));
    b.emit(Op::Move(tmp, f));
    b.emit(Op::Call { func: tmp, argc: 0 });
    b.emit(Op::IncReg(i));
    b.jump_back(top).unwrap();
    b.patch(exit).unwrap();
    b.emit(Op::Return(count));

    let mut vm = collecting(true);
    assert_eq!(vm.run(Arc::new(b.finish().unwrap())).unwrap(), Val::int(20));
    assert!(vm.gc().stats().cycles >= 20);
}

#[test]
fn test_reset_ephemeral_drops_released_temporaries() {
    let mut regions = RegionAllocator::new();
    let scratch = regions.create_region();
    let value = regions.place(scratch, Val::str("temporary"));
    assert!(!regions.release(value));
    assert_eq!(regions.stats(scratch).unwrap().retained, 1);
    assert_eq!(regions.reset(scratch), 1);
    assert_eq!(regions.stats(scratch).unwrap().placed, 0);
}

#[test]
fn test_concat_results_live_in_ephemeral_region() {
    let mut b = ChunkBuilder::new("<main>");
    let (a, c) = (b.alloc(), b.alloc());
    let (ka, kc) = (b.k_str("ab").unwrap(), b.k_str("cd").unwrap());
    b.emit(Op::LoadK(a, ka));
    b.emit(Op::LoadK(c, kc));
    b.emit(Op::Concat(a, a, c));
    b.emit(Op::ResetEphemeral);
    b.emit(Op::Return(a));

    let mut vm = Vm::default();
    let out = vm.run(Arc::new(b.finish().unwrap())).unwrap();
    assert_eq!(out, Val::str("abcd"));
    let stats = vm.regions().stats(crate::vm::EPHEMERAL_REGION).unwrap();
    assert_eq!(stats.placed, 0);
}
