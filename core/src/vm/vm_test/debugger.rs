use crate::vm::{DebugAction, DebugHook, DebugView, FrameSummary};

use super::*;

/// Stops at the first instruction on `line`, capturing what it saw.
struct StopAtLine {
    line: u32,
    seen: Arc<Mutex<Option<Snapshot>>>,
}

#[derive(Debug)]
struct Snapshot {
    function: String,
    locals: Vec<(String, Val)>,
    backtrace: Vec<FrameSummary>,
}

impl DebugHook for StopAtLine {
    fn before_instruction(&mut self, view: &DebugView<'_>) -> DebugAction {
        if view.line() != self.line {
            return DebugAction::Continue;
        }
        let snapshot = Snapshot {
            function: view.function().to_string(),
            locals: view.locals().into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            backtrace: view.backtrace(),
        };
        *self.seen.lock().unwrap() = Some(snapshot);
        DebugAction::Halt
    }
}

/// `fn work(n) { let doubled = n + n  /* line 11 */ ; print(doubled) }`
/// called from `<main>` after printing "start".
fn program() -> Chunk {
    let mut f = ChunkBuilder::new("work");
    f.set_line(10);
    let n = f.param("n");
    let doubled = f.local("doubled");
    f.emit(Op::Move(doubled, n));
    f.set_line(11);
    f.emit(Op::Add(doubled, doubled, n));
    f.emit(Op::Print { base: doubled, count: 1 });
    f.emit(Op::Return(doubled));
    let f = f.finish().unwrap();

    let mut b = ChunkBuilder::new("<main>");
    b.set_line(1);
    let s = b.alloc();
    emit_print(&mut b, s, "start");
    b.set_line(2);
    let func = b.alloc();
    let arg = b.alloc();
    let p = b.proto(f).unwrap();
    b.closure(func, p, &[]).unwrap();
    b.emit(Op::LoadInt(arg, 4));
    b.emit(Op::Call { func, argc: 1 });
    b.emit(Op::Return(func));
    b.finish().unwrap()
}

#[test]
fn test_hook_halts_at_line_with_frame_view() {
    let seen = Arc::new(Mutex::new(None));
    let out = Output::default();
    let mut vm = Vm::default();
    out.attach(&mut vm);
    vm.set_debug_hook(Box::new(StopAtLine {
        line: 11,
        seen: seen.clone(),
    }));

    assert_eq!(vm.run(Arc::new(program())).unwrap(), Val::nil());
    assert!(vm.is_halted());
    assert_eq!(out.lines(), ["start"]);

    let snapshot = seen.lock().unwrap().take().expect("hook never stopped");
    assert_eq!(snapshot.function, "work");
    assert!(snapshot.locals.contains(&("n".to_string(), Val::int(4))));
    assert!(snapshot.locals.contains(&("doubled".to_string(), Val::int(4))));
    let functions: Vec<&str> = snapshot.backtrace.iter().map(|f| f.function.as_ref()).collect();
    assert_eq!(functions, ["work", "<main>"]);
    assert_eq!(snapshot.backtrace[0].line, 11);
}

#[test]
fn test_detached_hook_lets_program_finish() {
    let seen = Arc::new(Mutex::new(None));
    let out = Output::default();
    let mut vm = Vm::default();
    out.attach(&mut vm);
    vm.set_debug_hook(Box::new(StopAtLine {
        line: 99,
        seen: seen.clone(),
    }));
    assert!(vm.clear_debug_hook().is_some());

    assert_eq!(vm.run(Arc::new(program())).unwrap(), Val::int(8));
    assert!(!vm.is_halted());
    assert_eq!(out.lines(), ["start", "8"]);
    assert!(seen.lock().unwrap().is_none());
}
