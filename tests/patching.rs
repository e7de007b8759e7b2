use std::{collections::BTreeSet, sync::Barrier, thread};

use fbt_rs::{
    config::Flags,
    diag::Kind,
    engine::{Action, Engine},
    platform::{
        mock::{Simulated, ENTRY_THUNK, HOTPATCHABLE},
        Platform,
    },
    procedure::Procedure,
};

pub mod testlib;

fn padding(engine: &Engine<Simulated>, procedure: Procedure) -> Vec<u8> {
    engine
        .platform()
        .memory()
        .bytes(procedure.address() - 5, 7)
        .expect("mapped")
}

fn redirect(procedure: Procedure) -> Vec<u8> {
    let rel = (ENTRY_THUNK as i64 - procedure.address() as i64) as i32;
    let mut code = vec![0xe8];
    code.extend_from_slice(&rel.to_le_bytes());
    code.extend_from_slice(&[0xeb, 0xf9]);
    code
}

fn initialized(addresses: &[usize]) -> (Engine<Simulated>, Vec<Procedure>) {
    let (engine, procedures) = testlib::simulated_engine(addresses);
    let recorder = testlib::Recorder::new(0);
    engine
        .initialize(
            &testlib::options(4, 64, Flags::empty()),
            recorder.handler(),
            testlib::Sink::default().consumer(),
        )
        .expect("initialize");
    (engine, procedures)
}

#[test]
fn test_database_is_net_effect() {
    let addresses: Vec<usize> = (0..6).map(|i| 0x1010 + i * 0x100).collect();
    let (engine, procedures) = initialized(&addresses);
    let original = HOTPATCHABLE[..7].to_vec();

    let mut expected = BTreeSet::new();
    let steps: [(Action, &[usize]); 5] = [
        (Action::Add, &[0, 1, 2]),
        (Action::Add, &[4]),
        (Action::Remove, &[1]),
        (Action::Add, &[5, 1]),
        (Action::Remove, &[0, 4]),
    ];
    for (action, indices) in steps {
        let batch: Vec<Procedure> = indices.iter().map(|&i| procedures[i]).collect();
        engine.instrument(action, &batch).expect("instrument");
        for procedure in batch {
            match action {
                Action::Add => expected.insert(procedure),
                Action::Remove => expected.remove(&procedure),
            };
        }
    }

    for &procedure in &procedures {
        let patched = expected.contains(&procedure);
        assert_eq!(engine.lookup(procedure).expect("lookup").is_some(), patched);
        let code = padding(&engine, procedure);
        if patched {
            assert_eq!(code, redirect(procedure));
        } else {
            assert_eq!(code, original);
        }
    }
    assert_eq!(engine.statistics().expect("stats").patch_count, expected.len());
    assert_eq!(engine.remove_all().expect("remove all"), expected.len());
    engine.uninitialize().expect("uninitialize");
}

#[test]
fn test_failed_requests_do_not_mutate() {
    let (engine, procedures) = initialized(&[0x1010, 0x1110]);
    let (p1, p2) = (procedures[0], procedures[1]);
    engine.instrument(Action::Add, &[p1]).expect("add");
    let before = (padding(&engine, p1), padding(&engine, p2));

    let err = engine.instrument(Action::Add, &[p2, p1]).unwrap_err();
    assert_eq!(err.kind(), Kind::AlreadyPatched);
    assert_eq!(err.procedure(), Some(p1));

    let err = engine.instrument(Action::Remove, &[p1, p2]).unwrap_err();
    assert_eq!(err.kind(), Kind::NotPatched);
    assert_eq!(err.procedure(), Some(p2));

    assert_eq!((padding(&engine, p1), padding(&engine, p2)), before);
    assert!(engine.lookup(p1).expect("lookup").is_some());
    assert!(engine.lookup(p2).expect("lookup").is_none());
    engine.remove_all().expect("remove all");
}

#[test]
fn test_unpatchable_procedure_fails_whole_batch() {
    let platform = Simulated::new();
    let p1 = platform.add_procedure(0x1010);
    let p2 = platform.add_plain_procedure(0x1110);
    let p3 = platform.add_procedure(0x1210);
    let engine = Engine::new(platform);
    engine
        .initialize(
            &testlib::options(4, 64, Flags::empty()),
            testlib::Recorder::new(0).handler(),
            testlib::Sink::default().consumer(),
        )
        .expect("initialize");

    assert!(!engine.check_instrumentability(p2).expect("check"));
    let err = engine.instrument(Action::Add, &[p1, p2, p3]).unwrap_err();
    assert_eq!(err.kind(), Kind::NotPatchable);
    assert_eq!(err.procedure(), Some(p2));

    for procedure in [p1, p3] {
        assert!(engine.lookup(procedure).expect("lookup").is_none());
        assert_eq!(padding(&engine, procedure), HOTPATCHABLE[..7].to_vec());
    }
    assert_eq!(engine.statistics().expect("stats").patch_count, 0);
    engine.uninitialize().expect("uninitialize");
}

#[test]
fn test_concurrent_add_of_same_procedure() {
    let (engine, procedures) = initialized(&[0x1010]);
    let procedure = procedures[0];
    let barrier = Barrier::new(2);

    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    engine.instrument(Action::Add, &[procedure])
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let err = results
        .into_iter()
        .find_map(Result::err)
        .expect("one failure");
    assert_eq!(err.kind(), Kind::AlreadyPatched);
    assert_eq!(padding(&engine, procedure), redirect(procedure));
    engine.remove_all().expect("remove all");
}

#[test]
fn test_remove_moves_threads_out_of_region() {
    let (engine, procedures) = initialized(&[0x1010]);
    let procedure = procedures[0];
    engine.instrument(Action::Add, &[procedure]).expect("add");

    let threads = engine.platform().threads();
    threads.spawn(10, procedure.address() - 5);
    threads.spawn(11, procedure.address() + 1);
    threads.spawn(12, procedure.address() + 2);

    engine.instrument(Action::Remove, &[procedure]).expect("remove");
    assert_eq!(threads.ip(10), Some(procedure.address()));
    assert_eq!(threads.ip(11), Some(procedure.address()));
    assert_eq!(threads.ip(12), Some(procedure.address() + 2));
    assert!(!(10..=12).any(|tid| threads.is_suspended(tid)));
}

#[test]
fn test_remove_with_stuck_thread_keeps_patch() {
    let (engine, procedures) = initialized(&[0x1010]);
    let procedure = procedures[0];
    engine.instrument(Action::Add, &[procedure]).expect("add");

    let threads = engine.platform().threads();
    threads.spawn(20, procedure.address() - 3);
    threads.fail_set_instruction_pointer(20);

    let err = engine.instrument(Action::Remove, &[procedure]).unwrap_err();
    assert_eq!(err.kind(), Kind::ContextUpdateFailure);
    assert!(engine.lookup(procedure).expect("lookup").is_some());
    assert_eq!(padding(&engine, procedure), redirect(procedure));
    assert!(!threads.is_suspended(20));

    threads.exit(20);
    engine.remove_all().expect("remove all");
    engine.uninitialize().expect("uninitialize");
}
