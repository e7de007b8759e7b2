use log::{debug, warn};
use nix::{errno::Errno, unistd::Pid};
use std::{collections::HashMap, ops::Range};

use crate::{
    arch::{PatchCode, Trampoline, MAX_PATCH_SIZE},
    diag::{Error, Kind, Result},
    platform::{CodeMemory, Platform, Protection, Suspension, ThreadControl},
    procedure::Procedure,
};

/// One active redirect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodePatch {
    procedure: Procedure,
    target: usize,
    new_code: PatchCode,
    old_code: PatchCode,
    protection: Protection,
}

impl CodePatch {
    /// Database key of this patch.
    #[must_use]
    pub fn key(&self) -> Procedure {
        self.procedure
    }

    /// First byte rewritten by the patch.
    #[must_use]
    pub fn target(&self) -> usize {
        self.target
    }

    #[must_use]
    pub fn region(&self) -> Range<usize> {
        self.target..self.target + self.new_code.len()
    }

    #[must_use]
    pub fn new_code(&self) -> &PatchCode {
        &self.new_code
    }

    #[must_use]
    pub fn old_code(&self) -> &PatchCode {
        &self.old_code
    }

    /// Protection of the patched pages before they were made writable.
    #[must_use]
    pub fn protection(&self) -> Protection {
        self.protection
    }
}

/// Active patches by procedure. Not synchronized: the engine keeps it
/// behind its patch database lock.
#[derive(Default)]
pub struct Database {
    patches: HashMap<Procedure, CodePatch>,
}

impl Database {
    #[must_use]
    pub fn lookup(&self, procedure: Procedure) -> Option<&CodePatch> {
        self.patches.get(&procedure)
    }

    #[must_use]
    pub fn contains(&self, procedure: Procedure) -> bool {
        self.patches.contains_key(&procedure)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.patches.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    #[must_use]
    pub fn procedures(&self) -> Vec<Procedure> {
        let mut procedures: Vec<Procedure> = self.patches.keys().copied().collect();
        procedures.sort_unstable();
        procedures
    }

    fn insert(&mut self, patch: CodePatch) {
        self.patches.insert(patch.key(), patch);
    }

    fn remove(&mut self, procedure: Procedure) -> Option<CodePatch> {
        self.patches.remove(&procedure)
    }
}

fn write_code<M: CodeMemory>(
    memory: &M,
    target: usize,
    code: &PatchCode,
    protection: Protection,
) -> nix::Result<()> {
    memory.set_protection(target, code.len(), Protection::READ_WRITE_EXECUTE)?;
    let written = memory.write(target, code.as_slice());
    memory.flush_icache(target, code.len());
    let restored = memory.set_protection(target, code.len(), protection);
    written.and(restored)
}

/// Whether `procedure` has a shape the trampoline can redirect.
///
/// # Errors
///
/// Returns `InvalidArgument` if the trampoline claims more than
/// `MAX_PATCH_SIZE` bytes.
pub fn is_instrumentable<P: Platform>(platform: &P, procedure: Procedure) -> Result<bool> {
    let Some(region) = platform.arch().region(procedure) else {
        return Ok(false);
    };
    if region.len() > MAX_PATCH_SIZE {
        return Err(Error::new(Kind::InvalidArgument).with_procedure(procedure));
    }

    let mut original = [0u8; MAX_PATCH_SIZE];
    let original = &mut original[..region.len()];
    if platform.memory().read(region.start, original).is_err() {
        return Ok(false);
    }

    Ok(platform.arch().is_instrumentable(procedure, original))
}

fn prepare<P: Platform>(platform: &P, procedure: Procedure) -> Result<CodePatch> {
    let not_patchable = || Error::new(Kind::NotPatchable).with_procedure(procedure);

    let region = platform.arch().region(procedure).ok_or_else(not_patchable)?;
    if region.len() > MAX_PATCH_SIZE {
        return Err(not_patchable());
    }

    let mut original = [0u8; MAX_PATCH_SIZE];
    let original = &mut original[..region.len()];
    platform
        .memory()
        .read(region.start, original)
        .map_err(|_| not_patchable())?;
    if !platform.arch().is_instrumentable(procedure, original) {
        return Err(not_patchable());
    }

    let new_code = platform.arch().compute(procedure)?;
    if new_code.len() != region.len() {
        return Err(Error::new(Kind::InvalidArgument)
            .with_procedure(procedure)
            .with_detail("redirect does not cover the patch region"));
    }

    Ok(CodePatch {
        procedure,
        target: region.start,
        new_code,
        old_code: PatchCode::new(original)?,
        protection: platform.memory().protection(region.start, region.len())?,
    })
}

/// Patches every procedure of `procedures`, or none of them.
///
/// # Errors
///
/// Returns `AlreadyPatched`, `NotPatchable` or `ProcTooFar` carrying the
/// first offending procedure, or the platform error that prevented the
/// code from being written. The database is left unchanged on error,
/// unless the patches already written could not be rolled back: those stay
/// in the database and `PartiallyApplied` is returned.
pub fn add<P: Platform>(
    platform: &P,
    database: &mut Database,
    procedures: &[Procedure],
) -> Result<()> {
    let mut prepared: Vec<CodePatch> = Vec::with_capacity(procedures.len());
    for &procedure in procedures {
        if database.contains(procedure) || prepared.iter().any(|p| p.key() == procedure) {
            return Err(Error::new(Kind::AlreadyPatched).with_procedure(procedure));
        }
        prepared.push(prepare(platform, procedure)?);
    }

    let memory = platform.memory();
    let mut failure = None;
    for (i, patch) in prepared.iter().enumerate() {
        if let Err(e) = write_code(memory, patch.target, &patch.new_code, patch.protection) {
            failure = Some((i, e));
            break;
        }
        debug!("Patched {} ({:?})", patch.key(), patch.new_code);
    }

    if let Some((i, e)) = failure {
        let failed = prepared[i].key();
        warn!("Failed to patch {failed}: {e}");
        let rollback = {
            let applied: Vec<&CodePatch> = prepared[..i].iter().collect();
            unpatch(platform, &applied)
        };
        let Err(revert) = rollback else {
            return Err(Error::from(e).with_procedure(failed));
        };

        warn!("Failed to roll back partial patch batch: {}", revert.error);
        let mut kept = 0;
        for (j, patch) in prepared.into_iter().enumerate().take(i) {
            if !revert.restored.contains(&j) {
                database.insert(patch);
                kept += 1;
            }
        }
        return Err(Error::new(Kind::PartiallyApplied)
            .with_procedure(failed)
            .with_detail(format!("{e}; {kept} patch(es) left applied: {}", revert.error)));
    }

    for patch in prepared {
        database.insert(patch);
    }
    Ok(())
}

/// Reverts the patches of every procedure of `procedures`, or none of them.
///
/// # Errors
///
/// Returns `NotPatched` carrying the first procedure without an active
/// patch, `ThreadSuspendFailure` or `ContextUpdateFailure` if the other
/// threads could not be taken out of the patched code safely, or the
/// platform error that prevented the code from being restored. The
/// database is left unchanged on error, unless some original code could
/// not be re-patched after a failed restore: those procedures leave the
/// database and `PartiallyApplied` is returned.
pub fn remove<P: Platform>(
    platform: &P,
    database: &mut Database,
    procedures: &[Procedure],
) -> Result<()> {
    let mut patches: Vec<&CodePatch> = Vec::with_capacity(procedures.len());
    for &procedure in procedures {
        match database.lookup(procedure) {
            Some(patch) if !patches.iter().any(|p| p.key() == procedure) => patches.push(patch),
            _ => return Err(Error::new(Kind::NotPatched).with_procedure(procedure)),
        }
    }

    if let Err(revert) = unpatch(platform, &patches) {
        if revert.restored.is_empty() {
            return Err(revert.error);
        }
        let restored = &procedures[revert.restored.clone()];
        for &procedure in restored {
            database.remove(procedure);
        }
        return Err(Error::new(Kind::PartiallyApplied)
            .with_procedure(restored[0])
            .with_detail(format!(
                "{} procedure(s) unpatched: {}",
                restored.len(),
                revert.error
            )));
    }
    for &procedure in procedures {
        database.remove(procedure);
        debug!("Unpatched {procedure}");
    }
    Ok(())
}

enum Failure {
    Suspend(Pid, Errno),
    Context(Pid, Errno),
    /// The patches in the range have their original code back anyway.
    Restore(Procedure, Errno, Range<usize>),
}

/// A failed `unpatch`.
struct Revert {
    error: Error,
    /// Indexes of the patches restored despite the failure.
    restored: Range<usize>,
}

/// Restores original code with every other thread stopped, moving threads
/// caught inside a redirect back onto an instruction boundary first.
fn unpatch<P: Platform>(
    platform: &P,
    patches: &[&CodePatch],
) -> std::result::Result<(), Revert> {
    if patches.is_empty() {
        return Ok(());
    }

    let threads = platform.threads();
    let tids = threads.enumerate().map_err(|error| Revert {
        error,
        restored: 0..0,
    })?;
    let mut suspended: Vec<Pid> = Vec::with_capacity(tids.len());

    // No allocation and no logging until every thread is resumed: a
    // suspended thread may own the allocator or logger lock.
    let outcome = restore_suspended(platform, patches, &tids, &mut suspended);

    let mut resume_failures = 0usize;
    for &tid in &suspended {
        if threads.resume(tid).is_err() {
            resume_failures += 1;
        }
    }
    if resume_failures > 0 {
        warn!("Failed to resume {resume_failures} thread(s)");
    }

    outcome.map_err(|failure| match failure {
        Failure::Suspend(tid, e) => Revert {
            error: Error::new(Kind::ThreadSuspendFailure)
                .with_detail(format!("thread {tid}: {e}")),
            restored: 0..0,
        },
        Failure::Context(tid, e) => Revert {
            error: Error::new(Kind::ContextUpdateFailure)
                .with_detail(format!("thread {tid}: {e}")),
            restored: 0..0,
        },
        Failure::Restore(procedure, e, restored) => Revert {
            error: Error::from(e).with_procedure(procedure),
            restored,
        },
    })
}

fn restore_suspended<P: Platform>(
    platform: &P,
    patches: &[&CodePatch],
    tids: &[Pid],
    suspended: &mut Vec<Pid>,
) -> std::result::Result<(), Failure> {
    let threads = platform.threads();
    let arch = platform.arch();
    let memory = platform.memory();

    for &tid in tids {
        match threads.suspend(tid) {
            Ok(Suspension::Suspended) => suspended.push(tid),
            Ok(Suspension::Exited) => {}
            Err(e) => return Err(Failure::Suspend(tid, e)),
        }
    }

    for &tid in suspended.iter() {
        let ip = threads
            .instruction_pointer(tid)
            .map_err(|e| Failure::Context(tid, e))?;
        if let Some(new_ip) = patches
            .iter()
            .find_map(|patch| arch.relocate(patch.key(), ip))
        {
            threads
                .set_instruction_pointer(tid, new_ip)
                .map_err(|e| Failure::Context(tid, e))?;
        }
    }

    for (i, patch) in patches.iter().enumerate() {
        if let Err(e) = write_code(memory, patch.target, &patch.old_code, patch.protection) {
            // Re-patch what was restored; stop at the first failure, which
            // leaves `j..i` restored.
            for (j, reverted) in patches[..i].iter().enumerate() {
                if write_code(memory, reverted.target, &reverted.new_code, reverted.protection)
                    .is_err()
                {
                    return Err(Failure::Restore(patch.key(), e, j..i));
                }
            }
            return Err(Failure::Restore(patch.key(), e, i..i));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::{Simulated, HOTPATCHABLE};

    fn setup() -> (Simulated, Procedure, Procedure, Procedure) {
        let platform = Simulated::new();
        let p1 = platform.add_procedure(0x1010);
        let p2 = platform.add_plain_procedure(0x1030);
        let p3 = platform.add_procedure(0x1050);
        (platform, p1, p2, p3)
    }

    #[test]
    fn test_add_writes_redirect() {
        let (platform, p1, _, _) = setup();
        let mut db = Database::default();

        add(&platform, &mut db, &[p1]).expect("add");

        let patch = db.lookup(p1).expect("patch");
        assert_eq!(patch.target(), 0x100b);
        assert_eq!(patch.old_code().as_slice(), &HOTPATCHABLE[..7]);
        assert_eq!(
            platform.memory().bytes(0x100b, 7).expect("bytes"),
            patch.new_code().as_slice()
        );
        assert_eq!(
            platform.memory().protection_at(0x100b),
            Some(Protection::READ_EXECUTE)
        );
        assert!(platform.memory().flushes() > 0);
    }

    #[test]
    fn test_add_is_all_or_nothing() {
        let (platform, p1, p2, p3) = setup();
        let mut db = Database::default();

        let err = add(&platform, &mut db, &[p1, p2, p3]).unwrap_err();
        assert_eq!(err.kind(), Kind::NotPatchable);
        assert_eq!(err.procedure(), Some(p2));
        assert!(db.is_empty());
        assert_eq!(platform.memory().bytes(0x100b, 8).expect("bytes"), HOTPATCHABLE);
    }

    #[test]
    fn test_add_rolls_back_on_write_failure() {
        let (platform, p1, _, p3) = setup();
        let mut db = Database::default();
        platform.memory().fail_writes_at(p3.address());

        let err = add(&platform, &mut db, &[p1, p3]).unwrap_err();
        assert_eq!(err.procedure(), Some(p3));
        assert!(db.is_empty());
        assert_eq!(platform.memory().bytes(0x100b, 8).expect("bytes"), HOTPATCHABLE);
    }

    #[test]
    fn test_add_keeps_patches_it_cannot_roll_back() {
        let (platform, p1, _, p3) = setup();
        let mut db = Database::default();
        platform.memory().fail_writes_after(p1.address(), 1);
        platform.memory().fail_writes_at(p3.address());

        let err = add(&platform, &mut db, &[p1, p3]).unwrap_err();
        assert_eq!(err.kind(), Kind::PartiallyApplied);
        assert_eq!(err.procedure(), Some(p3));

        let patch = db.lookup(p1).expect("patch kept");
        assert_eq!(
            platform.memory().bytes(0x100b, 7).expect("bytes"),
            patch.new_code().as_slice()
        );
        assert!(!db.contains(p3));
        assert_eq!(platform.memory().bytes(0x104b, 8).expect("bytes"), HOTPATCHABLE);
    }

    #[test]
    fn test_add_twice() {
        let (platform, p1, _, p3) = setup();
        let mut db = Database::default();

        add(&platform, &mut db, &[p1]).expect("add");
        let err = add(&platform, &mut db, &[p1]).unwrap_err();
        assert_eq!(err.kind(), Kind::AlreadyPatched);
        assert_eq!(db.len(), 1);

        let err = add(&platform, &mut db, &[p3, p3]).unwrap_err();
        assert_eq!(err.kind(), Kind::AlreadyPatched);
        assert_eq!(err.procedure(), Some(p3));
        assert!(!db.contains(p3));
        assert_eq!(platform.memory().bytes(0x104b, 8).expect("bytes"), HOTPATCHABLE);
    }

    #[test]
    fn test_remove_restores_code() {
        let (platform, p1, _, p3) = setup();
        let mut db = Database::default();
        add(&platform, &mut db, &[p1, p3]).expect("add");

        remove(&platform, &mut db, &[p3, p1]).expect("remove");
        assert!(db.is_empty());
        assert_eq!(platform.memory().bytes(0x100b, 8).expect("bytes"), HOTPATCHABLE);
        assert_eq!(platform.memory().bytes(0x104b, 8).expect("bytes"), HOTPATCHABLE);
    }

    #[test]
    fn test_remove_restore_failure_keeps_patches() {
        let (platform, p1, _, p3) = setup();
        let mut db = Database::default();
        add(&platform, &mut db, &[p1, p3]).expect("add");
        let patched = platform.memory().bytes(0x100b, 7).expect("bytes");
        platform.memory().fail_writes_at(p3.address());

        let err = remove(&platform, &mut db, &[p1, p3]).unwrap_err();
        assert_eq!(err.kind(), Kind::System(Errno::EIO));
        assert_eq!(err.procedure(), Some(p3));
        assert!(db.contains(p1) && db.contains(p3));
        assert_eq!(platform.memory().bytes(0x100b, 7).expect("bytes"), patched);
    }

    #[test]
    fn test_remove_drops_procedures_it_cannot_repatch() {
        let (platform, p1, _, p3) = setup();
        let mut db = Database::default();
        add(&platform, &mut db, &[p1, p3]).expect("add");
        // Restoring p1 succeeds, re-patching it after p3 fails does not.
        platform.memory().fail_writes_after(p1.address(), 1);
        platform.memory().fail_writes_at(p3.address());

        let err = remove(&platform, &mut db, &[p1, p3]).unwrap_err();
        assert_eq!(err.kind(), Kind::PartiallyApplied);
        assert_eq!(err.procedure(), Some(p1));
        assert!(!db.contains(p1));
        assert!(db.contains(p3));
        assert_eq!(platform.memory().bytes(0x100b, 8).expect("bytes"), HOTPATCHABLE);
        assert_ne!(platform.memory().bytes(0x104b, 8).expect("bytes"), HOTPATCHABLE);
    }

    #[test]
    fn test_remove_not_patched() {
        let (platform, p1, p2, _) = setup();
        let mut db = Database::default();
        add(&platform, &mut db, &[p1]).expect("add");

        let err = remove(&platform, &mut db, &[p1, p2]).unwrap_err();
        assert_eq!(err.kind(), Kind::NotPatched);
        assert_eq!(err.procedure(), Some(p2));
        assert!(db.contains(p1));
    }

    #[test]
    fn test_remove_relocates_threads() {
        let (platform, p1, _, _) = setup();
        let mut db = Database::default();
        add(&platform, &mut db, &[p1]).expect("add");

        let threads = platform.threads();
        threads.spawn(1, 0x100b); // about to execute the call
        threads.spawn(2, p1.address()); // about to execute the jmp
        threads.spawn(3, 0x9000);

        remove(&platform, &mut db, &[p1]).expect("remove");
        assert_eq!(threads.ip(1), Some(p1.address()));
        assert_eq!(threads.ip(2), Some(p1.address()));
        assert_eq!(threads.ip(3), Some(0x9000));
        assert_eq!(threads.suspensions(), 3);
        assert!((1..=3).all(|tid| !threads.is_suspended(tid)));
    }

    #[test]
    fn test_remove_tolerates_exited_thread() {
        let (platform, p1, _, _) = setup();
        let mut db = Database::default();
        add(&platform, &mut db, &[p1]).expect("add");
        platform.threads().spawn(1, 0x100b);
        platform.threads().exit(1);

        remove(&platform, &mut db, &[p1]).expect("remove");
        assert!(db.is_empty());
    }

    #[test]
    fn test_remove_suspend_failure_is_fatal() {
        let (platform, p1, _, _) = setup();
        let mut db = Database::default();
        add(&platform, &mut db, &[p1]).expect("add");
        let threads = platform.threads();
        threads.spawn(1, 0x9000);
        threads.spawn(2, 0x9000);
        threads.fail_suspend(2);

        let err = remove(&platform, &mut db, &[p1]).unwrap_err();
        assert_eq!(err.kind(), Kind::ThreadSuspendFailure);
        assert!(db.contains(p1));
        assert!(!threads.is_suspended(1));
    }

    #[test]
    fn test_remove_context_failure_is_fatal() {
        let (platform, p1, _, _) = setup();
        let mut db = Database::default();
        add(&platform, &mut db, &[p1]).expect("add");
        let patched = platform.memory().bytes(0x100b, 7).expect("bytes");
        let threads = platform.threads();
        threads.spawn(1, 0x100b);
        threads.fail_set_instruction_pointer(1);

        let err = remove(&platform, &mut db, &[p1]).unwrap_err();
        assert_eq!(err.kind(), Kind::ContextUpdateFailure);
        assert!(db.contains(p1));
        assert_eq!(platform.memory().bytes(0x100b, 7).expect("bytes"), patched);
        assert!(!threads.is_suspended(1));
    }

    #[test]
    fn test_context_failure_outside_region_is_ignored() {
        let (platform, p1, _, _) = setup();
        let mut db = Database::default();
        add(&platform, &mut db, &[p1]).expect("add");
        platform.threads().spawn(1, 0x9000);
        platform.threads().fail_set_instruction_pointer(1);

        remove(&platform, &mut db, &[p1]).expect("remove");
    }

    #[test]
    fn test_is_instrumentable() {
        let (platform, p1, p2, _) = setup();
        assert!(is_instrumentable(&platform, p1).expect("check"));
        assert!(!is_instrumentable(&platform, p2).expect("check"));
        assert!(!is_instrumentable(&platform, Procedure::new(0x8000)).expect("check"));
    }
}
