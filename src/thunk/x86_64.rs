//! Assembly thunks and the process-wide dispatch slot they consult.
//!
//! Entry: a patched procedure's padding calls the entry thunk, so the thunk
//! finds the procedure address on top of the stack and the caller's return
//! slot right above it. Registers are saved into a `Context`, the dispatcher
//! runs, and control resumes two bytes into the procedure, past the short
//! jump.
//!
//! Exit: a hooked call returns into the exit thunk, which saves the return
//! registers, asks the dispatcher for the real return address and returns
//! there.

use std::{
    ptr,
    sync::{
        atomic::{AtomicPtr, AtomicUsize, Ordering},
        Arc,
    },
};

use super::{fatal, Context, Dispatcher};
use crate::diag::{Error, Kind, Result};

static ACTIVE: AtomicPtr<Dispatcher> = AtomicPtr::new(ptr::null_mut());
static INFLIGHT: AtomicUsize = AtomicUsize::new(0);

/// Routes the thunks to `dispatcher`.
///
/// # Errors
///
/// Returns `AlreadyInitialized` if another dispatcher is bound.
pub(crate) fn bind(dispatcher: &Arc<Dispatcher>) -> Result<()> {
    let raw = Arc::into_raw(Arc::clone(dispatcher)).cast_mut();
    if ACTIVE
        .compare_exchange(ptr::null_mut(), raw, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        // SAFETY: `raw` comes from `Arc::into_raw` above and was not shared.
        drop(unsafe { Arc::from_raw(raw) });
        return Err(Error::new(Kind::AlreadyInitialized)
            .with_detail("another engine owns the thunks"));
    }
    Ok(())
}

/// Detaches the thunks once no thread runs the bound dispatcher anymore.
pub(crate) fn unbind() {
    let raw = ACTIVE.swap(ptr::null_mut(), Ordering::SeqCst);
    if raw.is_null() {
        return;
    }

    while INFLIGHT.load(Ordering::SeqCst) != 0 {
        std::thread::yield_now();
    }
    // SAFETY: `raw` was produced by `bind` and is no longer reachable.
    drop(unsafe { Arc::from_raw(raw) });
}

unsafe extern "C" fn enter(context: *mut Context) {
    INFLIGHT.fetch_add(1, Ordering::SeqCst);
    let dispatcher = ACTIVE.load(Ordering::SeqCst);
    if !dispatcher.is_null() {
        (*dispatcher).enter(&mut *context);
    }
    INFLIGHT.fetch_sub(1, Ordering::SeqCst);
}

unsafe extern "C" fn leave(context: *mut Context) -> usize {
    INFLIGHT.fetch_add(1, Ordering::SeqCst);
    let dispatcher = ACTIVE.load(Ordering::SeqCst);
    if dispatcher.is_null() {
        fatal("Exit thunk reached with no engine bound");
    }
    let continuation = (*dispatcher).leave(&mut *context);
    INFLIGHT.fetch_sub(1, Ordering::SeqCst);
    continuation
}

// Context layout: rdi rsi rdx rcx r8 r9 rax r10 r11 rbx rbp at 0..88, then
// rip at 88, rflags at 96 and rsp at 104. Both thunks keep the stack 16-byte
// aligned at the call into Rust.
std::arch::global_asm!(
    ".pushsection .text.fbt_thunks,\"ax\",@progbits",
    ".p2align 4",
    ".globl fbt_entry_thunk",
    ".hidden fbt_entry_thunk",
    "fbt_entry_thunk:",
    "lea rsp, [rsp - 8]",
    "pushfq",
    "cld",
    "lea rsp, [rsp - 8]",
    "push rbp",
    "push rbx",
    "push r11",
    "push r10",
    "push rax",
    "push r9",
    "push r8",
    "push rcx",
    "push rdx",
    "push rsi",
    "push rdi",
    "mov rax, [rsp + 112]",
    "mov [rsp + 88], rax",
    "lea rax, [rsp + 120]",
    "mov [rsp + 104], rax",
    "sub rsp, 128",
    "movups [rsp], xmm0",
    "movups [rsp + 16], xmm1",
    "movups [rsp + 32], xmm2",
    "movups [rsp + 48], xmm3",
    "movups [rsp + 64], xmm4",
    "movups [rsp + 80], xmm5",
    "movups [rsp + 96], xmm6",
    "movups [rsp + 112], xmm7",
    "lea rdi, [rsp + 128]",
    "call {enter}",
    "movups xmm0, [rsp]",
    "movups xmm1, [rsp + 16]",
    "movups xmm2, [rsp + 32]",
    "movups xmm3, [rsp + 48]",
    "movups xmm4, [rsp + 64]",
    "movups xmm5, [rsp + 80]",
    "movups xmm6, [rsp + 96]",
    "movups xmm7, [rsp + 112]",
    "add rsp, 128",
    "pop rdi",
    "pop rsi",
    "pop rdx",
    "pop rcx",
    "pop r8",
    "pop r9",
    "pop rax",
    "pop r10",
    "pop r11",
    "pop rbx",
    "pop rbp",
    // Resume past the two byte jump that led here.
    "add qword ptr [rsp + 24], 2",
    "add rsp, 8",
    "popfq",
    "lea rsp, [rsp + 8]",
    "ret",
    "",
    ".p2align 4",
    ".globl fbt_exit_thunk",
    ".hidden fbt_exit_thunk",
    "fbt_exit_thunk:",
    "lea rsp, [rsp - 16]",
    "pushfq",
    "cld",
    "lea rsp, [rsp - 8]",
    "push rbp",
    "push rbx",
    "push r11",
    "push r10",
    "push rax",
    "push r9",
    "push r8",
    "push rcx",
    "push rdx",
    "push rsi",
    "push rdi",
    "mov qword ptr [rsp + 88], 0",
    "lea rax, [rsp + 112]",
    "mov [rsp + 104], rax",
    "sub rsp, 136",
    "movups [rsp], xmm0",
    "movups [rsp + 16], xmm1",
    "movups [rsp + 32], xmm2",
    "movups [rsp + 48], xmm3",
    "movups [rsp + 64], xmm4",
    "movups [rsp + 80], xmm5",
    "movups [rsp + 96], xmm6",
    "movups [rsp + 112], xmm7",
    "lea rdi, [rsp + 136]",
    "call {leave}",
    "mov [rsp + 248], rax",
    "movups xmm0, [rsp]",
    "movups xmm1, [rsp + 16]",
    "movups xmm2, [rsp + 32]",
    "movups xmm3, [rsp + 48]",
    "movups xmm4, [rsp + 64]",
    "movups xmm5, [rsp + 80]",
    "movups xmm6, [rsp + 96]",
    "movups xmm7, [rsp + 112]",
    "add rsp, 136",
    "pop rdi",
    "pop rsi",
    "pop rdx",
    "pop rcx",
    "pop r8",
    "pop r9",
    "pop rax",
    "pop r10",
    "pop r11",
    "pop rbx",
    "pop rbp",
    "add rsp, 8",
    "popfq",
    "lea rsp, [rsp + 8]",
    "ret",
    ".popsection",
    enter = sym enter,
    leave = sym leave,
);

extern "C" {
    fn fbt_entry_thunk();
    fn fbt_exit_thunk();
}

/// Address patched procedures call into.
#[must_use]
pub fn entry_thunk() -> usize {
    fbt_entry_thunk as usize
}

/// Address hooked calls return into.
#[must_use]
pub fn exit_thunk() -> usize {
    fbt_exit_thunk as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thunk_addresses() {
        assert_ne!(entry_thunk(), 0);
        assert_ne!(entry_thunk(), exit_thunk());
        assert_eq!(entry_thunk() % 16, 0);
    }
}
