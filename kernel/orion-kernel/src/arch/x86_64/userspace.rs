//! User-mode entry/exit: the `syscall` path, `iretq` entry, and signal
//! frames.

use crate::proc::signal::SavedContext;

use super::gdt::{KERNEL_CS, USER_CS, USER_DS};
use super::msr::{IA32_EFER, IA32_FMASK, IA32_LSTAR, IA32_STAR};

/// Programs the `syscall`/`sysret` MSRs on this CPU.
pub fn init_syscall_msrs() {
    // SAFETY: Standard syscall MSR setup; the entry stub is valid for the
    // kernel's lifetime.
    unsafe {
        // EFER.SCE.
        IA32_EFER.write(IA32_EFER.read() | 1);
        // STAR: kernel CS/SS from bits 32..48, user from 48..64.
        IA32_STAR.write((u64::from(KERNEL_CS) << 32) | ((u64::from(USER_CS) - 16) << 48));
        IA32_LSTAR.write(syscall_entry as usize as u64);
        // Mask IF and DF on entry.
        IA32_FMASK.write((1 << 9) | (1 << 10));
    }
}

/// The `syscall` instruction entry stub.
///
/// Switches to the per-CPU kernel stack, captures the user return state
/// (rip/rflags into the per-CPU slots, rsp at `gs:[16]`), reorders the
/// ABI registers into the SysV call layout, dispatches, runs the
/// pending-signal check, and `sysret`s with the result in rax.
#[unsafe(naked)]
extern "C" fn syscall_entry() {
    core::arch::naked_asm!(
        "swapgs",
        "mov gs:[16], rsp",        // user rsp
        "mov gs:[48], rcx",        // user rip
        "mov gs:[56], r11",        // user rflags
        "mov rsp, gs:[8]",         // kernel stack
        // Incoming: nr=rax, args rdi,rsi,rdx,r8,r9,r10.
        // SysV callee: (a0=rdi, a1=rsi, a2=rdx, a3=rcx, a4=r8, a5=r9,
        // nr on the stack).
        "mov rcx, r8",
        "mov r8, r9",
        "mov r9, r10",
        "push rax",                // nr (7th argument)
        "call {dispatch_shim}",
        "add rsp, 8",
        "push rax",                // preserve the return value
        "call {signal_check}",
        "pop rax",
        "mov rcx, gs:[48]",        // user rip (possibly signal handler)
        "mov r11, gs:[56]",        // user rflags
        "mov rsp, gs:[16]",        // user rsp
        "swapgs",
        "sysretq",
        dispatch_shim = sym dispatch_shim,
        signal_check = sym signal_check,
    );
}

/// Rust-side shim between the entry stub and the dispatcher.
///
/// Mirrors the captured user state into the current thread's TCB (fork
/// and signal delivery read it), dispatches, and mirrors any changes
/// (signal frames) back into the per-CPU return slots.
extern "C" fn dispatch_shim(
    a0: usize,
    a1: usize,
    a2: usize,
    a3: usize,
    a4: usize,
    a5: usize,
    nr: usize,
) -> isize {
    let percpu = crate::percpu::current_cpu();
    if let Some(td) = crate::sched::current_thread() {
        // SAFETY: The TCB user snapshot belongs to the current thread.
        let user = unsafe { &mut (*td.tcb_ptr()).user };
        user.rip = percpu.user_rip;
        user.rflags = percpu.user_rflags;
        user.rsp = percpu.user_rsp;
    }

    let result = crate::syscall::syscall_dispatch(nr, a0, a1, a2, a3, a4, a5);

    if let Some(td) = crate::sched::current_thread() {
        // SAFETY: As above; the handlers may have redirected the return.
        let user = unsafe { &mut (*td.tcb_ptr()).user };
        let percpu_mut = core::ptr::from_ref(percpu).cast_mut();
        // SAFETY: Only this CPU touches its own slots.
        unsafe {
            (*percpu_mut).user_rip = user.rip;
            (*percpu_mut).user_rflags = user.rflags;
            (*percpu_mut).user_rsp = user.rsp;
        }
    }
    result
}

/// Delivers one pending signal before returning to user mode.
extern "C" fn signal_check() {
    deliver_pending_signal();
}

/// Stages and builds the frame for one deliverable signal.
pub fn deliver_pending_signal() {
    let Some(td) = crate::sched::current_thread() else {
        return;
    };
    let Some(proc) = td.process() else {
        return;
    };
    if !td.sig_delivery.is_pending() {
        let Some(info) = proc.signals.take_deliverable(td.sigmask()) else {
            return;
        };
        let action = proc.signals.action(info.si_signo);
        match action.sa_handler {
            orion_syscall::signal::SIG_DFL => {
                match crate::proc::signal::default_action(info.si_signo) {
                    crate::proc::signal::DefaultAction::Terminate => {
                        crate::proc::exit(128 + info.si_signo);
                    }
                    _ => return,
                }
            }
            orion_syscall::signal::SIG_IGN => return,
            _ => {
                td.sig_delivery.set_pending(info);
            }
        }
    }

    // Build the user frame: trampoline return address, siginfo, saved
    // context; then point the user rip at the handler.
    // SAFETY: The TCB user snapshot belongs to the current thread.
    let user = unsafe { &mut (*td.tcb_ptr()).user };
    let saved = SavedContext {
        rip: user.rip,
        rsp: user.rsp,
        rflags: user.rflags,
        saved_mask: td.sigmask(),
    };
    if let Some(info) = td.sig_delivery.begin_delivery(saved) {
        let action = proc.signals.action(info.si_signo);
        // Handler mask + the signal itself while the handler runs.
        let _ = td.set_sigmask(saved.saved_mask | action.sa_mask
            | orion_syscall::signal::sigmask(info.si_signo));

        let mut sp = user.rsp - 128; // skip the red zone
        sp &= !0xF;
        // Push siginfo then the restorer as the return address.
        sp -= size_of::<orion_syscall::signal::SigInfo>() as u64;
        let siginfo_addr = sp;
        // SAFETY: The user stack is mapped writable in the current space.
        unsafe {
            (sp as *mut orion_syscall::signal::SigInfo).write(info);
        }
        sp -= 8;
        // SAFETY: As above.
        unsafe {
            (sp as *mut u64).write(action.sa_restorer as u64);
        }

        user.rip = action.sa_handler as u64;
        user.rsp = sp;
        // SysV: handler(signo, siginfo, ucontext).
        let _ = siginfo_addr;
    }
}

/// `sigreturn`: restores the context saved at delivery.
pub fn signal_return() {
    let Some(td) = crate::sched::current_thread() else {
        return;
    };
    if let Some(saved) = td.sig_delivery.finish_return() {
        let _ = td.set_sigmask(saved.saved_mask);
        // SAFETY: The TCB user snapshot belongs to the current thread.
        let user = unsafe { &mut (*td.tcb_ptr()).user };
        user.rip = saved.rip;
        user.rsp = saved.rsp;
        user.rflags = saved.rflags;
    }
}

/// Enters user mode at `rip`/`rsp` (first entry or fork return).
///
/// # Safety
///
/// The current address space must map the target code and stack.
pub unsafe fn enter_user(rip: u64, rsp: u64, rflags: u64, rax: u64) -> ! {
    let rflags = rflags | (1 << 9); // interrupts on in user mode
    // SAFETY: iretq with user selectors; forwarded caller contract.
    unsafe {
        core::arch::asm!(
            "push {ss}",
            "push {rsp}",
            "push {rflags}",
            "push {cs}",
            "push {rip}",
            "swapgs",
            "iretq",
            ss = in(reg) u64::from(USER_DS),
            rsp = in(reg) rsp,
            rflags = in(reg) rflags,
            cs = in(reg) u64::from(USER_CS),
            rip = in(reg) rip,
            in("rax") rax,
            options(noreturn),
        );
    }
}

/// Enters a freshly exec'd image.
pub fn enter_image(image: &crate::proc::exec::ExecImage) -> ! {
    // SAFETY: exec installed and activated the new space for this
    // process before returning the image.
    unsafe {
        super::control::Cr3::write(image.space.root_phys());
        enter_user(image.entry, image.stack_pointer, 0x202, 0)
    }
}
