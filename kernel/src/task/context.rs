//! Low-level context switching.
//!
//! `switch_context` saves the executing task's register file (GPRs,
//! rflags, rsp, FX state) into its snapshot and loads the next task's.
//! The load ends in `retq` on the freshly loaded rsp: for a task that
//! previously switched away that pops the return address back into its
//! caller, for a brand-new task it pops the first word of the start
//! trampoline.

use core::arch::global_asm;

/// 512-byte FXSAVE area, 16-byte aligned as the instruction requires.
#[repr(C, align(16))]
pub struct FxArea(pub [u8; 512]);

impl FxArea {
    /// FX state for a task that has never run: default FPU control word
    /// and the architectural MXCSR default masked to what the CPU
    /// actually supports.
    pub fn primed(mxcsr_mask: u32) -> Self {
        let mut area = FxArea([0; 512]);
        // FCW at offset 0.
        area.0[0..2].copy_from_slice(&0x037Fu16.to_le_bytes());
        // MXCSR at offset 24.
        let mxcsr = 0x1F80u32 & mxcsr_mask;
        area.0[24..28].copy_from_slice(&mxcsr.to_le_bytes());
        area
    }

    /// MXCSR_MASK field of an FXSAVE image (offset 28; 0 means 0xFFBF).
    pub fn mxcsr_mask(&self) -> u32 {
        let raw = u32::from_le_bytes(self.0[28..32].try_into().unwrap());
        if raw == 0 {
            0xFFBF
        } else {
            raw
        }
    }
}

/// Register snapshot of a task. Field order is ABI for the assembly
/// below; the offset assertions keep it honest.
#[derive(Debug)]
#[repr(C)]
pub struct TaskContext {
    pub rax: u64, // 0x00
    pub rbx: u64, // 0x08
    pub rcx: u64, // 0x10
    pub rdx: u64, // 0x18
    pub r8: u64,  // 0x20
    pub r9: u64,  // 0x28
    pub r10: u64, // 0x30
    pub r11: u64, // 0x38
    pub r12: u64, // 0x40
    pub r13: u64, // 0x48
    pub r14: u64, // 0x50
    pub r15: u64, // 0x58
    pub rdi: u64, // 0x60
    pub rsi: u64, // 0x68
    pub rbp: u64, // 0x70
    pub rsp: u64, // 0x78
    pub rflags: u64, // 0x80
    /// Pointer to the task's FX save area.
    pub fx_area: u64, // 0x88
}

const _: () = {
    assert!(core::mem::offset_of!(TaskContext, rax) == 0x00);
    assert!(core::mem::offset_of!(TaskContext, r12) == 0x40);
    assert!(core::mem::offset_of!(TaskContext, rdi) == 0x60);
    assert!(core::mem::offset_of!(TaskContext, rsp) == 0x78);
    assert!(core::mem::offset_of!(TaskContext, rflags) == 0x80);
    assert!(core::mem::offset_of!(TaskContext, fx_area) == 0x88);
};

impl TaskContext {
    pub fn zeroed(fx_area: *const FxArea) -> Self {
        Self {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rdi: 0,
            rsi: 0,
            rbp: 0,
            rsp: 0,
            // IF set plus the always-one bit.
            rflags: 0x202,
            fx_area: fx_area as u64,
        }
    }
}

#[cfg(target_arch = "x86_64")]
global_asm!(
    r#"
.global switch_context

// switch_context(old: *mut TaskContext, new: *const TaskContext)
// RDI = old, RSI = new.
switch_context:
    // Save general purpose registers.
    mov [rdi + 0x00], rax
    mov [rdi + 0x08], rbx
    mov [rdi + 0x10], rcx
    mov [rdi + 0x18], rdx
    mov [rdi + 0x20], r8
    mov [rdi + 0x28], r9
    mov [rdi + 0x30], r10
    mov [rdi + 0x38], r11
    mov [rdi + 0x40], r12
    mov [rdi + 0x48], r13
    mov [rdi + 0x50], r14
    mov [rdi + 0x58], r15
    mov [rdi + 0x60], rdi
    mov [rdi + 0x68], rsi
    mov [rdi + 0x70], rbp

    // FX state through the snapshot's area pointer.
    mov rax, [rdi + 0x88]
    fxsave [rax]

    // RFLAGS.
    pushfq
    pop rax
    mov [rdi + 0x80], rax

    // RSP with the return address still on top: reloading this context
    // resumes at our caller.
    mov [rdi + 0x78], rsp

    // ---- load the next context ----
    mov rax, [rsi + 0x88]
    fxrstor [rax]

    push qword ptr [rsi + 0x80]
    popfq

    mov rax, [rsi + 0x00]
    mov rbx, [rsi + 0x08]
    mov rcx, [rsi + 0x10]
    mov rdx, [rsi + 0x18]
    mov r8,  [rsi + 0x20]
    mov r9,  [rsi + 0x28]
    mov r10, [rsi + 0x30]
    mov r11, [rsi + 0x38]
    mov r12, [rsi + 0x40]
    mov r13, [rsi + 0x48]
    mov r14, [rsi + 0x50]
    mov r15, [rsi + 0x58]
    mov rbp, [rsi + 0x70]
    mov rsp, [rsi + 0x78]
    mov rdi, [rsi + 0x60]
    mov rsi, [rsi + 0x68]

    ret
"#
);

extern "C" {
    /// Swap register state: save into `old`, load from `new`. Returns
    /// only when `old` is switched back in.
    pub fn switch_context(old: *mut TaskContext, new: *const TaskContext);
}

/// Read MXCSR_MASK from a live FXSAVE image of the executing CPU.
#[cfg(all(target_arch = "x86_64", not(test)))]
pub fn read_mxcsr_mask() -> u32 {
    let mut area = FxArea([0; 512]);
    unsafe {
        core::arch::asm!(
            "fxsave [{}]",
            in(reg) area.0.as_mut_ptr(),
            options(nostack)
        );
    }
    area.mxcsr_mask()
}

#[cfg(any(not(target_arch = "x86_64"), test))]
pub fn read_mxcsr_mask() -> u32 {
    0xFFBF
}

/// Drop the VMCS at `pa` from the active state. Logs on failure; a guest
/// task whose VMCS cannot be cleared must not be suspended silently.
#[cfg(all(target_arch = "x86_64", not(test)))]
pub unsafe fn vmclear(pa: u64) -> Result<(), ()> {
    let ok: u8;
    core::arch::asm!(
        "vmclear [{addr}]",
        "setna {ok}",
        addr = in(reg) &pa,
        ok = out(reg_byte) ok,
    );
    if ok == 0 {
        Ok(())
    } else {
        Err(())
    }
}

/// Make the VMCS at `pa` current before resuming its host task.
#[cfg(all(target_arch = "x86_64", not(test)))]
pub unsafe fn vmptrld(pa: u64) -> Result<(), ()> {
    let ok: u8;
    core::arch::asm!(
        "vmptrld [{addr}]",
        "setna {ok}",
        addr = in(reg) &pa,
        ok = out(reg_byte) ok,
    );
    if ok == 0 {
        Ok(())
    } else {
        Err(())
    }
}

#[cfg(any(not(target_arch = "x86_64"), test))]
pub unsafe fn vmclear(_pa: u64) -> Result<(), ()> {
    Ok(())
}

#[cfg(any(not(target_arch = "x86_64"), test))]
pub unsafe fn vmptrld(_pa: u64) -> Result<(), ()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primed_fx_area_has_default_control_words() {
        let fx = FxArea::primed(0xFFBF);
        assert_eq!(u16::from_le_bytes(fx.0[0..2].try_into().unwrap()), 0x037F);
        assert_eq!(
            u32::from_le_bytes(fx.0[24..28].try_into().unwrap()),
            0x1F80 & 0xFFBF
        );
    }

    #[test]
    fn zeroed_context_enables_interrupts() {
        let fx = FxArea::primed(0xFFBF);
        let ctx = TaskContext::zeroed(&fx);
        assert_eq!(ctx.rflags, 0x202);
        assert_eq!(ctx.fx_area, &fx as *const _ as u64);
    }
}
