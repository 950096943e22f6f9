//! Stackful coroutine primitives: actor stacks with guard canaries and the
//! register-level context switch.
//!
//! A [`CoroStack`] is one contiguous region. On unix the default source maps
//! it with `mmap` and protects the lowest page, so running off the end faults
//! instead of silently corrupting a neighbour; the fault is turned into the
//! death of that actor by [`signal`](crate::signal). Independently of the source,
//! a fixed canary pattern is painted at both ends of the usable region and
//! checked by the scheduler every time control comes back from an actor.
//!
//! [`switch`] saves the callee-saved register set of the running context and
//! restores another one. A context prepared by [`init`] starts executing
//! `entry(arg)` on its own stack the first time it is switched to.

use std::alloc::{self, Layout};
use std::fmt;
use std::io;
use std::ops::Range;
use std::ptr::NonNull;

use crate::config::{StackSource, MIN_STACK_SIZE};

// ── Canaries ────────────────────────────────────────────────────────────────

/// Pattern painted at both ends of every actor stack.
pub(crate) const CANARY: u64 = 0xC0DE_5AFE_DEAD_BEEF;
const CANARY_WORDS: usize = 32;
const CANARY_BYTES: usize = CANARY_WORDS * size_of::<u64>();

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(n).ok().filter(|n| *n > 0).unwrap_or(4096)
}

// ── CoroStack ───────────────────────────────────────────────────────────────

/// An actor stack.
///
/// Layout, low to high: optional guard page, bottom canary, usable stack,
/// top canary. The initial stack pointer sits just below the top canary.
pub struct CoroStack {
    base: NonNull<u8>,
    alloc_size: usize,
    guard_size: usize,
    source: StackSource,
}

impl CoroStack {
    /// Allocate a stack with at least `size` usable bytes.
    ///
    /// # Errors
    ///
    /// The underlying `mmap`/`mprotect` error, or `OutOfMemory` when the heap
    /// allocation fails.
    pub fn new(size: usize, source: StackSource) -> io::Result<Self> {
        let page = page_size();
        let size = size.max(MIN_STACK_SIZE).next_multiple_of(page);

        let stack = match source {
            StackSource::Mmap => {
                let alloc_size = page + size;
                // SAFETY: anonymous private mapping; `fd = -1`, `offset = 0`.
                let base = unsafe {
                    libc::mmap(
                        std::ptr::null_mut(),
                        alloc_size,
                        libc::PROT_READ | libc::PROT_WRITE,
                        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                        -1,
                        0,
                    )
                };
                if base == libc::MAP_FAILED {
                    return Err(io::Error::last_os_error());
                }
                // SAFETY: the first page lies inside the mapping just created.
                if unsafe { libc::mprotect(base, page, libc::PROT_NONE) } != 0 {
                    let err = io::Error::last_os_error();
                    // SAFETY: `base`/`alloc_size` match the mmap above.
                    unsafe { libc::munmap(base, alloc_size) };
                    return Err(err);
                }
                let Some(base) = NonNull::new(base.cast::<u8>()) else {
                    return Err(io::ErrorKind::OutOfMemory.into());
                };
                CoroStack {
                    base,
                    alloc_size,
                    guard_size: page,
                    source,
                }
            }
            StackSource::Heap => {
                let layout = Layout::from_size_align(size, 16)
                    .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
                // SAFETY: `size` is at least MIN_STACK_SIZE, so non-zero.
                let base = unsafe { alloc::alloc(layout) };
                let Some(base) = NonNull::new(base) else {
                    return Err(io::ErrorKind::OutOfMemory.into());
                };
                CoroStack {
                    base,
                    alloc_size: size,
                    guard_size: 0,
                    source,
                }
            }
        };
        stack.paint_canaries();
        Ok(stack)
    }

    /// Lowest usable address (start of the bottom canary).
    fn bottom(&self) -> *mut u64 {
        // SAFETY: `guard_size < alloc_size`.
        unsafe { self.base.as_ptr().add(self.guard_size).cast::<u64>() }
    }

    /// One past the highest usable address.
    fn top(&self) -> *mut u8 {
        // SAFETY: one-past-the-end of the allocation.
        unsafe { self.base.as_ptr().add(self.alloc_size) }
    }

    fn top_canary(&self) -> *mut u64 {
        // SAFETY: the usable region is far larger than two canaries.
        unsafe { self.top().sub(CANARY_BYTES).cast::<u64>() }
    }

    /// Initial stack pointer for a fresh context: 16-byte aligned, below the
    /// top canary.
    #[must_use]
    pub fn initial_sp(&self) -> *mut u8 {
        self.top_canary().cast::<u8>()
    }

    /// Addresses of the guard page; empty for heap stacks.
    pub(crate) fn guard_range(&self) -> Range<usize> {
        let base = self.base.as_ptr() as usize;
        base..base + self.guard_size
    }

    /// Usable bytes between the two canaries.
    #[must_use]
    pub fn usable_size(&self) -> usize {
        self.alloc_size - self.guard_size - 2 * CANARY_BYTES
    }

    fn paint_canaries(&self) {
        for region in [self.bottom(), self.top_canary()] {
            for i in 0..CANARY_WORDS {
                // SAFETY: both canary regions are inside the writable part of
                // the allocation and 8-byte aligned.
                unsafe { region.add(i).write_volatile(CANARY) };
            }
        }
    }

    /// Whether both canaries still hold the pattern.
    #[must_use]
    pub fn canaries_intact(&self) -> bool {
        [self.bottom(), self.top_canary()].iter().all(|region| {
            // SAFETY: see `paint_canaries`.
            (0..CANARY_WORDS).all(|i| unsafe { region.add(i).read_volatile() } == CANARY)
        })
    }

    /// Overwrite part of the bottom canary, as a runaway frame would.
    #[cfg(test)]
    pub(crate) fn clobber_bottom_canary(&self) {
        // SAFETY: highest word of the bottom canary, inside the allocation.
        unsafe { self.bottom().add(CANARY_WORDS - 1).write_volatile(0) };
    }
}

impl Drop for CoroStack {
    fn drop(&mut self) {
        match self.source {
            StackSource::Mmap => {
                // SAFETY: `base`/`alloc_size` describe a live mapping.
                unsafe { libc::munmap(self.base.as_ptr().cast(), self.alloc_size) };
            }
            StackSource::Heap => {
                // SAFETY: allocated in `new` with exactly this layout.
                unsafe {
                    alloc::dealloc(
                        self.base.as_ptr(),
                        Layout::from_size_align_unchecked(self.alloc_size, 16),
                    );
                }
            }
        }
    }
}

impl fmt::Debug for CoroStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoroStack")
            .field("base", &self.base)
            .field("alloc_size", &self.alloc_size)
            .field("guard_size", &self.guard_size)
            .field("source", &self.source)
            .finish()
    }
}

// ── SwitchContext ───────────────────────────────────────────────────────────

/// Entry point of a fresh context. Receives the `arg` given to [`init`].
pub(crate) type Entry = extern "C" fn(*mut u8) -> !;

/// Saved registers of a suspended context.
///
/// x86-64: `rbx, rbp, r12, r13, r14, r15, rsp, rip`.
///
/// aarch64: `x19..x28, x29 (fp), x30 (lr), sp, pc, d8..d15`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SwitchContext {
    #[cfg(target_arch = "x86_64")]
    regs: [u64; 8],
    #[cfg(target_arch = "aarch64")]
    regs: [u64; 22],
}

impl SwitchContext {
    /// A zeroed context; only valid as the `from` side of a [`switch`] until
    /// [`init`] prepares it.
    #[must_use]
    pub const fn new() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            SwitchContext { regs: [0; 8] }
        }
        #[cfg(target_arch = "aarch64")]
        {
            SwitchContext { regs: [0; 22] }
        }
    }
}

impl Default for SwitchContext {
    fn default() -> Self {
        Self::new()
    }
}

// ── Context switch: x86-64 ──────────────────────────────────────────────────

/// Save the running context into `from` and resume `to`.
///
/// Returns when some other context switches back to `from`. A context that
/// has never run starts at its entry with `arg` (kept in `r12`) in `rdi`.
///
/// # Safety
///
/// * `from` must be valid for writes and `to` for reads.
/// * `to` must have been filled by [`init`] or by an earlier `switch`, and
///   the stack it refers to must still be mapped.
#[cfg(target_arch = "x86_64")]
#[inline(never)]
pub(crate) unsafe fn switch(from: *mut SwitchContext, to: *const SwitchContext) {
    // SAFETY: caller guarantees both pointers. Operands are pinned to rdx and
    // rsi so that restoring r12..r15 cannot overwrite them before the last
    // load. Every caller-saved register is declared clobbered via clobber_abi.
    unsafe {
        std::arch::asm!(
            "mov [rdx + 0*8], rbx",
            "mov [rdx + 1*8], rbp",
            "mov [rdx + 2*8], r12",
            "mov [rdx + 3*8], r13",
            "mov [rdx + 4*8], r14",
            "mov [rdx + 5*8], r15",
            "mov [rdx + 6*8], rsp",
            "lea rax, [rip + 2f]",
            "mov [rdx + 7*8], rax",
            "mov rbx, [rsi + 0*8]",
            "mov rbp, [rsi + 1*8]",
            "mov r12, [rsi + 2*8]",
            "mov r13, [rsi + 3*8]",
            "mov r14, [rsi + 4*8]",
            "mov r15, [rsi + 5*8]",
            "mov rsp, [rsi + 6*8]",
            "mov rdi, r12",
            "jmp qword ptr [rsi + 7*8]",
            "2:",
            in("rdx") from,
            in("rsi") to,
            clobber_abi("C"),
        );
    }
}

/// Prepare `ctx` so the first [`switch`] into it calls `entry(arg)` on the
/// stack ending at `stack_top`.
///
/// # Safety
///
/// * `ctx` must be valid for writes.
/// * `stack_top` must be the top of a writable stack with room for at least
///   one frame.
#[cfg(target_arch = "x86_64")]
pub(crate) unsafe fn init(ctx: *mut SwitchContext, stack_top: *mut u8, entry: Entry, arg: *mut u8) {
    // Entry is reached by `jmp`, so make the stack look as if a `call` had
    // just pushed a (null) return address: rsp ≡ 8 (mod 16).
    let sp = ((stack_top as usize) & !15) - 8;
    // SAFETY: `sp` lies 8..24 bytes below `stack_top`, inside the stack.
    unsafe {
        (sp as *mut u64).write(0);
        let regs = &mut (*ctx).regs;
        *regs = [0; 8];
        regs[2] = arg as u64;
        regs[6] = sp as u64;
        regs[7] = entry as usize as u64;
    }
}

// ── Context switch: aarch64 ─────────────────────────────────────────────────

/// Save the running context into `from` and resume `to`.
///
/// Returns when some other context switches back to `from`. A context that
/// has never run starts at its entry with `arg` (kept in `x19`) in `x0`.
///
/// # Safety
///
/// * `from` must be valid for writes and `to` for reads.
/// * `to` must have been filled by [`init`] or by an earlier `switch`, and
///   the stack it refers to must still be mapped.
#[cfg(target_arch = "aarch64")]
#[inline(never)]
pub(crate) unsafe fn switch(from: *mut SwitchContext, to: *const SwitchContext) {
    // SAFETY: caller guarantees both pointers. Operands are pinned to x1/x2,
    // outside the restored set; d8..d15 are callee-saved under AAPCS64 and
    // are saved alongside the general registers.
    unsafe {
        std::arch::asm!(
            "stp x19, x20, [x1, #0]",
            "stp x21, x22, [x1, #16]",
            "stp x23, x24, [x1, #32]",
            "stp x25, x26, [x1, #48]",
            "stp x27, x28, [x1, #64]",
            "stp x29, x30, [x1, #80]",
            "mov x9, sp",
            "str x9, [x1, #96]",
            "adr x9, 2f",
            "str x9, [x1, #104]",
            "stp d8, d9, [x1, #112]",
            "stp d10, d11, [x1, #128]",
            "stp d12, d13, [x1, #144]",
            "stp d14, d15, [x1, #160]",
            "ldp x19, x20, [x2, #0]",
            "ldp x21, x22, [x2, #16]",
            "ldp x23, x24, [x2, #32]",
            "ldp x25, x26, [x2, #48]",
            "ldp x27, x28, [x2, #64]",
            "ldp x29, x30, [x2, #80]",
            "ldp d8, d9, [x2, #112]",
            "ldp d10, d11, [x2, #128]",
            "ldp d12, d13, [x2, #144]",
            "ldp d14, d15, [x2, #160]",
            "ldr x9, [x2, #96]",
            "mov sp, x9",
            "ldr x9, [x2, #104]",
            "mov x0, x19",
            "br x9",
            "2:",
            in("x1") from,
            in("x2") to,
            clobber_abi("C"),
        );
    }
}

/// Prepare `ctx` so the first [`switch`] into it calls `entry(arg)` on the
/// stack ending at `stack_top`.
///
/// # Safety
///
/// * `ctx` must be valid for writes.
/// * `stack_top` must be the top of a writable stack with room for at least
///   one frame.
#[cfg(target_arch = "aarch64")]
pub(crate) unsafe fn init(ctx: *mut SwitchContext, stack_top: *mut u8, entry: Entry, arg: *mut u8) {
    let sp = (stack_top as usize) & !15;
    // SAFETY: caller guarantees `ctx`.
    unsafe {
        let regs = &mut (*ctx).regs;
        *regs = [0; 22];
        regs[0] = arg as u64;
        regs[12] = sp as u64;
        regs[13] = entry as usize as u64;
    }
}
