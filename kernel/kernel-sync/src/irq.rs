//! Interrupt-flag save/disable/restore.

/// Disables hardware interrupts (`cli`).
///
/// # Safety & Privilege
///
/// Must only be called in contexts where `cli` is permitted (CPL0).
#[inline]
pub fn cli_stop_interrupts() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack, preserves_flags));
    }
}

/// Enables hardware interrupts (`sti`).
///
/// # Safety & Privilege
///
/// Must only be called in contexts where `sti` is permitted (CPL0).
#[inline]
pub fn sti_enable_interrupts() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
    }
}

/// Returns the current `RFLAGS` value (via `pushfq/pop`).
///
/// Bit 9 (`IF`) indicates whether interrupts are enabled.
#[inline]
#[must_use]
pub fn rflags() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        let r: u64;
        unsafe {
            core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags));
        }
        r
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        0
    }
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `IrqGuard::new()` snapshots the `IF` bit (bit 9 of `RFLAGS`). If interrupts
/// were enabled, it executes `cli`. On drop, it executes `sti` **only** if
/// they were previously enabled, preserving the original state. Guards nest
/// correctly for the same reason.
///
/// # Platform / Privilege
///
/// Requires `x86_64` and a privileged context permitting `cli`/`sti`.
pub struct IrqGuard {
    /// Whether interrupts were enabled (IF=1) when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    /// Disables interrupts if they are currently enabled and remembers the
    /// state.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = (rflags() & (1 << 9)) != 0;
        if enabled {
            cli_stop_interrupts();
        }
        Self {
            were_enabled: enabled,
        }
    }
}

impl Drop for IrqGuard {
    /// Restores interrupts (`sti`) only if they were previously enabled.
    fn drop(&mut self) {
        if self.were_enabled {
            sti_enable_interrupts();
        }
    }
}
