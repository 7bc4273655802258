// Architecture Fault-Capturing Access
//
// Provides the one piece of the memory subsystem that cannot be written in
// portable Rust: a single-byte load or store to a user address that is
// allowed to fault, where the fault is turned into a sentinel value instead
// of a kernel crash.
//
// Mechanism (x86_64, bare metal):
// - `atom_uaccess_load` / `atom_uaccess_store` are tiny assembly routines
//   whose user access is exactly one `mov`, at an exported label
// - The exception table pairs each of those instruction addresses with a
//   fixup address inside the same routine
// - If that `mov` faults, the page-fault handler calls
//   `recover_user_access_fault`, which finds the faulting RIP in the table,
//   moves RIP to the fixup, and stores -1 in RAX
// - The routine returns -1 and the caller reports the address as invalid
//
// Page-fault handler contract:
//
//     if arch::recover_user_access_fault(error_code, &mut frame.rip, &mut frame.rax) {
//         return;
//     }
//
// must run before the fail-stop path, for kernel-mode faults only.
//
// Correctness and safety notes:
// - Recovery is decided by the faulting instruction alone; there is no
//   shared "access in progress" state, so preempted and interleaved accesses
//   on different threads cannot disarm each other
// - A kernel-mode fault anywhere else is never redirected
// - A user-mode fault (error code bit 2) is never redirected
// - Only `ExceptionFixup` is architecture specific; the rest of the memory
//   subsystem sees the `FaultingAccess` trait

/// Page-fault error code bit: the access originated in user mode.
const PF_USER: u64 = 1 << 2;

/// Value left in RAX by a recovered access.
pub const ACCESS_FAULTED: u64 = u64::MAX;

/// One exception-table entry: a fault at `insn` resumes at `fixup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixupEntry {
    pub insn: u64,
    pub fixup: u64,
}

fn apply_fixup(table: &[FixupEntry], error_code: u64, rip: &mut u64, rax: &mut u64) -> bool {
    if error_code & PF_USER != 0 {
        return false;
    }

    match table.iter().find(|entry| entry.insn == *rip) {
        Some(entry) => {
            *rip = entry.fixup;
            *rax = ACCESS_FAULTED;
            true
        }
        None => false,
    }
}

/// Redirects a kernel-mode fault raised by one of the user-access routines.
///
/// Returns `true` when the fault was consumed and the handler must return to
/// the (rewritten) interrupted context.
pub fn recover_user_access_fault(error_code: u64, rip: &mut u64, rax: &mut u64) -> bool {
    apply_fixup(&exception_table(), error_code, rip, rax)
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
core::arch::global_asm!(
    ".pushsection .text.atom_uaccess, \"ax\", @progbits",
    // u64 atom_uaccess_load(usize addr): byte in RAX, or -1 after a fault.
    ".global atom_uaccess_load",
    ".global atom_uaccess_load_insn",
    ".global atom_uaccess_load_fixup",
    "atom_uaccess_load:",
    "atom_uaccess_load_insn:",
    "    movzx eax, byte ptr [rdi]",
    "atom_uaccess_load_fixup:",
    "    ret",
    // u64 atom_uaccess_store(usize addr, u8 value): 0, or -1 after a fault.
    ".global atom_uaccess_store",
    ".global atom_uaccess_store_insn",
    ".global atom_uaccess_store_fixup",
    "atom_uaccess_store:",
    "    xor eax, eax",
    "atom_uaccess_store_insn:",
    "    mov byte ptr [rdi], sil",
    "atom_uaccess_store_fixup:",
    "    ret",
    ".popsection",
);

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
extern "C" {
    fn atom_uaccess_load(addr: usize) -> u64;
    fn atom_uaccess_store(addr: usize, value: u8) -> u64;

    static atom_uaccess_load_insn: u8;
    static atom_uaccess_load_fixup: u8;
    static atom_uaccess_store_insn: u8;
    static atom_uaccess_store_fixup: u8;
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn exception_table() -> [FixupEntry; 2] {
    // SAFETY: only the addresses of the labels are taken, never their contents.
    unsafe {
        [
            FixupEntry {
                insn: core::ptr::addr_of!(atom_uaccess_load_insn) as u64,
                fixup: core::ptr::addr_of!(atom_uaccess_load_fixup) as u64,
            },
            FixupEntry {
                insn: core::ptr::addr_of!(atom_uaccess_store_insn) as u64,
                fixup: core::ptr::addr_of!(atom_uaccess_store_fixup) as u64,
            },
        ]
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn exception_table() -> [FixupEntry; 0] {
    []
}

/// Fault-capable user access through the exception table above.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub struct ExceptionFixup;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
unsafe impl crate::mm::uaccess::FaultingAccess for ExceptionFixup {
    fn load(&self, addr: usize) -> Option<u8> {
        // SAFETY: a fault on the single user access is recovered through the
        // exception table; nothing else in the routine touches memory.
        let result = unsafe { atom_uaccess_load(addr) };
        if result == ACCESS_FAULTED {
            None
        } else {
            Some(result as u8)
        }
    }

    fn store(&self, addr: usize, value: u8) -> bool {
        // SAFETY: as for `load`.
        unsafe { atom_uaccess_store(addr, value) != ACCESS_FAULTED }
    }
}
