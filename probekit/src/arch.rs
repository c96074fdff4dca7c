//! Host architecture tables.
//!
//! `bpf(2)` and `perf_event_open(2)` have no libc wrapper, so their
//! numbers are carried here per ISA and invoked through the raw
//! `syscall()` trampoline. Every other kernel entry point this crate
//! touches goes through libc's named wrappers, which do the same
//! per-ISA dispatch internally.
//!
//! The table also knows where kprobe argument registers live inside
//! `pt_regs`, which bytecode needs when reading probed-function
//! arguments off the context pointer.

use once_cell::sync::Lazy;

use crate::error::{Error, Result};

/// The ISAs the syscall table covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isa {
    X86_64,
    Aarch64,
    S390x,
    Powerpc64,
    Riscv64,
}

/// Per-ISA syscall numbers, resolved once per process.
#[derive(Debug, Clone, Copy)]
pub struct SyscallTable {
    pub isa: Isa,
    pub bpf: libc::c_long,
    pub perf_event_open: libc::c_long,
}

static HOST: Lazy<std::result::Result<SyscallTable, String>> = Lazy::new(|| {
    let arch = std::env::consts::ARCH;
    let table = match arch {
        "x86_64" => SyscallTable {
            isa: Isa::X86_64,
            bpf: 321,
            perf_event_open: 298,
        },
        "aarch64" => SyscallTable {
            isa: Isa::Aarch64,
            bpf: 280,
            perf_event_open: 241,
        },
        "s390x" => SyscallTable {
            isa: Isa::S390x,
            bpf: 351,
            perf_event_open: 331,
        },
        "powerpc64" => SyscallTable {
            isa: Isa::Powerpc64,
            bpf: 361,
            perf_event_open: 319,
        },
        "riscv64" => SyscallTable {
            isa: Isa::Riscv64,
            bpf: 280,
            perf_event_open: 241,
        },
        other => return Err(other.to_string()),
    };
    Ok(table)
});

/// The host's syscall table, or `UnsupportedArch` for ISAs outside it.
pub fn host() -> Result<&'static SyscallTable> {
    HOST.as_ref().map_err(|arch| Error::UnsupportedArch {
        arch: arch.clone(),
    })
}

/// Byte offset of the i-th function argument register within `pt_regs`.
///
/// Kprobe programs receive a `*pt_regs` context; bytecode that wants the
/// probed function's arguments loads from these offsets. Calling
/// conventions cap usable arguments well below what the struct holds, so
/// indices past the convention's register file are an error.
pub fn kprobe_arg_offset(index: usize) -> Result<i16> {
    let table = host()?;
    let offset = match table.isa {
        // rdi, rsi, rdx, rcx, r8, r9 inside the x86_64 pt_regs layout.
        Isa::X86_64 => match index {
            0 => 112, // rdi
            1 => 104, // rsi
            2 => 96,  // rdx
            3 => 88,  // rcx
            4 => 72,  // r8
            5 => 64,  // r9
            _ => return Err(arg_index_error(index)),
        },
        // regs[0..7] are x0..x7 at the front of the struct.
        Isa::Aarch64 => {
            if index > 7 {
                return Err(arg_index_error(index));
            }
            (index * 8) as i16
        }
        // psw (16 bytes) then gprs[16]; arguments in r2..r6.
        Isa::S390x => {
            if index > 4 {
                return Err(arg_index_error(index));
            }
            (16 + (2 + index) * 8) as i16
        }
        // gpr[0..31] at the front; arguments in r3..r10.
        Isa::Powerpc64 => {
            if index > 7 {
                return Err(arg_index_error(index));
            }
            ((3 + index) * 8) as i16
        }
        // epc, ra, sp, gp, tp, t0-t2, s0, s1, then a0..a7.
        Isa::Riscv64 => {
            if index > 7 {
                return Err(arg_index_error(index));
            }
            (80 + index * 8) as i16
        }
    };
    Ok(offset)
}

fn arg_index_error(index: usize) -> Error {
    Error::shape(format!(
        "kprobe argument index {index} exceeds the calling convention"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_table_resolves_on_supported_targets() {
        // The test suite only runs on ISAs we support, so this must work.
        let table = host().unwrap();
        assert!(table.bpf > 0);
        assert!(table.perf_event_open > 0);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn x86_64_arg_registers() {
        assert_eq!(kprobe_arg_offset(0).unwrap(), 112);
        assert_eq!(kprobe_arg_offset(5).unwrap(), 64);
        assert!(kprobe_arg_offset(6).is_err());
    }
}
