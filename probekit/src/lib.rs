//! probekit: a userspace eBPF loader.
//!
//! The crate covers the kernel-boundary path end to end: assemble
//! bytecode with [`insn::Asm`], optionally patch CO-RE sites against the
//! running kernel's [`btf::Btf`] with [`relocate::Relocator`], load the
//! result as a [`progs::Program`], attach it to a hook, feed it from
//! [`maps`], and drain its ring buffer with [`events::RingConsumer`].
//!
//! ```no_run
//! use probekit::consts::ProgramType;
//! use probekit::insn::{Asm, Reg};
//! use probekit::progs::{LoadOptions, Program};
//!
//! # fn main() -> probekit::Result<()> {
//! let mut asm = Asm::new();
//! asm.mov64(Reg::R0, 0).exit();
//!
//! let mut prog = Program::load(
//!     ProgramType::Kprobe,
//!     &asm.assemble(),
//!     "GPL",
//!     LoadOptions::default(),
//! )?;
//! prog.attach_kprobe("do_nanosleep")?;
//! prog.close()?;
//! # Ok(())
//! # }
//! ```

pub mod arch;
pub mod btf;
pub mod consts;
pub mod error;
pub mod events;
pub mod insn;
pub mod maps;
pub mod netlink;
pub mod progs;
pub mod relocate;
pub mod sys;
mod util;

pub use error::{Error, Result};
pub use events::{RingBuffer, RingConsumer};
pub use insn::{Asm, Reg};
pub use maps::{Map, MapSpec, TailCallChain, TypedMap, UpdateFlags};
pub use netlink::XdpFlags;
pub use progs::{LoadOptions, Program};
pub use relocate::Relocator;
