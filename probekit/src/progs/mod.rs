//! Program lifecycle: load, attach, detach, close.
//!
//! A [`Program`] owns its kernel FD and every [`Attachment`] hanging off
//! it. Attach operations follow a fixed per-hook protocol; any failure
//! mid-attach unwinds the FDs and tracefs entries already created, so a
//! failed attach is invisible afterwards. Closing a program detaches in
//! reverse attach order before the FD goes.

pub mod attach;
pub mod tracefs;

use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use bitflags::bitflags;

pub use attach::{Attachment, NetnsHook, TraceKind};
pub use tracefs::{read_trace_pipe, ProbeKind};

use crate::btf::Btf;
use crate::consts::{AttachType, ProgramType};
use crate::error::{Error, Result};
use crate::netlink::{self, XdpFlags};
use crate::sys;

/// The verifier log buffer handed to every load. Big enough that even
/// pathological verifier transcripts arrive whole.
const VERIFIER_LOG_CAPACITY: usize = 16 * 1024 * 1024;

const NAME_MAX: usize = 15;

bitflags! {
    /// Cgroup attach behavior.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CgroupAttachFlags: u32 {
        const ALLOW_OVERRIDE = 1;
        const ALLOW_MULTI = 2;
        const REPLACE = 4;
    }
}

/// Knobs for [`Program::load`] beyond the required type/bytecode/license.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Object name, at most 15 bytes of `[A-Za-z0-9_]`.
    pub name: Option<String>,
    /// Verifier verbosity; the log is captured whenever loading fails
    /// regardless, and kept on success when this is non-zero.
    pub log_level: u32,
    pub expected_attach_type: Option<AttachType>,
    /// BTF id of the traced function, required for fentry/fexit.
    pub attach_btf_id: u32,
    /// `None` fills in the running kernel's version, which ancient
    /// kernels require for kprobe programs. `Some(0)` omits it.
    pub kern_version: Option<u32>,
    pub prog_flags: u32,
}

/// The running kernel's release string, as uname reports it.
pub fn kernel_release() -> String {
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return "unknown".to_string();
    }
    unsafe { std::ffi::CStr::from_ptr(uts.release.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

/// The running kernel's version in KERNEL_VERSION() encoding.
pub fn kernel_version() -> Result<u32> {
    let release = kernel_release();
    parse_kernel_version(&release)
        .ok_or_else(|| Error::shape(format!("unparseable kernel release {release:?}")))
}

fn parse_kernel_version(release: &str) -> Option<u32> {
    let mut parts = release.split(|c: char| !c.is_ascii_digit());
    let major: u32 = parts.next()?.parse().ok()?;
    let minor: u32 = parts.next()?.parse().ok()?;
    let patch: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    Some((major << 16) | (minor << 8) | patch.min(255))
}

/// A loaded eBPF program.
#[derive(Debug)]
pub struct Program {
    fd: OwnedFd,
    prog_type: ProgramType,
    name: Option<String>,
    insn_count: u32,
    license: String,
    verifier_log: String,
    attachments: Vec<Attachment>,
}

impl Program {
    /// Push bytecode through the verifier.
    ///
    /// On rejection the error carries the verifier's full transcript;
    /// that text, not the errno, is what explains the failure.
    pub fn load(
        prog_type: ProgramType,
        bytecode: &[u8],
        license: &str,
        opts: LoadOptions,
    ) -> Result<Program> {
        if let Some(name) = opts.name.as_deref() {
            if name.len() > NAME_MAX || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
            {
                return Err(Error::shape(format!(
                    "program name {name:?} exceeds {NAME_MAX} bytes or holds non-word characters"
                )));
            }
        }
        let kern_version = match opts.kern_version {
            Some(v) => v,
            None => kernel_version().unwrap_or(0),
        };

        let mut log_buf = vec![0u8; VERIFIER_LOG_CAPACITY];
        let result = sys::prog_load(&mut sys::ProgLoadArgs {
            prog_type,
            insns: bytecode,
            license,
            log_level: opts.log_level.max(1),
            log_buf: &mut log_buf,
            kern_version,
            prog_flags: opts.prog_flags,
            name: opts.name.as_deref(),
            expected_attach_type: opts.expected_attach_type,
            prog_btf_fd: 0,
            attach_btf_id: opts.attach_btf_id,
        });

        let log_end = log_buf.iter().position(|b| *b == 0).unwrap_or(0);
        let verifier_log = String::from_utf8_lossy(&log_buf[..log_end]).into_owned();

        let fd = match result {
            Ok(fd) => fd,
            Err(e) => {
                return if verifier_log.is_empty() {
                    Err(e)
                } else {
                    Err(Error::VerifierRejected { log: verifier_log })
                };
            }
        };

        let insn_count = (bytecode.len() / 8) as u32;
        log::debug!(
            "loaded {:?} program {:?}: {} instructions",
            prog_type,
            opts.name.as_deref().unwrap_or("<anon>"),
            insn_count
        );
        Ok(Program {
            fd,
            prog_type,
            name: opts.name,
            insn_count,
            license: license.to_string(),
            verifier_log: if opts.log_level > 0 {
                verifier_log
            } else {
                String::new()
            },
            attachments: Vec::new(),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn prog_type(&self) -> ProgramType {
        self.prog_type
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn insn_count(&self) -> u32 {
        self.insn_count
    }

    pub fn license(&self) -> &str {
        &self.license
    }

    /// The verifier transcript retained from load, empty unless a
    /// non-zero log level asked for it.
    pub fn verifier_log(&self) -> &str {
        &self.verifier_log
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    // -- tracefs-driven probes ----------------------------------------------

    pub fn attach_kprobe(&mut self, function: &str) -> Result<()> {
        self.attach_probe(ProbeKind::Kprobe, function, function.to_string())
    }

    pub fn attach_kretprobe(&mut self, function: &str) -> Result<()> {
        self.attach_probe(ProbeKind::Kretprobe, function, function.to_string())
    }

    /// `target` is either an offset (decimal or 0x-hex) within the
    /// binary, or a symbol name passed through verbatim.
    pub fn attach_uprobe(&mut self, binary: &str, target: &str) -> Result<()> {
        let spec = uprobe_spec(binary, target);
        self.attach_probe(ProbeKind::Uprobe, &format!("{binary}:{target}"), spec)
    }

    pub fn attach_uretprobe(&mut self, binary: &str, target: &str) -> Result<()> {
        let spec = uprobe_spec(binary, target);
        self.attach_probe(ProbeKind::Uretprobe, &format!("{binary}:{target}"), spec)
    }

    /// Shared kprobe/uprobe protocol: create the tracefs event, read its
    /// id, open a perf event on it, wire the program in, enable. The
    /// guard removes the event again on any failure past creation.
    fn attach_probe(&mut self, kind: ProbeKind, target: &str, probe_spec: String) -> Result<()> {
        let event_name = tracefs::unique_event_name(kind, target);
        tracefs::create_event(kind, &event_name, &probe_spec)?;
        let mut guard = tracefs::EventGuard::new(kind, event_name.clone());

        let tracepoint_id = tracefs::probe_event_id(kind, &event_name)?;
        let perf_fd = sys::perf_event_open_tracepoint(tracepoint_id, -1, 0)?;
        sys::perf_event_set_bpf(perf_fd.as_raw_fd(), self.fd())?;
        sys::perf_event_enable(perf_fd.as_raw_fd())?;

        guard.disarm();
        log::debug!("attached {kind} to {target} as {event_name}");
        self.attachments.push(Attachment::Probe {
            kind,
            target: target.to_string(),
            event_name,
            perf_fd,
        });
        Ok(())
    }

    pub fn attach_tracepoint(&mut self, category: &str, name: &str) -> Result<()> {
        let tracepoint_id = tracefs::tracepoint_id(category, name)?;
        let perf_fd = sys::perf_event_open_tracepoint(tracepoint_id, -1, 0)?;
        sys::perf_event_set_bpf(perf_fd.as_raw_fd(), self.fd())?;
        sys::perf_event_enable(perf_fd.as_raw_fd())?;
        self.attachments.push(Attachment::Tracepoint {
            category: category.to_string(),
            name: name.to_string(),
            perf_fd,
        });
        Ok(())
    }

    // -- link-based hooks ----------------------------------------------------

    pub fn attach_raw_tracepoint(&mut self, name: &str) -> Result<()> {
        let link_fd = sys::raw_tracepoint_open(name, self.fd())?;
        self.attachments.push(Attachment::RawTracepoint {
            name: name.to_string(),
            link_fd,
        });
        Ok(())
    }

    /// Requires a program loaded with type tracing and an
    /// `attach_btf_id` naming the traced function.
    pub fn attach_fentry(&mut self) -> Result<()> {
        self.attach_trace(TraceKind::Fentry)
    }

    pub fn attach_fexit(&mut self) -> Result<()> {
        self.attach_trace(TraceKind::Fexit)
    }

    fn attach_trace(&mut self, kind: TraceKind) -> Result<()> {
        if self.prog_type != ProgramType::Tracing {
            return Err(Error::shape(format!(
                "fentry/fexit need a tracing-type program, this one is {:?}",
                self.prog_type
            )));
        }
        let attach_type = match kind {
            TraceKind::Fentry => AttachType::TraceFentry,
            TraceKind::Fexit => AttachType::TraceFexit,
        };
        let link_fd = sys::link_create(self.fd(), 0, attach_type)?;
        self.attachments.push(Attachment::Trace { kind, link_fd });
        Ok(())
    }

    /// One link covering many kernel functions at once.
    pub fn attach_kprobe_multi(&mut self, symbols: &[&str], retprobe: bool) -> Result<()> {
        let c_syms: Vec<CString> = symbols
            .iter()
            .map(|s| {
                CString::new(*s).map_err(|_| Error::shape("symbol contains an interior NUL"))
            })
            .collect::<Result<_>>()?;
        let ptrs: Vec<*const libc::c_char> = c_syms.iter().map(|c| c.as_ptr()).collect();
        let link_fd = sys::link_create_kprobe_multi(self.fd(), &ptrs, retprobe)?;
        self.attachments.push(Attachment::KprobeMulti {
            symbol_count: symbols.len(),
            retprobe,
            link_fd,
        });
        Ok(())
    }

    // -- XDP ----------------------------------------------------------------

    pub fn attach_xdp(&mut self, ifindex: i32, flags: XdpFlags) -> Result<()> {
        netlink::attach_xdp(ifindex, self.fd(), flags)?;
        self.attachments.push(Attachment::Xdp { ifindex, flags });
        Ok(())
    }

    // -- socket programs ------------------------------------------------------

    /// Attach an sk_skb parser to a sockmap/sockhash. The map must
    /// outlive the attachment.
    pub fn attach_sk_skb_stream_parser(&mut self, sock_map_fd: RawFd) -> Result<()> {
        self.attach_to_map(sock_map_fd, AttachType::SkSkbStreamParser)
    }

    pub fn attach_sk_skb_stream_verdict(&mut self, sock_map_fd: RawFd) -> Result<()> {
        self.attach_to_map(sock_map_fd, AttachType::SkSkbStreamVerdict)
    }

    pub fn attach_sk_msg(&mut self, sock_map_fd: RawFd) -> Result<()> {
        self.attach_to_map(sock_map_fd, AttachType::SkMsgVerdict)
    }

    fn attach_to_map(&mut self, map_fd: RawFd, attach_type: AttachType) -> Result<()> {
        sys::prog_attach(map_fd, self.fd(), attach_type, 0, None)?;
        self.attachments.push(Attachment::SockMap {
            map_fd,
            attach_type,
        });
        Ok(())
    }

    /// `netns` of `None` attaches in the caller's own network namespace.
    pub fn attach_sk_lookup(&mut self, netns: Option<RawFd>) -> Result<()> {
        self.attach_netns(NetnsHook::SkLookup, AttachType::SkLookup, netns)
    }

    pub fn attach_flow_dissector(&mut self, netns: Option<RawFd>) -> Result<()> {
        self.attach_netns(NetnsHook::FlowDissector, AttachType::FlowDissector, netns)
    }

    fn attach_netns(
        &mut self,
        hook: NetnsHook,
        attach_type: AttachType,
        netns: Option<RawFd>,
    ) -> Result<()> {
        let (target_fd, owned) = match netns {
            Some(fd) => (fd, None),
            None => {
                let file = std::fs::File::open("/proc/self/ns/net")?;
                let owned = OwnedFd::from(file);
                (owned.as_raw_fd(), Some(owned))
            }
        };
        let link_fd = sys::link_create(self.fd(), target_fd, attach_type)?;
        self.attachments.push(Attachment::Netns {
            hook,
            link_fd,
            netns_fd: owned,
        });
        Ok(())
    }

    // -- iterators and struct_ops --------------------------------------------

    /// Create an iterator instance over this program. The returned file
    /// streams the iterator's output; the link lives on as an
    /// attachment.
    pub fn attach_iter(&mut self) -> Result<std::fs::File> {
        let link_fd = sys::link_create_iter(self.fd(), None)?;
        let iter_fd = sys::iter_create(link_fd.as_raw_fd())?;
        self.attachments.push(Attachment::Iter { link_fd });
        Ok(std::fs::File::from(iter_fd))
    }

    /// Activate a populated struct_ops map. The link is parked on this
    /// program (conventionally the primary callback) for lifetime
    /// management.
    pub fn attach_struct_ops(&mut self, map_fd: RawFd) -> Result<()> {
        let link_fd = sys::link_create_struct_ops(map_fd)?;
        self.attachments.push(Attachment::StructOps { link_fd });
        Ok(())
    }

    // -- cgroups --------------------------------------------------------------

    pub fn attach_cgroup(
        &mut self,
        cgroup_path: &str,
        attach_type: AttachType,
        flags: CgroupAttachFlags,
    ) -> Result<()> {
        let c_path = CString::new(cgroup_path)
            .map_err(|_| Error::shape("cgroup path contains an interior NUL"))?;
        let fd = unsafe {
            libc::open(
                c_path.as_ptr(),
                libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(Error::last_errno("open(cgroup)"));
        }
        let cgroup_fd = unsafe { OwnedFd::from_raw_fd(fd) };

        sys::prog_attach(cgroup_fd.as_raw_fd(), self.fd(), attach_type, flags.bits(), None)?;
        self.attachments.push(Attachment::Cgroup {
            path: cgroup_path.to_string(),
            attach_type,
            cgroup_fd,
        });
        Ok(())
    }

    // -- lifecycle -------------------------------------------------------------

    /// Run the program against synthetic input without attaching it.
    pub fn test_run(&self, data_in: &[u8], repeat: u32) -> Result<sys::TestRunOutput> {
        sys::prog_test_run(self.fd(), data_in, None, repeat)
    }

    pub fn test_run_with_context(
        &self,
        data_in: &[u8],
        ctx_in: &[u8],
        repeat: u32,
    ) -> Result<sys::TestRunOutput> {
        sys::prog_test_run(self.fd(), data_in, Some(ctx_in), repeat)
    }

    pub fn pin(&self, path: &str) -> Result<()> {
        sys::obj_pin(path, self.fd())
    }

    pub fn unpin(&self, path: &str) -> Result<()> {
        std::fs::remove_file(path)?;
        Ok(())
    }

    /// Detach everything, newest first. The first failure is reported
    /// after the remaining detaches have still been attempted.
    pub fn detach_all(&mut self) -> Result<()> {
        let prog_fd = self.fd();
        let mut first_error = None;
        while let Some(attachment) = self.attachments.pop() {
            let what = attachment.to_string();
            if let Err(e) = attachment.detach(prog_fd) {
                log::warn!("detach of {what} failed: {e}");
                first_error.get_or_insert(Error::ResourceLeak {
                    detail: format!("{what}: {e}"),
                });
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Detach in reverse order, then close the program FD.
    pub fn close(mut self) -> Result<()> {
        self.detach_all()
        // self drops here, closing the FD
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        // explicit close() already drained these; log rather than raise
        if !self.attachments.is_empty() {
            if let Err(e) = self.detach_all() {
                log::warn!(
                    "program {:?} dropped with live attachments: {e}",
                    self.name.as_deref().unwrap_or("<anon>")
                );
            }
        }
    }
}

fn uprobe_spec(binary: &str, target: &str) -> String {
    let numeric = target
        .strip_prefix("0x")
        .and_then(|hex| u64::from_str_radix(hex, 16).ok())
        .or_else(|| target.parse::<u64>().ok());
    match numeric {
        Some(offset) => format!("{binary}:{offset:#x}"),
        None => format!("{binary}:{target}"),
    }
}

/// Build a struct_ops map value: callback program FDs written at the
/// member offsets the kernel's own BTF dictates. Members without a
/// supplied program stay zero, which the kernel reads as unimplemented.
pub fn struct_ops_value(
    btf: &Btf,
    value_type_id: u32,
    callbacks: &[(&str, RawFd)],
) -> Result<Vec<u8>> {
    let size = btf.size_of(value_type_id)? as usize;
    let members = btf.members(value_type_id)?;
    let mut value = vec![0u8; size];
    for (member_name, prog_fd) in callbacks {
        let member = members
            .iter()
            .find(|m| m.name.as_deref() == Some(*member_name))
            .ok_or_else(|| Error::not_found(format!("struct_ops member {member_name}")))?;
        let offset = (member.bit_offset / 8) as usize;
        if offset + 4 > size {
            return Err(Error::shape(format!(
                "member {member_name} lies outside the {size}-byte value"
            )));
        }
        value[offset..offset + 4].copy_from_slice(&prog_fd.to_le_bytes());
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_release_parsing() {
        assert_eq!(parse_kernel_version("5.15.0-91-generic"), Some(0x050f00));
        assert_eq!(parse_kernel_version("6.8.4"), Some(0x060804));
        assert_eq!(parse_kernel_version("4.19.999"), Some(0x0413ff));
        assert_eq!(parse_kernel_version("weird"), None);
    }

    #[test]
    fn uprobe_spec_formats() {
        assert_eq!(uprobe_spec("/bin/sh", "0x4f0"), "/bin/sh:0x4f0");
        assert_eq!(uprobe_spec("/bin/sh", "1264"), "/bin/sh:0x4f0");
        assert_eq!(uprobe_spec("/bin/sh", "readline"), "/bin/sh:readline");
    }

    #[test]
    fn program_name_rules() {
        let err = Program::load(
            ProgramType::SocketFilter,
            &[0u8; 16],
            "GPL",
            LoadOptions {
                name: Some("a-bad-name".into()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidShape { .. }));

        let err = Program::load(
            ProgramType::SocketFilter,
            &[0u8; 16],
            "GPL",
            LoadOptions {
                name: Some("sixteen_chars_xx".into()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidShape { .. }));
    }

    #[test]
    fn struct_ops_value_population() {
        use crate::btf::testutil::BlobBuilder;

        let mut b = BlobBuilder::new();
        b.int("int", 4, true); // 1
        b.struct_("ops", 16, &[("init", 1, 0), ("release", 1, 64)]); // 2
        let btf = Btf::parse(&b.build()).unwrap();

        let value = struct_ops_value(&btf, 2, &[("release", 42)]).unwrap();
        assert_eq!(value.len(), 16);
        assert_eq!(&value[0..4], &[0, 0, 0, 0], "unset member stays zero");
        assert_eq!(&value[8..12], &42i32.to_le_bytes());

        assert!(struct_ops_value(&btf, 2, &[("missing", 1)]).is_err());
    }
}
