//! Attachment handles and the detach dispatcher.
//!
//! Every attach operation produces one [`Attachment`] owned by the
//! program. The variant carries exactly what its detach protocol needs:
//! the target descriptor, the owned FDs, and any tracefs cleanup token.
//! Matching on the variant is what guarantees each hook kind detaches in
//! its own required order.

use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use crate::consts::AttachType;
use crate::error::Result;
use crate::netlink;
use crate::progs::tracefs::{self, ProbeKind};
use crate::sys;

/// The two flavors of function tracing links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceKind {
    Fentry,
    Fexit,
}

/// Which netns-scoped hook a link serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetnsHook {
    SkLookup,
    FlowDissector,
}

/// An active attachment and everything needed to undo it.
#[derive(Debug)]
pub enum Attachment {
    /// Dynamic tracefs probe driven through a perf event.
    Probe {
        kind: ProbeKind,
        target: String,
        event_name: String,
        perf_fd: OwnedFd,
    },
    /// Static tracepoint driven through a perf event; nothing to remove
    /// from tracefs afterwards.
    Tracepoint {
        category: String,
        name: String,
        perf_fd: OwnedFd,
    },
    RawTracepoint {
        name: String,
        link_fd: OwnedFd,
    },
    Trace {
        kind: TraceKind,
        link_fd: OwnedFd,
    },
    KprobeMulti {
        symbol_count: usize,
        retprobe: bool,
        link_fd: OwnedFd,
    },
    Xdp {
        ifindex: i32,
        flags: netlink::XdpFlags,
    },
    /// sk_skb / sk_msg programs attached to a sockmap or sockhash. The
    /// map FD is borrowed; the map outlives the attachment by contract.
    SockMap {
        map_fd: RawFd,
        attach_type: AttachType,
    },
    Netns {
        hook: NetnsHook,
        link_fd: OwnedFd,
        /// Held only when this attachment opened the namespace itself.
        netns_fd: Option<OwnedFd>,
    },
    Iter {
        link_fd: OwnedFd,
    },
    StructOps {
        link_fd: OwnedFd,
    },
    Cgroup {
        path: String,
        attach_type: AttachType,
        cgroup_fd: OwnedFd,
    },
}

impl Attachment {
    /// Undo the attachment. FDs close as their owners drop; the match
    /// arms order the side effects each protocol requires.
    pub(crate) fn detach(self, prog_fd: RawFd) -> Result<()> {
        match self {
            Attachment::Probe {
                kind,
                event_name,
                perf_fd,
                ..
            } => {
                // disable, close the event, then drop the tracefs entry
                sys::perf_event_disable(perf_fd.as_raw_fd())?;
                drop(perf_fd);
                tracefs::remove_event(kind, &event_name)
            }
            Attachment::Tracepoint { perf_fd, .. } => {
                sys::perf_event_disable(perf_fd.as_raw_fd())?;
                drop(perf_fd);
                Ok(())
            }
            Attachment::RawTracepoint { link_fd, .. }
            | Attachment::Trace { link_fd, .. }
            | Attachment::KprobeMulti { link_fd, .. }
            | Attachment::Iter { link_fd }
            | Attachment::StructOps { link_fd } => {
                drop(link_fd);
                Ok(())
            }
            Attachment::Xdp { ifindex, .. } => netlink::detach_xdp(ifindex),
            Attachment::SockMap {
                map_fd,
                attach_type,
            } => sys::prog_detach(map_fd, prog_fd, attach_type),
            Attachment::Netns {
                link_fd, netns_fd, ..
            } => {
                drop(link_fd);
                drop(netns_fd);
                Ok(())
            }
            Attachment::Cgroup {
                attach_type,
                cgroup_fd,
                ..
            } => {
                sys::prog_detach(cgroup_fd.as_raw_fd(), prog_fd, attach_type)?;
                drop(cgroup_fd);
                Ok(())
            }
        }
    }
}

impl fmt::Display for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attachment::Probe { kind, target, .. } => write!(f, "{kind} on {target}"),
            Attachment::Tracepoint { category, name, .. } => {
                write!(f, "tracepoint {category}/{name}")
            }
            Attachment::RawTracepoint { name, .. } => write!(f, "raw tracepoint {name}"),
            Attachment::Trace { kind, .. } => match kind {
                TraceKind::Fentry => write!(f, "fentry"),
                TraceKind::Fexit => write!(f, "fexit"),
            },
            Attachment::KprobeMulti {
                symbol_count,
                retprobe,
                ..
            } => write!(
                f,
                "kprobe_multi over {symbol_count} symbols{}",
                if *retprobe { " (return)" } else { "" }
            ),
            Attachment::Xdp { ifindex, .. } => write!(f, "xdp on ifindex {ifindex}"),
            Attachment::SockMap { attach_type, .. } => write!(f, "sockmap {attach_type:?}"),
            Attachment::Netns { hook, .. } => match hook {
                NetnsHook::SkLookup => write!(f, "sk_lookup"),
                NetnsHook::FlowDissector => write!(f, "flow dissector"),
            },
            Attachment::Iter { .. } => write!(f, "iterator"),
            Attachment::StructOps { .. } => write!(f, "struct_ops"),
            Attachment::Cgroup {
                path, attach_type, ..
            } => write!(f, "cgroup {attach_type:?} on {path}"),
        }
    }
}
