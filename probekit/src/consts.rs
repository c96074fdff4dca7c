//! Named kernel constants.
//!
//! Everything here mirrors `include/uapi/linux/bpf.h` and friends. The
//! numbers are ABI; the enums exist so the rest of the crate never passes
//! bare integers across the syscall boundary.

use std::fmt;

macro_rules! kernel_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $($(#[$vmeta:meta])* $variant:ident = $value:expr),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value),+
        }

        impl $name {
            pub const fn from_raw(raw: u32) -> Option<Self> {
                match raw {
                    $($value => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl From<$name> for u32 {
            fn from(v: $name) -> u32 {
                v as u32
            }
        }
    };
}

kernel_enum! {
    /// `enum bpf_cmd`: the multiplexed command word of bpf(2).
    Cmd {
        MapCreate = 0,
        MapLookupElem = 1,
        MapUpdateElem = 2,
        MapDeleteElem = 3,
        MapGetNextKey = 4,
        ProgLoad = 5,
        ObjPin = 6,
        ObjGet = 7,
        ProgAttach = 8,
        ProgDetach = 9,
        ProgTestRun = 10,
        ProgGetNextId = 11,
        MapGetNextId = 12,
        ProgGetFdById = 13,
        MapGetFdById = 14,
        ObjGetInfoByFd = 15,
        ProgQuery = 16,
        RawTracepointOpen = 17,
        BtfLoad = 18,
        BtfGetFdById = 19,
        TaskFdQuery = 20,
        MapLookupAndDeleteElem = 21,
        MapFreeze = 22,
        BtfGetNextId = 23,
        MapLookupBatch = 24,
        MapLookupAndDeleteBatch = 25,
        MapUpdateBatch = 26,
        MapDeleteBatch = 27,
        LinkCreate = 28,
        LinkUpdate = 29,
        LinkGetFdById = 30,
        LinkGetNextId = 31,
        EnableStats = 32,
        IterCreate = 33,
        LinkDetach = 34,
        ProgBindMap = 35,
    }
}

kernel_enum! {
    /// `enum bpf_map_type`.
    MapType {
        Unspec = 0,
        Hash = 1,
        Array = 2,
        ProgArray = 3,
        PerfEventArray = 4,
        PercpuHash = 5,
        PercpuArray = 6,
        StackTrace = 7,
        CgroupArray = 8,
        LruHash = 9,
        LruPercpuHash = 10,
        LpmTrie = 11,
        ArrayOfMaps = 12,
        HashOfMaps = 13,
        Devmap = 14,
        Sockmap = 15,
        Cpumap = 16,
        Xskmap = 17,
        Sockhash = 18,
        CgroupStorage = 19,
        ReuseportSockarray = 20,
        PercpuCgroupStorage = 21,
        Queue = 22,
        Stack = 23,
        SkStorage = 24,
        DevmapHash = 25,
        StructOps = 26,
        Ringbuf = 27,
        InodeStorage = 28,
        TaskStorage = 29,
        BloomFilter = 30,
    }
}

kernel_enum! {
    /// `enum bpf_prog_type`.
    ProgramType {
        Unspec = 0,
        SocketFilter = 1,
        Kprobe = 2,
        SchedCls = 3,
        SchedAct = 4,
        Tracepoint = 5,
        Xdp = 6,
        PerfEvent = 7,
        CgroupSkb = 8,
        CgroupSock = 9,
        LwtIn = 10,
        LwtOut = 11,
        LwtXmit = 12,
        SockOps = 13,
        SkSkb = 14,
        CgroupDevice = 15,
        SkMsg = 16,
        RawTracepoint = 17,
        CgroupSockAddr = 18,
        LwtSeg6local = 19,
        LircMode2 = 20,
        SkReuseport = 21,
        FlowDissector = 22,
        CgroupSysctl = 23,
        RawTracepointWritable = 24,
        CgroupSockopt = 25,
        Tracing = 26,
        StructOps = 27,
        Ext = 28,
        Lsm = 29,
        SkLookup = 30,
        Syscall = 31,
    }
}

kernel_enum! {
    /// `enum bpf_attach_type`.
    AttachType {
        CgroupInetIngress = 0,
        CgroupInetEgress = 1,
        CgroupInetSockCreate = 2,
        CgroupSockOps = 3,
        SkSkbStreamParser = 4,
        SkSkbStreamVerdict = 5,
        CgroupDevice = 6,
        SkMsgVerdict = 7,
        CgroupInet4Bind = 8,
        CgroupInet6Bind = 9,
        CgroupInet4Connect = 10,
        CgroupInet6Connect = 11,
        CgroupInet4PostBind = 12,
        CgroupInet6PostBind = 13,
        CgroupUdp4Sendmsg = 14,
        CgroupUdp6Sendmsg = 15,
        LircMode2 = 16,
        FlowDissector = 17,
        CgroupSysctl = 18,
        CgroupUdp4Recvmsg = 19,
        CgroupUdp6Recvmsg = 20,
        CgroupGetsockopt = 21,
        CgroupSetsockopt = 22,
        TraceRawTp = 23,
        TraceFentry = 24,
        TraceFexit = 25,
        ModifyReturn = 26,
        LsmMac = 27,
        TraceIter = 28,
        CgroupInet4Getpeername = 29,
        CgroupInet6Getpeername = 30,
        CgroupInet4Getsockname = 31,
        CgroupInet6Getsockname = 32,
        XdpDevmap = 33,
        CgroupInetSockRelease = 34,
        XdpCpumap = 35,
        SkLookup = 36,
        Xdp = 37,
        SkSkbVerdict = 38,
        SkReuseportSelect = 39,
        SkReuseportSelectOrMigrate = 40,
        PerfEvent = 41,
        TraceKprobeMulti = 42,
        LsmCgroup = 43,
        StructOps = 44,
    }
}

/// Stable helper-function numbers, as carried in the `imm` field of a
/// `call` instruction. Only the helpers the emitter wraps are listed.
pub mod helper {
    pub const MAP_LOOKUP_ELEM: i32 = 1;
    pub const MAP_UPDATE_ELEM: i32 = 2;
    pub const MAP_DELETE_ELEM: i32 = 3;
    pub const PROBE_READ: i32 = 4;
    pub const KTIME_GET_NS: i32 = 5;
    pub const TRACE_PRINTK: i32 = 6;
    pub const GET_PRANDOM_U32: i32 = 7;
    pub const GET_SMP_PROCESSOR_ID: i32 = 8;
    pub const TAIL_CALL: i32 = 12;
    pub const GET_CURRENT_PID_TGID: i32 = 14;
    pub const GET_CURRENT_UID_GID: i32 = 15;
    pub const GET_CURRENT_COMM: i32 = 16;
    pub const PERF_EVENT_OUTPUT: i32 = 25;
    pub const GET_STACKID: i32 = 27;
    pub const GET_CURRENT_TASK: i32 = 35;
    pub const PROBE_READ_STR: i32 = 45;
    pub const PROBE_READ_USER: i32 = 112;
    pub const PROBE_READ_KERNEL: i32 = 113;
    pub const PROBE_READ_USER_STR: i32 = 114;
    pub const PROBE_READ_KERNEL_STR: i32 = 115;
    pub const RINGBUF_OUTPUT: i32 = 130;
    pub const RINGBUF_RESERVE: i32 = 131;
    pub const RINGBUF_SUBMIT: i32 = 132;
    pub const RINGBUF_DISCARD: i32 = 133;
    pub const RINGBUF_QUERY: i32 = 134;
}

/// In an `lddw`, src=1 tells the verifier the immediate is a map FD.
pub const PSEUDO_MAP_FD: u8 = 1;

/// `_IOC(dir, type, nr, size)` from `asm-generic/ioctl.h`: direction in
/// bits 30-31, size in 16-29, type in 8-15, number in 0-7.
pub const fn ioc(dir: u64, ty: u64, nr: u64, size: u64) -> u64 {
    (dir << 30) | (size << 16) | (ty << 8) | nr
}

/// Perf-event ioctls, type '$' (0x24).
pub const PERF_EVENT_IOC_ENABLE: u64 = ioc(0, 0x24, 0, 0);
pub const PERF_EVENT_IOC_DISABLE: u64 = ioc(0, 0x24, 1, 0);
pub const PERF_EVENT_IOC_SET_BPF: u64 = ioc(1, 0x24, 8, 4);

/// The kernel-internal "operation not supported" errno eBPF surfaces for
/// missing helpers and hooks. Not part of the POSIX set.
pub const ENOTSUPP: i32 = 524;

/// `PERF_FLAG_FD_CLOEXEC` from `linux/perf_event.h`. Not exposed by the
/// `libc` crate.
pub const PERF_FLAG_FD_CLOEXEC: libc::c_int = 1 << 3;

/// Symbolic view of an errno value.
///
/// Wraps the raw number so unknown values survive round-trips; `Display`
/// prints the symbolic name where one is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrnoKind(pub i32);

impl ErrnoKind {
    pub fn from_raw(errno: i32) -> Self {
        ErrnoKind(errno)
    }

    /// The symbolic name, or `None` for values outside the table.
    pub fn name(self) -> Option<&'static str> {
        errno_name(self.0)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        ERRNO_TABLE
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(num, _)| ErrnoKind(*num))
    }
}

impl fmt::Display for ErrnoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "errno {}", self.0),
        }
    }
}

fn errno_name(errno: i32) -> Option<&'static str> {
    ERRNO_TABLE
        .iter()
        .find(|(num, _)| *num == errno)
        .map(|(_, name)| *name)
}

#[rustfmt::skip]
static ERRNO_TABLE: &[(i32, &str)] = &[
    (libc::EPERM, "EPERM"),
    (libc::ENOENT, "ENOENT"),
    (libc::ESRCH, "ESRCH"),
    (libc::EINTR, "EINTR"),
    (libc::EIO, "EIO"),
    (libc::ENXIO, "ENXIO"),
    (libc::E2BIG, "E2BIG"),
    (libc::ENOEXEC, "ENOEXEC"),
    (libc::EBADF, "EBADF"),
    (libc::ECHILD, "ECHILD"),
    (libc::EAGAIN, "EAGAIN"),
    (libc::ENOMEM, "ENOMEM"),
    (libc::EACCES, "EACCES"),
    (libc::EFAULT, "EFAULT"),
    (libc::ENOTBLK, "ENOTBLK"),
    (libc::EBUSY, "EBUSY"),
    (libc::EEXIST, "EEXIST"),
    (libc::EXDEV, "EXDEV"),
    (libc::ENODEV, "ENODEV"),
    (libc::ENOTDIR, "ENOTDIR"),
    (libc::EISDIR, "EISDIR"),
    (libc::EINVAL, "EINVAL"),
    (libc::ENFILE, "ENFILE"),
    (libc::EMFILE, "EMFILE"),
    (libc::ENOTTY, "ENOTTY"),
    (libc::ETXTBSY, "ETXTBSY"),
    (libc::EFBIG, "EFBIG"),
    (libc::ENOSPC, "ENOSPC"),
    (libc::ESPIPE, "ESPIPE"),
    (libc::EROFS, "EROFS"),
    (libc::EMLINK, "EMLINK"),
    (libc::EPIPE, "EPIPE"),
    (libc::EDOM, "EDOM"),
    (libc::ERANGE, "ERANGE"),
    (libc::EDEADLK, "EDEADLK"),
    (libc::ENAMETOOLONG, "ENAMETOOLONG"),
    (libc::ENOLCK, "ENOLCK"),
    (libc::ENOSYS, "ENOSYS"),
    (libc::ENOTEMPTY, "ENOTEMPTY"),
    (libc::ELOOP, "ELOOP"),
    (libc::ENOMSG, "ENOMSG"),
    (libc::EIDRM, "EIDRM"),
    (libc::ENODATA, "ENODATA"),
    (libc::EPROTO, "EPROTO"),
    (libc::EOVERFLOW, "EOVERFLOW"),
    (libc::EILSEQ, "EILSEQ"),
    (libc::ENOTSOCK, "ENOTSOCK"),
    (libc::EDESTADDRREQ, "EDESTADDRREQ"),
    (libc::EMSGSIZE, "EMSGSIZE"),
    (libc::EPROTOTYPE, "EPROTOTYPE"),
    (libc::ENOPROTOOPT, "ENOPROTOOPT"),
    (libc::EPROTONOSUPPORT, "EPROTONOSUPPORT"),
    (libc::ESOCKTNOSUPPORT, "ESOCKTNOSUPPORT"),
    (libc::EOPNOTSUPP, "EOPNOTSUPP"),
    (libc::EPFNOSUPPORT, "EPFNOSUPPORT"),
    (libc::EAFNOSUPPORT, "EAFNOSUPPORT"),
    (libc::EADDRINUSE, "EADDRINUSE"),
    (libc::EADDRNOTAVAIL, "EADDRNOTAVAIL"),
    (libc::ENETDOWN, "ENETDOWN"),
    (libc::ENETUNREACH, "ENETUNREACH"),
    (libc::ECONNABORTED, "ECONNABORTED"),
    (libc::ECONNRESET, "ECONNRESET"),
    (libc::ENOBUFS, "ENOBUFS"),
    (libc::EISCONN, "EISCONN"),
    (libc::ENOTCONN, "ENOTCONN"),
    (libc::ETIMEDOUT, "ETIMEDOUT"),
    (libc::ECONNREFUSED, "ECONNREFUSED"),
    (libc::EHOSTDOWN, "EHOSTDOWN"),
    (libc::EHOSTUNREACH, "EHOSTUNREACH"),
    (libc::EALREADY, "EALREADY"),
    (libc::EINPROGRESS, "EINPROGRESS"),
    (libc::ESTALE, "ESTALE"),
    (libc::EDQUOT, "EDQUOT"),
    (libc::ECANCELED, "ECANCELED"),
    (ENOTSUPP, "ENOTSUPP"),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmd_roundtrip() {
        assert_eq!(Cmd::from_raw(5), Some(Cmd::ProgLoad));
        assert_eq!(u32::from(Cmd::LinkCreate), 28);
        assert_eq!(Cmd::from_raw(999), None);
    }

    #[test]
    fn map_type_roundtrip() {
        assert_eq!(MapType::from_raw(27), Some(MapType::Ringbuf));
        assert_eq!(u32::from(MapType::ProgArray), 3);
    }

    #[test]
    fn attach_type_values_match_uapi() {
        assert_eq!(u32::from(AttachType::TraceFentry), 24);
        assert_eq!(u32::from(AttachType::TraceIter), 28);
        assert_eq!(u32::from(AttachType::SkLookup), 36);
        assert_eq!(u32::from(AttachType::Xdp), 37);
    }

    #[test]
    fn perf_ioctl_encoding() {
        assert_eq!(PERF_EVENT_IOC_ENABLE, 0x2400);
        assert_eq!(PERF_EVENT_IOC_DISABLE, 0x2401);
        assert_eq!(PERF_EVENT_IOC_SET_BPF, 0x40042408);
    }

    #[test]
    fn errno_kind_names() {
        assert_eq!(ErrnoKind::from_raw(libc::EPERM).to_string(), "EPERM");
        assert_eq!(ErrnoKind::from_raw(524).to_string(), "ENOTSUPP");
        assert_eq!(ErrnoKind::from_name("ENOENT"), Some(ErrnoKind(libc::ENOENT)));
        assert_eq!(ErrnoKind::from_raw(-1).to_string(), "errno -1");
    }
}
