//! The syscall edge.
//!
//! Every function here takes logical values, marshals them into a
//! 128-byte attr buffer at the byte offsets the kernel documents for the
//! command, invokes the raw syscall, and translates failure into
//! [`Error::Syscall`]. Nothing above this module builds attr unions or
//! touches raw returns.
//!
//! The attr builders are separated from the invoking wrappers so the
//! marshalling is testable without a kernel.

use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use memmap2::{MmapOptions, MmapRaw};

use crate::arch;
use crate::consts::{
    AttachType, Cmd, ProgramType, PERF_EVENT_IOC_DISABLE, PERF_EVENT_IOC_ENABLE,
    PERF_EVENT_IOC_SET_BPF, PERF_FLAG_FD_CLOEXEC,
};
use crate::error::{Error, Result};
use crate::util::{AttrBuffer, BPF_ATTR_SIZE};

/// One bpf(2) invocation. The attr is passed mutably because several
/// commands (test-run, batch ops, get-next-key) write results back into
/// it.
fn bpf(cmd: Cmd, attr: &mut AttrBuffer, label: &'static str) -> Result<i64> {
    let table = arch::host()?;
    let rc = unsafe {
        libc::syscall(
            table.bpf,
            u32::from(cmd) as libc::c_long,
            attr.as_ptr(),
            BPF_ATTR_SIZE,
        )
    };
    if rc < 0 {
        Err(Error::last_errno(label))
    } else {
        Ok(rc as i64)
    }
}

fn fd_from(rc: i64) -> OwnedFd {
    unsafe { OwnedFd::from_raw_fd(rc as RawFd) }
}

pub fn page_size() -> usize {
    // sysconf cannot fail for _SC_PAGESIZE on Linux
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

// ---------------------------------------------------------------------------
// map commands

/// Logical inputs to map-create; everything else in the attr stays zero.
#[derive(Debug, Clone, Default)]
pub struct MapCreateArgs<'a> {
    pub map_type: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub map_flags: u32,
    pub inner_map_fd: u32,
    pub numa_node: u32,
    pub name: Option<&'a str>,
    pub btf_fd: u32,
    pub btf_key_type_id: u32,
    pub btf_value_type_id: u32,
    pub btf_vmlinux_value_type_id: u32,
    pub map_extra: u64,
}

pub(crate) fn map_create_attr(args: &MapCreateArgs<'_>) -> AttrBuffer {
    let mut attr = AttrBuffer::new();
    attr.put_u32(0, args.map_type);
    attr.put_u32(4, args.key_size);
    attr.put_u32(8, args.value_size);
    attr.put_u32(12, args.max_entries);
    attr.put_u32(16, args.map_flags);
    attr.put_u32(20, args.inner_map_fd);
    attr.put_u32(24, args.numa_node);
    if let Some(name) = args.name {
        attr.put_name(28, name, 16);
    }
    attr.put_u32(48, args.btf_fd);
    attr.put_u32(52, args.btf_key_type_id);
    attr.put_u32(56, args.btf_value_type_id);
    attr.put_u32(60, args.btf_vmlinux_value_type_id);
    attr.put_u64(64, args.map_extra);
    attr
}

pub fn map_create(args: &MapCreateArgs<'_>) -> Result<OwnedFd> {
    let mut attr = map_create_attr(args);
    bpf(Cmd::MapCreate, &mut attr, "map_create").map(fd_from)
}

fn map_elem_attr(map_fd: RawFd, key: *const u8, value: *const u8, flags: u64) -> AttrBuffer {
    let mut attr = AttrBuffer::new();
    attr.put_u32(0, map_fd as u32);
    attr.put_ptr(8, key);
    attr.put_ptr(16, value);
    attr.put_u64(24, flags);
    attr
}

pub fn map_lookup_elem(map_fd: RawFd, key: &[u8], value_out: &mut [u8]) -> Result<()> {
    let mut attr = map_elem_attr(map_fd, key.as_ptr(), value_out.as_ptr(), 0);
    bpf(Cmd::MapLookupElem, &mut attr, "map_lookup_elem").map(|_| ())
}

pub fn map_update_elem(map_fd: RawFd, key: &[u8], value: &[u8], flags: u64) -> Result<()> {
    let mut attr = map_elem_attr(map_fd, key.as_ptr(), value.as_ptr(), flags);
    bpf(Cmd::MapUpdateElem, &mut attr, "map_update_elem").map(|_| ())
}

pub fn map_delete_elem(map_fd: RawFd, key: &[u8]) -> Result<()> {
    let mut attr = map_elem_attr(map_fd, key.as_ptr(), std::ptr::null(), 0);
    bpf(Cmd::MapDeleteElem, &mut attr, "map_delete_elem").map(|_| ())
}

pub fn map_lookup_and_delete_elem(map_fd: RawFd, key: &[u8], value_out: &mut [u8]) -> Result<()> {
    let mut attr = map_elem_attr(map_fd, key.as_ptr(), value_out.as_ptr(), 0);
    bpf(
        Cmd::MapLookupAndDeleteElem,
        &mut attr,
        "map_lookup_and_delete_elem",
    )
    .map(|_| ())
}

/// `key = None` asks for the first key. Returns false once the kernel
/// answers ENOENT, which terminates iteration.
pub fn map_get_next_key(map_fd: RawFd, key: Option<&[u8]>, next_key_out: &mut [u8]) -> Result<bool> {
    let key_ptr = key.map_or(std::ptr::null(), |k| k.as_ptr());
    let mut attr = map_elem_attr(map_fd, key_ptr, next_key_out.as_ptr(), 0);
    match bpf(Cmd::MapGetNextKey, &mut attr, "map_get_next_key") {
        Ok(_) => Ok(true),
        Err(e) if e.is_enoent() => Ok(false),
        Err(e) => Err(e),
    }
}

pub fn map_freeze(map_fd: RawFd) -> Result<()> {
    let mut attr = AttrBuffer::new();
    attr.put_u32(0, map_fd as u32);
    bpf(Cmd::MapFreeze, &mut attr, "map_freeze").map(|_| ())
}

fn map_batch_attr(map_fd: RawFd, keys: *const u8, values: *const u8, count: u32, elem_flags: u64) -> AttrBuffer {
    let mut attr = AttrBuffer::new();
    attr.put_u32(0, map_fd as u32);
    attr.put_ptr(8, keys);
    attr.put_ptr(16, values);
    attr.put_u32(24, count);
    attr.put_u64(32, elem_flags);
    attr
}

/// Batch update over contiguous key/value arrays. Returns the count the
/// kernel wrote back at offset 24, which is the number of elements it
/// actually processed.
pub fn map_update_batch(
    map_fd: RawFd,
    keys: &[u8],
    values: &[u8],
    count: u32,
    elem_flags: u64,
) -> Result<u32> {
    let mut attr = map_batch_attr(map_fd, keys.as_ptr(), values.as_ptr(), count, elem_flags);
    bpf(Cmd::MapUpdateBatch, &mut attr, "map_update_batch")?;
    Ok(attr.get_u32(24))
}

pub fn map_delete_batch(map_fd: RawFd, keys: &[u8], count: u32, elem_flags: u64) -> Result<u32> {
    let mut attr = map_batch_attr(map_fd, keys.as_ptr(), std::ptr::null(), count, elem_flags);
    bpf(Cmd::MapDeleteBatch, &mut attr, "map_delete_batch")?;
    Ok(attr.get_u32(24))
}

pub fn map_lookup_batch(
    map_fd: RawFd,
    keys_out: &mut [u8],
    values_out: &mut [u8],
    count: u32,
    elem_flags: u64,
) -> Result<u32> {
    let mut attr = map_batch_attr(
        map_fd,
        keys_out.as_ptr(),
        values_out.as_ptr(),
        count,
        elem_flags,
    );
    bpf(Cmd::MapLookupBatch, &mut attr, "map_lookup_batch")?;
    Ok(attr.get_u32(24))
}

// ---------------------------------------------------------------------------
// object pinning

pub fn obj_pin(path: &str, fd: RawFd) -> Result<()> {
    let c_path = std::ffi::CString::new(path)
        .map_err(|_| Error::shape("pin path contains an interior NUL"))?;
    let mut attr = AttrBuffer::new();
    attr.put_ptr(0, c_path.as_ptr());
    attr.put_u32(8, fd as u32);
    bpf(Cmd::ObjPin, &mut attr, "obj_pin").map(|_| ())
}

pub fn obj_get(path: &str) -> Result<OwnedFd> {
    let c_path = std::ffi::CString::new(path)
        .map_err(|_| Error::shape("pin path contains an interior NUL"))?;
    let mut attr = AttrBuffer::new();
    attr.put_ptr(0, c_path.as_ptr());
    bpf(Cmd::ObjGet, &mut attr, "obj_get").map(fd_from)
}

// ---------------------------------------------------------------------------
// program load

pub struct ProgLoadArgs<'a> {
    pub prog_type: ProgramType,
    pub insns: &'a [u8],
    pub license: &'a str,
    pub log_level: u32,
    pub log_buf: &'a mut [u8],
    pub kern_version: u32,
    pub prog_flags: u32,
    pub name: Option<&'a str>,
    pub expected_attach_type: Option<AttachType>,
    pub prog_btf_fd: u32,
    pub attach_btf_id: u32,
}

pub fn prog_load(args: &mut ProgLoadArgs<'_>) -> Result<OwnedFd> {
    if args.insns.len() % 8 != 0 {
        return Err(Error::shape(format!(
            "bytecode length {} is not a multiple of the instruction size",
            args.insns.len()
        )));
    }
    let license = std::ffi::CString::new(args.license)
        .map_err(|_| Error::shape("license contains an interior NUL"))?;

    let mut attr = AttrBuffer::new();
    attr.put_u32(0, u32::from(args.prog_type));
    attr.put_u32(4, (args.insns.len() / 8) as u32);
    attr.put_ptr(8, args.insns.as_ptr());
    attr.put_ptr(16, license.as_ptr());
    attr.put_u32(24, args.log_level);
    if args.log_level > 0 {
        attr.put_u32(28, args.log_buf.len() as u32);
        attr.put_ptr(32, args.log_buf.as_ptr());
    }
    attr.put_u32(40, args.kern_version);
    attr.put_u32(44, args.prog_flags);
    if let Some(name) = args.name {
        attr.put_name(48, name, 16);
    }
    if let Some(at) = args.expected_attach_type {
        attr.put_u32(68, u32::from(at));
    }
    attr.put_u32(72, args.prog_btf_fd);
    attr.put_u32(108, args.attach_btf_id);

    bpf(Cmd::ProgLoad, &mut attr, "prog_load").map(fd_from)
}

// ---------------------------------------------------------------------------
// attach / detach / test-run

pub fn prog_attach(
    target_fd: RawFd,
    prog_fd: RawFd,
    attach_type: AttachType,
    flags: u32,
    replace_prog_fd: Option<RawFd>,
) -> Result<()> {
    let mut attr = AttrBuffer::new();
    attr.put_u32(0, target_fd as u32);
    attr.put_u32(4, prog_fd as u32);
    attr.put_u32(8, u32::from(attach_type));
    attr.put_u32(12, flags);
    if let Some(fd) = replace_prog_fd {
        attr.put_u32(16, fd as u32);
    }
    bpf(Cmd::ProgAttach, &mut attr, "prog_attach").map(|_| ())
}

pub fn prog_detach(target_fd: RawFd, prog_fd: RawFd, attach_type: AttachType) -> Result<()> {
    let mut attr = AttrBuffer::new();
    attr.put_u32(0, target_fd as u32);
    attr.put_u32(4, prog_fd as u32);
    attr.put_u32(8, u32::from(attach_type));
    bpf(Cmd::ProgDetach, &mut attr, "prog_detach").map(|_| ())
}

/// Kernel-side results of one test-run invocation.
#[derive(Debug, Clone)]
pub struct TestRunOutput {
    pub retval: u32,
    pub duration_ns: u32,
    pub data_out: Vec<u8>,
    pub ctx_out: Vec<u8>,
}

/// Run a loaded program against synthetic input without attaching it.
///
/// The output buffer is sized generously because some program types
/// (XDP head adjustment) legally grow the packet.
pub fn prog_test_run(
    prog_fd: RawFd,
    data_in: &[u8],
    ctx_in: Option<&[u8]>,
    repeat: u32,
) -> Result<TestRunOutput> {
    let mut data_out = vec![0u8; data_in.len() + 256];
    let mut ctx_out = vec![0u8; ctx_in.map_or(0, <[u8]>::len)];

    let mut attr = AttrBuffer::new();
    attr.put_u32(0, prog_fd as u32);
    attr.put_u32(8, data_in.len() as u32);
    attr.put_u32(12, data_out.len() as u32);
    attr.put_ptr(16, data_in.as_ptr());
    attr.put_ptr(24, data_out.as_ptr());
    attr.put_u32(32, repeat);
    if let Some(ctx) = ctx_in {
        attr.put_u32(40, ctx.len() as u32);
        attr.put_u32(44, ctx_out.len() as u32);
        attr.put_ptr(48, ctx.as_ptr());
        attr.put_ptr(56, ctx_out.as_ptr());
    }
    bpf(Cmd::ProgTestRun, &mut attr, "prog_test_run")?;

    data_out.truncate(attr.get_u32(12) as usize);
    ctx_out.truncate(attr.get_u32(44) as usize);
    Ok(TestRunOutput {
        retval: attr.get_u32(4),
        duration_ns: attr.get_u32(36),
        data_out,
        ctx_out,
    })
}

pub fn raw_tracepoint_open(name: &str, prog_fd: RawFd) -> Result<OwnedFd> {
    let c_name = std::ffi::CString::new(name)
        .map_err(|_| Error::shape("tracepoint name contains an interior NUL"))?;
    let mut attr = AttrBuffer::new();
    attr.put_ptr(0, c_name.as_ptr());
    attr.put_u32(8, prog_fd as u32);
    bpf(Cmd::RawTracepointOpen, &mut attr, "raw_tracepoint_open").map(fd_from)
}

// ---------------------------------------------------------------------------
// links

fn link_create_attr(prog_fd: RawFd, target_fd: RawFd, attach_type: AttachType) -> AttrBuffer {
    let mut attr = AttrBuffer::new();
    attr.put_u32(0, prog_fd as u32);
    attr.put_u32(4, target_fd as u32);
    attr.put_u32(8, u32::from(attach_type));
    attr
}

/// The plain link-create arm: fentry/fexit (target resolved at load via
/// attach_btf_id), netns attaches (sk_lookup, flow_dissector, where
/// target_fd is a netns FD), and anything else without a substructure.
pub fn link_create(prog_fd: RawFd, target_fd: RawFd, attach_type: AttachType) -> Result<OwnedFd> {
    let mut attr = link_create_attr(prog_fd, target_fd, attach_type);
    bpf(Cmd::LinkCreate, &mut attr, "link_create").map(fd_from)
}

/// Iterator links carry an optional iter_info blob at offsets 16/24.
pub fn link_create_iter(prog_fd: RawFd, iter_info: Option<&[u8]>) -> Result<OwnedFd> {
    let mut attr = link_create_attr(prog_fd, 0, AttachType::TraceIter);
    if let Some(info) = iter_info {
        attr.put_ptr(16, info.as_ptr());
        attr.put_u32(24, info.len() as u32);
    }
    bpf(Cmd::LinkCreate, &mut attr, "link_create").map(fd_from)
}

/// kprobe_multi: the substructure is (flags@16, cnt@20, syms@24,
/// addrs@32, cookies@40). Exactly one of `syms`/`addrs` is given.
pub fn link_create_kprobe_multi(
    prog_fd: RawFd,
    syms: &[*const libc::c_char],
    retprobe: bool,
) -> Result<OwnedFd> {
    // BPF_F_KPROBE_MULTI_RETURN
    let flags = if retprobe { 1 } else { 0 };
    let mut attr = link_create_attr(prog_fd, 0, AttachType::TraceKprobeMulti);
    attr.put_u32(16, flags);
    attr.put_u32(20, syms.len() as u32);
    attr.put_ptr(24, syms.as_ptr());
    bpf(Cmd::LinkCreate, &mut attr, "link_create").map(fd_from)
}

/// struct_ops activation: the map FD rides in the prog_fd slot.
pub fn link_create_struct_ops(map_fd: RawFd) -> Result<OwnedFd> {
    let mut attr = AttrBuffer::new();
    attr.put_u32(0, map_fd as u32);
    attr.put_u32(8, u32::from(AttachType::StructOps));
    bpf(Cmd::LinkCreate, &mut attr, "link_create").map(fd_from)
}

pub fn iter_create(link_fd: RawFd) -> Result<OwnedFd> {
    let mut attr = AttrBuffer::new();
    attr.put_u32(0, link_fd as u32);
    bpf(Cmd::IterCreate, &mut attr, "iter_create").map(fd_from)
}

// ---------------------------------------------------------------------------
// perf events

/// `struct perf_event_attr` for a tracepoint consumer, created disabled.
/// Only the fields a tracepoint needs are populated: type=2
/// (PERF_TYPE_TRACEPOINT), the mandatory size, config=tracepoint id, and
/// the `disabled` bit (bit 0 of the flags word at offset 40).
pub(crate) fn perf_tracepoint_attr(tracepoint_id: u64) -> AttrBuffer {
    let mut attr = AttrBuffer::new();
    attr.put_u32(0, 2);
    attr.put_u32(4, BPF_ATTR_SIZE as u32);
    attr.put_u64(8, tracepoint_id);
    attr.put_u64(16, 1); // sample_period
    attr.put_u64(40, 1); // disabled
    attr
}

pub fn perf_event_open_tracepoint(tracepoint_id: u64, pid: i32, cpu: i32) -> Result<OwnedFd> {
    let table = arch::host()?;
    let attr = perf_tracepoint_attr(tracepoint_id);
    let rc = unsafe {
        libc::syscall(
            table.perf_event_open,
            attr.as_ptr(),
            pid,
            cpu,
            -1 as libc::c_int, // group_fd
            PERF_FLAG_FD_CLOEXEC,
        )
    };
    if rc < 0 {
        Err(Error::last_errno("perf_event_open"))
    } else {
        Ok(fd_from(rc as i64))
    }
}

fn perf_ioctl(fd: RawFd, request: u64, arg: u64, label: &'static str) -> Result<()> {
    let rc = unsafe { libc::ioctl(fd, request as libc::c_ulong, arg) };
    if rc < 0 {
        Err(Error::last_errno(label))
    } else {
        Ok(())
    }
}

pub fn perf_event_set_bpf(event_fd: RawFd, prog_fd: RawFd) -> Result<()> {
    perf_ioctl(
        event_fd,
        PERF_EVENT_IOC_SET_BPF,
        prog_fd as u64,
        "perf_event_ioc_set_bpf",
    )
}

pub fn perf_event_enable(event_fd: RawFd) -> Result<()> {
    perf_ioctl(event_fd, PERF_EVENT_IOC_ENABLE, 0, "perf_event_ioc_enable")
}

pub fn perf_event_disable(event_fd: RawFd) -> Result<()> {
    perf_ioctl(event_fd, PERF_EVENT_IOC_DISABLE, 0, "perf_event_ioc_disable")
}

// ---------------------------------------------------------------------------
// ring-buffer mapping

/// The three kernel-defined regions of a mapped ring-buffer map.
pub struct RingbufRegions {
    pub consumer: MmapRaw,
    pub producer: MmapRaw,
    pub data: MmapRaw,
}

/// Map a ring-buffer map FD: consumer page at file offset 0, producer
/// page at one page, data region at two pages. All three are shared
/// read-write mappings; dropping the region unmaps it.
pub fn mmap_ringbuf(map_fd: RawFd, data_size: usize) -> Result<RingbufRegions> {
    let page = page_size();
    let map = |offset: usize, len: usize| -> Result<MmapRaw> {
        MmapOptions::new()
            .offset(offset as u64)
            .len(len)
            .map_raw(map_fd)
            .map_err(|e| {
                Error::shape(format!("mmap of ring-buffer region at {offset} failed: {e}"))
            })
    };
    Ok(RingbufRegions {
        consumer: map(0, page)?,
        producer: map(page, page)?,
        data: map(2 * page, data_size)?,
    })
}

/// Validate the ring-buffer shape rule before map-create: a power of two
/// and a whole number of pages.
pub fn validate_ringbuf_size(max_entries: u32) -> Result<()> {
    let page = page_size() as u32;
    if max_entries == 0 || !max_entries.is_power_of_two() || max_entries % page != 0 {
        return Err(Error::shape(format!(
            "ring-buffer size {max_entries} must be a power of two and a multiple of the {page}-byte page"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_create_attr_offsets() {
        let attr = map_create_attr(&MapCreateArgs {
            map_type: 1,
            key_size: 4,
            value_size: 8,
            max_entries: 1024,
            map_flags: 0x40,
            name: Some("flows"),
            btf_fd: 9,
            map_extra: 0xdead,
            ..Default::default()
        });
        assert_eq!(attr.get_u32(0), 1);
        assert_eq!(attr.get_u32(4), 4);
        assert_eq!(attr.get_u32(8), 8);
        assert_eq!(attr.get_u32(12), 1024);
        assert_eq!(attr.get_u32(16), 0x40);
        assert_eq!(attr.get_u32(48), 9);
        assert_eq!(attr.get_u64(64), 0xdead);
    }

    #[test]
    fn elem_attr_offsets() {
        let key = [1u8; 4];
        let value = [2u8; 8];
        let attr = map_elem_attr(7, key.as_ptr(), value.as_ptr(), 2);
        assert_eq!(attr.get_u32(0), 7);
        assert_eq!(attr.get_u64(8), key.as_ptr() as u64);
        assert_eq!(attr.get_u64(16), value.as_ptr() as u64);
        assert_eq!(attr.get_u64(24), 2);
    }

    #[test]
    fn batch_attr_offsets() {
        let keys = [0u8; 16];
        let values = [0u8; 32];
        let attr = map_batch_attr(3, keys.as_ptr(), values.as_ptr(), 4, 1);
        assert_eq!(attr.get_u32(0), 3);
        assert_eq!(attr.get_u64(8), keys.as_ptr() as u64);
        assert_eq!(attr.get_u64(16), values.as_ptr() as u64);
        assert_eq!(attr.get_u32(24), 4);
        assert_eq!(attr.get_u64(32), 1);
    }

    #[test]
    fn perf_tracepoint_attr_shape() {
        let attr = perf_tracepoint_attr(0x123);
        assert_eq!(attr.get_u32(0), 2, "PERF_TYPE_TRACEPOINT");
        assert_eq!(attr.get_u32(4), 128);
        assert_eq!(attr.get_u64(8), 0x123);
        assert_eq!(attr.get_u64(40) & 1, 1, "created disabled");
    }

    #[test]
    fn ringbuf_shape_rules() {
        let page = page_size() as u32;
        assert!(validate_ringbuf_size(page * 4).is_ok());
        assert!(validate_ringbuf_size(page * 3).is_err(), "not a power of two");
        assert!(validate_ringbuf_size(0).is_err());
        assert!(validate_ringbuf_size(1024).is_err(), "smaller than a page");
    }

    #[test]
    fn bytecode_length_must_be_aligned() {
        let mut log = [0u8; 64];
        let mut args = ProgLoadArgs {
            prog_type: ProgramType::SocketFilter,
            insns: &[0u8; 12],
            license: "GPL",
            log_level: 0,
            log_buf: &mut log,
            kern_version: 0,
            prog_flags: 0,
            name: None,
            expected_attach_type: None,
            prog_btf_fd: 0,
            attach_btf_id: 0,
        };
        assert!(matches!(
            prog_load(&mut args),
            Err(Error::InvalidShape { .. })
        ));
    }
}
