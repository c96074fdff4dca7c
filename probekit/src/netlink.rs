//! XDP attachment over rtnetlink.
//!
//! XDP has no bpf(2) attach command on the interface path this crate
//! uses; the program FD travels in an RTM_SETLINK message as a nested
//! IFLA_XDP attribute. Detach is the same message with FD -1. Message
//! assembly is pure so the wire bytes are testable; only the socket
//! send/ack touches the kernel.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::util::read_u16_le;

bitflags! {
    /// IFLA_XDP_FLAGS values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct XdpFlags: u32 {
        const UPDATE_IF_NOEXIST = 1;
        const SKB_MODE = 2;
        const DRV_MODE = 4;
        const HW_MODE = 8;
        const REPLACE = 16;
    }
}

const RTM_SETLINK: u16 = 19;
const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_ACK: u16 = 0x04;
const NLMSG_ERROR: u16 = 0x02;

const IFLA_XDP: u16 = 43;
const NLA_F_NESTED: u16 = 0x8000;
const IFLA_XDP_FD: u16 = 1;
const IFLA_XDP_FLAGS: u16 = 3;

fn push_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn push_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// One nlattr: 16-bit length (header + data, unpadded), 16-bit type,
/// data, then external padding to 4 bytes.
fn push_attr(buf: &mut Vec<u8>, attr_type: u16, data: &[u8]) {
    push_u16(buf, 4 + data.len() as u16);
    push_u16(buf, attr_type);
    buf.extend_from_slice(data);
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

/// Assemble the full RTM_SETLINK message for one interface's XDP slot.
pub(crate) fn build_setlink_xdp(ifindex: i32, prog_fd: i32, flags: XdpFlags) -> Vec<u8> {
    let mut nested = Vec::new();
    push_attr(&mut nested, IFLA_XDP_FD, &prog_fd.to_le_bytes());
    push_attr(&mut nested, IFLA_XDP_FLAGS, &flags.bits().to_le_bytes());

    let mut msg = Vec::with_capacity(16 + 16 + 4 + nested.len());
    // nlmsghdr
    push_u32(&mut msg, (16 + 16 + 4 + nested.len()) as u32);
    push_u16(&mut msg, RTM_SETLINK);
    push_u16(&mut msg, NLM_F_REQUEST | NLM_F_ACK);
    push_u32(&mut msg, 1); // seq
    push_u32(&mut msg, 0); // pid: kernel fills ours in
    // ifinfomsg
    msg.push(0); // family
    msg.push(0); // pad
    push_u16(&mut msg, 0); // device type
    push_u32(&mut msg, ifindex as u32);
    push_u32(&mut msg, 0); // flags
    push_u32(&mut msg, 0); // change mask
    // nested IFLA_XDP
    push_u16(&mut msg, (4 + nested.len()) as u16);
    push_u16(&mut msg, NLA_F_NESTED | IFLA_XDP);
    msg.extend_from_slice(&nested);
    msg
}

fn open_route_socket() -> Result<OwnedFd> {
    let fd = unsafe {
        libc::socket(
            libc::AF_NETLINK,
            libc::SOCK_RAW | libc::SOCK_CLOEXEC,
            libc::NETLINK_ROUTE,
        )
    };
    if fd < 0 {
        return Err(Error::last_errno("socket(AF_NETLINK)"));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn send_and_ack(sock: RawFd, msg: &[u8]) -> Result<()> {
    let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;

    let sent = unsafe {
        libc::sendto(
            sock,
            msg.as_ptr().cast(),
            msg.len(),
            0,
            &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if sent < 0 {
        return Err(Error::last_errno("sendto(netlink)"));
    }

    let mut reply = [0u8; 4096];
    let received = unsafe {
        libc::recvfrom(
            sock,
            reply.as_mut_ptr().cast(),
            reply.len(),
            0,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )
    };
    if received < 0 {
        return Err(Error::last_errno("recvfrom(netlink)"));
    }
    parse_ack(&reply[..received as usize])
}

/// The kernel answers NLM_F_ACK requests with one NLMSG_ERROR whose
/// error field is 0 on success and a negated errno on failure.
fn parse_ack(reply: &[u8]) -> Result<()> {
    if reply.len() < 20 {
        return Err(Error::shape("short netlink reply"));
    }
    let msg_type = read_u16_le(reply, 4);
    if msg_type != NLMSG_ERROR {
        return Err(Error::shape(format!(
            "unexpected netlink reply type {msg_type}"
        )));
    }
    let error = i32::from_le_bytes(reply[16..20].try_into().unwrap());
    if error == 0 {
        Ok(())
    } else {
        let errno = -error;
        Err(Error::Syscall {
            cmd: "rtm_setlink(ifla_xdp)",
            errno,
            kind: crate::consts::ErrnoKind::from_raw(errno),
        })
    }
}

/// Install `prog_fd` as the XDP program on `ifindex`.
pub fn attach_xdp(ifindex: i32, prog_fd: RawFd, flags: XdpFlags) -> Result<()> {
    let sock = open_route_socket()?;
    let msg = build_setlink_xdp(ifindex, prog_fd, flags);
    send_and_ack(sock.as_raw_fd(), &msg)?;
    log::debug!("attached XDP program fd {prog_fd} to ifindex {ifindex} ({flags:?})");
    Ok(())
}

/// Clear the XDP slot on `ifindex` by attaching FD -1.
pub fn detach_xdp(ifindex: i32) -> Result<()> {
    let sock = open_route_socket()?;
    let msg = build_setlink_xdp(ifindex, -1, XdpFlags::empty());
    send_and_ack(sock.as_raw_fd(), &msg)?;
    log::debug!("detached XDP program from ifindex {ifindex}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setlink_message_layout() {
        let msg = build_setlink_xdp(3, 7, XdpFlags::DRV_MODE);
        assert_eq!(msg.len(), 52);

        // nlmsghdr
        assert_eq!(u32::from_le_bytes(msg[0..4].try_into().unwrap()), 52);
        assert_eq!(u16::from_le_bytes([msg[4], msg[5]]), RTM_SETLINK);
        assert_eq!(u16::from_le_bytes([msg[6], msg[7]]), 0x05);
        // ifinfomsg: ifindex
        assert_eq!(i32::from_le_bytes(msg[20..24].try_into().unwrap()), 3);

        // nested IFLA_XDP header with the nested bit set
        assert_eq!(u16::from_le_bytes([msg[32], msg[33]]), 20);
        let nested_type = u16::from_le_bytes([msg[34], msg[35]]);
        assert_eq!(nested_type, 0x8000 | 43);
        assert_ne!(nested_type & NLA_F_NESTED, 0);

        // IFLA_XDP_FD = 7
        assert_eq!(u16::from_le_bytes([msg[36], msg[37]]), 8);
        assert_eq!(u16::from_le_bytes([msg[38], msg[39]]), IFLA_XDP_FD);
        assert_eq!(&msg[40..44], &[0x07, 0x00, 0x00, 0x00]);

        // IFLA_XDP_FLAGS = DRV_MODE
        assert_eq!(u16::from_le_bytes([msg[44], msg[45]]), 8);
        assert_eq!(u16::from_le_bytes([msg[46], msg[47]]), IFLA_XDP_FLAGS);
        assert_eq!(&msg[48..52], &[0x04, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn detach_sends_minus_one() {
        let msg = build_setlink_xdp(2, -1, XdpFlags::empty());
        assert_eq!(&msg[40..44], &[0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn ack_parsing() {
        let mut reply = vec![0u8; 36];
        reply[0..4].copy_from_slice(&36u32.to_le_bytes());
        reply[4..6].copy_from_slice(&NLMSG_ERROR.to_le_bytes());
        assert!(parse_ack(&reply).is_ok());

        reply[16..20].copy_from_slice(&(-libc::EBUSY).to_le_bytes());
        let err = parse_ack(&reply).unwrap_err();
        assert_eq!(err.errno(), Some(libc::EBUSY));
    }
}
