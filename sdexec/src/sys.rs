//! Safe wrappers around the raw system calls the pipeline needs and that
//! `nix` does not cover with a stable API.
//!
//! All `unsafe` code in the crate is confined to this module.

#![allow(unsafe_code, clippy::missing_docs_in_private_items)]

use std::ffi::{CStr, CString, c_int, c_ulong};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::{io, mem, ptr};

/// One classic BPF instruction (`struct sock_filter`).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(clippy::exhaustive_structs)]
pub struct SockFilter {
    /// Opcode.
    pub code: u16,
    /// Jump offset if true.
    pub jt: u8,
    /// Jump offset if false.
    pub jf: u8,
    /// Generic operand.
    pub k: u32,
}

#[repr(C)]
struct SockFprog {
    len: u16,
    filter: *const SockFilter,
}

const SECCOMP_SET_MODE_FILTER: c_ulong = 1;
const CAP_V3: u32 = 0x2008_0522;
const TIOCVHANGUP: c_ulong = 0x5437;
const LOOP_CTL_GET_FREE: c_ulong = 0x4C82;
const LOOP_SET_FD: c_ulong = 0x4C00;

fn cvt(ret: c_int) -> io::Result<c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn cvt_long(ret: libc::c_long) -> io::Result<libc::c_long> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Takes ownership of a freshly returned descriptor.
fn owned(fd: c_int) -> io::Result<OwnedFd> {
    let fd = cvt(fd)?;
    // SAFETY: the kernel just returned this descriptor and nobody else owns it.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Closes every descriptor >= 3 that is not in `keep`.
///
/// Uses `close_range(2)` over the gaps, falling back to closing one by one up
/// to `_SC_OPEN_MAX` on kernels without it.
pub fn close_all_except(keep: &[RawFd]) -> io::Result<()> {
    let mut keep: Vec<u32> = keep
        .iter()
        .filter_map(|&fd| u32::try_from(fd).ok())
        .filter(|&fd| fd >= 3)
        .collect();
    keep.sort_unstable();
    keep.dedup();

    let mut lo = 3u32;
    let mut ranged = true;
    for bound in keep.iter().copied().chain(std::iter::once(u32::MAX)) {
        if bound > lo {
            let hi = if bound == u32::MAX { u32::MAX } else { bound - 1 };
            // SAFETY: close_range only closes descriptors; no memory is touched.
            let ret = unsafe { libc::syscall(libc::SYS_close_range, lo, hi, 0u32) };
            if ret != 0 {
                ranged = false;
                break;
            }
        }
        lo = bound.saturating_add(1);
    }
    if ranged {
        return Ok(());
    }

    // SAFETY: sysconf has no memory-safety preconditions.
    let max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let limit = c_int::try_from(max).ok().filter(|&m| m > 0).unwrap_or(1024);
    for fd in 3..limit {
        if !keep.contains(&fd.unsigned_abs()) {
            // SAFETY: closing an unowned or invalid descriptor is harmless here:
            // the child owns its whole table.
            unsafe { libc::close(fd) };
        }
    }
    Ok(())
}

/// `dup2(old, new)`; the result does not have `FD_CLOEXEC` set.
pub fn dup2(old: RawFd, new: RawFd) -> io::Result<()> {
    if old == new {
        return set_cloexec(new, false);
    }
    // SAFETY: dup2 only manipulates the descriptor table.
    cvt(unsafe { libc::dup2(old, new) }).map(drop)
}

/// Duplicates `fd` onto the lowest free number >= `min`, with `FD_CLOEXEC`.
pub fn dup_above(fd: RawFd, min: RawFd) -> io::Result<RawFd> {
    // SAFETY: F_DUPFD_CLOEXEC only manipulates the descriptor table.
    cvt(unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, min) })
}

/// Closes a raw descriptor the child owns.
pub fn close(fd: RawFd) {
    // SAFETY: the caller owns `fd` and does not use it afterwards.
    unsafe { libc::close(fd) };
}

/// Sets or clears `FD_CLOEXEC`.
pub fn set_cloexec(fd: RawFd, on: bool) -> io::Result<()> {
    // SAFETY: F_GETFD/F_SETFD have no memory-safety preconditions.
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    let new = if on {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    if new != flags {
        // SAFETY: as above.
        cvt(unsafe { libc::fcntl(fd, libc::F_SETFD, new) })?;
    }
    Ok(())
}

/// `(st_dev, st_ino)` of an open descriptor.
pub fn dev_ino(fd: RawFd) -> io::Result<(u64, u64)> {
    // SAFETY: `st` is a valid out-pointer for fstat.
    let mut st: libc::stat = unsafe { mem::zeroed() };
    cvt(unsafe { libc::fstat(fd, &raw mut st) })?;
    #[allow(clippy::useless_conversion)]
    Ok((u64::from(st.st_dev), u64::from(st.st_ino)))
}

/// Creates an `O_CLOEXEC` pipe, returning `(read, write)`.
pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [-1; 2];
    // SAFETY: `fds` is a valid 2-element array.
    cvt(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) })?;
    // SAFETY: both descriptors are valid after a successful pipe2().
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Creates an `AF_UNIX` datagram socket pair with `SOCK_CLOEXEC`.
pub fn socketpair_dgram() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [-1; 2];
    // SAFETY: `fds` is a valid 2-element array.
    cvt(unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    })?;
    // SAFETY: both descriptors are valid after a successful socketpair().
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Creates a blocking, close-on-exec eventfd with a zero counter.
pub fn eventfd() -> io::Result<OwnedFd> {
    // SAFETY: eventfd has no memory-safety preconditions.
    owned(unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) })
}

/// Creates a sealed-size anonymous file holding `data`, rewound to offset 0.
pub fn memfd_with(name: &CStr, data: &[u8]) -> io::Result<OwnedFd> {
    // SAFETY: `name` is a valid NUL-terminated string.
    let fd = owned(unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) })?;
    let mut file = std::fs::File::from(fd);
    io::Write::write_all(&mut file, data)?;
    io::Seek::rewind(&mut file)?;
    Ok(OwnedFd::from(file))
}

/// Sends one descriptor over a unix socket with `SCM_RIGHTS`.
pub fn send_fd(sock: BorrowedFd<'_>, fd: BorrowedFd<'_>) -> io::Result<()> {
    let mut byte = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: byte.as_mut_ptr().cast(),
        iov_len: 1,
    };
    let raw = fd.as_raw_fd();
    // SAFETY: CMSG_SPACE is a pure size computation.
    let space = unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as usize;
    let mut control = vec![0u8; space];

    // SAFETY: msghdr is plain data; every pointer set below outlives sendmsg.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &raw mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = space as _;

    // SAFETY: `control` is large enough for one cmsg holding one fd.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&raw const msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
        ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), raw);
    }
    // SAFETY: `msg` is fully initialised above.
    cvt_long(unsafe { libc::sendmsg(sock.as_raw_fd(), &raw const msg, libc::MSG_NOSIGNAL) } as _)
        .map(drop)
}

/// Receives one descriptor sent with [`send_fd`] without blocking.
///
/// Returns `Ok(None)` when nothing is queued.
pub fn recv_fd(sock: BorrowedFd<'_>) -> io::Result<Option<OwnedFd>> {
    let mut byte = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: byte.as_mut_ptr().cast(),
        iov_len: 1,
    };
    // SAFETY: CMSG_SPACE is a pure size computation.
    let space = unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as usize;
    let mut control = vec![0u8; space];

    // SAFETY: msghdr is plain data; every pointer set below outlives recvmsg.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &raw mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = space as _;

    // SAFETY: `msg` points at live buffers of the advertised sizes.
    let ret = unsafe {
        libc::recvmsg(
            sock.as_raw_fd(),
            &raw mut msg,
            libc::MSG_DONTWAIT | libc::MSG_CMSG_CLOEXEC,
        )
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        return if err.kind() == io::ErrorKind::WouldBlock {
            Ok(None)
        } else {
            Err(err)
        };
    }
    // SAFETY: the kernel filled `control`; we only read headers it wrote.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&raw const msg);
        if cmsg.is_null()
            || (*cmsg).cmsg_level != libc::SOL_SOCKET
            || (*cmsg).cmsg_type != libc::SCM_RIGHTS
        {
            return Ok(None);
        }
        let fd = ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>());
        Ok(Some(OwnedFd::from_raw_fd(fd)))
    }
}

/// Connects a stream socket to `path` after binding it to the abstract
/// address `abstract_name` (without the leading NUL).
pub fn connect_unix_bound(path: &CStr, abstract_name: &[u8]) -> io::Result<OwnedFd> {
    // SAFETY: socket has no memory-safety preconditions.
    let fd = owned(unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) })?;

    // SAFETY: sockaddr_un is plain data.
    let mut local: libc::sockaddr_un = unsafe { mem::zeroed() };
    local.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let max = local.sun_path.len() - 1;
    let name = &abstract_name[..abstract_name.len().min(max)];
    for (dst, &b) in local.sun_path[1..].iter_mut().zip(name) {
        *dst = b as libc::c_char;
    }
    let local_len = mem::size_of::<libc::sa_family_t>() + 1 + name.len();
    // SAFETY: `local` is a valid sockaddr_un of at least `local_len` bytes.
    cvt(unsafe {
        libc::bind(
            fd.as_raw_fd(),
            (&raw const local).cast(),
            local_len as libc::socklen_t,
        )
    })?;

    // SAFETY: sockaddr_un is plain data.
    let mut remote: libc::sockaddr_un = unsafe { mem::zeroed() };
    remote.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.to_bytes();
    if bytes.len() > max {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "socket path too long"));
    }
    for (dst, &b) in remote.sun_path.iter_mut().zip(bytes) {
        *dst = b as libc::c_char;
    }
    // SAFETY: `remote` is a valid, NUL-terminated sockaddr_un.
    cvt(unsafe {
        libc::connect(
            fd.as_raw_fd(),
            (&raw const remote).cast(),
            mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
        )
    })?;
    Ok(fd)
}

/// `shutdown(fd, how)`.
pub fn shutdown(fd: BorrowedFd<'_>, how: c_int) -> io::Result<()> {
    // SAFETY: shutdown has no memory-safety preconditions.
    cvt(unsafe { libc::shutdown(fd.as_raw_fd(), how) }).map(drop)
}

fn prctl(option: c_int, arg: c_ulong) -> io::Result<c_int> {
    // SAFETY: every option passed by this module takes scalar arguments only.
    cvt(unsafe { libc::prctl(option, arg, 0 as c_ulong, 0 as c_ulong, 0 as c_ulong) })
}

/// `PR_SET_KEEPCAPS`: keep permitted capabilities across the uid change.
pub fn set_keep_caps(on: bool) -> io::Result<()> {
    prctl(libc::PR_SET_KEEPCAPS, c_ulong::from(on)).map(drop)
}

/// `PR_SET_NO_NEW_PRIVS`.
pub fn set_no_new_privs() -> io::Result<()> {
    prctl(libc::PR_SET_NO_NEW_PRIVS, 1).map(drop)
}

/// `PR_SET_SECUREBITS`.
pub fn set_securebits(bits: u32) -> io::Result<()> {
    prctl(libc::PR_SET_SECUREBITS, c_ulong::from(bits)).map(drop)
}

/// `PR_GET_SECUREBITS`.
pub fn securebits() -> io::Result<u32> {
    prctl(libc::PR_GET_SECUREBITS, 0).map(c_int::cast_unsigned)
}

/// `PR_SET_PDEATHSIG`.
pub fn set_parent_death_signal(sig: c_int) -> io::Result<()> {
    prctl(libc::PR_SET_PDEATHSIG, sig.unsigned_abs().into()).map(drop)
}

/// `PR_CAPBSET_DROP`.
pub fn bounding_drop(cap: u8) -> io::Result<()> {
    prctl(libc::PR_CAPBSET_DROP, cap.into()).map(drop)
}

/// Whether the kernel supports ambient capabilities.
pub fn ambient_supported() -> bool {
    // SAFETY: PR_CAP_AMBIENT_IS_SET takes scalar arguments only.
    unsafe {
        libc::prctl(
            libc::PR_CAP_AMBIENT,
            libc::PR_CAP_AMBIENT_IS_SET as c_ulong,
            0 as c_ulong,
            0 as c_ulong,
            0 as c_ulong,
        ) >= 0
    }
}

/// `PR_CAP_AMBIENT_RAISE`.
pub fn ambient_raise(cap: u8) -> io::Result<()> {
    // SAFETY: PR_CAP_AMBIENT_RAISE takes scalar arguments only.
    cvt(unsafe {
        libc::prctl(
            libc::PR_CAP_AMBIENT,
            libc::PR_CAP_AMBIENT_RAISE as c_ulong,
            c_ulong::from(cap),
            0 as c_ulong,
            0 as c_ulong,
        )
    })
    .map(drop)
}

#[repr(C)]
struct CapHeader {
    version: u32,
    pid: c_int,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CapData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

/// The three capability sets of the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(clippy::exhaustive_structs)]
pub struct CapState {
    /// Effective set.
    pub effective: u64,
    /// Permitted set.
    pub permitted: u64,
    /// Inheritable set.
    pub inheritable: u64,
}

/// `capget(2)` for the calling thread.
pub fn capabilities() -> io::Result<CapState> {
    let mut hdr = CapHeader {
        version: CAP_V3,
        pid: 0,
    };
    let mut data = [CapData::default(); 2];
    // SAFETY: header and a two-element data array, as required by v3.
    cvt_long(unsafe { libc::syscall(libc::SYS_capget, &raw mut hdr, data.as_mut_ptr()) })?;
    let join = |lo: u32, hi: u32| u64::from(lo) | (u64::from(hi) << 32);
    Ok(CapState {
        effective: join(data[0].effective, data[1].effective),
        permitted: join(data[0].permitted, data[1].permitted),
        inheritable: join(data[0].inheritable, data[1].inheritable),
    })
}

/// `capset(2)` for the calling thread.
#[allow(clippy::cast_possible_truncation)]
pub fn set_capabilities(state: CapState) -> io::Result<()> {
    let mut hdr = CapHeader {
        version: CAP_V3,
        pid: 0,
    };
    let split = |v: u64| (v as u32, (v >> 32) as u32);
    let (e0, e1) = split(state.effective);
    let (p0, p1) = split(state.permitted);
    let (i0, i1) = split(state.inheritable);
    let data = [
        CapData {
            effective: e0,
            permitted: p0,
            inheritable: i0,
        },
        CapData {
            effective: e1,
            permitted: p1,
            inheritable: i1,
        },
    ];
    // SAFETY: header and a two-element data array, as required by v3.
    cvt_long(unsafe { libc::syscall(libc::SYS_capset, &raw mut hdr, data.as_ptr()) }).map(drop)
}

/// Loads a seccomp filter program for the calling thread.
pub fn seccomp_load(program: &[SockFilter]) -> io::Result<()> {
    let len = u16::try_from(program.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "filter program too long"))?;
    let prog = SockFprog {
        len,
        filter: program.as_ptr(),
    };
    // SAFETY: `prog` points at `len` valid instructions that outlive the call.
    cvt_long(unsafe {
        libc::syscall(
            libc::SYS_seccomp,
            SECCOMP_SET_MODE_FILTER,
            0 as c_ulong,
            &raw const prog,
        )
    })
    .map(drop)
}

/// `personality(2)`.
pub fn set_personality(persona: u32) -> io::Result<()> {
    // SAFETY: personality has no memory-safety preconditions.
    cvt(unsafe { libc::personality(c_ulong::from(persona)) }).map(drop)
}

/// `setpriority(PRIO_PROCESS, 0, nice)`.
pub fn set_nice(nice: i32) -> io::Result<()> {
    // SAFETY: setpriority has no memory-safety preconditions.
    cvt(unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) }).map(drop)
}

/// Kernel maximum number of supplementary groups.
pub fn ngroups_max() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let n = unsafe { libc::sysconf(libc::_SC_NGROUPS_MAX) };
    usize::try_from(n).ok().filter(|&n| n > 0).unwrap_or(65_536)
}

/// `fsetxattr(2)`.
pub fn fsetxattr(fd: BorrowedFd<'_>, name: &CStr, value: &[u8]) -> io::Result<()> {
    // SAFETY: `name` is NUL-terminated, `value` is a live slice of `len` bytes.
    cvt(unsafe {
        libc::fsetxattr(
            fd.as_raw_fd(),
            name.as_ptr(),
            value.as_ptr().cast(),
            value.len(),
            0,
        )
    })
    .map(drop)
}

/// Restores the default disposition of every catchable signal.
pub fn reset_signal_handlers() {
    for sig in 1..libc::SIGRTMAX() + 1 {
        if sig == libc::SIGKILL || sig == libc::SIGSTOP {
            continue;
        }
        // SAFETY: a zeroed sigaction with SIG_DFL is a valid disposition;
        // unknown signal numbers just return EINVAL.
        unsafe {
            let mut sa: libc::sigaction = mem::zeroed();
            sa.sa_sigaction = libc::SIG_DFL;
            libc::sigaction(sig, &raw const sa, ptr::null_mut());
        }
    }
}

/// Sets the disposition of `sig` to `SIG_IGN`.
pub fn ignore_signal(sig: c_int) -> io::Result<()> {
    // SAFETY: a zeroed sigaction with SIG_IGN is a valid disposition.
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = libc::SIG_IGN;
        cvt(libc::sigaction(sig, &raw const sa, ptr::null_mut())).map(drop)
    }
}

/// Makes `fd` the controlling terminal (`TIOCSCTTY`), stealing it if `force`.
pub fn set_controlling_tty(fd: RawFd, force: bool) -> io::Result<()> {
    // SAFETY: TIOCSCTTY takes an integer argument.
    cvt(unsafe { libc::ioctl(fd, libc::TIOCSCTTY as _, c_int::from(force)) }).map(drop)
}

/// Hangs up other sessions on the terminal (`TIOCVHANGUP`).
pub fn vhangup(fd: RawFd) -> io::Result<()> {
    // SAFETY: TIOCVHANGUP takes no argument.
    cvt(unsafe { libc::ioctl(fd, TIOCVHANGUP as _) }).map(drop)
}

/// Attaches `image` to a free loop device and returns the device path.
pub fn loop_attach(image: BorrowedFd<'_>) -> io::Result<String> {
    // SAFETY: the path literal is NUL-terminated.
    let ctl = owned(unsafe {
        libc::open(
            c"/dev/loop-control".as_ptr(),
            libc::O_RDWR | libc::O_CLOEXEC,
        )
    })?;
    // SAFETY: LOOP_CTL_GET_FREE takes no argument.
    let n = cvt(unsafe { libc::ioctl(ctl.as_raw_fd(), LOOP_CTL_GET_FREE as _) })?;
    let path = format!("/dev/loop{n}");
    let c = CString::new(path.clone())?;
    // SAFETY: `c` is NUL-terminated.
    let dev = owned(unsafe { libc::open(c.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) })?;
    // SAFETY: LOOP_SET_FD takes the backing descriptor as argument.
    cvt(unsafe { libc::ioctl(dev.as_raw_fd(), LOOP_SET_FD as _, image.as_raw_fd()) })?;
    Ok(path)
}

/// Replaces the process image. Returns only on failure.
pub fn execve(path: &CStr, argv: &[CString], envp: &[CString]) -> io::Error {
    let mut args: Vec<*const libc::c_char> = argv.iter().map(|a| a.as_ptr()).collect();
    args.push(ptr::null());
    let mut env: Vec<*const libc::c_char> = envp.iter().map(|e| e.as_ptr()).collect();
    env.push(ptr::null());
    // SAFETY: both arrays are NULL-terminated and their strings outlive the call.
    unsafe { libc::execve(path.as_ptr(), args.as_ptr(), env.as_ptr()) };
    io::Error::last_os_error()
}

/// Terminates the calling process immediately, skipping destructors and
/// `atexit` handlers shared with the parent.
pub fn exit_immediately(code: i32) -> ! {
    // SAFETY: _exit never returns and has no preconditions.
    unsafe { libc::_exit(code) }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::fd::AsFd;

    use super::*;

    #[test]
    fn descriptor_passes_through_socketpair() {
        let (a, b) = socketpair_dgram().unwrap();
        let (r, w) = pipe().unwrap();
        send_fd(a.as_fd(), w.as_fd()).unwrap();
        drop(w);

        let got = recv_fd(b.as_fd()).unwrap().expect("descriptor queued");
        let mut writer = std::fs::File::from(got);
        writer.write_all(b"ns").unwrap();
        drop(writer);

        let mut buf = String::new();
        std::fs::File::from(r).read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "ns");
    }

    #[test]
    fn empty_socket_yields_none() {
        let (_a, b) = socketpair_dgram().unwrap();
        assert!(recv_fd(b.as_fd()).unwrap().is_none());
    }

    #[test]
    fn memfd_is_rewound() {
        let fd = memfd_with(c"stdin", b"hello").unwrap();
        let mut s = String::new();
        std::fs::File::from(fd).read_to_string(&mut s).unwrap();
        assert_eq!(s, "hello");
    }

    #[test]
    fn cloexec_toggles() {
        let (r, _w) = pipe().unwrap();
        set_cloexec(r.as_raw_fd(), false).unwrap();
        // SAFETY: querying flags of a live descriptor.
        let flags = unsafe { libc::fcntl(r.as_raw_fd(), libc::F_GETFD) };
        assert_eq!(flags & libc::FD_CLOEXEC, 0);
        set_cloexec(r.as_raw_fd(), true).unwrap();
        let flags = unsafe { libc::fcntl(r.as_raw_fd(), libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
    }

    #[test]
    fn capget_reports_consistent_sets() {
        let caps = capabilities().unwrap();
        assert_eq!(caps.effective & !caps.permitted, 0);
    }

    #[test]
    fn ngroups_max_is_positive() {
        assert!(ngroups_max() >= 32);
    }
}
