//! Syscall names, numbers and named groups for the native architecture.

/// Maps `name => libc::SYS_name` for every listed syscall.
macro_rules! table {
    ($($name:ident),* $(,)?) => {
        &[$((stringify!($name), libc::$name as i64)),*]
    };
}

/// Syscalls present on every supported architecture.
#[allow(clippy::cast_lossless, clippy::unnecessary_cast)]
const COMMON: &[(&str, i64)] = table![
    SYS_read, SYS_write, SYS_close, SYS_fstat, SYS_lseek, SYS_mmap, SYS_mprotect,
    SYS_munmap, SYS_brk, SYS_rt_sigaction, SYS_rt_sigprocmask, SYS_rt_sigreturn,
    SYS_ioctl, SYS_pread64, SYS_pwrite64, SYS_readv, SYS_writev, SYS_sched_yield,
    SYS_mremap, SYS_msync, SYS_mincore, SYS_madvise, SYS_shmget, SYS_shmat, SYS_shmctl,
    SYS_dup, SYS_dup3, SYS_nanosleep, SYS_getitimer, SYS_setitimer, SYS_getpid,
    SYS_sendfile, SYS_socket, SYS_connect, SYS_accept, SYS_accept4, SYS_sendto,
    SYS_recvfrom, SYS_sendmsg, SYS_recvmsg, SYS_sendmmsg, SYS_recvmmsg, SYS_shutdown,
    SYS_bind, SYS_listen, SYS_getsockname, SYS_getpeername, SYS_socketpair,
    SYS_setsockopt, SYS_getsockopt, SYS_clone, SYS_clone3, SYS_execve, SYS_execveat,
    SYS_exit, SYS_exit_group, SYS_wait4, SYS_waitid, SYS_kill, SYS_tkill, SYS_tgkill,
    SYS_uname, SYS_semget, SYS_semop, SYS_semctl, SYS_msgget, SYS_msgsnd, SYS_msgrcv,
    SYS_msgctl, SYS_fcntl, SYS_flock, SYS_fsync, SYS_fdatasync, SYS_truncate,
    SYS_ftruncate, SYS_getcwd, SYS_chdir, SYS_fchdir, SYS_fchmod, SYS_fchown, SYS_umask,
    SYS_gettimeofday, SYS_settimeofday, SYS_getrlimit, SYS_setrlimit, SYS_prlimit64,
    SYS_getrusage, SYS_sysinfo, SYS_times, SYS_ptrace, SYS_syslog, SYS_getuid, SYS_getgid,
    SYS_setuid, SYS_setgid, SYS_geteuid, SYS_getegid, SYS_setpgid, SYS_getppid,
    SYS_setsid, SYS_setreuid, SYS_setregid, SYS_getgroups, SYS_setgroups, SYS_setresuid,
    SYS_getresuid, SYS_setresgid, SYS_getresgid, SYS_getpgid, SYS_setfsuid, SYS_setfsgid,
    SYS_getsid, SYS_capget, SYS_capset, SYS_rt_sigpending, SYS_rt_sigtimedwait,
    SYS_rt_sigqueueinfo, SYS_rt_sigsuspend, SYS_sigaltstack, SYS_personality,
    SYS_statfs, SYS_fstatfs, SYS_getpriority, SYS_setpriority, SYS_sched_setparam,
    SYS_sched_getparam, SYS_sched_setscheduler, SYS_sched_getscheduler,
    SYS_sched_get_priority_max, SYS_sched_get_priority_min, SYS_sched_setattr,
    SYS_sched_getattr, SYS_sched_setaffinity, SYS_sched_getaffinity, SYS_mlock,
    SYS_mlock2, SYS_munlock, SYS_mlockall, SYS_munlockall, SYS_vhangup, SYS_pivot_root,
    SYS_prctl, SYS_adjtimex, SYS_chroot, SYS_sync, SYS_syncfs, SYS_acct, SYS_mount,
    SYS_umount2, SYS_swapon, SYS_swapoff, SYS_reboot, SYS_sethostname,
    SYS_setdomainname, SYS_init_module, SYS_finit_module, SYS_delete_module,
    SYS_quotactl, SYS_gettid, SYS_readahead, SYS_setxattr, SYS_lsetxattr, SYS_fsetxattr,
    SYS_getxattr, SYS_lgetxattr, SYS_fgetxattr, SYS_listxattr, SYS_removexattr,
    SYS_futex, SYS_set_tid_address, SYS_restart_syscall, SYS_timer_create,
    SYS_timer_settime, SYS_timer_gettime, SYS_timer_delete, SYS_clock_settime,
    SYS_clock_gettime, SYS_clock_getres, SYS_clock_nanosleep, SYS_clock_adjtime,
    SYS_epoll_ctl, SYS_epoll_pwait, SYS_epoll_create1, SYS_openat, SYS_openat2,
    SYS_mkdirat, SYS_mknodat, SYS_fchownat, SYS_unlinkat, SYS_renameat2, SYS_linkat,
    SYS_symlinkat, SYS_readlinkat, SYS_fchmodat, SYS_faccessat, SYS_faccessat2,
    SYS_pselect6, SYS_ppoll, SYS_unshare, SYS_setns, SYS_set_robust_list,
    SYS_get_robust_list, SYS_splice, SYS_tee, SYS_utimensat, SYS_signalfd4,
    SYS_timerfd_create, SYS_timerfd_settime, SYS_timerfd_gettime, SYS_eventfd2,
    SYS_pipe2, SYS_inotify_init1, SYS_inotify_add_watch, SYS_inotify_rm_watch,
    SYS_preadv, SYS_pwritev, SYS_preadv2, SYS_pwritev2, SYS_name_to_handle_at,
    SYS_open_by_handle_at, SYS_getcpu, SYS_process_vm_readv, SYS_process_vm_writev,
    SYS_kcmp, SYS_seccomp, SYS_getrandom, SYS_memfd_create, SYS_bpf, SYS_membarrier,
    SYS_copy_file_range, SYS_pkey_mprotect, SYS_statx, SYS_rseq, SYS_pidfd_open,
    SYS_pidfd_send_signal, SYS_pidfd_getfd, SYS_close_range, SYS_mount_setattr,
    SYS_open_tree, SYS_move_mount, SYS_fsopen, SYS_fsconfig, SYS_fsmount, SYS_fspick,
    SYS_kexec_load, SYS_kexec_file_load, SYS_perf_event_open, SYS_fanotify_init,
    SYS_fanotify_mark, SYS_add_key, SYS_request_key, SYS_keyctl, SYS_getdents64,
    SYS_io_setup, SYS_io_destroy, SYS_io_submit, SYS_io_getevents, SYS_io_cancel,
    SYS_io_uring_setup, SYS_io_uring_enter, SYS_io_uring_register, SYS_userfaultfd,
];

/// Syscalls that only exist on x86-64.
#[cfg(target_arch = "x86_64")]
#[allow(clippy::cast_lossless, clippy::unnecessary_cast)]
const ARCH: &[(&str, i64)] = table![
    SYS_open, SYS_stat, SYS_lstat, SYS_poll, SYS_access, SYS_pipe, SYS_select, SYS_dup2,
    SYS_pause, SYS_alarm, SYS_fork, SYS_vfork, SYS_getdents, SYS_rename, SYS_mkdir,
    SYS_rmdir, SYS_creat, SYS_link, SYS_unlink, SYS_symlink, SYS_readlink, SYS_chmod,
    SYS_chown, SYS_lchown, SYS_mknod, SYS_getpgrp, SYS_utime, SYS_utimes, SYS_time,
    SYS_arch_prctl, SYS_modify_ldt, SYS_iopl, SYS_ioperm, SYS__sysctl, SYS_epoll_create,
    SYS_epoll_wait, SYS_eventfd, SYS_signalfd, SYS_inotify_init, SYS_renameat,
    SYS_newfstatat, SYS_futimesat, SYS_ustat, SYS_sysfs, SYS_uselib, SYS_lookup_dcookie,
];

/// Syscalls that only exist on the generic (asm-generic) table.
#[cfg(not(target_arch = "x86_64"))]
#[allow(clippy::cast_lossless, clippy::unnecessary_cast)]
const ARCH: &[(&str, i64)] = table![SYS_renameat, SYS_newfstatat];

/// Named syscall groups. Members unknown on this architecture are skipped.
const GROUPS: &[(&str, &[&str])] = &[
    ("@clock", &["adjtimex", "clock_adjtime", "clock_settime", "settimeofday"]),
    ("@cpu-emulation", &["modify_ldt", "vm86", "vm86old"]),
    (
        "@debug",
        &[
            "lookup_dcookie",
            "perf_event_open",
            "pidfd_getfd",
            "process_vm_readv",
            "process_vm_writev",
            "ptrace",
        ],
    ),
    (
        "@default",
        &[
            "arch_prctl",
            "brk",
            "clock_getres",
            "clock_gettime",
            "clock_nanosleep",
            "execve",
            "exit",
            "exit_group",
            "futex",
            "get_robust_list",
            "getegid",
            "geteuid",
            "getgid",
            "getgroups",
            "getpgid",
            "getpgrp",
            "getpid",
            "getppid",
            "getrandom",
            "getresgid",
            "getresuid",
            "getrlimit",
            "getsid",
            "gettid",
            "gettimeofday",
            "getuid",
            "membarrier",
            "mmap",
            "mprotect",
            "munmap",
            "nanosleep",
            "pause",
            "prlimit64",
            "restart_syscall",
            "rseq",
            "rt_sigreturn",
            "sched_getaffinity",
            "sched_yield",
            "set_robust_list",
            "set_tid_address",
            "time",
        ],
    ),
    ("@keyring", &["add_key", "keyctl", "request_key"]),
    ("@module", &["delete_module", "finit_module", "init_module"]),
    (
        "@mount",
        &[
            "chroot",
            "fsconfig",
            "fsmount",
            "fsopen",
            "fspick",
            "mount",
            "mount_setattr",
            "move_mount",
            "open_tree",
            "pivot_root",
            "umount2",
        ],
    ),
    ("@raw-io", &["ioperm", "iopl"]),
    ("@reboot", &["kexec_file_load", "kexec_load", "reboot"]),
    ("@swap", &["swapoff", "swapon"]),
];

/// Number of `name` on this architecture.
pub fn number(name: &str) -> Option<i64> {
    COMMON
        .iter()
        .chain(ARCH)
        .find(|(n, _)| n.strip_prefix("SYS_") == Some(name))
        .map(|&(_, nr)| nr)
}

/// Members of a `@group`.
pub fn group(name: &str) -> Option<&'static [&'static str]> {
    GROUPS.iter().find(|(g, _)| *g == name).map(|&(_, m)| m)
}

/// Names of every known group.
pub fn group_names() -> impl Iterator<Item = &'static str> {
    GROUPS.iter().map(|&(g, _)| g)
}

/// Resolves a syscall or `@group` name into syscall numbers.
///
/// Unknown syscalls and group members missing on this architecture are
/// dropped; an unknown name yields an empty list and a warning.
pub fn expand(name: &str) -> Vec<i64> {
    if let Some(members) = group(name) {
        return members.iter().filter_map(|m| number(m)).collect();
    }
    number(name).map_or_else(
        || {
            tracing::warn!(syscall = name, "unknown syscall, ignoring");
            Vec::new()
        },
        |nr| vec![nr],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_match_libc() {
        assert_eq!(number("mount"), Some(libc::SYS_mount));
        assert_eq!(number("execve"), Some(libc::SYS_execve));
        assert_eq!(number("no_such_call"), None);
    }

    #[test]
    fn groups_expand_to_known_members() {
        let module = expand("@module");
        assert_eq!(module.len(), 3);
        assert!(module.contains(&libc::SYS_init_module));
        assert!(expand("@default").contains(&libc::SYS_execve));
    }

    #[test]
    fn unknown_names_expand_to_nothing() {
        assert!(expand("frobnicate").is_empty());
        assert!(expand("@nonexistent").is_empty());
    }

    #[test]
    fn every_group_member_name_is_wellformed() {
        for g in group_names() {
            assert!(g.starts_with('@'));
            for m in group(g).unwrap() {
                assert!(m.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
            }
        }
    }
}
