//! the exported C entry points that shadow libc

use libc::{c_char, c_int, c_void, mode_t, size_t, sockaddr, socklen_t, ssize_t};
use libfaultinj_macros::interceptor;

use crate::ops::{IoOps, INTERPOSER};
use crate::resolver::{
    REAL_CLOSE, REAL_DUP2, REAL_DUP3, REAL_OPEN, REAL_OPEN64, REAL_OPEN64_2, REAL_OPENAT,
    REAL_OPENAT64, REAL_OPENAT64_2, REAL_OPENAT_2, REAL_OPEN_2, REAL_READ, REAL_SEND,
    REAL_SENDTO, REAL_WRITE,
};
use crate::types::Hook;

// `mode` is variadic in C; reading it as a fixed argument is sound on the
// System V ABI and it is only meaningful with O_CREAT or O_TMPFILE anyway

#[interceptor(real = REAL_OPEN)]
pub unsafe extern "C" fn open(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    INTERPOSER.open(Hook::Open, path, flags, mode)
}

#[interceptor(real = REAL_OPEN64)]
pub unsafe extern "C" fn open64(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    INTERPOSER.open(Hook::Open64, path, flags, mode)
}

// glibc's _FORTIFY_SOURCE wrappers, called instead of open/openat when the
// flags are known not to need a mode

#[interceptor(real = REAL_OPEN_2)]
pub unsafe extern "C" fn __open_2(path: *const c_char, flags: c_int) -> c_int {
    INTERPOSER.open(Hook::Open2, path, flags, 0)
}

#[interceptor(real = REAL_OPEN64_2)]
pub unsafe extern "C" fn __open64_2(path: *const c_char, flags: c_int) -> c_int {
    INTERPOSER.open(Hook::Open64_2, path, flags, 0)
}

#[interceptor(real = REAL_OPENAT)]
pub unsafe extern "C" fn openat(
    dirfd: c_int,
    path: *const c_char,
    flags: c_int,
    mode: mode_t,
) -> c_int {
    INTERPOSER.openat(Hook::OpenAt, dirfd, path, flags, mode)
}

#[interceptor(real = REAL_OPENAT64)]
pub unsafe extern "C" fn openat64(
    dirfd: c_int,
    path: *const c_char,
    flags: c_int,
    mode: mode_t,
) -> c_int {
    INTERPOSER.openat(Hook::OpenAt64, dirfd, path, flags, mode)
}

#[interceptor(real = REAL_OPENAT_2)]
pub unsafe extern "C" fn __openat_2(dirfd: c_int, path: *const c_char, flags: c_int) -> c_int {
    INTERPOSER.openat(Hook::OpenAt2, dirfd, path, flags, 0)
}

#[interceptor(real = REAL_OPENAT64_2)]
pub unsafe extern "C" fn __openat64_2(dirfd: c_int, path: *const c_char, flags: c_int) -> c_int {
    INTERPOSER.openat(Hook::OpenAt64_2, dirfd, path, flags, 0)
}

#[interceptor(real = REAL_SEND)]
pub unsafe extern "C" fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    INTERPOSER.send(fd, buf, len, flags)
}

#[interceptor(real = REAL_SENDTO)]
pub unsafe extern "C" fn sendto(
    fd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    addr: *const sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    INTERPOSER.sendto(fd, buf, len, flags, addr, addrlen)
}

#[interceptor(real = REAL_READ)]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    INTERPOSER.read(fd, buf, count)
}

#[interceptor(real = REAL_WRITE)]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    INTERPOSER.write(fd, buf, count)
}

#[interceptor(real = REAL_CLOSE)]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    INTERPOSER.close(fd)
}

#[interceptor(real = REAL_DUP2)]
pub unsafe extern "C" fn dup2(oldfd: c_int, newfd: c_int) -> c_int {
    INTERPOSER.dup2(oldfd, newfd)
}

#[interceptor(real = REAL_DUP3)]
pub unsafe extern "C" fn dup3(oldfd: c_int, newfd: c_int, flags: c_int) -> c_int {
    INTERPOSER.dup3(oldfd, newfd, flags)
}
