#![allow(non_camel_case_types, non_upper_case_globals, dead_code)]
#![allow(clippy::unreadable_literal, clippy::missing_safety_doc)]

use libc::*;

mod abi;

// Resolve ambiguity with the io_uring items newer libc versions carry.
pub use abi::io_uring_params;
pub use abi::open_how;

pub use abi::*;

#[cfg(not(feature = "direct-syscall"))]
pub unsafe fn io_uring_setup(entries: c_uint, p: *mut io_uring_params) -> c_int {
    syscall(libc::SYS_io_uring_setup, entries as c_long, p as c_long) as _
}

#[cfg(feature = "direct-syscall")]
pub unsafe fn io_uring_setup(entries: c_uint, p: *mut io_uring_params) -> c_int {
    sc::syscall2(
        libc::SYS_io_uring_setup as usize,
        entries as usize,
        p as usize,
    ) as _
}

#[cfg(not(feature = "direct-syscall"))]
pub unsafe fn io_uring_enter(
    fd: c_int,
    to_submit: c_uint,
    min_complete: c_uint,
    flags: c_uint,
    sig: *const sigset_t,
) -> c_int {
    syscall(
        libc::SYS_io_uring_enter,
        fd as c_long,
        to_submit as c_long,
        min_complete as c_long,
        flags as c_long,
        sig as c_long,
        core::mem::size_of::<sigset_t>() as c_long,
    ) as _
}

#[cfg(feature = "direct-syscall")]
pub unsafe fn io_uring_enter(
    fd: c_int,
    to_submit: c_uint,
    min_complete: c_uint,
    flags: c_uint,
    sig: *const sigset_t,
) -> c_int {
    sc::syscall6(
        libc::SYS_io_uring_enter as usize,
        fd as usize,
        to_submit as usize,
        min_complete as usize,
        flags as usize,
        sig as usize,
        core::mem::size_of::<sigset_t>(),
    ) as _
}
