//! Advisory CPU placement for the ingress and timer threads.
//!
//! Pinning a thread lets it keep its cache and TLB state on one core;
//! raising it to SCHED_FIFO lets it preempt ordinary CFS work. Both are
//! performance knobs, not correctness requirements, and both need
//! privileges the process may not have, so callers treat failures as
//! warnings.

use std::io;

/// Restrict the calling thread to a single CPU.
///
/// # Errors
/// The `sched_setaffinity` errno, typically `EINVAL` for a CPU id outside
/// the machine.
pub fn pin_to_cpu(cpu: usize) -> io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Move the calling thread to SCHED_FIFO at maximum priority.
///
/// # Errors
/// `EPERM` without `CAP_SYS_NICE`.
pub fn raise_priority() -> io::Result<()> {
    let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
    param.sched_priority = 99;
    let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(())
}
