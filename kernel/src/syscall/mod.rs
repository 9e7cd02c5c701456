//! System-call dispatch surface
//!
//! The trap path lands here for `SVC #0`. The number travels in `x8`, the
//! return value goes back in `x0`. Individual handlers live outside the
//! core and register themselves at boot.

use crate::sync::SpinLock;
use crate::trap::TrapFrame;

pub const NR_SYSCALL: usize = 256;

/// A registered system-call handler. Arguments are read out of the trap
/// frame; the returned value is placed in `x0`.
pub type Handler = fn(&mut TrapFrame) -> i64;

static TABLE: SpinLock<[Option<Handler>; NR_SYSCALL]> =
    SpinLock::new("syscall", [None; NR_SYSCALL]);

/// Register a handler for `number`. Panics on a number outside the table;
/// that is a build-time wiring mistake, not a runtime condition.
pub fn register(number: usize, handler: Handler) {
    if number >= NR_SYSCALL {
        panic!("syscall::register: number {} out of range", number);
    }
    TABLE.lock()[number] = Some(handler);
}

/// Dispatch the system call described by `tf`.
pub fn dispatch(tf: &mut TrapFrame) {
    let number = tf.x[8] as usize;
    let handler = if number < NR_SYSCALL {
        TABLE.lock()[number]
    } else {
        None
    };
    match handler {
        Some(h) => {
            let ret = h(tf);
            tf.x[0] = ret as u64;
        }
        None => {
            log::warn!("unknown syscall {}", number);
            tf.x[0] = (-1i64) as u64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_getpid(_tf: &mut TrapFrame) -> i64 {
        42
    }

    #[test]
    fn registered_handler_sets_the_return_register() {
        register(7, fake_getpid);
        let mut tf = TrapFrame::zero();
        tf.x[8] = 7;
        dispatch(&mut tf);
        assert_eq!(tf.x[0], 42);
    }

    #[test]
    fn unknown_numbers_surface_minus_one() {
        let mut tf = TrapFrame::zero();
        tf.x[8] = 250;
        dispatch(&mut tf);
        assert_eq!(tf.x[0] as i64, -1);

        tf.x[8] = NR_SYSCALL as u64 + 10;
        dispatch(&mut tf);
        assert_eq!(tf.x[0] as i64, -1);
    }
}
