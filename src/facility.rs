use crate::core::Core;
use crate::exception::Exception;
use crate::word::Cell;
use crate::{chk, throw};

/// Host facilities: clocks, the dispatch counter and raw terminal input.
pub trait Facility: Core {
    fn add_facility(&mut self) {
        self.add_primitive("utime", Facility::utime);
        self.add_primitive("clks", Facility::clkspersec);
        self.add_primitive("ops", Facility::ops);
        self.add_primitive("noops", Facility::noops);
        self.add_primitive("key", Facility::key);
        self.add_primitive("?key", Facility::q_key);
        self.add_primitive("accept", Facility::accept);
    }

    /// Run-time: ( -- usecs )
    ///
    /// Microseconds since the epoch.
    #[cfg(unix)]
    fn utime(&mut self) {
        let mut tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        let rv = unsafe { libc::gettimeofday(&mut tv, std::ptr::null_mut()) };
        if rv < 0 {
            throw!(self, Exception::SysCall);
        } else {
            self.push((tv.tv_sec as Cell) * 1_000_000 + tv.tv_usec as Cell);
        }
    }

    #[cfg(not(unix))]
    fn utime(&mut self) {
        use std::time::{SystemTime, UNIX_EPOCH};
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => self.push(d.as_micros() as Cell),
            Err(_) => throw!(self, Exception::SysCall),
        }
    }

    /// Run-time: ( -- n ) Clock ticks per second.
    fn clkspersec(&mut self) {
        self.push(1_000_000);
    }

    /// Run-time: ( -- n ) Inner-interpreter dispatches so far.
    fn ops(&mut self) {
        let n = self.state_const().ops;
        self.push(n as Cell);
    }

    fn noops(&mut self) {
        self.state().ops = 0;
    }

    /// Run-time: ( -- char ) One byte from the input descriptor, zero at
    /// end of input. Raw-mode handling belongs to the terminal helper.
    #[cfg(unix)]
    fn key(&mut self) {
        let mut byte: u8 = 0;
        let n = unsafe { libc::read(0, &mut byte as *mut u8 as *mut libc::c_void, 1) };
        if n < 1 {
            self.push(0);
        } else {
            self.push(byte as Cell);
        }
    }

    #[cfg(not(unix))]
    fn key(&mut self) {
        use std::io::Read;
        let mut byte = [0u8; 1];
        match std::io::stdin().read(&mut byte) {
            Ok(1) => self.push(byte[0] as Cell),
            _ => self.push(0),
        }
    }

    /// Run-time: ( -- flag ) True when a key is waiting.
    #[cfg(unix)]
    fn q_key(&mut self) {
        unsafe {
            let mut fds: libc::fd_set = std::mem::zeroed();
            libc::FD_ZERO(&mut fds);
            libc::FD_SET(0, &mut fds);
            let mut tmo = libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            };
            let rv = libc::select(
                1,
                &mut fds,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                &mut tmo,
            );
            if rv < 0 {
                throw!(self, Exception::SysCall);
            } else {
                self.push(libc::FD_ISSET(0, &mut fds) as Cell);
            }
        }
    }

    #[cfg(not(unix))]
    fn q_key(&mut self) {
        self.push(0);
    }

    /// Run-time: ( buf len -- n )
    ///
    /// Read keys into buf until a line ends or it is full.
    fn accept(&mut self) {
        chk!(self, 2);
        let len = self.pop() as usize;
        let addr = self.pop() as usize;
        if let Err(e) = self.flash().fill(addr, len, 0) {
            throw!(self, e);
            return;
        }
        let mut count = 0usize;
        while count < len {
            self.key();
            let ch = self.pop();
            if ch == 0 {
                break;
            }
            if let Err(e) = self.flash().put_u8(addr + count, ch & 0xff) {
                throw!(self, e);
                return;
            }
            count += 1;
            if ch == '\r' as Cell || ch == '\n' as Cell {
                break;
            }
        }
        self.push(count as Cell);
    }
}

#[cfg(test)]
mod tests {
    use crate::core::Core;
    use crate::vm::VM;

    #[test]
    fn test_utime_monotonic_enough() {
        let vm = &mut VM::new();
        vm.set_source("utime utime swap - 0 >=");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert_eq!(vm.s_stack().as_slice(), [1]);
    }

    #[test]
    fn test_ops_counts_dispatches() {
        let vm = &mut VM::new();
        vm.set_source(": five 2 3 + ; noops five ops");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        let n = vm.pop();
        // (literal) 2, (literal) 3, + and the trailing ops dispatches.
        assert!(n >= 3);
    }

    #[test]
    fn test_clks() {
        let vm = &mut VM::new();
        vm.set_source("clks");
        vm.evaluate_input();
        assert_eq!(vm.s_stack().as_slice(), [1_000_000]);
    }
}
