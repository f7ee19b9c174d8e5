use crate::core::{Core, MAJOR, MINOR, REVISION};
use crate::parser;
use crate::word::Cell;
use crate::throw;

/// Environment queries.
pub trait Environment: Core {
    fn add_environment(&mut self) {
        self.add_primitive("max-n", Environment::max_n);
        self.add_primitive("max-u", Environment::max_u);
        self.add_primitive("version", Environment::version);
    }

    /// Run-time: ( -- n )
    ///
    /// Largest usable signed integer.
    fn max_n(&mut self) {
        self.push(Cell::max_value());
    }

    /// Run-time: ( -- u )
    ///
    /// Largest usable unsigned integer.
    fn max_u(&mut self) {
        self.push(usize::max_value() as Cell);
    }

    /// Run-time: ( -- major minor revision )
    ///
    /// The version digits are read in the current radix.
    fn version(&mut self) {
        let base = self.current_base();
        for part in &[MAJOR, MINOR, REVISION] {
            match parser::str_literal(part, base) {
                Ok(v) => self.push(v),
                Err(e) => {
                    throw!(self, e);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::core::Core;
    use crate::vm::VM;

    #[test]
    fn test_max_n_wraps() {
        let vm = &mut VM::new();
        vm.set_source("max-n dup ++ +");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert_eq!(vm.s_stack().as_slice(), [-1]);
    }

    #[test]
    fn test_max_u_wraps() {
        let vm = &mut VM::new();
        vm.set_source("max-u ++");
        vm.evaluate_input();
        assert_eq!(vm.s_stack().as_slice(), [0]);
    }

    #[test]
    fn test_version() {
        let vm = &mut VM::new();
        vm.set_source("version");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert_eq!(vm.s_stack().as_slice(), [0, 1, 48]);
    }
}
