use crate::core::Core;
use crate::word::{Code, Xt, CELL};
use crate::{chk, throw};

/// Programming tools: dictionary listing, stack display, decompiler and
/// return-stack dump.
pub trait Tools: Core {
    fn add_tools(&mut self) {
        self.add_primitive("words", Tools::words);
        self.add_primitive(".s", Tools::dot_s);
        self.add_primitive("see", Tools::see);
        self.add_primitive("dump", Tools::dump);
    }

    /// List every word, colon definitions newest-first, then primitives.
    fn words(&mut self) {
        let mut listing = String::new();
        for entry in self.colon_defs().iter().rev() {
            if let Ok(name) = self.flash_const().get_str(entry.nfa) {
                listing.push_str(name);
                listing.push(' ');
            }
        }
        for entry in self.primitives().iter() {
            if let Ok(name) = self.flash_const().get_str(entry.nfa) {
                listing.push_str(name);
                listing.push(' ');
            }
        }
        self.push_output(&listing);
    }

    /// Display the data stack, bottom first, without disturbing it.
    fn dot_s(&mut self) {
        self.print_stack();
    }

    /// ( xt -- ) Decompile a word.
    fn see(&mut self) {
        chk!(self, 1);
        let cell = self.pop();
        let xt = match Xt::from_cell(cell) {
            Ok(xt) => xt,
            Err(e) => {
                throw!(self, e);
                return;
            }
        };
        let (code, pfa, name) = match self.entry(xt) {
            Some(entry) => {
                let name = self
                    .flash_const()
                    .get_str(entry.nfa)
                    .unwrap_or("?")
                    .to_string();
                (entry.code, entry.pfa, name)
            }
            None => {
                throw!(self, crate::exception::Exception::NoWord);
                return;
            }
        };
        let mut listing = String::new();
        match code {
            Code::Primitive(_) => {
                listing.push_str(&format!("-- {} is native code.\n", name));
            }
            Code::Constant => {
                let v = self.flash_const().get_cell(pfa).unwrap_or(0);
                listing.push_str(&format!("-- {} constant value ({:#x}).\n", name, v));
            }
            Code::Field => {
                let v = self.flash_const().get_cell(pfa).unwrap_or(0);
                listing.push_str(&format!("-- {} variable value ({:#x}).\n", name, v));
            }
            Code::Colon => {
                listing.push_str(&format!("-- {} word.\n", name));
                let refs = self.refs();
                let mut ptr = pfa;
                loop {
                    let cell = match self.flash_const().get_cell(ptr) {
                        Ok(cell) => cell,
                        Err(_) => break,
                    };
                    if cell == 0 {
                        listing.push_str(&format!("{:x}  next\n", ptr));
                        break;
                    }
                    let word = cell as usize;
                    let word_name = self.name_of_cell(cell).unwrap_or_else(|| "?".to_string());
                    if word == refs.idx_branch || word == refs.idx_qbranch {
                        let target = self.flash_const().get_cell(ptr + CELL).unwrap_or(0);
                        listing.push_str(&format!("{:x}  {} -> {:x}\n", ptr, word_name, target));
                        ptr += CELL;
                    } else if word == refs.idx_lit {
                        let value = self.flash_const().get_cell(ptr + CELL).unwrap_or(0);
                        listing.push_str(&format!("{:x}  {} = {}\n", ptr, word_name, value));
                        ptr += CELL;
                    } else {
                        listing.push_str(&format!("{:x}  {}\n", ptr, word_name));
                    }
                    ptr += CELL;
                }
            }
        }
        self.push_output(&listing);
    }

    /// Dump the return stack as a backtrace.
    fn dump(&mut self) {
        self.dump_return_stack();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::VM;

    #[test]
    fn test_words_lists_newest_first() {
        let vm = &mut VM::new();
        vm.set_source(": first ; : second ; words");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        let out = vm.output_buffer().clone();
        let second = out.find("second ").unwrap();
        let first = out.find("first ").unwrap();
        assert!(second < first);
        assert!(out.contains("dup "));
    }

    #[test]
    fn test_dot_s_keeps_stack() {
        let vm = &mut VM::new();
        vm.set_source("1 2 .s");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert_eq!(vm.s_stack().as_slice(), [1, 2]);
        assert!(vm.output_buffer().contains("2 : 1 2 "));
    }

    #[test]
    fn test_see_primitive() {
        let vm = &mut VM::new();
        vm.set_source("' dup see");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert!(vm.output_buffer().contains("dup is native code"));
    }

    #[test]
    fn test_see_colon_definition() {
        let vm = &mut VM::new();
        vm.set_source(": sq dup * ; ' sq see");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        let out = vm.output_buffer().clone();
        assert!(out.contains("sq word"));
        assert!(out.contains("dup"));
        assert!(out.contains("*"));
        assert!(out.contains("next"));
    }

    #[test]
    fn test_see_literal_and_branch() {
        let vm = &mut VM::new();
        vm.set_source(": odd? 1 & if 1 else 0 then ; ' odd? see");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        let out = vm.output_buffer().clone();
        assert!(out.contains("(literal) = 1"));
        assert!(out.contains("?branch ->"));
        assert!(out.contains("branch ->"));
    }

    #[test]
    fn test_see_constant_and_variable() {
        let vm = &mut VM::new();
        vm.set_source("7 constant seven variable v ' seven see ' v see");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        let out = vm.output_buffer().clone();
        assert!(out.contains("seven constant value (0x7)"));
        assert!(out.contains("v variable value"));
    }
}
