use crate::core::{format_cell, Core, Interp, MAJOR, MINOR, REVISION};
use crate::exception::Exception;
use crate::word::{Cell, Xt};
use crate::{chk, throw};
use std::fs::OpenOptions;
use std::io::Write;

const FLAVOUR: &str = "Hosted";

/// Build flag reported in the banner: `D` checks stacks, `F` does not.
fn dbg_char() -> char {
    if cfg!(feature = "unchecked") {
        'F'
    } else {
        'D'
    }
}

/// Types that can output to console.
pub trait Output: Core {
    /// Add output primitives.
    fn add_output(&mut self) {
        self.add_primitive("emit", Output::emit);
        self.add_primitive("type", Output::p_type);
        self.add_primitive("cr", Output::cr);
        self.add_primitive(".", Output::dot);
        self.add_primitive("u.", Output::udot);
        self.add_primitive("banner", Output::banner);
        self.add_immediate("\"", Output::quote);
        self.add_immediate(".\"", Output::dot_quote);
        self.add_immediate(".(", Output::dot_comment);
        self.add_immediate("(", Output::comment);
        self.add_immediate("\\", Output::slash_comment);
        self.add_immediate("//", Output::slash_comment);
        self.add_primitive("utf8", Output::utf8);
        self.add_primitive("outfile", Output::outfile);
        self.add_primitive("closeout", Output::closeout);
        self.add_primitive("<#", Output::fmt_start);
        self.add_primitive("#", Output::fmt_digit);
        self.add_primitive("#s", Output::fmt_num);
        self.add_primitive("hold", Output::fmt_hold);
        self.add_primitive("sign", Output::fmt_sign);
        self.add_primitive("#>", Output::fmt_end);
        let idx_type = self.lookup("type").expect("type undefined").0;
        self.refs_mut().idx_type = idx_type;
    }

    /// Flush the output buffer to the current sink.
    fn flush(&mut self) {
        let buf = std::mem::take(self.output_buffer());
        if buf.is_empty() {
            return;
        }
        let result = match self.out_files().last_mut() {
            Some(file) => file.write_all(buf.as_bytes()),
            None => {
                let stdout = std::io::stdout();
                let mut handle = stdout.lock();
                handle
                    .write_all(buf.as_bytes())
                    .and_then(|_| handle.flush())
            }
        };
        if result.is_err() {
            throw!(self, Exception::SysCall);
        }
    }

    /// Run-time: ( x -- )
    ///
    /// Put the character x into the output buffer.
    fn emit(&mut self) {
        chk!(self, 1);
        let v = self.pop();
        if let Some(c) = std::char::from_u32(v as u32) {
            self.output_buffer().push(c);
        }
    }

    /// Run-time: ( straddr -- )
    ///
    /// Put the null-terminated string at straddr into the output buffer.
    fn p_type(&mut self) {
        chk!(self, 1);
        let addr = self.pop() as usize;
        if addr == 0 {
            return;
        }
        match self.flash_const().get_str(addr) {
            Ok(s) => {
                let s = s.to_string();
                self.push_output(&s);
            }
            Err(e) => throw!(self, e),
        }
    }

    fn cr(&mut self) {
        self.push_output("\n");
    }

    /// Run-time: ( n -- )
    ///
    /// Display n in the current radix, with a trailing space.
    fn dot(&mut self) {
        chk!(self, 1);
        let v = self.pop();
        let base = self.current_base();
        let mut s = format_cell(v, base, true);
        s.push(' ');
        self.push_output(&s);
    }

    /// Run-time: ( u -- )
    ///
    /// Display u unsigned in the current radix.
    fn udot(&mut self) {
        chk!(self, 1);
        let v = self.pop();
        let base = self.current_base();
        let s = format_cell(v, base, false);
        self.push_output(&s);
    }

    fn banner(&mut self) {
        if self.quiet() {
            return;
        }
        let msg = format!(
            "-- {}Forth alpha Version: {}.{}.{}{} ({})\n",
            FLAVOUR,
            MAJOR,
            MINOR,
            REVISION,
            dbg_char(),
            self.locale()
        );
        self.push_output(&msg);
    }

    /// Gather tokens up to `terminator` into the pad area; the terminator
    /// must end the last token.
    fn str_delimited(&mut self, terminator: char) -> Option<usize> {
        self.state().prompt_level += 1;
        let mut acc = String::new();
        loop {
            let tkn = match self.next_token() {
                Some(tkn) => tkn,
                None => {
                    self.state().prompt_level -= 1;
                    throw!(self, Exception::NoInput);
                    return None;
                }
            };
            if tkn.ends_with(terminator) {
                acc.push_str(&tkn[..tkn.len() - terminator.len_utf8()]);
                break;
            }
            acc.push_str(&tkn);
            acc.push(' ');
        }
        self.state().prompt_level -= 1;
        let here = self.flash().here();
        let pad = here + 20 * crate::word::CELL;
        match self.flash().put_str(pad, &acc) {
            Ok(()) => Some(pad),
            Err(e) => {
                throw!(self, e);
                None
            }
        }
    }

    /// Compilation: ( "ccc<quote>" -- ) capture the text, cache it and
    /// compile it as a literal. Run-time of the literal: ( -- straddr ).
    /// Interactive: leave the pad address of the transient text.
    fn quote(&mut self) {
        let addr = match self.str_delimited('"') {
            Some(addr) => addr,
            None => return,
        };
        self.push(addr as Cell);
        if self.state_const().state == Interp::Compiling {
            self.ssave();
            let lit = Xt(self.refs().idx_lit);
            self.push(lit.to_cell());
            self.comma();
            self.comma();
        }
    }

    /// `."` — as `"` but typed at run-time (or right away outside a
    /// definition).
    fn dot_quote(&mut self) {
        self.quote();
        if self.unwinding() {
            return;
        }
        if self.state_const().state == Interp::Compiling {
            let idx_type = Xt(self.refs().idx_type);
            self.push(idx_type.to_cell());
            self.comma();
        } else {
            self.p_type();
        }
    }

    /// `.(` — type the text up to `)` immediately.
    fn dot_comment(&mut self) {
        if let Some(addr) = self.str_delimited(')') {
            self.push(addr as Cell);
            self.p_type();
        }
    }

    /// `(` — inline comment up to `)`.
    fn comment(&mut self) {
        let _ = self.str_delimited(')');
    }

    /// `\` — comment to end of line.
    fn slash_comment(&mut self) {
        self.input_stack().skip_line();
        self.input_stack().take_eol();
    }

    /// ( ch buf len -- len ) Encode one character as UTF-8 into buf.
    fn utf8(&mut self) {
        chk!(self, 3);
        let len = self.pop() as usize;
        let addr = self.pop() as usize;
        let ch = self.pop();
        if let Err(e) = self.flash().fill(addr, len, 0) {
            throw!(self, e);
            return;
        }
        match std::char::from_u32(ch as u32) {
            Some(c) if c.len_utf8() <= len => {
                let mut buf = [0u8; 4];
                let encoded = c.encode_utf8(&mut buf).len();
                for (i, b) in buf[..encoded].iter().enumerate() {
                    let _ = self.flash().put_u8(addr + i, *b as Cell);
                }
                self.push(encoded as Cell);
            }
            _ => self.push(0),
        }
    }

    /// ( straddr -- ) Redirect output to a file opened for append.
    fn outfile(&mut self) {
        chk!(self, 1);
        let addr = self.pop() as usize;
        let path = match self.flash_const().get_str(addr) {
            Ok(s) => s.to_string(),
            Err(e) => {
                throw!(self, e);
                return;
            }
        };
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => self.out_files().push(file),
            Err(_) => throw!(self, Exception::NoFile),
        }
    }

    /// Close the current output file and fall back to the previous sink.
    fn closeout(&mut self) {
        self.flush();
        self.out_files().pop();
    }

    //------------------------
    // Pictured numeric output
    //------------------------

    /// ( n -- ptr n )
    ///
    /// Seed the formatter: borrow a scratch slot, clear it, and point just
    /// under its trailing null. Digits are built backwards from there.
    fn fmt_start(&mut self) {
        chk!(self, 1);
        let n = self.s_stack().last().unwrap_or(0);
        self.set_sign_negative(false);
        let (addr, len) = self.tmp_bufs().take();
        if let Err(e) = self.flash().fill(addr, len, 0) {
            throw!(self, e);
            return;
        }
        let v = self.pop();
        self.push((addr + len - 2) as Cell);
        self.push(v);
        if n < 0 {
            self.set_sign_negative(true);
        }
    }

    /// ( ptr n -- ptr-1 n' )
    ///
    /// Emit one digit in the current radix; a zero value holds `0`.
    fn fmt_digit(&mut self) {
        chk!(self, 2);
        const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
        let n = self.s_stack().last().unwrap_or(0);
        if n != 0 {
            if n < 0 {
                self.set_sign_negative(true);
            }
            let base = self.current_base().max(2).min(36);
            let n = self.pop();
            let ptr = self.pop() as usize;
            let digit = DIGITS[n.wrapping_rem(base).wrapping_abs() as usize];
            match self.flash().put_u8(ptr, digit as Cell) {
                Ok(()) => {}
                Err(e) => {
                    throw!(self, e);
                    return;
                }
            }
            self.push(ptr as Cell - 1);
            self.push(n.wrapping_div(base));
        } else {
            self.push('0' as Cell);
            self.fmt_hold();
        }
    }

    /// ( ptr x ch -- ptr-1 x )
    ///
    /// Insert a literal character.
    fn fmt_hold(&mut self) {
        chk!(self, 3);
        let ch = self.pop();
        let x = self.pop();
        let ptr = self.pop() as usize;
        match self.flash().put_u8(ptr, ch.wrapping_abs() & 0xff) {
            Ok(()) => {}
            Err(e) => {
                throw!(self, e);
                return;
            }
        }
        self.push(ptr as Cell - 1);
        self.push(x);
    }

    /// ( ptr n -- ptr n )
    ///
    /// Record that the value being formatted is negative.
    fn fmt_sign(&mut self) {
        chk!(self, 1);
        let n = self.s_stack().last().unwrap_or(0);
        if n < 0 {
            self.set_sign_negative(true);
        }
    }

    /// ( ptr n -- ptr 0 )
    ///
    /// Emit digits until the running value is zero.
    fn fmt_num(&mut self) {
        chk!(self, 2);
        while self.s_stack().last().unwrap_or(0) != 0 {
            self.fmt_digit();
            if self.unwinding() {
                return;
            }
        }
    }

    /// ( ptr n -- ptr' )
    ///
    /// Prefix a minus when the original value was negative, drop the spent
    /// value and leave the pointer at the first character.
    fn fmt_end(&mut self) {
        chk!(self, 2);
        if self.sign_negative() {
            self.push('-' as Cell);
            self.fmt_hold();
        }
        let _spent = self.pop();
        let ptr = self.pop();
        self.push(ptr + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::VM;
    use crate::word::UCell;

    #[test]
    fn test_dot() {
        let vm = &mut VM::new();
        vm.set_source("2 3 + .");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert_eq!(vm.output_buffer().as_str(), "5 ");
    }

    #[test]
    fn test_colon_and_dot() {
        let vm = &mut VM::new();
        vm.set_source(": sq dup * ; 7 sq .");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert_eq!(vm.output_buffer().as_str(), "49 ");
    }

    #[test]
    fn test_emit() {
        let vm = &mut VM::new();
        vm.set_source("42 emit 43 emit");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert!(vm.s_stack().is_empty());
        assert_eq!(vm.output_buffer().as_str(), "*+");
    }

    #[test]
    fn test_stars() {
        let vm = &mut VM::new();
        vm.set_source(": star 42 emit ; : stars 0 do star loop cr ; 5 stars");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert_eq!(vm.output_buffer().as_str(), "*****\n");
    }

    #[test]
    fn test_radix_display() {
        let vm = &mut VM::new();
        vm.set_source("decimal 255 hex . decimal 255 .");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert_eq!(vm.output_buffer().as_str(), "ff 255 ");
    }

    #[test]
    fn test_udot() {
        let vm = &mut VM::new();
        vm.set_source("-1 u.");
        vm.evaluate_input();
        let expected = format_cell(-1, 10, false);
        assert_eq!(vm.output_buffer().as_str(), expected.as_str());
        assert_eq!(expected, (UCell::max_value()).to_string());
    }

    #[test]
    fn test_quote_and_type() {
        let vm = &mut VM::new();
        vm.set_source("\" transient text\" type");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert_eq!(vm.output_buffer().as_str(), "transient text");
    }

    #[test]
    fn test_compiled_dot_quote() {
        let vm = &mut VM::new();
        vm.set_source(": greet .\" hello world\" cr ; greet greet");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert_eq!(vm.output_buffer().as_str(), "hello world\nhello world\n");
    }

    #[test]
    fn test_dot_comment_and_comment() {
        let vm = &mut VM::new();
        vm.set_source(".( loading) 1 ( two three ) 2 +");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert_eq!(vm.output_buffer().as_str(), "loading");
        assert_eq!(vm.s_stack().as_slice(), [3]);
    }

    #[test]
    fn test_line_comment() {
        let vm = &mut VM::new();
        vm.set_source("1 2 \\ 3 4\n+");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert_eq!(vm.s_stack().as_slice(), [3]);

        let vm = &mut VM::new();
        vm.set_source("5 // 6\n6 +");
        vm.evaluate_input();
        assert_eq!(vm.s_stack().as_slice(), [11]);
    }

    #[test]
    fn test_pictured_number() {
        let vm = &mut VM::new();
        vm.set_source("255 <# #s #> type");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert_eq!(vm.output_buffer().as_str(), "255");
    }

    #[test]
    fn test_pictured_negative() {
        let vm = &mut VM::new();
        vm.set_source("-42 <# #s #> type");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert_eq!(vm.output_buffer().as_str(), "-42");
    }

    #[test]
    fn test_pictured_zero() {
        let vm = &mut VM::new();
        vm.set_source("0 <# # #> type");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert_eq!(vm.output_buffer().as_str(), "0");
    }

    #[test]
    fn test_pictured_hold() {
        let vm = &mut VM::new();
        vm.set_source("255 <# #s 36 hold #> type");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert_eq!(vm.output_buffer().as_str(), "$255");
    }

    #[test]
    fn test_pictured_hex() {
        let vm = &mut VM::new();
        vm.set_source("hex 255 <# #s #> type");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        // 255 was read in hex.
        assert_eq!(vm.output_buffer().as_str(), "255");

        let vm = &mut VM::new();
        vm.set_source("255 hex <# #s #> type");
        vm.evaluate_input();
        assert_eq!(vm.output_buffer().as_str(), "ff");
    }

    #[test]
    fn test_pictured_nested_slots() {
        // Nested formatting must not clobber the outer buffer.
        let vm = &mut VM::new();
        vm.set_source("11 <# #s 22 <# #s #> type #> type");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert_eq!(vm.output_buffer().as_str(), "2211");
    }

    #[test]
    fn test_banner() {
        let vm = &mut VM::new();
        vm.set_source("banner");
        vm.evaluate_input();
        let out = vm.output_buffer().clone();
        assert!(out.starts_with("-- HostedForth alpha Version: 00.01.48"));
        assert!(out.contains('D') || out.contains('F'));
    }
}
