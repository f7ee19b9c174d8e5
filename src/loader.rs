use crate::core::Core;
use crate::exception::Exception;
use crate::output::Output;
use crate::word::Cell;
use crate::{chk, throw};
use std::env;
use std::fs::File;
use std::io::{BufRead, BufReader};

/// Input sources at most, the keyboard included.
pub const SZ_FILES: usize = 4;

/// One nested input source: the keyboard at the bottom, include files above.
pub struct Source {
    reader: Option<BufReader<File>>,
    name: usize,
    buffer: String,
    cursor: usize,
    line: usize,
    eol: bool,
    drained: bool,
}

impl Source {
    fn terminal(name: usize) -> Source {
        Source {
            reader: None,
            name,
            buffer: String::with_capacity(128),
            cursor: 0,
            line: 0,
            eol: false,
            drained: true,
        }
    }

    fn file(reader: BufReader<File>, name: usize) -> Source {
        Source {
            reader: Some(reader),
            name,
            buffer: String::with_capacity(128),
            cursor: 0,
            line: 0,
            eol: false,
            drained: true,
        }
    }
}

/// The input stack: nested sources with per-source tokenizer state.
pub struct InputStack {
    sources: Vec<Source>,
}

impl InputStack {
    /// Token handed out when a source runs dry; bound to a primitive that
    /// pops the source.
    pub const INEOF: &'static str = "<eof>";

    pub fn new(tty_name: usize) -> InputStack {
        InputStack {
            sources: vec![Source::terminal(tty_name)],
        }
    }

    pub fn depth(&self) -> usize {
        self.sources.len()
    }

    /// True when the current source is the keyboard.
    pub fn is_terminal(&self) -> bool {
        self.sources.len() == 1
    }

    fn top(&mut self) -> &mut Source {
        self.sources.last_mut().expect("input stack empty")
    }

    pub fn current_name(&self) -> usize {
        self.sources.last().map(|s| s.name).unwrap_or(0)
    }

    pub fn current_line(&self) -> usize {
        self.sources.last().map(|s| s.line).unwrap_or(0)
    }

    pub fn current_buffer(&self) -> &str {
        self.sources.last().map(|s| s.buffer.as_str()).unwrap_or("")
    }

    /// Hand the current source a fresh line.
    pub fn refill(&mut self, line: String) {
        let src = self.top();
        src.buffer = line;
        src.cursor = 0;
        src.line += 1;
        src.drained = false;
    }

    /// Read the next line of the current file source. `Ok(false)` is
    /// end of file.
    pub fn refill_from_file(&mut self) -> Result<bool, Exception> {
        let src = self.top();
        let reader = match src.reader.as_mut() {
            Some(reader) => reader,
            None => return Err(Exception::SysCall),
        };
        src.buffer.clear();
        match reader.read_line(&mut src.buffer) {
            Ok(0) => Ok(false),
            Ok(_) => {
                src.cursor = 0;
                src.line += 1;
                src.drained = false;
                Ok(true)
            }
            Err(_) => Err(Exception::SysCall),
        }
    }

    /// Next whitespace-delimited token of the current source, or `None`
    /// when the buffer is drained and needs a refill.
    pub fn scan_token(&mut self) -> Option<String> {
        let src = self.top();
        if src.drained {
            return None;
        }
        let bytes = src.buffer.as_bytes();
        let mut tkn = Vec::new();
        while src.cursor < bytes.len() {
            let b = bytes[src.cursor];
            src.cursor += 1;
            match b {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    if b == b'\n' {
                        src.eol = true;
                    }
                    if !tkn.is_empty() {
                        return String::from_utf8(tkn).ok();
                    }
                }
                _ => tkn.push(b),
            }
        }
        src.drained = true;
        if tkn.is_empty() {
            None
        } else {
            String::from_utf8(tkn).ok()
        }
    }

    /// Consume the rest of the current line; used by line comments.
    pub fn skip_line(&mut self) {
        let src = self.top();
        let bytes = src.buffer.as_bytes();
        while src.cursor < bytes.len() {
            let b = bytes[src.cursor];
            src.cursor += 1;
            if b == b'\n' {
                src.eol = true;
                return;
            }
        }
        src.drained = true;
    }

    /// One-shot end-of-line flag set when the tokenizer crosses a newline.
    pub fn take_eol(&mut self) -> bool {
        let src = self.top();
        let eol = src.eol;
        src.eol = false;
        eol
    }

    pub fn push_file(&mut self, reader: BufReader<File>, name: usize) -> Result<(), Exception> {
        if self.sources.len() >= SZ_FILES {
            return Err(Exception::InStack);
        }
        self.sources.push(Source::file(reader, name));
        Ok(())
    }

    /// Drop the current file source. False when only the keyboard remains.
    pub fn pop_source(&mut self) -> bool {
        if self.sources.len() > 1 {
            self.sources.pop();
            true
        } else {
            false
        }
    }

    /// Back to a bare keyboard source.
    pub fn rewind_to_terminal(&mut self) {
        self.sources.truncate(1);
    }
}

/// Types that can load source text from include files.
pub trait HasLoader: Core + Output {
    fn add_loader(&mut self) {
        self.add_primitive(InputStack::INEOF, HasLoader::eof);
        self.add_primitive("infile", HasLoader::infile);
        self.add_primitive("filename", HasLoader::filename);
        self.add_primitive("isfile", HasLoader::isfile);
    }

    /// Push `path` onto the input stack. When the bare name cannot be
    /// opened, retry `"$OFF_PATH/<path>"`.
    fn include(&mut self, path: &str) -> Result<(), Exception> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(_) => match env::var("OFF_PATH") {
                Ok(dir) => {
                    let retry = format!("{}/{}", dir, path);
                    File::open(&retry).map_err(|_| Exception::NoFile)?
                }
                Err(_) => return Err(Exception::NoFile),
            },
        };
        let name = self.flash().str_cache(path)?;
        self.input_stack()
            .push_file(BufReader::new(file), name)
    }

    /// Run-time of the `<eof>` sentinel: pop the current input source. The
    /// word scheduled by `-x` runs once when the first file is popped;
    /// end of the keyboard source means there is no more input at all.
    fn eof(&mut self) {
        if self.input_stack().pop_source() {
            let pending = {
                let deferred = self.deferred();
                if deferred.done {
                    None
                } else {
                    deferred.done = true;
                    deferred.word.clone()
                }
            };
            if let Some(word) = pending {
                if let Some(xt) = self.lookup(&word) {
                    self.execute_xt(xt);
                }
            }
        } else {
            throw!(self, Exception::NoInput);
        }
    }

    /// ( straddr -- ) Open an include file and make it the input source.
    fn infile(&mut self) {
        chk!(self, 1);
        let addr = self.pop() as usize;
        let path = match self.flash_const().get_str(addr) {
            Ok(s) => s.to_string(),
            Err(e) => {
                throw!(self, e);
                return;
            }
        };
        match self.include(&path) {
            Ok(()) => {}
            Err(e) => throw!(self, e),
        }
    }

    /// ( -- straddr ) Name of the current input source.
    fn filename(&mut self) {
        let name = self.input_stack().current_name();
        self.push(name as Cell);
    }

    /// ( straddr -- flag )
    fn isfile(&mut self) {
        chk!(self, 1);
        let addr = self.pop() as usize;
        let exists = self
            .flash_const()
            .get_str(addr)
            .map(|path| std::fs::metadata(path).is_ok())
            .unwrap_or(false);
        self.push(exists as Cell);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::VM;
    use std::io::Write;
    use std::path::PathBuf;

    fn scratch_file(name: &str, contents: &str) -> PathBuf {
        let mut path = env::temp_dir();
        path.push(format!("offorth-test-{}-{}", std::process::id(), name));
        let mut file = File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_scan_token_and_lines() {
        let mut stack = InputStack::new(0);
        stack.refill("  2 3\tadd\n4\n".to_string());
        assert_eq!(stack.scan_token(), Some("2".to_string()));
        assert_eq!(stack.scan_token(), Some("3".to_string()));
        assert_eq!(stack.scan_token(), Some("add".to_string()));
        assert!(stack.take_eol());
        assert!(!stack.take_eol());
        assert_eq!(stack.scan_token(), Some("4".to_string()));
        assert_eq!(stack.scan_token(), None);
    }

    #[test]
    fn test_skip_line() {
        let mut stack = InputStack::new(0);
        stack.refill("a \\ b c\nd".to_string());
        assert_eq!(stack.scan_token(), Some("a".to_string()));
        assert_eq!(stack.scan_token(), Some("\\".to_string()));
        stack.skip_line();
        assert_eq!(stack.scan_token(), Some("d".to_string()));
    }

    #[test]
    fn test_include_evaluates_file() {
        let path = scratch_file("sum.ff", "3 4 +\n: twice dup + ;\n7 twice\n");
        let vm = &mut VM::new();
        vm.include(path.to_str().unwrap()).unwrap();
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert_eq!(vm.s_stack().as_slice(), [7, 14]);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_missing_file() {
        let vm = &mut VM::new();
        assert_eq!(
            vm.include("/nonexistent/offorth.ff"),
            Err(Exception::NoFile)
        );
    }

    #[test]
    fn test_input_stack_overflow() {
        let path = scratch_file("empty.ff", "\n");
        let vm = &mut VM::new();
        let name = path.to_str().unwrap().to_string();
        vm.include(&name).unwrap();
        vm.include(&name).unwrap();
        vm.include(&name).unwrap();
        assert_eq!(vm.include(&name), Err(Exception::InStack));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_deferred_word_runs_after_eof() {
        let path = scratch_file("deferred.ff", ": boot 99 ;\n");
        let vm = &mut VM::new();
        vm.deferred().word = Some("boot".to_string());
        vm.include(path.to_str().unwrap()).unwrap();
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert_eq!(vm.s_stack().as_slice(), [99]);
        // It runs only once.
        assert!(vm.deferred().done);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_filename_word() {
        let path = scratch_file("named.ff", "filename save\n");
        let vm = &mut VM::new();
        vm.include(path.to_str().unwrap()).unwrap();
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        let addr = vm.pop() as usize;
        let name = vm.flash_const().get_str(addr).unwrap();
        assert!(name.ends_with("named.ff"));
        let _ = std::fs::remove_file(path);
    }
}
