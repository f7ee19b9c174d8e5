use crate::exception::{Exception, ResetReason};
use crate::loader::InputStack;
use crate::memory::{
    Flash, TempBufs, ADDR_BASE, ADDR_ERR, ADDR_SIG, ADDR_TRACE, ARENA_BASE, SZ_INBUF,
};
use crate::parser;
use crate::signals;
use crate::word::{Action, Cell, Code, Entry, Flag, UCell, Xt, CELL};
use std::fs::File;

/// Depth of the data, return and user stacks.
pub const SZ_STACK: usize = 32;
/// Capacity of the colon-definition table.
pub const SZ_COLON_DEFS: usize = 1024;

pub const MAJOR: &str = "00";
pub const MINOR: &str = "01";
pub const REVISION: &str = "48";

/// Record the error code and the throwing location, then return.
///
/// The inner interpreter observes the pending code at the next dispatch and
/// unwinds to the outer interpreter, where `catch` reports it.
#[macro_export]
macro_rules! throw {
    ($vm:expr, $e:expr) => {
        $vm.err_throw($e, concat!(file!(), ":", line!()))
    };
}

/// Stack preflight on primitive entry. Compiled out by feature `unchecked`.
#[macro_export]
macro_rules! chk {
    ($vm:expr, $n:expr) => {
        if cfg!(not(feature = "unchecked")) {
            if !$vm.check_stack($n, concat!(file!(), ":", line!())) {
                return;
            }
        }
    };
}

/// Fixed-depth LIFO of cells.
pub struct Stack<T> {
    inner: Vec<T>,
    cap: usize,
}

impl<T: Copy> Stack<T> {
    pub fn with_capacity(cap: usize) -> Stack<T> {
        Stack {
            inner: Vec::with_capacity(cap),
            cap,
        }
    }

    /// Push `v`; hands it back when the stack is full.
    pub fn push(&mut self, v: T) -> Option<T> {
        if self.inner.len() >= self.cap {
            Some(v)
        } else {
            self.inner.push(v);
            None
        }
    }

    pub fn pop(&mut self) -> Option<T> {
        self.inner.pop()
    }

    pub fn pop2(&mut self) -> Option<(T, T)> {
        if self.inner.len() < 2 {
            None
        } else {
            let b = self.inner.pop().unwrap();
            let a = self.inner.pop().unwrap();
            Some((a, b))
        }
    }

    pub fn last(&self) -> Option<T> {
        self.inner.last().copied()
    }

    pub fn get(&self, pos: usize) -> Option<T> {
        self.inner.get(pos).copied()
    }

    pub fn set(&mut self, pos: usize, v: T) {
        if let Some(slot) = self.inner.get_mut(pos) {
            *slot = v;
        }
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.inner.len() >= self.cap
    }

    pub fn as_slice(&self) -> &[T] {
        &self.inner
    }
}

/// Interpreter state machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Interp {
    Interactive,
    Compiling,
    Interpret,
    Immediate,
}

/// Mutable interpreter state shared by every primitive.
pub struct State {
    pub state: Interp,
    pub state_save: Interp,
    pub prompt_level: Cell,
    pub error: Exception,
    pub error_loc: &'static str,
    pub reset: Option<ResetReason>,
    pub bye: bool,
    pub ops: UCell,
    /// Interactive control-flow fragment: (start of transient code, open
    /// structure count).
    pub fragment: Option<(usize, Cell)>,
}

impl State {
    pub fn new() -> State {
        State {
            state: Interp::Interactive,
            state_save: Interp::Interactive,
            prompt_level: 0,
            error: Exception::Ok,
            error_loc: "",
            reset: None,
            bye: false,
            ops: 0,
            fragment: None,
        }
    }
}

/// Execution tokens resolved once at boot and used by the compiler.
#[derive(Debug, Copy, Clone, Default)]
pub struct Refs {
    pub idx_lit: usize,
    pub idx_branch: usize,
    pub idx_qbranch: usize,
    pub idx_unresolved: usize,
    pub idx_do: usize,
    pub idx_loop: usize,
    pub idx_plus_loop: usize,
    pub idx_type: usize,
}

/// One-shot word scheduled by `-x`, run after the primary input drains.
pub struct Deferred {
    pub word: Option<String>,
    pub done: bool,
}

impl Deferred {
    pub fn new() -> Deferred {
        Deferred {
            word: None,
            done: false,
        }
    }
}

/// Outcome of `catch` after a dispatch.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Caught {
    /// Nothing pending, keep interpreting.
    Ok,
    /// State was reset; the outer loop reports and continues.
    Reset(ResetReason),
    /// Non-recoverable; the process exits with this code.
    Die(i32),
}

/// Console callback used to refill source 0.
pub type Console = Box<dyn FnMut(&str) -> Option<String>>;

pub trait Core: Sized {
    // Accessors implemented by the virtual machine.

    fn flash(&mut self) -> &mut Flash;
    fn flash_const(&self) -> &Flash;
    fn primitives(&self) -> &[Entry<Self>];
    fn primitives_mut(&mut self) -> &mut Vec<Entry<Self>>;
    fn colon_defs(&self) -> &[Entry<Self>];
    fn colon_defs_mut(&mut self) -> &mut Vec<Entry<Self>>;
    fn s_stack(&mut self) -> &mut Stack<Cell>;
    fn s_stack_const(&self) -> &Stack<Cell>;
    fn r_stack(&mut self) -> &mut Stack<Cell>;
    fn r_stack_const(&self) -> &Stack<Cell>;
    fn u_stack(&mut self) -> &mut Stack<Cell>;
    fn state(&mut self) -> &mut State;
    fn state_const(&self) -> &State;
    fn input_stack(&mut self) -> &mut InputStack;
    fn output_buffer(&mut self) -> &mut String;
    fn last_token(&mut self) -> &mut Option<String>;
    fn tmp_bufs(&mut self) -> &mut TempBufs;
    fn set_tmp_bufs(&mut self, bufs: TempBufs);
    fn scratch_addr(&self) -> usize;
    fn set_scratch_addr(&mut self, addr: usize);
    fn refs(&self) -> Refs;
    fn refs_mut(&mut self) -> &mut Refs;
    fn deferred(&mut self) -> &mut Deferred;
    fn read_console(&mut self, prompt: &str) -> Option<String>;
    fn has_console(&self) -> bool;
    fn out_files(&mut self) -> &mut Vec<File>;
    fn quiet(&self) -> bool;
    fn locale(&self) -> &str;
    fn sign_negative(&self) -> bool;
    fn set_sign_negative(&mut self, v: bool);

    //----------------
    // Error handling
    //----------------

    fn err_throw(&mut self, e: Exception, loc: &'static str) {
        self.state().error = e;
        self.state().error_loc = loc;
        let _ = self.flash().put_cell(ADDR_ERR, e.code() as Cell);
    }

    fn last_error(&self) -> Option<Exception> {
        match self.state_const().error {
            Exception::Ok => None,
            e => Some(e),
        }
    }

    /// True when a pending error, reset or `bye` must unwind the inner
    /// interpreter back to the outer loop.
    fn unwinding(&self) -> bool {
        let state = self.state_const();
        state.error != Exception::Ok || state.reset.is_some() || state.bye
    }

    /// Depth/bounds preflight used by the `chk!` macro.
    fn check_stack(&mut self, n: usize, who: &'static str) -> bool {
        let d = self.s_stack().len();
        if d < n {
            let msg = format!("-- Found {} of {} args expected in '{}'.\n", d, n, who);
            self.push_output(&msg);
            self.err_throw(Exception::StackUnderflow, who);
            return false;
        }
        true
    }

    /// Clear stacks and interpreter state; signal handlers are re-armed.
    /// The trace flag and the dictionary are left alone.
    fn q_reset(&mut self) {
        signals::install();
        let _ = self.flash().put_cell(ADDR_SIG, 0);
        let _ = self.flash().put_cell(ADDR_ERR, 0);
        let _ = self.flash().put_cell(ADDR_BASE, 10);
        self.s_stack().clear();
        self.r_stack().clear();
        self.u_stack().clear();
        if let Some((start, _)) = self.state().fragment.take() {
            let _ = self.flash().set_here(start);
        }
        let state = self.state();
        state.prompt_level = 0;
        state.error = Exception::Ok;
        state.error_loc = "";
        state.state = Interp::Interactive;
        state.state_save = Interp::Interactive;
    }

    /// Inspect the pending condition after a dispatch, report, and leave the
    /// interpreter usable again (or tell the caller to die).
    fn catch(&mut self) -> Caught {
        if let Some(reason) = self.state().reset.take() {
            // A word interrupted by the reset may have thrown on the way
            // out; the reset wins.
            self.state().error = Exception::Ok;
            let _ = self.flash().put_cell(ADDR_ERR, 0);
            return Caught::Reset(reason);
        }
        let e = self.state_const().error;
        match e {
            Exception::Ok => Caught::Ok,
            Exception::CaughtSignal => self.catch_signal(),
            Exception::NoInput => {
                self.report_error(e);
                self.dump_return_stack();
                self.push_output("-- Abnormal Termination.\n");
                Caught::Die(0)
            }
            _ => {
                self.report_error(e);
                self.dump_return_stack();
                self.push_output("-- Stack Dump: Depth = ");
                self.print_stack();
                self.push_output("\n");
                self.q_reset();
                self.push_output("-- Attempting Reset.\n");
                Caught::Reset(ResetReason::Catch)
            }
        }
    }

    fn catch_signal(&mut self) -> Caught {
        let sig = self.flash_const().get_cell(ADDR_SIG).unwrap_or(0) as i32;
        let msg = format!(
            "{} ({})\n",
            Exception::CaughtSignal.description(),
            Exception::CaughtSignal.code()
        );
        self.push_output(&msg);
        if sig == signals::SIGSEGV {
            let msg = format!("-- SIGSEGV ({}) is generally non recoverable.\n", sig);
            self.push_output(&msg);
            self.dump_return_stack();
            return Caught::Die(Exception::CaughtSignal.code() as i32);
        }
        signals::reinstall(sig);
        let msg = format!("-- Signal {} handled.\n", sig);
        self.push_output(&msg);
        if sig == signals::SIGINT {
            self.push_output("-- warm start suggested.\n");
            self.q_reset();
            return Caught::Reset(ResetReason::SignalHandler);
        }
        self.state().error = Exception::Ok;
        let _ = self.flash().put_cell(ADDR_ERR, 0);
        Caught::Ok
    }

    fn report_error(&mut self, e: Exception) {
        let loc = self.state_const().error_loc;
        let mut msg = format!("{} ({})\n", e.description(), e.code());
        msg.push_str(&format!("-- Error: code is {}.\n", e.code()));
        msg.push_str(&format!("-- Thrown by {}.\n", loc));
        let line = self.input_stack().current_buffer().trim_end().to_string();
        msg.push_str(&format!("-- Input: {}\n", line));
        self.push_output(&msg);
    }

    /// Dump the return stack as a Forth backtrace, consuming it.
    fn dump_return_stack(&mut self) {
        let mut report = String::from("-- Forth Backtrace:\n");
        while let Some(p) = self.r_stack().pop() {
            if p <= 0 {
                continue;
            }
            let addr = p as usize;
            for slot in &[addr, addr.wrapping_sub(CELL)] {
                if let Ok(cell) = self.flash_const().get_cell(*slot) {
                    if let Some(name) = self.name_of_cell(cell) {
                        report.push_str(&format!("  -- {:x} {:x} ({})\n", slot, cell, name));
                    }
                }
            }
        }
        self.push_output(&report);
    }

    fn name_of_cell(&self, cell: Cell) -> Option<String> {
        let xt = Xt::from_cell(cell).ok()?;
        let nfa = self.entry(xt)?.nfa;
        Some(self.flash_const().get_str(nfa).ok()?.to_string())
    }

    //------------
    // Stack plumbing
    //------------

    fn push(&mut self, v: Cell) {
        if self.s_stack().push(v).is_some() {
            throw!(self, Exception::StackOverflow);
        }
    }

    fn pop(&mut self) -> Cell {
        match self.s_stack().pop() {
            Some(v) => v,
            None => {
                throw!(self, Exception::StackUnderflow);
                0
            }
        }
    }

    fn rpush(&mut self, v: Cell) {
        if self.r_stack().push(v).is_some() {
            throw!(self, Exception::StackOverflow);
        }
    }

    fn rpop(&mut self) -> Cell {
        match self.r_stack().pop() {
            Some(v) => v,
            None => {
                throw!(self, Exception::StackUnderflow);
                0
            }
        }
    }

    fn upush(&mut self, v: Cell) {
        if self.u_stack().push(v).is_some() {
            throw!(self, Exception::StackOverflow);
        }
    }

    fn upop(&mut self) -> Cell {
        match self.u_stack().pop() {
            Some(v) => v,
            None => {
                throw!(self, Exception::StackUnderflow);
                0
            }
        }
    }

    fn push_output(&mut self, s: &str) {
        self.output_buffer().push_str(s);
    }

    fn current_base(&self) -> Cell {
        self.flash_const().get_cell(ADDR_BASE).unwrap_or(10)
    }

    //------------
    // Dictionary
    //------------

    fn add_primitive(&mut self, name: &str, action: Action<Self>) {
        let nfa = self
            .flash()
            .str_cache(name)
            .expect("string cache exhausted during boot");
        self.primitives_mut()
            .push(Entry::new(nfa, Code::Primitive(action), Flag::Normal, 0));
    }

    fn add_immediate(&mut self, name: &str, action: Action<Self>) {
        self.add_primitive(name, action);
        self.primitives_mut().last_mut().unwrap().flag = Flag::Immediate;
    }

    fn entry(&self, xt: Xt) -> Option<&Entry<Self>> {
        let n = self.primitives().len();
        if xt.0 == 0 {
            None
        } else if xt.0 <= n {
            self.primitives().get(xt.0 - 1)
        } else {
            self.colon_defs().get(xt.0 - n - 1)
        }
    }

    fn entry_mut(&mut self, xt: Xt) -> Option<&mut Entry<Self>> {
        let n = self.primitives().len();
        if xt.0 == 0 {
            None
        } else if xt.0 <= n {
            self.primitives_mut().get_mut(xt.0 - 1)
        } else {
            self.colon_defs_mut().get_mut(xt.0 - n - 1)
        }
    }

    /// Token of the most recent colon definition.
    fn latest(&self) -> Option<Xt> {
        let n = self.colon_defs().len();
        if n == 0 {
            None
        } else {
            Some(Xt(self.primitives().len() + n))
        }
    }

    /// Find `tkn`: colon definitions newest-first, then primitives.
    /// First match wins.
    fn lookup(&self, tkn: &str) -> Option<Xt> {
        let n = self.primitives().len();
        for (i, entry) in self.colon_defs().iter().enumerate().rev() {
            if self.flash_const().get_str(entry.nfa) == Ok(tkn) {
                return Some(Xt(n + i + 1));
            }
        }
        for (i, entry) in self.primitives().iter().enumerate() {
            if self.flash_const().get_str(entry.nfa) == Ok(tkn) {
                return Some(Xt(i + 1));
            }
        }
        None
    }

    //------------------
    // Tokenizer
    //------------------

    /// Next whitespace-delimited token from the current input source,
    /// refilling the source as needed. `None` means the input is exhausted
    /// and no console is installed.
    fn next_token(&mut self) -> Option<String> {
        loop {
            if self.unwinding() {
                return None;
            }
            if let Some(tkn) = self.input_stack().scan_token() {
                *self.last_token() = Some(tkn.clone());
                return Some(tkn);
            }
            // Source drained, refill.
            if self.input_stack().is_terminal() {
                if !self.has_console() {
                    return None;
                }
                let prompt = self.prompt_str();
                match self.read_console(prompt) {
                    Some(line) => self.input_stack().refill(line),
                    None => return Some(InputStack::INEOF.to_string()),
                }
            } else {
                match self.input_stack().refill_from_file() {
                    Ok(true) => {}
                    Ok(false) => return Some(InputStack::INEOF.to_string()),
                    Err(e) => {
                        throw!(self, e);
                        return None;
                    }
                }
            }
        }
    }

    fn prompt_str(&self) -> &'static str {
        if self.state_const().prompt_level > 0 {
            "-- "
        } else {
            "ok "
        }
    }

    /// Place the current line of source 0 and restart its cursor, as the
    /// console refill would. Used by tests and by non-interactive drivers.
    fn set_source(&mut self, script: &str) {
        self.input_stack().rewind_to_terminal();
        self.input_stack().refill(script.to_string());
    }

    //------------------
    // Inner interpreter
    //------------------

    /// Remove xt from the stack and perform the semantics identified by it.
    fn execute(&mut self) {
        chk!(self, 1);
        let cell = self.pop();
        if cell == 0 {
            return;
        }
        match Xt::from_cell(cell) {
            Ok(xt) => self.execute_xt(xt),
            Err(e) => throw!(self, e),
        }
    }

    fn execute_xt(&mut self, xt: Xt) {
        let pending = signals::take();
        if pending != 0 {
            let _ = self.flash().put_cell(ADDR_SIG, pending as Cell);
            throw!(self, Exception::CaughtSignal);
            return;
        }
        let (code, pfa) = match self.entry(xt) {
            Some(entry) => (entry.code, entry.pfa),
            None => {
                throw!(self, Exception::NoWord);
                return;
            }
        };
        if pfa != 0 {
            self.rpush(pfa as Cell);
            if self.unwinding() {
                return;
            }
        }
        if self.flash_const().get_cell(ADDR_TRACE).unwrap_or(0) != 0 {
            self.tracing(xt);
        }
        match code {
            Code::Primitive(action) => action(self),
            Code::Colon => self.do_colon(),
            Code::Field => {
                let addr = self.rpop();
                self.push(addr);
            }
            Code::Constant => {
                let addr = self.rpop();
                match self.flash_const().get_cell(addr as usize) {
                    Ok(v) => self.push(v),
                    Err(e) => throw!(self, e),
                }
            }
        }
    }

    /// Thread a colon body: the next-word pointer lives on the return
    /// stack, so nested calls simply push their body address.
    fn do_colon(&mut self) {
        let save = self.state_const().state;
        self.state().state = Interp::Interpret;
        loop {
            let ip = self.rpop();
            if ip <= 0 {
                break;
            }
            let cell = match self.flash_const().get_cell(ip as usize) {
                Ok(cell) => cell,
                Err(e) => {
                    throw!(self, e);
                    break;
                }
            };
            if cell == 0 {
                break;
            }
            self.rpush(ip + CELL as Cell);
            self.state().ops += 1;
            match Xt::from_cell(cell) {
                Ok(xt) => self.execute_xt(xt),
                Err(e) => {
                    throw!(self, e);
                    break;
                }
            }
            if self.unwinding() {
                break;
            }
        }
        self.state().state = save;
    }

    fn tracing(&mut self, xt: Xt) {
        self.print_stack();
        self.push_output("\t\t");
        let name = self
            .entry(xt)
            .map(|e| e.nfa)
            .and_then(|nfa| self.flash_const().get_str(nfa).ok())
            .unwrap_or("next")
            .to_string();
        self.push_output(&name);
        self.push_output("\n");
    }

    /// `<depth> : <cells bottom-first>` into the output buffer.
    fn print_stack(&mut self) {
        let base = self.current_base();
        let depth = self.s_stack().len();
        let mut line = format!("{} : ", depth);
        for i in 0..depth {
            let v = self.s_stack().get(i).unwrap_or(0);
            line.push_str(&format_cell(v, base, true));
            line.push(' ');
        }
        self.push_output(&line);
    }

    //------------------
    // Outer interpreter
    //------------------

    /// Look the token up and execute it, or push it as a literal in the
    /// current radix. Control-flow structures typed outside a definition
    /// compile into a transient fragment that runs when they close.
    fn interpret_token(&mut self, tkn: &str) {
        if self.state_const().state == Interp::Interactive
            && (self.state_const().fragment.is_some() || is_cf_opener(tkn))
        {
            self.fragment_token(tkn);
            return;
        }
        match self.lookup(tkn) {
            Some(xt) => self.execute_xt(xt),
            None => {
                let base = self.current_base();
                match parser::str_literal(tkn, base) {
                    Ok(v) => self.push(v),
                    Err(e) => {
                        let msg = format!("-- {} ?\n", tkn);
                        self.push_output(&msg);
                        throw!(self, e);
                    }
                }
            }
        }
    }

    /// Compile one token of an interactive control-flow fragment. When the
    /// outermost structure closes, the fragment is terminated, threaded,
    /// and its flash space reclaimed.
    fn fragment_token(&mut self, tkn: &str) {
        if self.state_const().fragment.is_none() {
            let here = self.flash().here();
            self.state().fragment = Some((here, 0));
        }
        if is_cf_opener(tkn) {
            if let Some((_, depth)) = self.state().fragment.as_mut() {
                *depth += 1;
            }
            if let Some(xt) = self.lookup(tkn) {
                self.execute_xt(xt);
            }
            return;
        }
        if is_cf_closer(tkn) {
            if let Some(xt) = self.lookup(tkn) {
                self.execute_xt(xt);
            }
            let closed = match self.state().fragment.as_mut() {
                Some((_, depth)) => {
                    *depth -= 1;
                    *depth <= 0
                }
                None => return,
            };
            if !closed {
                return;
            }
            let (start, _) = self.state().fragment.take().unwrap();
            if self.unwinding() {
                let _ = self.flash().set_here(start);
                return;
            }
            self.compile_cell(0);
            self.rpush(start as Cell);
            self.do_colon();
            let _ = self.flash().set_here(start);
            return;
        }
        match self.lookup(tkn) {
            Some(xt) => {
                let immediate = self
                    .entry(xt)
                    .map(|e| e.flag == Flag::Immediate)
                    .unwrap_or(false);
                if immediate {
                    self.execute_xt(xt);
                } else {
                    self.compile_word(xt);
                }
            }
            None => {
                let base = self.current_base();
                match parser::str_literal(tkn, base) {
                    Ok(v) => self.compile_integer(v),
                    Err(e) => {
                        if let Some((start, _)) = self.state().fragment.take() {
                            let _ = self.flash().set_here(start);
                        }
                        let msg = format!("-- {} ?\n", tkn);
                        self.push_output(&msg);
                        throw!(self, e);
                    }
                }
            }
        }
    }

    /// Interpret until the installed input is exhausted. Leaves any pending
    /// error in place for the caller to `catch`.
    fn evaluate_input(&mut self) {
        loop {
            if self.unwinding() {
                break;
            }
            let tkn = match self.next_token() {
                Some(tkn) => tkn,
                None => break,
            };
            self.interpret_token(&tkn);
        }
    }

    /// Convenience for tests and embedding: evaluate and report through
    /// `catch`, leaving the interpreter usable.
    fn evaluate(&mut self) -> Caught {
        self.evaluate_input();
        self.catch()
    }

    //---------
    // Compiler
    //---------

    /// Append one cell at HERE.
    fn compile_cell(&mut self, v: Cell) {
        match self.flash().compile_cell(v) {
            Ok(()) => {}
            Err(e) => throw!(self, e),
        }
    }

    fn compile_word(&mut self, xt: Xt) {
        self.compile_cell(xt.to_cell());
    }

    /// Append `(literal)` followed by the value.
    fn compile_integer(&mut self, v: Cell) {
        let lit = Xt(self.refs().idx_lit);
        self.compile_word(lit);
        self.compile_cell(v);
    }

    /// The colon compilation loop. Runs until `;`, executing immediate
    /// words and compiling everything else. A failed literal rolls the
    /// definition back as if it never happened.
    fn compile(&mut self) {
        let save_here = self.flash().here();
        if let Some(xt) = self.latest() {
            if let Some(entry) = self.entry_mut(xt) {
                entry.code = Code::Colon;
            }
        }
        self.state().prompt_level += 1;
        loop {
            if self.unwinding() {
                break;
            }
            let tkn = match self.next_token() {
                Some(tkn) => tkn,
                None => {
                    throw!(self, Exception::NoInput);
                    break;
                }
            };
            if tkn == ";" {
                self.semicolon();
                break;
            }
            match self.lookup(&tkn) {
                Some(xt) => {
                    let immediate = self
                        .entry(xt)
                        .map(|e| e.flag == Flag::Immediate)
                        .unwrap_or(false);
                    if self.state_const().state == Interp::Immediate || immediate {
                        self.execute_xt(xt);
                    } else {
                        self.compile_word(xt);
                    }
                }
                None => {
                    let base = self.current_base();
                    match parser::str_literal(&tkn, base) {
                        Ok(v) => {
                            if self.state_const().state == Interp::Immediate {
                                self.push(v);
                            } else {
                                self.compile_integer(v);
                            }
                        }
                        Err(_) => {
                            // Roll back as if the definition never happened.
                            let _ = self.flash().set_here(save_here);
                            let _ = self.flash().str_uncache();
                            self.colon_defs_mut().pop();
                            self.state().state = Interp::Interpret;
                            let msg = format!("-- {} ?\n", tkn);
                            self.push_output(&msg);
                            throw!(self, Exception::BadString);
                            break;
                        }
                    }
                }
            }
        }
    }

    //-----------------------
    // High level definitions
    //-----------------------

    /// ( "<spaces>name" -- ) `:` — start a colon definition.
    fn colon(&mut self) {
        self.state().state = Interp::Compiling;
        self.create();
        if self.unwinding() {
            return;
        }
        self.compile();
    }

    /// `;` — terminate the definition and return to interactive state.
    fn semicolon(&mut self) {
        if self.state_const().state != Interp::Compiling {
            throw!(self, Exception::BadState);
            return;
        }
        self.compile_cell(0);
        self.state().prompt_level -= 1;
        self.state().state = Interp::Interactive;
    }

    /// ( "<spaces>name" -- ) Add a dictionary entry whose code pushes its
    /// body address, body at HERE.
    fn create(&mut self) {
        self.p_word();
        if self.unwinding() {
            return;
        }
        self.lambda();
    }

    /// ( straddr -- ) The anonymous half of CREATE: the name is already on
    /// the stack.
    fn lambda(&mut self) {
        chk!(self, 1);
        let addr = self.pop() as usize;
        let name = match self.flash_const().get_str(addr) {
            Ok(s) => s.to_string(),
            Err(e) => {
                throw!(self, e);
                return;
            }
        };
        if self.colon_defs().len() >= SZ_COLON_DEFS {
            throw!(self, Exception::NoSpace);
            return;
        }
        let nfa = match self.flash().str_cache(&name) {
            Ok(nfa) => nfa,
            Err(e) => {
                throw!(self, e);
                return;
            }
        };
        let pfa = self.flash().here();
        self.colon_defs_mut()
            .push(Entry::new(nfa, Code::Field, Flag::Normal, pfa));
    }

    /// ( x "<spaces>name" -- ) Defining word: name pushes x.
    fn constant(&mut self) {
        chk!(self, 1);
        self.create();
        if self.unwinding() {
            return;
        }
        self.comma();
        if let Some(xt) = self.latest() {
            if let Some(entry) = self.entry_mut(xt) {
                entry.code = Code::Constant;
            }
        }
    }

    /// ( "<spaces>name" -- ) Defining word: name pushes the address of one
    /// zero-initialised cell.
    fn variable(&mut self) {
        self.create();
        if self.unwinding() {
            return;
        }
        self.push(0);
        self.comma();
    }

    /// Rewrite the most recent definition so its post-creation behaviour is
    /// the code following DOES> in the defining word.
    fn does(&mut self) {
        let last = match self.latest() {
            Some(xt) => xt,
            None => {
                throw!(self, Exception::BadState);
                return;
            }
        };
        let here = self.flash().here();
        let old_pfa = {
            let entry = self.entry_mut(last).unwrap();
            let old = entry.pfa;
            entry.pfa = here;
            old
        };
        self.push(old_pfa as Cell);
        let lit = Xt(self.refs().idx_lit);
        self.push(lit.to_cell());
        self.comma();
        self.comma();
        match self.state_const().state {
            Interp::Interactive | Interp::Compiling => {
                self.state().state = Interp::Compiling;
                self.compile();
            }
            Interp::Interpret => {
                // Run-time of the defining word: copy its remaining
                // threaded code into the child and end the caller.
                if let Some(entry) = self.entry_mut(last) {
                    entry.code = Code::Colon;
                }
                loop {
                    let ip = self.rpop();
                    if ip <= 0 {
                        break;
                    }
                    let cell = match self.flash_const().get_cell(ip as usize) {
                        Ok(cell) => cell,
                        Err(e) => {
                            throw!(self, e);
                            break;
                        }
                    };
                    if cell == 0 {
                        self.rpush(0);
                        self.push(0);
                        self.comma();
                        break;
                    }
                    self.rpush(ip + CELL as Cell);
                    self.push(cell);
                    self.comma();
                }
            }
            Interp::Immediate => throw!(self, Exception::BadState),
        }
    }

    /// Mark the most recent definition Normal.
    fn normal(&mut self) {
        if let Some(xt) = self.latest() {
            if let Some(entry) = self.entry_mut(xt) {
                entry.flag = Flag::Normal;
            }
        }
    }

    /// Mark the most recent definition Immediate.
    fn immediate(&mut self) {
        if let Some(xt) = self.latest() {
            if let Some(entry) = self.entry_mut(xt) {
                entry.flag = Flag::Immediate;
            }
        }
    }

    /// `[` — save state and interpret following tokens.
    fn im_state(&mut self) {
        let state = self.state();
        state.state_save = state.state;
        state.state = Interp::Immediate;
    }

    /// `]` — restore the state saved by `[`.
    fn pv_state(&mut self) {
        let state = self.state();
        state.state = state.state_save;
    }

    /// Wipe the dictionary back to its boot state.
    fn forget(&mut self) {
        self.colon_defs_mut().clear();
        self.flash().wipe();
        match TempBufs::create(self.flash()) {
            Ok(bufs) => self.set_tmp_bufs(bufs),
            Err(e) => throw!(self, e),
        }
        let scratch = self.flash().here();
        let cells = (SZ_INBUF + CELL - 1) / CELL;
        let _ = self.flash().allot(cells as Cell);
        let _ = self.flash().fill(scratch, SZ_INBUF, 0);
        self.set_scratch_addr(scratch);
        let _ = self.flash().put_cell(ADDR_BASE, 10);
        let _ = self.flash().put_cell(ADDR_TRACE, 0);
        self.state().state = Interp::Interactive;
    }

    //--------
    // Control
    //--------

    /// Compiled placeholder of a forward mark; executing one means a branch
    /// was left unresolved at definition end.
    fn unresolved(&mut self) {
        throw!(self, Exception::Unresolved);
    }

    /// Append a placeholder cell and push its address.
    fn fwd_mark(&mut self) {
        let here = self.flash().here();
        self.push(here as Cell);
        let unresolved = Xt(self.refs().idx_unresolved);
        self.push(unresolved.to_cell());
        self.comma();
    }

    /// Pop an address, patch it to point at HERE.
    fn fwd_resolve(&mut self) {
        chk!(self, 1);
        let addr = self.pop() as usize;
        let here = self.flash().here();
        match self.flash().put_cell(addr, here as Cell) {
            Ok(()) => {}
            Err(e) => throw!(self, e),
        }
    }

    /// Push HERE as a backward branch target.
    fn bkw_mark(&mut self) {
        let here = self.flash().here();
        self.push(here as Cell);
    }

    /// Append the popped address as the next branch target.
    fn bkw_resolve(&mut self) {
        self.comma();
    }

    /// Run-time: pop a flag; true falls through past the target cell,
    /// false loads the target into the threaded pointer.
    fn q_branch(&mut self) {
        chk!(self, 1);
        let ip = self.rpop();
        if self.pop() != 0 {
            self.rpush(ip + CELL as Cell);
            return;
        }
        match self.flash_const().get_cell(ip as usize) {
            Ok(target) => self.rpush(target),
            Err(e) => throw!(self, e),
        }
    }

    /// Run-time: always load the target cell into the threaded pointer.
    fn branch(&mut self) {
        let ip = self.rpop();
        match self.flash_const().get_cell(ip as usize) {
            Ok(target) => self.rpush(target),
            Err(e) => throw!(self, e),
        }
    }

    fn p_if(&mut self) {
        let qbranch = Xt(self.refs().idx_qbranch);
        self.push(qbranch.to_cell());
        self.comma();
        self.fwd_mark();
    }

    fn p_else(&mut self) {
        let branch = Xt(self.refs().idx_branch);
        self.push(branch.to_cell());
        self.comma();
        self.fwd_mark();
        self.swap();
        self.fwd_resolve();
    }

    fn p_then(&mut self) {
        self.fwd_resolve();
    }

    fn begin(&mut self) {
        self.bkw_mark();
    }

    fn again(&mut self) {
        let branch = Xt(self.refs().idx_branch);
        self.push(branch.to_cell());
        self.comma();
        self.bkw_resolve();
    }

    fn until(&mut self) {
        let qbranch = Xt(self.refs().idx_qbranch);
        self.push(qbranch.to_cell());
        self.comma();
        self.bkw_resolve();
    }

    fn p_while(&mut self) {
        let qbranch = Xt(self.refs().idx_qbranch);
        self.push(qbranch.to_cell());
        self.comma();
        self.fwd_mark();
        self.swap();
    }

    fn repeat(&mut self) {
        let branch = Xt(self.refs().idx_branch);
        self.push(branch.to_cell());
        self.comma();
        self.bkw_resolve();
        self.fwd_resolve();
    }

    /// Clear the loop limit so the next loop primitive exits.
    fn leave(&mut self) {
        let len = self.r_stack().len();
        if len >= 3 {
            self.r_stack().set(len - 3, 0);
        }
    }

    /// `do` — compile `(do)` and mark the loop start.
    fn qdo(&mut self) {
        let do_xt = Xt(self.refs().idx_do);
        self.push(do_xt.to_cell());
        self.comma();
        self.bkw_mark();
    }

    /// Run-time of `do`: move limit and index under the threaded pointer.
    fn do_do(&mut self) {
        chk!(self, 2);
        let nxt = self.rpop();
        self.swap();
        let limit = self.pop();
        self.rpush(limit);
        let index = self.pop();
        self.rpush(index);
        self.rpush(nxt);
    }

    /// Run-time of `loop`: bump the index, push 0 to continue or 1 to exit.
    fn do_loop(&mut self) {
        let nxt = self.rpop();
        let len = self.r_stack().len();
        if len < 2 {
            throw!(self, Exception::StackUnderflow);
            return;
        }
        let index = self.r_stack().get(len - 1).unwrap_or(0);
        let limit = self.r_stack().get(len - 2).unwrap_or(0);
        let next_index = index.wrapping_add(1);
        if next_index < limit {
            self.r_stack().set(len - 1, next_index);
            self.rpush(nxt);
            self.push(0);
        } else {
            self.r_stack().pop();
            self.r_stack().pop();
            self.rpush(nxt);
            self.push(1);
        }
    }

    fn p_loop(&mut self) {
        let loop_xt = Xt(self.refs().idx_loop);
        self.push(loop_xt.to_cell());
        self.comma();
        let qbranch = Xt(self.refs().idx_qbranch);
        self.push(qbranch.to_cell());
        self.comma();
        self.bkw_resolve();
    }

    /// Run-time of `+loop`: strict-less-than for a positive increment,
    /// strict-greater-than for a negative one.
    fn do_plus_loop(&mut self) {
        chk!(self, 1);
        let inc = self.pop();
        let nxt = self.rpop();
        let len = self.r_stack().len();
        if len < 2 {
            throw!(self, Exception::StackUnderflow);
            return;
        }
        let index = self.r_stack().get(len - 1).unwrap_or(0);
        let limit = self.r_stack().get(len - 2).unwrap_or(0);
        let next_index = index.wrapping_add(inc);
        let continues = if inc > 0 {
            next_index < limit
        } else {
            next_index > limit
        };
        if continues {
            self.r_stack().set(len - 1, next_index);
            self.rpush(nxt);
            self.push(0);
        } else {
            self.r_stack().pop();
            self.r_stack().pop();
            self.rpush(nxt);
            self.push(1);
        }
    }

    fn plus_loop(&mut self) {
        let plus_loop = Xt(self.refs().idx_plus_loop);
        self.push(plus_loop.to_cell());
        self.comma();
        let qbranch = Xt(self.refs().idx_qbranch);
        self.push(qbranch.to_cell());
        self.comma();
        self.bkw_resolve();
    }

    /// Push the current loop index from under the threaded pointer.
    fn do_i(&mut self) {
        let len = self.r_stack().len();
        if len < 2 {
            throw!(self, Exception::StackUnderflow);
            return;
        }
        let index = self.r_stack().get(len - 2).unwrap_or(0);
        self.push(index);
    }

    //-----------
    // Primitives
    //-----------

    /// Run-time: ( n1 n2 -- n3 )
    fn add(&mut self) {
        chk!(self, 2);
        let n = self.pop();
        let t = self.pop();
        self.push(t.wrapping_add(n));
    }

    /// Run-time: ( n1 n2 -- n3 )
    fn subt(&mut self) {
        chk!(self, 2);
        let n = self.pop();
        let t = self.pop();
        self.push(t.wrapping_sub(n));
    }

    /// Run-time: ( n1 n2 -- n3 )
    fn mult(&mut self) {
        chk!(self, 2);
        let n = self.pop();
        let t = self.pop();
        self.push(t.wrapping_mul(n));
    }

    /// Run-time: ( n1 n2 -- n1^n2 )
    fn exponent(&mut self) {
        chk!(self, 2);
        let mut n = self.pop();
        let base = self.pop();
        let mut acc: Cell = 1;
        while n > 0 {
            acc = acc.wrapping_mul(base);
            n -= 1;
        }
        self.push(acc);
    }

    /// Run-time: ( n1 n2 -- n3 )
    fn divide(&mut self) {
        chk!(self, 2);
        let n = self.pop();
        if n == 0 {
            throw!(self, Exception::DivisionByZero);
            return;
        }
        let t = self.pop();
        self.push(t.wrapping_div(n));
    }

    /// Run-time: ( n1 n2 -- n3 )
    fn modulo(&mut self) {
        chk!(self, 2);
        let n = self.pop();
        if n == 0 {
            throw!(self, Exception::DivisionByZero);
            return;
        }
        let t = self.pop();
        self.push(t.wrapping_rem(n));
    }

    /// Run-time: ( -n -- n )
    fn absolute(&mut self) {
        chk!(self, 1);
        let t = self.pop();
        self.push(t.wrapping_abs());
    }

    /// Run-time: ( n -- n+1 )
    fn plusplus(&mut self) {
        chk!(self, 1);
        let t = self.pop();
        self.push(t.wrapping_add(1));
    }

    /// Run-time: ( n -- n-1 )
    fn minusminus(&mut self) {
        chk!(self, 1);
        let t = self.pop();
        self.push(t.wrapping_sub(1));
    }

    fn depth(&mut self) {
        let d = self.s_stack().len();
        self.push(d as Cell);
    }

    /// Run-time: ( n -- n n )
    fn dupe(&mut self) {
        chk!(self, 1);
        let t = self.s_stack().last().unwrap_or(0);
        self.push(t);
    }

    /// Run-time: ( n -- n n | 0 )
    fn qdupe(&mut self) {
        chk!(self, 1);
        let t = self.s_stack().last().unwrap_or(0);
        if t != 0 {
            self.push(t);
        }
    }

    /// Run-time: ( n1 n2 n3 -- n2 n3 n1 )
    fn rot(&mut self) {
        chk!(self, 3);
        let c = self.pop();
        let b = self.pop();
        let a = self.pop();
        self.push(b);
        self.push(c);
        self.push(a);
    }

    /// Run-time: ( n1 n2 -- n2 )
    fn nip(&mut self) {
        chk!(self, 2);
        self.swap();
        self.p_drop();
    }

    /// Run-time: ( n1 n2 -- n2 n1 n2 )
    fn tuck(&mut self) {
        chk!(self, 2);
        self.dupe();
        self.rot();
        self.swap();
    }

    fn p_drop(&mut self) {
        chk!(self, 1);
        self.pop();
    }

    /// Run-time: ( n1 n2 -- n1 n2 n1 )
    fn over(&mut self) {
        chk!(self, 2);
        let len = self.s_stack().len();
        let n = self.s_stack().get(len - 2).unwrap_or(0);
        self.push(n);
    }

    fn swap(&mut self) {
        chk!(self, 2);
        let b = self.pop();
        let a = self.pop();
        self.push(b);
        self.push(a);
    }

    /// Run-time: ( ix -- n )
    fn pick(&mut self) {
        chk!(self, 1);
        let ix = self.pop();
        let depth = self.s_stack().len() as Cell;
        if ix >= 0 && ix < depth {
            let v = self.s_stack().get((depth - 1 - ix) as usize).unwrap_or(0);
            self.push(v);
        } else {
            throw!(self, Exception::StackUnderflow);
        }
    }

    /// Run-time: ( n -- ) ( U: -- n )
    fn to_r(&mut self) {
        chk!(self, 1);
        let t = self.pop();
        self.upush(t);
    }

    /// Run-time: ( -- n ) ( U: n -- )
    fn r_from(&mut self) {
        let t = self.upop();
        self.push(t);
    }

    //------------
    // Comparison and logic. Flags are 1 and 0.
    //------------

    fn lt(&mut self) {
        chk!(self, 2);
        let n = self.pop();
        let t = self.pop();
        self.push((t < n) as Cell);
    }

    fn gt(&mut self) {
        chk!(self, 2);
        let n = self.pop();
        let t = self.pop();
        self.push((t > n) as Cell);
    }

    fn ge(&mut self) {
        chk!(self, 2);
        let n = self.pop();
        let t = self.pop();
        self.push((t >= n) as Cell);
    }

    fn le(&mut self) {
        chk!(self, 2);
        let n = self.pop();
        let t = self.pop();
        self.push((t <= n) as Cell);
    }

    fn eq(&mut self) {
        chk!(self, 2);
        let n = self.pop();
        let t = self.pop();
        self.push((t == n) as Cell);
    }

    fn ne(&mut self) {
        chk!(self, 2);
        let n = self.pop();
        let t = self.pop();
        self.push((t != n) as Cell);
    }

    /// Run-time: ( n1 n2 -- n1&n2 )
    fn bit_and(&mut self) {
        chk!(self, 2);
        let n = self.pop();
        let t = self.pop();
        self.push(t & n);
    }

    /// Run-time: ( n1 n2 -- flag )
    fn log_and(&mut self) {
        chk!(self, 2);
        let n = self.pop();
        let t = self.pop();
        self.push((t != 0 && n != 0) as Cell);
    }

    fn bit_or(&mut self) {
        chk!(self, 2);
        let n = self.pop();
        let t = self.pop();
        self.push(t | n);
    }

    fn bit_xor(&mut self) {
        chk!(self, 2);
        let n = self.pop();
        let t = self.pop();
        self.push(t ^ n);
    }

    fn bit_not(&mut self) {
        chk!(self, 1);
        let t = self.pop();
        self.push(!t);
    }

    fn lft_shift(&mut self) {
        chk!(self, 2);
        let n = self.pop();
        let t = self.pop();
        self.push(t.wrapping_shl(n as u32));
    }

    fn rgt_shift(&mut self) {
        chk!(self, 2);
        let n = self.pop();
        let t = self.pop();
        self.push(t.wrapping_shr(n as u32));
    }

    //------------
    // Memory
    //------------

    /// Run-time: ( a-addr -- x )
    fn fetch(&mut self) {
        chk!(self, 1);
        let addr = self.pop() as usize;
        match self.flash_const().get_cell(addr) {
            Ok(v) => self.push(v),
            Err(e) => throw!(self, e),
        }
    }

    /// Run-time: ( x a-addr -- )
    fn store(&mut self) {
        chk!(self, 2);
        let addr = self.pop() as usize;
        let v = self.pop();
        match self.flash().put_cell(addr, v) {
            Ok(()) => {}
            Err(e) => throw!(self, e),
        }
    }

    /// Run-time: ( c-addr -- char )
    fn byte_fetch(&mut self) {
        chk!(self, 1);
        let addr = self.pop() as usize;
        match self.flash_const().get_u8(addr) {
            Ok(v) => self.push(v & 0xff),
            Err(e) => throw!(self, e),
        }
    }

    /// Run-time: ( char c-addr -- )
    fn byte_store(&mut self) {
        chk!(self, 2);
        let addr = self.pop() as usize;
        let v = self.pop();
        match self.flash().put_u8(addr, v & 0xff) {
            Ok(()) => {}
            Err(e) => throw!(self, e),
        }
    }

    /// Run-time: ( h-addr -- h )
    fn half_fetch(&mut self) {
        chk!(self, 1);
        let addr = self.pop() as usize;
        match self.flash_const().get_half(addr) {
            Ok(v) => self.push(v),
            Err(e) => throw!(self, e),
        }
    }

    /// Run-time: ( h h-addr -- )
    fn half_store(&mut self) {
        chk!(self, 2);
        let addr = self.pop() as usize;
        let v = self.pop();
        match self.flash().put_half(addr, v) {
            Ok(()) => {}
            Err(e) => throw!(self, e),
        }
    }

    /// Run-time: ( src dst len -- )
    fn cmove(&mut self) {
        chk!(self, 3);
        let len = self.pop() as usize;
        let dst = self.pop() as usize;
        let src = self.pop() as usize;
        match self.flash().copy(src, dst, len) {
            Ok(()) => {}
            Err(e) => throw!(self, e),
        }
    }

    /// Run-time: ( val ptr len -- )
    fn p_memset(&mut self) {
        chk!(self, 3);
        let len = self.pop() as usize;
        let addr = self.pop() as usize;
        let byte = (self.pop() & 0xff) as u8;
        match self.flash().fill(addr, len, byte) {
            Ok(()) => {}
            Err(e) => throw!(self, e),
        }
    }

    /// Run-time: ( adr -- adr' )
    fn p_align(&mut self) {
        chk!(self, 1);
        let addr = self.pop() as usize;
        self.push(Flash::aligned(addr) as Cell);
    }

    /// Run-time: ( n1 -- n2 ) n2 is the size in address units of n1 cells.
    fn cells(&mut self) {
        chk!(self, 1);
        let t = self.pop();
        self.push(t.wrapping_mul(CELL as Cell));
    }

    fn cellsize(&mut self) {
        self.push(CELL as Cell);
    }

    fn here(&mut self) {
        let here = self.flash().here();
        self.push(here as Cell);
    }

    /// Run-time: ( n -- ) Reserve n cells of data space.
    fn allot(&mut self) {
        chk!(self, 1);
        let n = self.pop();
        match self.flash().allot(n) {
            Ok(()) => {}
            Err(e) => throw!(self, e),
        }
    }

    /// Run-time: ( x -- ) Compile x at HERE.
    fn comma(&mut self) {
        chk!(self, 1);
        let v = self.pop();
        self.compile_cell(v);
    }

    fn freespace(&mut self) {
        let free = self.flash_const().freespace();
        self.push(free);
    }

    fn dp(&mut self) {
        self.push(ARENA_BASE as Cell);
    }

    fn stringptr(&mut self) {
        let sd = self.flash_const().string_data();
        self.push(sd as Cell);
    }

    fn flashsize(&mut self) {
        let limit = self.flash_const().limit();
        self.push((limit / CELL) as Cell);
    }

    fn flashptr(&mut self) {
        self.push(0);
    }

    /// Scratch pad above HERE.
    fn pad(&mut self) {
        let here = self.flash().here();
        self.push((here + 20 * CELL) as Cell);
    }

    /// ( -- addr len ) Next slot of the circular scratch queue.
    fn buf(&mut self) {
        let (addr, len) = self.tmp_bufs().take();
        self.push(addr as Cell);
        self.push(len as Cell);
    }

    /// ( -- addr len ) The fixed scratch buffer.
    fn scratch(&mut self) {
        let addr = self.scratch_addr();
        self.push(addr as Cell);
        self.push(SZ_INBUF as Cell);
    }

    //------------
    // Strings
    //------------

    /// ( "<spaces>name" -- straddr ) Read a token into a scratch slot.
    fn p_word(&mut self) {
        let tkn = match self.next_token() {
            Some(tkn) => tkn,
            None => {
                throw!(self, Exception::NoInput);
                return;
            }
        };
        let (addr, len) = self.tmp_bufs().take();
        let mut end = tkn.len().min(len - 1);
        while end > 0 && !tkn.is_char_boundary(end) {
            end -= 1;
        }
        match self.flash().put_str(addr, &tkn[..end]) {
            Ok(()) => self.push(addr as Cell),
            Err(e) => throw!(self, e),
        }
    }

    /// ( "<spaces>name" -- char ) First character of the next word;
    /// compiled as a literal when compiling.
    fn ascii(&mut self) {
        self.p_word();
        if self.unwinding() {
            return;
        }
        let addr = self.pop() as usize;
        let ch = self.flash_const().get_u8(addr).unwrap_or(0);
        self.push(ch);
        if self.state_const().state == Interp::Compiling {
            let v = self.pop();
            self.compile_integer(v);
        }
    }

    /// ( straddr -- straddr len )
    fn count(&mut self) {
        chk!(self, 1);
        let addr = self.s_stack().last().unwrap_or(0) as usize;
        let len = self
            .flash_const()
            .get_str(addr)
            .map(|s| s.len())
            .unwrap_or(0);
        self.push(len as Cell);
    }

    /// ( straddr -- straddr' ) Intern a string in the cache.
    fn ssave(&mut self) {
        chk!(self, 1);
        let addr = self.pop() as usize;
        let s = match self.flash_const().get_str(addr) {
            Ok(s) => s.to_string(),
            Err(e) => {
                throw!(self, e);
                return;
            }
        };
        match self.flash().str_cache(&s) {
            Ok(new) => self.push(new as Cell),
            Err(e) => throw!(self, e),
        }
    }

    /// ( straddr -- ) Release the most recent cached string; anything else
    /// is too late to un-save.
    fn unssave(&mut self) {
        chk!(self, 1);
        let addr = self.pop() as usize;
        if addr == self.flash_const().string_data() {
            match self.flash().str_uncache() {
                Ok(()) => {}
                Err(e) => throw!(self, e),
            }
        } else {
            throw!(self, Exception::Unsave);
        }
    }

    //------------
    // Dictionary access words
    //------------

    /// ( "<spaces>name" -- xt ) Tick; compiled as a literal when compiling.
    fn tick(&mut self) {
        self.p_word();
        if self.unwinding() {
            return;
        }
        let addr = self.pop() as usize;
        let tkn = match self.flash_const().get_str(addr) {
            Ok(s) => s.to_string(),
            Err(e) => {
                throw!(self, e);
                return;
            }
        };
        match self.lookup(&tkn) {
            Some(xt) => {
                self.push(xt.to_cell());
                if self.state_const().state == Interp::Compiling {
                    let v = self.pop();
                    self.compile_integer(v);
                }
            }
            None => {
                let msg = format!("-- {} ?\n", tkn);
                self.push_output(&msg);
                throw!(self, Exception::NoWord);
            }
        }
    }

    /// ( straddr -- xt | 0 )
    fn p_find(&mut self) {
        chk!(self, 1);
        let addr = self.pop() as usize;
        let tkn = self
            .flash_const()
            .get_str(addr)
            .map(|s| s.to_string())
            .unwrap_or_default();
        match self.lookup(&tkn) {
            Some(xt) => self.push(xt.to_cell()),
            None => self.push(0),
        }
    }

    /// ( xt -- nfa )
    fn to_name(&mut self) {
        chk!(self, 1);
        let cell = self.pop();
        match Xt::from_cell(cell).ok().and_then(|xt| self.entry(xt)) {
            Some(entry) => {
                let nfa = entry.nfa;
                self.push(nfa as Cell);
            }
            None => throw!(self, Exception::NoWord),
        }
    }

    /// ( xt -- code-tag )
    fn to_code(&mut self) {
        chk!(self, 1);
        let cell = self.pop();
        match Xt::from_cell(cell).ok().and_then(|xt| self.entry(xt)) {
            Some(entry) => {
                let tag = match entry.code {
                    Code::Primitive(_) => 0,
                    Code::Colon => 1,
                    Code::Field => 2,
                    Code::Constant => 3,
                };
                self.push(tag);
            }
            None => throw!(self, Exception::NoWord),
        }
    }

    /// ( xt -- pfa )
    fn to_body(&mut self) {
        chk!(self, 1);
        let cell = self.pop();
        match Xt::from_cell(cell).ok().and_then(|xt| self.entry(xt)) {
            Some(entry) => {
                let pfa = entry.pfa;
                self.push(pfa as Cell);
            }
            None => throw!(self, Exception::NoWord),
        }
    }

    /// Run-time of `(literal)`: push the cell following it in the body.
    fn do_literal(&mut self) {
        let ip = self.rpop();
        match self.flash_const().get_cell(ip as usize) {
            Ok(v) => {
                self.push(v);
                self.rpush(ip + CELL as Cell);
            }
            Err(e) => throw!(self, e),
        }
    }

    /// Run-time of a CREATEd word executed by name.
    fn push_pfa(&mut self) {
        let addr = self.rpop();
        self.push(addr);
    }

    //------------
    // System variables and radix
    //------------

    fn decimal(&mut self) {
        let _ = self.flash().put_cell(ADDR_BASE, 10);
    }

    fn hex(&mut self) {
        let _ = self.flash().put_cell(ADDR_BASE, 16);
    }

    fn p_base(&mut self) {
        self.push(ADDR_BASE as Cell);
    }

    fn p_trace(&mut self) {
        self.push(ADDR_TRACE as Cell);
    }

    fn sigvar(&mut self) {
        self.push(ADDR_SIG as Cell);
    }

    fn errvar(&mut self) {
        self.push(ADDR_ERR as Cell);
    }

    fn errval(&mut self) {
        self.errvar();
        self.fetch();
    }

    /// ( err -- straddr )
    fn errstr(&mut self) {
        chk!(self, 1);
        let code = self.pop();
        let text = Exception::from_code(code).description().to_string();
        let (addr, len) = self.tmp_bufs().take();
        let end = text.len().min(len - 1);
        match self.flash().put_str(addr, &text[..end]) {
            Ok(()) => self.push(addr as Cell),
            Err(e) => throw!(self, e),
        }
    }

    //------------
    // Reset and exit
    //------------

    /// Warm reset: stacks cleared, state interactive, dictionary kept.
    fn warm(&mut self) {
        self.push_output("-- Warm start.\n");
        self.q_reset();
        self.state().reset = Some(ResetReason::User);
    }

    /// Cold start: warm reset plus a forgotten dictionary.
    fn cold(&mut self) {
        self.q_reset();
        self.forget();
        self.state().reset = Some(ResetReason::ColdStart);
    }

    /// The `quit` word abandons whatever is running and re-enters the outer
    /// interpreter.
    fn p_quit(&mut self) {
        self.q_reset();
        self.state().reset = Some(ResetReason::Application);
    }

    fn bye(&mut self) {
        self.state().bye = true;
    }

    /// Exit status once `bye` has been requested.
    fn exit_code(&self) -> Option<i32> {
        if self.state_const().bye {
            Some(self.state_const().error.code() as i32)
        } else {
            None
        }
    }

    //------------
    // Boot
    //------------

    fn add_core(&mut self) {
        self.add_primitive("quit", Core::p_quit);
        self.add_primitive("+", Core::add);
        self.add_primitive("-", Core::subt);
        self.add_primitive("*", Core::mult);
        self.add_primitive("^", Core::exponent);
        self.add_primitive("/", Core::divide);
        self.add_primitive("%", Core::modulo);
        self.add_primitive("abs", Core::absolute);
        self.add_primitive("++", Core::plusplus);
        self.add_primitive("--", Core::minusminus);
        self.add_primitive("bye", Core::bye);
        self.add_primitive("depth", Core::depth);
        self.add_primitive("dup", Core::dupe);
        self.add_primitive("?dup", Core::qdupe);
        self.add_primitive("rot", Core::rot);
        self.add_primitive("nip", Core::nip);
        self.add_primitive("tuck", Core::tuck);
        self.add_primitive("drop", Core::p_drop);
        self.add_primitive("over", Core::over);
        self.add_primitive("swap", Core::swap);
        self.add_primitive("pick", Core::pick);
        self.add_primitive(">r", Core::to_r);
        self.add_primitive("r>", Core::r_from);
        self.add_primitive("cells", Core::cells);
        self.add_primitive("cellsize", Core::cellsize);
        self.add_primitive("@", Core::fetch);
        self.add_primitive("!", Core::store);
        self.add_primitive("r@", Core::fetch);
        self.add_primitive("r!", Core::store);
        self.add_primitive("cr@", Core::byte_fetch);
        self.add_primitive("cr!", Core::byte_store);
        self.add_primitive("h@", Core::half_fetch);
        self.add_primitive("h!", Core::half_store);
        self.add_primitive("c@", Core::byte_fetch);
        self.add_primitive("c!", Core::byte_store);
        self.add_primitive("<<", Core::lft_shift);
        self.add_primitive(">>", Core::rgt_shift);
        self.add_primitive("cmove", Core::cmove);
        self.add_primitive("memset", Core::p_memset);
        self.add_primitive("align", Core::p_align);
        self.add_primitive("word", Core::p_word);
        self.add_immediate("ascii", Core::ascii);
        self.add_primitive("count", Core::count);
        self.add_primitive("save", Core::ssave);
        self.add_primitive("unsave", Core::unssave);
        self.add_primitive("dp", Core::dp);
        self.add_primitive("strings", Core::stringptr);
        self.add_primitive("flashsize", Core::flashsize);
        self.add_primitive("flash", Core::flashptr);
        self.add_primitive("here", Core::here);
        self.add_primitive("freespace", Core::freespace);
        self.add_primitive(",", Core::comma);
        self.add_primitive("(literal)", Core::do_literal);
        self.add_primitive(":", Core::colon);
        self.add_primitive(";", Core::semicolon);
        self.add_primitive("execute", Core::execute);
        self.add_primitive("(colon)", Core::do_colon);
        self.add_immediate("'", Core::tick);
        self.add_primitive(">name", Core::to_name);
        self.add_primitive(">code", Core::to_code);
        self.add_primitive(">body", Core::to_body);
        self.add_primitive("decimal", Core::decimal);
        self.add_primitive("hex", Core::hex);
        self.add_primitive("base", Core::p_base);
        self.add_primitive("trace", Core::p_trace);
        self.add_primitive("sigval", Core::sigvar);
        self.add_primitive("errvar", Core::errvar);
        self.add_primitive("errval", Core::errval);
        self.add_primitive("errstr", Core::errstr);
        self.add_primitive("warm", Core::warm);
        self.add_primitive("cold", Core::cold);
        self.add_primitive("(variable)", Core::push_pfa);
        self.add_primitive("allot", Core::allot);
        self.add_primitive("create", Core::create);
        self.add_primitive("lambda", Core::lambda);
        self.add_primitive("does>", Core::does);
        self.add_primitive("constant", Core::constant);
        self.add_primitive("variable", Core::variable);
        self.add_primitive("normal", Core::normal);
        self.add_primitive("immediate", Core::immediate);
        self.add_immediate("[", Core::im_state);
        self.add_immediate("]", Core::pv_state);
        self.add_primitive("unresolved", Core::unresolved);
        self.add_primitive(">mark", Core::fwd_mark);
        self.add_primitive(">resolve", Core::fwd_resolve);
        self.add_primitive("<mark", Core::bkw_mark);
        self.add_primitive("<resolve", Core::bkw_resolve);
        self.add_primitive("?branch", Core::q_branch);
        self.add_primitive("branch", Core::branch);
        self.add_immediate("begin", Core::begin);
        self.add_immediate("again", Core::again);
        self.add_immediate("while", Core::p_while);
        self.add_immediate("repeat", Core::repeat);
        self.add_immediate("until", Core::until);
        self.add_primitive("leave", Core::leave);
        self.add_immediate("if", Core::p_if);
        self.add_immediate("else", Core::p_else);
        self.add_immediate("then", Core::p_then);
        self.add_primitive("<", Core::lt);
        self.add_primitive(">", Core::gt);
        self.add_primitive(">=", Core::ge);
        self.add_primitive("<=", Core::le);
        self.add_primitive("==", Core::eq);
        self.add_primitive("!=", Core::ne);
        self.add_primitive("&", Core::bit_and);
        self.add_primitive("and", Core::log_and);
        self.add_primitive("or", Core::bit_or);
        self.add_primitive("xor", Core::bit_xor);
        self.add_primitive("not", Core::bit_not);
        self.add_primitive("buf", Core::buf);
        self.add_primitive("scratch", Core::scratch);
        self.add_primitive("pad", Core::pad);
        self.add_primitive("find", Core::p_find);
        self.add_immediate("do", Core::qdo);
        self.add_primitive("(do)", Core::do_do);
        self.add_primitive("i", Core::do_i);
        self.add_immediate("loop", Core::p_loop);
        self.add_primitive("(loop)", Core::do_loop);
        self.add_immediate("+loop", Core::plus_loop);
        self.add_primitive("(+loop)", Core::do_plus_loop);
        self.add_primitive("forget", Core::forget);
    }

    /// Resolve the execution tokens the compiler needs.
    fn resolve_references(&mut self) {
        let lit = self.lookup("(literal)").expect("(literal) undefined").0;
        let branch = self.lookup("branch").expect("branch undefined").0;
        let qbranch = self.lookup("?branch").expect("?branch undefined").0;
        let unresolved = self.lookup("unresolved").expect("unresolved undefined").0;
        let do_ = self.lookup("(do)").expect("(do) undefined").0;
        let loop_ = self.lookup("(loop)").expect("(loop) undefined").0;
        let plus_loop = self.lookup("(+loop)").expect("(+loop) undefined").0;
        let refs = self.refs_mut();
        refs.idx_lit = lit;
        refs.idx_branch = branch;
        refs.idx_qbranch = qbranch;
        refs.idx_unresolved = unresolved;
        refs.idx_do = do_;
        refs.idx_loop = loop_;
        refs.idx_plus_loop = plus_loop;
    }
}

fn is_cf_opener(tkn: &str) -> bool {
    matches!(tkn, "if" | "begin" | "do")
}

fn is_cf_closer(tkn: &str) -> bool {
    matches!(tkn, "then" | "until" | "again" | "repeat" | "loop" | "+loop")
}

/// Textual representation of `v` in `base`, lowercase digits, optional
/// leading minus. The inverse of `parser::str_literal` for bases 2..36.
pub fn format_cell(v: Cell, base: Cell, signed: bool) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let base = base.max(2).min(36) as UCell;
    let negative = signed && v < 0;
    let mut n = if negative {
        v.unsigned_abs()
    } else {
        v as UCell
    };
    let mut buf = [0u8; 72];
    let mut i = buf.len();
    loop {
        i -= 1;
        buf[i] = DIGITS[n % base];
        n /= base;
        if n == 0 {
            break;
        }
    }
    let mut s = String::new();
    if negative {
        s.push('-');
    }
    s.push_str(std::str::from_utf8(&buf[i..]).unwrap());
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::VM;

    #[test]
    fn test_stack_over_underflow() {
        let mut stk: Stack<Cell> = Stack::with_capacity(2);
        assert_eq!(stk.push(1), None);
        assert_eq!(stk.push(2), None);
        assert_eq!(stk.push(3), Some(3));
        assert_eq!(stk.as_slice(), [1, 2]);
        assert_eq!(stk.pop(), Some(2));
        assert_eq!(stk.pop(), Some(1));
        assert_eq!(stk.pop(), None);
    }

    #[test]
    fn test_arithmetic() {
        let vm = &mut VM::new();
        vm.set_source("5 7 + 2 - 3 * 4 / 5 %");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert_eq!(vm.s_stack().as_slice(), [2]);
    }

    #[test]
    fn test_exponent() {
        let vm = &mut VM::new();
        vm.set_source("2 10 ^");
        vm.evaluate_input();
        assert_eq!(vm.s_stack().as_slice(), [1024]);
    }

    #[test]
    fn test_division_by_zero() {
        let vm = &mut VM::new();
        vm.set_source("1 0 /");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), Some(Exception::DivisionByZero));
        vm.catch();
        assert_eq!(vm.last_error(), None);
        assert!(vm.s_stack().is_empty());
    }

    #[test]
    fn test_stack_words() {
        let vm = &mut VM::new();
        vm.set_source("1 2 3 rot");
        vm.evaluate_input();
        assert_eq!(vm.s_stack().as_slice(), [2, 3, 1]);

        let vm = &mut VM::new();
        vm.set_source("1 2 tuck");
        vm.evaluate_input();
        assert_eq!(vm.s_stack().as_slice(), [2, 1, 2]);

        let vm = &mut VM::new();
        vm.set_source("1 2 3 1 pick");
        vm.evaluate_input();
        assert_eq!(vm.s_stack().as_slice(), [1, 2, 3, 2]);

        let vm = &mut VM::new();
        vm.set_source("7 >r 1 r>");
        vm.evaluate_input();
        assert_eq!(vm.s_stack().as_slice(), [1, 7]);
    }

    #[test]
    fn test_comparison_flags() {
        let vm = &mut VM::new();
        vm.set_source("1 2 < 2 1 < 3 3 == 3 4 != 2 2 >=");
        vm.evaluate_input();
        assert_eq!(vm.s_stack().as_slice(), [1, 0, 1, 1, 1]);
    }

    #[test]
    fn test_literal_radix() {
        let vm = &mut VM::new();
        vm.set_source("$ff 0x10 017 hex ff decimal 10");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert_eq!(vm.s_stack().as_slice(), [255, 16, 15, 255, 10]);
    }

    #[test]
    fn test_undefined_word_underflow_diagnostic() {
        let vm = &mut VM::new();
        vm.set_source(".");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), Some(Exception::StackUnderflow));
        vm.catch();
        let out = vm.output_buffer().clone();
        assert!(out.contains("Stack underflow"));
        // Interpreter remains responsive.
        vm.output_buffer().clear();
        vm.set_source("2 3 +");
        vm.evaluate_input();
        assert_eq!(vm.s_stack().as_slice(), [5]);
    }

    #[test]
    fn test_colon_definition() {
        let vm = &mut VM::new();
        vm.set_source(": sq dup * ; 7 sq");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert_eq!(vm.s_stack().as_slice(), [49]);
    }

    #[test]
    fn test_nested_colon_definitions() {
        let vm = &mut VM::new();
        vm.set_source(": sq dup * ; : quad sq sq ; 3 quad");
        vm.evaluate_input();
        assert_eq!(vm.s_stack().as_slice(), [81]);
    }

    #[test]
    fn test_semicolon_outside_definition() {
        let vm = &mut VM::new();
        vm.set_source(";");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), Some(Exception::BadState));
    }

    #[test]
    fn test_if_else_then() {
        let vm = &mut VM::new();
        vm.set_source(": negate 0 swap - ; : abs? dup 0 < if negate then ; -4 abs? 5 abs?");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert_eq!(vm.s_stack().as_slice(), [4, 5]);

        let vm = &mut VM::new();
        vm.set_source(": sgn 0 < if 111 else 222 then ; -1 sgn 1 sgn");
        vm.evaluate_input();
        assert_eq!(vm.s_stack().as_slice(), [111, 222]);
    }

    #[test]
    fn test_begin_until() {
        let vm = &mut VM::new();
        vm.set_source(": countdown begin -- dup 0 <= until ; 5 countdown");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert_eq!(vm.s_stack().as_slice(), [0]);
    }

    #[test]
    fn test_begin_while_repeat() {
        let vm = &mut VM::new();
        vm.set_source(": sum 0 begin over 0 > while over + swap -- swap repeat nip ; 4 sum");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        // 4 + 3 + 2 + 1
        assert_eq!(vm.s_stack().as_slice(), [10]);
    }

    #[test]
    fn test_do_loop() {
        let vm = &mut VM::new();
        vm.set_source(": iota 0 do i loop ; 5 iota");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert_eq!(vm.s_stack().as_slice(), [0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_interactive_do_loop() {
        let vm = &mut VM::new();
        let here = vm.flash_const().here();
        vm.set_source("3 0 do i loop");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert_eq!(vm.s_stack().as_slice(), [0, 1, 2]);
        // The fragment space was reclaimed.
        assert_eq!(vm.flash_const().here(), here);
    }

    #[test]
    fn test_interactive_if() {
        let vm = &mut VM::new();
        vm.set_source("1 2 < if 42 then 2 1 < if 43 then");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert_eq!(vm.s_stack().as_slice(), [42]);
    }

    #[test]
    fn test_plus_loop() {
        let vm = &mut VM::new();
        vm.set_source(": evens do i 2 +loop ; 10 0 evens");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert_eq!(vm.s_stack().as_slice(), [0, 2, 4, 6, 8]);
    }

    #[test]
    fn test_plus_loop_negative_increment() {
        let vm = &mut VM::new();
        vm.set_source(": down do i -2 +loop ; 0 10 down");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert_eq!(vm.s_stack().as_slice(), [10, 8, 6, 4, 2]);
    }

    #[test]
    fn test_leave() {
        let vm = &mut VM::new();
        vm.set_source(": once 10 0 do i leave loop ; once");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert_eq!(vm.s_stack().as_slice(), [0]);
        assert!(vm.r_stack().is_empty());
    }

    #[test]
    fn test_constant_variable() {
        let vm = &mut VM::new();
        vm.set_source("42 constant answer answer answer +");
        vm.evaluate_input();
        assert_eq!(vm.s_stack().as_slice(), [84]);

        let vm = &mut VM::new();
        vm.set_source("variable x 3 x ! x @ 4 x ! x @");
        vm.evaluate_input();
        assert_eq!(vm.s_stack().as_slice(), [3, 4]);
    }

    #[test]
    fn test_create_comma_fetch() {
        let vm = &mut VM::new();
        vm.set_source("create pair 11 , 22 , pair @ pair cellsize + @");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert_eq!(vm.s_stack().as_slice(), [11, 22]);
    }

    #[test]
    fn test_create_does() {
        let vm = &mut VM::new();
        vm.set_source(": const create , does> @ ; 13 const thirteen thirteen");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert_eq!(vm.s_stack().as_slice(), [13]);
    }

    #[test]
    fn test_does_body_address_then_tail() {
        let vm = &mut VM::new();
        vm.set_source(": marker create does> ; marker spot spot here");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        let slice = vm.s_stack().as_slice().to_vec();
        assert_eq!(slice.len(), 2);
        // The created word leaves exactly its body address.
        assert!(slice[0] > 0 && slice[0] <= slice[1]);
    }

    #[test]
    fn test_tick_and_execute() {
        let vm = &mut VM::new();
        vm.set_source(": inc ++ ; 4 ' inc execute");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert_eq!(vm.s_stack().as_slice(), [5]);
    }

    #[test]
    fn test_tick_missing_word() {
        let vm = &mut VM::new();
        vm.set_source("' nonesuch");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), Some(Exception::NoWord));
    }

    #[test]
    fn test_immediate_bracket_in_definition() {
        let vm = &mut VM::new();
        vm.set_source(": k [ 2 3 + ] ;");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        // [ 2 3 + ] ran at compile time.
        assert_eq!(vm.s_stack().as_slice(), [5]);
    }

    #[test]
    fn test_compile_rollback_on_bad_literal() {
        let vm = &mut VM::new();
        let here = vm.flash_const().here();
        let strings = vm.flash_const().string_data();
        let words = vm.colon_defs().len();
        vm.set_source(": broken 1 2 zzz9 ;");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), Some(Exception::BadString));
        assert_eq!(vm.flash_const().here(), here);
        assert_eq!(vm.flash_const().string_data(), strings);
        assert_eq!(vm.colon_defs().len(), words);
        vm.catch();
        vm.set_source("2 3 +");
        vm.evaluate_input();
        assert_eq!(vm.s_stack().as_slice(), [5]);
    }

    #[test]
    fn test_forget_idempotent() {
        let vm = &mut VM::new();
        vm.set_source(": sq dup * ; forget");
        vm.evaluate_input();
        let here = vm.flash_const().here();
        let strings = vm.flash_const().string_data();
        vm.set_source("forget");
        vm.evaluate_input();
        assert_eq!(vm.flash_const().here(), here);
        assert_eq!(vm.flash_const().string_data(), strings);
        assert_eq!(vm.colon_defs().len(), 0);
        // sq is gone.
        vm.set_source("2 sq");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), Some(Exception::BadLiteral));
    }

    #[test]
    fn test_forget_resets_base_and_trace() {
        let vm = &mut VM::new();
        vm.set_source("hex 1 trace ! forget base @ trace @");
        vm.evaluate_input();
        assert_eq!(vm.s_stack().as_slice(), [10, 0]);
    }

    #[test]
    fn test_here_past_null_after_semicolon() {
        let vm = &mut VM::new();
        vm.set_source(": nop ;");
        vm.evaluate_input();
        let here = vm.flash_const().here();
        // HERE points one past the null terminator.
        assert_eq!(vm.flash_const().get_cell(here - CELL).unwrap(), 0);
    }

    #[test]
    fn test_memory_words() {
        let vm = &mut VM::new();
        vm.set_source("variable v 258 v ! v c@ v @");
        vm.evaluate_input();
        assert_eq!(vm.s_stack().as_slice(), [2, 258]);
    }

    #[test]
    fn test_null_pointer() {
        let vm = &mut VM::new();
        vm.set_source("0 @");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), Some(Exception::NullPointer));
    }

    #[test]
    fn test_base_variable() {
        let vm = &mut VM::new();
        vm.set_source("base @ hex base @ decimal base @");
        vm.evaluate_input();
        assert_eq!(vm.s_stack().as_slice(), [10, 16, 10]);
    }

    #[test]
    fn test_save_unsave() {
        let vm = &mut VM::new();
        vm.set_source("word hello save");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        let addr = vm.s_stack().last().unwrap() as usize;
        assert_eq!(vm.flash_const().get_str(addr).unwrap(), "hello");
        vm.set_source("unsave");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        // Unsaving anything but the cache top fails.
        vm.set_source("word a save word b save swap unsave");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), Some(Exception::Unsave));
    }

    #[test]
    fn test_word_and_count() {
        let vm = &mut VM::new();
        vm.set_source("word hello count");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        let len = vm.pop();
        assert_eq!(len, 5);
    }

    #[test]
    fn test_errval_reports_and_clears() {
        let vm = &mut VM::new();
        vm.set_source("1 0 /");
        vm.evaluate_input();
        // The code is visible through the system variable while pending.
        assert_eq!(
            vm.flash_const().get_cell(crate::memory::ADDR_ERR).unwrap(),
            Exception::DivisionByZero.code() as Cell
        );
        vm.catch();
        vm.set_source("errval");
        vm.evaluate_input();
        assert_eq!(vm.s_stack().as_slice(), [0]);
    }

    #[test]
    fn test_warm_clears_stacks() {
        let vm = &mut VM::new();
        vm.set_source("1 2 3 warm");
        vm.evaluate_input();
        assert_eq!(vm.catch(), Caught::Reset(ResetReason::User));
        assert!(vm.s_stack().is_empty());
    }

    #[test]
    fn test_cold_forgets() {
        let vm = &mut VM::new();
        vm.set_source(": sq dup * ; cold");
        vm.evaluate_input();
        assert_eq!(vm.catch(), Caught::Reset(ResetReason::ColdStart));
        assert_eq!(vm.colon_defs().len(), 0);
    }

    #[test]
    fn test_trace_prints_word_names(){
        let vm = &mut VM::new();
        vm.set_source("1 trace ! 2 3 +");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), None);
        assert!(vm.output_buffer().contains("+"));
    }

    #[test]
    fn test_format_cell() {
        assert_eq!(format_cell(255, 16, true), "ff");
        assert_eq!(format_cell(-4, 10, true), "-4");
        assert_eq!(format_cell(0, 10, true), "0");
        assert_eq!(format_cell(5, 2, true), "101");
        assert_eq!(format_cell(35, 36, true), "z");
    }

    #[test]
    fn test_format_parse_round_trip() {
        for &n in &[0 as Cell, 1, -1, 42, -255, 65535, Cell::max_value(), Cell::min_value() + 1] {
            for &base in &[2 as Cell, 8, 10, 16, 36] {
                let s = format_cell(n, base, true);
                assert_eq!(parser::str_literal(&s, base), Ok(n), "{} in base {}", s, base);
            }
        }
    }

    #[test]
    fn test_unresolved_placeholder() {
        let vm = &mut VM::new();
        // Compile a forward mark and run it without resolving.
        vm.set_source(": broken [ >mark drop ] ; broken");
        vm.evaluate_input();
        assert_eq!(vm.last_error(), Some(Exception::Unresolved));
    }
}
