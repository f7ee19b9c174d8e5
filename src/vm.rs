use crate::core::{Console, Core, Deferred, Refs, Stack, State, SZ_STACK};
use crate::env::Environment;
use crate::facility::Facility;
use crate::loader::{HasLoader, InputStack};
use crate::memory::{Flash, TempBufs};
use crate::output::Output;
use crate::tools::Tools;
use crate::word::{Cell, Entry};
use std::fs::File;

/// The virtual machine.
///
/// Every process-wide singleton of the classical design lives here, so a
/// test can instantiate as many machines as it likes.
pub struct VM {
    flash: Flash,
    primitives: Vec<Entry<VM>>,
    colon_defs: Vec<Entry<VM>>,
    s_stk: Stack<Cell>,
    r_stk: Stack<Cell>,
    u_stk: Stack<Cell>,
    state: State,
    inputs: InputStack,
    outbuf: String,
    out_files: Vec<File>,
    tkn: Option<String>,
    tmp_bufs: TempBufs,
    scratch: usize,
    refs: Refs,
    deferred: Deferred,
    console: Option<Console>,
    quiet: bool,
    locale: String,
    sign_negative: bool,
}

impl VM {
    pub fn new() -> VM {
        let mut flash = Flash::new();
        let tty = flash
            .str_cache("tty")
            .expect("string cache exhausted during boot");
        let mut vm = VM {
            flash,
            primitives: vec![],
            colon_defs: vec![],
            s_stk: Stack::with_capacity(SZ_STACK),
            r_stk: Stack::with_capacity(SZ_STACK),
            u_stk: Stack::with_capacity(SZ_STACK),
            state: State::new(),
            inputs: InputStack::new(tty),
            outbuf: String::with_capacity(128),
            out_files: vec![],
            tkn: None,
            tmp_bufs: TempBufs::default(),
            scratch: 0,
            refs: Refs::default(),
            deferred: Deferred::new(),
            console: None,
            quiet: false,
            locale: String::from("POSIX"),
            sign_negative: false,
        };
        vm.add_core();
        vm.add_output();
        vm.add_loader();
        vm.add_tools();
        vm.add_environment();
        vm.add_facility();
        vm.resolve_references();
        // Boot strings become the low-water mark FORGET restores to.
        vm.flash.str_seal();
        vm.forget();
        vm.q_reset();
        vm
    }

    /// Install the line reader used to refill source 0.
    pub fn set_console(&mut self, console: Console) {
        self.console = Some(console);
    }

    pub fn set_quiet(&mut self, quiet: bool) {
        self.quiet = quiet;
    }

    pub fn set_locale(&mut self, locale: String) {
        self.locale = locale;
    }
}

impl Core for VM {
    fn flash(&mut self) -> &mut Flash {
        &mut self.flash
    }
    fn flash_const(&self) -> &Flash {
        &self.flash
    }
    fn primitives(&self) -> &[Entry<VM>] {
        &self.primitives
    }
    fn primitives_mut(&mut self) -> &mut Vec<Entry<VM>> {
        &mut self.primitives
    }
    fn colon_defs(&self) -> &[Entry<VM>] {
        &self.colon_defs
    }
    fn colon_defs_mut(&mut self) -> &mut Vec<Entry<VM>> {
        &mut self.colon_defs
    }
    fn s_stack(&mut self) -> &mut Stack<Cell> {
        &mut self.s_stk
    }
    fn s_stack_const(&self) -> &Stack<Cell> {
        &self.s_stk
    }
    fn r_stack(&mut self) -> &mut Stack<Cell> {
        &mut self.r_stk
    }
    fn r_stack_const(&self) -> &Stack<Cell> {
        &self.r_stk
    }
    fn u_stack(&mut self) -> &mut Stack<Cell> {
        &mut self.u_stk
    }
    fn state(&mut self) -> &mut State {
        &mut self.state
    }
    fn state_const(&self) -> &State {
        &self.state
    }
    fn input_stack(&mut self) -> &mut InputStack {
        &mut self.inputs
    }
    fn output_buffer(&mut self) -> &mut String {
        &mut self.outbuf
    }
    fn last_token(&mut self) -> &mut Option<String> {
        &mut self.tkn
    }
    fn tmp_bufs(&mut self) -> &mut TempBufs {
        &mut self.tmp_bufs
    }
    fn set_tmp_bufs(&mut self, bufs: TempBufs) {
        self.tmp_bufs = bufs;
    }
    fn scratch_addr(&self) -> usize {
        self.scratch
    }
    fn set_scratch_addr(&mut self, addr: usize) {
        self.scratch = addr;
    }
    fn refs(&self) -> Refs {
        self.refs
    }
    fn refs_mut(&mut self) -> &mut Refs {
        &mut self.refs
    }
    fn deferred(&mut self) -> &mut Deferred {
        &mut self.deferred
    }
    fn read_console(&mut self, prompt: &str) -> Option<String> {
        match self.console.as_mut() {
            Some(console) => console(prompt),
            None => None,
        }
    }
    fn has_console(&self) -> bool {
        self.console.is_some()
    }
    fn out_files(&mut self) -> &mut Vec<File> {
        &mut self.out_files
    }
    fn quiet(&self) -> bool {
        self.quiet
    }
    fn locale(&self) -> &str {
        &self.locale
    }
    fn sign_negative(&self) -> bool {
        self.sign_negative
    }
    fn set_sign_negative(&mut self, v: bool) {
        self.sign_negative = v;
    }
}

impl Environment for VM {}
impl Facility for VM {}
impl HasLoader for VM {}
impl Output for VM {}
impl Tools for VM {}
