use getopts::Options;
use offorth::core::{Caught, Core};
use offorth::exception::ResetReason;
use offorth::loader::HasLoader;
use offorth::memory::ADDR_TRACE;
use offorth::output::Output;
use offorth::vm::VM;
use std::env;
use std::process;

fn main() {
    process::exit(run());
}

fn run() -> i32 {
    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();
    let mut opts = Options::new();
    opts.optopt("i", "", "push <infile> onto the input stack", "<infile>");
    opts.optopt("x", "", "run <word> once the primary input is drained", "<word>");
    opts.optflag("q", "", "suppress the banner");
    opts.optflag("t", "", "enable tracing before the first token");

    let matches = match opts.parse(&args[1..]) {
        Ok(matches) => matches,
        Err(_) => {
            print_usage(&program, &opts);
            return 1;
        }
    };

    let vm = &mut VM::new();
    if let Ok(locale) = env::var("LANG") {
        if !locale.is_empty() {
            vm.set_locale(locale);
        }
    }
    vm.set_quiet(matches.opt_present("q"));
    if matches.opt_present("t") {
        let _ = vm.flash().put_cell(ADDR_TRACE, 1);
    }

    if let Some(word) = matches.opt_str("x") {
        vm.deferred().word = Some(word);
    }
    match matches.opt_str("i") {
        Some(path) => {
            if let Err(e) = vm.include(&path) {
                eprintln!("{}", e);
                return e.code() as i32;
            }
        }
        None => {
            // Without a primary input the -x word runs right away.
            let pending = {
                let deferred = vm.deferred();
                deferred.done = true;
                deferred.word.clone()
            };
            if let Some(word) = pending {
                if let Some(xt) = vm.lookup(&word) {
                    vm.execute_xt(xt);
                }
            }
        }
    }

    if let Ok(mut rl) = rustyline::Editor::<()>::new() {
        vm.set_console(Box::new(move |prompt| match rl.readline(prompt) {
            Ok(line) => {
                let _ = rl.add_history_entry(line.as_str());
                Some(line + "\n")
            }
            Err(_) => None,
        }));
    }

    vm.banner();
    vm.flush();
    repl(vm)
}

/// The outer interpreter: read a token, dispatch, catch, flush.
fn repl(vm: &mut VM) -> i32 {
    loop {
        if let Some(code) = vm.exit_code() {
            vm.flush();
            return code;
        }
        let tkn = match vm.next_token() {
            Some(tkn) => tkn,
            None => {
                vm.flush();
                return 0;
            }
        };
        vm.interpret_token(&tkn);
        match vm.catch() {
            Caught::Ok => {}
            Caught::Reset(reason) => {
                let msg = format!("-- Reset by {}.\n", reason.description());
                vm.push_output(&msg);
                if reason == ResetReason::ColdStart {
                    vm.banner();
                }
            }
            Caught::Die(code) => {
                vm.flush();
                return code;
            }
        }
        vm.flush();
    }
}

fn print_usage(program: &str, opts: &Options) {
    let brief = format!("usage:\n\t{} [-i <infile>] [-q] [-t] [-x <word>]", program);
    print!("{}", opts.usage(&brief));
}
