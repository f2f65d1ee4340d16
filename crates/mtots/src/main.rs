//! The `mtots` command-line driver.
//!
//! With no arguments, a line-at-a-time REPL evaluating inside a persistent
//! `__main__` module. With one argument, runs that `.mtots` file as
//! `__main__`. Exits 0 on success and 1 on a runtime error.

use std::io::{BufRead, Write};

use mtots::Vm;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let mut vm = Vm::new();

    match args.len() {
        1 => repl(&mut vm),
        2 => run_file(&mut vm, &args[1]),
        _ => {
            eprintln!("Usage: mtots [path]");
            std::process::exit(2);
        }
    }
}

fn repl(vm: &mut Vm) {
    let module = vm.new_script_module("__main__");
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        let _ = std::io::stdout().flush();
        let line = match lines.next() {
            Some(Ok(line)) => line,
            _ => {
                println!();
                break;
            }
        };
        if let Err(err) = vm.interpret(&line, module) {
            eprintln!("{err}");
        }
    }
}

fn run_file(vm: &mut Vm, path: &str) {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not open file \"{path}\": {err}");
            std::process::exit(1);
        }
    };
    let module = vm.new_script_module("__main__");
    let path_value = vm.string_value(path);
    vm.set_module_field(module, "__path__", path_value);
    if let Err(err) = vm.interpret(&source, module) {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
