use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use secd::machine::StepOutcome;
use secd::session::Session;
use secd::trace::StepEvent;
use secd::value::Value;
use secd::{DEFAULT_STEP_LIMIT, Error};
use std::panic;
use std::process;
use std::sync::Once;

static LOGGING: Once = Once::new();

/// Log to stderr, filtered by `RUST_LOG` (default: warn)
fn init_logging() {
    LOGGING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .compact()
            .try_init();
    });
}

fn main() {
    init_logging();

    let result = panic::catch_unwind(|| {
        run_repl();
    });

    if let Err(panic_info) = result {
        eprintln!("The REPL encountered an unexpected error and must exit.");

        if let Some(msg) = panic_info.downcast_ref::<&str>() {
            eprintln!("Error: {msg}");
        } else if let Some(msg) = panic_info.downcast_ref::<String>() {
            eprintln!("Error: {msg}");
        } else {
            eprintln!("Error: Unknown panic occurred");
        }

        process::exit(1);
    }
}

fn run_repl() {
    println!("SECD Lisp - compiled to bytecode for the SECD machine");
    println!("Enter expressions like: (let ((x 1) (y 4)) (+ x y))");
    println!("Definitions persist: (define (square x) (* x x))");
    println!("Type :help for more commands, or Ctrl+C to exit.");
    println!();

    let mut rl = DefaultEditor::new().expect("Could not initialize REPL");
    let mut session = Session::new().with_step_limit(DEFAULT_STEP_LIMIT);

    loop {
        match rl.readline("secd> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                // Add the line to history
                let _ = rl.add_history_entry(line);

                let (command, rest) = match line.split_once(char::is_whitespace) {
                    Some((command, rest)) => (command, rest.trim()),
                    None => (line, ""),
                };

                match command {
                    ":help" => print_help(),
                    ":env" => print_environment(&session),
                    ":code" => report(show_code(&session, rest)),
                    ":step" => report(step_through(&session, rest)),
                    ":quit" | ":exit" => {
                        println!("Goodbye!");
                        break;
                    }
                    _ if command.starts_with(':') => {
                        println!("Unknown command {command}; type :help for a list");
                    }
                    _ => match session.eval(line) {
                        Ok(Some(value)) => println!("{value}"),
                        // Definitions leave nothing to print
                        Ok(None) => {}
                        Err(e) => println!("Error: {e}"),
                    },
                }
            }

            Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => {
                println!("Goodbye!");
                break;
            }
            Err(err) => {
                println!("Error: {err:?}");
                break;
            }
        }
    }
}

fn report(result: Result<(), Error>) {
    if let Err(e) = result {
        println!("Error: {e}");
    }
}

fn show_code(session: &Session, source: &str) -> Result<(), Error> {
    let compiled = session.compile(source)?;
    println!("{}", Value::List(compiled.code));
    Ok(())
}

/// Run `source` one instruction at a time, printing each step
fn step_through(session: &Session, source: &str) -> Result<(), Error> {
    let mut machine = session.machine(source)?;
    let mut print_step = |event: &StepEvent<'_>| {
        let origin = event
            .origin
            .and_then(|span| source.get(span.start..span.end))
            .unwrap_or("");
        let stack: Vec<String> = event.stack.iter().map(ToString::to_string).collect();
        println!(
            "{:>4}  {:<6} {:<24} S=[{}] D={}",
            event.step,
            event.opcode.mnemonic(),
            origin,
            stack.join(" "),
            event.dump_depth
        );
    };

    while machine.steps() < DEFAULT_STEP_LIMIT {
        if machine.step_observed(&mut print_step)? == StepOutcome::Halted {
            match machine.stack().last() {
                Some(value) => println!("=> {value}"),
                None => println!("=> (nothing)"),
            }
            return Ok(());
        }
    }
    println!("Stopped after {DEFAULT_STEP_LIMIT} steps");
    Ok(())
}

fn print_help() {
    println!("SECD Lisp REPL:");
    println!("  <expr>        - Compile and run, printing the top of the Stack");
    println!("  :code <expr>  - Show the bytecode for an expression");
    println!("  :step <expr>  - Run an expression one instruction at a time");
    println!("                  (definitions made while stepping are discarded)");
    println!("  :env          - Show global definitions");
    println!("  :help         - Show this help message");
    println!("  :quit         - Exit the interpreter");
    println!("  Ctrl+C        - Exit the interpreter");
    println!();
    println!("Language:");
    println!("  Numbers: 42   Booleans: #t #f   Strings: \"text\"   Empty list: null");
    println!("  Arithmetic: + - * /   Comparison: = != < <= > >=   Logic: and or");
    println!("  Lists: cons car cdr consp, 'quoted, `(quasi ,quoted)");
    println!("  Forms: if, lambda, let, letrec, begin, define");
    println!();
    println!("Examples:");
    println!("  (- 10 (+ 2 (* 4 5)))");
    println!("  (letrec ((f (lambda (n) (if (= n 0) 1 (* n (f (- n 1))))))) (f 6))");
    println!("  `(1 ,(+ 1 2) 3)");
    println!();
}

fn print_environment(session: &Session) {
    let bindings = session.bindings();

    if bindings.is_empty() {
        println!("No global definitions.");
        return;
    }

    println!("Global definitions ({} total):", bindings.len());
    for (name, value) in bindings {
        println!("  {name} = {value}");
    }
}
