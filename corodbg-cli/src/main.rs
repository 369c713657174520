//! corodbg CLI - コマンドラインインターフェース
//!
//! 停止したプロセスにアタッチし、machinarium のコルーチンを調べるREPL

use anyhow::Result;
use clap::{Parser, Subcommand};
use corodbg_core::{Flow, LiveTarget, RuntimeLayout, Session};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::info;

/// corodbg - Coroutine Inspector
#[derive(Parser)]
#[command(name = "corodbg")]
#[command(version)]
#[command(about = "Inspect cooperative coroutines of a stopped process", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: DebugCommand,
}

#[derive(Subcommand)]
enum DebugCommand {
    /// Attach to an existing process
    Attach {
        /// Process ID to attach to
        #[arg(short, long)]
        pid: i32,

        /// Executable with debug information (defaults to /proc/<pid>/exe)
        #[arg(short, long)]
        binary: Option<PathBuf>,

        /// Name of the thread-local variable pointing to the runtime instance
        #[arg(long, default_value = "mm_self")]
        anchor: String,

        /// Name of the coroutine record type
        #[arg(long, default_value = "mm_coroutine")]
        coroutine_type: String,

        /// Command to execute after attaching (repeatable)
        #[arg(short = 'x', long = "ex")]
        ex: Vec<String>,

        /// Exit after running the --ex commands
        #[arg(long)]
        batch: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        DebugCommand::Attach {
            pid,
            binary,
            anchor,
            coroutine_type,
            ex,
            batch,
        } => {
            let target = LiveTarget::attach(pid, binary.as_deref())?;
            let layout = RuntimeLayout::default()
                .with_anchor(anchor)
                .with_coroutine_type(coroutine_type);
            let mut session = Session::new(target).with_layout(layout);

            for line in &ex {
                info!(command = %line, "running startup command");
                if run_line(&mut session, line) == Flow::Quit {
                    return Ok(());
                }
            }
            if !batch {
                run_repl(&mut session)?;
            }
        }
    }

    Ok(())
}

/// 1行実行し、エラーは表示して続行する
fn run_line(session: &mut Session<LiveTarget>, line: &str) -> Flow {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let flow = match session.execute(line, &mut out) {
        Ok(flow) => flow,
        Err(e) => {
            let _ = out.flush();
            eprintln!("Error: {}", e);
            Flow::Continue
        }
    };
    let _ = out.flush();
    flow
}

/// REPLループを実行する
fn run_repl(session: &mut Session<LiveTarget>) -> Result<()> {
    println!("Type 'help' for available commands, 'quit' to exit.");
    println!();

    let mut rl = DefaultEditor::new()?;

    loop {
        let readline = rl.readline("(corodbg) ");
        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                rl.add_history_entry(line)?;

                if run_line(session, line) == Flow::Quit {
                    break;
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}
