use std::{env, path::PathBuf, process::ExitCode};

use lnc::CompileOptions;
use log::debug;

const USAGE: &str = "usage: lnc [--std-dir <dir>] <entry.ln>\n\nCompiles an Ln program to AMM on stdout.";

fn main() -> ExitCode {
    env_logger::init();
    let args: Vec<String> = env::args().skip(1).collect();

    let mut options = CompileOptions::default();
    let mut entry: Option<String> = None;
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--std-dir" => {
                let Some(dir) = iter.next() else {
                    eprintln!("--std-dir needs a directory argument\n\n{USAGE}");
                    return ExitCode::from(1);
                };
                options.std_dir = Some(PathBuf::from(dir));
            }
            "-h" | "--help" => {
                println!("{USAGE}");
                return ExitCode::SUCCESS;
            }
            _ if entry.is_none() => entry = Some(arg),
            other => {
                eprintln!("unexpected argument {other}\n\n{USAGE}");
                return ExitCode::from(1);
            }
        }
    }
    let Some(entry) = entry else {
        eprintln!("{USAGE}");
        return ExitCode::from(1);
    };

    debug!("compiling {entry}");
    match lnc::compile_file_with(&entry, &options) {
        Ok(amm) => {
            println!("{amm}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{err}");
            ExitCode::from(err.exit_code())
        }
    }
}
