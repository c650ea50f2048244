//! Pretty-print how the command-line is interpreted.

use arrrg::CommandLine;

use logfs::LogFsOptions;

fn main() {
    let (options, free) = LogFsOptions::from_command_line("USAGE: logfs-options [OPTIONS]");
    if !free.is_empty() {
        eprintln!("expected no positional arguments");
        std::process::exit(1);
    }
    println!("{options:#?}");
}
