//! Dump the superblock of one or more logfs files to stdout.

use arrrg::CommandLine;

use logfs::superblock::{Superblock, MODE_ACTIVE, MODE_REPLAY};
use logfs::LogFsOptions;

fn mode_str(flags: i32) -> &'static str {
    match flags {
        MODE_REPLAY => "REPLAY",
        MODE_ACTIVE => "ACTIVE",
        0 => "closed",
        _ => "(unknown)",
    }
}

fn main() {
    let (_, files) =
        LogFsOptions::from_command_line("USAGE: logfs-stat [OPTIONS] [<file>.logfs ...]");
    for file in files {
        match Superblock::read_from(&file) {
            Ok(Some(sb)) => {
                println!(
                    "{}: mode {} count {} epoch {} base |{}|",
                    file,
                    mode_str(sb.flags),
                    sb.logfile_count,
                    sb.epoch,
                    sb.logfile_base
                );
            }
            Ok(None) => {
                eprintln!("{}: no superblock", file);
                std::process::exit(1);
            }
            Err(err) => {
                eprintln!("{}: {:?}", file, err);
                std::process::exit(1);
            }
        }
    }
}
