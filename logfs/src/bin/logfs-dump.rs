//! Walk one or more meta logs and print every record to stdout.

use arrrg::CommandLine;

use logfs::logfile::{scan_meta_log, ReplaySink};
use logfs::{Error, LogFsOptions, Typemap};

struct Printer;

impl ReplaySink for Printer {
    fn init(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn start_epoch(&mut self, epoch: i32) -> Result<bool, Error> {
        println!("sync epoch={}", epoch);
        Ok(true)
    }

    fn set_view(
        &mut self,
        displacement: i64,
        etype: Typemap,
        ftype: Typemap,
    ) -> Result<bool, Error> {
        print!("view disp={} etype=", displacement);
        print_typemap(&etype);
        print!(" ftype=");
        print_typemap(&ftype);
        println!();
        Ok(true)
    }

    fn set_size(&mut self, size: i64) -> Result<bool, Error> {
        println!("setsize size={}", size);
        Ok(true)
    }

    fn write(&mut self, fileofs: i64, size: i32, datalog_ofs: i64) -> Result<bool, Error> {
        println!("data ofs={} size={} datalog={}", fileofs, size, datalog_ofs);
        Ok(true)
    }

    fn done(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

fn print_typemap(map: &Typemap) {
    print!("[");
    for (index, len) in map.indices().iter().zip(map.blocklens().iter()) {
        print!("({} {})", index, len);
    }
    print!("]");
}

fn main() {
    let (_, files) =
        LogFsOptions::from_command_line("USAGE: logfs-dump [OPTIONS] [<base>.<rank>.meta ...]");
    for file in files {
        let mut printer = Printer;
        if let Err(err) = scan_meta_log(&file, &mut printer) {
            eprintln!("{}: {:?}", file, err);
            std::process::exit(1);
        }
    }
}
