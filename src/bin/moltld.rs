// MOLT linker
//
//  Copyright (C) 2021-2024 The MOLT Project Contributors.
//
//  This file is part of MOLT.
//
//  This program is free software: you can redistribute it and/or modify
//  it under the terms of the GNU General Public License as published by
//  the Free Software Foundation, either version 3 of the License, or
//  (at your option) any later version.
//
//  This program is distributed in the hope that it will be useful,
//  but WITHOUT ANY WARRANTY; without even the implied warranty of
//  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
//  GNU General Public License for more details.
//
//  You should have received a copy of the GNU General Public License
//  along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! This is the MOLT linker,
//!   so named after the traditional `ld` Unix utility.
//! It takes object text units,
//!   archives,
//!   and already-compiled modules,
//!   and produces a single bytecode module.
//!
//! For more information about the linker,
//!   see the [`molt::ld`] module.

extern crate molt;

use getopts::{Fail, Options};
use molt::ld::{link, InputRef, LinkOptions};
use std::env;
use std::path::PathBuf;

/// Types of commands
enum Command {
    Link(LinkOptions),
    Usage,
}

/// Entrypoint for the linker
pub fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    let program = &args[0];
    let opts = get_opts();
    let usage =
        opts.usage(&format!("Usage: {} [OPTIONS] INPUT...", program));

    match parse_options(opts, args) {
        Ok(Command::Link(options)) => match link(&options) {
            Ok(()) => (),
            Err(errors) => {
                for e in &errors {
                    eprintln!("moltld: {}", e);
                }
                eprintln!(
                    "fatal: failed to link `{}` due to previous {} error(s)",
                    options.output.display(),
                    errors.len(),
                );
                std::process::exit(exitcode::DATAERR);
            }
        },
        Ok(Command::Usage) => {
            println!("{}", usage);
            std::process::exit(exitcode::OK);
        }
        Err(e) => {
            eprintln!("{}", e);
            println!("{}", usage);
            std::process::exit(exitcode::USAGE);
        }
    }
}

fn get_opts() -> Options {
    let mut opts = Options::new();
    opts.optopt("o", "output", "set output module file name", "NAME");
    opts.optmulti("L", "", "add DIR to the library search path", "DIR");
    opts.optmulti("l", "", "link against library lib<NAME>.ma", "NAME");
    opts.optopt(
        "",
        "inject",
        "merge the linked output into an existing module",
        "MODULE",
    );
    opts.optflag("", "dry-run", "run the link but write nothing");
    opts.optopt("", "entry", "set the entry point function", "NAME");
    opts.optflag("", "exe", "emit run descriptor and host launcher");
    opts.optflag("O", "optimize", "strip nops and retarget branches");
    opts.optflag("h", "help", "print this help menu");

    opts
}

/// Option parser
fn parse_options(opts: Options, args: Vec<String>) -> Result<Command, Fail> {
    let matches = opts.parse(&args[1..])?;

    if matches.opt_present("h") {
        return Ok(Command::Usage);
    }

    if matches.free.is_empty() {
        return Err(Fail::OptionMissing(String::from("INPUT")));
    }

    // File inputs in argument order,
    //   followed by libraries in argument order.
    let mut inputs: Vec<InputRef> = matches
        .free
        .iter()
        .map(|path| InputRef::File(PathBuf::from(path)))
        .collect();
    inputs.extend(matches.opt_strs("l").into_iter().map(InputRef::Library));

    let output = match matches.opt_str("o") {
        Some(name) => PathBuf::from(name),
        None => PathBuf::from("out.mx"),
    };

    Ok(Command::Link(LinkOptions {
        inputs,
        output,
        search_paths: matches
            .opt_strs("L")
            .into_iter()
            .map(PathBuf::from)
            .collect(),
        inject: matches.opt_str("inject").map(PathBuf::from),
        dry_run: matches.opt_present("dry-run"),
        entry: matches.opt_str("entry"),
        emit_exe: matches.opt_present("exe"),
        optimize: matches.opt_present("optimize"),
    }))
}
