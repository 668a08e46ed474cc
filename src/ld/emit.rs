// Output emission
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

//! Module emission with backup discipline.
//!
//! The linked module is serialized fully in memory before any path is
//!   touched,
//!     so serialization failures can never leave a half-written output.
//! When the destination already exists it is renamed aside first and
//!   restored if the write fails;
//!     the previous output survives every failure mode short of the
//!     process being killed mid-write.
//!
//! Injection (`--inject`) merges the linked module's definitions into an
//!   existing on-disk module and writes the result back to that module's
//!   path;
//!     the normal output path is not written in that mode.
//!
//! Executable emission writes two companions next to the module:
//!   a `.mxrc` run descriptor naming the module and its entry point,
//!   and a `.host` shell launcher.

use crate::module::read::{read_module, ModuleReadError};
use crate::module::write::write_module;
use crate::module::Module;
use std::error::Error;
use std::fmt::{self, Display};
use std::fs;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Failure to emit the linked output.
#[derive(Debug)]
pub enum EmitError {
    Io { path: PathBuf, err: io::Error },

    /// The injection target could not be decoded.
    Inject {
        path: PathBuf,
        err: ModuleReadError,
    },

    /// Executable output requested but the module has no entry point.
    NoEntry,
}

impl Display for EmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, err } => {
                write!(f, "cannot write {}: {}", path.display(), err)
            }
            Self::Inject { path, err } => write!(
                f,
                "cannot inject into {}: {}",
                path.display(),
                err
            ),
            Self::NoEntry => {
                f.write_str("executable output requires an entry point")
            }
        }
    }
}

impl Error for EmitError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { err, .. } => Some(err),
            Self::Inject { err, .. } => Some(err),
            Self::NoEntry => None,
        }
    }
}

/// Emit `module` according to the output options.
///
/// With `dry_run` set,
///   everything short of touching the filesystem still happens,
///     including serialization and injection-target decoding,
///   so a dry run surfaces the same errors a real one would.
pub fn emit(
    module: &Module,
    output: &Path,
    inject: Option<&Path>,
    dry_run: bool,
    emit_exe: bool,
) -> Result<(), EmitError> {
    // Injection replaces the output module with the merged target.
    let merged;
    let (dest, emitted): (&Path, &Module) = match inject {
        None => (output, module),
        Some(target_path) => {
            let file = fs::File::open(target_path).map_err(|err| {
                EmitError::Io {
                    path: target_path.to_owned(),
                    err,
                }
            })?;

            let mut target = read_module(BufReader::new(file))
                .map_err(|err| EmitError::Inject {
                    path: target_path.to_owned(),
                    err,
                })?;

            let map = target.absorb(module);
            if target.entry().is_none() {
                if let Some(entry) = module.entry() {
                    target.set_entry(map.method(entry));
                }
            }

            merged = target;
            (target_path, &merged)
        }
    };

    if emit_exe && emitted.entry().is_none() {
        return Err(EmitError::NoEntry);
    }

    let mut bytes = Vec::new();
    write_module(emitted, &mut bytes).map_err(|err| EmitError::Io {
        path: dest.to_owned(),
        err,
    })?;

    if dry_run {
        debug!(
            dest = %dest.display(),
            size = bytes.len(),
            "dry run; output not written"
        );
        return Ok(());
    }

    write_with_backup(dest, &bytes)?;
    info!(
        dest = %dest.display(),
        size = bytes.len(),
        "wrote module"
    );

    if emit_exe {
        emit_companions(dest, emitted)?;
    }

    Ok(())
}

/// Write the `.mxrc` run descriptor and `.host` launcher next to the
///   module.
fn emit_companions(dest: &Path, module: &Module) -> Result<(), EmitError> {
    // Checked by the caller before the module write.
    let Some(entry) = module.entry() else {
        return Err(EmitError::NoEntry);
    };

    let module_file = file_name(dest);

    let mxrc_path = dest.with_extension("mxrc");
    let mxrc = format!(
        "module {}\nentry {}\n",
        module_file,
        module.method(entry).name
    );
    write_with_backup(&mxrc_path, mxrc.as_bytes())?;

    let host_path = dest.with_extension("host");
    let host = format!(
        "#!/bin/sh\nexec moltrun \"$(dirname \"$0\")/{}\" \"$@\"\n",
        file_name(&mxrc_path)
    );
    write_with_backup(&host_path, host.as_bytes())?;

    info!(
        mxrc = %mxrc_path.display(),
        host = %host_path.display(),
        "wrote executable companions"
    );

    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn backup_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".bak");
    PathBuf::from(os)
}

/// Replace `path` with `bytes`,
///   preserving any previous file until the write succeeds.
fn write_with_backup(path: &Path, bytes: &[u8]) -> Result<(), EmitError> {
    let backup = backup_path(path);
    let existed = path.exists();

    if existed {
        fs::rename(path, &backup).map_err(|err| EmitError::Io {
            path: path.to_owned(),
            err,
        })?;
    }

    match fs::write(path, bytes) {
        Ok(()) => {
            if existed {
                let _ = fs::remove_file(&backup);
            }
            Ok(())
        }
        Err(err) => {
            if existed {
                let _ = fs::rename(&backup, path);
            }
            Err(EmitError::Io {
                path: path.to_owned(),
                err,
            })
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::module::read::read_module;
    use crate::module::{
        Access, Instr, MTy, MethodDef, SigDef,
    };
    use crate::asm::ty::Prim;
    use crate::sym::GlobalSymbolIntern;

    fn module_with_method(name: &str) -> Module {
        let mut module = Module::new("out".intern());
        let sig = module.add_sig(SigDef {
            ret: MTy::Prim(Prim::I32),
            params: vec![],
            varargs: false,
        });
        module.add_method(MethodDef {
            name: name.intern(),
            access: Access::Public,
            sig,
            locals: vec![],
            body: vec![Instr::LdcI4(1), Instr::Ret],
        });
        module
    }

    #[test]
    fn writes_readable_module() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.mx");
        let module = module_with_method("f");

        emit(&module, &out, None, false, false).unwrap();

        let read = read_module(BufReader::new(
            fs::File::open(&out).unwrap(),
        ))
        .unwrap();
        assert_eq!(module, read);
    }

    #[test]
    fn dry_run_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.mx");

        emit(&module_with_method("f"), &out, None, true, false)
            .unwrap();

        assert!(!out.exists());
    }

    #[test]
    fn rewrite_leaves_no_backup_behind() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.mx");

        emit(&module_with_method("f"), &out, None, false, false)
            .unwrap();
        emit(&module_with_method("g"), &out, None, false, false)
            .unwrap();

        assert!(!backup_path(&out).exists());

        let read = read_module(BufReader::new(
            fs::File::open(&out).unwrap(),
        ))
        .unwrap();
        assert!(read
            .methods()
            .any(|(_, m)| m.name == "g".intern()));
    }

    #[test]
    fn inject_merges_into_existing_module() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("host.mx");

        emit(&module_with_method("existing"), &target, None, false, false)
            .unwrap();

        let out = dir.path().join("unused.mx");
        emit(
            &module_with_method("added"),
            &out,
            Some(&target),
            false,
            false,
        )
        .unwrap();

        assert!(!out.exists(), "inject must not write the output path");

        let read = read_module(BufReader::new(
            fs::File::open(&target).unwrap(),
        ))
        .unwrap();
        for name in ["existing", "added"] {
            assert!(
                read.methods().any(|(_, m)| m.name == name.intern()),
                "missing {}",
                name
            );
        }
    }

    #[test]
    fn exe_emits_descriptor_and_launcher() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("prog.mx");

        let mut module = module_with_method("main");
        let entry = module
            .methods()
            .find(|(_, m)| m.name == "main".intern())
            .map(|(h, _)| h)
            .unwrap();
        module.set_entry(entry);

        emit(&module, &out, None, false, true).unwrap();

        let mxrc =
            fs::read_to_string(dir.path().join("prog.mxrc")).unwrap();
        assert_eq!("module prog.mx\nentry main\n", mxrc);

        let host =
            fs::read_to_string(dir.path().join("prog.host")).unwrap();
        assert!(host.contains("prog.mxrc"));
    }

    #[test]
    fn exe_without_entry_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("prog.mx");

        let result =
            emit(&module_with_method("main"), &out, None, false, true);
        assert!(matches!(result, Err(EmitError::NoEntry)));
        assert!(!out.exists());
    }
}
