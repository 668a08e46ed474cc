// Input loading
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

//! Parallel input loading.
//!
//! This is the only concurrent phase of a link.
//! Input references are resolved and opened sequentially on the linking
//!   thread
//!     (which is where visit-once path deduplication lives),
//!   then the opened readers are drained in parallel:
//!     unit text reads,
//!     archive framing and index decode,
//!     and module export scans,
//!       each task owning its private reader.
//! Results land in position-indexed slots so the outcome is
//!   deterministic regardless of scheduling.
//!
//! Nothing in this phase interns;
//!   all results carry owned strings that the linking thread interns
//!   after the join.

use super::archive::{ArchiveError, ArchiveFile};
use crate::fs::{
    Filesystem, FsCanonicalizer, PathFile, VisitOnceFile,
    VisitOnceFilesystem,
};
use crate::module::read::{scan_exports, ModuleReadError};
use crate::module::ExportKind;
use rayon::prelude::*;
use std::error::Error;
use std::fmt::{self, Display};
use std::fs as stdfs;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// An input as named on the command line.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum InputRef {
    /// A path,
    ///   classified by extension (`.mo`, `.ma`, `.mx`).
    File(PathBuf),

    /// `-l <name>`,
    ///   resolved to `lib<name>.ma` over the search path.
    Library(String),
}

/// A loaded input in its slot.
#[derive(Debug)]
pub enum LoadedInput {
    Unit { path: PathBuf, text: String },
    Archive(ArchiveFile),
    Module {
        path: PathBuf,
        name: String,
        exports: Vec<(String, ExportKind)>,
    },

    /// Duplicate path or an optional library that was not found.
    Skipped,
}

/// Failure to load one input.
#[derive(Debug)]
pub enum LoadError {
    Io { path: PathBuf, err: io::Error },
    BadUtf8(PathBuf),
    Archive(ArchiveError),
    Module { path: PathBuf, err: ModuleReadError },

    /// Extension is none of `.mo`, `.ma`, `.mx`.
    UnknownKind(PathBuf),
}

impl Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, err } => {
                write!(f, "cannot read {}: {}", path.display(), err)
            }
            Self::BadUtf8(path) => {
                write!(f, "{} is not valid UTF-8", path.display())
            }
            Self::Archive(e) => Display::fmt(e, f),
            Self::Module { path, err } => {
                write!(f, "{}: {}", path.display(), err)
            }
            Self::UnknownKind(path) => write!(
                f,
                "cannot classify input {} (expected .mo, .ma, or .mx)",
                path.display()
            ),
        }
    }
}

impl Error for LoadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { err, .. } => Some(err),
            Self::Archive(e) => Some(e),
            Self::Module { err, .. } => Some(err),
            _ => None,
        }
    }
}

impl From<ArchiveError> for LoadError {
    fn from(e: ArchiveError) -> Self {
        Self::Archive(e)
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum InputKind {
    Unit,
    Archive,
    Module,
}

fn classify(path: &Path) -> Option<InputKind> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("mo") => Some(InputKind::Unit),
        Some("ma") => Some(InputKind::Archive),
        Some("mx") => Some(InputKind::Module),
        _ => None,
    }
}

/// Resolve `-l name` against the search path.
///
/// A miss is not an error;
///   the caller records the skip and the link proceeds without the
///   library.
fn find_library(name: &str, search: &[PathBuf]) -> Option<PathBuf> {
    let file = format!("lib{}.ma", name);

    search.iter().map(|dir| dir.join(&file)).find(|candidate| {
        stdfs::metadata(candidate)
            .map(|m| m.is_file())
            .unwrap_or(false)
    })
}

type OpenedFile = VisitOnceFile<PathFile<BufReader<stdfs::File>>>;

struct Task {
    slot: usize,
    path: PathBuf,
    kind: InputKind,
    file: PathFile<BufReader<stdfs::File>>,
}

/// Load all inputs.
///
/// Returns one slot per input reference,
///   in reference order,
///   plus every load failure.
pub fn load_inputs(
    refs: &[InputRef],
    search: &[PathBuf],
) -> (Vec<LoadedInput>, Vec<LoadError>) {
    let mut fs: VisitOnceFilesystem<FsCanonicalizer> =
        VisitOnceFilesystem::new();

    let mut slots: Vec<LoadedInput> = Vec::with_capacity(refs.len());
    let mut errors = Vec::new();
    let mut tasks = Vec::new();

    for (slot, input) in refs.iter().enumerate() {
        slots.push(LoadedInput::Skipped);

        let path = match input {
            InputRef::File(path) => path.clone(),
            InputRef::Library(name) => {
                match find_library(name, search) {
                    Some(path) => {
                        debug!(
                            library = %name,
                            path = %path.display(),
                            "resolved library"
                        );
                        path
                    }
                    None => {
                        warn!(
                            library = %name,
                            "library not found on search path; skipping"
                        );
                        continue;
                    }
                }
            }
        };

        let kind = match classify(&path) {
            Some(kind) => kind,
            None => {
                errors.push(LoadError::UnknownKind(path));
                continue;
            }
        };

        let opened: io::Result<OpenedFile> = fs.open(&path);
        match opened {
            Ok(VisitOnceFile::FirstVisit(file)) => {
                tasks.push(Task {
                    slot,
                    path,
                    kind,
                    file,
                });
            }
            Ok(VisitOnceFile::Visited) => {
                debug!(path = %path.display(), "already loaded; skipping");
            }
            Err(err) => errors.push(LoadError::Io { path, err }),
        }
    }

    let results: Vec<(usize, Result<LoadedInput, LoadError>)> = tasks
        .into_par_iter()
        .map(|task| {
            let Task {
                slot,
                path,
                kind,
                mut file,
            } = task;
            (slot, load_one(path, kind, &mut file))
        })
        .collect();

    for (slot, result) in results {
        match result {
            Ok(loaded) => slots[slot] = loaded,
            Err(e) => errors.push(e),
        }
    }

    (slots, errors)
}

fn load_one<R: Read>(
    path: PathBuf,
    kind: InputKind,
    file: &mut R,
) -> Result<LoadedInput, LoadError> {
    match kind {
        InputKind::Unit => {
            let mut bytes = Vec::new();
            file.read_to_end(&mut bytes).map_err(|err| {
                LoadError::Io {
                    path: path.clone(),
                    err,
                }
            })?;

            let text = String::from_utf8(bytes)
                .map_err(|_| LoadError::BadUtf8(path.clone()))?;

            Ok(LoadedInput::Unit { path, text })
        }

        InputKind::Archive => Ok(LoadedInput::Archive(
            ArchiveFile::read(path, file)?,
        )),

        InputKind::Module => {
            let (name, exports) =
                scan_exports(file).map_err(|err| LoadError::Module {
                    path: path.clone(),
                    err,
                })?;

            Ok(LoadedInput::Module {
                path,
                name,
                exports,
            })
        }
    }
}
