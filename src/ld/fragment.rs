// Input fragments
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

//! Accepted input fragments.
//!
//! A fragment is one unit of input accepted into the link:
//!   a directly supplied object,
//!   an archive member pulled on demand,
//!   or a previously compiled module contributing exports.
//! Fragment identity is what scopes `file`-visible symbols;
//!   two declarations see each other's `file` symbols exactly when they
//!   share a [`FragmentId`].

use crate::asm::ast::Declaration;
use crate::module::ExportKind;
use crate::sym::SymbolId;
use std::fmt::{self, Display};
use std::path::PathBuf;

/// Index of a [`Fragment`] within one link.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord)]
pub struct FragmentId(pub(super) u32);

impl FragmentId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Where a fragment's content came from.
#[derive(Debug, PartialEq, Clone)]
pub enum FragmentSource {
    /// Object text supplied directly on the command line.
    Object(PathBuf),

    /// Archive member pulled because a symbol it defines was demanded.
    ArchiveMember {
        archive: PathBuf,
        member: String,
    },

    /// Previously compiled module.
    Module(PathBuf),
}

impl Display for FragmentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Object(path) | Self::Module(path) => {
                write!(f, "{}", path.display())
            }
            Self::ArchiveMember { archive, member } => {
                write!(f, "{}({})", archive.display(), member)
            }
        }
    }
}

/// The content a fragment contributes.
#[derive(Debug, PartialEq, Clone)]
pub enum FragmentKind {
    /// Parsed object text declarations.
    Unit(Vec<Declaration>),

    /// Export list of a compiled module.
    ///
    /// The module body is loaded lazily on the linking thread only if
    ///   one of these exports is actually demanded.
    ModuleExports(Vec<(SymbolId, ExportKind)>),
}

/// One accepted input fragment.
#[derive(Debug, PartialEq, Clone)]
pub struct Fragment {
    pub id: FragmentId,
    pub source: FragmentSource,
    pub kind: FragmentKind,
}

impl Fragment {
    /// Declarations of a unit fragment,
    ///   or the empty slice for module fragments.
    pub fn decls(&self) -> &[Declaration] {
        match &self.kind {
            FragmentKind::Unit(decls) => decls,
            FragmentKind::ModuleExports(_) => &[],
        }
    }
}

/// A declaration addressed by its position within its fragment.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct DeclRef {
    pub frag: FragmentId,
    pub index: usize,
}
