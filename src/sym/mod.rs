// String internment system
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

//! String internment system.
//!
//! Interned strings are represented by an integer [`SymbolId`],
//!   created by an [`Interner`].
//! Interners represent symbols as integer values which allows for `O(1)`
//!   comparison of any arbitrary interned value,
//!     regardless of length.
//!
//! The most common way to intern strings is using the global thread-local
//!   interner via [`GlobalSymbolIntern`] and [`GlobalSymbolResolve`]:
//!
//! ```
//! use molt::sym::{GlobalSymbolIntern, GlobalSymbolResolve, SymbolId};
//!
//! let foo: SymbolId = "foo".intern();
//!
//! // Interning the same string twice returns the same intern.
//! assert_eq!(foo, "foo".intern());
//!
//! // All interns can be freely copied.
//! let foo2 = foo;
//! assert_eq!(foo, foo2);
//!
//! // Interned slices can be looked up by their symbol id.
//! assert_eq!("foo", foo.lookup_str());
//! ```
//!
//! Strings are interned as soon as they are encountered
//!   (from source inputs or archive symbol tables)
//!   and all subsequent processing stages hold only [`SymbolId`],
//!     looking up the string only when it must be written or displayed.
//!
//! Internment Mechanism
//! ====================
//! The interner is backed by a [bumpalo][] arena mapped by the
//!   [Fx Hash][fxhash] hash function,
//!     motivated by Rustc's own internment system.
//! Symbol ids are monotonically increasing from 1,
//!   so they double as densely packed indexes.
//!
//! The global interner is thread-local and interning must consequently be
//!   confined to the linking thread;
//!     the parallel input-loading phase operates on raw strings and defers
//!     interning until results are merged
//!       (see [`crate::ld::load`]).
//!
//! A small set of symbols is pre-interned at known ids
//!   (see [`st`])
//!   so that built-in type names can be compared without any lookup.

mod interner;
mod prefill;
mod symbol;

pub use interner::{ArenaInterner, DefaultInterner, Interner};
pub use prefill::st;
pub use symbol::{
    GlobalSymbolIntern, GlobalSymbolResolve, SymbolId, SymbolStr,
};
