// Global constants across the entirety of MOLT
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

//! System-wide static configuration.
//!
//! Subsystems should reference these values rather than defining their own
//!   and risk incompatibilities as requirements change.
//!
//! By convention,
//!   import this entire module and reference members as `global::foo` to
//!   emphasize their nature.

use std::num;

/// A size capable of representing every interned string in a link.
pub type SymSize = u32;

/// A non-zero equivalent of [`SymSize`].
pub type NonZeroSymSize = num::NonZeroU32;

/// A size capable of representing every fragment contributing to a link.
///
/// Archives may contain hundreds of members,
///   each of which becomes its own fragment when pulled,
///   so this is deliberately larger than a typical invocation needs.
pub type FragSize = u32;

/// A size capable of representing every metadata row
///   (type, method, field)
///   in an output module.
pub type RowSize = u32;

/// Initial capacity for the global interner.
pub const INIT_GLOBAL_INTERNER_CAPACITY: usize = 1024;

// Indexes are frequently stored in metadata rows and instruction
//   operands; make sure nobody widens one without noticing.
assert_eq_size!(SymSize, RowSize);
