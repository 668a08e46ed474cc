// MOLT: a linker for managed object text
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

//! MOLT links textual assembly units (`.mo`),
//!   archives of units (`.ma`),
//!   and compiled modules (`.mx`)
//!   into a single bytecode module.
//!
//! The library is organized around the link pipeline:
//!
//!   - [`asm`] parses object text into declarations;
//!   - [`ld`] drives the link:
//!       loading,
//!       symbol resolution with lazy archive pulls,
//!       code generation,
//!       and emission;
//!   - [`module`] is the metadata container and its binary encoding;
//!   - [`sym`] provides string interning,
//!       on which nearly everything else rests.

// We build docs for private items.
#![allow(rustdoc::private_intra_doc_links)]

pub mod global;

#[macro_use]
extern crate static_assertions;

pub mod asm;
pub mod fs;
pub mod ld;
pub mod module;
pub mod sym;
