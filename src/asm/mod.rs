// Object text frontend
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

//! Frontend for `.mo` object text.
//!
//! This subsystem turns a unit of object text into a flat declaration
//!   stream:
//!
//!   - [`lex`] splits the text into logical statements;
//!   - [`ty`] parses composite type-name tokens into structured
//!       [`ty::TypeExpression`]s; and
//!   - [`parse`] assembles statements into [`ast::Declaration`]s,
//!       collecting [`parse::SyntaxError`]s rather than stopping at the
//!       first.
//!
//! The linker core consumes only the declaration stream;
//!   nothing downstream of [`parse::parse_unit`] depends on the textual
//!   representation.

pub mod ast;
pub mod lex;
pub mod parse;
pub mod ty;

pub use ast::Visibility;
