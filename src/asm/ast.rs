// Declaration AST
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

//! Declaration AST produced by the object text parser.
//!
//! The AST is deliberately shallow:
//!   a unit is a flat sequence of [`Declaration`]s,
//!   and a function body is a flat sequence of [`BodyItem`]s with labels
//!   interleaved among logical instructions.
//! Branch targets remain label symbols here;
//!   they are resolved to instruction offsets during code generation,
//!     which is what makes forward references within a body work without
//!     a second parser pass.

use super::ty::{Prim, Signature, TypeExpression};
use crate::sym::SymbolId;
use std::fmt::{self, Display};

/// Visibility tier of a declared symbol.
///
/// Ordering is by increasing visibility,
///   so `File < Internal < Public`.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub enum Visibility {
    /// Visible only to the declaring unit.
    File,

    /// Visible to every unit of the output module.
    Internal,

    /// Exported from the output module.
    Public,
}

impl Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Visibility::File => f.write_str("file"),
            Visibility::Internal => f.write_str("internal"),
            Visibility::Public => f.write_str("public"),
        }
    }
}

/// A top-level declaration in a unit.
#[derive(Debug, PartialEq, Clone)]
pub enum Declaration {
    Struct(StructDecl),
    Enum(EnumDecl),
    Global(GlobalDecl),
    Function(FunctionDecl),

    /// A `.init` block contributing to the module initializer.
    Init(InitDecl),
}

impl Declaration {
    /// The declared name,
    ///   if the declaration form has one.
    ///
    /// Initializer blocks are anonymous.
    pub fn name(&self) -> Option<SymbolId> {
        match self {
            Declaration::Struct(d) => Some(d.name),
            Declaration::Enum(d) => Some(d.name),
            Declaration::Global(d) => Some(d.name),
            Declaration::Function(d) => Some(d.name),
            Declaration::Init(_) => None,
        }
    }
}

/// Field layout strategy for a structure.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum LayoutSpec {
    /// Fields laid out in declaration order with natural alignment.
    Sequential,

    /// Every field carries an explicit byte offset.
    Explicit,

    /// Sequential layout with alignment capped at the given boundary.
    Packed(u32),
}

/// A structure field.
#[derive(Debug, PartialEq, Clone)]
pub struct FieldDecl {
    pub name: SymbolId,
    pub ty: TypeExpression,

    /// Byte offset under [`LayoutSpec::Explicit`] layout.
    pub offset: Option<u32>,
}

/// `.struct` declaration.
#[derive(Debug, PartialEq, Clone)]
pub struct StructDecl {
    pub name: SymbolId,
    pub vis: Visibility,
    pub layout: LayoutSpec,
    pub fields: Vec<FieldDecl>,
}

/// A named enum member.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct EnumMember {
    pub name: SymbolId,
    pub value: i64,
}

/// `.enum` declaration.
#[derive(Debug, PartialEq, Clone)]
pub struct EnumDecl {
    pub name: SymbolId,
    pub vis: Visibility,

    /// Underlying primitive representation.
    pub base: Prim,
    pub members: Vec<EnumMember>,
}

/// `.global` or `.const` declaration of a module-level field.
#[derive(Debug, PartialEq, Clone)]
pub struct GlobalDecl {
    pub name: SymbolId,
    pub vis: Visibility,
    pub ty: TypeExpression,

    /// Whether the field was declared `.const` and may not be stored to.
    pub constant: bool,
}

/// A declared function local.
#[derive(Debug, PartialEq, Clone)]
pub struct LocalDecl {
    pub name: SymbolId,
    pub ty: TypeExpression,
}

/// Function declaration with its body.
#[derive(Debug, PartialEq, Clone)]
pub struct FunctionDecl {
    pub name: SymbolId,
    pub vis: Visibility,
    pub sig: Signature,
    pub locals: Vec<LocalDecl>,
    pub body: Vec<BodyItem>,
}

/// Anonymous initializer block.
///
/// Initializer bodies may declare locals but may not contain `ret`;
///   the linker concatenates every block into a single module
///   initializer in link order.
#[derive(Debug, PartialEq, Clone)]
pub struct InitDecl {
    pub locals: Vec<LocalDecl>,
    pub body: Vec<BodyItem>,
}

/// An item in a function body.
#[derive(Debug, PartialEq, Clone)]
pub enum BodyItem {
    /// Branch target `name:`.
    Label(SymbolId),

    Instr(Op),
}

/// Reference to an argument by name or by position.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum ArgRef {
    Name(SymbolId),
    Index(u16),
}

/// A logical instruction as written in object text.
///
/// Operands are symbolic;
///   code generation resolves names to slots and handles and label
///   symbols to instruction offsets.
#[derive(Debug, PartialEq, Clone)]
pub enum Op {
    Nop,
    Dup,
    Pop,
    Ret,

    LdNull,
    LdcI4(i32),
    LdcI8(i64),
    LdcR8(f64),
    LdStr(SymbolId),

    LdLoc(SymbolId),
    StLoc(SymbolId),
    LdLocA(SymbolId),

    LdArg(ArgRef),
    StArg(ArgRef),

    /// Load/store/address of a module-level field.
    LdsFld(SymbolId),
    StsFld(SymbolId),
    LdsFldA(SymbolId),

    /// Load/store/address of a structure field given a structure type
    ///   name and field name.
    LdFld(SymbolId, SymbolId),
    StFld(SymbolId, SymbolId),
    LdFldA(SymbolId, SymbolId),

    /// Direct call.
    ///
    /// A call-site signature is required when calling a variadic callee
    ///   and optional otherwise.
    Call {
        sig: Option<Signature>,
        name: SymbolId,
    },

    /// Indirect call through a function pointer on the stack.
    CallI { sig: Signature },

    /// Push the address of a function.
    LdFtn {
        sig: Option<Signature>,
        name: SymbolId,
    },

    Br(SymbolId),
    BrTrue(SymbolId),
    BrFalse(SymbolId),

    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Neg,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Not,

    Ceq,
    Clt,
    Cgt,

    Conv(Prim),

    /// Link-time (or run-time for unsized types) size query.
    SizeOf(TypeExpression),

    LdInd(Prim),
    StInd(Prim),

    VaStart,
    VaArg(TypeExpression),
    VaEnd,
}

impl Op {
    /// Symbol demanded from the containing module's symbol table by this
    ///   instruction,
    ///     if any.
    ///
    /// These demands are what drive lazy archive resolution:
    ///   any name an instruction references must be defined somewhere in
    ///   the link before body generation can succeed.
    pub fn demanded_symbol(&self) -> Option<SymbolId> {
        match self {
            Op::LdsFld(name) | Op::StsFld(name) | Op::LdsFldA(name) => {
                Some(*name)
            }
            Op::LdFld(ty, _) | Op::StFld(ty, _) | Op::LdFldA(ty, _) => {
                Some(*ty)
            }
            Op::Call { name, .. } | Op::LdFtn { name, .. } => Some(*name),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sym::GlobalSymbolIntern;

    #[test]
    fn visibility_orders_by_breadth() {
        assert!(Visibility::File < Visibility::Internal);
        assert!(Visibility::Internal < Visibility::Public);
    }

    #[test]
    fn call_demands_callee_symbol() {
        let callee = "write_line".intern();

        assert_eq!(
            Some(callee),
            Op::Call {
                sig: None,
                name: callee
            }
            .demanded_symbol()
        );
    }

    #[test]
    fn field_access_demands_structure_not_field() {
        let ty = "Point".intern();
        let fld = "x".intern();

        assert_eq!(Some(ty), Op::LdFld(ty, fld).demanded_symbol());
    }

    #[test]
    fn arith_demands_nothing() {
        assert_eq!(None, Op::Add.demanded_symbol());
        assert_eq!(None, Op::LdcI4(42).demanded_symbol());
    }
}
