// Metadata module container
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

//! In-memory metadata module container.
//!
//! A [`Module`] holds the metadata tables the linker populates:
//!   types,
//!   fields,
//!   methods,
//!   and interned signatures,
//!     each addressed by a copyable integer handle.
//! Handles are append-only:
//!   a definition may be created as an empty shell during the shape
//!   phase and filled in later
//!     (see [`Module::method_mut`] and friends),
//!   but it is never removed or reordered,
//!     so a handle captured early stays valid for the life of the
//!     module.
//!
//! Instruction operands at this level are fully resolved:
//!   local and argument slots,
//!   table handles,
//!   and absolute instruction offsets for branches.
//! The textual frontend's symbolic operands never appear here.
//!
//! The binary `.mx` encoding lives in the [`write`] and [`read`]
//!   submodules and is not a compatibility surface;
//!     only this crate reads what it writes.

pub mod read;
pub mod write;

use crate::asm::ty::Prim;
use crate::sym::SymbolId;

/// Handle to a [`TypeDef`] within one [`Module`].
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord)]
pub struct TypeHandle(pub(crate) u32);

/// Handle to a [`FieldDef`] within one [`Module`].
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord)]
pub struct FieldHandle(pub(crate) u32);

/// Handle to a [`MethodDef`] within one [`Module`].
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord)]
pub struct MethodHandle(pub(crate) u32);

/// Handle to a deduplicated [`SigDef`] within one [`Module`].
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord)]
pub struct SigHandle(pub(crate) u32);

macro_rules! handle_index {
    ($($ty:ty),*) => {
        $(impl $ty {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        })*
    };
}

handle_index!(TypeHandle, FieldHandle, MethodHandle, SigHandle);

/// Member accessibility in module metadata.
///
/// The frontend's `file` visibility lowers to [`Access::Private`];
///   file scoping is a link-time concept with no runtime meaning beyond
///   non-export.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
#[repr(u8)]
pub enum Access {
    Public,
    Internal,
    Private,
}

/// A metadata type reference.
#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub enum MTy {
    Prim(Prim),
    Type(TypeHandle),
    Pointer(Box<MTy>),
    ByRef(Box<MTy>),
    FnPtr(SigHandle),
}

/// Field layout strategy of a structure type.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum Layout {
    Sequential,
    Explicit,
    Packed(u32),
}

/// The defining shape of a [`TypeDef`].
#[derive(Debug, PartialEq, Clone)]
pub enum TypeKind {
    Struct {
        layout: Layout,
        fields: Vec<FieldHandle>,
    },

    Enum {
        base: Prim,
        members: Vec<(SymbolId, i64)>,
    },

    /// Synthesized companion type for `T[N]` / `T[*]`.
    ///
    /// `len` is [`None`] for flexible arrays,
    ///   which carry no inline storage and no bounds check.
    ValueArray { elem: MTy, len: Option<u32> },
}

/// A type definition.
#[derive(Debug, PartialEq, Clone)]
pub struct TypeDef {
    pub name: SymbolId,
    pub access: Access,
    pub kind: TypeKind,
}

/// A field definition,
///   either module-level (`owner` is [`None`]) or belonging to a
///   structure.
#[derive(Debug, PartialEq, Clone)]
pub struct FieldDef {
    pub name: SymbolId,
    pub access: Access,
    pub owner: Option<TypeHandle>,
    pub ty: MTy,

    /// Explicit byte offset under [`Layout::Explicit`].
    pub offset: Option<u32>,

    /// Read-only after module initialization.
    pub constant: bool,
}

/// A deduplicated method signature.
#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub struct SigDef {
    pub ret: MTy,
    pub params: Vec<MTy>,
    pub varargs: bool,
}

/// A method definition.
///
/// The body is empty for a shell created during the shape phase and is
///   filled in by body generation.
#[derive(Debug, PartialEq, Clone)]
pub struct MethodDef {
    pub name: SymbolId,
    pub access: Access,
    pub sig: SigHandle,
    pub locals: Vec<MTy>,
    pub body: Vec<Instr>,
}

/// A fully resolved bytecode instruction.
///
/// Branch targets are absolute instruction indices within the owning
///   body.
#[derive(Debug, PartialEq, Clone)]
pub enum Instr {
    Nop,
    Dup,
    Pop,
    Ret,

    LdNull,
    LdcI4(i32),
    LdcI8(i64),
    LdcR8(f64),
    LdStr(SymbolId),

    LdLoc(u16),
    StLoc(u16),
    LdLocA(u16),
    LdArg(u16),
    StArg(u16),

    LdsFld(FieldHandle),
    StsFld(FieldHandle),
    LdsFldA(FieldHandle),
    LdFld(FieldHandle),
    StFld(FieldHandle),
    LdFldA(FieldHandle),

    /// Direct call.
    ///
    /// Variadic call sites carry the concrete site signature so the
    ///   runtime knows the appended argument types.
    Call(MethodHandle, Option<SigHandle>),
    CallI(SigHandle),
    LdFtn(MethodHandle),

    Br(u32),
    BrTrue(u32),
    BrFalse(u32),

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

    /// Runtime size query for types whose size is not a link-time
    ///   constant.
    SizeOf(MTy),

    LdInd(Prim),
    StInd(Prim),

    VaStart,
    VaArg(MTy),
    VaEnd,

    /// Raise an index-range fault.
    ///
    /// Emitted by synthesized value-array accessors when the bounds
    ///   check fails.
    RangeFault,
}

/// What kind of member an export entry names.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
#[repr(u8)]
pub enum ExportKind {
    Type,
    Field,
    Method,
}

/// A metadata module under construction or loaded from disk.
#[derive(Debug, PartialEq, Clone)]
pub struct Module {
    pub name: SymbolId,

    types: Vec<TypeDef>,
    fields: Vec<FieldDef>,
    methods: Vec<MethodDef>,
    sigs: Vec<SigDef>,

    entry: Option<MethodHandle>,
}

impl Module {
    pub fn new(name: SymbolId) -> Self {
        Self {
            name,
            types: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            sigs: Vec::new(),
            entry: None,
        }
    }

    pub fn add_type(&mut self, def: TypeDef) -> TypeHandle {
        let handle = TypeHandle(self.types.len() as u32);
        self.types.push(def);
        handle
    }

    pub fn add_field(&mut self, def: FieldDef) -> FieldHandle {
        let handle = FieldHandle(self.fields.len() as u32);
        self.fields.push(def);
        handle
    }

    pub fn add_method(&mut self, def: MethodDef) -> MethodHandle {
        let handle = MethodHandle(self.methods.len() as u32);
        self.methods.push(def);
        handle
    }

    /// Intern a signature,
    ///   returning the existing handle when an identical one was added
    ///   before.
    pub fn add_sig(&mut self, def: SigDef) -> SigHandle {
        if let Some(i) = self.sigs.iter().position(|s| *s == def) {
            return SigHandle(i as u32);
        }

        let handle = SigHandle(self.sigs.len() as u32);
        self.sigs.push(def);
        handle
    }

    pub fn ty(&self, handle: TypeHandle) -> &TypeDef {
        &self.types[handle.index()]
    }

    pub fn type_mut(&mut self, handle: TypeHandle) -> &mut TypeDef {
        &mut self.types[handle.index()]
    }

    pub fn field(&self, handle: FieldHandle) -> &FieldDef {
        &self.fields[handle.index()]
    }

    pub fn method(&self, handle: MethodHandle) -> &MethodDef {
        &self.methods[handle.index()]
    }

    pub fn method_mut(&mut self, handle: MethodHandle) -> &mut MethodDef {
        &mut self.methods[handle.index()]
    }

    pub fn sig(&self, handle: SigHandle) -> &SigDef {
        &self.sigs[handle.index()]
    }

    pub fn types(&self) -> impl Iterator<Item = (TypeHandle, &TypeDef)> {
        self.types
            .iter()
            .enumerate()
            .map(|(i, d)| (TypeHandle(i as u32), d))
    }

    pub fn fields(&self) -> impl Iterator<Item = (FieldHandle, &FieldDef)> {
        self.fields
            .iter()
            .enumerate()
            .map(|(i, d)| (FieldHandle(i as u32), d))
    }

    pub fn methods(
        &self,
    ) -> impl Iterator<Item = (MethodHandle, &MethodDef)> {
        self.methods
            .iter()
            .enumerate()
            .map(|(i, d)| (MethodHandle(i as u32), d))
    }

    pub fn set_entry(&mut self, method: MethodHandle) {
        self.entry = Some(method);
    }

    pub fn entry(&self) -> Option<MethodHandle> {
        self.entry
    }

    /// Append every definition of `other` to this module,
    ///   rebasing handles.
    ///
    /// Types,
    ///   fields,
    ///   and methods are append-only tables,
    ///     so those handles rebase by a constant offset.
    /// Signatures intern through [`add_sig`](Self::add_sig) instead,
    ///   so a structurally equal signature resolves to a single handle
    ///   no matter which module contributed it first;
    ///     the [`read`] decoder interns the same way,
    ///     and a duplicate entry would shift every handle written after
    ///     it on re-read.
    /// The returned [`AbsorbMap`] translates any handle valid in
    ///   `other` into the equivalent handle here.
    /// `other`'s entry point,
    ///   if any,
    ///   is discarded.
    pub fn absorb(&mut self, other: &Module) -> AbsorbMap {
        let mut map = AbsorbMap {
            type_base: self.types.len() as u32,
            field_base: self.fields.len() as u32,
            method_base: self.methods.len() as u32,
            sigs: Vec::with_capacity(other.sigs.len()),
        };

        // A signature can only reference signatures interned before it,
        //   so mapping in index order sees every referent already
        //   mapped.
        for def in &other.sigs {
            let remapped = SigDef {
                ret: map.mty(&def.ret),
                params: def.params.iter().map(|p| map.mty(p)).collect(),
                varargs: def.varargs,
            };

            let handle = self.add_sig(remapped);
            map.sigs.push(handle);
        }

        for def in &other.types {
            let kind = match &def.kind {
                TypeKind::Struct { layout, fields } => TypeKind::Struct {
                    layout: *layout,
                    fields: fields
                        .iter()
                        .map(|&f| map.field(f))
                        .collect(),
                },
                TypeKind::Enum { base, members } => TypeKind::Enum {
                    base: *base,
                    members: members.clone(),
                },
                TypeKind::ValueArray { elem, len } => {
                    TypeKind::ValueArray {
                        elem: map.mty(elem),
                        len: *len,
                    }
                }
            };

            self.types.push(TypeDef {
                name: def.name,
                access: def.access,
                kind,
            });
        }

        for def in &other.fields {
            self.fields.push(FieldDef {
                name: def.name,
                access: def.access,
                owner: def.owner.map(|o| map.ty(o)),
                ty: map.mty(&def.ty),
                offset: def.offset,
                constant: def.constant,
            });
        }

        for def in &other.methods {
            self.methods.push(MethodDef {
                name: def.name,
                access: def.access,
                sig: map.sig(def.sig),
                locals: def.locals.iter().map(|l| map.mty(l)).collect(),
                body: def.body.iter().map(|i| map.instr(i)).collect(),
            });
        }

        map
    }

    /// Publicly visible members of this module.
    ///
    /// These are what an already-compiled module contributes to a link
    ///   that references it.
    pub fn exports(
        &self,
    ) -> impl Iterator<Item = (SymbolId, ExportKind)> + '_ {
        let types = self
            .types
            .iter()
            .filter(|t| t.access == Access::Public)
            .map(|t| (t.name, ExportKind::Type));
        let fields = self
            .fields
            .iter()
            .filter(|f| f.access == Access::Public && f.owner.is_none())
            .map(|f| (f.name, ExportKind::Field));
        let methods = self
            .methods
            .iter()
            .filter(|m| m.access == Access::Public)
            .map(|m| (m.name, ExportKind::Method));

        types.chain(fields).chain(methods)
    }
}

/// Handle translation produced by [`Module::absorb`].
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct AbsorbMap {
    type_base: u32,
    field_base: u32,
    method_base: u32,

    /// Destination handle per source signature index.
    sigs: Vec<SigHandle>,
}

impl AbsorbMap {
    pub fn ty(&self, h: TypeHandle) -> TypeHandle {
        TypeHandle(h.0 + self.type_base)
    }

    pub fn field(&self, h: FieldHandle) -> FieldHandle {
        FieldHandle(h.0 + self.field_base)
    }

    pub fn method(&self, h: MethodHandle) -> MethodHandle {
        MethodHandle(h.0 + self.method_base)
    }

    pub fn sig(&self, h: SigHandle) -> SigHandle {
        self.sigs[h.index()]
    }

    fn mty(&self, m: &MTy) -> MTy {
        match m {
            MTy::Prim(p) => MTy::Prim(*p),
            MTy::Type(h) => MTy::Type(self.ty(*h)),
            MTy::Pointer(inner) => {
                MTy::Pointer(Box::new(self.mty(inner)))
            }
            MTy::ByRef(inner) => MTy::ByRef(Box::new(self.mty(inner))),
            MTy::FnPtr(h) => MTy::FnPtr(self.sig(*h)),
        }
    }

    fn instr(&self, i: &Instr) -> Instr {
        match i {
            Instr::LdsFld(h) => Instr::LdsFld(self.field(*h)),
            Instr::StsFld(h) => Instr::StsFld(self.field(*h)),
            Instr::LdsFldA(h) => Instr::LdsFldA(self.field(*h)),
            Instr::LdFld(h) => Instr::LdFld(self.field(*h)),
            Instr::StFld(h) => Instr::StFld(self.field(*h)),
            Instr::LdFldA(h) => Instr::LdFldA(self.field(*h)),

            Instr::Call(m, site) => {
                Instr::Call(self.method(*m), site.map(|s| self.sig(s)))
            }
            Instr::CallI(s) => Instr::CallI(self.sig(*s)),
            Instr::LdFtn(m) => Instr::LdFtn(self.method(*m)),

            Instr::SizeOf(m) => Instr::SizeOf(self.mty(m)),
            Instr::VaArg(m) => Instr::VaArg(self.mty(m)),

            other => other.clone(),
        }
    }
}
