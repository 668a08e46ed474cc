// Shape phase of code generation
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

//! Shape phase:
//!   materialize metadata shells for every accepted declaration.
//!
//! Shaping runs in two passes over the accepted fragment set:
//!
//!   1. create an empty shell for every type and bind it,
//!        so that pass two can resolve any type name regardless of
//!        declaration order
//!          (this is what makes forward references and circular
//!            structures work);
//!   2. fill structure fields and create module-level fields and method
//!        shells,
//!          lowering every [`TypeExpression`] into metadata [`MTy`]s.
//!
//! Inline array types `T[N]` / `T[*]` are synthesized on first use as a
//!   companion value type with `get`/`set` indexer methods,
//!     memoized by (element, length) so every unit mentioning `int32[6]`
//!     shares one type.
//!
//! Errors are collected,
//!   never short-circuited;
//!     a shape error poisons emission but later declarations still
//!     shape so their own problems surface in the same run.

use super::fragment::{DeclRef, Fragment, FragmentId};
use super::symtab::{
    Binding, BindingTarget, DeclShape, ResolveError, SymbolTable, Target,
};
use crate::asm::ast::{Declaration, LayoutSpec, Visibility};
use crate::asm::ty::{ArrayLen, Prim, Signature, TypeExpression};
use crate::module::{
    Access, FieldDef, Instr, Layout, MethodDef, Module, SigDef, SigHandle,
    TypeDef, TypeHandle, TypeKind,
};
use crate::sym::{GlobalSymbolIntern, SymbolId};
use fxhash::FxHashMap;
use std::error::Error;
use std::fmt::{self, Display};
use tracing::trace;

/// A code generation failure attributed to one declaration or operand.
#[derive(Debug, PartialEq, Clone)]
pub enum CodegenError {
    Unresolved(SymbolId),
    Ambiguous { name: SymbolId, count: usize },

    /// Name resolved to a different kind of symbol than the operand
    ///   requires.
    WrongKind {
        name: SymbolId,
        expected: &'static str,
        found: &'static str,
    },

    /// Explicit-layout structure field without an offset.
    MissingOffset { ty: SymbolId, field: SymbolId },

    /// Field offset given outside explicit layout.
    StrayOffset { ty: SymbolId, field: SymbolId },

    DuplicateLocalName { func: SymbolId, name: SymbolId },
    UnknownLocal { func: SymbolId, name: SymbolId },
    UnknownArg { func: SymbolId, name: SymbolId },
    ArgIndexOutOfRange { func: SymbolId, index: u16 },
    DuplicateLabel { func: SymbolId, label: SymbolId },
    UnresolvedLabel { func: SymbolId, label: SymbolId },

    UnknownField { ty: SymbolId, field: SymbolId },
    StoreToConstant(SymbolId),

    /// Call-site signature absent or incompatible with the callee.
    SignatureMismatch { callee: SymbolId },
    SiteSignatureRequired { callee: SymbolId },

    /// `ldftn` of a variadic function whose body never executes
    ///   `va.start`.
    VarargPrologueMissing { callee: SymbolId },

    /// `va.start` / `va.arg` / `va.end` in a non-variadic function.
    VaOutsideVarargs { func: SymbolId },
}

impl Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use CodegenError::*;

        match self {
            Unresolved(name) => {
                write!(f, "unresolved symbol `{}`", name)
            }
            Ambiguous { name, count } => write!(
                f,
                "symbol `{}` is ambiguous ({} candidates)",
                name, count
            ),
            WrongKind {
                name,
                expected,
                found,
            } => write!(
                f,
                "`{}` is a {}, but a {} is required",
                name, found, expected
            ),
            MissingOffset { ty, field } => write!(
                f,
                "explicit-layout structure `{}` field `{}` has no offset",
                ty, field
            ),
            StrayOffset { ty, field } => write!(
                f,
                "field `{}.{}` has an offset but `{}` is not explicit",
                ty, field, ty
            ),
            DuplicateLocalName { func, name } => write!(
                f,
                "local `{}` redeclared in function `{}`",
                name, func
            ),
            UnknownLocal { func, name } => {
                write!(f, "no local `{}` in function `{}`", name, func)
            }
            UnknownArg { func, name } => {
                write!(f, "no argument `{}` in function `{}`", name, func)
            }
            ArgIndexOutOfRange { func, index } => write!(
                f,
                "argument index {} out of range in function `{}`",
                index, func
            ),
            DuplicateLabel { func, label } => write!(
                f,
                "label `{}` defined twice in function `{}`",
                label, func
            ),
            UnresolvedLabel { func, label } => write!(
                f,
                "branch to undefined label `{}` in function `{}`",
                label, func
            ),
            UnknownField { ty, field } => {
                write!(f, "structure `{}` has no field `{}`", ty, field)
            }
            StoreToConstant(name) => {
                write!(f, "cannot store to constant `{}`", name)
            }
            SignatureMismatch { callee } => write!(
                f,
                "call-site signature does not match callee `{}`",
                callee
            ),
            SiteSignatureRequired { callee } => write!(
                f,
                "variadic callee `{}` requires a call-site signature",
                callee
            ),
            VarargPrologueMissing { callee } => write!(
                f,
                "`{}` is variadic but never executes va.start; \
                 its address cannot be taken",
                callee
            ),
            VaOutsideVarargs { func } => write!(
                f,
                "va.* instruction in non-variadic function `{}`",
                func
            ),
        }
    }
}

impl Error for CodegenError {}

impl From<ResolveError> for CodegenError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::NotFound(name) => Self::Unresolved(name),
            ResolveError::Ambiguous { name, count } => {
                Self::Ambiguous { name, count }
            }
        }
    }
}

pub(super) fn access_of(vis: Visibility) -> Access {
    match vis {
        Visibility::Public => Access::Public,
        Visibility::Internal => Access::Internal,
        Visibility::File => Access::Private,
    }
}

fn layout_of(spec: LayoutSpec) -> Layout {
    match spec {
        LayoutSpec::Sequential => Layout::Sequential,
        LayoutSpec::Explicit => Layout::Explicit,
        LayoutSpec::Packed(n) => Layout::Packed(n),
    }
}

/// Code generation context shared by the shape and body phases.
pub struct Codegen<'a> {
    pub(super) module: &'a mut Module,
    pub(super) symtab: &'a mut SymbolTable,

    /// Value-array memo: (element, length) to synthesized type.
    arrays: FxHashMap<(crate::module::MTy, Option<u32>), TypeHandle>,

    pub(super) errors: Vec<CodegenError>,
}

impl<'a> Codegen<'a> {
    pub fn new(
        module: &'a mut Module,
        symtab: &'a mut SymbolTable,
    ) -> Self {
        Self {
            module,
            symtab,
            arrays: FxHashMap::default(),
            errors: Vec::new(),
        }
    }

    /// Errors collected so far,
    ///   surrendered to the caller.
    pub fn take_errors(&mut self) -> Vec<CodegenError> {
        std::mem::take(&mut self.errors)
    }

    /// Run the shape phase over the accepted fragments.
    pub fn shape(&mut self, fragments: &[Fragment]) {
        // Pass 1: type shells.
        for fragment in fragments {
            for (index, decl) in fragment.decls().iter().enumerate() {
                let decl_ref = DeclRef {
                    frag: fragment.id,
                    index,
                };

                match decl {
                    Declaration::Struct(d) => {
                        self.shell_struct(decl_ref, d.name, d.vis)
                    }
                    Declaration::Enum(d) => self.shell_enum(decl_ref, d),
                    _ => (),
                }
            }
        }

        // Pass 2: fields, globals, method shells.
        for fragment in fragments {
            for (index, decl) in fragment.decls().iter().enumerate() {
                let decl_ref = DeclRef {
                    frag: fragment.id,
                    index,
                };

                match decl {
                    Declaration::Struct(d) => {
                        self.fill_struct(decl_ref, d)
                    }
                    Declaration::Global(d) => {
                        self.shape_global(decl_ref, d)
                    }
                    Declaration::Function(d) => {
                        self.shape_function(decl_ref, d)
                    }
                    _ => (),
                }
            }
        }
    }

    /// The surviving binding for a declaration,
    ///   or [`None`] when the declaration was merged away or rejected.
    fn surviving(
        &self,
        name: SymbolId,
        decl_ref: DeclRef,
    ) -> Option<&Binding> {
        self.symtab.binding_for_decl(name, decl_ref)
    }

    fn shell_struct(
        &mut self,
        decl_ref: DeclRef,
        name: SymbolId,
        vis: Visibility,
    ) {
        let Some(binding) = self.surviving(name, decl_ref) else {
            return;
        };
        if binding.target != BindingTarget::Pending {
            return;
        }

        let shape = match &binding.shape {
            DeclShape::Struct(d) => layout_of(d.layout),
            _ => return,
        };

        trace!(name = %name, "shaping structure shell");

        let handle = self.module.add_type(TypeDef {
            name,
            access: access_of(vis),
            kind: TypeKind::Struct {
                layout: shape,
                fields: vec![],
            },
        });
        self.symtab.bind_decl(name, decl_ref, Target::Type(handle));
    }

    fn shell_enum(
        &mut self,
        decl_ref: DeclRef,
        d: &crate::asm::ast::EnumDecl,
    ) {
        let Some(binding) = self.surviving(d.name, decl_ref) else {
            return;
        };
        if binding.target != BindingTarget::Pending {
            return;
        }

        let members = d
            .members
            .iter()
            .map(|m| (m.name, m.value))
            .collect();

        let handle = self.module.add_type(TypeDef {
            name: d.name,
            access: access_of(d.vis),
            kind: TypeKind::Enum {
                base: d.base,
                members,
            },
        });
        self.symtab.bind_decl(d.name, decl_ref, Target::Type(handle));
    }

    fn fill_struct(
        &mut self,
        decl_ref: DeclRef,
        d: &crate::asm::ast::StructDecl,
    ) {
        let Some(binding) = self.surviving(d.name, decl_ref) else {
            return;
        };
        let BindingTarget::Bound(Target::Type(handle)) = binding.target
        else {
            return;
        };

        let explicit = d.layout == LayoutSpec::Explicit;
        let mut handles = Vec::with_capacity(d.fields.len());

        for field in &d.fields {
            if explicit && field.offset.is_none() {
                self.errors.push(CodegenError::MissingOffset {
                    ty: d.name,
                    field: field.name,
                });
                continue;
            }
            if !explicit && field.offset.is_some() {
                self.errors.push(CodegenError::StrayOffset {
                    ty: d.name,
                    field: field.name,
                });
                continue;
            }

            let Some(ty) = self.lower_ty(&field.ty, decl_ref.frag)
            else {
                continue;
            };

            handles.push(self.module.add_field(FieldDef {
                name: field.name,
                access: access_of(d.vis),
                owner: Some(handle),
                ty,
                offset: field.offset,
                constant: false,
            }));
        }

        if let TypeKind::Struct { fields, .. } =
            &mut self.module.type_mut(handle).kind
        {
            *fields = handles;
        }
    }

    fn shape_global(
        &mut self,
        decl_ref: DeclRef,
        d: &crate::asm::ast::GlobalDecl,
    ) {
        let Some(binding) = self.surviving(d.name, decl_ref) else {
            return;
        };
        if binding.target != BindingTarget::Pending {
            return;
        }

        let Some(ty) = self.lower_ty(&d.ty, decl_ref.frag) else {
            return;
        };

        let handle = self.module.add_field(FieldDef {
            name: d.name,
            access: access_of(d.vis),
            owner: None,
            ty,
            offset: None,
            constant: d.constant,
        });
        self.symtab
            .bind_decl(d.name, decl_ref, Target::Field(handle));
    }

    fn shape_function(
        &mut self,
        decl_ref: DeclRef,
        d: &crate::asm::ast::FunctionDecl,
    ) {
        let Some(binding) = self.surviving(d.name, decl_ref) else {
            return;
        };
        if binding.target != BindingTarget::Pending {
            return;
        }

        let Some(sig) = self.lower_sig(&d.sig, decl_ref.frag) else {
            return;
        };

        trace!(name = %d.name, "shaping method shell");

        let handle = self.module.add_method(MethodDef {
            name: d.name,
            access: access_of(d.vis),
            sig,
            locals: vec![],
            body: vec![],
        });
        self.symtab
            .bind_decl(d.name, decl_ref, Target::Method(handle));
    }

    /// Lower a signature into a deduplicated metadata signature.
    pub(super) fn lower_sig(
        &mut self,
        sig: &Signature,
        frag: FragmentId,
    ) -> Option<SigHandle> {
        let ret = self.lower_ty(&sig.ret, frag)?;

        let mut params = Vec::with_capacity(sig.params.len());
        for param in &sig.params {
            params.push(self.lower_ty(&param.ty, frag)?);
        }

        Some(self.module.add_sig(SigDef {
            ret,
            params,
            varargs: sig.varargs,
        }))
    }

    /// Lower a type expression into a metadata type reference.
    ///
    /// Failures are recorded and yield [`None`] so the caller can skip
    ///   the surrounding declaration and keep going.
    pub(super) fn lower_ty(
        &mut self,
        ty: &TypeExpression,
        frag: FragmentId,
    ) -> Option<crate::module::MTy> {
        use crate::module::MTy;

        match ty {
            TypeExpression::Prim(p) => Some(MTy::Prim(*p)),

            TypeExpression::Named(name) => {
                match self.resolve_type(*name, frag) {
                    Ok(handle) => Some(MTy::Type(handle)),
                    Err(e) => {
                        self.errors.push(e);
                        None
                    }
                }
            }

            TypeExpression::Pointer(inner) => Some(MTy::Pointer(
                Box::new(self.lower_ty(inner, frag)?),
            )),

            TypeExpression::Reference(inner) => Some(MTy::ByRef(
                Box::new(self.lower_ty(inner, frag)?),
            )),

            TypeExpression::Array(elem, len) => {
                let elem_mty = self.lower_ty(elem, frag)?;
                let len = match len {
                    ArrayLen::Fixed(n) => Some(*n),
                    ArrayLen::Flexible => None,
                };

                let name = ty.to_string().as_str().intern();
                Some(MTy::Type(self.value_array(name, elem_mty, len)))
            }

            TypeExpression::Signature(sig) => {
                Some(MTy::FnPtr(self.lower_sig(sig, frag)?))
            }
        }
    }

    /// Resolve a name that must denote a type.
    pub(super) fn resolve_type(
        &mut self,
        name: SymbolId,
        frag: FragmentId,
    ) -> Result<TypeHandle, CodegenError> {
        let binding = self.symtab.resolve(name, frag)?;

        match binding.target {
            BindingTarget::Bound(Target::Type(handle)) => Ok(handle),
            BindingTarget::Bound(_) | BindingTarget::Pending => {
                Err(CodegenError::WrongKind {
                    name,
                    expected: "type",
                    found: binding.shape.kind_name(),
                })
            }
            // Externals are absorbed and bound during the resolution
            //   fixed point; one still External here was never demanded,
            //   which means the demand scan missed it.
            BindingTarget::External => {
                Err(CodegenError::Unresolved(name))
            }
        }
    }

    /// Get or synthesize the value-array companion type for
    ///   (element, length).
    fn value_array(
        &mut self,
        name: SymbolId,
        elem: crate::module::MTy,
        len: Option<u32>,
    ) -> TypeHandle {
        use crate::module::MTy;

        if let Some(handle) = self.arrays.get(&(elem.clone(), len)) {
            return *handle;
        }

        let handle = self.module.add_type(TypeDef {
            name,
            access: Access::Internal,
            kind: TypeKind::ValueArray {
                elem: elem.clone(),
                len,
            },
        });
        self.arrays.insert((elem.clone(), len), handle);

        trace!(name = %name, "synthesized value-array type");

        let elem_prim = match &elem {
            MTy::Prim(p) => Some(*p),
            _ => None,
        };

        // Element size on the stack: a constant for sized primitives,
        //   a dynamic query otherwise.
        let push_size = |body: &mut Vec<Instr>| match elem_prim
            .and_then(Prim::byte_size)
        {
            Some(s) => body.push(Instr::LdcI4(s as i32)),
            None => body.push(Instr::SizeOf(elem.clone())),
        };

        let bounds_check = |body: &mut Vec<Instr>| {
            if let Some(n) = len {
                body.push(Instr::LdArg(1));
                body.push(Instr::LdcI4(n as i32));
                body.push(Instr::Clt);
                // Branch past the fault to the element address
                //   computation that follows.
                body.push(Instr::BrTrue(body.len() as u32 + 2));
                body.push(Instr::RangeFault);
            }
        };

        let arr_ptr = MTy::Pointer(Box::new(MTy::Type(handle)));

        // get(arr*, index) -> elem  for primitives,
        //   or -> elem&  for aggregate elements.
        let get_ret = match elem_prim {
            Some(p) => MTy::Prim(p),
            None => MTy::ByRef(Box::new(elem.clone())),
        };
        let get_sig = self.module.add_sig(SigDef {
            ret: get_ret,
            params: vec![arr_ptr.clone(), MTy::Prim(Prim::I32)],
            varargs: false,
        });

        let mut body = Vec::new();
        bounds_check(&mut body);
        body.push(Instr::LdArg(0));
        body.push(Instr::LdArg(1));
        push_size(&mut body);
        body.push(Instr::Mul);
        body.push(Instr::Add);
        if let Some(p) = elem_prim {
            body.push(Instr::LdInd(p));
        }
        body.push(Instr::Ret);

        let get_name =
            format!("{}$get", name).as_str().intern();
        self.module.add_method(MethodDef {
            name: get_name,
            access: Access::Internal,
            sig: get_sig,
            locals: vec![],
            body,
        });

        // set(arr*, index, elem) for primitive elements only;
        //   aggregates store through the address `get` returns.
        if let Some(p) = elem_prim {
            let set_sig = self.module.add_sig(SigDef {
                ret: MTy::Prim(Prim::Void),
                params: vec![
                    arr_ptr,
                    MTy::Prim(Prim::I32),
                    MTy::Prim(p),
                ],
                varargs: false,
            });

            let mut body = Vec::new();
            bounds_check(&mut body);
            body.push(Instr::LdArg(0));
            body.push(Instr::LdArg(1));
            push_size(&mut body);
            body.push(Instr::Mul);
            body.push(Instr::Add);
            body.push(Instr::LdArg(2));
            body.push(Instr::StInd(p));
            body.push(Instr::Ret);

            let set_name =
                format!("{}$set", name).as_str().intern();
            self.module.add_method(MethodDef {
                name: set_name,
                access: Access::Internal,
                sig: set_sig,
                locals: vec![],
                body,
            });
        }

        handle
    }
}
