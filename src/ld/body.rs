// Body generation phase
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

//! Body generation:
//!   lower symbolic instruction operands into resolved metadata operands.
//!
//! This phase runs after shaping,
//!   so every name an instruction can mention already has a bound
//!   metadata handle
//!     (or is genuinely unresolved,
//!       which is an error here).
//! Labels are link-local to their block and are patched into absolute
//!   instruction indices after a single forward pass;
//!     this is what permits forward branches without a separate scan.
//!
//! Initializer blocks are not functions of their own:
//!   every `.init` across the link concatenates,
//!     in fragment order,
//!     into one synthesized module initializer named `.init`,
//!   with each block's locals appended to a shared frame and each
//!   block's labels scoped to itself.

use super::fragment::{DeclRef, Fragment, FragmentId};
use super::shape::{Codegen, CodegenError};
use super::symtab::{BindingTarget, Target};
use crate::asm::ast::{
    ArgRef, BodyItem, Declaration, FunctionDecl, LocalDecl, Op,
};
use crate::asm::ty::{Prim, Signature, TypeExpression};
use crate::module::{
    Access, FieldHandle, Instr, MTy, MethodDef, MethodHandle, SigDef,
    TypeKind,
};
use crate::sym::{st, SymbolId};
use fxhash::FxHashMap;
use tracing::trace;

/// Accumulates the locals frame and instruction stream of one method,
///   possibly across several source blocks.
#[derive(Debug, Default)]
struct BodyBuilder {
    locals: Vec<MTy>,
    out: Vec<Instr>,
}

/// Name scope of one block being generated.
struct BlockCtx<'s> {
    /// Method name for diagnostics.
    func: SymbolId,
    frag: FragmentId,
    sig: &'s Signature,
    locals: FxHashMap<SymbolId, u16>,
    labels: FxHashMap<SymbolId, u32>,

    /// Branch instructions awaiting their label's index.
    patches: Vec<(usize, SymbolId)>,
}

/// Whether `site` is an acceptable call-site signature for `callee`,
///   at the metadata level.
///
/// Equality for a non-variadic callee;
///   prefix compatibility with any number of appended arguments for a
///   variadic one.
fn site_matches(site: &SigDef, callee: &SigDef) -> bool {
    if !callee.varargs {
        return site == callee;
    }

    site.ret == callee.ret
        && site.params.len() >= callee.params.len()
        && site
            .params
            .iter()
            .zip(callee.params.iter())
            .all(|(a, b)| a == b)
}

impl Codegen<'_> {
    /// Generate every method body.
    ///
    /// Fragments must be positioned at their id's index,
    ///   which is how the link driver builds the fragment list.
    pub fn bodies(&mut self, fragments: &[Fragment]) {
        for fragment in fragments {
            for (index, decl) in fragment.decls().iter().enumerate() {
                let Declaration::Function(d) = decl else {
                    continue;
                };

                let decl_ref = DeclRef {
                    frag: fragment.id,
                    index,
                };
                let Some(binding) =
                    self.symtab.binding_for_decl(d.name, decl_ref)
                else {
                    continue;
                };
                let BindingTarget::Bound(Target::Method(handle)) =
                    binding.target
                else {
                    continue;
                };

                self.gen_function(fragment.id, d, handle, fragments);
            }
        }

        self.gen_init(fragments);
    }

    fn gen_function(
        &mut self,
        frag: FragmentId,
        d: &FunctionDecl,
        handle: MethodHandle,
        fragments: &[Fragment],
    ) {
        trace!(name = %d.name, "generating body");

        let mut builder = BodyBuilder::default();
        self.gen_block(
            &mut builder,
            frag,
            d.name,
            &d.sig,
            &d.locals,
            &d.body,
            fragments,
        );

        let method = self.module.method_mut(handle);
        method.locals = builder.locals;
        method.body = builder.out;
    }

    /// Concatenate every `.init` block into the module initializer.
    ///
    /// No method is synthesized when the link contains no initializer
    ///   blocks.
    fn gen_init(&mut self, fragments: &[Fragment]) {
        let sig = Signature {
            ret: TypeExpression::Prim(Prim::Void),
            params: vec![],
            varargs: false,
        };

        let mut builder = BodyBuilder::default();
        let mut any = false;

        for fragment in fragments {
            for decl in fragment.decls() {
                let Declaration::Init(init) = decl else {
                    continue;
                };
                any = true;

                self.gen_block(
                    &mut builder,
                    fragment.id,
                    st::L_MODULE_INIT,
                    &sig,
                    &init.locals,
                    &init.body,
                    fragments,
                );
            }
        }

        if !any {
            return;
        }

        builder.out.push(Instr::Ret);

        let sig = self.module.add_sig(SigDef {
            ret: MTy::Prim(Prim::Void),
            params: vec![],
            varargs: false,
        });
        self.module.add_method(MethodDef {
            name: st::L_MODULE_INIT,
            access: Access::Private,
            sig,
            locals: builder.locals,
            body: builder.out,
        });
    }

    /// Generate one block into `builder`.
    ///
    /// Locals append to the builder's frame;
    ///   labels and patches are scoped to this call.
    #[allow(clippy::too_many_arguments)]
    fn gen_block(
        &mut self,
        builder: &mut BodyBuilder,
        frag: FragmentId,
        func: SymbolId,
        sig: &Signature,
        locals: &[LocalDecl],
        body: &[BodyItem],
        fragments: &[Fragment],
    ) {
        let mut ctx = BlockCtx {
            func,
            frag,
            sig,
            locals: FxHashMap::default(),
            labels: FxHashMap::default(),
            patches: Vec::new(),
        };

        for local in locals {
            let Some(ty) = self.lower_ty(&local.ty, frag) else {
                continue;
            };

            let slot = builder.locals.len() as u16;
            builder.locals.push(ty);

            if ctx.locals.insert(local.name, slot).is_some() {
                self.errors.push(CodegenError::DuplicateLocalName {
                    func,
                    name: local.name,
                });
            }
        }

        for item in body {
            match item {
                BodyItem::Label(label) => {
                    let at = builder.out.len() as u32;
                    if ctx.labels.insert(*label, at).is_some() {
                        self.errors.push(CodegenError::DuplicateLabel {
                            func,
                            label: *label,
                        });
                    }
                }

                // Branches emit a placeholder and are patched below,
                //   once every label of the block is known.
                BodyItem::Instr(Op::Br(label)) => {
                    ctx.patches.push((builder.out.len(), *label));
                    builder.out.push(Instr::Br(0));
                }
                BodyItem::Instr(Op::BrTrue(label)) => {
                    ctx.patches.push((builder.out.len(), *label));
                    builder.out.push(Instr::BrTrue(0));
                }
                BodyItem::Instr(Op::BrFalse(label)) => {
                    ctx.patches.push((builder.out.len(), *label));
                    builder.out.push(Instr::BrFalse(0));
                }

                BodyItem::Instr(op) => {
                    if let Some(instr) = self.gen_op(&ctx, op, fragments)
                    {
                        builder.out.push(instr);
                    }
                }
            }
        }

        for (at, label) in ctx.patches {
            match ctx.labels.get(&label) {
                Some(&target) => match &mut builder.out[at] {
                    Instr::Br(t)
                    | Instr::BrTrue(t)
                    | Instr::BrFalse(t) => *t = target,
                    _ => (),
                },
                None => self.errors.push(CodegenError::UnresolvedLabel {
                    func,
                    label,
                }),
            }
        }
    }

    /// Lower one non-branch instruction.
    ///
    /// Operand failures record an error and yield [`None`];
    ///   generation continues so that every problem in a body surfaces
    ///   in a single run.
    fn gen_op(
        &mut self,
        ctx: &BlockCtx,
        op: &Op,
        fragments: &[Fragment],
    ) -> Option<Instr> {
        let instr = match op {
            Op::Nop => Instr::Nop,
            Op::Dup => Instr::Dup,
            Op::Pop => Instr::Pop,
            Op::Ret => Instr::Ret,

            Op::LdNull => Instr::LdNull,
            Op::LdcI4(n) => Instr::LdcI4(*n),
            Op::LdcI8(n) => Instr::LdcI8(*n),
            Op::LdcR8(n) => Instr::LdcR8(*n),
            Op::LdStr(s) => Instr::LdStr(*s),

            Op::LdLoc(name) => Instr::LdLoc(self.local(ctx, *name)?),
            Op::StLoc(name) => Instr::StLoc(self.local(ctx, *name)?),
            Op::LdLocA(name) => Instr::LdLocA(self.local(ctx, *name)?),

            Op::LdArg(arg) => Instr::LdArg(self.arg(ctx, *arg)?),
            Op::StArg(arg) => Instr::StArg(self.arg(ctx, *arg)?),

            Op::LdsFld(name) => {
                Instr::LdsFld(self.global(ctx, *name)?)
            }
            Op::StsFld(name) => {
                let handle = self.global(ctx, *name)?;
                if self.module.field(handle).constant {
                    self.errors
                        .push(CodegenError::StoreToConstant(*name));
                    return None;
                }
                Instr::StsFld(handle)
            }
            Op::LdsFldA(name) => {
                Instr::LdsFldA(self.global(ctx, *name)?)
            }

            Op::LdFld(ty, fld) => {
                Instr::LdFld(self.struct_field(ctx, *ty, *fld)?)
            }
            Op::StFld(ty, fld) => {
                Instr::StFld(self.struct_field(ctx, *ty, *fld)?)
            }
            Op::LdFldA(ty, fld) => {
                Instr::LdFldA(self.struct_field(ctx, *ty, *fld)?)
            }

            Op::Call { sig, name } => self.call(ctx, sig, *name)?,

            Op::CallI { sig } => {
                Instr::CallI(self.lower_sig(sig, ctx.frag)?)
            }

            Op::LdFtn { sig, name } => {
                self.ldftn(ctx, sig, *name, fragments)?
            }

            // Branches are handled by the block loop.
            Op::Br(_) | Op::BrTrue(_) | Op::BrFalse(_) => return None,

            Op::Add => Instr::Add,
            Op::Sub => Instr::Sub,
            Op::Mul => Instr::Mul,
            Op::Div => Instr::Div,
            Op::Rem => Instr::Rem,
            Op::Neg => Instr::Neg,
            Op::And => Instr::And,
            Op::Or => Instr::Or,
            Op::Xor => Instr::Xor,
            Op::Shl => Instr::Shl,
            Op::Shr => Instr::Shr,
            Op::Not => Instr::Not,

            Op::Ceq => Instr::Ceq,
            Op::Clt => Instr::Clt,
            Op::Cgt => Instr::Cgt,

            Op::Conv(p) => Instr::Conv(*p),

            Op::SizeOf(ty) => self.size_of(ctx, ty)?,

            Op::LdInd(p) => Instr::LdInd(*p),
            Op::StInd(p) => Instr::StInd(*p),

            Op::VaStart => self.va_instr(ctx, Instr::VaStart)?,
            Op::VaArg(ty) => {
                let mty = self.lower_ty(ty, ctx.frag)?;
                self.va_instr(ctx, Instr::VaArg(mty))?
            }
            Op::VaEnd => self.va_instr(ctx, Instr::VaEnd)?,
        };

        Some(instr)
    }

    fn local(&mut self, ctx: &BlockCtx, name: SymbolId) -> Option<u16> {
        match ctx.locals.get(&name) {
            Some(&slot) => Some(slot),
            None => {
                self.errors.push(CodegenError::UnknownLocal {
                    func: ctx.func,
                    name,
                });
                None
            }
        }
    }

    fn arg(&mut self, ctx: &BlockCtx, arg: ArgRef) -> Option<u16> {
        match arg {
            ArgRef::Name(name) => {
                match ctx
                    .sig
                    .params
                    .iter()
                    .position(|p| p.name == Some(name))
                {
                    Some(i) => Some(i as u16),
                    None => {
                        self.errors.push(CodegenError::UnknownArg {
                            func: ctx.func,
                            name,
                        });
                        None
                    }
                }
            }

            ArgRef::Index(i) => {
                if (i as usize) < ctx.sig.params.len() {
                    Some(i)
                } else {
                    self.errors.push(CodegenError::ArgIndexOutOfRange {
                        func: ctx.func,
                        index: i,
                    });
                    None
                }
            }
        }
    }

    /// Resolve a name that must denote a module-level field.
    fn global(
        &mut self,
        ctx: &BlockCtx,
        name: SymbolId,
    ) -> Option<FieldHandle> {
        let resolved = match self.symtab.resolve(name, ctx.frag) {
            Ok(binding) => match binding.target {
                BindingTarget::Bound(Target::Field(handle)) => {
                    Ok(handle)
                }
                BindingTarget::Bound(_) => {
                    Err(CodegenError::WrongKind {
                        name,
                        expected: "global",
                        found: binding.shape.kind_name(),
                    })
                }
                _ => Err(CodegenError::Unresolved(name)),
            },
            Err(e) => Err(e.into()),
        };

        self.record(resolved)
    }

    /// Resolve a name that must denote a function,
    ///   yielding its handle together with the declaration it came from
    ///   (absent for members absorbed from compiled modules).
    fn method(
        &mut self,
        ctx: &BlockCtx,
        name: SymbolId,
    ) -> Option<(MethodHandle, Option<DeclRef>)> {
        let resolved = match self.symtab.resolve(name, ctx.frag) {
            Ok(binding) => match binding.target {
                BindingTarget::Bound(Target::Method(handle)) => {
                    Ok((handle, binding.decl))
                }
                BindingTarget::Bound(_) => {
                    Err(CodegenError::WrongKind {
                        name,
                        expected: "function",
                        found: binding.shape.kind_name(),
                    })
                }
                _ => Err(CodegenError::Unresolved(name)),
            },
            Err(e) => Err(e.into()),
        };

        self.record(resolved)
    }

    fn struct_field(
        &mut self,
        ctx: &BlockCtx,
        ty: SymbolId,
        fld: SymbolId,
    ) -> Option<FieldHandle> {
        let handle = match self.resolve_type(ty, ctx.frag) {
            Ok(handle) => handle,
            Err(e) => {
                self.errors.push(e);
                return None;
            }
        };

        let resolved = match &self.module.ty(handle).kind {
            TypeKind::Struct { fields, .. } => fields
                .iter()
                .copied()
                .find(|&fh| self.module.field(fh).name == fld)
                .ok_or(CodegenError::UnknownField { ty, field: fld }),

            TypeKind::Enum { .. } => Err(CodegenError::WrongKind {
                name: ty,
                expected: "structure",
                found: "enumeration",
            }),
            TypeKind::ValueArray { .. } => {
                Err(CodegenError::WrongKind {
                    name: ty,
                    expected: "structure",
                    found: "value array",
                })
            }
        };

        self.record(resolved)
    }

    fn call(
        &mut self,
        ctx: &BlockCtx,
        site: &Option<Signature>,
        name: SymbolId,
    ) -> Option<Instr> {
        let (handle, _) = self.method(ctx, name)?;
        let callee = self
            .module
            .sig(self.module.method(handle).sig)
            .clone();

        if callee.varargs {
            let Some(site) = site else {
                self.errors.push(
                    CodegenError::SiteSignatureRequired { callee: name },
                );
                return None;
            };

            let sh = self.lower_sig(site, ctx.frag)?;
            if !site_matches(self.module.sig(sh), &callee) {
                self.errors.push(CodegenError::SignatureMismatch {
                    callee: name,
                });
                return None;
            }

            return Some(Instr::Call(handle, Some(sh)));
        }

        // A site signature on a non-variadic call is assertion only.
        // The comparison is structural,
        //   not by handle,
        //   so equal signatures agree regardless of which table entry
        //   each lowered through.
        if let Some(site) = site {
            let sh = self.lower_sig(site, ctx.frag)?;
            if *self.module.sig(sh) != callee {
                self.errors.push(CodegenError::SignatureMismatch {
                    callee: name,
                });
                return None;
            }
        }

        Some(Instr::Call(handle, None))
    }

    fn ldftn(
        &mut self,
        ctx: &BlockCtx,
        site: &Option<Signature>,
        name: SymbolId,
        fragments: &[Fragment],
    ) -> Option<Instr> {
        let (handle, decl) = self.method(ctx, name)?;
        let callee_sig = self.module.method(handle).sig;

        if let Some(site) = site {
            let sh = self.lower_sig(site, ctx.frag)?;
            if self.module.sig(sh) != self.module.sig(callee_sig) {
                self.errors.push(CodegenError::SignatureMismatch {
                    callee: name,
                });
                return None;
            }
        }

        // The address of a variadic function is only meaningful when
        //   the function actually sets up its vararg frame.
        if self.module.sig(callee_sig).varargs
            && !has_vararg_prologue(self.module, handle, decl, fragments)
        {
            self.errors.push(CodegenError::VarargPrologueMissing {
                callee: name,
            });
            return None;
        }

        Some(Instr::LdFtn(handle))
    }

    fn size_of(
        &mut self,
        ctx: &BlockCtx,
        ty: &TypeExpression,
    ) -> Option<Instr> {
        let mty = self.lower_ty(ty, ctx.frag)?;

        // Constant-fold what the link can size itself.
        match &mty {
            MTy::Prim(p) => {
                if let Some(s) = p.byte_size() {
                    return Some(Instr::LdcI4(s as i32));
                }
            }
            MTy::Type(handle) => {
                if let TypeKind::ValueArray {
                    elem: MTy::Prim(p),
                    len: Some(n),
                } = &self.module.ty(*handle).kind
                {
                    if let Some(s) = p.byte_size() {
                        return Some(Instr::LdcI4((n * s) as i32));
                    }
                }
            }
            _ => (),
        }

        Some(Instr::SizeOf(mty))
    }

    fn va_instr(
        &mut self,
        ctx: &BlockCtx,
        instr: Instr,
    ) -> Option<Instr> {
        if !ctx.sig.varargs {
            self.errors.push(CodegenError::VaOutsideVarargs {
                func: ctx.func,
            });
            return None;
        }

        Some(instr)
    }

    fn record<T>(
        &mut self,
        result: Result<T, CodegenError>,
    ) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                self.errors.push(e);
                None
            }
        }
    }
}

/// Whether the method body executes `va.start`.
///
/// Declared functions are checked at the source level
///   (their bodies may not be generated yet);
/// absorbed module members are checked in metadata.
fn has_vararg_prologue(
    module: &crate::module::Module,
    handle: MethodHandle,
    decl: Option<DeclRef>,
    fragments: &[Fragment],
) -> bool {
    match decl {
        Some(decl_ref) => {
            match fragments[decl_ref.frag.index()]
                .decls()
                .get(decl_ref.index)
            {
                Some(Declaration::Function(d)) => d.body.iter().any(
                    |item| {
                        matches!(item, BodyItem::Instr(Op::VaStart))
                    },
                ),
                _ => false,
            }
        }
        None => module
            .method(handle)
            .body
            .iter()
            .any(|i| matches!(i, Instr::VaStart)),
    }
}

#[cfg(test)]
mod test {
    use super::super::shape::test::declared_fragments;
    use super::super::symtab::SymbolTable;
    use super::*;
    use crate::module::Module;
    use crate::sym::GlobalSymbolIntern;

    fn link_units(
        units: &[&str],
    ) -> (Module, Vec<CodegenError>) {
        let mut symtab = SymbolTable::new();
        let fragments = declared_fragments(units, &mut symtab);

        let mut module = Module::new("out".intern());
        let mut cg = Codegen::new(&mut module, &mut symtab);
        cg.shape(&fragments);
        cg.bodies(&fragments);
        let errors = cg.take_errors();

        (module, errors)
    }

    fn method_body(module: &Module, name: &str) -> Vec<Instr> {
        module
            .methods()
            .find(|(_, m)| m.name == name.intern())
            .map(|(_, m)| m.body.clone())
            .expect("missing method")
    }

    #[test]
    fn forward_branch_patches_to_absolute_index() {
        let (module, errors) = link_units(&[
            "internal int32(int32) f {\n\
               ldarg 0\n\
               brtrue yes\n\
               ldc.i4 0\n\
               ret\n\
             yes:\n\
               ldc.i4 1\n\
               ret\n\
             }",
        ]);

        assert!(errors.is_empty(), "{:?}", errors);
        assert_eq!(
            vec![
                Instr::LdArg(0),
                Instr::BrTrue(4),
                Instr::LdcI4(0),
                Instr::Ret,
                Instr::LdcI4(1),
                Instr::Ret,
            ],
            method_body(&module, "f")
        );
    }

    #[test]
    fn branch_to_missing_label_is_an_error() {
        let (_, errors) = link_units(&[
            "internal void() f { br nowhere; ret }",
        ]);

        assert_eq!(
            vec![CodegenError::UnresolvedLabel {
                func: "f".intern(),
                label: "nowhere".intern(),
            }],
            errors
        );
    }

    #[test]
    fn locals_resolve_to_slots_in_declaration_order() {
        let (module, errors) = link_units(&[
            "internal void() f {\n\
               .local int32 a\n\
               .local int64 b\n\
               ldc.i8 7; stloc b\n\
               ldc.i4 1; stloc a\n\
               ret\n\
             }",
        ]);

        assert!(errors.is_empty(), "{:?}", errors);
        assert_eq!(
            vec![
                Instr::LdcI8(7),
                Instr::StLoc(1),
                Instr::LdcI4(1),
                Instr::StLoc(0),
                Instr::Ret,
            ],
            method_body(&module, "f")
        );
    }

    #[test]
    fn named_args_resolve_by_signature_position() {
        let (module, errors) = link_units(&[
            "internal int32(int32:a,int32:b) sub2 {\n\
               ldarg b; ldarg a; sub; ret\n\
             }",
        ]);

        assert!(errors.is_empty(), "{:?}", errors);
        assert_eq!(
            vec![
                Instr::LdArg(1),
                Instr::LdArg(0),
                Instr::Sub,
                Instr::Ret,
            ],
            method_body(&module, "sub2")
        );
    }

    #[test]
    fn store_to_constant_is_rejected() {
        let (_, errors) = link_units(&[
            ".const internal int32 LIMIT\n\
             internal void() f { ldc.i4 9; stsfld LIMIT; ret }",
        ]);

        assert_eq!(
            vec![CodegenError::StoreToConstant("LIMIT".intern())],
            errors
        );
    }

    #[test]
    fn cross_unit_call_resolves() {
        let (module, errors) = link_units(&[
            "internal int32() one { ldc.i4 1; ret }",
            "public int32() main { call one; ret }",
        ]);

        assert!(errors.is_empty(), "{:?}", errors);

        let body = method_body(&module, "main");
        assert!(matches!(body[0], Instr::Call(_, None)));
    }

    #[test]
    fn variadic_call_requires_site_signature() {
        let units = &[
            "internal int32(int8*,...) fmt { va.start; va.end; \
               ldc.i4 0; ret }\n\
             internal void() f {\n\
               ldnull\n\
               ldc.i4 2\n\
               call int32(int8*,int32) fmt\n\
               pop; ret\n\
             }\n\
             internal void() g { ldnull; call fmt; pop; ret }",
        ];
        let (module, errors) = link_units(units);

        // f's call carries its site signature; g's is missing one.
        assert_eq!(
            vec![CodegenError::SiteSignatureRequired {
                callee: "fmt".intern()
            }],
            errors
        );

        let body = method_body(&module, "f");
        assert!(matches!(body[2], Instr::Call(_, Some(_))));
    }

    #[test]
    fn variadic_site_signature_must_prefix_match() {
        let (_, errors) = link_units(&[
            "internal int32(int8*,...) fmt { va.start; va.end; \
               ldc.i4 0; ret }\n\
             internal void() f {\n\
               ldc.i4 2\n\
               call int32(int64) fmt\n\
               pop; ret\n\
             }",
        ]);

        assert_eq!(
            vec![CodegenError::SignatureMismatch {
                callee: "fmt".intern()
            }],
            errors
        );
    }

    #[test]
    fn ldftn_of_variadic_without_prologue_is_rejected() {
        let (_, errors) = link_units(&[
            "internal int32(int8*,...) bad { ldc.i4 0; ret }\n\
             internal void() f { ldftn bad; pop; ret }",
        ]);

        assert_eq!(
            vec![CodegenError::VarargPrologueMissing {
                callee: "bad".intern()
            }],
            errors
        );
    }

    #[test]
    fn va_instructions_outside_varargs_are_rejected() {
        let (_, errors) = link_units(&[
            "internal void() f { va.start; ret }",
        ]);

        assert_eq!(
            vec![CodegenError::VaOutsideVarargs {
                func: "f".intern()
            }],
            errors
        );
    }

    #[test]
    fn sizeof_prim_folds_to_constant() {
        let (module, errors) = link_units(&[
            "internal int32() f { sizeof int64; conv int32; ret }",
        ]);

        assert!(errors.is_empty(), "{:?}", errors);
        assert_eq!(
            Instr::LdcI4(8),
            method_body(&module, "f")[0]
        );
    }

    #[test]
    fn sizeof_struct_stays_a_runtime_query() {
        let (module, errors) = link_units(&[
            ".struct internal S { int32 x }\n\
             internal int32() f { sizeof S; conv int32; ret }",
        ]);

        assert!(errors.is_empty(), "{:?}", errors);
        assert!(matches!(
            method_body(&module, "f")[0],
            Instr::SizeOf(MTy::Type(_))
        ));
    }

    #[test]
    fn init_blocks_concatenate_in_fragment_order() {
        let (module, errors) = link_units(&[
            ".global internal int32 a\n\
             .init { ldc.i4 1; stsfld a }",
            ".global internal int32 b\n\
             .init { ldc.i4 2; stsfld b }",
        ]);

        assert!(errors.is_empty(), "{:?}", errors);

        let body = method_body(&module, ".init");
        assert_eq!(5, body.len());
        assert_eq!(Instr::LdcI4(1), body[0]);
        assert_eq!(Instr::LdcI4(2), body[2]);
        assert_eq!(Instr::Ret, body[4]);
    }

    #[test]
    fn init_labels_are_block_scoped() {
        // Identical label names in two blocks must not collide.
        let (module, errors) = link_units(&[
            ".init { br done; done: nop }",
            ".init { br done; done: nop }",
        ]);

        assert!(errors.is_empty(), "{:?}", errors);

        let body = method_body(&module, ".init");
        assert_eq!(
            vec![
                Instr::Br(1),
                Instr::Nop,
                Instr::Br(3),
                Instr::Nop,
                Instr::Ret,
            ],
            body
        );
    }

    #[test]
    fn init_locals_share_one_frame() {
        let (module, errors) = link_units(&[
            ".init { .local int32 t; ldc.i4 1; stloc t }",
            ".init { .local int32 t; ldc.i4 2; stloc t }",
        ]);

        assert!(errors.is_empty(), "{:?}", errors);

        let init = module
            .methods()
            .find(|(_, m)| m.name == ".init".intern())
            .map(|(_, m)| m)
            .unwrap();

        assert_eq!(2, init.locals.len());
        assert_eq!(Instr::StLoc(0), init.body[1]);
        assert_eq!(Instr::StLoc(1), init.body[3]);
    }

    #[test]
    fn no_init_method_without_init_blocks() {
        let (module, errors) =
            link_units(&["internal void() f { ret }"]);

        assert!(errors.is_empty(), "{:?}", errors);
        assert!(!module
            .methods()
            .any(|(_, m)| m.name == ".init".intern()));
    }

    #[test]
    fn struct_field_access_resolves_handle() {
        let (module, errors) = link_units(&[
            ".struct internal Point { int32 x; int32 y }\n\
             internal int32(Point*) getx {\n\
               ldarg 0; ldfld Point x; ret\n\
             }",
        ]);

        assert!(errors.is_empty(), "{:?}", errors);

        let body = method_body(&module, "getx");
        let Instr::LdFld(handle) = body[1] else {
            panic!("expected ldfld");
        };
        assert_eq!("x".intern(), module.field(handle).name);
    }

    #[test]
    fn unknown_struct_field_is_an_error() {
        let (_, errors) = link_units(&[
            ".struct internal Point { int32 x }\n\
             internal int32(Point*) f { ldarg 0; ldfld Point z; ret }",
        ]);

        assert_eq!(
            vec![CodegenError::UnknownField {
                ty: "Point".intern(),
                field: "z".intern(),
            }],
            errors
        );
    }

    #[test]
    fn calling_a_global_is_a_kind_error() {
        let (_, errors) = link_units(&[
            ".global internal int32 g\n\
             internal void() f { call g; ret }",
        ]);

        assert_eq!(
            vec![CodegenError::WrongKind {
                name: "g".intern(),
                expected: "function",
                found: "global",
            }],
            errors
        );
    }
}
