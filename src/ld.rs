// Link driver
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

//! The linker.
//!
//! A link proceeds in phases:
//!
//!   1. [`load`]: read all named inputs,
//!        in parallel,
//!        deduplicating paths;
//!   2. declare: admit every declaration of every unit
//!        (and every export of every compiled module)
//!        into the [`symtab`],
//!        queueing each symbol the unit demands;
//!   3. resolve: drain the demand queue to a fixed point,
//!        pulling archive members lazily as demands require them and
//!        absorbing compiled modules whose exports are demanded;
//!   4. [`shape`] and [`body`]: generate metadata and method bodies;
//!   5. [`emit`]: serialize and write the output
//!        (or merge it into an injection target).
//!
//! Errors do not abort a phase;
//!   they accumulate so that one run reports everything it can,
//!   and emission happens only for an error-free link.

pub mod archive;
pub mod body;
pub mod emit;
pub mod fragment;
pub mod load;
pub mod shape;
pub mod symtab;

use archive::{ArchiveError, ArchiveFile};
use emit::EmitError;
use fragment::{DeclRef, Fragment, FragmentId, FragmentKind, FragmentSource};
use load::{load_inputs, LoadError, LoadedInput};

pub use load::InputRef;
use shape::{Codegen, CodegenError};
use symtab::{
    Binding, BindingTarget, DeclShape, ResolveError, SymbolTable,
    SymtabError, Target,
};

use crate::asm::ast::{BodyItem, Declaration, Op};
use crate::asm::parse::{parse_unit, SyntaxError};
use crate::asm::ty::{Signature, TypeExpression};
use crate::module::read::read_module;
use crate::module::{Instr, Module};
use crate::sym::{st, GlobalSymbolIntern, GlobalSymbolResolve, SymbolId};
use fxhash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::error::Error;
use std::fmt::{self, Display};
use std::fs;
use std::io::BufReader;
use std::path::PathBuf;
use tracing::{debug, info_span};

/// Everything a link needs to know,
///   straight from the command line.
#[derive(Debug, Default)]
pub struct LinkOptions {
    pub inputs: Vec<InputRef>,
    pub output: PathBuf,

    /// `-L` directories searched by `-l`.
    pub search_paths: Vec<PathBuf>,

    /// Merge the linked module into this existing module instead of
    ///   writing `output`.
    pub inject: Option<PathBuf>,

    pub dry_run: bool,

    /// Entry point name;
    ///   defaults to `main` when executable output is requested.
    pub entry: Option<String>,

    pub emit_exe: bool,

    /// Strip `nop`s and retarget branches.
    pub optimize: bool,
}

/// One failure of a link.
#[derive(Debug)]
pub enum LinkError {
    Load(LoadError),
    Syntax { path: PathBuf, err: SyntaxError },
    Symtab {
        source: FragmentSource,
        err: SymtabError,
    },
    Archive(ArchiveError),
    Codegen(CodegenError),

    /// Demanded but defined nowhere in the link,
    ///   reported once per symbol.
    Missing(SymbolId),

    MissingEntry(SymbolId),
    Emit(EmitError),
}

impl Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Load(e) => Display::fmt(e, f),
            Self::Syntax { path, err } => {
                write!(f, "{}: {}", path.display(), err)
            }
            Self::Symtab { source, err } => {
                write!(f, "{}: {}", source, err)
            }
            Self::Archive(e) => Display::fmt(e, f),
            Self::Codegen(e) => Display::fmt(e, f),
            Self::Missing(name) => {
                write!(f, "undefined symbol `{}`", name)
            }
            Self::MissingEntry(name) => write!(
                f,
                "entry point `{}` is not a public function of this link",
                name
            ),
            Self::Emit(e) => Display::fmt(e, f),
        }
    }
}

impl Error for LinkError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Load(e) => Some(e),
            Self::Syntax { err, .. } => Some(err),
            Self::Symtab { err, .. } => Some(err),
            Self::Archive(e) => Some(e),
            Self::Codegen(e) => Some(e),
            Self::Emit(e) => Some(e),
            Self::Missing(_) | Self::MissingEntry(_) => None,
        }
    }
}

/// An archive input together with the members already pulled from it.
struct ArchiveSlot {
    file: ArchiveFile,
    pulled: FxHashSet<usize>,
}

/// Run a complete link.
///
/// On failure every error the link could determine is returned;
///   nothing has been written in that case.
pub fn link(opts: &LinkOptions) -> Result<(), Vec<LinkError>> {
    let span = info_span!("link", output = %opts.output.display());
    let _enter = span.enter();

    let mut errors = Vec::new();

    // Phase 1: load.
    let (slots, load_errors) =
        load_inputs(&opts.inputs, &opts.search_paths);
    errors.extend(load_errors.into_iter().map(LinkError::Load));

    let mut fragments: Vec<Fragment> = Vec::new();
    let mut archives: Vec<ArchiveSlot> = Vec::new();
    let mut module_paths: FxHashMap<FragmentId, PathBuf> =
        FxHashMap::default();

    for slot in slots {
        match slot {
            LoadedInput::Unit { path, text } => {
                let (decls, syntax) = parse_unit(&text);
                errors.extend(syntax.into_iter().map(|err| {
                    LinkError::Syntax {
                        path: path.clone(),
                        err,
                    }
                }));

                let id = FragmentId(fragments.len() as u32);
                fragments.push(Fragment {
                    id,
                    source: FragmentSource::Object(path),
                    kind: FragmentKind::Unit(decls),
                });
            }

            LoadedInput::Archive(file) => archives.push(ArchiveSlot {
                file,
                pulled: FxHashSet::default(),
            }),

            LoadedInput::Module {
                path,
                name: _,
                exports,
            } => {
                let id = FragmentId(fragments.len() as u32);
                let exports = exports
                    .iter()
                    .map(|(name, kind)| (name.as_str().intern(), *kind))
                    .collect();

                module_paths.insert(id, path.clone());
                fragments.push(Fragment {
                    id,
                    source: FragmentSource::Module(path),
                    kind: FragmentKind::ModuleExports(exports),
                });
            }

            LoadedInput::Skipped => (),
        }
    }

    // Phase 2: declare.
    let mut symtab = SymbolTable::new();
    let mut pending: VecDeque<(SymbolId, FragmentId)> = VecDeque::new();

    for fragment in &fragments {
        declare_fragment(fragment, &mut symtab, &mut pending, &mut errors);
    }

    let mut module = Module::new(output_name(&opts.output));

    // Phase 3: drain demands to a fixed point.
    let mut missing: FxHashSet<SymbolId> = FxHashSet::default();
    let mut ambiguous: FxHashSet<SymbolId> = FxHashSet::default();
    let mut absorbed: FxHashSet<FragmentId> = FxHashSet::default();

    while let Some((name, frag)) = pending.pop_front() {
        match symtab.resolve(name, frag) {
            Ok(binding) => {
                if binding.target != BindingTarget::External {
                    continue;
                }

                let ext_frag = binding.frag;
                if absorbed.insert(ext_frag) {
                    absorb_module(
                        &module_paths[&ext_frag],
                        ext_frag,
                        &mut module,
                        &mut symtab,
                        &mut errors,
                    );
                }
            }

            Err(ResolveError::Ambiguous { name, count }) => {
                if ambiguous.insert(name) {
                    errors.push(LinkError::Codegen(
                        CodegenError::Ambiguous { name, count },
                    ));
                }
            }

            Err(ResolveError::NotFound(_)) => {
                if pull_from_archives(
                    name,
                    &mut archives,
                    &mut fragments,
                    &mut symtab,
                    &mut pending,
                    &mut errors,
                ) {
                    // Re-resolve once the pulled member's declarations
                    //   are in.
                    pending.push_back((name, frag));
                } else if missing.insert(name) {
                    errors.push(LinkError::Missing(name));
                }
            }
        }
    }

    // Phase 4: code generation.
    let mut cg = Codegen::new(&mut module, &mut symtab);
    cg.shape(&fragments);
    cg.bodies(&fragments);

    // A symbol missing everywhere was already reported once above;
    //   each instruction mentioning it would repeat the error here.
    let mut reported = missing;
    for e in cg.take_errors() {
        match &e {
            CodegenError::Unresolved(name) => {
                if reported.insert(*name) {
                    errors.push(LinkError::Codegen(e));
                }
            }
            CodegenError::Ambiguous { name, .. } => {
                if ambiguous.insert(*name) {
                    errors.push(LinkError::Codegen(e));
                }
            }
            _ => errors.push(LinkError::Codegen(e)),
        }
    }

    if opts.emit_exe || opts.entry.is_some() {
        set_entry(opts, &mut module, &symtab, &mut errors);
    }

    if opts.optimize {
        optimize(&mut module);
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    // Phase 5: emit.
    emit::emit(
        &module,
        &opts.output,
        opts.inject.as_deref(),
        opts.dry_run,
        opts.emit_exe,
    )
    .map_err(|e| vec![LinkError::Emit(e)])
}

fn output_name(output: &std::path::Path) -> SymbolId {
    match output.file_stem() {
        Some(stem) => stem.to_string_lossy().as_ref().intern(),
        None => "out".intern(),
    }
}

/// The symbol table binding a declaration gives rise to,
///   or [`None`] for anonymous declarations.
pub fn binding_of(
    decl: &Declaration,
    decl_ref: DeclRef,
) -> Option<Binding> {
    let (name, vis, shape) = match decl {
        Declaration::Struct(d) => {
            (d.name, d.vis, DeclShape::Struct(d.clone()))
        }
        Declaration::Enum(d) => {
            (d.name, d.vis, DeclShape::Enum(d.clone()))
        }
        Declaration::Global(d) => (
            d.name,
            d.vis,
            DeclShape::Global {
                ty: d.ty.clone(),
                constant: d.constant,
            },
        ),
        Declaration::Function(d) => {
            (d.name, d.vis, DeclShape::Function(d.sig.clone()))
        }
        Declaration::Init(_) => return None,
    };

    Some(Binding {
        name,
        vis,
        frag: decl_ref.frag,
        decl: Some(decl_ref),
        shape,
        target: BindingTarget::Pending,
    })
}

fn declare_fragment(
    fragment: &Fragment,
    symtab: &mut SymbolTable,
    pending: &mut VecDeque<(SymbolId, FragmentId)>,
    errors: &mut Vec<LinkError>,
) {
    match &fragment.kind {
        FragmentKind::Unit(decls) => {
            for (index, decl) in decls.iter().enumerate() {
                let decl_ref = DeclRef {
                    frag: fragment.id,
                    index,
                };

                if let Some(binding) = binding_of(decl, decl_ref) {
                    if let Err(err) = symtab.declare(binding) {
                        errors.push(LinkError::Symtab {
                            source: fragment.source.clone(),
                            err,
                        });
                    }
                }

                demands_of_decl(decl, fragment.id, pending);
            }
        }

        FragmentKind::ModuleExports(exports) => {
            for &(name, kind) in exports {
                if let Err(err) = symtab.declare(Binding {
                    name,
                    vis: crate::asm::Visibility::Public,
                    frag: fragment.id,
                    decl: None,
                    shape: DeclShape::Export(kind),
                    target: BindingTarget::External,
                }) {
                    errors.push(LinkError::Symtab {
                        source: fragment.source.clone(),
                        err,
                    });
                }
            }
        }
    }
}

/// Queue every symbol `decl` demands from the link.
fn demands_of_decl(
    decl: &Declaration,
    frag: FragmentId,
    pending: &mut VecDeque<(SymbolId, FragmentId)>,
) {
    match decl {
        Declaration::Struct(d) => {
            for field in &d.fields {
                named_types(&field.ty, frag, pending);
            }
        }

        Declaration::Enum(_) => (),

        Declaration::Global(d) => named_types(&d.ty, frag, pending),

        Declaration::Function(d) => {
            demand_sig(&d.sig, frag, pending);
            for local in &d.locals {
                named_types(&local.ty, frag, pending);
            }
            demand_body(&d.body, frag, pending);
        }

        Declaration::Init(d) => {
            for local in &d.locals {
                named_types(&local.ty, frag, pending);
            }
            demand_body(&d.body, frag, pending);
        }
    }
}

fn demand_body(
    body: &[BodyItem],
    frag: FragmentId,
    pending: &mut VecDeque<(SymbolId, FragmentId)>,
) {
    for item in body {
        let BodyItem::Instr(op) = item else { continue };

        if let Some(name) = op.demanded_symbol() {
            pending.push_back((name, frag));
        }

        match op {
            Op::Call { sig: Some(sig), .. }
            | Op::LdFtn { sig: Some(sig), .. }
            | Op::CallI { sig } => demand_sig(sig, frag, pending),

            Op::SizeOf(ty) | Op::VaArg(ty) => {
                named_types(ty, frag, pending)
            }

            _ => (),
        }
    }
}

fn demand_sig(
    sig: &Signature,
    frag: FragmentId,
    pending: &mut VecDeque<(SymbolId, FragmentId)>,
) {
    named_types(&sig.ret, frag, pending);
    for param in &sig.params {
        named_types(&param.ty, frag, pending);
    }
}

fn named_types(
    ty: &TypeExpression,
    frag: FragmentId,
    pending: &mut VecDeque<(SymbolId, FragmentId)>,
) {
    match ty {
        TypeExpression::Prim(_) => (),
        TypeExpression::Named(name) => pending.push_back((*name, frag)),
        TypeExpression::Pointer(inner)
        | TypeExpression::Reference(inner)
        | TypeExpression::Array(inner, _) => {
            named_types(inner, frag, pending)
        }
        TypeExpression::Signature(sig) => demand_sig(sig, frag, pending),
    }
}

/// Fully read a demanded compiled module and absorb its definitions.
///
/// Every export becomes bound,
///   so one absorption satisfies all further demands on the module.
fn absorb_module(
    path: &std::path::Path,
    frag: FragmentId,
    module: &mut Module,
    symtab: &mut SymbolTable,
    errors: &mut Vec<LinkError>,
) {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) => {
            errors.push(LinkError::Load(LoadError::Io {
                path: path.to_owned(),
                err,
            }));
            return;
        }
    };

    let ext = match read_module(BufReader::new(file)) {
        Ok(ext) => ext,
        Err(err) => {
            errors.push(LinkError::Load(LoadError::Module {
                path: path.to_owned(),
                err,
            }));
            return;
        }
    };

    debug!(path = %path.display(), "absorbing demanded module");

    let map = module.absorb(&ext);

    for (handle, def) in ext.types() {
        if def.access == crate::module::Access::Public {
            symtab.bind_external(
                def.name,
                frag,
                Target::Type(map.ty(handle)),
            );
        }
    }
    for (handle, def) in ext.fields() {
        if def.access == crate::module::Access::Public
            && def.owner.is_none()
        {
            symtab.bind_external(
                def.name,
                frag,
                Target::Field(map.field(handle)),
            );
        }
    }
    for (handle, def) in ext.methods() {
        if def.access == crate::module::Access::Public {
            symtab.bind_external(
                def.name,
                frag,
                Target::Method(map.method(handle)),
            );
        }
    }
}

/// Pull the first unpulled archive member defining `name`,
///   declaring its contents.
///
/// Returns whether anything new was pulled;
///   when nothing was,
///   the demand is genuinely unsatisfiable.
fn pull_from_archives(
    name: SymbolId,
    archives: &mut [ArchiveSlot],
    fragments: &mut Vec<Fragment>,
    symtab: &mut SymbolTable,
    pending: &mut VecDeque<(SymbolId, FragmentId)>,
    errors: &mut Vec<LinkError>,
) -> bool {
    let name_str = name.lookup_str();

    for ar in archives.iter_mut() {
        let Some(entry) = ar.file.member_defining(name_str) else {
            continue;
        };
        let member = entry.member;

        // A member that is already in and still did not satisfy the
        //   demand will not satisfy it on a second pull either.
        if !ar.pulled.insert(member) {
            continue;
        }

        let path = ar.file.path().to_owned();
        let member_name = ar
            .file
            .member_name(member)
            .unwrap_or_default()
            .to_owned();

        match ar.file.parse_member(member) {
            Ok((decls, syntax)) => {
                errors.extend(syntax.into_iter().map(|err| {
                    LinkError::Syntax {
                        path: path.clone(),
                        err,
                    }
                }));

                debug!(
                    symbol = %name,
                    archive = %path.display(),
                    member = %member_name,
                    "pulled archive member"
                );

                let id = FragmentId(fragments.len() as u32);
                let fragment = Fragment {
                    id,
                    source: FragmentSource::ArchiveMember {
                        archive: path,
                        member: member_name,
                    },
                    kind: FragmentKind::Unit(decls),
                };

                declare_fragment(&fragment, symtab, pending, errors);
                fragments.push(fragment);
                return true;
            }

            Err(err) => {
                errors.push(LinkError::Archive(err));
                return false;
            }
        }
    }

    false
}

fn set_entry(
    opts: &LinkOptions,
    module: &mut Module,
    symtab: &SymbolTable,
    errors: &mut Vec<LinkError>,
) {
    let name = match &opts.entry {
        Some(name) => name.as_str().intern(),
        None => st::L_MAIN,
    };

    // Resolved from no fragment in particular;
    //   only the public tier can satisfy an entry point.
    let resolved = symtab.resolve(name, FragmentId(u32::MAX));
    match resolved {
        Ok(binding)
            if binding.vis == crate::asm::Visibility::Public =>
        {
            if let BindingTarget::Bound(Target::Method(handle)) =
                binding.target
            {
                module.set_entry(handle);
                return;
            }
        }
        _ => (),
    }

    errors.push(LinkError::MissingEntry(name));
}

/// Strip `nop`s from every body,
///   retargeting branches across the removals.
fn optimize(module: &mut Module) {
    let handles: Vec<_> = module.methods().map(|(h, _)| h).collect();

    for handle in handles {
        strip_nops(&mut module.method_mut(handle).body);
    }
}

fn strip_nops(body: &mut Vec<Instr>) {
    // map[i] is the post-strip index of instruction i
    //   (or of its successor when i itself is stripped,
    //     which is exactly where a branch into a nop should land).
    let mut map = Vec::with_capacity(body.len());
    let mut kept = 0u32;
    for instr in body.iter() {
        map.push(kept);
        if !matches!(instr, Instr::Nop) {
            kept += 1;
        }
    }

    body.retain(|i| !matches!(i, Instr::Nop));

    for instr in body.iter_mut() {
        match instr {
            Instr::Br(t) | Instr::BrTrue(t) | Instr::BrFalse(t) => {
                *t = map[*t as usize];
            }
            _ => (),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn strip_nops_retargets_branches() {
        let mut body = vec![
            Instr::Nop,
            Instr::LdcI4(0),
            Instr::BrTrue(5),
            Instr::Nop,
            Instr::Nop,
            Instr::LdcI4(1),
            Instr::Br(0),
            Instr::Ret,
        ];

        strip_nops(&mut body);

        assert_eq!(
            vec![
                Instr::LdcI4(0),
                // Branch into the stripped nop run lands on the next
                //   surviving instruction.
                Instr::BrTrue(2),
                Instr::LdcI4(1),
                Instr::Br(0),
                Instr::Ret,
            ],
            body
        );
    }

    #[test]
    fn strip_nops_is_stable_without_nops() {
        let mut body = vec![Instr::LdcI4(1), Instr::Ret];
        let orig = body.clone();

        strip_nops(&mut body);
        assert_eq!(orig, body);
    }

    #[test]
    fn demands_cover_signature_and_body() {
        use crate::asm::parse::parse_unit;

        let (decls, errors) = parse_unit(
            ".struct internal Node { Node* next }\n\
             internal Pair(int32) mk {\n\
               .local Buf buf\n\
               sizeof Elem\n\
               call helper\n\
               ret\n\
             }",
        );
        assert!(errors.is_empty(), "{:?}", errors);

        let mut pending = VecDeque::new();
        for decl in &decls {
            demands_of_decl(decl, FragmentId(0), &mut pending);
        }

        let demanded: Vec<_> =
            pending.iter().map(|(name, _)| *name).collect();
        for name in ["Node", "Pair", "Buf", "Elem", "helper"] {
            assert!(
                demanded.contains(&name.intern()),
                "missing demand for {}",
                name
            );
        }
    }
}
