// Link symbol table
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

//! Link-wide symbol table and visibility resolver.
//!
//! Names are bucketed into three tiers:
//!   per-fragment `file` bindings,
//!   `internal` bindings,
//!   and `public` bindings.
//! Resolution precedence for a requesting fragment is
//!   own-fragment `file`,
//!   then `internal`,
//!   then `public`;
//!     a `file` binding is never visible outside its fragment.
//! A tier holding more than one candidate at resolution time
//!   (possible when compiled modules export a name an object also
//!     declares)
//!   is ambiguous.
//!
//! Redeclaration within a tier is driven by [`Binding::redeclare`],
//!   which either merges
//!     (structures and enumerations with identical layout collapse into
//!       one binding)
//!   or rejects,
//!     returning the surviving binding together with the error so the
//!     table is never left without a binding mid-transition.
//!
//! A binding's [`BindingTarget`] is an explicit state:
//!   [`Pending`](BindingTarget::Pending) until the shape phase
//!   materializes metadata,
//!   then [`Bound`](BindingTarget::Bound);
//!   module exports start [`External`](BindingTarget::External) and
//!   become bound only if demanded.

use crate::asm::ast::{EnumDecl, StructDecl, Visibility};
use crate::asm::ty::{Signature, TypeExpression};
use crate::ld::fragment::{DeclRef, FragmentId};
use crate::module::{ExportKind, FieldHandle, MethodHandle, TypeHandle};
use crate::sym::SymbolId;
use fxhash::FxHashMap;
use std::error::Error;
use std::fmt::{self, Display};

/// Outcome of an attempted state transition.
///
/// On failure the untransitioned value is returned alongside the error
///   so the caller can put it back.
pub type TransitionResult<T> = Result<T, (T, SymtabError)>;

/// Shape information retained for duplicate detection and operand
///   resolution.
#[derive(Debug, PartialEq, Clone)]
pub enum DeclShape {
    Struct(StructDecl),
    Enum(EnumDecl),
    Global {
        ty: TypeExpression,
        constant: bool,
    },
    Function(Signature),

    /// Export of a compiled module;
    ///   no declaration body exists in this link.
    Export(ExportKind),
}

impl DeclShape {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Struct(_) => "structure",
            Self::Enum(_) => "enumeration",
            Self::Global { constant: true, .. } => "constant",
            Self::Global { .. } => "global",
            Self::Function(_) => "function",
            Self::Export(_) => "module export",
        }
    }
}

/// Resolved metadata handle.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum Target {
    Type(TypeHandle),
    Field(FieldHandle),
    Method(MethodHandle),
}

/// Materialization state of a binding.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum BindingTarget {
    /// Declared but not yet given metadata.
    Pending,

    /// Metadata handle in the output module.
    Bound(Target),

    /// Defined by a compiled module that has not been demanded yet.
    External,
}

/// A name bound in some tier.
#[derive(Debug, PartialEq, Clone)]
pub struct Binding {
    pub name: SymbolId,
    pub vis: Visibility,
    pub frag: FragmentId,

    /// The declaration this binding came from;
    ///   [`None`] for module exports.
    pub decl: Option<DeclRef>,

    pub shape: DeclShape,
    pub target: BindingTarget,
}

impl Binding {
    /// Attempt to absorb a redeclaration of the same name in the same
    ///   tier.
    ///
    /// Structures and enumerations with identical layout merge into the
    ///   earlier binding;
    ///     a layout difference is a conflict charged to the later
    ///     declaration regardless of which order the units arrived in.
    /// Any other redeclaration is a duplicate.
    pub fn redeclare(self, incoming: Binding) -> TransitionResult<Binding> {
        match (&self.shape, &incoming.shape) {
            (DeclShape::Struct(a), DeclShape::Struct(b)) => {
                if structs_identical(a, b) {
                    Ok(self)
                } else {
                    let name = self.name;
                    Err((self, SymtabError::LayoutConflict { name }))
                }
            }

            (DeclShape::Enum(a), DeclShape::Enum(b)) => {
                if a.base == b.base && a.members == b.members {
                    Ok(self)
                } else {
                    let name = self.name;
                    Err((self, SymtabError::LayoutConflict { name }))
                }
            }

            _ => {
                let name = self.name;
                let vis = incoming.vis;
                Err((self, SymtabError::Duplicate { name, vis }))
            }
        }
    }
}

fn structs_identical(a: &StructDecl, b: &StructDecl) -> bool {
    a.layout == b.layout && a.fields == b.fields
}

/// Failure to admit a declaration.
#[derive(Debug, PartialEq, Clone)]
pub enum SymtabError {
    Duplicate {
        name: SymbolId,
        vis: Visibility,
    },

    /// Same type name declared twice with differing layout.
    LayoutConflict { name: SymbolId },
}

impl Display for SymtabError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Duplicate { name, vis } => {
                write!(f, "duplicate {} symbol `{}`", vis, name)
            }
            Self::LayoutConflict { name } => write!(
                f,
                "`{}` redeclared with conflicting layout",
                name
            ),
        }
    }
}

impl Error for SymtabError {}

/// Failure to resolve a name from a fragment.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ResolveError {
    NotFound(SymbolId),
    Ambiguous { name: SymbolId, count: usize },
}

impl Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(name) => {
                write!(f, "unresolved symbol `{}`", name)
            }
            Self::Ambiguous { name, count } => write!(
                f,
                "symbol `{}` is ambiguous ({} candidates)",
                name, count
            ),
        }
    }
}

impl Error for ResolveError {}

#[derive(Debug, Default, Clone)]
struct NameEntry {
    file: FxHashMap<FragmentId, Binding>,
    internal: Vec<Binding>,
    public: Vec<Binding>,
}

/// The symbol table of one link.
#[derive(Debug, Default)]
pub struct SymbolTable {
    names: FxHashMap<SymbolId, NameEntry>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a binding under its declared visibility.
    pub fn declare(&mut self, binding: Binding) -> Result<(), SymtabError> {
        let entry = self.names.entry(binding.name).or_default();

        match binding.vis {
            Visibility::File => match entry.file.remove(&binding.frag) {
                None => {
                    entry.file.insert(binding.frag, binding);
                    Ok(())
                }
                Some(existing) => match existing.redeclare(binding) {
                    Ok(merged) => {
                        entry.file.insert(merged.frag, merged);
                        Ok(())
                    }
                    Err((kept, e)) => {
                        entry.file.insert(kept.frag, kept);
                        Err(e)
                    }
                },
            },

            Visibility::Internal | Visibility::Public => {
                let tier = match binding.vis {
                    Visibility::Internal => &mut entry.internal,
                    _ => &mut entry.public,
                };

                // Module exports never merge; collisions among them
                //   surface as ambiguity at resolution time.
                if matches!(binding.shape, DeclShape::Export(_)) {
                    tier.push(binding);
                    return Ok(());
                }

                match tier.iter().position(|b| {
                    !matches!(b.shape, DeclShape::Export(_))
                }) {
                    None => {
                        tier.push(binding);
                        Ok(())
                    }
                    Some(pos) => {
                        let existing = tier.remove(pos);
                        match existing.redeclare(binding) {
                            Ok(merged) => {
                                tier.insert(pos, merged);
                                Ok(())
                            }
                            Err((kept, e)) => {
                                tier.insert(pos, kept);
                                Err(e)
                            }
                        }
                    }
                }
            }
        }
    }

    /// Resolve `name` as seen from `frag`.
    pub fn resolve(
        &self,
        name: SymbolId,
        frag: FragmentId,
    ) -> Result<&Binding, ResolveError> {
        let entry = self
            .names
            .get(&name)
            .ok_or(ResolveError::NotFound(name))?;

        if let Some(binding) = entry.file.get(&frag) {
            return Ok(binding);
        }

        for tier in [&entry.internal, &entry.public] {
            match tier.len() {
                0 => continue,
                1 => return Ok(&tier[0]),
                count => {
                    return Err(ResolveError::Ambiguous { name, count })
                }
            }
        }

        Err(ResolveError::NotFound(name))
    }

    /// Whether `name` resolves at all from `frag`.
    pub fn is_resolvable(&self, name: SymbolId, frag: FragmentId) -> bool {
        self.resolve(name, frag).is_ok()
    }

    /// The binding created for a specific declaration.
    pub fn binding_for_decl(
        &self,
        name: SymbolId,
        decl: DeclRef,
    ) -> Option<&Binding> {
        self.entry_bindings(name)
            .find(|b| b.decl == Some(decl))
    }

    /// Attach a metadata handle to the binding created for `decl`.
    ///
    /// Used by the shape phase once a shell exists;
    ///   merged redeclarations share the binding and therefore the
    ///   handle.
    pub fn bind_decl(
        &mut self,
        name: SymbolId,
        decl: DeclRef,
        target: Target,
    ) {
        if let Some(binding) = self
            .entry_bindings_mut(name)
            .find(|b| b.decl == Some(decl))
        {
            binding.target = BindingTarget::Bound(target);
        }
    }

    /// Attach a metadata handle to an external (module export) binding.
    pub fn bind_external(
        &mut self,
        name: SymbolId,
        frag: FragmentId,
        target: Target,
    ) {
        if let Some(binding) = self.entry_bindings_mut(name).find(|b| {
            b.frag == frag && b.target == BindingTarget::External
        }) {
            binding.target = BindingTarget::Bound(target);
        }
    }

    fn entry_bindings(
        &self,
        name: SymbolId,
    ) -> impl Iterator<Item = &Binding> {
        self.names.get(&name).into_iter().flat_map(|e| {
            e.file
                .values()
                .chain(e.internal.iter())
                .chain(e.public.iter())
        })
    }

    fn entry_bindings_mut(
        &mut self,
        name: SymbolId,
    ) -> impl Iterator<Item = &mut Binding> {
        self.names.get_mut(&name).into_iter().flat_map(|e| {
            e.file
                .values_mut()
                .chain(e.internal.iter_mut())
                .chain(e.public.iter_mut())
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::asm::ast::{FieldDecl, LayoutSpec};
    use crate::asm::ty::Prim;
    use crate::sym::GlobalSymbolIntern;

    fn frag(n: u32) -> FragmentId {
        FragmentId(n)
    }

    fn fn_binding(
        name: &str,
        vis: Visibility,
        f: FragmentId,
    ) -> Binding {
        Binding {
            name: name.intern(),
            vis,
            frag: f,
            decl: Some(DeclRef { frag: f, index: 0 }),
            shape: DeclShape::Function(Signature {
                ret: TypeExpression::Prim(Prim::Void),
                params: vec![],
                varargs: false,
            }),
            target: BindingTarget::Pending,
        }
    }

    fn struct_binding(
        name: &str,
        vis: Visibility,
        f: FragmentId,
        fields: Vec<FieldDecl>,
    ) -> Binding {
        Binding {
            name: name.intern(),
            vis,
            frag: f,
            decl: Some(DeclRef { frag: f, index: 0 }),
            shape: DeclShape::Struct(StructDecl {
                name: name.intern(),
                vis,
                layout: LayoutSpec::Sequential,
                fields,
            }),
            target: BindingTarget::Pending,
        }
    }

    fn field(name: &str, prim: Prim) -> FieldDecl {
        FieldDecl {
            name: name.intern(),
            ty: TypeExpression::Prim(prim),
            offset: None,
        }
    }

    #[test]
    fn file_symbol_invisible_outside_its_fragment() {
        let mut sut = SymbolTable::new();

        sut.declare(fn_binding("helper", Visibility::File, frag(0)))
            .unwrap();

        assert!(sut.resolve("helper".intern(), frag(0)).is_ok());
        assert_eq!(
            Err(ResolveError::NotFound("helper".intern())),
            sut.resolve("helper".intern(), frag(1)).map(|_| ())
        );
    }

    #[test]
    fn own_file_shadows_internal_and_public() {
        let mut sut = SymbolTable::new();

        sut.declare(fn_binding("f", Visibility::Public, frag(0)))
            .unwrap();
        sut.declare(fn_binding("f", Visibility::File, frag(1)))
            .unwrap();

        // Fragment 1 sees its own file-scoped f.
        let seen = sut.resolve("f".intern(), frag(1)).unwrap();
        assert_eq!(Visibility::File, seen.vis);
        assert_eq!(frag(1), seen.frag);

        // Everyone else sees the public one.
        let seen = sut.resolve("f".intern(), frag(2)).unwrap();
        assert_eq!(Visibility::Public, seen.vis);
    }

    #[test]
    fn internal_beats_public() {
        let mut sut = SymbolTable::new();

        sut.declare(fn_binding("g", Visibility::Public, frag(0)))
            .unwrap();
        sut.declare(fn_binding("g", Visibility::Internal, frag(1)))
            .unwrap();

        let seen = sut.resolve("g".intern(), frag(2)).unwrap();
        assert_eq!(Visibility::Internal, seen.vis);
    }

    #[test]
    fn identical_structs_merge_idempotently() {
        let mut sut = SymbolTable::new();
        let fields = vec![field("x", Prim::I32), field("y", Prim::I32)];

        sut.declare(struct_binding(
            "Point",
            Visibility::Public,
            frag(0),
            fields.clone(),
        ))
        .unwrap();

        // Redeclaring identically from another unit is a no-op merge,
        //   any number of times.
        for n in 1..4 {
            sut.declare(struct_binding(
                "Point",
                Visibility::Public,
                frag(n),
                fields.clone(),
            ))
            .unwrap();
        }

        let binding = sut.resolve("Point".intern(), frag(9)).unwrap();
        assert_eq!(frag(0), binding.frag, "first declaration survives");
    }

    #[test]
    fn layout_conflict_regardless_of_order() {
        let a = vec![field("x", Prim::I32)];
        let b = vec![field("x", Prim::I64)];

        for (first, second) in [(a.clone(), b.clone()), (b, a)] {
            let mut sut = SymbolTable::new();

            sut.declare(struct_binding(
                "S",
                Visibility::Public,
                frag(0),
                first,
            ))
            .unwrap();

            assert_eq!(
                Err(SymtabError::LayoutConflict {
                    name: "S".intern()
                }),
                sut.declare(struct_binding(
                    "S",
                    Visibility::Public,
                    frag(1),
                    second,
                ))
            );

            // The earlier binding survives the failed transition.
            assert!(sut.resolve("S".intern(), frag(2)).is_ok());
        }
    }

    #[test]
    fn same_tier_function_redeclaration_is_duplicate() {
        let mut sut = SymbolTable::new();

        sut.declare(fn_binding("f", Visibility::Internal, frag(0)))
            .unwrap();

        assert_eq!(
            Err(SymtabError::Duplicate {
                name: "f".intern(),
                vis: Visibility::Internal,
            }),
            sut.declare(fn_binding("f", Visibility::Internal, frag(1)))
        );
    }

    #[test]
    fn colliding_module_exports_are_ambiguous() {
        let mut sut = SymbolTable::new();

        for n in 0..2 {
            sut.declare(Binding {
                name: "open".intern(),
                vis: Visibility::Public,
                frag: frag(n),
                decl: None,
                shape: DeclShape::Export(ExportKind::Method),
                target: BindingTarget::External,
            })
            .unwrap();
        }

        assert_eq!(
            Err(ResolveError::Ambiguous {
                name: "open".intern(),
                count: 2,
            }),
            sut.resolve("open".intern(), frag(5)).map(|_| ())
        );
    }

    #[test]
    fn bind_decl_updates_merged_binding() {
        let mut sut = SymbolTable::new();
        let decl = DeclRef {
            frag: frag(0),
            index: 0,
        };

        sut.declare(fn_binding("f", Visibility::Public, frag(0)))
            .unwrap();
        sut.bind_decl(
            "f".intern(),
            decl,
            Target::Method(MethodHandle(7)),
        );

        let binding = sut.resolve("f".intern(), frag(1)).unwrap();
        assert_eq!(
            BindingTarget::Bound(Target::Method(MethodHandle(7))),
            binding.target
        );
    }
}
