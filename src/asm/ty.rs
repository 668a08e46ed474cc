// Composite type-name resolution
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

//! Composite type-name resolution.
//!
//! A type name in object text is a single token composed of an innermost
//!   base name and suffix modifiers,
//!     read left to right:
//!
//! ```text
//!   int32*[6]            array of six pointers to int32
//!   string(int32,int8&)* pointer to function taking int32 and int8-ref
//!   foo[*]               flexible array of foo
//!   int32(int32:n,...)   variadic signature with a named parameter
//! ```
//!
//! Parsing is a single left-to-right scan maintaining a stack of function
//!   signature contexts for nested parameter lists.
//! This is independent of any symbol table:
//!   base names other than the built-in primitives are left as
//!   [`TypeExpression::Named`] for the linker to resolve later,
//!     since forward references are legal.
//!
//! Built-in alias names canonicalize through a fixed table
//!   (e.g. `byte` to the platform byte type `uint8`,
//!     `intptr` to the pointer-sized `nint`),
//!   so that two [`TypeExpression`]s are structurally equal whenever they
//!   denote the same type.
//!
//! Any unmatched bracket or paren,
//!   a modifier with no preceding base type,
//!   or a named-parameter colon outside a signature context is a hard
//!   parse failure pinpointing the offending byte offset;
//!     the caller aborts linking the declaring unit.

use crate::sym::{st, GlobalSymbolIntern, SymbolId};
use std::error::Error;
use std::fmt::{self, Display};
use std::hash::{Hash, Hasher};

/// Metadata primitive types.
///
/// `bool` and `char` are pinned to 1-byte and 2-byte representations
///   respectively regardless of host marshaling,
///     because the instruction set assumes that footprint.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
#[repr(u8)]
pub enum Prim {
    Void,
    Bool,
    Char,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    NInt,
    NUInt,
    Str,
    Object,
}

impl Prim {
    /// Byte size of the primitive,
    ///   if known at link time.
    ///
    /// Pointer-sized and reference types yield [`None`] and require a
    ///   dynamic size query at runtime.
    pub fn byte_size(self) -> Option<u32> {
        match self {
            Prim::Void => None,
            Prim::Bool | Prim::I8 | Prim::U8 => Some(1),
            Prim::Char | Prim::I16 | Prim::U16 => Some(2),
            Prim::I32 | Prim::U32 | Prim::F32 => Some(4),
            Prim::I64 | Prim::U64 | Prim::F64 => Some(8),
            Prim::NInt | Prim::NUInt | Prim::Str | Prim::Object => None,
        }
    }

    /// Canonical metadata name.
    pub fn name(self) -> &'static str {
        match self {
            Prim::Void => "void",
            Prim::Bool => "bool",
            Prim::Char => "char",
            Prim::I8 => "int8",
            Prim::U8 => "uint8",
            Prim::I16 => "int16",
            Prim::U16 => "uint16",
            Prim::I32 => "int32",
            Prim::U32 => "uint32",
            Prim::I64 => "int64",
            Prim::U64 => "uint64",
            Prim::F32 => "float32",
            Prim::F64 => "float64",
            Prim::NInt => "nint",
            Prim::NUInt => "nuint",
            Prim::Str => "string",
            Prim::Object => "object",
        }
    }

    /// Canonicalize a base name,
    ///   including aliases,
    ///   to a primitive.
    pub fn from_sym(sym: SymbolId) -> Option<Prim> {
        // A match on SymbolId consts would require structural equality
        //   guarantees on the NonZero internals; an eq chain on the
        //   prefilled ids is just as cheap.
        let table: &[(SymbolId, Prim)] = &[
            (st::L_VOID, Prim::Void),
            (st::L_BOOL, Prim::Bool),
            (st::L_CHAR, Prim::Char),
            (st::L_INT8, Prim::I8),
            (st::L_UINT8, Prim::U8),
            (st::L_INT16, Prim::I16),
            (st::L_UINT16, Prim::U16),
            (st::L_INT32, Prim::I32),
            (st::L_UINT32, Prim::U32),
            (st::L_INT64, Prim::I64),
            (st::L_UINT64, Prim::U64),
            (st::L_FLOAT32, Prim::F32),
            (st::L_FLOAT64, Prim::F64),
            (st::L_NINT, Prim::NInt),
            (st::L_NUINT, Prim::NUInt),
            (st::L_STRING, Prim::Str),
            (st::L_OBJECT, Prim::Object),
            // Aliases.
            (st::L_BYTE, Prim::U8),
            (st::L_SBYTE, Prim::I8),
            (st::L_INTPTR, Prim::NInt),
            (st::L_UINTPTR, Prim::NUInt),
        ];

        table.iter().find(|(s, _)| *s == sym).map(|(_, p)| *p)
    }
}

impl Display for Prim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Length of an array type.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum ArrayLen {
    /// `T[N]`: fixed-size inline array of N elements.
    Fixed(u32),

    /// `T[*]`: flexible array overlaying raw memory with no bounds.
    Flexible,
}

/// A single parameter of a [`Signature`].
#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub struct Param {
    pub ty: TypeExpression,

    /// Optional parameter name given with a `:` in the parameter list.
    ///
    /// Names do not participate in signature equality.
    pub name: Option<SymbolId>,
}

/// A function signature.
#[derive(Debug, Eq, Clone)]
pub struct Signature {
    pub ret: TypeExpression,
    pub params: Vec<Param>,

    /// Whether a trailing ellipsis parameter marked this signature
    ///   variadic.
    pub varargs: bool,
}

impl Signature {
    /// Whether `self` is an acceptable call-site signature for a callee
    ///   declared with signature `callee`.
    ///
    /// For a non-variadic callee this is structural equality.
    /// For a variadic callee,
    ///   the call site must match the callee's fixed-parameter prefix
    ///   exactly and may then append any number of concrete argument
    ///   types.
    pub fn matches_callee(&self, callee: &Signature) -> bool {
        if !callee.varargs {
            return self == callee;
        }

        self.ret == callee.ret
            && self.params.len() >= callee.params.len()
            && self
                .params
                .iter()
                .zip(callee.params.iter())
                .all(|(a, b)| a.ty == b.ty)
    }
}

// Parameter names are documentation only and must not affect signature
//   identity.
impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        self.ret == other.ret
            && self.varargs == other.varargs
            && self.params.len() == other.params.len()
            && self
                .params
                .iter()
                .zip(other.params.iter())
                .all(|(a, b)| a.ty == b.ty)
    }
}

// Hashes exactly the fields the equality above compares.
impl Hash for Signature {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ret.hash(state);
        self.varargs.hash(state);
        self.params.len().hash(state);
        for param in &self.params {
            param.ty.hash(state);
        }
    }
}

/// A structured type expression parsed from a composite type-name token.
///
/// Equality is structural;
///   built-in aliases are canonicalized to [`Prim`] during parsing so
///   that e.g. `byte` and `uint8` compare equal.
#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub enum TypeExpression {
    /// A primitive.
    Prim(Prim),

    /// A named type to be resolved against the symbol table.
    Named(SymbolId),

    /// Unmanaged pointer `T*`.
    Pointer(Box<TypeExpression>),

    /// Managed reference `T&`.
    Reference(Box<TypeExpression>),

    /// Inline array `T[N]` or flexible array `T[*]`.
    Array(Box<TypeExpression>, ArrayLen),

    /// Function signature `R(P1,P2,...)`.
    Signature(Box<Signature>),
}

impl TypeExpression {
    /// The signature if this expression is one.
    pub fn as_signature(&self) -> Option<&Signature> {
        match self {
            TypeExpression::Signature(sig) => Some(sig),
            _ => None,
        }
    }
}

impl Display for TypeExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeExpression::Prim(p) => Display::fmt(p, f),
            TypeExpression::Named(name) => Display::fmt(name, f),
            TypeExpression::Pointer(inner) => write!(f, "{}*", inner),
            TypeExpression::Reference(inner) => write!(f, "{}&", inner),
            TypeExpression::Array(inner, ArrayLen::Fixed(n)) => {
                write!(f, "{}[{}]", inner, n)
            }
            TypeExpression::Array(inner, ArrayLen::Flexible) => {
                write!(f, "{}[*]", inner)
            }
            TypeExpression::Signature(sig) => {
                write!(f, "{}(", sig.ret)?;

                for (i, param) in sig.params.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    Display::fmt(&param.ty, f)?;
                }

                if sig.varargs {
                    if !sig.params.is_empty() {
                        f.write_str(",")?;
                    }
                    f.write_str("...")?;
                }

                f.write_str(")")
            }
        }
    }
}

/// Failure to parse a composite type-name token.
///
/// The offset is the byte position of the offending substring within the
///   token.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TypeNameError {
    pub kind: TypeNameErrorKind,
    pub offset: usize,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum TypeNameErrorKind {
    /// Empty input or a modifier position where a base type was expected.
    ExpectedBase,

    /// `*`, `&`, `[`, or `(` with no preceding base type.
    ModifierWithoutBase,

    /// `)` or `]` with no opening counterpart,
    ///   or input ended inside one.
    Unmatched(char),

    /// Array length was not a decimal number or `*`.
    InvalidLength,

    /// A `:` parameter name outside of a signature context.
    NameOutsideSignature,

    /// A character that can never appear in a type name.
    UnexpectedChar(char),
}

impl Display for TypeNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use TypeNameErrorKind::*;

        match &self.kind {
            ExpectedBase => {
                write!(f, "expected type name at offset {}", self.offset)
            }
            ModifierWithoutBase => write!(
                f,
                "type modifier at offset {} has no base type",
                self.offset
            ),
            Unmatched(c) => {
                write!(f, "unmatched `{}` at offset {}", c, self.offset)
            }
            InvalidLength => {
                write!(f, "invalid array length at offset {}", self.offset)
            }
            NameOutsideSignature => write!(
                f,
                "parameter name at offset {} outside of a signature",
                self.offset
            ),
            UnexpectedChar(c) => write!(
                f,
                "unexpected `{}` in type name at offset {}",
                c, self.offset
            ),
        }
    }
}

impl Error for TypeNameError {}

/// An in-progress signature whose parameter list is still being read.
struct SigFrame {
    ret: TypeExpression,
    params: Vec<Param>,
    varargs: bool,
}

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_' || c == b'$'
}

fn is_ident_cont(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'$'
}

/// Parse a composite type-name token into a [`TypeExpression`].
///
/// See the [module-level documentation](self) for the accepted syntax.
pub fn parse_type_name(src: &str) -> Result<TypeExpression, TypeNameError> {
    let bytes = src.as_bytes();
    let mut pos = 0usize;

    let mut frames: Vec<SigFrame> = Vec::new();
    let mut current: Option<TypeExpression> = None;
    // Name given to the parameter currently being read, if any.
    let mut pending_name: Option<SymbolId> = None;

    let err = |kind, offset| Err(TypeNameError { kind, offset });

    while pos < bytes.len() {
        let c = bytes[pos];

        match c {
            b'*' => match current.take() {
                Some(inner) => {
                    current = Some(TypeExpression::Pointer(Box::new(inner)));
                    pos += 1;
                }
                None => {
                    return err(
                        TypeNameErrorKind::ModifierWithoutBase,
                        pos,
                    )
                }
            },

            b'&' => match current.take() {
                Some(inner) => {
                    current =
                        Some(TypeExpression::Reference(Box::new(inner)));
                    pos += 1;
                }
                None => {
                    return err(
                        TypeNameErrorKind::ModifierWithoutBase,
                        pos,
                    )
                }
            },

            b'[' => {
                let inner = match current.take() {
                    Some(inner) => inner,
                    None => {
                        return err(
                            TypeNameErrorKind::ModifierWithoutBase,
                            pos,
                        )
                    }
                };

                let open = pos;
                pos += 1;

                let len = if pos < bytes.len() && bytes[pos] == b'*' {
                    pos += 1;
                    ArrayLen::Flexible
                } else {
                    let start = pos;
                    while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                        pos += 1;
                    }

                    if pos == start {
                        return err(TypeNameErrorKind::InvalidLength, start);
                    }

                    match src[start..pos].parse::<u32>() {
                        Ok(n) => ArrayLen::Fixed(n),
                        Err(_) => {
                            return err(
                                TypeNameErrorKind::InvalidLength,
                                start,
                            )
                        }
                    }
                };

                if pos >= bytes.len() || bytes[pos] != b']' {
                    return err(TypeNameErrorKind::Unmatched('['), open);
                }
                pos += 1;

                current = Some(TypeExpression::Array(Box::new(inner), len));
            }

            b']' => return err(TypeNameErrorKind::Unmatched(']'), pos),

            b'(' => {
                let ret = match current.take() {
                    Some(ret) => ret,
                    None => {
                        return err(
                            TypeNameErrorKind::ModifierWithoutBase,
                            pos,
                        )
                    }
                };

                frames.push(SigFrame {
                    ret,
                    params: Vec::new(),
                    varargs: false,
                });
                pos += 1;
            }

            b',' => {
                let frame = match frames.last_mut() {
                    Some(frame) => frame,
                    None => {
                        return err(TypeNameErrorKind::Unmatched(','), pos)
                    }
                };

                match current.take() {
                    Some(ty) => frame.params.push(Param {
                        ty,
                        name: pending_name.take(),
                    }),
                    None => {
                        return err(TypeNameErrorKind::ExpectedBase, pos)
                    }
                }
                pos += 1;
            }

            b')' => {
                let mut frame = match frames.pop() {
                    Some(frame) => frame,
                    None => {
                        return err(TypeNameErrorKind::Unmatched(')'), pos)
                    }
                };

                if let Some(ty) = current.take() {
                    frame.params.push(Param {
                        ty,
                        name: pending_name.take(),
                    });
                } else if !frame.params.is_empty() && !frame.varargs {
                    // `(int32,)` and the like.
                    return err(TypeNameErrorKind::ExpectedBase, pos);
                }

                current = Some(TypeExpression::Signature(Box::new(
                    Signature {
                        ret: frame.ret,
                        params: frame.params,
                        varargs: frame.varargs,
                    },
                )));
                pos += 1;
            }

            b':' => {
                if frames.is_empty() {
                    return err(
                        TypeNameErrorKind::NameOutsideSignature,
                        pos,
                    );
                }
                if current.is_none() {
                    return err(TypeNameErrorKind::ExpectedBase, pos);
                }

                pos += 1;
                let start = pos;

                if pos >= bytes.len() || !is_ident_start(bytes[pos]) {
                    return err(TypeNameErrorKind::ExpectedBase, start);
                }
                while pos < bytes.len() && is_ident_cont(bytes[pos]) {
                    pos += 1;
                }

                pending_name = Some(src[start..pos].intern());
            }

            b'.' => {
                // A trailing `...` parameter marks the signature variadic
                //   and is stripped from the parameter list.
                if !src[pos..].starts_with("...") {
                    return err(
                        TypeNameErrorKind::UnexpectedChar('.'),
                        pos,
                    );
                }

                let frame = match frames.last_mut() {
                    Some(frame) => frame,
                    None => {
                        return err(
                            TypeNameErrorKind::UnexpectedChar('.'),
                            pos,
                        )
                    }
                };

                if current.is_some() {
                    // `int32(int32...)`: missing separating comma.
                    return err(
                        TypeNameErrorKind::UnexpectedChar('.'),
                        pos,
                    );
                }

                frame.varargs = true;
                pos += 3;

                // Nothing may follow the ellipsis but the closing paren.
                if pos >= bytes.len() || bytes[pos] != b')' {
                    return err(TypeNameErrorKind::Unmatched('('), pos);
                }
            }

            c if is_ident_start(c) => {
                if current.is_some() {
                    // Two adjacent base names (`foo bar` cannot occur in
                    //   a single token, but `foo[2]bar` can).
                    return err(
                        TypeNameErrorKind::UnexpectedChar(c as char),
                        pos,
                    );
                }

                let start = pos;
                while pos < bytes.len() && is_ident_cont(bytes[pos]) {
                    pos += 1;
                }

                let sym = src[start..pos].intern();
                current = Some(match Prim::from_sym(sym) {
                    Some(prim) => TypeExpression::Prim(prim),
                    None => TypeExpression::Named(sym),
                });
            }

            c => {
                return err(
                    TypeNameErrorKind::UnexpectedChar(c as char),
                    pos,
                )
            }
        }
    }

    if let Some(frame) = frames.last() {
        // Recover the offset of the unclosed paren for the report.
        let _ = frame;
        return Err(TypeNameError {
            kind: TypeNameErrorKind::Unmatched('('),
            offset: src.len(),
        });
    }

    current.ok_or(TypeNameError {
        kind: TypeNameErrorKind::ExpectedBase,
        offset: 0,
    })
}
