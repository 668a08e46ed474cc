// Module binary writer
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

//! Binary `.mx` writer.
//!
//! Layout,
//!   all integers little-endian,
//!   all strings u32-length-prefixed UTF-8:
//!
//! ```text
//!   magic "MXM\x01"
//!   module name
//!   export table   (so readers can list exports without a full decode)
//!   signature table
//!   type table
//!   field table
//!   method table
//!   optional entry-point method handle
//! ```
//!
//! The export table is redundant with the member tables but is placed
//!   first so that [`super::read::scan_exports`] can stop after it.

use super::*;
use crate::sym::GlobalSymbolResolve;
use std::io::{Result, Write};

/// Wire tags shared with the reader.
pub(super) mod tag {
    // MTy.
    pub const TY_PRIM: u8 = 0;
    pub const TY_TYPE: u8 = 1;
    pub const TY_PTR: u8 = 2;
    pub const TY_BYREF: u8 = 3;
    pub const TY_FNPTR: u8 = 4;

    // TypeKind.
    pub const KIND_STRUCT: u8 = 0;
    pub const KIND_ENUM: u8 = 1;
    pub const KIND_VARRAY: u8 = 2;

    // Layout.
    pub const LAYOUT_SEQ: u8 = 0;
    pub const LAYOUT_EXPLICIT: u8 = 1;
    pub const LAYOUT_PACKED: u8 = 2;

    // Instr opcodes.
    pub const OP_NOP: u8 = 0;
    pub const OP_DUP: u8 = 1;
    pub const OP_POP: u8 = 2;
    pub const OP_RET: u8 = 3;
    pub const OP_LDNULL: u8 = 4;
    pub const OP_LDC_I4: u8 = 5;
    pub const OP_LDC_I8: u8 = 6;
    pub const OP_LDC_R8: u8 = 7;
    pub const OP_LDSTR: u8 = 8;
    pub const OP_LDLOC: u8 = 9;
    pub const OP_STLOC: u8 = 10;
    pub const OP_LDLOCA: u8 = 11;
    pub const OP_LDARG: u8 = 12;
    pub const OP_STARG: u8 = 13;
    pub const OP_LDSFLD: u8 = 14;
    pub const OP_STSFLD: u8 = 15;
    pub const OP_LDSFLDA: u8 = 16;
    pub const OP_LDFLD: u8 = 17;
    pub const OP_STFLD: u8 = 18;
    pub const OP_LDFLDA: u8 = 19;
    pub const OP_CALL: u8 = 20;
    pub const OP_CALL_VA: u8 = 21;
    pub const OP_CALLI: u8 = 22;
    pub const OP_LDFTN: u8 = 23;
    pub const OP_BR: u8 = 24;
    pub const OP_BRTRUE: u8 = 25;
    pub const OP_BRFALSE: u8 = 26;
    pub const OP_ADD: u8 = 27;
    pub const OP_SUB: u8 = 28;
    pub const OP_MUL: u8 = 29;
    pub const OP_DIV: u8 = 30;
    pub const OP_REM: u8 = 31;
    pub const OP_NEG: u8 = 32;
    pub const OP_AND: u8 = 33;
    pub const OP_OR: u8 = 34;
    pub const OP_XOR: u8 = 35;
    pub const OP_SHL: u8 = 36;
    pub const OP_SHR: u8 = 37;
    pub const OP_NOT: u8 = 38;
    pub const OP_CEQ: u8 = 39;
    pub const OP_CLT: u8 = 40;
    pub const OP_CGT: u8 = 41;
    pub const OP_CONV: u8 = 42;
    pub const OP_SIZEOF: u8 = 43;
    pub const OP_LDIND: u8 = 44;
    pub const OP_STIND: u8 = 45;
    pub const OP_VA_START: u8 = 46;
    pub const OP_VA_ARG: u8 = 47;
    pub const OP_VA_END: u8 = 48;
    pub const OP_RANGE_FAULT: u8 = 49;
}

pub(super) const MAGIC: &[u8; 4] = b"MXM\x01";

/// Sentinel for an absent optional u32 (field owner).
pub(super) const NONE_U32: u32 = u32::MAX;

struct Writer<W: Write> {
    out: W,
}

impl<W: Write> Writer<W> {
    fn u8(&mut self, v: u8) -> Result<()> {
        self.out.write_all(&[v])
    }

    fn u16(&mut self, v: u16) -> Result<()> {
        self.out.write_all(&v.to_le_bytes())
    }

    fn u32(&mut self, v: u32) -> Result<()> {
        self.out.write_all(&v.to_le_bytes())
    }

    fn i32(&mut self, v: i32) -> Result<()> {
        self.out.write_all(&v.to_le_bytes())
    }

    fn i64(&mut self, v: i64) -> Result<()> {
        self.out.write_all(&v.to_le_bytes())
    }

    fn f64(&mut self, v: f64) -> Result<()> {
        self.out.write_all(&v.to_le_bytes())
    }

    fn str(&mut self, s: &str) -> Result<()> {
        self.u32(s.len() as u32)?;
        self.out.write_all(s.as_bytes())
    }

    fn sym(&mut self, sym: SymbolId) -> Result<()> {
        self.str(sym.lookup_str())
    }

    fn opt_u32(&mut self, v: Option<u32>) -> Result<()> {
        match v {
            Some(v) => {
                self.u8(1)?;
                self.u32(v)
            }
            None => self.u8(0),
        }
    }

    fn mty(&mut self, ty: &MTy) -> Result<()> {
        match ty {
            MTy::Prim(p) => {
                self.u8(tag::TY_PRIM)?;
                self.u8(*p as u8)
            }
            MTy::Type(h) => {
                self.u8(tag::TY_TYPE)?;
                self.u32(h.0)
            }
            MTy::Pointer(inner) => {
                self.u8(tag::TY_PTR)?;
                self.mty(inner)
            }
            MTy::ByRef(inner) => {
                self.u8(tag::TY_BYREF)?;
                self.mty(inner)
            }
            MTy::FnPtr(sig) => {
                self.u8(tag::TY_FNPTR)?;
                self.u32(sig.0)
            }
        }
    }

    fn instr(&mut self, instr: &Instr) -> Result<()> {
        use tag::*;

        match instr {
            Instr::Nop => self.u8(OP_NOP),
            Instr::Dup => self.u8(OP_DUP),
            Instr::Pop => self.u8(OP_POP),
            Instr::Ret => self.u8(OP_RET),
            Instr::LdNull => self.u8(OP_LDNULL),

            Instr::LdcI4(v) => {
                self.u8(OP_LDC_I4)?;
                self.i32(*v)
            }
            Instr::LdcI8(v) => {
                self.u8(OP_LDC_I8)?;
                self.i64(*v)
            }
            Instr::LdcR8(v) => {
                self.u8(OP_LDC_R8)?;
                self.f64(*v)
            }
            Instr::LdStr(s) => {
                self.u8(OP_LDSTR)?;
                self.sym(*s)
            }

            Instr::LdLoc(n) => {
                self.u8(OP_LDLOC)?;
                self.u16(*n)
            }
            Instr::StLoc(n) => {
                self.u8(OP_STLOC)?;
                self.u16(*n)
            }
            Instr::LdLocA(n) => {
                self.u8(OP_LDLOCA)?;
                self.u16(*n)
            }
            Instr::LdArg(n) => {
                self.u8(OP_LDARG)?;
                self.u16(*n)
            }
            Instr::StArg(n) => {
                self.u8(OP_STARG)?;
                self.u16(*n)
            }

            Instr::LdsFld(h) => {
                self.u8(OP_LDSFLD)?;
                self.u32(h.0)
            }
            Instr::StsFld(h) => {
                self.u8(OP_STSFLD)?;
                self.u32(h.0)
            }
            Instr::LdsFldA(h) => {
                self.u8(OP_LDSFLDA)?;
                self.u32(h.0)
            }
            Instr::LdFld(h) => {
                self.u8(OP_LDFLD)?;
                self.u32(h.0)
            }
            Instr::StFld(h) => {
                self.u8(OP_STFLD)?;
                self.u32(h.0)
            }
            Instr::LdFldA(h) => {
                self.u8(OP_LDFLDA)?;
                self.u32(h.0)
            }

            Instr::Call(m, None) => {
                self.u8(OP_CALL)?;
                self.u32(m.0)
            }
            Instr::Call(m, Some(site)) => {
                self.u8(OP_CALL_VA)?;
                self.u32(m.0)?;
                self.u32(site.0)
            }
            Instr::CallI(sig) => {
                self.u8(OP_CALLI)?;
                self.u32(sig.0)
            }
            Instr::LdFtn(m) => {
                self.u8(OP_LDFTN)?;
                self.u32(m.0)
            }

            Instr::Br(t) => {
                self.u8(OP_BR)?;
                self.u32(*t)
            }
            Instr::BrTrue(t) => {
                self.u8(OP_BRTRUE)?;
                self.u32(*t)
            }
            Instr::BrFalse(t) => {
                self.u8(OP_BRFALSE)?;
                self.u32(*t)
            }

            Instr::Add => self.u8(OP_ADD),
            Instr::Sub => self.u8(OP_SUB),
            Instr::Mul => self.u8(OP_MUL),
            Instr::Div => self.u8(OP_DIV),
            Instr::Rem => self.u8(OP_REM),
            Instr::Neg => self.u8(OP_NEG),
            Instr::And => self.u8(OP_AND),
            Instr::Or => self.u8(OP_OR),
            Instr::Xor => self.u8(OP_XOR),
            Instr::Shl => self.u8(OP_SHL),
            Instr::Shr => self.u8(OP_SHR),
            Instr::Not => self.u8(OP_NOT),
            Instr::Ceq => self.u8(OP_CEQ),
            Instr::Clt => self.u8(OP_CLT),
            Instr::Cgt => self.u8(OP_CGT),

            Instr::Conv(p) => {
                self.u8(OP_CONV)?;
                self.u8(*p as u8)
            }
            Instr::SizeOf(ty) => {
                self.u8(OP_SIZEOF)?;
                self.mty(ty)
            }
            Instr::LdInd(p) => {
                self.u8(OP_LDIND)?;
                self.u8(*p as u8)
            }
            Instr::StInd(p) => {
                self.u8(OP_STIND)?;
                self.u8(*p as u8)
            }

            Instr::VaStart => self.u8(OP_VA_START),
            Instr::VaArg(ty) => {
                self.u8(OP_VA_ARG)?;
                self.mty(ty)
            }
            Instr::VaEnd => self.u8(OP_VA_END),

            Instr::RangeFault => self.u8(OP_RANGE_FAULT),
        }
    }
}

/// Serialize `module` to `out`.
pub fn write_module<W: Write>(module: &Module, out: W) -> Result<()> {
    let mut w = Writer { out };

    w.out.write_all(MAGIC)?;
    w.sym(module.name)?;

    // Export table.
    let exports: Vec<_> = module.exports().collect();
    w.u32(exports.len() as u32)?;
    for (name, kind) in exports {
        w.sym(name)?;
        w.u8(kind as u8)?;
    }

    // Signatures.
    w.u32(module.sigs.len() as u32)?;
    for sig in &module.sigs {
        w.mty(&sig.ret)?;
        w.u32(sig.params.len() as u32)?;
        for p in &sig.params {
            w.mty(p)?;
        }
        w.u8(sig.varargs as u8)?;
    }

    // Types.
    w.u32(module.types.len() as u32)?;
    for ty in &module.types {
        w.sym(ty.name)?;
        w.u8(ty.access as u8)?;

        match &ty.kind {
            TypeKind::Struct { layout, fields } => {
                w.u8(tag::KIND_STRUCT)?;
                match layout {
                    Layout::Sequential => w.u8(tag::LAYOUT_SEQ)?,
                    Layout::Explicit => w.u8(tag::LAYOUT_EXPLICIT)?,
                    Layout::Packed(n) => {
                        w.u8(tag::LAYOUT_PACKED)?;
                        w.u32(*n)?;
                    }
                }
                w.u32(fields.len() as u32)?;
                for f in fields {
                    w.u32(f.0)?;
                }
            }
            TypeKind::Enum { base, members } => {
                w.u8(tag::KIND_ENUM)?;
                w.u8(*base as u8)?;
                w.u32(members.len() as u32)?;
                for (name, value) in members {
                    w.sym(*name)?;
                    w.i64(*value)?;
                }
            }
            TypeKind::ValueArray { elem, len } => {
                w.u8(tag::KIND_VARRAY)?;
                w.mty(elem)?;
                w.opt_u32(*len)?;
            }
        }
    }

    // Fields.
    w.u32(module.fields.len() as u32)?;
    for field in &module.fields {
        w.sym(field.name)?;
        w.u8(field.access as u8)?;
        w.u32(field.owner.map(|h| h.0).unwrap_or(NONE_U32))?;
        w.mty(&field.ty)?;
        w.opt_u32(field.offset)?;
        w.u8(field.constant as u8)?;
    }

    // Methods.
    w.u32(module.methods.len() as u32)?;
    for method in &module.methods {
        w.sym(method.name)?;
        w.u8(method.access as u8)?;
        w.u32(method.sig.0)?;
        w.u32(method.locals.len() as u32)?;
        for local in &method.locals {
            w.mty(local)?;
        }
        w.u32(method.body.len() as u32)?;
        for instr in &method.body {
            w.instr(instr)?;
        }
    }

    w.opt_u32(module.entry.map(|h| h.0))?;

    Ok(())
}
