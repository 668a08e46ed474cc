// Module binary reader
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

//! Binary `.mx` reader.
//!
//! Two entry points:
//!
//!   - [`scan_exports`] decodes only the header and export table,
//!       returning owned strings.
//!     It performs no interning and is therefore safe to call from the
//!       parallel loading phase.
//!   - [`read_module`] decodes a full [`Module`] for injection,
//!       interning names;
//!         it must run on the linking thread.

use super::write::{tag, MAGIC, NONE_U32};
use super::*;
use crate::asm::ty::Prim;
use crate::sym::GlobalSymbolIntern;
use std::error::Error;
use std::fmt::{self, Display};
use std::io::{self, Read};

/// Failure to decode a `.mx` stream.
#[derive(Debug)]
pub enum ModuleReadError {
    Io(io::Error),
    BadMagic,
    BadUtf8,

    /// An enumeration tag byte outside its domain.
    BadTag { what: &'static str, tag: u8 },

    /// A handle referencing past the end of its table.
    BadHandle { what: &'static str, index: u32 },
}

impl Display for ModuleReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "module read failed: {}", e),
            Self::BadMagic => f.write_str("not a module file"),
            Self::BadUtf8 => f.write_str("malformed string in module"),
            Self::BadTag { what, tag } => {
                write!(f, "invalid {} tag {:#04x} in module", what, tag)
            }
            Self::BadHandle { what, index } => {
                write!(f, "{} handle {} out of range in module", what, index)
            }
        }
    }
}

impl Error for ModuleReadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ModuleReadError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

type Result<T> = std::result::Result<T, ModuleReadError>;

struct Reader<R: Read> {
    inp: R,
}

impl<R: Read> Reader<R> {
    fn bytes<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.inp.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.bytes()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.bytes()?))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.bytes()?))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.bytes()?))
    }

    fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.bytes()?))
    }

    fn str(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let mut buf = vec![0u8; len];
        self.inp.read_exact(&mut buf)?;

        String::from_utf8(buf).map_err(|_| ModuleReadError::BadUtf8)
    }

    fn sym(&mut self) -> Result<SymbolId> {
        Ok(self.str()?.as_str().intern())
    }

    fn opt_u32(&mut self) -> Result<Option<u32>> {
        match self.u8()? {
            0 => Ok(None),
            _ => Ok(Some(self.u32()?)),
        }
    }

    fn prim(&mut self) -> Result<Prim> {
        let code = self.u8()?;

        prim_from_code(code).ok_or(ModuleReadError::BadTag {
            what: "primitive",
            tag: code,
        })
    }

    fn access(&mut self) -> Result<Access> {
        match self.u8()? {
            0 => Ok(Access::Public),
            1 => Ok(Access::Internal),
            2 => Ok(Access::Private),
            tag => Err(ModuleReadError::BadTag {
                what: "access",
                tag,
            }),
        }
    }

    fn mty(&mut self) -> Result<MTy> {
        match self.u8()? {
            tag::TY_PRIM => Ok(MTy::Prim(self.prim()?)),
            tag::TY_TYPE => Ok(MTy::Type(TypeHandle(self.u32()?))),
            tag::TY_PTR => Ok(MTy::Pointer(Box::new(self.mty()?))),
            tag::TY_BYREF => Ok(MTy::ByRef(Box::new(self.mty()?))),
            tag::TY_FNPTR => Ok(MTy::FnPtr(SigHandle(self.u32()?))),
            tag => Err(ModuleReadError::BadTag {
                what: "type reference",
                tag,
            }),
        }
    }

    fn instr(&mut self) -> Result<Instr> {
        use tag::*;

        Ok(match self.u8()? {
            OP_NOP => Instr::Nop,
            OP_DUP => Instr::Dup,
            OP_POP => Instr::Pop,
            OP_RET => Instr::Ret,
            OP_LDNULL => Instr::LdNull,

            OP_LDC_I4 => Instr::LdcI4(self.i32()?),
            OP_LDC_I8 => Instr::LdcI8(self.i64()?),
            OP_LDC_R8 => Instr::LdcR8(self.f64()?),
            OP_LDSTR => Instr::LdStr(self.sym()?),

            OP_LDLOC => Instr::LdLoc(self.u16()?),
            OP_STLOC => Instr::StLoc(self.u16()?),
            OP_LDLOCA => Instr::LdLocA(self.u16()?),
            OP_LDARG => Instr::LdArg(self.u16()?),
            OP_STARG => Instr::StArg(self.u16()?),

            OP_LDSFLD => Instr::LdsFld(FieldHandle(self.u32()?)),
            OP_STSFLD => Instr::StsFld(FieldHandle(self.u32()?)),
            OP_LDSFLDA => Instr::LdsFldA(FieldHandle(self.u32()?)),
            OP_LDFLD => Instr::LdFld(FieldHandle(self.u32()?)),
            OP_STFLD => Instr::StFld(FieldHandle(self.u32()?)),
            OP_LDFLDA => Instr::LdFldA(FieldHandle(self.u32()?)),

            OP_CALL => Instr::Call(MethodHandle(self.u32()?), None),
            OP_CALL_VA => Instr::Call(
                MethodHandle(self.u32()?),
                Some(SigHandle(self.u32()?)),
            ),
            OP_CALLI => Instr::CallI(SigHandle(self.u32()?)),
            OP_LDFTN => Instr::LdFtn(MethodHandle(self.u32()?)),

            OP_BR => Instr::Br(self.u32()?),
            OP_BRTRUE => Instr::BrTrue(self.u32()?),
            OP_BRFALSE => Instr::BrFalse(self.u32()?),

            OP_ADD => Instr::Add,
            OP_SUB => Instr::Sub,
            OP_MUL => Instr::Mul,
            OP_DIV => Instr::Div,
            OP_REM => Instr::Rem,
            OP_NEG => Instr::Neg,
            OP_AND => Instr::And,
            OP_OR => Instr::Or,
            OP_XOR => Instr::Xor,
            OP_SHL => Instr::Shl,
            OP_SHR => Instr::Shr,
            OP_NOT => Instr::Not,
            OP_CEQ => Instr::Ceq,
            OP_CLT => Instr::Clt,
            OP_CGT => Instr::Cgt,

            OP_CONV => Instr::Conv(self.prim()?),
            OP_SIZEOF => Instr::SizeOf(self.mty()?),
            OP_LDIND => Instr::LdInd(self.prim()?),
            OP_STIND => Instr::StInd(self.prim()?),

            OP_VA_START => Instr::VaStart,
            OP_VA_ARG => Instr::VaArg(self.mty()?),
            OP_VA_END => Instr::VaEnd,

            OP_RANGE_FAULT => Instr::RangeFault,

            tag => {
                return Err(ModuleReadError::BadTag {
                    what: "opcode",
                    tag,
                })
            }
        })
    }

    fn magic(&mut self) -> Result<()> {
        if &self.bytes::<4>()? != MAGIC {
            return Err(ModuleReadError::BadMagic);
        }
        Ok(())
    }

    fn export_entry(&mut self) -> Result<(String, ExportKind)> {
        let name = self.str()?;
        let kind = match self.u8()? {
            0 => ExportKind::Type,
            1 => ExportKind::Field,
            2 => ExportKind::Method,
            tag => {
                return Err(ModuleReadError::BadTag {
                    what: "export kind",
                    tag,
                })
            }
        };

        Ok((name, kind))
    }
}

pub(super) fn prim_from_code(code: u8) -> Option<Prim> {
    use Prim::*;

    [
        Void, Bool, Char, I8, U8, I16, U16, I32, U32, I64, U64, F32,
        F64, NInt, NUInt, Str, Object,
    ]
    .into_iter()
    .find(|p| *p as u8 == code)
}

/// Read the module name and export list without interning.
pub fn scan_exports<R: Read>(
    inp: R,
) -> Result<(String, Vec<(String, ExportKind)>)> {
    let mut r = Reader { inp };

    r.magic()?;
    let name = r.str()?;

    let n = r.u32()?;
    let mut exports = Vec::with_capacity(n as usize);
    for _ in 0..n {
        exports.push(r.export_entry()?);
    }

    Ok((name, exports))
}

/// Decode a full [`Module`].
pub fn read_module<R: Read>(inp: R) -> Result<Module> {
    let mut r = Reader { inp };

    r.magic()?;
    let name = r.sym()?;

    // The export table is derived data; skip it.
    let n = r.u32()?;
    for _ in 0..n {
        r.export_entry()?;
    }

    let mut module = Module::new(name);

    let nsigs = r.u32()?;
    for _ in 0..nsigs {
        let ret = r.mty()?;
        let nparams = r.u32()?;
        let mut params = Vec::with_capacity(nparams as usize);
        for _ in 0..nparams {
            params.push(r.mty()?);
        }
        let varargs = r.u8()? != 0;

        module.add_sig(SigDef {
            ret,
            params,
            varargs,
        });
    }

    let ntypes = r.u32()?;
    for _ in 0..ntypes {
        let name = r.sym()?;
        let access = r.access()?;

        let kind = match r.u8()? {
            tag::KIND_STRUCT => {
                let layout = match r.u8()? {
                    tag::LAYOUT_SEQ => Layout::Sequential,
                    tag::LAYOUT_EXPLICIT => Layout::Explicit,
                    tag::LAYOUT_PACKED => Layout::Packed(r.u32()?),
                    tag => {
                        return Err(ModuleReadError::BadTag {
                            what: "layout",
                            tag,
                        })
                    }
                };

                let nfields = r.u32()?;
                let mut fields = Vec::with_capacity(nfields as usize);
                for _ in 0..nfields {
                    fields.push(FieldHandle(r.u32()?));
                }

                TypeKind::Struct { layout, fields }
            }
            tag::KIND_ENUM => {
                let base = r.prim()?;
                let nmembers = r.u32()?;
                let mut members = Vec::with_capacity(nmembers as usize);
                for _ in 0..nmembers {
                    let name = r.sym()?;
                    let value = r.i64()?;
                    members.push((name, value));
                }

                TypeKind::Enum { base, members }
            }
            tag::KIND_VARRAY => TypeKind::ValueArray {
                elem: r.mty()?,
                len: r.opt_u32()?,
            },
            tag => {
                return Err(ModuleReadError::BadTag {
                    what: "type kind",
                    tag,
                })
            }
        };

        module.add_type(TypeDef { name, access, kind });
    }

    let nfields = r.u32()?;
    for _ in 0..nfields {
        let name = r.sym()?;
        let access = r.access()?;
        let owner = match r.u32()? {
            NONE_U32 => None,
            i => Some(TypeHandle(i)),
        };
        let ty = r.mty()?;
        let offset = r.opt_u32()?;
        let constant = r.u8()? != 0;

        module.add_field(FieldDef {
            name,
            access,
            owner,
            ty,
            offset,
            constant,
        });
    }

    let nmethods = r.u32()?;
    for _ in 0..nmethods {
        let name = r.sym()?;
        let access = r.access()?;
        let sig = SigHandle(r.u32()?);
        let nlocals = r.u32()?;
        let mut locals = Vec::with_capacity(nlocals as usize);
        for _ in 0..nlocals {
            locals.push(r.mty()?);
        }
        let ninstrs = r.u32()?;
        let mut body = Vec::with_capacity(ninstrs as usize);
        for _ in 0..ninstrs {
            body.push(r.instr()?);
        }

        module.add_method(MethodDef {
            name,
            access,
            sig,
            locals,
            body,
        });
    }

    if let Some(entry) = r.opt_u32()? {
        if entry as usize >= module.methods().count() {
            return Err(ModuleReadError::BadHandle {
                what: "entry method",
                index: entry,
            });
        }
        module.set_entry(MethodHandle(entry));
    }

    Ok(module)
}

#[cfg(test)]
mod test {
    use super::super::write::write_module;
    use super::*;
    use crate::sym::GlobalSymbolIntern;

    fn sample_module() -> Module {
        let mut module = Module::new("sample".intern());

        let sig_main = module.add_sig(SigDef {
            ret: MTy::Prim(Prim::I32),
            params: vec![],
            varargs: false,
        });
        let sig_va = module.add_sig(SigDef {
            ret: MTy::Prim(Prim::Void),
            params: vec![MTy::Prim(Prim::Str)],
            varargs: true,
        });

        let point = module.add_type(TypeDef {
            name: "Point".intern(),
            access: Access::Public,
            kind: TypeKind::Struct {
                layout: Layout::Sequential,
                fields: vec![],
            },
        });

        let x = module.add_field(FieldDef {
            name: "x".intern(),
            access: Access::Public,
            owner: Some(point),
            ty: MTy::Prim(Prim::I32),
            offset: None,
            constant: false,
        });

        if let TypeKind::Struct { fields, .. } =
            &mut module.type_mut(point).kind
        {
            fields.push(x);
        }

        let log = module.add_method(MethodDef {
            name: "log".intern(),
            access: Access::Internal,
            sig: sig_va,
            locals: vec![],
            body: vec![Instr::Ret],
        });

        let main = module.add_method(MethodDef {
            name: "main".intern(),
            access: Access::Public,
            sig: sig_main,
            locals: vec![MTy::Pointer(Box::new(MTy::Prim(Prim::U8)))],
            body: vec![
                Instr::LdStr("hi".intern()),
                Instr::LdcI4(2),
                Instr::Call(log, Some(sig_va)),
                Instr::LdcI4(1),
                Instr::Ret,
            ],
        });
        module.set_entry(main);

        module
    }

    #[test]
    fn full_round_trip_preserves_module() {
        let module = sample_module();

        let mut buf = Vec::new();
        write_module(&module, &mut buf).unwrap();

        let read = read_module(&buf[..]).unwrap();
        assert_eq!(module, read);
    }

    #[test]
    fn scan_exports_lists_public_members() {
        let module = sample_module();

        let mut buf = Vec::new();
        write_module(&module, &mut buf).unwrap();

        let (name, exports) = scan_exports(&buf[..]).unwrap();
        assert_eq!("sample", name);
        assert_eq!(
            vec![
                ("Point".to_string(), ExportKind::Type),
                ("main".to_string(), ExportKind::Method),
            ],
            exports
        );
    }

    #[test]
    fn bad_magic_is_rejected() {
        let err = read_module(&b"NOPE"[..]).unwrap_err();
        assert!(matches!(err, ModuleReadError::BadMagic));
    }

    #[test]
    fn truncated_stream_is_an_io_error() {
        let module = sample_module();

        let mut buf = Vec::new();
        write_module(&module, &mut buf).unwrap();
        buf.truncate(buf.len() / 2);

        assert!(matches!(
            read_module(&buf[..]),
            Err(ModuleReadError::Io(_))
        ));
    }
}
