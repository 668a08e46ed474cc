// Object text parser
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

//! Recursive-descent parser for `.mo` object text.
//!
//! A unit is a sequence of declarations:
//!
//! ```text
//!   .struct public Point { int32 x; int32 y }
//!   .enum internal int32 Color { RED = 0; GREEN = 1 }
//!   .global internal int32 counter
//!   .const file float64 PI
//!   .init { .local int32 i; ldc.i4 0; stsfld counter }
//!
//!   public int32(int32:n) fact {
//!     .local int32 acc
//!     ldarg n; brtrue recurse
//!     ldc.i4 1; ret
//!   recurse:
//!     ldarg n; ldc.i4 1; sub
//!     call fact; ldarg n; mul; ret
//!   }
//! ```
//!
//! Parsing is error-collecting:
//!   a malformed statement records a [`SyntaxError`] and skips to the
//!   next declaration
//!     (consuming a balanced block if one follows),
//!   so a single bad unit reports as many of its problems as possible.
//! Callers treat any collected error as fatal to the declaring unit but
//!   not to the link as a whole.

use super::ast::*;
use super::lex::{LexError, Lexer, Statement, Tok};
use super::ty::{parse_type_name, Prim, TypeExpression, TypeNameError};
use crate::sym::{GlobalSymbolIntern, SymbolId};
use std::error::Error;
use std::fmt::{self, Display};

/// Syntax failure at a given 1-indexed line.
#[derive(Debug, PartialEq, Clone)]
pub struct SyntaxError {
    pub kind: SyntaxErrorKind,
    pub line: usize,
}

#[derive(Debug, PartialEq, Clone)]
pub enum SyntaxErrorKind {
    Lex(LexError),

    /// A composite type-name token failed to parse.
    ///
    /// The token text is carried so the offset in the inner error can be
    ///   interpreted.
    TypeName(String, TypeNameError),

    ExpectedDeclaration(String),
    ExpectedVisibility(String),
    ExpectedName(String),
    ExpectedBlock,
    UnexpectedEndOfBlock,
    UnexpectedToken(String),
    UnknownDirective(String),
    UnknownInstruction(String),
    BadInteger(String),
    BadFloat(String),
    BadPrimitive(String),
    MissingOperand(&'static str),

    /// A signature operand (`call`, `calli`, `ldftn`) did not denote a
    ///   function signature.
    ExpectedSignature(String),

    /// `ret` inside a `.init` block.
    ///
    /// Initializer bodies concatenate into a single module initializer,
    ///   so an early return would skip later units' initialization.
    RetInInitializer,
}

impl Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use SyntaxErrorKind::*;

        write!(f, "line {}: ", self.line)?;

        match &self.kind {
            Lex(e) => Display::fmt(e, f),
            TypeName(tok, e) => {
                write!(f, "in type name `{}`: {}", tok, e)
            }
            ExpectedDeclaration(tok) => {
                write!(f, "expected declaration, found {}", tok)
            }
            ExpectedVisibility(tok) => write!(
                f,
                "expected `public`, `internal`, or `file`, found {}",
                tok
            ),
            ExpectedName(what) => write!(f, "expected {} name", what),
            ExpectedBlock => f.write_str("expected `{` to open a block"),
            UnexpectedEndOfBlock => {
                f.write_str("unexpected end of input inside a block")
            }
            UnexpectedToken(tok) => {
                write!(f, "unexpected {}", tok)
            }
            UnknownDirective(d) => {
                write!(f, "unknown directive `{}`", d)
            }
            UnknownInstruction(m) => {
                write!(f, "unknown instruction `{}`", m)
            }
            BadInteger(w) => write!(f, "invalid integer `{}`", w),
            BadFloat(w) => write!(f, "invalid float `{}`", w),
            BadPrimitive(w) => {
                write!(f, "expected primitive type, found `{}`", w)
            }
            MissingOperand(mnemonic) => {
                write!(f, "missing operand for `{}`", mnemonic)
            }
            ExpectedSignature(tok) => {
                write!(f, "`{}` is not a function signature", tok)
            }
            RetInInitializer => {
                f.write_str("`ret` is not permitted in a `.init` block")
            }
        }
    }
}

impl Error for SyntaxError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.kind {
            SyntaxErrorKind::Lex(e) => Some(e),
            SyntaxErrorKind::TypeName(_, e) => Some(e),
            _ => None,
        }
    }
}

/// Parse a full unit of object text.
///
/// Returns every declaration that parsed cleanly alongside every error
///   encountered;
///     the caller decides whether errors poison the unit.
pub fn parse_unit(src: &str) -> (Vec<Declaration>, Vec<SyntaxError>) {
    let mut errors = Vec::new();
    let items = flatten(src, &mut errors);

    let mut p = Parser {
        items,
        pos: 0,
        errors,
    };
    let decls = p.parse_top();

    (decls, p.errors)
}

/// A statement stream item with brace structure broken out.
///
/// The tokenizer leaves `{` and `}` embedded within statements
///   (`ret }` is one statement);
///     the parser wants them as structural markers splitting the
///     surrounding tokens into separate lines.
#[derive(Debug)]
enum Item<'a> {
    Line(usize, Vec<Tok<'a>>),
    Open(usize),
    Close(usize),
}

fn flatten<'a>(src: &'a str, errors: &mut Vec<SyntaxError>) -> Vec<Item<'a>> {
    let mut items = Vec::new();

    for stmt in Lexer::new(src) {
        let Statement { line, toks } = match stmt {
            Ok(stmt) => stmt,
            Err(e) => {
                errors.push(SyntaxError {
                    line: e.line,
                    kind: SyntaxErrorKind::Lex(e),
                });
                continue;
            }
        };

        let mut cur = Vec::new();
        for tok in toks {
            match tok {
                Tok::OpenBrace | Tok::CloseBrace => {
                    if !cur.is_empty() {
                        items.push(Item::Line(
                            line,
                            std::mem::take(&mut cur),
                        ));
                    }
                    items.push(match tok {
                        Tok::OpenBrace => Item::Open(line),
                        _ => Item::Close(line),
                    });
                }
                other => cur.push(other),
            }
        }

        if !cur.is_empty() {
            items.push(Item::Line(line, cur));
        }
    }

    items
}

struct Parser<'a> {
    items: Vec<Item<'a>>,
    pos: usize,
    errors: Vec<SyntaxError>,
}

impl<'a> Parser<'a> {
    fn err(&mut self, line: usize, kind: SyntaxErrorKind) {
        self.errors.push(SyntaxError { kind, line });
    }

    /// Skip a balanced block if one immediately follows.
    ///
    /// Used for error recovery so a bad declaration header does not
    ///   cause its body to be misparsed as further declarations.
    fn skip_block(&mut self) {
        if !matches!(self.items.get(self.pos), Some(Item::Open(_))) {
            return;
        }
        self.pos += 1;

        let mut depth = 1usize;
        while depth > 0 {
            match self.items.get(self.pos) {
                Some(Item::Open(_)) => depth += 1,
                Some(Item::Close(_)) => depth -= 1,
                Some(Item::Line(..)) => (),
                None => return,
            }
            self.pos += 1;
        }
    }

    fn expect_open(&mut self, line: usize) -> bool {
        match self.items.get(self.pos) {
            Some(Item::Open(_)) => {
                self.pos += 1;
                true
            }
            _ => {
                self.err(line, SyntaxErrorKind::ExpectedBlock);
                false
            }
        }
    }

    fn parse_top(&mut self) -> Vec<Declaration> {
        let mut decls = Vec::new();

        while self.pos < self.items.len() {
            match &self.items[self.pos] {
                Item::Open(line) => {
                    let line = *line;
                    self.err(
                        line,
                        SyntaxErrorKind::UnexpectedToken("`{`".into()),
                    );
                    self.skip_block();
                }
                Item::Close(line) => {
                    let line = *line;
                    self.pos += 1;
                    self.err(
                        line,
                        SyntaxErrorKind::UnexpectedToken("`}`".into()),
                    );
                }
                Item::Line(..) => {
                    if let Some(decl) = self.parse_decl() {
                        decls.push(decl);
                    }
                }
            }
        }

        decls
    }

    fn parse_decl(&mut self) -> Option<Declaration> {
        let (line, toks) = match &self.items[self.pos] {
            Item::Line(line, toks) => (*line, toks.clone()),
            _ => unreachable!("parse_decl called on non-line item"),
        };
        self.pos += 1;

        let head = match toks.first().and_then(Tok::word) {
            Some(w) => w,
            None => {
                self.err(
                    line,
                    SyntaxErrorKind::ExpectedDeclaration(
                        toks.first()
                            .map(|t| t.to_string())
                            .unwrap_or_default(),
                    ),
                );
                return None;
            }
        };

        match head {
            ".struct" => self.parse_struct(line, &toks),
            ".enum" => self.parse_enum(line, &toks),
            ".global" => self.parse_global(line, &toks, false),
            ".const" => self.parse_global(line, &toks, true),
            ".init" => self.parse_init(line, &toks),
            d if d.starts_with('.') => {
                self.err(
                    line,
                    SyntaxErrorKind::UnknownDirective(d.into()),
                );
                self.skip_block();
                None
            }
            _ => self.parse_function(line, &toks),
        }
    }

    fn visibility(
        &mut self,
        line: usize,
        tok: Option<&Tok<'a>>,
    ) -> Option<Visibility> {
        match tok.and_then(Tok::word) {
            Some("public") => Some(Visibility::Public),
            Some("internal") => Some(Visibility::Internal),
            Some("file") => Some(Visibility::File),
            other => {
                self.err(
                    line,
                    SyntaxErrorKind::ExpectedVisibility(
                        other
                            .map(str::to_owned)
                            .or_else(|| tok.map(|t| t.to_string()))
                            .unwrap_or_default(),
                    ),
                );
                None
            }
        }
    }

    fn name(
        &mut self,
        line: usize,
        tok: Option<&Tok<'a>>,
        what: &str,
    ) -> Option<SymbolId> {
        match tok.and_then(Tok::word) {
            Some(w) if !w.is_empty() && !w.starts_with('.') => {
                Some(w.intern())
            }
            _ => {
                self.err(
                    line,
                    SyntaxErrorKind::ExpectedName(what.into()),
                );
                None
            }
        }
    }

    fn type_name(
        &mut self,
        line: usize,
        tok: Option<&Tok<'a>>,
    ) -> Option<TypeExpression> {
        let word = match tok.and_then(Tok::word) {
            Some(w) => w,
            None => {
                self.err(
                    line,
                    SyntaxErrorKind::ExpectedName("type".into()),
                );
                return None;
            }
        };

        match parse_type_name(word) {
            Ok(ty) => Some(ty),
            Err(e) => {
                self.err(
                    line,
                    SyntaxErrorKind::TypeName(word.into(), e),
                );
                None
            }
        }
    }

    fn prim(
        &mut self,
        line: usize,
        tok: Option<&Tok<'a>>,
        mnemonic: &'static str,
    ) -> Option<Prim> {
        let word = match tok.and_then(Tok::word) {
            Some(w) => w,
            None => {
                self.err(line, SyntaxErrorKind::MissingOperand(mnemonic));
                return None;
            }
        };

        match Prim::from_sym(word.intern()) {
            Some(p) => Some(p),
            None => {
                self.err(
                    line,
                    SyntaxErrorKind::BadPrimitive(word.into()),
                );
                None
            }
        }
    }

    fn parse_struct(
        &mut self,
        line: usize,
        toks: &[Tok<'a>],
    ) -> Option<Declaration> {
        let vis = self.visibility(line, toks.get(1));
        let name = self.name(line, toks.get(2), "structure");

        let mut layout = LayoutSpec::Sequential;
        let mut rest = toks[3.min(toks.len())..].iter();
        let mut header_ok = vis.is_some() && name.is_some();

        while let Some(tok) = rest.next() {
            match tok.word() {
                Some("explicit") => layout = LayoutSpec::Explicit,
                Some("pack") => {
                    // `pack=N` lexes as three tokens.
                    let n = match (rest.next(), rest.next()) {
                        (Some(Tok::Equals), Some(tok)) => {
                            self.u32_word(line, tok.word())
                        }
                        _ => {
                            self.err(
                                line,
                                SyntaxErrorKind::UnexpectedToken(
                                    "`pack` without `=N`".into(),
                                ),
                            );
                            None
                        }
                    };

                    match n {
                        Some(n) => layout = LayoutSpec::Packed(n),
                        None => header_ok = false,
                    }
                }
                _ => {
                    self.err(
                        line,
                        SyntaxErrorKind::UnexpectedToken(tok.to_string()),
                    );
                    header_ok = false;
                }
            }
        }

        if !self.expect_open(line) {
            return None;
        }

        let fields = self.parse_struct_fields();

        if !header_ok {
            return None;
        }

        Some(Declaration::Struct(StructDecl {
            name: name?,
            vis: vis?,
            layout,
            fields,
        }))
    }

    fn parse_struct_fields(&mut self) -> Vec<FieldDecl> {
        let mut fields = Vec::new();

        loop {
            match self.items.get(self.pos) {
                Some(Item::Close(_)) => {
                    self.pos += 1;
                    return fields;
                }
                Some(Item::Open(line)) => {
                    let line = *line;
                    self.err(
                        line,
                        SyntaxErrorKind::UnexpectedToken("`{`".into()),
                    );
                    self.skip_block();
                }
                Some(Item::Line(line, toks)) => {
                    let (line, toks) = (*line, toks.clone());
                    self.pos += 1;

                    if let Some(field) = self.parse_field(line, &toks) {
                        fields.push(field);
                    }
                }
                None => {
                    let line = self
                        .items
                        .last()
                        .map(item_line)
                        .unwrap_or(0);
                    self.err(line, SyntaxErrorKind::UnexpectedEndOfBlock);
                    return fields;
                }
            }
        }
    }

    fn parse_field(
        &mut self,
        line: usize,
        toks: &[Tok<'a>],
    ) -> Option<FieldDecl> {
        let ty = self.type_name(line, toks.first())?;
        let name = self.name(line, toks.get(1), "field")?;

        let offset = match toks.get(2) {
            None => None,
            Some(Tok::At) => {
                let n = self.u32_word(
                    line,
                    toks.get(3).and_then(Tok::word),
                )?;
                if toks.len() > 4 {
                    self.err(
                        line,
                        SyntaxErrorKind::UnexpectedToken(
                            toks[4].to_string(),
                        ),
                    );
                    return None;
                }
                Some(n)
            }
            Some(other) => {
                self.err(
                    line,
                    SyntaxErrorKind::UnexpectedToken(other.to_string()),
                );
                return None;
            }
        };

        Some(FieldDecl { name, ty, offset })
    }

    fn parse_enum(
        &mut self,
        line: usize,
        toks: &[Tok<'a>],
    ) -> Option<Declaration> {
        let vis = self.visibility(line, toks.get(1));
        let base = self.prim(line, toks.get(2), ".enum");
        let name = self.name(line, toks.get(3), "enumeration");

        if let Some(extra) = toks.get(4) {
            self.err(
                line,
                SyntaxErrorKind::UnexpectedToken(extra.to_string()),
            );
        }

        if !self.expect_open(line) {
            return None;
        }

        let mut members = Vec::new();
        loop {
            match self.items.get(self.pos) {
                Some(Item::Close(_)) => {
                    self.pos += 1;
                    break;
                }
                Some(Item::Line(mline, mtoks)) => {
                    let (mline, mtoks) = (*mline, mtoks.clone());
                    self.pos += 1;

                    let member = (|| {
                        let name =
                            self.name(mline, mtoks.first(), "member")?;
                        match mtoks.get(1) {
                            Some(Tok::Equals) => (),
                            _ => {
                                self.err(
                                    mline,
                                    SyntaxErrorKind::UnexpectedToken(
                                        mtoks
                                            .get(1)
                                            .map(|t| t.to_string())
                                            .unwrap_or_else(|| {
                                                "end of statement".into()
                                            }),
                                    ),
                                );
                                return None;
                            }
                        }
                        let value = self.i64_word(
                            mline,
                            mtoks.get(2).and_then(Tok::word),
                        )?;
                        Some(EnumMember { name, value })
                    })();

                    if let Some(member) = member {
                        members.push(member);
                    }
                }
                Some(Item::Open(oline)) => {
                    let oline = *oline;
                    self.err(
                        oline,
                        SyntaxErrorKind::UnexpectedToken("`{`".into()),
                    );
                    self.skip_block();
                }
                None => {
                    self.err(line, SyntaxErrorKind::UnexpectedEndOfBlock);
                    break;
                }
            }
        }

        Some(Declaration::Enum(EnumDecl {
            name: name?,
            vis: vis?,
            base: base?,
            members,
        }))
    }

    fn parse_global(
        &mut self,
        line: usize,
        toks: &[Tok<'a>],
        constant: bool,
    ) -> Option<Declaration> {
        let vis = self.visibility(line, toks.get(1));
        let ty = self.type_name(line, toks.get(2));
        let name = self.name(
            line,
            toks.get(3),
            if constant { "constant" } else { "global" },
        );

        if let Some(extra) = toks.get(4) {
            self.err(
                line,
                SyntaxErrorKind::UnexpectedToken(extra.to_string()),
            );
            return None;
        }

        Some(Declaration::Global(GlobalDecl {
            name: name?,
            vis: vis?,
            ty: ty?,
            constant,
        }))
    }

    fn parse_init(
        &mut self,
        line: usize,
        toks: &[Tok<'a>],
    ) -> Option<Declaration> {
        if let Some(extra) = toks.get(1) {
            self.err(
                line,
                SyntaxErrorKind::UnexpectedToken(extra.to_string()),
            );
        }

        if !self.expect_open(line) {
            return None;
        }

        let (locals, body) = self.parse_body(false);

        Some(Declaration::Init(InitDecl { locals, body }))
    }

    fn parse_function(
        &mut self,
        line: usize,
        toks: &[Tok<'a>],
    ) -> Option<Declaration> {
        let vis = self.visibility(line, toks.first());
        let sig_ty = self.type_name(line, toks.get(1));
        let name = self.name(line, toks.get(2), "function");

        if let Some(extra) = toks.get(3) {
            self.err(
                line,
                SyntaxErrorKind::UnexpectedToken(extra.to_string()),
            );
        }

        let sig = match sig_ty {
            Some(ty) => match ty.as_signature() {
                Some(sig) => Some(sig.clone()),
                None => {
                    self.err(
                        line,
                        SyntaxErrorKind::ExpectedSignature(
                            ty.to_string(),
                        ),
                    );
                    None
                }
            },
            None => None,
        };

        if !self.expect_open(line) {
            self.skip_block();
            return None;
        }

        let (locals, body) = self.parse_body(true);

        Some(Declaration::Function(FunctionDecl {
            name: name?,
            vis: vis?,
            sig: sig?,
            locals,
            body,
        }))
    }

    /// Parse a function or initializer body up to its closing brace.
    fn parse_body(
        &mut self,
        allow_ret: bool,
    ) -> (Vec<LocalDecl>, Vec<BodyItem>) {
        let mut locals = Vec::new();
        let mut body = Vec::new();

        loop {
            match self.items.get(self.pos) {
                Some(Item::Close(_)) => {
                    self.pos += 1;
                    return (locals, body);
                }
                Some(Item::Open(line)) => {
                    let line = *line;
                    self.err(
                        line,
                        SyntaxErrorKind::UnexpectedToken("`{`".into()),
                    );
                    self.skip_block();
                }
                Some(Item::Line(line, toks)) => {
                    let (line, toks) = (*line, toks.clone());
                    self.pos += 1;
                    self.parse_body_stmt(
                        line, &toks, allow_ret, &mut locals, &mut body,
                    );
                }
                None => {
                    let line =
                        self.items.last().map(item_line).unwrap_or(0);
                    self.err(line, SyntaxErrorKind::UnexpectedEndOfBlock);
                    return (locals, body);
                }
            }
        }
    }

    fn parse_body_stmt(
        &mut self,
        line: usize,
        toks: &[Tok<'a>],
        allow_ret: bool,
        locals: &mut Vec<LocalDecl>,
        body: &mut Vec<BodyItem>,
    ) {
        let head = match toks.first().and_then(Tok::word) {
            Some(w) => w,
            None => {
                self.err(
                    line,
                    SyntaxErrorKind::UnexpectedToken(
                        toks.first()
                            .map(|t| t.to_string())
                            .unwrap_or_default(),
                    ),
                );
                return;
            }
        };

        if head == ".local" {
            let ty = self.type_name(line, toks.get(1));
            let name = self.name(line, toks.get(2), "local");

            if let (Some(ty), Some(name)) = (ty, name) {
                locals.push(LocalDecl { name, ty });
            }
            return;
        }

        let mut toks = toks;

        // A leading `name:` is a label; an instruction may follow on the
        //   same statement.
        if let Some(label) = head.strip_suffix(':') {
            if label.is_empty() {
                self.err(
                    line,
                    SyntaxErrorKind::ExpectedName("label".into()),
                );
                return;
            }

            body.push(BodyItem::Label(label.intern()));
            toks = &toks[1..];

            if toks.is_empty() {
                return;
            }
        }

        if let Some(op) = self.parse_instr(line, toks, allow_ret) {
            body.push(BodyItem::Instr(op));
        }
    }

    fn parse_instr(
        &mut self,
        line: usize,
        toks: &[Tok<'a>],
        allow_ret: bool,
    ) -> Option<Op> {
        let mnemonic = toks.first().and_then(Tok::word)?;

        let operand_word = |i: usize| toks.get(i).and_then(Tok::word);

        macro_rules! name_operand {
            ($mn:expr) => {
                match operand_word(1) {
                    Some(w) => w.intern(),
                    None => {
                        self.err(
                            line,
                            SyntaxErrorKind::MissingOperand($mn),
                        );
                        return None;
                    }
                }
            };
        }

        let op = match mnemonic {
            "nop" => Op::Nop,
            "dup" => Op::Dup,
            "pop" => Op::Pop,
            "ret" => {
                if !allow_ret {
                    self.err(line, SyntaxErrorKind::RetInInitializer);
                    return None;
                }
                Op::Ret
            }

            "ldnull" => Op::LdNull,
            "ldc.i4" => {
                Op::LdcI4(self.i32_word(line, operand_word(1))?)
            }
            "ldc.i8" => {
                Op::LdcI8(self.i64_word(line, operand_word(1))?)
            }
            "ldc.r8" => {
                Op::LdcR8(self.f64_word(line, operand_word(1))?)
            }
            "ldstr" => match toks.get(1) {
                Some(Tok::Str(s)) => Op::LdStr(s.as_str().intern()),
                _ => {
                    self.err(
                        line,
                        SyntaxErrorKind::MissingOperand("ldstr"),
                    );
                    return None;
                }
            },

            "ldloc" => Op::LdLoc(name_operand!("ldloc")),
            "stloc" => Op::StLoc(name_operand!("stloc")),
            "ldloca" => Op::LdLocA(name_operand!("ldloca")),

            "ldarg" => Op::LdArg(self.arg_ref(line, operand_word(1))?),
            "starg" => Op::StArg(self.arg_ref(line, operand_word(1))?),

            "ldsfld" => Op::LdsFld(name_operand!("ldsfld")),
            "stsfld" => Op::StsFld(name_operand!("stsfld")),
            "ldsflda" => Op::LdsFldA(name_operand!("ldsflda")),

            "ldfld" | "stfld" | "ldflda" => {
                let (ty, fld) = match (operand_word(1), operand_word(2)) {
                    (Some(ty), Some(fld)) => (ty.intern(), fld.intern()),
                    _ => {
                        self.err(
                            line,
                            SyntaxErrorKind::MissingOperand(
                                match mnemonic {
                                    "ldfld" => "ldfld",
                                    "stfld" => "stfld",
                                    _ => "ldflda",
                                },
                            ),
                        );
                        return None;
                    }
                };

                match mnemonic {
                    "ldfld" => Op::LdFld(ty, fld),
                    "stfld" => Op::StFld(ty, fld),
                    _ => Op::LdFldA(ty, fld),
                }
            }

            "call" | "ldftn" => {
                // One operand is a bare callee name; two operands are a
                //   call-site signature followed by the name.
                let (sig, name) = match (operand_word(1), operand_word(2))
                {
                    (Some(name), None) => (None, name.intern()),
                    (Some(sig), Some(name)) => (
                        Some(self.signature(line, sig)?),
                        name.intern(),
                    ),
                    _ => {
                        self.err(
                            line,
                            SyntaxErrorKind::MissingOperand(
                                if mnemonic == "call" {
                                    "call"
                                } else {
                                    "ldftn"
                                },
                            ),
                        );
                        return None;
                    }
                };

                if mnemonic == "call" {
                    Op::Call { sig, name }
                } else {
                    Op::LdFtn { sig, name }
                }
            }

            "calli" => {
                let sig = match operand_word(1) {
                    Some(w) => self.signature(line, w)?,
                    None => {
                        self.err(
                            line,
                            SyntaxErrorKind::MissingOperand("calli"),
                        );
                        return None;
                    }
                };
                Op::CallI { sig }
            }

            "br" => Op::Br(name_operand!("br")),
            "brtrue" => Op::BrTrue(name_operand!("brtrue")),
            "brfalse" => Op::BrFalse(name_operand!("brfalse")),

            "add" => Op::Add,
            "sub" => Op::Sub,
            "mul" => Op::Mul,
            "div" => Op::Div,
            "rem" => Op::Rem,
            "neg" => Op::Neg,
            "and" => Op::And,
            "or" => Op::Or,
            "xor" => Op::Xor,
            "shl" => Op::Shl,
            "shr" => Op::Shr,
            "not" => Op::Not,

            "ceq" => Op::Ceq,
            "clt" => Op::Clt,
            "cgt" => Op::Cgt,

            "conv" => Op::Conv(self.prim(line, toks.get(1), "conv")?),

            "sizeof" => {
                let ty = self.type_name(line, toks.get(1))?;
                Op::SizeOf(ty)
            }

            "ldind" => Op::LdInd(self.prim(line, toks.get(1), "ldind")?),
            "stind" => Op::StInd(self.prim(line, toks.get(1), "stind")?),

            "va.start" => Op::VaStart,
            "va.arg" => {
                let ty = self.type_name(line, toks.get(1))?;
                Op::VaArg(ty)
            }
            "va.end" => Op::VaEnd,

            other => {
                self.err(
                    line,
                    SyntaxErrorKind::UnknownInstruction(other.into()),
                );
                return None;
            }
        };

        Some(op)
    }

    fn signature(
        &mut self,
        line: usize,
        word: &str,
    ) -> Option<super::ty::Signature> {
        let ty = match parse_type_name(word) {
            Ok(ty) => ty,
            Err(e) => {
                self.err(
                    line,
                    SyntaxErrorKind::TypeName(word.into(), e),
                );
                return None;
            }
        };

        match ty.as_signature() {
            Some(sig) => Some(sig.clone()),
            None => {
                self.err(
                    line,
                    SyntaxErrorKind::ExpectedSignature(word.into()),
                );
                None
            }
        }
    }

    fn arg_ref(
        &mut self,
        line: usize,
        word: Option<&str>,
    ) -> Option<ArgRef> {
        let word = match word {
            Some(w) => w,
            None => {
                self.err(line, SyntaxErrorKind::MissingOperand("ldarg"));
                return None;
            }
        };

        if word.bytes().all(|b| b.is_ascii_digit()) {
            match word.parse::<u16>() {
                Ok(n) => Some(ArgRef::Index(n)),
                Err(_) => {
                    self.err(
                        line,
                        SyntaxErrorKind::BadInteger(word.into()),
                    );
                    None
                }
            }
        } else {
            Some(ArgRef::Name(word.intern()))
        }
    }

    fn i64_word(
        &mut self,
        line: usize,
        word: Option<&str>,
    ) -> Option<i64> {
        let word = match word {
            Some(w) => w,
            None => {
                self.err(
                    line,
                    SyntaxErrorKind::BadInteger("".into()),
                );
                return None;
            }
        };

        let parsed = if let Some(hex) = word.strip_prefix("0x") {
            i64::from_str_radix(hex, 16).ok()
        } else if let Some(hex) = word.strip_prefix("-0x") {
            i64::from_str_radix(hex, 16).ok().map(|v| -v)
        } else {
            word.parse().ok()
        };

        match parsed {
            Some(v) => Some(v),
            None => {
                self.err(line, SyntaxErrorKind::BadInteger(word.into()));
                None
            }
        }
    }

    fn i32_word(
        &mut self,
        line: usize,
        word: Option<&str>,
    ) -> Option<i32> {
        let word_owned = word.map(str::to_owned);
        let v = self.i64_word(line, word)?;

        match i32::try_from(v) {
            Ok(v) => Some(v),
            Err(_) => {
                self.err(
                    line,
                    SyntaxErrorKind::BadInteger(
                        word_owned.unwrap_or_default(),
                    ),
                );
                None
            }
        }
    }

    fn u32_word(
        &mut self,
        line: usize,
        word: Option<&str>,
    ) -> Option<u32> {
        let word = match word {
            Some(w) => w,
            None => {
                self.err(
                    line,
                    SyntaxErrorKind::BadInteger("".into()),
                );
                return None;
            }
        };

        let parsed = if let Some(hex) = word.strip_prefix("0x") {
            u32::from_str_radix(hex, 16).ok()
        } else {
            word.parse().ok()
        };

        match parsed {
            Some(v) => Some(v),
            None => {
                self.err(line, SyntaxErrorKind::BadInteger(word.into()));
                None
            }
        }
    }

    fn f64_word(
        &mut self,
        line: usize,
        word: Option<&str>,
    ) -> Option<f64> {
        let word = match word {
            Some(w) => w,
            None => {
                self.err(line, SyntaxErrorKind::BadFloat("".into()));
                return None;
            }
        };

        match word.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                self.err(line, SyntaxErrorKind::BadFloat(word.into()));
                None
            }
        }
    }
}

fn item_line(item: &Item) -> usize {
    match item {
        Item::Line(line, _) | Item::Open(line) | Item::Close(line) => *line,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::asm::ty::ArrayLen;

    fn parse_ok(src: &str) -> Vec<Declaration> {
        let (decls, errors) = parse_unit(src);
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
        decls
    }

    #[test]
    fn parses_struct_with_fields() {
        let decls =
            parse_ok(".struct public Point { int32 x; int32 y }");

        let Declaration::Struct(s) = &decls[0] else {
            panic!("expected struct");
        };

        assert_eq!("Point".intern(), s.name);
        assert_eq!(Visibility::Public, s.vis);
        assert_eq!(LayoutSpec::Sequential, s.layout);
        assert_eq!(2, s.fields.len());
        assert_eq!("x".intern(), s.fields[0].name);
        assert_eq!(None, s.fields[0].offset);
    }

    #[test]
    fn parses_explicit_layout_with_offsets() {
        let decls = parse_ok(
            ".struct internal Overlay explicit {\n\
             int32 word @ 0\n\
             int16 lo @ 0\n\
             }",
        );

        let Declaration::Struct(s) = &decls[0] else {
            panic!("expected struct");
        };

        assert_eq!(LayoutSpec::Explicit, s.layout);
        assert_eq!(Some(0), s.fields[0].offset);
        assert_eq!(Some(0), s.fields[1].offset);
    }

    #[test]
    fn parses_packed_layout() {
        let decls =
            parse_ok(".struct file Tight pack=1 { int64 v; int8 b }");

        let Declaration::Struct(s) = &decls[0] else {
            panic!("expected struct");
        };
        assert_eq!(LayoutSpec::Packed(1), s.layout);
    }

    #[test]
    fn parses_enum() {
        let decls = parse_ok(
            ".enum internal int32 Color { RED = 0; GREEN = 1; BLUE = 2 }",
        );

        let Declaration::Enum(e) = &decls[0] else {
            panic!("expected enum");
        };

        assert_eq!(Prim::I32, e.base);
        assert_eq!(3, e.members.len());
        assert_eq!(
            EnumMember {
                name: "GREEN".intern(),
                value: 1
            },
            e.members[1]
        );
    }

    #[test]
    fn parses_globals_and_constants() {
        let decls = parse_ok(
            ".global internal int32 counter\n.const public float64 PI",
        );

        let Declaration::Global(g) = &decls[0] else {
            panic!("expected global");
        };
        assert!(!g.constant);

        let Declaration::Global(c) = &decls[1] else {
            panic!("expected const");
        };
        assert!(c.constant);
        assert_eq!("PI".intern(), c.name);
    }

    #[test]
    fn parses_function_with_body() {
        let decls =
            parse_ok("public int32() main { call foo; ldc.i4 1; ret }");

        let Declaration::Function(f) = &decls[0] else {
            panic!("expected function");
        };

        assert_eq!("main".intern(), f.name);
        assert!(f.sig.params.is_empty());
        assert_eq!(
            vec![
                BodyItem::Instr(Op::Call {
                    sig: None,
                    name: "foo".intern()
                }),
                BodyItem::Instr(Op::LdcI4(1)),
                BodyItem::Instr(Op::Ret),
            ],
            f.body
        );
    }

    #[test]
    fn parses_labels_and_locals() {
        let decls = parse_ok(
            "file int32(int32:n) loop {\n\
             .local int32 acc\n\
             top: ldloc acc; brtrue top\n\
             ret\n\
             }",
        );

        let Declaration::Function(f) = &decls[0] else {
            panic!("expected function");
        };

        assert_eq!(1, f.locals.len());
        assert_eq!("acc".intern(), f.locals[0].name);
        assert_eq!(BodyItem::Label("top".intern()), f.body[0]);
        assert_eq!(BodyItem::Instr(Op::BrTrue("top".intern())), f.body[2]);
    }

    #[test]
    fn parses_call_with_site_signature() {
        let decls = parse_ok(
            "public void() go { call int32(int32,...) printf_like; pop; ret }",
        );

        let Declaration::Function(f) = &decls[0] else {
            panic!("expected function");
        };

        let BodyItem::Instr(Op::Call { sig: Some(sig), name }) = &f.body[0]
        else {
            panic!("expected call with signature");
        };

        assert!(sig.varargs);
        assert_eq!("printf_like".intern(), *name);
    }

    #[test]
    fn parses_init_block() {
        let decls = parse_ok(".init { ldc.i4 7; stsfld counter }");

        let Declaration::Init(init) = &decls[0] else {
            panic!("expected init");
        };
        assert_eq!(2, init.body.len());
    }

    #[test]
    fn ret_in_init_is_an_error() {
        let (_, errors) = parse_unit(".init { ret }");

        assert!(errors
            .iter()
            .any(|e| e.kind == SyntaxErrorKind::RetInInitializer));
    }

    #[test]
    fn parses_ldstr_and_sizeof() {
        let decls = parse_ok(
            "public void() greet {\n\
             ldstr \"hi\\n\"; pop\n\
             sizeof int32[6]; pop\n\
             ret\n\
             }",
        );

        let Declaration::Function(f) = &decls[0] else {
            panic!("expected function");
        };

        assert_eq!(BodyItem::Instr(Op::LdStr("hi\n".intern())), f.body[0]);

        let BodyItem::Instr(Op::SizeOf(TypeExpression::Array(_, len))) =
            &f.body[2]
        else {
            panic!("expected sizeof array");
        };
        assert_eq!(ArrayLen::Fixed(6), *len);
    }

    #[test]
    fn recovers_after_bad_declaration() {
        let (decls, errors) = parse_unit(
            ".bogus whatever { junk }\n\
             .global internal int32 ok",
        );

        assert!(errors
            .iter()
            .any(|e| matches!(e.kind, SyntaxErrorKind::UnknownDirective(_))));
        assert_eq!(1, decls.len());
        assert_eq!(Some("ok".intern()), decls[0].name());
    }

    #[test]
    fn unknown_instruction_reported_with_line() {
        let (_, errors) =
            parse_unit("public void() f {\nfrobnicate\nret\n}");

        let err = errors
            .iter()
            .find(|e| {
                matches!(e.kind, SyntaxErrorKind::UnknownInstruction(_))
            })
            .expect("missing error");
        assert_eq!(2, err.line);
    }

    #[test]
    fn bad_type_name_reports_offset() {
        let (_, errors) = parse_unit(".global public int32[ oops");

        assert!(errors
            .iter()
            .any(|e| matches!(e.kind, SyntaxErrorKind::TypeName(..))));
    }

    #[test]
    fn collects_multiple_errors() {
        let (_, errors) = parse_unit(
            "public void() f { frobnicate; ret }\n\
             .enum internal notaprim Color { RED = 0 }",
        );

        assert!(errors.len() >= 2);
    }
}
