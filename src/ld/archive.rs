// Static archive container
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

//! Static `.ma` archive container.
//!
//! Layout:
//!
//! ```text
//!   identity tag "MAR\x01"
//!   entries: (u32-prefixed member name, u32-prefixed body bytes)*
//!   empty-name sentinel (u32 zero)
//!   u32 length + DEFLATE-compressed symbol table
//! ```
//!
//! The symbol table is line-oriented:
//!   a `.object <member>` header per member,
//!   followed by one indented `<directive> <scope> <name>` line per
//!   linkable symbol the member defines.
//! `file`-scoped symbols are never indexed;
//!     nothing outside the member could demand them.
//!
//! Laziness contract:
//!   [`ArchiveFile::read`] decodes entry framing and the trailing table
//!   but never parses member bodies;
//!     [`ArchiveFile::parse_member`] parses exactly one body,
//!     and the caller caches the result so each member is parsed at most
//!     once per link.
//! [`ArchiveFile::parse_count`] exposes how many parses have occurred,
//!   which is also what the laziness tests probe.

use crate::asm::ast::{Declaration, Visibility};
use crate::asm::parse::{parse_unit, SyntaxError};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::error::Error;
use std::fmt::{self, Display};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 4] = b"MAR\x01";

/// What kind of definition an index entry advertises.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum IndexKind {
    Struct,
    Enum,
    Global,
    Const,
    Func,
}

impl IndexKind {
    fn directive(self) -> &'static str {
        match self {
            Self::Struct => "struct",
            Self::Enum => "enum",
            Self::Global => "global",
            Self::Const => "const",
            Self::Func => "func",
        }
    }

    fn from_directive(s: &str) -> Option<Self> {
        match s {
            "struct" => Some(Self::Struct),
            "enum" => Some(Self::Enum),
            "global" => Some(Self::Global),
            "const" => Some(Self::Const),
            "func" => Some(Self::Func),
            _ => None,
        }
    }
}

/// One line of the trailing symbol table.
#[derive(Debug, PartialEq, Clone)]
pub struct IndexEntry {
    pub name: String,
    pub member: usize,
    pub kind: IndexKind,
    pub scope: Visibility,
}

/// Archive decode failure.
#[derive(Debug)]
pub enum ArchiveError {
    Io(io::Error),
    BadMagic(PathBuf),
    BadUtf8(PathBuf),

    /// A symbol table line that fits no known form.
    BadIndexLine(PathBuf, String),

    /// Member ordinal out of range for a pull.
    NoSuchMember(PathBuf, usize),
}

impl Display for ArchiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "archive read failed: {}", e),
            Self::BadMagic(path) => {
                write!(f, "{} is not an archive", path.display())
            }
            Self::BadUtf8(path) => write!(
                f,
                "malformed text in archive {}",
                path.display()
            ),
            Self::BadIndexLine(path, line) => write!(
                f,
                "bad symbol table line in {}: `{}`",
                path.display(),
                line
            ),
            Self::NoSuchMember(path, i) => write!(
                f,
                "archive {} has no member #{}",
                path.display(),
                i
            ),
        }
    }
}

impl Error for ArchiveError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ArchiveError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

#[derive(Debug)]
struct Member {
    name: String,
    body: Vec<u8>,
}

/// A loaded archive with its symbol index.
///
/// Member bodies are held as raw bytes;
///   they are parsed only through [`parse_member`](Self::parse_member).
#[derive(Debug)]
pub struct ArchiveFile {
    path: PathBuf,
    members: Vec<Member>,
    index: Vec<IndexEntry>,
    parse_count: usize,
}

impl ArchiveFile {
    /// Decode an archive from `inp`.
    ///
    /// `path` is carried for diagnostics only.
    pub fn read<R: Read>(
        path: PathBuf,
        mut inp: R,
    ) -> Result<Self, ArchiveError> {
        let mut magic = [0u8; 4];
        inp.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(ArchiveError::BadMagic(path));
        }

        let mut members = Vec::new();
        loop {
            let name_len = read_u32(&mut inp)? as usize;
            if name_len == 0 {
                break;
            }

            let mut name = vec![0u8; name_len];
            inp.read_exact(&mut name)?;
            let name = String::from_utf8(name)
                .map_err(|_| ArchiveError::BadUtf8(path.clone()))?;

            let body_len = read_u32(&mut inp)? as usize;
            let mut body = vec![0u8; body_len];
            inp.read_exact(&mut body)?;

            members.push(Member { name, body });
        }

        let table_len = read_u32(&mut inp)? as usize;
        let mut compressed = vec![0u8; table_len];
        inp.read_exact(&mut compressed)?;

        let mut table = String::new();
        DeflateDecoder::new(&compressed[..])
            .read_to_string(&mut table)
            .map_err(|_| ArchiveError::BadUtf8(path.clone()))?;

        let index = parse_index(&path, &table, &members)?;

        Ok(Self {
            path,
            members,
            index,
            parse_count: 0,
        })
    }

    /// Symbol index entries in table order.
    pub fn index(&self) -> &[IndexEntry] {
        &self.index
    }

    /// Member ordinal defining `name`,
    ///   if any.
    pub fn member_defining(&self, name: &str) -> Option<&IndexEntry> {
        self.index.iter().find(|e| e.name == name)
    }

    pub fn member_name(&self, member: usize) -> Option<&str> {
        self.members.get(member).map(|m| m.name.as_str())
    }

    /// Parse one member body into declarations.
    ///
    /// Each call parses;
    ///   idempotence is the caller's caching responsibility,
    ///   and [`parse_count`](Self::parse_count) will tell on a caller
    ///   that pulls eagerly.
    pub fn parse_member(
        &mut self,
        member: usize,
    ) -> Result<(Vec<Declaration>, Vec<SyntaxError>), ArchiveError> {
        let m = self.members.get(member).ok_or_else(|| {
            ArchiveError::NoSuchMember(self.path.clone(), member)
        })?;

        let text = std::str::from_utf8(&m.body)
            .map_err(|_| ArchiveError::BadUtf8(self.path.clone()))?;

        self.parse_count += 1;
        Ok(parse_unit(text))
    }

    /// Number of member parses performed so far.
    pub fn parse_count(&self) -> usize {
        self.parse_count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_u32<R: Read>(inp: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    inp.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn parse_index(
    path: &PathBuf,
    table: &str,
    members: &[Member],
) -> Result<Vec<IndexEntry>, ArchiveError> {
    let mut entries = Vec::new();
    let mut current: Option<usize> = None;

    for line in table.lines() {
        if line.trim().is_empty() {
            continue;
        }

        let bad = || {
            ArchiveError::BadIndexLine(path.clone(), line.to_string())
        };

        if let Some(member) = line.strip_prefix(".object ") {
            let member = member.trim();
            current = Some(
                members
                    .iter()
                    .position(|m| m.name == member)
                    .ok_or_else(bad)?,
            );
            continue;
        }

        if !line.starts_with(char::is_whitespace) {
            return Err(bad());
        }

        let member = current.ok_or_else(bad)?;
        let mut words = line.split_whitespace();

        let kind = words
            .next()
            .and_then(IndexKind::from_directive)
            .ok_or_else(bad)?;
        let scope = match words.next() {
            Some("public") => Visibility::Public,
            Some("internal") => Visibility::Internal,
            _ => return Err(bad()),
        };
        let name = words.next().ok_or_else(bad)?.to_string();

        entries.push(IndexEntry {
            name,
            member,
            kind,
            scope,
        });
    }

    Ok(entries)
}

/// Archive creation failure.
#[derive(Debug)]
pub enum ArchiveBuildError {
    Io(io::Error),

    /// A member failed to parse;
    ///   the index cannot be derived from broken object text.
    Syntax(String, Vec<SyntaxError>),
}

impl Display for ArchiveBuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "archive write failed: {}", e),
            Self::Syntax(member, errors) => {
                write!(
                    f,
                    "member {} has {} syntax error(s); first: {}",
                    member,
                    errors.len(),
                    errors[0]
                )
            }
        }
    }
}

impl Error for ArchiveBuildError {}

impl From<io::Error> for ArchiveBuildError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Build an archive from named object text members.
///
/// Each member is parsed once to derive its index lines;
///   `file`-scoped declarations are omitted from the table.
pub fn write_archive<W: Write>(
    members: &[(String, String)],
    mut out: W,
) -> Result<(), ArchiveBuildError> {
    use crate::sym::GlobalSymbolResolve;

    let mut table = String::new();

    for (name, text) in members {
        let (decls, errors) = parse_unit(text);
        if !errors.is_empty() {
            return Err(ArchiveBuildError::Syntax(name.clone(), errors));
        }

        table.push_str(".object ");
        table.push_str(name);
        table.push('\n');

        for decl in &decls {
            let (kind, vis, sym) = match decl {
                Declaration::Struct(d) => {
                    (IndexKind::Struct, d.vis, d.name)
                }
                Declaration::Enum(d) => (IndexKind::Enum, d.vis, d.name),
                Declaration::Global(d) => (
                    if d.constant {
                        IndexKind::Const
                    } else {
                        IndexKind::Global
                    },
                    d.vis,
                    d.name,
                ),
                Declaration::Function(d) => {
                    (IndexKind::Func, d.vis, d.name)
                }
                Declaration::Init(_) => continue,
            };

            let scope = match vis {
                Visibility::Public => "public",
                Visibility::Internal => "internal",
                Visibility::File => continue,
            };

            table.push_str("  ");
            table.push_str(kind.directive());
            table.push(' ');
            table.push_str(scope);
            table.push(' ');
            table.push_str(sym.lookup_str());
            table.push('\n');
        }
    }

    out.write_all(MAGIC)?;
    for (name, text) in members {
        out.write_all(&(name.len() as u32).to_le_bytes())?;
        out.write_all(name.as_bytes())?;
        out.write_all(&(text.len() as u32).to_le_bytes())?;
        out.write_all(text.as_bytes())?;
    }
    out.write_all(&0u32.to_le_bytes())?;

    let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
    enc.write_all(table.as_bytes())?;
    let compressed = enc.finish()?;

    out.write_all(&(compressed.len() as u32).to_le_bytes())?;
    out.write_all(&compressed)?;

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn build(members: &[(&str, &str)]) -> ArchiveFile {
        let members: Vec<_> = members
            .iter()
            .map(|(n, t)| (n.to_string(), t.to_string()))
            .collect();

        let mut buf = Vec::new();
        write_archive(&members, &mut buf).expect("archive build failed");

        ArchiveFile::read("test.ma".into(), &buf[..])
            .expect("archive read failed")
    }

    #[test]
    fn index_lists_linkable_symbols_only() {
        let ar = build(&[
            (
                "math.mo",
                ".global internal int32 counter\n\
                 .const file float64 SECRET\n\
                 public int32(int32:n) double { ldarg n; dup; add; ret }",
            ),
            ("types.mo", ".struct public Point { int32 x; int32 y }"),
        ]);

        let names: Vec<_> =
            ar.index().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(vec!["counter", "double", "Point"], names);

        // file-scoped SECRET is not indexed.
        assert!(ar.member_defining("SECRET").is_none());

        let double = ar.member_defining("double").unwrap();
        assert_eq!(IndexKind::Func, double.kind);
        assert_eq!(Visibility::Public, double.scope);
        assert_eq!(0, double.member);

        let point = ar.member_defining("Point").unwrap();
        assert_eq!(1, point.member);
    }

    #[test]
    fn reading_does_not_parse_members() {
        let ar = build(&[(
            "a.mo",
            "public void() noop { ret }",
        )]);

        assert_eq!(0, ar.parse_count());
    }

    #[test]
    fn parse_member_parses_on_each_call() {
        let mut ar = build(&[(
            "a.mo",
            "public void() noop { ret }",
        )]);

        let (decls, errors) = ar.parse_member(0).unwrap();
        assert!(errors.is_empty());
        assert_eq!(1, decls.len());
        assert_eq!(1, ar.parse_count());

        ar.parse_member(0).unwrap();
        assert_eq!(2, ar.parse_count());
    }

    #[test]
    fn missing_member_pull_is_an_error() {
        let mut ar = build(&[("a.mo", ".global public int32 g")]);

        assert!(matches!(
            ar.parse_member(9),
            Err(ArchiveError::NoSuchMember(_, 9))
        ));
    }

    #[test]
    fn broken_member_text_fails_archive_build() {
        let members =
            vec![("bad.mo".to_string(), "public () {".to_string())];

        let mut buf = Vec::new();
        assert!(matches!(
            write_archive(&members, &mut buf),
            Err(ArchiveBuildError::Syntax(..))
        ));
    }

    #[test]
    fn non_archive_input_is_rejected() {
        let err = ArchiveFile::read("x.ma".into(), &b"MXM\x01rest"[..])
            .unwrap_err();
        assert!(matches!(err, ArchiveError::BadMagic(_)));
    }
}
