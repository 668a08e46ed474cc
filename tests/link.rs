// Whole-link integration tests
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

//! End-to-end links through the public library API,
//!   exercising input loading through emission against real files.

use molt::ld::{link, InputRef, LinkError, LinkOptions};
use molt::module::read::read_module;
use molt::sym::GlobalSymbolIntern;
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

struct Sandbox {
    dir: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn unit(&self, name: &str, text: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, text).unwrap();
        path
    }

    fn archive(&self, name: &str, members: &[(&str, &str)]) -> PathBuf {
        let members: Vec<(String, String)> = members
            .iter()
            .map(|(n, t)| (n.to_string(), t.to_string()))
            .collect();

        let mut bytes = Vec::new();
        molt::ld::archive::write_archive(&members, &mut bytes).unwrap();

        let path = self.dir.path().join(name);
        fs::write(&path, &bytes).unwrap();
        path
    }

    /// Assemble archive bytes by hand with a caller-supplied symbol
    ///   table,
    ///     bypassing the validating writer so a member body may hold
    ///     arbitrary text.
    fn raw_archive(
        &self,
        name: &str,
        members: &[(&str, &str)],
        table: &str,
    ) -> PathBuf {
        use flate2::write::DeflateEncoder;
        use flate2::Compression;
        use std::io::Write as _;

        let mut bytes: Vec<u8> = b"MAR\x01".to_vec();
        for (member, body) in members {
            bytes.extend_from_slice(
                &(member.len() as u32).to_le_bytes(),
            );
            bytes.extend_from_slice(member.as_bytes());
            bytes.extend_from_slice(&(body.len() as u32).to_le_bytes());
            bytes.extend_from_slice(body.as_bytes());
        }
        bytes.extend_from_slice(&0u32.to_le_bytes());

        let mut enc =
            DeflateEncoder::new(Vec::new(), Compression::default());
        enc.write_all(table.as_bytes()).unwrap();
        let compressed = enc.finish().unwrap();
        bytes.extend_from_slice(
            &(compressed.len() as u32).to_le_bytes(),
        );
        bytes.extend_from_slice(&compressed);

        let path = self.dir.path().join(name);
        fs::write(&path, &bytes).unwrap();
        path
    }

    fn out(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

fn link_files(
    inputs: &[&Path],
    output: &Path,
) -> Result<(), Vec<LinkError>> {
    link(&LinkOptions {
        inputs: inputs
            .iter()
            .map(|p| InputRef::File(p.to_path_buf()))
            .collect(),
        output: output.to_path_buf(),
        ..Default::default()
    })
}

fn read_back(path: &Path) -> molt::module::Module {
    read_module(BufReader::new(fs::File::open(path).unwrap())).unwrap()
}

fn has_method(module: &molt::module::Module, name: &str) -> bool {
    module.methods().any(|(_, m)| m.name == name.intern())
}

#[test]
fn links_units_with_cross_unit_calls() {
    let sandbox = Sandbox::new();
    let a = sandbox.unit(
        "a.mo",
        "public int32() main { call one; ret }",
    );
    let b = sandbox.unit(
        "b.mo",
        "internal int32() one { ldc.i4 1; ret }",
    );
    let out = sandbox.out("out.mx");

    link_files(&[&a, &b], &out).unwrap();

    let module = read_back(&out);
    assert!(has_method(&module, "main"));
    assert!(has_method(&module, "one"));
}

#[test]
fn archive_members_pull_only_on_demand() {
    let sandbox = Sandbox::new();

    // The undemanded member is deliberately malformed yet indexed;
    //   a lazy link never parses it and therefore never sees the error.
    // The bytes are assembled by hand since the validating writer
    //   refuses broken member text.
    let lib = sandbox.raw_archive(
        "libutil.ma",
        &[
            ("used.mo", "public int32() used { ldc.i4 7; ret }"),
            ("broken.mo", "public int32() broken { this is not } ok"),
        ],
        ".object used.mo\n  func public used\n\
         .object broken.mo\n  func public broken\n",
    );
    let main = sandbox.unit(
        "main.mo",
        "public int32() main { call used; ret }",
    );
    let out = sandbox.out("out.mx");

    link_files(&[&main, &lib], &out).unwrap();

    let module = read_back(&out);
    assert!(has_method(&module, "used"));
    assert!(!has_method(&module, "broken"));
}

#[test]
fn archive_pull_follows_transitive_demands() {
    let sandbox = Sandbox::new();
    let lib = sandbox.archive(
        "libchain.ma",
        &[
            ("a.mo", "public int32() a { call b; ret }"),
            ("b.mo", "public int32() b { ldc.i4 2; ret }"),
            ("c.mo", "public int32() c { ldc.i4 3; ret }"),
        ],
    );
    let main = sandbox.unit(
        "main.mo",
        "public int32() main { call a; ret }",
    );
    let out = sandbox.out("out.mx");

    link_files(&[&main, &lib], &out).unwrap();

    let module = read_back(&out);
    assert!(has_method(&module, "a"));
    assert!(has_method(&module, "b"), "transitive pull missing");
    assert!(!has_method(&module, "c"), "undemanded member pulled");
}

#[test]
fn undefined_symbol_reported_once() {
    let sandbox = Sandbox::new();
    let unit = sandbox.unit(
        "main.mo",
        "public int32() main { call nowhere; call nowhere; ret }",
    );
    let out = sandbox.out("out.mx");

    let errors = link_files(&[&unit], &out).unwrap_err();

    let mentions = errors
        .iter()
        .filter(|e| e.to_string().contains("nowhere"))
        .count();
    assert_eq!(1, mentions, "{:?}", errors);
    assert!(!out.exists(), "failed link must not write output");
}

#[test]
fn file_scoped_helpers_do_not_collide() {
    let sandbox = Sandbox::new();
    let a = sandbox.unit(
        "a.mo",
        "file int32() helper { ldc.i4 1; ret }\n\
         public int32() enter_a { call helper; ret }",
    );
    let b = sandbox.unit(
        "b.mo",
        "file int32() helper { ldc.i4 2; ret }\n\
         public int32() enter_b { call helper; ret }",
    );
    let out = sandbox.out("out.mx");

    link_files(&[&a, &b], &out).unwrap();

    // Both helpers survive as distinct private methods.
    let module = read_back(&out);
    let helpers = module
        .methods()
        .filter(|(_, m)| m.name == "helper".intern())
        .count();
    assert_eq!(2, helpers);
}

#[test]
fn identical_struct_declarations_merge_across_units() {
    let sandbox = Sandbox::new();
    let a = sandbox.unit(
        "a.mo",
        ".struct public Point { int32 x; int32 y }\n\
         public int32(Point*) getx { ldarg 0; ldfld Point x; ret }",
    );
    let b = sandbox.unit(
        "b.mo",
        ".struct public Point { int32 x; int32 y }\n\
         public int32(Point*) gety { ldarg 0; ldfld Point y; ret }",
    );
    let out = sandbox.out("out.mx");

    link_files(&[&a, &b], &out).unwrap();

    let module = read_back(&out);
    let points = module
        .types()
        .filter(|(_, t)| t.name == "Point".intern())
        .count();
    assert_eq!(1, points);
}

#[test]
fn conflicting_struct_layouts_fail_the_link() {
    let sandbox = Sandbox::new();
    let a = sandbox
        .unit("a.mo", ".struct public Point { int32 x }");
    let b = sandbox
        .unit("b.mo", ".struct public Point { int64 x }");
    let out = sandbox.out("out.mx");

    let errors = link_files(&[&a, &b], &out).unwrap_err();
    assert!(
        errors
            .iter()
            .any(|e| e.to_string().contains("conflicting layout")),
        "{:?}",
        errors
    );
}

#[test]
fn compiled_module_satisfies_demands() {
    let sandbox = Sandbox::new();

    // First link produces a module exporting `seven`.
    let lib_unit = sandbox.unit(
        "lib.mo",
        "public int32() seven { ldc.i4 7; ret }",
    );
    let lib_out = sandbox.out("lib.mx");
    link_files(&[&lib_unit], &lib_out).unwrap();

    // Second link consumes it.
    let main = sandbox.unit(
        "main.mo",
        "public int32() main { call seven; ret }",
    );
    let out = sandbox.out("out.mx");
    link_files(&[&main, &lib_out], &out).unwrap();

    let module = read_back(&out);
    assert!(has_method(&module, "main"));
    assert!(has_method(&module, "seven"));
}

#[test]
fn site_checked_call_spans_absorbed_modules() {
    let sandbox = Sandbox::new();

    // Two compiled modules whose exports share a signature.
    let a = sandbox
        .unit("a.mo", "public int32() alpha { ldc.i4 1; ret }");
    let a_mx = sandbox.out("liba.mx");
    link_files(&[&a], &a_mx).unwrap();

    let b = sandbox
        .unit("b.mo", "public int32() beta { ldc.i4 2; ret }");
    let b_mx = sandbox.out("libb.mx");
    link_files(&[&b], &b_mx).unwrap();

    // Site-checked calls into both must accept the shared signature
    //   however many modules contributed it.
    let main = sandbox.unit(
        "main.mo",
        "public int32() main {\n\
           call int32() alpha; pop\n\
           call int32() beta; ret\n\
         }",
    );
    let out = sandbox.out("out.mx");

    link_files(&[&main, &a_mx, &b_mx], &out).unwrap();

    let module = read_back(&out);
    assert!(has_method(&module, "alpha"));
    assert!(has_method(&module, "beta"));
}

#[test]
fn library_search_resolves_lib_prefix() {
    let sandbox = Sandbox::new();
    sandbox.archive(
        "libm.ma",
        &[("m.mo", "public int32() msym { ldc.i4 9; ret }")],
    );
    let main = sandbox.unit(
        "main.mo",
        "public int32() main { call msym; ret }",
    );
    let out = sandbox.out("out.mx");

    link(&LinkOptions {
        inputs: vec![
            InputRef::File(main),
            InputRef::Library("m".into()),
        ],
        output: out.clone(),
        search_paths: vec![sandbox.dir.path().to_path_buf()],
        ..Default::default()
    })
    .unwrap();

    assert!(has_method(&read_back(&out), "msym"));
}

#[test]
fn init_blocks_merge_into_module_initializer() {
    let sandbox = Sandbox::new();
    let a = sandbox.unit(
        "a.mo",
        ".global internal int32 ga\n\
         .init { ldc.i4 1; stsfld ga }",
    );
    let b = sandbox.unit(
        "b.mo",
        ".global internal int32 gb\n\
         .init { ldc.i4 2; stsfld gb }",
    );
    let out = sandbox.out("out.mx");

    link_files(&[&a, &b], &out).unwrap();

    let module = read_back(&out);
    let inits = module
        .methods()
        .filter(|(_, m)| m.name == ".init".intern())
        .count();
    assert_eq!(1, inits);
}

#[test]
fn entry_point_must_be_public() {
    let sandbox = Sandbox::new();
    let unit = sandbox.unit(
        "main.mo",
        "internal int32() main { ldc.i4 0; ret }",
    );
    let out = sandbox.out("out.mx");

    let errors = link(&LinkOptions {
        inputs: vec![InputRef::File(unit)],
        output: out,
        emit_exe: true,
        ..Default::default()
    })
    .unwrap_err();

    assert!(
        errors.iter().any(|e| matches!(
            e,
            LinkError::MissingEntry(_)
        )),
        "{:?}",
        errors
    );
}

#[test]
fn optimize_strips_nops_from_bodies() {
    let sandbox = Sandbox::new();
    let unit = sandbox.unit(
        "main.mo",
        "public int32() main { nop; ldc.i4 1; nop; ret }",
    );
    let out = sandbox.out("out.mx");

    link(&LinkOptions {
        inputs: vec![InputRef::File(unit)],
        output: out.clone(),
        optimize: true,
        ..Default::default()
    })
    .unwrap();

    let module = read_back(&out);
    let main = module
        .methods()
        .find(|(_, m)| m.name == "main".intern())
        .map(|(_, m)| m.body.clone())
        .unwrap();
    assert_eq!(2, main.len(), "{:?}", main);
}

#[test]
fn variadic_call_round_trips_site_signature() {
    let sandbox = Sandbox::new();
    let unit = sandbox.unit(
        "main.mo",
        "internal int32(int8*,...) fmt { va.start; va.end; \
           ldc.i4 0; ret }\n\
         public int32() main {\n\
           ldnull\n\
           ldc.i4 42\n\
           call int32(int8*,int32) fmt\n\
           ret\n\
         }",
    );
    let out = sandbox.out("out.mx");

    link_files(&[&unit], &out).unwrap();

    let module = read_back(&out);
    let main = module
        .methods()
        .find(|(_, m)| m.name == "main".intern())
        .map(|(_, m)| m.body.clone())
        .unwrap();
    assert!(main
        .iter()
        .any(|i| matches!(i, molt::module::Instr::Call(_, Some(_)))));
}
