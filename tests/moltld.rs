// moltld CLI tests
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

//! Command-line behavior of `moltld`.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

fn moltld() -> Command {
    Command::cargo_bin("moltld").unwrap()
}

fn unit(dir: &TempDir, name: &str, text: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, text).unwrap();
    path
}

#[test]
fn no_inputs_is_a_usage_error() {
    moltld()
        .assert()
        .failure()
        .code(exitcode::USAGE)
        .stdout(predicate::str::contains("Usage:"));
}

#[test]
fn help_prints_usage() {
    moltld()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage:"));
}

#[test]
fn links_a_unit_to_the_named_output() {
    let dir = tempfile::tempdir().unwrap();
    let input =
        unit(&dir, "main.mo", "public int32() main { ldc.i4 0; ret }");
    let out = dir.path().join("prog.mx");

    moltld()
        .arg(&input)
        .arg("-o")
        .arg(&out)
        .assert()
        .success();

    assert!(out.exists());
}

#[test]
fn syntax_errors_fail_with_dataerr() {
    let dir = tempfile::tempdir().unwrap();
    let input = unit(&dir, "bad.mo", "public int32() { { {");
    let out = dir.path().join("out.mx");

    moltld()
        .arg(&input)
        .arg("-o")
        .arg(&out)
        .assert()
        .failure()
        .code(exitcode::DATAERR)
        .stderr(predicate::str::contains("moltld:"))
        .stderr(predicate::str::contains("fatal: failed to link"));

    assert!(!out.exists());
}

#[test]
fn undefined_symbol_names_the_symbol() {
    let dir = tempfile::tempdir().unwrap();
    let input = unit(
        &dir,
        "main.mo",
        "public int32() main { call missing_fn; ret }",
    );

    moltld()
        .arg(&input)
        .arg("-o")
        .arg(dir.path().join("out.mx"))
        .assert()
        .failure()
        .code(exitcode::DATAERR)
        .stderr(predicate::str::contains("missing_fn"));
}

#[test]
fn dry_run_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let input =
        unit(&dir, "main.mo", "public int32() main { ldc.i4 0; ret }");
    let out = dir.path().join("out.mx");

    moltld()
        .arg(&input)
        .arg("-o")
        .arg(&out)
        .arg("--dry-run")
        .assert()
        .success();

    assert!(!out.exists());
}

#[test]
fn exe_emits_companions() {
    let dir = tempfile::tempdir().unwrap();
    let input =
        unit(&dir, "main.mo", "public int32() main { ldc.i4 0; ret }");
    let out = dir.path().join("prog.mx");

    moltld()
        .arg(&input)
        .arg("-o")
        .arg(&out)
        .arg("--exe")
        .assert()
        .success();

    assert!(out.exists());
    assert!(dir.path().join("prog.mxrc").exists());
    assert!(dir.path().join("prog.host").exists());
}

#[test]
fn library_resolves_through_search_path() {
    let dir = tempfile::tempdir().unwrap();

    let members = vec![(
        "m.mo".to_string(),
        "public int32() nine { ldc.i4 9; ret }".to_string(),
    )];
    let mut bytes = Vec::new();
    molt::ld::archive::write_archive(&members, &mut bytes).unwrap();
    fs::write(dir.path().join("libm.ma"), &bytes).unwrap();

    let input = unit(
        &dir,
        "main.mo",
        "public int32() main { call nine; ret }",
    );

    moltld()
        .arg(&input)
        .arg("-L")
        .arg(dir.path())
        .arg("-l")
        .arg("m")
        .arg("-o")
        .arg(dir.path().join("out.mx"))
        .assert()
        .success();
}
