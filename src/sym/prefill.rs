// Static symbols
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

//! Pre-interned symbols at static ids.
//!
//! The global interner is seeded with these strings at initialization,
//!   in order,
//!   so that each constant in [`st`] is guaranteed to hold the id its
//!   position advertises.
//! This allows built-in names
//!   (primitive type names and a few linker-internal identifiers)
//!   to be compared against incoming symbols without any pool lookup.
//!
//! The constants are named `L_<NAME>` after the literal they intern,
//!   following the convention that a symbol's name describes its string
//!   value rather than its use.

use super::interner::Interner;

macro_rules! static_symbols {
    ($($name:ident : $str:expr),* $(,)?) => {
        /// Static symbol constants.
        ///
        /// See the [parent module](super) for more information.
        pub mod st {
            use super::super::symbol::SymbolId;

            /// Strings backing the static symbols,
            ///   in id order beginning at `1`.
            pub static POOL: &[&str] = &[$($str),*];

            paste::paste! {
                static_symbols!(@consts 1u32, $([<L_ $name:upper>] : $str),*);
            }
        }

        /// Seed `interner` with the static symbol pool.
        ///
        /// This must be the first use of the interner,
        ///   otherwise the ids of the [`st`] constants will not correspond
        ///   to their actual interns.
        pub(super) fn fill<'i, I: Interner<'i>>(interner: &I) {
            for s in st::POOL {
                interner.intern(s);
            }
        }
    };

    (@consts $i:expr, $name:ident : $str:expr) => {
        #[doc = concat!("Interned `", $str, "`.")]
        pub const $name: SymbolId =
            unsafe { SymbolId::from_int_unchecked($i) };
    };

    (@consts $i:expr, $name:ident : $str:expr, $($rest:ident : $rstr:expr),+) => {
        #[doc = concat!("Interned `", $str, "`.")]
        pub const $name: SymbolId =
            unsafe { SymbolId::from_int_unchecked($i) };

        static_symbols!(@consts $i + 1u32, $($rest : $rstr),+);
    };
}

static_symbols! {
    void: "void",
    bool: "bool",
    char: "char",
    int8: "int8",
    uint8: "uint8",
    int16: "int16",
    uint16: "uint16",
    int32: "int32",
    uint32: "uint32",
    int64: "int64",
    uint64: "uint64",
    float32: "float32",
    float64: "float64",
    nint: "nint",
    nuint: "nuint",
    string: "string",
    object: "object",

    // Aliases canonicalized by the type-name resolver.
    byte: "byte",
    sbyte: "sbyte",
    intptr: "intptr",
    uintptr: "uintptr",

    // Linker-internal identifiers.
    main: "main",
    module_init: ".init",
}

#[cfg(test)]
mod test {
    use super::super::symbol::{GlobalSymbolIntern, GlobalSymbolResolve};
    use super::*;

    // The global interner seeds itself from the pool, so every constant
    // must agree with a live intern of its string.
    #[test]
    fn static_symbols_match_global_interns() {
        assert_eq!(st::L_VOID, "void".intern());
        assert_eq!(st::L_INT32, "int32".intern());
        assert_eq!(st::L_NINT, "nint".intern());
        assert_eq!(st::L_MODULE_INIT, ".init".intern());
    }

    #[test]
    fn static_symbols_resolve_to_their_strings() {
        assert_eq!("uint8", st::L_UINT8.lookup_str());
        assert_eq!("float64", st::L_FLOAT64.lookup_str());
        assert_eq!("main", st::L_MAIN.lookup_str());
    }

    #[test]
    fn pool_has_no_duplicates() {
        let mut seen = std::collections::HashSet::new();
        for s in st::POOL {
            assert!(seen.insert(s), "duplicate prefill symbol: {}", s);
        }
    }
}
