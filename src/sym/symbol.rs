// Symbol objects and global interners
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

//! Symbol objects and the global interner.
//!
//! See the [parent module](super) for more information.

use super::interner::{DefaultInterner, Interner};
use crate::global;
use std::fmt::{self, Debug, Display};
use std::ops::Deref;
use std::thread::LocalKey;

/// Interned string identifier.
///
/// This is a lightweight token that can be copied freely and compared in
///   constant time.
/// The underlying string can be retrieved with
///   [`GlobalSymbolResolve::lookup_str`].
///
/// The wrapped value is non-zero so that `Option<SymbolId>` is
///   space-optimized.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct SymbolId(global::NonZeroSymSize);

assert_eq_size!(Option<SymbolId>, SymbolId);

impl SymbolId {
    /// Construct index from a non-zero `u32` value.
    ///
    /// Panics
    /// ======
    /// Panics if `n == 0`.
    pub fn from_int(n: global::SymSize) -> SymbolId {
        SymbolId(
            global::NonZeroSymSize::new(n)
                .expect("internal error: SymbolId must be non-zero"),
        )
    }

    /// Construct index from an unchecked non-zero `u32` value.
    ///
    /// Safety
    /// ======
    /// The value must be non-zero,
    ///   otherwise the compiler is free to assume that
    ///   `Option<SymbolId>::None` can never exist.
    pub(super) const unsafe fn from_int_unchecked(
        n: global::SymSize,
    ) -> SymbolId {
        SymbolId(global::NonZeroSymSize::new_unchecked(n))
    }

    /// Index as a usize,
    ///   suitable for indexing the interner's backing store.
    pub fn as_usize(self) -> usize {
        self.0.get() as usize
    }
}

/// An interned string retrieved from the pool.
///
/// This exists as a newtype over the slice so that other representations
///   can be introduced without breaking callers;
///     it dereferences into [`str`].
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct SymbolStr<'i>(&'i str);

impl<'i> SymbolStr<'i> {
    pub(super) fn from_interned_slice(slice: &'i str) -> Self {
        SymbolStr(slice)
    }

    pub fn as_str(&self) -> &'i str {
        self.0
    }
}

impl<'i> Deref for SymbolStr<'i> {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.0
    }
}

impl<'i> PartialEq<&str> for SymbolStr<'i> {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl<'i> PartialEq<SymbolStr<'i>> for &str {
    fn eq(&self, other: &SymbolStr<'i>) -> bool {
        *self == other.0
    }
}

impl<'i> Display for SymbolStr<'i> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(self.0, f)
    }
}

thread_local! {
    /// Global interner for the linking thread.
    ///
    /// The interner is initialized with the static prefill pool so that
    ///   the symbols in [`super::st`] hold their advertised ids.
    static INTERNER: DefaultInterner<'static> = {
        let interner = DefaultInterner::with_capacity(
            global::INIT_GLOBAL_INTERNER_CAPACITY,
        );
        super::prefill::fill(&interner);
        interner
    };
}

/// Acquire a static reference to the global interner.
///
/// The interner is created by [`thread_local!`],
///   which provides access with a lifetime that cannot exceed that of the
///   closure;
///     but we must return string slices out of the interner's storage.
/// This transmutes the lifetime back to `'static`,
///   which is sound because the thread-local storage is never deallocated
///   for the life of the thread and is accessible only to it.
fn with_static_interner<F, R>(key: &'static LocalKey<DefaultInterner<'static>>, f: F) -> R
where
    F: FnOnce(&'static DefaultInterner<'static>) -> R,
{
    key.with(|interner| {
        f(unsafe {
            std::mem::transmute::<
                &DefaultInterner<'static>,
                &'static DefaultInterner<'static>,
            >(interner)
        })
    })
}

/// Resolve a [`SymbolId`] to the string value it represents using the
///   global interner.
///
/// This exists as its own trait
///   (rather than simply adding to [`SymbolId`])
///   to make it easy to see which systems rely on global state.
pub trait GlobalSymbolResolve {
    /// Resolve a [`SymbolId`] allocated using the global interner.
    ///
    /// Panics
    /// ======
    /// This will panic if the symbol cannot be found,
    ///   which can only occur if the id did not come from the global
    ///   interner and would represent a bug in the program.
    fn lookup_str(&self) -> &'static str;

    /// Attempt to resolve a [`SymbolId`] without panicking.
    ///
    /// This is intended for diagnostic contexts
    ///   (such as [`Debug`] during a panic).
    fn try_lookup_str(&self) -> Option<&'static str>;
}

impl GlobalSymbolResolve for SymbolId {
    fn lookup_str(&self) -> &'static str {
        with_static_interner(&INTERNER, |interner| {
            interner
                .index_lookup(*self)
                .map(|s| s.as_str())
                .expect("internal error: SymbolId not in global interner")
        })
    }

    fn try_lookup_str(&self) -> Option<&'static str> {
        with_static_interner(&INTERNER, |interner| {
            interner.index_lookup(*self).map(|s| s.as_str())
        })
    }
}

impl Display for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.lookup_str())
    }
}

/// Intern a string using the global interner.
///
/// This provides a convenient API that creates the appearance that string
///   interning is a core language feature
///   (e.g. `"foo".intern()`),
///     since symbols are so pervasive in the linker that they may as well
///     be.
pub trait GlobalSymbolIntern {
    /// Intern a string using the global interner.
    fn intern(self) -> SymbolId;

    /// Copy the provided slice into the intern pool and produce a symbol,
    ///   but do not intern it;
    ///     the resulting symbol will never compare equal to any other.
    fn clone_uninterned(self) -> SymbolId;
}

impl GlobalSymbolIntern for &str {
    fn intern(self) -> SymbolId {
        with_static_interner(&INTERNER, |interner| interner.intern(self))
    }

    fn clone_uninterned(self) -> SymbolId {
        with_static_interner(&INTERNER, |interner| {
            interner.clone_uninterned(self)
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn global_intern_equality() {
        let a = "global intern".intern();
        let b = "global intern".to_string().as_str().intern();

        assert_eq!(a, b);
        assert_eq!("global intern", a.lookup_str());
    }

    #[test]
    fn global_uninterned_unique() {
        let a = "global uninterned".intern();
        let b = "global uninterned".clone_uninterned();

        assert_ne!(a, b);
        assert_eq!(a.lookup_str(), b.lookup_str());
    }

    #[test]
    fn display_resolves_string() {
        let sym = "display me".intern();
        assert_eq!("display me", format!("{}", sym));
    }

    #[test]
    fn try_lookup_out_of_range() {
        // A fresh id far beyond anything interned by this test binary's
        // threads would be fragile to assert on, but id resolution of a
        // valid symbol must always succeed.
        let sym = "try lookup".intern();
        assert_eq!(Some("try lookup"), sym.try_lookup_str());
    }
}
