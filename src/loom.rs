// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Shims that switch the concurrency-sensitive parts of this crate between
//! the real `std` primitives and loom's model-checked replacements.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(loom)] {
        pub(crate) use loom::sync;
        pub(crate) use loom::cell;
        #[cfg(test)]
        pub(crate) use loom::model;
        #[cfg(test)]
        pub(crate) use loom::thread;
        pub(crate) use loom::lazy_static;
    } else {
        #[cfg(test)]
        pub(crate) use std::thread;
        #[cfg(test)]
        pub(crate) use lazy_static::lazy_static;

        #[cfg(test)]
        #[inline(always)]
        pub(crate) fn model<R>(f: impl FnOnce() -> R) -> R {
            f()
        }

        pub(crate) mod sync {
            pub(crate) use std::sync::*;
        }

        pub(crate) mod cell {
            #[derive(Debug)]
            pub(crate) struct UnsafeCell<T>(core::cell::UnsafeCell<T>);

            impl<T> UnsafeCell<T> {
                pub(crate) const fn new(data: T) -> UnsafeCell<T> {
                    UnsafeCell(core::cell::UnsafeCell::new(data))
                }

                #[inline(always)]
                pub(crate) fn with<R>(&self, f: impl FnOnce(*const T) -> R) -> R {
                    f(self.0.get())
                }

                #[inline(always)]
                pub(crate) fn with_mut<R>(&self, f: impl FnOnce(*mut T) -> R) -> R {
                    f(self.0.get())
                }
            }
        }
    }
}
