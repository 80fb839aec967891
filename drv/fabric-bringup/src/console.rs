// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use core::fmt;

/// Where progress narration goes: a serial port, a framebuffer, or nowhere.
pub trait Console {
    fn say(&mut self, args: fmt::Arguments<'_>);
}

impl<T: Console + ?Sized> Console for &mut T {
    fn say(&mut self, args: fmt::Arguments<'_>) {
        (**self).say(args)
    }
}

/// Discards everything.
pub struct Quiet;

impl Console for Quiet {
    fn say(&mut self, _: fmt::Arguments<'_>) {}
}

/// Writes one line of narration to a [`Console`].
#[macro_export]
macro_rules! say {
    ($console:expr, $($arg:tt)+) => {
        $crate::Console::say(&mut $console, format_args!($($arg)+))
    };
}
