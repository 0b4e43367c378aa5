// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Some utility modules live here. See individual sub-modules for more info.

pub mod errors;
pub mod ser;
pub mod time;

/// Logging macro utilities.
#[macro_use]
pub mod macro_logger;

// These have to come after macro_logger to build
pub mod logger;

#[cfg(any(test, feature = "_test_utils"))]
pub mod test_utils;
