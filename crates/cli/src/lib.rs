//! The Parley host: built-in extensions shared by the binary and its tests.

pub mod builtin;
