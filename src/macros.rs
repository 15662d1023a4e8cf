//! Useful macros
mod once;
