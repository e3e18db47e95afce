//! Helpers shared by the backup backends.

pub mod artifact;
pub mod retention;
pub mod shell;
