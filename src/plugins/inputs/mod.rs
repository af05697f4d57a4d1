pub mod file;
pub mod internal;
