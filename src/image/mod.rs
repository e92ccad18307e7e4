//! The on-disk image: format definitions, the write path and a host-side read path.

pub mod assembler;
pub mod debug;
pub mod extract;
pub mod format;
pub mod reader;
pub mod writer;
