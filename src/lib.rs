//! Compiler from a host directory tree to a flat, block-addressed disk image.
//!
//! The pipeline is: [`fs::read_from_path`] walks the source tree,
//! [`layout::plan`] assigns block ranges, [`image::writer::BlockWriter`] streams the content and
//! [`image::assembler::ImageAssembler`] patches in the superblock.  [`compile`] ties these
//! together and takes care of replacing the destination image atomically.

pub mod compile;
pub mod error;
pub mod fs;
pub mod image;
pub mod layout;
pub mod tree;
pub mod util;


pub use compile::{compile_to_path, compile_to_vec, compile_tree, CompileOptions, ImageSummary};
pub use error::CompileError;
