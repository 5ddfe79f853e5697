//! Copying trees and unpacking the bundled factory images.

mod archive;
mod tree;

pub use archive::{extract_tar_xz, extract_tar_xz_via_scratch, unsquash};
pub use tree::copy_tree;
