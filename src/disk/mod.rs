pub mod devpath;
pub mod layout;
pub mod locator;
pub mod parted;
pub mod recreate;
pub mod types;
pub mod utils;

pub use layout::LayoutPlanner;
pub use locator::{Located, Locator, find_part};
pub use recreate::Recreator;
pub use types::{Partitions, Span};

pub const SYSBOOT_LABEL: &str = "system-boot";
pub const WRITABLE_LABEL: &str = "writable";
pub const SWAP_LABEL: &str = "swap";
