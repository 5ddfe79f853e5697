pub mod efi;
pub mod grub;
pub mod uboot;
pub mod uboot_env;

pub use efi::BootEntryReconciler;
pub use grub::GrubMenuEntry;
pub use uboot_env::UbootEnv;
