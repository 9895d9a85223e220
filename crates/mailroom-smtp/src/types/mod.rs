//! Addresses, replies and EHLO extensions.

mod address;
mod extension;
mod reply;

pub use address::{Address, ReversePath, split_path};
pub use extension::{AuthMechanism, Extension};
pub use reply::{Reply, ReplyClass, ReplyCode};
