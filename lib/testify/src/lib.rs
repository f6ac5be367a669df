//! Helpers shared by the tests of every crate in this workspace.

mod addr;
pub mod http;
mod temp;

pub use addr::next_addr;
pub use temp::{temp_dir, temp_file};
