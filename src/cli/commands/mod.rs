//! CLI command implementations

pub mod cleanup;
pub mod config;
pub mod gc;
pub mod list;
pub mod unpack;

pub use cleanup::execute as cleanup;
pub use config::execute as config;
pub use gc::execute as gc;
pub use list::execute as list;
pub use unpack::execute as unpack;
