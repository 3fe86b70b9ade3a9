pub mod address;
pub mod logging;

pub use address::Address;
pub use tracing;
