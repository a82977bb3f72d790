pub mod cancel;
pub mod exit;
pub mod log_assert;
pub mod net_protocol;
pub mod retry;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
