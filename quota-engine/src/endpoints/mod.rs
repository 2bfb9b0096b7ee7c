pub mod fallback;
pub mod proxy;
pub mod status;
pub mod usage;
