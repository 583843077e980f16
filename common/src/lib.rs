#[cfg(feature = "elapsed")]
pub mod elapsed;
