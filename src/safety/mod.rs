//! Pre-execution safety policies
//!
//! - Gas guard: rolling mean of sampled gas prices against a ceiling
//! - Rate limiter: minimum spacing between guarded calls

pub mod gas_guard;
pub mod rate_limiter;

pub use gas_guard::{GasGuard, GasPriceSource, GasPriceWindow};
pub use rate_limiter::RateLimiter;
