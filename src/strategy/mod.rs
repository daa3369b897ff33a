//! Flash-loan execution
//!
//! Workers call into a [`FlashLoanOperation`] once per job. The loan itself
//! lives behind that trait; [`PreflightOperation`] runs the checks that gate
//! an attempt and reports the result without executing a transaction.

pub mod operation;
pub mod preflight;

pub use operation::FlashLoanOperation;
pub use preflight::PreflightOperation;
