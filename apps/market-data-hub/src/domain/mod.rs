//! Domain Layer
//!
//! Market data types and pure aggregation/quota logic. No I/O.

pub mod aggregation;
pub mod channel;
pub mod market;
pub mod quota;
pub mod symbol;
