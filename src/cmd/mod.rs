//! Command-line entry points.

pub mod estimate;
pub mod ocr;
pub mod schema;
pub mod send;
pub mod serve;
pub mod session;
