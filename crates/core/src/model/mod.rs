#![forbid(unsafe_code)]

mod fields;
mod mutation;
mod record;

pub use fields::*;
pub use mutation::*;
pub use record::*;
