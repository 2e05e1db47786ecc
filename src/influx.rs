mod client;
mod point;
mod writer;

pub use client::*;
pub use point::*;
pub use writer::*;
