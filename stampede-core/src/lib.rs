mod config;
mod constants;
mod data;
mod parse;
mod stats;

pub use config::*;
pub use constants::*;
pub use data::*;
pub use parse::*;
pub use stats::*;
