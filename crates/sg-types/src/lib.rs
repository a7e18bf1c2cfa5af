pub mod rows;
pub mod evaluator;
pub mod config;
pub mod errors;

pub use rows::*;
pub use evaluator::*;
pub use config::*;
pub use errors::*;
