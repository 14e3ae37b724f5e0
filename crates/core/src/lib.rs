pub mod config;
pub mod error;
pub mod execution;
pub mod test_case;

pub use config::Config;
pub use error::*;
pub use execution::*;
pub use test_case::*;
