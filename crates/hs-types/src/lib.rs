pub mod common;
pub mod condition;
pub mod config;
pub mod errors;
pub mod experiment;
pub mod meta;
pub mod runtime;
pub mod suggestion;
pub mod trial;

pub use common::*;
pub use condition::*;
pub use config::*;
pub use errors::*;
pub use experiment::*;
pub use meta::*;
pub use runtime::*;
pub use suggestion::*;
pub use trial::*;
