pub mod config;
pub mod mapping;
pub mod remote;
pub mod task;

pub use config::*;
pub use mapping::*;
pub use remote::*;
pub use task::*;
