pub mod config;
pub mod id;
pub mod logging;

pub use config::Config;
