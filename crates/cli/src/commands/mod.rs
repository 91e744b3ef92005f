pub mod analyze;
pub mod config_cmd;
pub mod daemon;
pub mod memory;
pub mod run;
pub mod runtime;
pub mod validate;
