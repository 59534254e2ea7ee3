pub mod check;
pub mod config_schema;
pub mod reap;
pub mod run;
