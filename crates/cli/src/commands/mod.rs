pub mod config_cmd;
pub mod doctor;
pub mod migrate;
pub mod serve;
