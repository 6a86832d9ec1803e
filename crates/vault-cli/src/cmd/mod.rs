pub mod config;
pub mod init;
pub mod reflect;
pub mod run;
pub mod status;
