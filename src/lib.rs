pub mod atomic;
pub mod cli;
pub mod client;
pub mod command;
pub mod config;
pub mod daemon;
pub mod paths;
pub mod pid;
pub mod probe;
pub mod protocol;
pub mod registry;
pub mod settings;
pub mod supervisor;
pub mod sys;
pub mod watch;
