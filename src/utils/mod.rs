pub mod backend;
pub mod collate;
pub mod command;
pub mod environment;
pub mod file;
pub mod streams;
