pub mod commands;
pub mod hosts;
pub mod jobs;
pub mod keys;
pub mod links;
