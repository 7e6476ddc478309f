pub mod config;
pub mod lhystudios;
pub mod messages;
pub mod runtime;
