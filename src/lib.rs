pub mod backend;
pub mod config;
pub mod facade;
pub mod model;
pub mod sync;
pub mod tui;
