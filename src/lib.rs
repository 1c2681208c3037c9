pub mod api;
pub mod changelog;
pub mod cli;
pub mod fifo;
pub mod logging;
pub mod mutate;
pub mod planner;
pub mod reorder;
pub mod schedule;
pub mod settings;
pub mod stats;
pub mod types;
pub mod window;
pub mod workers;
