pub mod action_cache;
pub mod analysis;
pub mod canon;
pub mod densemap;
pub mod evaluator;
pub mod fs;
pub mod graph;
pub mod hash;
pub mod local;
pub mod manifest;
pub mod progress;
pub mod resources;
pub mod run;
pub mod scanner;
pub mod session;
pub mod signal;
mod smallmap;
pub mod spawn;
pub mod spawn_cache;
pub mod store;
pub mod strategy;
mod terminal;
mod thread_pool;
pub mod trace;
pub mod work;
