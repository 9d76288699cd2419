// Spindle - disc ripping workflow engine

pub mod cache;
pub mod config;
pub mod constants;
pub mod daemon;
pub mod db;
pub mod disc;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod media;
pub mod notify;
pub mod queue;
pub mod services;
pub mod stages;
pub mod tools;
pub mod workflow;
