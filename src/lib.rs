pub mod clap_args;
pub mod config;
pub mod emulator;
pub mod lifecycle;
pub mod orchestrator;
pub mod plan;
pub mod process_control;
pub mod report;
pub mod timeline;
pub mod topology;
