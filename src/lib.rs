//! Library crate for udpxy-scout exposing reusable modules.
pub mod catalog;
pub mod config;
pub mod dedupe;
pub mod search;
pub mod sink;
pub mod speedtest;
pub mod types;
pub mod verify;
