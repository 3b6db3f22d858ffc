//! Dozegate - a reverse proxy that wakes container workloads on demand
//!
//! This library provides an on-demand reverse proxy that:
//! - Routes HTTP/WebSocket traffic by Host header or first path segment
//! - Starts the matching Docker container or Proxmox LXC instance when
//!   traffic arrives, serving a holding page during the wake-up
//! - Tracks per-backend activity and stops workloads idle beyond their
//!   configured timeout
//! - Moves grouped backends together: group starts in declared order,
//!   group stops only when every member is idle
//! - Runs wall-clock schedules for unconditional start/stop actions
//! - Reloads its configuration document from disk without restarting

pub mod activity;
pub mod admin;
pub mod config;
pub mod docker;
pub mod driver;
pub mod engine;
pub mod error;
pub mod groups;
pub mod page;
pub mod pool;
pub mod proxmox;
pub mod proxy;
pub mod reaper;
pub mod scheduler;
