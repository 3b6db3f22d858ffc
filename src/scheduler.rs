//! Wall-clock schedule engine.
//!
//! Schedule rules attach timers (days of week plus `HH:MM` start/stop
//! times) to a backend or group. The loop ticks every 59 seconds and
//! compares the current local time truncated to the minute, so each
//! matching minute fires exactly once. Scheduled starts are
//! unconditional; scheduled stops yield to an in-flight stop.

use crate::config::{ConfigSnapshot, TargetType};
use crate::engine::Engine;
use chrono::{DateTime, Datelike, Local, Timelike};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Tick spacing; just under a minute so no `HH:MM` is skipped.
pub const TICK_INTERVAL: Duration = Duration::from_secs(59);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    Start,
    Stop,
}

pub struct Scheduler {
    engine: Arc<Engine>,
    shutdown_rx: watch::Receiver<bool>,
    /// Last minute acted on, to suppress double-fires when two ticks
    /// land in the same minute.
    last_minute: Option<String>,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            engine,
            shutdown_rx,
            last_minute: None,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(TICK_INTERVAL) => {
                    self.tick(Local::now()).await;
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        debug!("Scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub async fn tick(&mut self, now: DateTime<Local>) {
        let hhmm = format!("{:02}:{:02}", now.hour(), now.minute());
        if self.last_minute.as_deref() == Some(hhmm.as_str()) {
            return;
        }
        self.last_minute = Some(hhmm.clone());

        let weekday = now.weekday().num_days_from_sunday() as u8;
        let snapshot = self.engine.snapshot();

        for (name, action) in due_actions(&snapshot, weekday, &hhmm) {
            match action {
                TimerAction::Start => {
                    info!(name = %name, time = %hhmm, "Scheduled start");
                    self.engine.scheduled_start(&name).await;
                }
                TimerAction::Stop => {
                    if self.engine.activity().is_stopping(&name) {
                        info!(name = %name, time = %hhmm, "Scheduled stop skipped, stop already in progress");
                        continue;
                    }
                    info!(name = %name, time = %hhmm, "Scheduled stop");
                    self.engine.stop_guarded(&name).await;
                }
            }
        }
    }
}

/// Resolve the member-level actions due at `weekday` (0 = Sunday) and
/// `hhmm`. Rules whose target is inactive or unknown contribute
/// nothing; group targets expand to their member lists.
pub fn due_actions(
    snapshot: &ConfigSnapshot,
    weekday: u8,
    hhmm: &str,
) -> Vec<(String, TimerAction)> {
    let mut actions = Vec::new();

    for rule in &snapshot.schedules {
        let members: Vec<String> = match rule.target_type {
            TargetType::Container => match snapshot.backend(&rule.target) {
                Some(backend) if backend.active => vec![backend.name.clone()],
                _ => continue,
            },
            TargetType::Group => match snapshot.group(&rule.target) {
                Some(group) if group.active => group.members.clone(),
                _ => continue,
            },
        };

        for timer in &rule.timers {
            if !timer.active || !timer.days.contains(&weekday) {
                continue;
            }
            if timer.start_time.as_deref() == Some(hhmm) {
                actions.extend(
                    members
                        .iter()
                        .cloned()
                        .map(|name| (name, TimerAction::Start)),
                );
            }
            if timer.stop_time.as_deref() == Some(hhmm) {
                actions.extend(
                    members
                        .iter()
                        .cloned()
                        .map(|name| (name, TimerAction::Stop)),
                );
            }
        }
    }

    actions
}
