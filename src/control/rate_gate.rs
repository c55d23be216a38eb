use std::time::Duration;

use tokio::time::Instant;

use super::types::{CommandRecord, DeviceLine};

/// Minimum-interval guard between outbound commands.
///
/// Keeps only the last command that passed; a rejected check never touches it.
#[derive(Debug, Clone)]
pub struct RateGate {
    min_interval: Duration,
    last_command: Option<CommandRecord>,
}

impl RateGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_command: None,
        }
    }

    /// `Err` carries the time left until the next command may pass.
    pub fn check(&self, now: Instant) -> Result<(), Duration> {
        match &self.last_command {
            Some(last) => {
                let elapsed = now.saturating_duration_since(last.issued_at);
                if elapsed < self.min_interval {
                    Err(self.min_interval - elapsed)
                } else {
                    Ok(())
                }
            }
            None => Ok(()),
        }
    }

    pub fn record(&mut self, line: DeviceLine, now: Instant) -> &CommandRecord {
        self.last_command.insert(CommandRecord {
            line,
            issued_at: now,
            issued_at_wall: chrono::Utc::now(),
        })
    }

    pub fn last_command(&self) -> Option<&CommandRecord> {
        self.last_command.as_ref()
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}
