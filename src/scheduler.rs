//! Periodic driver: re-enters the agent loop on an interval with a canned
//! prompt, with an optional lighter heartbeat. Single-threaded; the caller
//! sleeps between deadlines and polls the gates.

use std::time::{Duration, Instant};

/// A canned prompt used when only a heartbeat is configured.
pub const HEARTBEAT_PROMPT: &str =
    "Heartbeat check-in. Report anything that needs attention, briefly.";

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Seconds between agent runs; 0 disables the cron.
    pub interval_s: u64,
    /// Prompt fed to the loop on each cron tick.
    pub prompt: String,
    /// Seconds between heartbeats; 0 disables them.
    pub heartbeat_s: u64,
    /// Total cron runs before the scheduler stops; 0 means unlimited.
    pub max_runs: u64,
}

impl SchedulerConfig {
    pub fn enabled(&self) -> bool {
        self.interval_s > 0 || self.heartbeat_s > 0
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    last_run: Instant,
    last_heartbeat: Instant,
    run_count: u64,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let now = Instant::now();
        Self {
            config,
            last_run: now,
            last_heartbeat: now,
            run_count: 0,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn run_count(&self) -> u64 {
        self.run_count
    }

    /// Whether the scheduler has exhausted its run budget.
    pub fn finished(&self) -> bool {
        self.config.max_runs > 0 && self.run_count >= self.config.max_runs
    }

    /// True when a cron run is due; advances the clock and counts the run.
    pub fn should_run_agent(&mut self) -> bool {
        self.should_run_agent_at(Instant::now())
    }

    fn should_run_agent_at(&mut self, now: Instant) -> bool {
        if self.config.interval_s == 0 || self.finished() {
            return false;
        }
        if now.duration_since(self.last_run) < Duration::from_secs(self.config.interval_s) {
            return false;
        }
        self.last_run = now;
        self.run_count += 1;
        true
    }

    /// True when a heartbeat is due; advances its clock.
    pub fn should_heartbeat(&mut self) -> bool {
        self.should_heartbeat_at(Instant::now())
    }

    fn should_heartbeat_at(&mut self, now: Instant) -> bool {
        if self.config.heartbeat_s == 0 {
            return false;
        }
        if now.duration_since(self.last_heartbeat) < Duration::from_secs(self.config.heartbeat_s)
        {
            return false;
        }
        self.last_heartbeat = now;
        true
    }

    /// Sleep until the earlier of the next cron or heartbeat deadline.
    pub async fn sleep_until_next(&self) {
        let now = Instant::now();
        let mut wait = Duration::from_secs(u64::MAX);
        if self.config.interval_s > 0 && !self.finished() {
            let deadline = self.last_run + Duration::from_secs(self.config.interval_s);
            wait = wait.min(deadline.saturating_duration_since(now));
        }
        if self.config.heartbeat_s > 0 {
            let deadline = self.last_heartbeat + Duration::from_secs(self.config.heartbeat_s);
            wait = wait.min(deadline.saturating_duration_since(now));
        }
        if wait == Duration::from_secs(u64::MAX) {
            return;
        }
        tokio::time::sleep(wait).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(interval_s: u64, heartbeat_s: u64, max_runs: u64) -> SchedulerConfig {
        SchedulerConfig {
            interval_s,
            prompt: "check the queue".into(),
            heartbeat_s,
            max_runs,
        }
    }

    #[test]
    fn cron_fires_after_interval_and_counts_runs() {
        let mut scheduler = Scheduler::new(config(60, 0, 2));
        let start = scheduler.last_run;
        assert!(!scheduler.should_run_agent_at(start + Duration::from_secs(59)));
        assert!(scheduler.should_run_agent_at(start + Duration::from_secs(60)));
        assert_eq!(scheduler.run_count(), 1);
        // The clock advanced: another immediate poll does not fire.
        let second_base = scheduler.last_run;
        assert!(!scheduler.should_run_agent_at(second_base + Duration::from_secs(1)));
        assert!(scheduler.should_run_agent_at(second_base + Duration::from_secs(60)));
        // max_runs exhausted.
        assert!(scheduler.finished());
        assert!(!scheduler.should_run_agent_at(scheduler.last_run + Duration::from_secs(600)));
    }

    #[test]
    fn zero_interval_disables_cron() {
        let mut scheduler = Scheduler::new(config(0, 30, 0));
        assert!(!scheduler.should_run_agent_at(scheduler.last_run + Duration::from_secs(3600)));
        assert!(scheduler.should_heartbeat_at(scheduler.last_heartbeat + Duration::from_secs(30)));
    }

    #[test]
    fn heartbeat_is_independent_of_cron() {
        let mut scheduler = Scheduler::new(config(60, 15, 0));
        let start = scheduler.last_heartbeat;
        assert!(scheduler.should_heartbeat_at(start + Duration::from_secs(15)));
        assert!(!scheduler.should_heartbeat_at(scheduler.last_heartbeat + Duration::from_secs(5)));
        assert_eq!(scheduler.run_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_until_the_earlier_deadline() {
        let scheduler = Scheduler::new(config(60, 15, 0));
        let before = tokio::time::Instant::now();
        scheduler.sleep_until_next().await;
        let elapsed = before.elapsed();
        assert!(elapsed >= Duration::from_secs(14));
        assert!(elapsed <= Duration::from_secs(16));
    }
}
