//! Heartbeat Scheduler
//!
//! A recurring trigger, independent of user activity. Each tick queries
//! scheduled tasks due within the next interval; if any exist it
//! synthesizes a turn through the Agent Loop with a system-generated input
//! so the agent can act proactively. No due tasks, no model call.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::agent::turn::{Agent, AgentEvent};
use crate::store::Store;

pub struct Heartbeat {
    agent: Arc<Agent>,
    store: Arc<Store>,
    interval: Duration,
}

impl Heartbeat {
    pub fn new(agent: Arc<Agent>, store: Arc<Store>, interval: Duration) -> Self {
        Self {
            agent,
            store,
            interval,
        }
    }

    /// Run forever. Spawn this as a background task.
    pub async fn run(self) {
        info!("Heartbeat started (interval {:?})", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick of a tokio interval fires immediately; a heartbeat
        // should not act until one full interval has passed
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match self.tick().await {
                Ok(true) => {}
                Ok(false) => debug!("Heartbeat: nothing due"),
                Err(e) => warn!("Heartbeat tick failed: {:#}", e),
            }
        }
    }

    /// One tick: synthesize a turn if anything is due within the interval.
    /// Returns whether a turn was run.
    pub async fn tick(&self) -> anyhow::Result<bool> {
        let due = self.store.due_tasks(self.interval)?;
        if due.is_empty() {
            return Ok(false);
        }

        let lines: Vec<String> = due
            .iter()
            .map(|task| {
                format!(
                    "- #{} {} (due {})",
                    task.id,
                    task.title,
                    task.due_at.as_deref().unwrap_or("unknown")
                )
            })
            .collect();
        let input = format!(
            "System heartbeat: {} scheduled task(s) are due.\n{}\n\
             Take appropriate action: do the work, update the task status, or reschedule.",
            due.len(),
            lines.join("\n")
        );

        info!("Heartbeat: synthesizing turn for {} due task(s)", due.len());
        let events = self.agent.collect_turn(input).await;
        for event in &events {
            if let AgentEvent::Error { content } = event {
                warn!("Heartbeat turn error: {}", content);
            }
        }
        debug!("Heartbeat turn produced {} events", events.len());
        Ok(true)
    }
}
