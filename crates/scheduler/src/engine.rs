//! Hooks into the execution engine that drives the scheduler.
//!
//! The engine owns the clock, hosts and task execution. The scheduler only
//! reads observations through [`EngineView`] and learns about finished tasks
//! through [`CompletionEvent`]s posted on a channel.

use greensched_core::{SiteId, TaskId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::error::SchedulerError;

/// Aggregate view of one site at a scheduling point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteObservation {
    /// Total processing capacity of the site.
    pub mips: f64,
    /// Mean CPU utilization over its hosts, in [0, 1].
    pub cpu_utilization: f64,
    pub queue_length: usize,
    /// Overall load, in [0, 1].
    pub load: f64,
}

/// One host inside a site.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HostObservation {
    pub mips: f64,
    pub cpu_utilization: f64,
    pub ram_capacity: f64,
    pub ram_used: f64,
    pub bw_capacity: f64,
    pub bw_used: f64,
    pub active: bool,
    pub vm_count: usize,
}

impl HostObservation {
    pub fn free_ram_ratio(&self) -> f64 {
        free_ratio(self.ram_capacity, self.ram_used)
    }

    pub fn free_bw_ratio(&self) -> f64 {
        free_ratio(self.bw_capacity, self.bw_used)
    }
}

fn free_ratio(capacity: f64, used: f64) -> f64 {
    if capacity > 0.0 {
        ((capacity - used) / capacity).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// A task awaiting placement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaskObservation {
    pub id: TaskId,
    /// Length in million instructions.
    pub length_mi: f64,
    /// Memory requirement in MB. Values ≤ 1 are read as a fraction of 2 GB.
    pub memory: f64,
    /// Bandwidth requirement. Values ≤ 1 are read as a fraction of 1000.
    pub bandwidth: f64,
    pub priority: f64,
}

impl TaskObservation {
    pub fn new(id: TaskId, length_mi: f64) -> Self {
        Self {
            id,
            length_mi,
            memory: 0.0,
            bandwidth: 0.0,
            priority: 0.0,
        }
    }

    pub fn memory_mb(&self) -> f64 {
        if self.memory <= 1.0 {
            self.memory * 2048.0
        } else {
            self.memory
        }
    }

    pub fn bandwidth_units(&self) -> f64 {
        if self.bandwidth <= 1.0 {
            self.bandwidth * 1000.0
        } else {
            self.bandwidth
        }
    }
}

/// Read-only access to the engine's current state.
pub trait EngineView {
    /// Simulation clock, seconds.
    fn now(&self) -> f64;

    fn site_observation(&self, site: SiteId) -> SiteObservation;

    fn hosts(&self, site: SiteId) -> Vec<HostObservation>;

    /// Instantaneous power draw of a site, watts.
    fn power_draw(&self, _site: SiteId) -> f64 {
        0.0
    }
}

/// Posted by the engine when a task finishes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub task_id: TaskId,
    pub completed_at: f64,
    pub wait_time: f64,
    pub exec_time: f64,
}

/// Cloneable handle the engine uses to report completions.
#[derive(Debug, Clone)]
pub struct CompletionSender(pub(crate) UnboundedSender<CompletionEvent>);

impl CompletionSender {
    pub fn notify(&self, event: CompletionEvent) -> Result<(), SchedulerError> {
        self.0.send(event).map_err(|_| SchedulerError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fractional_requirements_are_scaled() {
        let mut t = TaskObservation::new(TaskId(1), 5000.0);
        t.memory = 0.5;
        t.bandwidth = 0.25;
        assert_eq!(t.memory_mb(), 1024.0);
        assert_eq!(t.bandwidth_units(), 250.0);

        t.memory = 512.0;
        t.bandwidth = 100.0;
        assert_eq!(t.memory_mb(), 512.0);
        assert_eq!(t.bandwidth_units(), 100.0);
    }

    #[test]
    fn free_ratios_handle_empty_capacity() {
        let h = HostObservation {
            ram_capacity: 4096.0,
            ram_used: 1024.0,
            bw_capacity: 0.0,
            ..HostObservation::default()
        };
        assert_eq!(h.free_ram_ratio(), 0.75);
        assert_eq!(h.free_bw_ratio(), 0.0);
    }

    #[test]
    fn closed_channel_is_reported() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let sender = CompletionSender(tx);
        drop(rx);
        let err = sender
            .notify(CompletionEvent {
                task_id: TaskId(1),
                completed_at: 1.0,
                wait_time: 0.0,
                exec_time: 1.0,
            })
            .unwrap_err();
        assert!(matches!(err, SchedulerError::ChannelClosed));
    }
}
