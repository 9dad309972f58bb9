//! A small synthetic execution engine for `greensched simulate`.
//!
//! Tasks run one at a time per host in submission order. Hosts draw idle
//! power plus a busy increment, which is what the sites' ledgers consume.

use greensched_core::{SiteId, TaskId};
use greensched_scheduler::{CompletionEvent, EngineView, HostObservation, SiteObservation, TaskObservation};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const IDLE_WATTS: f64 = 100.0;
const BUSY_WATTS: f64 = 150.0;

#[derive(Debug, Clone)]
struct SimHost {
    mips: f64,
    ram_mb: f64,
    bw: f64,
    free_at: f64,
}

#[derive(Debug, Clone, Copy)]
struct Running {
    task: TaskId,
    site: usize,
    host: usize,
    submitted_at: f64,
    started_at: f64,
    finish_at: f64,
}

pub struct SyntheticEngine {
    now: f64,
    sites: Vec<Vec<SimHost>>,
    running: Vec<Running>,
    rng: StdRng,
    next_task: u64,
}

impl SyntheticEngine {
    pub fn new(sites: usize, hosts_per_site: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let sites = (0..sites)
            .map(|_| {
                (0..hosts_per_site)
                    .map(|_| SimHost {
                        mips: rng.gen_range(1000.0..4000.0),
                        ram_mb: 8192.0,
                        bw: 1000.0,
                        free_at: 0.0,
                    })
                    .collect()
            })
            .collect();
        Self {
            now: 0.0,
            sites,
            running: Vec::new(),
            rng,
            next_task: 0,
        }
    }

    pub fn advance(&mut self, dt: f64) {
        self.now += dt;
    }

    pub fn idle(&self) -> bool {
        self.running.is_empty()
    }

    /// Reset the clock-relative host state for a new episode.
    pub fn reset(&mut self) {
        self.now = 0.0;
        self.running.clear();
        for host in self.sites.iter_mut().flatten() {
            host.free_at = 0.0;
        }
    }

    pub fn next_task(&mut self) -> TaskObservation {
        self.next_task += 1;
        TaskObservation {
            id: TaskId(self.next_task),
            length_mi: self.rng.gen_range(10_000.0..200_000.0),
            memory: self.rng.gen_range(0.05..0.5),
            bandwidth: self.rng.gen_range(0.0..0.2),
            priority: self.rng.gen_range(0..10) as f64,
        }
    }

    /// Queue `task` on a host; it starts once the host is free.
    pub fn submit(&mut self, task: &TaskObservation, site: SiteId, host: usize) {
        let Some(h) = self.sites.get_mut(site.0).and_then(|s| s.get_mut(host)) else {
            return;
        };
        let started_at = h.free_at.max(self.now);
        let finish_at = started_at + task.length_mi / h.mips;
        h.free_at = finish_at;
        self.running.push(Running {
            task: task.id,
            site: site.0,
            host,
            submitted_at: self.now,
            started_at,
            finish_at,
        });
    }

    /// Remove and report tasks finished by the current clock.
    pub fn collect_finished(&mut self) -> Vec<CompletionEvent> {
        let now = self.now;
        let (done, running): (Vec<Running>, Vec<Running>) = std::mem::take(&mut self.running)
            .into_iter()
            .partition(|r| r.finish_at <= now);
        self.running = running;
        done.into_iter()
            .map(|r| CompletionEvent {
                task_id: r.task,
                completed_at: r.finish_at,
                wait_time: r.started_at - r.submitted_at,
                exec_time: r.finish_at - r.started_at,
            })
            .collect()
    }

    fn busy(&self, site: usize, host: usize) -> bool {
        self.running
            .iter()
            .any(|r| r.site == site && r.host == host && r.started_at <= self.now)
    }
}

impl EngineView for SyntheticEngine {
    fn now(&self) -> f64 {
        self.now
    }

    fn site_observation(&self, site: SiteId) -> SiteObservation {
        let Some(hosts) = self.sites.get(site.0) else {
            return SiteObservation::default();
        };
        let busy = (0..hosts.len()).filter(|&h| self.busy(site.0, h)).count();
        let util = if hosts.is_empty() { 0.0 } else { busy as f64 / hosts.len() as f64 };
        SiteObservation {
            mips: hosts.iter().map(|h| h.mips).sum(),
            cpu_utilization: util,
            queue_length: self.running.iter().filter(|r| r.site == site.0).count(),
            load: util,
        }
    }

    fn hosts(&self, site: SiteId) -> Vec<HostObservation> {
        let Some(hosts) = self.sites.get(site.0) else {
            return Vec::new();
        };
        hosts
            .iter()
            .enumerate()
            .map(|(i, h)| {
                let queued = self.running.iter().filter(|r| r.site == site.0 && r.host == i).count();
                let busy = self.busy(site.0, i);
                HostObservation {
                    mips: h.mips,
                    cpu_utilization: if busy { 1.0 } else { 0.0 },
                    ram_capacity: h.ram_mb,
                    ram_used: 0.0,
                    bw_capacity: h.bw,
                    bw_used: 0.0,
                    active: busy,
                    vm_count: queued,
                }
            })
            .collect()
    }

    fn power_draw(&self, site: SiteId) -> f64 {
        let Some(hosts) = self.sites.get(site.0) else {
            return 0.0;
        };
        (0..hosts.len())
            .map(|h| if self.busy(site.0, h) { IDLE_WATTS + BUSY_WATTS } else { IDLE_WATTS })
            .sum()
    }
}
