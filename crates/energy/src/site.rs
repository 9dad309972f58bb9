use std::sync::Arc;

use greensched_core::SiteId;

use crate::ledger::{EnergyLedger, Usage};

/// A compute site, fixed at construction as either plain or green-aware.
#[derive(Debug, Clone)]
pub enum Site {
    /// Grid-only site without an energy ledger.
    Plain { id: SiteId },
    /// Site backed by renewable generation and a ledger.
    GreenAware { id: SiteId, ledger: Arc<EnergyLedger> },
}

impl Site {
    pub fn plain(id: SiteId) -> Self {
        Site::Plain { id }
    }

    pub fn green(ledger: Arc<EnergyLedger>) -> Self {
        Site::GreenAware {
            id: ledger.site(),
            ledger,
        }
    }

    pub fn id(&self) -> SiteId {
        match self {
            Site::Plain { id } | Site::GreenAware { id, .. } => *id,
        }
    }

    pub fn ledger(&self) -> Option<&Arc<EnergyLedger>> {
        match self {
            Site::Plain { .. } => None,
            Site::GreenAware { ledger, .. } => Some(ledger),
        }
    }

    pub fn is_green(&self) -> bool {
        matches!(self, Site::GreenAware { .. })
    }

    /// Cumulative usage; plain sites report nothing.
    pub fn usage(&self) -> Usage {
        self.ledger().map(|l| l.usage()).unwrap_or_default()
    }

    /// Accrue generation and draw `demand_watts` for one engine tick.
    /// No-op for plain sites.
    pub fn tick(&self, now: f64, demand_watts: f64) {
        if let Some(ledger) = self.ledger() {
            ledger.accrue_generation(now);
            ledger.consume(now, demand_watts);
        }
    }
}

/// Sum of the usage of every site.
pub fn system_usage(sites: &[Site]) -> Usage {
    sites.iter().map(Site::usage).fold(Usage::default(), |acc, u| acc + u)
}

/// Share of all consumption across green-aware sites served green.
/// 1.0 when nothing has been consumed.
pub fn system_green_ratio(sites: &[Site]) -> f64 {
    let u = system_usage(sites);
    if u.total_used > 0.0 {
        u.green_used / u.total_used
    } else {
        1.0
    }
}
