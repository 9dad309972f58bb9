//! Renewable generation profiles and the per-site green/brown energy ledger.

pub mod error;
pub mod ledger;
pub mod loader;
pub mod profile;
pub mod site;
pub mod source;

pub use error::ProfileError;
pub use ledger::{BalanceReport, ConsumptionSplit, EnergyLedger, GreenStatus, LedgerState, Usage};
pub use profile::{GenerationProfile, GenerationSample};
pub use site::Site;
pub use source::{GenerationSource, SolarModel};
