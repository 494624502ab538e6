//! Service layer for custody-lineage
//!
//! Services hold the business rules between callers and the repositories.
//! Each service wraps database operations with:
//! - Input validation
//! - Transaction boundaries
//! - Event emission for audit trails
//!
//! ## Architecture
//!
//! ```text
//! CLI / embedding application
//!     ↓
//! Service Layer (services/*.rs, lineage/service.rs)
//!     ↓
//! Repository Layer (db/*.rs)
//!     ↓
//! SQLite Database
//! ```

pub mod events;
pub mod custody_service;
pub mod mass_balance_service;

// Re-exports
pub use events::{CustodyNotification, EventBus, EventListener};
pub use custody_service::ChainOfCustodyService;
pub use mass_balance_service::MassBalanceService;

use std::sync::Arc;

use crate::config::Config;
use crate::db::SupplyChainDb;
use crate::ids::IdGenerator;
use crate::lineage::{LineageService, ResolverRegistry, TraceOptions};

/// Service container for dependency injection
///
/// All services share one database handle, one id generator and one event
/// bus.
pub struct Services {
    pub custody: Arc<ChainOfCustodyService>,
    pub mass_balance: Arc<MassBalanceService>,
    pub lineage: Arc<LineageService>,
    pub events: Arc<EventBus>,
    pub db: Arc<SupplyChainDb>,
}

impl Services {
    /// Create all services over a shared database
    pub fn new(db: Arc<SupplyChainDb>, config: &Config) -> Self {
        let events = Arc::new(EventBus::new());
        let ids = Arc::new(IdGenerator::new());
        let registry = Arc::new(ResolverRegistry::with_defaults());

        Self {
            custody: Arc::new(ChainOfCustodyService::new(db.clone(), ids.clone(), events.clone())),
            mass_balance: Arc::new(MassBalanceService::new(
                db.clone(),
                events.clone(),
                config.mass_balance.clone(),
            )),
            lineage: Arc::new(LineageService::new(
                db.clone(),
                registry,
                ids,
                events.clone(),
                TraceOptions::from(&config.lineage),
                config.export_base_url.clone(),
            )),
            events,
            db,
        }
    }

    /// In-memory database with default config (for testing)
    pub fn in_memory() -> Result<Self, crate::error::LineageError> {
        let db = Arc::new(SupplyChainDb::open_in_memory()?);
        Ok(Self::new(db, &Config::default()))
    }
}
