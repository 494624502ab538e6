//! Custody Lineage - supply-chain lineage and mass-balance engine
//!
//! Tracks physical palm-oil product as it is split, merged and transformed
//! between facilities, and keeps a traceable graph from farm plot to export
//! shipment for EUDR due diligence.
//!
//! ## Architecture
//!
//! - **Chain of custody**: `CustodyChain` records with remaining balances,
//!   EPCIS-style custody events and one mass-balance event per operation
//! - **Mass balance**: conservation checks, efficiency and anomaly detection
//!   over recorded events
//! - **Lineage**: bounded graph traversal across plots, deliveries, lots,
//!   shipments and chains, with risk and compliance assessment
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/custody-lineage/
//! ├── custody.db             # SQLite database (WAL mode)
//! └── config.toml            # Configuration
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod ids;
pub mod lineage;
pub mod services;

// Re-exports
pub use config::Config;
pub use db::SupplyChainDb;
pub use error::LineageError;
pub use ids::IdGenerator;
pub use lineage::{EntityType, LineageResult, LineageService};
pub use services::{ChainOfCustodyService, EventBus, MassBalanceService, Services};
