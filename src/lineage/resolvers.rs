//! Per-entity-type lookups for the lineage walk
//!
//! Each traceable entity type has one [`EntityResolver`] that knows how to
//! load the entity and which joins lead one stage up or down the supply
//! chain. The traversal only talks to the [`ResolverRegistry`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use rusqlite::Connection;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::db::models::format_timestamp;
use crate::db::{custody_chains, entities, mass_balance, CustodyChain};
use crate::error::LineageError;

// =============================================================================
// Entity Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Supplier,
    Plot,
    Facility,
    Delivery,
    ProductionLot,
    CustodyChain,
    Shipment,
}

impl EntityType {
    pub const ALL: [EntityType; 7] = [
        Self::Supplier,
        Self::Plot,
        Self::Facility,
        Self::Delivery,
        Self::ProductionLot,
        Self::CustodyChain,
        Self::Shipment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Supplier => "supplier",
            Self::Plot => "plot",
            Self::Facility => "facility",
            Self::Delivery => "delivery",
            Self::ProductionLot => "production_lot",
            Self::CustodyChain => "custody_chain",
            Self::Shipment => "shipment",
        }
    }

    /// Node key, `type:id`
    pub fn key(&self, id: &str) -> String {
        format!("{}:{}", self.as_str(), id)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = LineageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| LineageError::InvalidInput(format!("unknown entity type '{}'", s)))
    }
}

// =============================================================================
// Resolver Contract
// =============================================================================

/// What a node shows about its entity
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedEntity {
    pub name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub risk_level: Option<String>,
    pub certifications: Vec<String>,
    pub deforestation_risk: Option<String>,
    pub legality_status: Option<String>,
    pub data: serde_json::Value,
}

/// A neighbouring entity and the relationship that reaches it
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub relationship: String,
    pub quantity: Option<Decimal>,
    pub date: Option<String>,
    pub metadata: serde_json::Value,
}

impl Link {
    fn new(entity_type: EntityType, entity_id: impl Into<String>, relationship: &str) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            relationship: relationship.to_string(),
            quantity: None,
            date: None,
            metadata: serde_json::Value::Null,
        }
    }

    fn quantity(mut self, quantity: Option<Decimal>) -> Self {
        self.quantity = quantity;
        self
    }

    fn date(mut self, date: impl ToString) -> Self {
        self.date = Some(date.to_string());
        self
    }

    fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Loads one entity type and discovers its neighbours
///
/// `downstream` returns entities closer to export, `upstream` entities
/// closer to the plot. Every downstream link of A to B must show up as an
/// upstream link of B to A with the same relationship, so a forward and a
/// backward walk agree on the edges between two nodes.
pub trait EntityResolver: Send + Sync {
    fn entity_type(&self) -> EntityType;

    fn resolve(&self, conn: &Connection, id: &str) -> Result<Option<ResolvedEntity>, LineageError>;

    fn downstream(&self, conn: &Connection, id: &str) -> Result<Vec<Link>, LineageError>;

    fn upstream(&self, conn: &Connection, id: &str) -> Result<Vec<Link>, LineageError>;
}

pub mod relationships {
    pub const SUPPLIES_PLOT: &str = "supplies_plot";
    pub const OPERATES_FACILITY: &str = "operates_facility";
    pub const HARVEST_DELIVERY: &str = "harvest_delivery";
    pub const DELIVERED_TO: &str = "delivered_to";
    pub const PRODUCTION_INPUT: &str = "production_input";
    pub const PRODUCED_AT: &str = "produced_at";
    pub const EXPORT_SHIPMENT: &str = "export_shipment";
    pub const SHIPPED_FROM: &str = "shipped_from";
    pub const CHAIN_ORIGIN: &str = "chain_origin";
}

use relationships::*;

// =============================================================================
// Registry
// =============================================================================

/// Entity type to resolver map
pub struct ResolverRegistry {
    resolvers: HashMap<EntityType, Box<dyn EntityResolver>>,
}

impl ResolverRegistry {
    /// Registry with no resolvers
    pub fn empty() -> Self {
        Self {
            resolvers: HashMap::new(),
        }
    }

    /// Registry covering every built-in entity type
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(SupplierResolver));
        registry.register(Box::new(PlotResolver));
        registry.register(Box::new(FacilityResolver));
        registry.register(Box::new(DeliveryResolver));
        registry.register(Box::new(ProductionLotResolver));
        registry.register(Box::new(CustodyChainResolver));
        registry.register(Box::new(ShipmentResolver));
        registry
    }

    /// Add or replace the resolver for its entity type
    pub fn register(&mut self, resolver: Box<dyn EntityResolver>) {
        self.resolvers.insert(resolver.entity_type(), resolver);
    }

    pub fn get(&self, entity_type: EntityType) -> Result<&dyn EntityResolver, LineageError> {
        self.resolvers
            .get(&entity_type)
            .map(|r| r.as_ref())
            .ok_or_else(|| {
                LineageError::InvalidInput(format!("no resolver registered for '{}'", entity_type))
            })
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}

impl Default for ResolverRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// =============================================================================
// Built-in Resolvers
// =============================================================================

pub struct SupplierResolver;

impl EntityResolver for SupplierResolver {
    fn entity_type(&self) -> EntityType {
        EntityType::Supplier
    }

    fn resolve(&self, conn: &Connection, id: &str) -> Result<Option<ResolvedEntity>, LineageError> {
        let Some(supplier) = entities::get_supplier(conn, id)? else {
            return Ok(None);
        };
        Ok(Some(ResolvedEntity {
            name: Some(supplier.name.clone()),
            risk_level: Some(supplier.risk_level.clone()),
            certifications: supplier.certifications.clone(),
            legality_status: Some(supplier.legality_status.clone()),
            data: serde_json::to_value(&supplier)?,
            ..Default::default()
        }))
    }

    fn downstream(&self, conn: &Connection, id: &str) -> Result<Vec<Link>, LineageError> {
        let plots = entities::plots_for_supplier(conn, id)?
            .into_iter()
            .map(|p| Link::new(EntityType::Plot, p.id, SUPPLIES_PLOT));
        let facilities = entities::facilities_for_supplier(conn, id)?
            .into_iter()
            .map(|f| Link::new(EntityType::Facility, f.id, OPERATES_FACILITY));
        Ok(plots.chain(facilities).collect())
    }

    fn upstream(&self, _conn: &Connection, _id: &str) -> Result<Vec<Link>, LineageError> {
        Ok(Vec::new())
    }
}

pub struct PlotResolver;

impl EntityResolver for PlotResolver {
    fn entity_type(&self) -> EntityType {
        EntityType::Plot
    }

    fn resolve(&self, conn: &Connection, id: &str) -> Result<Option<ResolvedEntity>, LineageError> {
        let Some(plot) = entities::get_plot(conn, id)? else {
            return Ok(None);
        };
        Ok(Some(ResolvedEntity {
            name: Some(plot.name.clone()),
            latitude: plot.latitude,
            longitude: plot.longitude,
            risk_level: Some(plot.risk_level.clone()),
            certifications: plot.certifications.clone(),
            deforestation_risk: Some(plot.deforestation_risk.clone()),
            legality_status: Some(plot.legality_status.clone()),
            data: serde_json::to_value(&plot)?,
        }))
    }

    fn downstream(&self, conn: &Connection, id: &str) -> Result<Vec<Link>, LineageError> {
        let mut links: Vec<Link> = entities::deliveries_for_plot(conn, id)?
            .into_iter()
            .map(|d| {
                Link::new(EntityType::Delivery, d.id, HARVEST_DELIVERY)
                    .quantity(Some(d.quantity))
                    .date(d.delivery_date)
            })
            .collect();
        links.extend(
            custody_chains::list_by_source_plot(conn, id)?
                .into_iter()
                .map(chain_origin_link),
        );
        Ok(links)
    }

    fn upstream(&self, conn: &Connection, id: &str) -> Result<Vec<Link>, LineageError> {
        Ok(entities::get_plot(conn, id)?
            .and_then(|p| p.supplier_id)
            .map(|s| Link::new(EntityType::Supplier, s, SUPPLIES_PLOT))
            .into_iter()
            .collect())
    }
}

pub struct FacilityResolver;

impl EntityResolver for FacilityResolver {
    fn entity_type(&self) -> EntityType {
        EntityType::Facility
    }

    fn resolve(&self, conn: &Connection, id: &str) -> Result<Option<ResolvedEntity>, LineageError> {
        let Some(facility) = entities::get_facility(conn, id)? else {
            return Ok(None);
        };
        Ok(Some(ResolvedEntity {
            name: Some(facility.name.clone()),
            latitude: facility.latitude,
            longitude: facility.longitude,
            risk_level: Some(facility.risk_level.clone()),
            certifications: facility.certifications.clone(),
            deforestation_risk: None,
            legality_status: Some(facility.legality_status.clone()),
            data: serde_json::to_value(&facility)?,
        }))
    }

    fn downstream(&self, conn: &Connection, id: &str) -> Result<Vec<Link>, LineageError> {
        let lots = entities::lots_at_facility(conn, id)?.into_iter().map(|lot| {
            Link::new(EntityType::ProductionLot, lot.id, PRODUCED_AT)
                .quantity(Some(lot.quantity))
                .date(lot.production_date)
        });
        let shipments = entities::shipments_from_facility(conn, id)?
            .into_iter()
            .map(|sh| {
                Link::new(EntityType::Shipment, sh.id, SHIPPED_FROM)
                    .quantity(Some(sh.quantity))
                    .date(sh.shipment_date)
            });
        let chains = custody_chains::list_by_source_facility(conn, id)?
            .into_iter()
            .map(chain_origin_link);
        Ok(lots.chain(shipments).chain(chains).collect())
    }

    fn upstream(&self, conn: &Connection, id: &str) -> Result<Vec<Link>, LineageError> {
        let mut links: Vec<Link> = entities::get_facility(conn, id)?
            .and_then(|f| f.supplier_id)
            .map(|s| Link::new(EntityType::Supplier, s, OPERATES_FACILITY))
            .into_iter()
            .collect();
        links.extend(entities::deliveries_to_facility(conn, id)?.into_iter().map(|d| {
            Link::new(EntityType::Delivery, d.id, DELIVERED_TO)
                .quantity(Some(d.quantity))
                .date(d.delivery_date)
        }));
        Ok(links)
    }
}

pub struct DeliveryResolver;

impl EntityResolver for DeliveryResolver {
    fn entity_type(&self) -> EntityType {
        EntityType::Delivery
    }

    fn resolve(&self, conn: &Connection, id: &str) -> Result<Option<ResolvedEntity>, LineageError> {
        let Some(delivery) = entities::get_delivery(conn, id)? else {
            return Ok(None);
        };
        Ok(Some(ResolvedEntity {
            name: Some(format!("Delivery {}", delivery.delivery_date)),
            data: serde_json::to_value(&delivery)?,
            ..Default::default()
        }))
    }

    fn downstream(&self, conn: &Connection, id: &str) -> Result<Vec<Link>, LineageError> {
        let mut links: Vec<Link> = entities::lots_for_delivery(conn, id)?
            .into_iter()
            .map(|(lot, quantity)| {
                Link::new(EntityType::ProductionLot, lot.id, PRODUCTION_INPUT)
                    .quantity(quantity)
                    .date(lot.production_date)
            })
            .collect();
        if let Some(delivery) = entities::get_delivery(conn, id)? {
            links.push(
                Link::new(EntityType::Facility, delivery.facility_id, DELIVERED_TO)
                    .quantity(Some(delivery.quantity))
                    .date(delivery.delivery_date),
            );
        }
        Ok(links)
    }

    fn upstream(&self, conn: &Connection, id: &str) -> Result<Vec<Link>, LineageError> {
        let Some(delivery) = entities::get_delivery(conn, id)? else {
            return Ok(Vec::new());
        };
        Ok(vec![Link::new(EntityType::Plot, delivery.plot_id, HARVEST_DELIVERY)
            .quantity(Some(delivery.quantity))
            .date(delivery.delivery_date)])
    }
}

pub struct ProductionLotResolver;

impl EntityResolver for ProductionLotResolver {
    fn entity_type(&self) -> EntityType {
        EntityType::ProductionLot
    }

    fn resolve(&self, conn: &Connection, id: &str) -> Result<Option<ResolvedEntity>, LineageError> {
        let Some(lot) = entities::get_production_lot(conn, id)? else {
            return Ok(None);
        };
        Ok(Some(ResolvedEntity {
            name: Some(format!("{} lot {}", lot.product_type, lot.production_date)),
            data: serde_json::to_value(&lot)?,
            ..Default::default()
        }))
    }

    fn downstream(&self, conn: &Connection, id: &str) -> Result<Vec<Link>, LineageError> {
        Ok(entities::shipments_for_lot(conn, id)?
            .into_iter()
            .map(|(shipment, quantity)| {
                Link::new(EntityType::Shipment, shipment.id, EXPORT_SHIPMENT)
                    .quantity(quantity)
                    .date(shipment.shipment_date)
            })
            .collect())
    }

    fn upstream(&self, conn: &Connection, id: &str) -> Result<Vec<Link>, LineageError> {
        let mut links: Vec<Link> = entities::deliveries_for_lot(conn, id)?
            .into_iter()
            .map(|(delivery, quantity)| {
                Link::new(EntityType::Delivery, delivery.id, PRODUCTION_INPUT)
                    .quantity(quantity)
                    .date(delivery.delivery_date)
            })
            .collect();
        if let Some(lot) = entities::get_production_lot(conn, id)? {
            links.push(
                Link::new(EntityType::Facility, lot.facility_id, PRODUCED_AT)
                    .quantity(Some(lot.quantity))
                    .date(lot.production_date),
            );
        }
        Ok(links)
    }
}

pub struct ShipmentResolver;

impl EntityResolver for ShipmentResolver {
    fn entity_type(&self) -> EntityType {
        EntityType::Shipment
    }

    fn resolve(&self, conn: &Connection, id: &str) -> Result<Option<ResolvedEntity>, LineageError> {
        let Some(shipment) = entities::get_shipment(conn, id)? else {
            return Ok(None);
        };
        Ok(Some(ResolvedEntity {
            name: Some(format!("Shipment to {}", shipment.destination)),
            data: serde_json::to_value(&shipment)?,
            ..Default::default()
        }))
    }

    fn downstream(&self, _conn: &Connection, _id: &str) -> Result<Vec<Link>, LineageError> {
        Ok(Vec::new())
    }

    fn upstream(&self, conn: &Connection, id: &str) -> Result<Vec<Link>, LineageError> {
        let mut links: Vec<Link> = entities::lots_for_shipment(conn, id)?
            .into_iter()
            .map(|(lot, quantity)| {
                Link::new(EntityType::ProductionLot, lot.id, EXPORT_SHIPMENT)
                    .quantity(quantity)
                    .date(lot.production_date)
            })
            .collect();
        if let Some(shipment) = entities::get_shipment(conn, id)? {
            links.push(
                Link::new(EntityType::Facility, shipment.origin_facility_id, SHIPPED_FROM)
                    .quantity(Some(shipment.quantity))
                    .date(shipment.shipment_date),
            );
        }
        Ok(links)
    }
}

/// Chains follow mass-balance events; origins follow the source columns
pub struct CustodyChainResolver;

impl EntityResolver for CustodyChainResolver {
    fn entity_type(&self) -> EntityType {
        EntityType::CustodyChain
    }

    fn resolve(&self, conn: &Connection, id: &str) -> Result<Option<ResolvedEntity>, LineageError> {
        let Some(chain) = custody_chains::get_chain(conn, id)? else {
            return Ok(None);
        };
        Ok(Some(ResolvedEntity {
            name: Some(format!("{} {}", chain.product_type, chain.id)),
            data: serde_json::to_value(&chain)?,
            ..Default::default()
        }))
    }

    fn downstream(&self, conn: &Connection, id: &str) -> Result<Vec<Link>, LineageError> {
        let mut links = Vec::new();
        for event in mass_balance::list_consuming(conn, id)? {
            for child_id in &event.child_chain_ids {
                let quantity = custody_chains::get_chain(conn, child_id)?.map(|c| c.total_quantity);
                links.push(
                    Link::new(EntityType::CustodyChain, child_id.as_str(), event.event_type.as_str())
                        .quantity(quantity)
                        .date(format_timestamp(&event.process_date))
                        .metadata(serde_json::json!({
                            "massBalanceEventId": event.id,
                            "conversionRate": event.conversion_rate,
                        })),
                );
            }
        }
        Ok(links)
    }

    fn upstream(&self, conn: &Connection, id: &str) -> Result<Vec<Link>, LineageError> {
        let Some(chain) = custody_chains::get_chain(conn, id)? else {
            return Ok(Vec::new());
        };

        let mut links = Vec::new();
        for event in mass_balance::list_producing(conn, id)? {
            let parents = event
                .parent_chain_id
                .iter()
                .chain(event.source_chain_ids.iter());
            for parent_id in parents {
                links.push(
                    Link::new(EntityType::CustodyChain, parent_id.as_str(), event.event_type.as_str())
                        .quantity(Some(chain.total_quantity))
                        .date(format_timestamp(&event.process_date))
                        .metadata(serde_json::json!({
                            "massBalanceEventId": event.id,
                            "conversionRate": event.conversion_rate,
                        })),
                );
            }
        }

        if let Some(plot_id) = &chain.source_plot_id {
            links.push(
                Link::new(EntityType::Plot, plot_id.as_str(), CHAIN_ORIGIN)
                    .quantity(Some(chain.total_quantity)),
            );
        }
        if let Some(facility_id) = &chain.source_facility_id {
            links.push(
                Link::new(EntityType::Facility, facility_id.as_str(), CHAIN_ORIGIN)
                    .quantity(Some(chain.total_quantity)),
            );
        }
        Ok(links)
    }
}

fn chain_origin_link(chain: CustodyChain) -> Link {
    let date = chain.created_at.clone();
    Link::new(EntityType::CustodyChain, chain.id, CHAIN_ORIGIN)
        .quantity(Some(chain.total_quantity))
        .date(date)
}
