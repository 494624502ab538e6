//! Custody Lineage CLI
//!
//! Records custody operations and runs lineage traces against a local
//! SQLite store. Every command prints its result as pretty JSON on stdout;
//! logs go to stderr.
//!
//! ## Usage
//!
//! ```bash
//! # Harvest 1000 kg of FFB from a plot
//! custody-lineage create-chain --product-type FFB --quantity 1000 --source-plot PLOT-1
//!
//! # Split 600 to MILL-2 and 400 to MILL-3
//! custody-lineage split CHAIN-LOYW3V28-9F2C41AB --part 600@MILL-2 --part 400@MILL-3 --location COLLECT-1
//!
//! # Press FFB into CPO at a 21% extraction rate
//! custody-lineage transform SPLIT-... --input 600 --rate 0.21 --product-type CPO \
//!     --destination REFINERY-1 --location MILL-2
//!
//! # Trace everything downstream of a plot and save a report
//! custody-lineage trace plot PLOT-1
//! custody-lineage report generate forward_trace plot PLOT-1
//! ```

use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use custody_lineage::db::custody_chains::ChainQuery;
use custody_lineage::db::mass_balance::TimeRange;
use custody_lineage::db::ChainStatus;
use custody_lineage::lineage::{EntityType, GenerateReportInput};
use custody_lineage::services::custody_service::{
    CreateChainInput, MergeChainsInput, SplitChainInput, SplitPart, TransformChainInput,
};
use custody_lineage::services::events::spawn_logging_listener;
use custody_lineage::{Config, Services, SupplyChainDb};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "custody-lineage")]
#[command(about = "Supply-chain lineage and mass-balance engine")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "CUSTODY_LINEAGE_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a custody chain at harvest or intake
    CreateChain {
        #[arg(long)]
        product_type: String,
        #[arg(long)]
        quantity: Decimal,
        #[arg(long)]
        source_plot: Option<String>,
        #[arg(long)]
        source_facility: Option<String>,
        #[arg(long)]
        destination: Option<String>,
        #[arg(long)]
        quality_grade: Option<String>,
        #[arg(long)]
        batch: Option<String>,
        /// YYYY-MM-DD
        #[arg(long)]
        harvest_date: Option<NaiveDate>,
    },

    /// Split a chain into child chains
    Split {
        chain_id: String,
        /// QUANTITY or QUANTITY@DESTINATION, repeatable
        #[arg(long = "part", value_parser = parse_split, required = true)]
        parts: Vec<SplitPart>,
        #[arg(long)]
        location: String,
        #[arg(long)]
        notes: Option<String>,
    },

    /// Merge the remaining quantity of several chains
    Merge {
        #[arg(required = true, num_args = 1..)]
        chain_ids: Vec<String>,
        #[arg(long)]
        destination: String,
        #[arg(long)]
        product_type: String,
        #[arg(long)]
        location: String,
        #[arg(long)]
        quality_grade: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },

    /// Convert part of a chain into another product
    Transform {
        chain_id: String,
        #[arg(long)]
        input: Decimal,
        #[arg(long)]
        rate: Decimal,
        #[arg(long)]
        product_type: String,
        #[arg(long)]
        destination: String,
        #[arg(long)]
        location: String,
        #[arg(long)]
        quality_grade: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },

    /// List chains, newest first
    ListChains {
        /// active or completed
        #[arg(long)]
        status: Option<ChainStatus>,
        #[arg(long)]
        product_type: Option<String>,
        /// Matches source or destination facility
        #[arg(long)]
        facility: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },

    /// Show a chain and its custody events
    History { chain_id: String },

    /// Check mass balance for a chain
    Validate { chain_id: String },

    /// Efficiency for a chain or a facility
    Efficiency {
        #[arg(long, conflicts_with = "facility", required_unless_present = "facility")]
        chain: Option<String>,
        #[arg(long)]
        facility: Option<String>,
        /// RFC 3339 lower bound
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        /// RFC 3339 upper bound
        #[arg(long)]
        to: Option<DateTime<Utc>>,
    },

    /// Conversion-rate and quantity outliers
    Anomalies {
        #[arg(long)]
        facility: Option<String>,
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        #[arg(long)]
        to: Option<DateTime<Utc>>,
    },

    /// Trace lineage from an entity
    Trace {
        entity_type: EntityType,
        entity_id: String,
        #[arg(long, value_enum, default_value_t = TraceMode::Forward)]
        direction: TraceMode,
    },

    /// Lineage reports
    #[command(subcommand)]
    Report(ReportCommand),
}

#[derive(Subcommand, Debug)]
enum ReportCommand {
    /// Trace and persist a report
    Generate {
        /// forward_trace, backward_trace or full_lineage
        report_type: String,
        entity_type: String,
        entity_id: String,
        #[arg(long, default_value = "json")]
        format: String,
        #[arg(long)]
        generated_by: Option<String>,
    },
    /// Show one report
    Show { report_id: String },
    /// List reports, newest first
    List {
        #[arg(long)]
        target: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TraceMode {
    Forward,
    Backward,
    Full,
}

fn parse_split(s: &str) -> Result<SplitPart, String> {
    let (quantity, destination) = match s.split_once('@') {
        Some((q, d)) => (q, Some(d.to_string())),
        None => (s, None),
    };
    let quantity: Decimal = quantity
        .trim()
        .parse()
        .map_err(|e| format!("invalid quantity '{}': {}", quantity, e))?;
    Ok(SplitPart {
        quantity,
        destination_facility_id: destination,
        quality_grade: None,
    })
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs on stderr so stdout stays machine-readable
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("custody_lineage=info".parse()?),
        )
        .init();

    let args = Args::parse();

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)
            .with_context(|| format!("loading config from {}", config_path.display()))?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }

    tokio::fs::create_dir_all(&config.storage_dir)
        .await
        .with_context(|| format!("creating {}", config.storage_dir.display()))?;

    // Save default config if it doesn't exist
    let config_path = config.config_path();
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let db_path = config.database_path();
    let db = Arc::new(
        SupplyChainDb::open(&db_path)
            .with_context(|| format!("opening database at {}", db_path.display()))?,
    );
    let services = Services::new(db, &config);
    let _listener = spawn_logging_listener(services.events.clone());

    run(args.command, &services).await
}

async fn run(command: Command, services: &Services) -> anyhow::Result<()> {
    match command {
        Command::CreateChain {
            product_type,
            quantity,
            source_plot,
            source_facility,
            destination,
            quality_grade,
            batch,
            harvest_date,
        } => {
            let chain = services
                .custody
                .create_chain(CreateChainInput {
                    source_plot_id: source_plot,
                    source_facility_id: source_facility,
                    destination_facility_id: destination,
                    product_type,
                    total_quantity: quantity,
                    quality_grade,
                    batch_number: batch,
                    harvest_date,
                    expiry_date: None,
                })
                .await?;
            print_json(&chain)
        }

        Command::Split {
            chain_id,
            parts,
            location,
            notes,
        } => {
            let result = services
                .custody
                .split_chain(SplitChainInput {
                    parent_chain_id: chain_id,
                    splits: parts,
                    process_location_id: location,
                    notes,
                })
                .await?;
            print_json(&result)
        }

        Command::Merge {
            chain_ids,
            destination,
            product_type,
            location,
            quality_grade,
            notes,
        } => {
            let result = services
                .custody
                .merge_chains(MergeChainsInput {
                    parent_chain_ids: chain_ids,
                    destination_facility_id: destination,
                    product_type,
                    process_location_id: location,
                    quality_grade,
                    notes,
                })
                .await?;
            print_json(&result)
        }

        Command::Transform {
            chain_id,
            input,
            rate,
            product_type,
            destination,
            location,
            quality_grade,
            notes,
        } => {
            let result = services
                .custody
                .transform_chain(TransformChainInput {
                    source_chain_id: chain_id,
                    input_quantity: input,
                    conversion_rate: rate,
                    output_product_type: product_type,
                    destination_facility_id: destination,
                    process_location_id: location,
                    quality_grade,
                    notes,
                })
                .await?;
            print_json(&result)
        }

        Command::ListChains {
            status,
            product_type,
            facility,
            limit,
        } => {
            let chains = services
                .custody
                .list_chains(ChainQuery {
                    status,
                    product_type,
                    facility_id: facility,
                    limit,
                    offset: 0,
                })
                .await?;
            print_json(&chains)
        }

        Command::History { chain_id } => {
            let chain = services
                .custody
                .get_chain(&chain_id)
                .await?
                .with_context(|| format!("custody chain not found: {}", chain_id))?;
            let events = services.custody.get_chain_history(&chain_id).await?;
            let children = services.custody.list_child_chains(&chain_id).await?;
            print_json(&serde_json::json!({
                "chain": chain,
                "events": events,
                "childChains": children,
            }))
        }

        Command::Validate { chain_id } => {
            print_json(&services.mass_balance.validate_chain(&chain_id).await?)
        }

        Command::Efficiency {
            chain,
            facility,
            from,
            to,
        } => {
            let range = TimeRange { start: from, end: to };
            let report = match (chain, facility) {
                (Some(chain_id), _) => services.mass_balance.get_chain_efficiency(&chain_id, range).await?,
                (None, Some(facility_id)) => {
                    services.mass_balance.get_facility_efficiency(&facility_id, range).await?
                }
                (None, None) => anyhow::bail!("either --chain or --facility is required"),
            };
            print_json(&report)
        }

        Command::Anomalies { facility, from, to } => {
            let anomalies = services
                .mass_balance
                .detect_anomalies(facility.as_deref(), TimeRange { start: from, end: to })
                .await?;
            print_json(&anomalies)
        }

        Command::Trace {
            entity_type,
            entity_id,
            direction,
        } => {
            let result = match direction {
                TraceMode::Forward => services.lineage.trace_forward(&entity_id, entity_type).await?,
                TraceMode::Backward => services.lineage.trace_backward(&entity_id, entity_type).await?,
                TraceMode::Full => services.lineage.get_full_lineage(&entity_id, entity_type).await?,
            };
            print_json(&result)
        }

        Command::Report(ReportCommand::Generate {
            report_type,
            entity_type,
            entity_id,
            format,
            generated_by,
        }) => {
            let report = services
                .lineage
                .generate_report(GenerateReportInput {
                    report_type,
                    target_entity_id: entity_id,
                    target_entity_type: entity_type,
                    export_format: format,
                    generated_by,
                })
                .await?;
            print_json(&report)
        }

        Command::Report(ReportCommand::Show { report_id }) => {
            let report = services
                .lineage
                .get_report(&report_id)
                .await?
                .with_context(|| format!("lineage report not found: {}", report_id))?;
            print_json(&report)
        }

        Command::Report(ReportCommand::List { target, limit }) => {
            print_json(&services.lineage.list_reports(target.as_deref(), limit).await?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_split() {
        let plain = parse_split("400").unwrap();
        assert_eq!(plain.quantity, dec!(400));
        assert!(plain.destination_facility_id.is_none());

        let routed = parse_split("600.5@MILL-2").unwrap();
        assert_eq!(routed.quantity, dec!(600.5));
        assert_eq!(routed.destination_facility_id.as_deref(), Some("MILL-2"));

        assert!(parse_split("lots@MILL-2").is_err());
    }

    #[test]
    fn test_cli_parses_trace() {
        let args = Args::try_parse_from(["custody-lineage", "trace", "production_lot", "LOT-1", "--direction", "full"]).unwrap();
        match args.command {
            Command::Trace { entity_type, direction, .. } => {
                assert_eq!(entity_type, EntityType::ProductionLot);
                assert!(matches!(direction, TraceMode::Full));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
