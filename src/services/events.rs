//! Event system for custody operations
//!
//! Services emit a [`CustodyNotification`] after each committed mutation.
//! Useful for:
//! - Audit logging
//! - Dashboard refresh
//! - Downstream compliance workflows

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

use rust_decimal::Decimal;

/// Notifications emitted by services
#[derive(Debug, Clone)]
pub enum CustodyNotification {
    ChainCreated {
        chain_id: String,
        product_type: String,
        quantity: Decimal,
    },
    ChainSplit {
        parent_chain_id: String,
        child_chain_ids: Vec<String>,
        quantity: Decimal,
    },
    ChainsMerged {
        parent_chain_ids: Vec<String>,
        merged_chain_id: String,
        quantity: Decimal,
    },
    ChainTransformed {
        source_chain_id: String,
        output_chain_id: String,
        input_quantity: Decimal,
        output_quantity: Decimal,
    },
    CustodyEventRecorded {
        chain_id: String,
        event_id: String,
    },
    MassBalanceRecorded {
        event_id: String,
        event_type: String,
    },
    LineageReportGenerated {
        report_id: String,
        report_type: String,
        target_entity_id: String,
    },
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &CustodyNotification);
}

/// Event bus for broadcasting custody notifications
pub struct EventBus {
    sender: broadcast::Sender<CustodyNotification>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: CustodyNotification) {
        trace!(event = ?event, "Emitting custody notification");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CustodyNotification> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Logging listener for audit trails
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &CustodyNotification) {
        match event {
            CustodyNotification::ChainCreated { chain_id, product_type, quantity } => {
                info!(chain = %chain_id, product = %product_type, quantity = %quantity, "Chain created");
            }
            CustodyNotification::ChainSplit { parent_chain_id, child_chain_ids, quantity } => {
                info!(
                    parent = %parent_chain_id,
                    children = child_chain_ids.len(),
                    quantity = %quantity,
                    "Chain split"
                );
            }
            CustodyNotification::ChainsMerged { parent_chain_ids, merged_chain_id, quantity } => {
                info!(
                    merged = %merged_chain_id,
                    parents = parent_chain_ids.len(),
                    quantity = %quantity,
                    "Chains merged"
                );
            }
            CustodyNotification::ChainTransformed {
                source_chain_id,
                output_chain_id,
                input_quantity,
                output_quantity,
            } => {
                info!(
                    source = %source_chain_id,
                    output = %output_chain_id,
                    input = %input_quantity,
                    produced = %output_quantity,
                    "Chain transformed"
                );
            }
            _ => {
                debug!(event = ?event, "Custody notification");
            }
        }
    }
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    let listener = LoggingEventListener;

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_event_bus_emit_receive() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        bus.emit(CustodyNotification::ChainCreated {
            chain_id: "CHAIN-1".into(),
            product_type: "FFB".into(),
            quantity: Decimal::from(1000),
        });

        let event = timeout(Duration::from_millis(100), receiver.recv())
            .await
            .expect("timeout")
            .expect("receive error");

        match event {
            CustodyNotification::ChainCreated { chain_id, quantity, .. } => {
                assert_eq!(chain_id, "CHAIN-1");
                assert_eq!(quantity, Decimal::from(1000));
            }
            _ => panic!("Wrong event type"),
        }
    }

    #[test]
    fn test_event_bus_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit(CustodyNotification::CustodyEventRecorded {
            chain_id: "CHAIN-1".into(),
            event_id: "evt".into(),
        });
    }
}
