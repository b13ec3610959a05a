// Registry Module
//
// The discovery plane: the record table, the master that serves it and the
// client nodes use to reach it.

use async_trait::async_trait;
use log::debug;

use crate::config::RetryPolicy;
use crate::error::{GraphError, GraphResult};
use crate::routing::GraphName;
use crate::util::logging::Component;

pub mod client;
pub mod master;
pub mod protocol;
pub mod records;

pub use client::RegistryClient;
pub use master::{Master, MasterState};
pub use protocol::{RegistryReply, RegistryRequest};
pub use records::{RecordTable, RecordType, RegistrationRecord, UpsertOutcome};

/// The registry operations, whether served in-process or over the network
#[async_trait]
pub trait RegistryApi: Send + Sync {
    async fn register(&self, record: RegistrationRecord) -> GraphResult<RegistrationRecord>;

    async fn lookup(&self, name: &GraphName, record_type: RecordType) -> GraphResult<Vec<RegistrationRecord>>;

    async fn deregister(&self, name: &GraphName, record_type: RecordType, node: &GraphName) -> GraphResult<()>;

    /// Remove every record owned by `node`
    async fn deregister_node(&self, node: &GraphName) -> GraphResult<usize>;

    /// Register, retrying with backoff while the registry reports `NotReady`
    async fn register_with_retry(
        &self,
        record: RegistrationRecord,
        policy: RetryPolicy,
    ) -> GraphResult<RegistrationRecord> {
        let attempts = policy.attempts.max(1);
        let mut last_reason = String::new();

        for attempt in 0..attempts {
            let wait = policy.backoff_for(attempt);
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
            match self.register(record.clone()).await {
                Ok(accepted) => return Ok(accepted),
                Err(GraphError::NotReady(reason)) => {
                    debug!(
                        target: Component::Master.target(),
                        "registry not ready for {} (attempt {}/{}): {}",
                        record.name,
                        attempt + 1,
                        attempts,
                        reason
                    );
                    last_reason = reason;
                }
                Err(e) => return Err(e),
            }
        }

        Err(GraphError::NotReady(format!(
            "gave up registering {} after {} attempts: {}",
            record.name, attempts, last_reason
        )))
    }

    /// The single provider of `service`, or `ServiceNotFound`
    async fn lookup_service(&self, service: &GraphName) -> GraphResult<RegistrationRecord> {
        self.lookup(service, RecordType::Service)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| GraphError::ServiceNotFound(service.to_string()))
    }
}
