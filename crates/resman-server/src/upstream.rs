//! Upstream cluster-manager stubs for the standalone binary.
//!
//! The real scheduler-stream transport lives outside this process; the
//! binary wires a client that logs reconcile calls so the reconciler
//! loop is observable end to end.

use async_trait::async_trait;

use resman_api::Result;
use resman_core::reconcile::{ClusterClient, FrameworkInfo, ReconcileTask};

pub struct LoggingClusterClient;

#[async_trait]
impl ClusterClient for LoggingClusterClient {
    async fn reconcile(
        &self,
        stream_id: &str,
        framework_id: &str,
        tasks: Vec<ReconcileTask>,
    ) -> Result<()> {
        if tasks.is_empty() {
            tracing::info!(stream_id, framework_id, "implicit reconcile call");
        } else {
            tracing::info!(
                stream_id,
                framework_id,
                task_count = tasks.len(),
                "explicit reconcile call"
            );
        }
        Ok(())
    }
}

pub struct StaticFrameworkInfo {
    pub stream_id: String,
    pub framework_id: String,
}

impl FrameworkInfo for StaticFrameworkInfo {
    fn stream_id(&self) -> String {
        self.stream_id.clone()
    }

    fn framework_id(&self) -> String {
        self.framework_id.clone()
    }
}
