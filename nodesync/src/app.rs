//! Adapter wiring
//!
//! Shared clients are built once per process and injected into the
//! reconciler as trait objects.

use std::sync::Arc;
use tracing::info;

use nodesync_cluster::{
    AwsCliInstanceMetadata, ClusterAdapter, DeadLetterSink, EventHandler, FileSdTargetList,
    InMemoryCluster, InMemoryTargets, InstanceMetadata, InstanceResolver, JsonLinesDeadLetterSink,
    KubectlClusterAdapter, LogDeadLetterSink, Reconciler, ReconcilerOptions, TargetListAdapter,
};
use nodesync_core::Config;

/// In-memory stand-ins used in place of the mutating adapters
pub struct DryRun {
    pub cluster: Arc<InMemoryCluster>,
    pub targets: Arc<InMemoryTargets>,
}

pub struct App {
    pub handler: EventHandler,
    pub reconciler: Arc<Reconciler>,
    pub dry_run: Option<DryRun>,
}

impl App {
    /// Build the pipeline from configuration
    ///
    /// With `dry_run`, instance lookups stay real (they are read-only) while
    /// cluster and target mutations go to in-memory adapters.
    pub fn build(config: &Config, dry_run: bool) -> Self {
        let metadata: Arc<dyn InstanceMetadata> =
            Arc::new(AwsCliInstanceMetadata::from_config(&config.resolver));
        Self::with_metadata(config, metadata, dry_run)
    }

    pub fn with_metadata(config: &Config, metadata: Arc<dyn InstanceMetadata>, dry_run: bool) -> Self {
        let resolver = Arc::new(InstanceResolver::from_config(metadata, &config.resolver));

        let dry_run = dry_run.then(|| DryRun {
            cluster: Arc::new(InMemoryCluster::new()),
            targets: Arc::new(InMemoryTargets::new()),
        });
        if dry_run.is_some() {
            info!("Dry run: cluster and target changes are recorded, not applied");
        } else {
            info!(
                kubeconfig = %config.cluster.kubeconfig,
                file_sd_path = %config.targets.file_sd_path,
                "Using kubectl cluster adapter and file_sd target list"
            );
        }

        let cluster: Arc<dyn ClusterAdapter> = match &dry_run {
            Some(dry_run) => dry_run.cluster.clone(),
            None => Arc::new(KubectlClusterAdapter::from_config(&config.cluster)),
        };
        let targets: Arc<dyn TargetListAdapter> = match &dry_run {
            Some(dry_run) => dry_run.targets.clone(),
            None => Arc::new(FileSdTargetList::from_config(&config.targets)),
        };

        let dead_letters: Arc<dyn DeadLetterSink> = match &config.dead_letter.file_path {
            Some(path) => {
                info!(path = %path, "Dead-letter records appended to file");
                Arc::new(JsonLinesDeadLetterSink::new(path))
            }
            None => Arc::new(LogDeadLetterSink),
        };

        let reconciler = Arc::new(Reconciler::new(
            resolver,
            cluster,
            targets,
            dead_letters,
            ReconcilerOptions::from_config(config),
        ));

        Self {
            handler: EventHandler::new(reconciler.clone()),
            reconciler,
            dry_run,
        }
    }

    /// Log what a dry run would have changed
    pub fn report_dry_run(&self) {
        if let Some(dry_run) = &self.dry_run {
            for call in dry_run.cluster.calls() {
                info!(call = ?call, "Dry run cluster call");
            }
            for call in dry_run.targets.calls() {
                info!(call = ?call, "Dry run target call");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodesync_cluster::InMemoryFleet;
    use nodesync_core::models::{InstanceId, InstanceInfo};

    #[tokio::test]
    async fn test_dry_run_records_instead_of_applying() {
        let fleet = Arc::new(InMemoryFleet::new());
        fleet.launch(InstanceInfo::new(InstanceId::from("i-123"), "10.0.1.5".parse().unwrap()));
        let app = App::with_metadata(&Config::default(), fleet, true);

        let response = app
            .handler
            .handle_str(
                r#"{"detail-type":"EC2 Instance Launch Successful","detail":{"EC2 InstanceId":"i-123"}}"#,
            )
            .await;
        assert_eq!(response.status_code, 200);

        let dry_run = app.dry_run.as_ref().unwrap();
        assert_eq!(dry_run.cluster.node_ids(), vec![InstanceId::from("i-123")]);
        assert_eq!(dry_run.targets.targets().len(), 1);
    }
}
