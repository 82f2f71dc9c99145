//! Snapshots of server data volumes

use crate::error::{GsmError, Result};
use crate::model::{ServerRecord, SnapshotRecord, new_id};
use crate::orchestrator::Orchestrator;
use chrono::Utc;
use gsm_cloud::{ProviderError, SnapshotState, tags, wait_until, with_retry};

pub struct SnapshotManager<'a> {
    orchestrator: &'a Orchestrator,
}

impl<'a> SnapshotManager<'a> {
    pub fn new(orchestrator: &'a Orchestrator) -> Self {
        Self { orchestrator }
    }

    /// Copy the record's data volume and wait for the copy to complete
    ///
    /// The source server keeps running and is not modified. A snapshot that
    /// fails to complete is deleted again.
    #[tracing::instrument(skip(self, source), fields(server = %source.name))]
    pub async fn create(&self, source: &ServerRecord) -> Result<SnapshotRecord> {
        let provider = self.orchestrator.provider();
        let volume_id = source
            .volume_id
            .as_deref()
            .ok_or_else(|| GsmError::not_found("volume", &source.name))?;

        let id = new_id();
        let snapshot_tags = tags::tags([
            (tags::ID, source.id.as_str()),
            (tags::GAME, source.game.as_str()),
            (tags::NAME, source.name.as_str()),
            (tags::SNAPSHOT_ID, id.as_str()),
            (tags::DISPLAY_NAME, format!("{}-snapshot", source.name).as_str()),
        ]);
        let description = format!("gsm snapshot of {} ({})", source.name, source.game);

        let snapshot_id = provider
            .create_snapshot(volume_id, &description, &snapshot_tags)
            .await
            .map_err(|e| GsmError::provider("create", "snapshot", volume_id, e))?;
        tracing::info!(snapshot = %snapshot_id, "Snapshot started");

        if let Err(e) = self.wait_completed(&snapshot_id).await {
            if let Err(cleanup) = provider.delete_snapshot(&snapshot_id).await {
                tracing::warn!("Could not delete failed snapshot {}: {}", snapshot_id, cleanup);
            }
            return Err(GsmError::provider("create", "snapshot", &snapshot_id, e));
        }

        let live = with_retry(&self.orchestrator.options().retry, "describe snapshot", || {
            provider.describe_snapshot(&snapshot_id)
        })
        .await
        .map_err(|e| GsmError::provider("describe", "snapshot", &snapshot_id, e))?;

        Ok(SnapshotRecord {
            id,
            snapshot_id,
            source_server_id: Some(source.id.clone()),
            source_server_name: source.name.clone(),
            game: source.game.clone(),
            region: source.region.clone(),
            size_gb: live.size_gb,
            created_at: Utc::now(),
            config: source.config.clone(),
        })
    }

    /// Delete the provider snapshot; one already gone counts as deleted
    pub async fn delete(&self, record: &SnapshotRecord) -> Result<()> {
        let provider = self.orchestrator.provider();
        match with_retry(&self.orchestrator.options().retry, "delete snapshot", || {
            provider.delete_snapshot(&record.snapshot_id)
        })
        .await
        {
            Ok(()) => {
                tracing::info!(snapshot = %record.snapshot_id, "Deleted snapshot");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                tracing::warn!("Snapshot {} already absent", record.snapshot_id);
                Ok(())
            }
            Err(e) => Err(GsmError::provider(
                "delete",
                "snapshot",
                &record.snapshot_id,
                e,
            )),
        }
    }

    async fn wait_completed(&self, snapshot_id: &str) -> gsm_cloud::Result<()> {
        let provider = self.orchestrator.provider();
        wait_until(
            &self.orchestrator.options().poll,
            &format!("snapshot {} to complete", snapshot_id),
            move || async move {
                let snapshot = provider.describe_snapshot(snapshot_id).await?;
                match snapshot.state {
                    SnapshotState::Completed => Ok(true),
                    SnapshotState::Error => Err(ProviderError::api(
                        "SnapshotError",
                        format!("snapshot {} entered error state", snapshot_id),
                    )),
                    SnapshotState::Pending => Ok(false),
                }
            },
        )
        .await
    }
}
