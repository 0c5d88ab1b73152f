use relay_core::SnapshotRecord;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Latest image per (client, camera). No history; entries live until restart.
#[derive(Default)]
pub struct SnapshotCache {
    records: RwLock<HashMap<(String, String), SnapshotRecord>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, record: SnapshotRecord) {
        let key = (record.client_id.clone(), record.camera_id.clone());
        debug!(
            event = "snapshot_cached",
            client_id = %record.client_id,
            camera_id = %record.camera_id,
            bytes = record.image.len()
        );
        self.records.write().await.insert(key, record);
    }

    pub async fn get(&self, client_id: &str, camera_id: &str) -> Option<SnapshotRecord> {
        self.records
            .read()
            .await
            .get(&(client_id.to_string(), camera_id.to_string()))
            .cloned()
    }

    /// Linear scan; bounded by the number of cameras per client.
    pub async fn list_for_client(&self, client_id: &str) -> Vec<SnapshotRecord> {
        let mut records = self
            .records
            .read()
            .await
            .iter()
            .filter(|((owner, _), _)| owner == client_id)
            .map(|(_, record)| record.clone())
            .collect::<Vec<_>>();
        records.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));
        records
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}
