//! Durable line position of the monitored log.

use std::sync::Arc;

use tracing::warn;

use crate::Result;
use crate::database::repositories::SettingsRepository;

/// Stores the next line to ingest per datasource in the settings table.
#[derive(Clone)]
pub struct LogPositionStore {
    settings: Arc<dyn SettingsRepository>,
    key: String,
}

impl LogPositionStore {
    pub fn new(settings: Arc<dyn SettingsRepository>, datasource: &str) -> Self {
        Self {
            settings,
            key: format!("log_position:{datasource}"),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Recorded position; `0` when nothing usable is stored.
    pub async fn get(&self) -> Result<u64> {
        let Some(raw) = self.settings.get_setting(&self.key).await? else {
            return Ok(0);
        };
        match raw.trim().parse() {
            Ok(position) => Ok(position),
            Err(_) => {
                warn!(key = %self.key, value = %raw, "Ignoring malformed log position");
                Ok(0)
            }
        }
    }

    pub async fn set(&self, position: u64) -> Result<()> {
        self.settings
            .set_setting(&self.key, &position.to_string())
            .await
    }
}
