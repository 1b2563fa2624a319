//! Dynamic operator-tunable settings (§3, §9): provider/model choices,
//! service URLs, API keys, per-endpoint concurrency caps. Read fresh at the
//! start of each job rather than cached for the process lifetime, so an
//! operator can flip `textProvider` without a restart.

use std::collections::HashMap;

use crate::error::Result;
use crate::models::setting::keys;
use crate::services::store::Store;

/// A resolved snapshot of the settings a single worker step needs, read once
/// at the top of `SongWorker`'s metadata/cover/audio steps (§4.4) rather than
/// field-by-field, to avoid N separate round trips per job.
#[derive(Debug, Clone, Default)]
pub struct JobSettings {
    pub text_provider: Option<String>,
    pub text_model: Option<String>,
    pub text_service_url: Option<String>,
    pub text_api_key: Option<String>,
    pub image_provider: Option<String>,
    pub image_model: Option<String>,
    pub image_service_url: Option<String>,
    pub image_api_key: Option<String>,
    pub audio_service_url: Option<String>,
    pub text_max_concurrency: Option<usize>,
    pub image_max_concurrency: Option<usize>,
}

#[derive(Clone)]
pub struct SettingsStore {
    store: Store,
}

impl SettingsStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        self.store.get_setting(key).await
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.store.set_setting(key, value).await
    }

    pub async fn all(&self) -> Result<HashMap<String, String>> {
        Ok(self.store.all_settings().await?.into_iter().collect())
    }

    /// Snapshot every recognized key in one pass (§4.4, §4.2).
    pub async fn job_settings(&self) -> Result<JobSettings> {
        let all = self.all().await?;
        let parse_usize = |k: &str| all.get(k).and_then(|v| v.parse::<usize>().ok());

        Ok(JobSettings {
            text_provider: all.get(keys::TEXT_PROVIDER).cloned(),
            text_model: all.get(keys::TEXT_MODEL).cloned(),
            text_service_url: all.get(keys::TEXT_SERVICE_URL).cloned(),
            text_api_key: all.get(keys::TEXT_API_KEY).cloned(),
            image_provider: all.get(keys::IMAGE_PROVIDER).cloned(),
            image_model: all.get(keys::IMAGE_MODEL).cloned(),
            image_service_url: all.get(keys::IMAGE_SERVICE_URL).cloned(),
            image_api_key: all.get(keys::IMAGE_API_KEY).cloned(),
            audio_service_url: all.get(keys::AUDIO_SERVICE_URL).cloned(),
            text_max_concurrency: parse_usize(keys::TEXT_MAX_CONCURRENCY),
            image_max_concurrency: parse_usize(keys::IMAGE_MAX_CONCURRENCY),
        })
    }
}
