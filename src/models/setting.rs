//! Setting: flat key -> string map (§3, §9). Never partitioned by playlist,
//! read fresh at job start by `services::settings::SettingsStore`.

/// Recognized setting keys. Any other key is accepted and stored but has no
/// built-in meaning to the pipeline.
pub mod keys {
    pub const TEXT_PROVIDER: &str = "textProvider";
    pub const TEXT_MODEL: &str = "textModel";
    pub const IMAGE_PROVIDER: &str = "imageProvider";
    pub const IMAGE_MODEL: &str = "imageModel";
    pub const TEXT_SERVICE_URL: &str = "textServiceUrl";
    pub const IMAGE_SERVICE_URL: &str = "imageServiceUrl";
    pub const AUDIO_SERVICE_URL: &str = "audioServiceUrl";
    pub const TEXT_API_KEY: &str = "textApiKey";
    pub const IMAGE_API_KEY: &str = "imageApiKey";
    pub const TEXT_MAX_CONCURRENCY: &str = "textMaxConcurrency";
    pub const IMAGE_MAX_CONCURRENCY: &str = "imageMaxConcurrency";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Setting {
    pub key: String,
    pub value: String,
}
