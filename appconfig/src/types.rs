use serde::Deserialize;

/// Label used by the service for settings that have no label.
pub const NULL_LABEL: &str = "\0";

/// Key prefix under which feature flags are stored.
pub const FEATURE_FLAG_PREFIX: &str = ".appconfig.featureflag/";

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ConfigurationSetting {
    pub key: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
}

impl ConfigurationSetting {
    pub fn new<K, L, E>(key: K, label: L, etag: E) -> Self
    where
        K: Into<String>,
        L: Into<String>,
        E: Into<String>,
    {
        ConfigurationSetting {
            key: key.into(),
            label: Some(label.into()),
            value: None,
            etag: Some(etag.into()),
            content_type: None,
        }
    }

    pub fn label_or_null(&self) -> &str {
        self.label.as_deref().unwrap_or(NULL_LABEL)
    }
}

/// A key/label pair whose ETag is polled to detect change. A setting that did
/// not exist when it was fetched is kept with `etag == None`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchKey {
    pub key: String,
    pub label: String,
    pub etag: Option<String>,
}

impl WatchKey {
    pub fn new<K, L>(key: K, label: L, etag: Option<String>) -> Self
    where
        K: Into<String>,
        L: Into<String>,
    {
        WatchKey {
            key: key.into(),
            label: label.into(),
            etag,
        }
    }

    pub fn absent<K, L>(key: K, label: L) -> Self
    where
        K: Into<String>,
        L: Into<String>,
    {
        WatchKey::new(key, label, None)
    }

    pub fn matches(&self, key: &str, label: &str) -> bool {
        self.key == key && self.label == label
    }
}

impl From<&ConfigurationSetting> for WatchKey {
    fn from(setting: &ConfigurationSetting) -> Self {
        WatchKey {
            key: setting.key.clone(),
            label: setting.label_or_null().to_string(),
            etag: setting.etag.clone(),
        }
    }
}

/// Key and label filters used when listing settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct SettingSelector {
    pub key_filter: String,
    #[serde(default = "default_label_filter")]
    pub label_filter: String,
}

impl SettingSelector {
    pub fn new<K, L>(key_filter: K, label_filter: L) -> Self
    where
        K: Into<String>,
        L: Into<String>,
    {
        SettingSelector {
            key_filter: key_filter.into(),
            label_filter: label_filter.into(),
        }
    }

    /// The selector for the feature flags matching this selector's key filter.
    pub fn feature_flags(&self) -> Self {
        SettingSelector {
            key_filter: format!("{FEATURE_FLAG_PREFIX}{}", self.key_filter),
            label_filter: self.label_filter.clone(),
        }
    }
}

fn default_label_filter() -> String {
    NULL_LABEL.to_string()
}
