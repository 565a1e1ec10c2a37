use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Alertmanager-style webhook payload: a batch of alerts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Webhook {
    #[serde(default)]
    pub alerts: Vec<Alert>,
}

/// One firing (or resolved) condition from the upstream monitor.
///
/// The `fingerprint` is the identity used for deduplication; labels and
/// annotations are opaque key/value metadata, with `alertname`, `severity`
/// and `summary` being the keys Vigil reads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Alert {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(default, rename = "startsAt", alias = "starts_at")]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "generatorURL", alias = "generator_url")]
    pub generator_url: String,
}

impl Alert {
    pub fn is_firing(&self) -> bool {
        self.status == "firing"
    }

    pub fn name(&self) -> &str {
        self.label("alertname")
    }

    pub fn severity(&self) -> &str {
        self.label("severity")
    }

    pub fn summary(&self) -> &str {
        self.annotations.get("summary").map(String::as_str).unwrap_or("")
    }

    fn label(&self, key: &str) -> &str {
        self.labels.get(key).map(String::as_str).unwrap_or("")
    }
}
