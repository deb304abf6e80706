//! Runtime settings read from `WARDEN_*` environment variables.

use serde::{Deserialize, Serialize};

use crate::TargetScope;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    /// Server-side timeout of a single watch request.
    pub watch_timeout_secs: u32,
    pub watch_bookmarks: bool,
    pub gvk: Option<String>,
    pub crd_name: Option<String>,
    pub controller: String,
    pub scope: TargetScope,
    pub generation_aware: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            watch_timeout_secs: 290,
            watch_bookmarks: true,
            gvk: None,
            crd_name: None,
            controller: "warden".to_string(),
            scope: TargetScope::All,
            generation_aware: true,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Settings::from_env`] with an injectable lookup, for tests.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        // Watch requests must time out below 295s; 0 would mean "server default".
        let watch_timeout_secs = get("WARDEN_WATCH_TIMEOUT_SECS")
            .and_then(|s| s.parse::<u32>().ok())
            .filter(|v| *v > 0)
            .map(|v| v.min(290))
            .unwrap_or(d.watch_timeout_secs);
        let watch_bookmarks = get("WARDEN_WATCH_BOOKMARKS").and_then(|s| parse_bool(&s)).unwrap_or(d.watch_bookmarks);
        let gvk = get("WARDEN_GVK").filter(|s| !s.trim().is_empty());
        let crd_name = get("WARDEN_CRD_NAME").filter(|s| !s.trim().is_empty());
        let controller = get("WARDEN_CONTROLLER").filter(|s| !s.trim().is_empty()).unwrap_or(d.controller);
        let scope = get("WARDEN_NAMESPACES")
            .map(|s| TargetScope::from_namespaces(s.split(',')))
            .unwrap_or(d.scope);
        let generation_aware = get("WARDEN_GENERATION_AWARE").and_then(|s| parse_bool(&s)).unwrap_or(d.generation_aware);
        Self { watch_timeout_secs, watch_bookmarks, gvk, crd_name, controller, scope, generation_aware }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
