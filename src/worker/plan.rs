use std::time::Duration;

use crate::settings::Settings;

/// Logical purposes a cache namespace can serve. Exactly one namespace is
/// current per purpose at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Precache,
    Runtime,
    Images,
    Offline,
    Api,
    Pages,
}

impl Purpose {
    pub const ALL: [Purpose; 6] = [
        Purpose::Precache,
        Purpose::Runtime,
        Purpose::Images,
        Purpose::Offline,
        Purpose::Api,
        Purpose::Pages,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Precache => "precache",
            Purpose::Runtime => "runtime",
            Purpose::Images => "images",
            Purpose::Offline => "offline",
            Purpose::Api => "api",
            Purpose::Pages => "pages",
        }
    }
}

/// One current namespace: its full versioned name plus the limits the policy
/// engine enforces after writes. `max_entries` of zero means unbounded.
#[derive(Debug, Clone)]
pub struct NamespaceSpec {
    pub name: String,
    pub purpose: Purpose,
    pub max_entries: usize,
    pub max_age: Option<Duration>,
}

/// The full set of namespaces owned by one worker version, named
/// `<app-prefix>-<purpose>-v<version>`.
#[derive(Debug, Clone)]
pub struct CachePlan {
    prefix: String,
    version: String,
    specs: Vec<NamespaceSpec>,
}

impl CachePlan {
    pub fn new(prefix: &str, version: &str, settings: &Settings) -> Self {
        let spec = |purpose: Purpose, max_entries: usize, max_age: Option<Duration>| {
            NamespaceSpec {
                name: format!("{prefix}-{}-v{version}", purpose.as_str()),
                purpose,
                max_entries,
                max_age,
            }
        };
        let specs = vec![
            spec(Purpose::Precache, 0, None),
            spec(
                Purpose::Runtime,
                settings.runtime_max_entries,
                Some(settings.asset_max_age()),
            ),
            spec(
                Purpose::Images,
                settings.image_max_entries,
                Some(settings.asset_max_age()),
            ),
            spec(Purpose::Offline, 0, None),
            spec(
                Purpose::Api,
                settings.api_max_entries,
                Some(settings.api_max_age()),
            ),
            spec(Purpose::Pages, settings.pages_max_entries, None),
        ];
        Self {
            prefix: prefix.to_string(),
            version: version.to_string(),
            specs,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn namespace(&self, purpose: Purpose) -> &NamespaceSpec {
        self.specs
            .iter()
            .find(|spec| spec.purpose == purpose)
            .expect("every purpose has a namespace spec")
    }

    /// True for any namespace name created by any version of this app.
    pub fn is_owned(&self, name: &str) -> bool {
        name.starts_with(&format!("{}-", self.prefix))
    }

    /// True only for the namespaces of the current version.
    pub fn is_current(&self, name: &str) -> bool {
        self.specs.iter().any(|spec| spec.name == name)
    }
}
