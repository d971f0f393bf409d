//! Execution-context classification.
//!
//! Every context runs as exactly one [`ContextKind`] for its whole lifetime.
//! The kind decides whether the context may originate cross-context
//! broadcasts or only consume them.
//!
//! An explicit kind supplied at process entry always wins. Capability
//! probing is the fallback for hosts that cannot say what they are: probes
//! run in a fixed priority order and the first match decides. No match is
//! fatal since there is no safe default.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::EnvironmentError;

/// Kind of isolated execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContextKind {
    /// User-facing panel (popup)
    InteractiveSurface,
    /// Script embedded in a host page
    EmbeddedPage,
    /// Long-running background coordinator
    Coordinator,
    /// Settings page
    SettingsSurface,
}

impl ContextKind {
    pub const ALL: [ContextKind; 4] = [
        ContextKind::InteractiveSurface,
        ContextKind::EmbeddedPage,
        ContextKind::Coordinator,
        ContextKind::SettingsSurface,
    ];

    /// Whether cells in this context arm the cross-context notifier.
    pub fn can_originate(self) -> bool {
        matches!(
            self,
            ContextKind::InteractiveSurface | ContextKind::SettingsSurface
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ContextKind::InteractiveSurface => "interactive-surface",
            ContextKind::EmbeddedPage => "embedded-page",
            ContextKind::Coordinator => "coordinator",
            ContextKind::SettingsSurface => "settings-surface",
        }
    }
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextKind {
    type Err = EnvironmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        ContextKind::ALL
            .into_iter()
            .find(|k| k.as_str() == wanted)
            .ok_or_else(|| EnvironmentError::UnknownKind(s.to_string()))
    }
}

/// What the host runtime can tell us about the current context.
pub trait HostCapabilities: Send + Sync {
    /// The extension messaging runtime is reachable.
    fn has_extension_runtime(&self) -> bool;

    /// This context can enumerate sibling extension views.
    fn can_enumerate_views(&self) -> bool;

    /// URL scheme of the context's location, without the trailing colon.
    fn location_scheme(&self) -> Option<String>;

    /// URL path of the context's location.
    fn location_path(&self) -> Option<String>;

    /// This context is among the open popup views.
    fn is_popup_view(&self) -> bool;

    /// This context is the background page.
    fn is_background_page(&self) -> bool;

    /// This context is among the open extension tab views.
    fn is_tab_view(&self) -> bool;
}

/// Plain-data [`HostCapabilities`], filled in by whatever glue can observe
/// the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSnapshot {
    pub extension_runtime: bool,
    pub enumerate_views: bool,
    pub location_scheme: Option<String>,
    pub location_path: Option<String>,
    pub popup_view: bool,
    pub background_page: bool,
    pub tab_view: bool,
}

impl HostCapabilities for HostSnapshot {
    fn has_extension_runtime(&self) -> bool {
        self.extension_runtime
    }

    fn can_enumerate_views(&self) -> bool {
        self.enumerate_views
    }

    fn location_scheme(&self) -> Option<String> {
        self.location_scheme.clone()
    }

    fn location_path(&self) -> Option<String> {
        self.location_path.clone()
    }

    fn is_popup_view(&self) -> bool {
        self.popup_view
    }

    fn is_background_page(&self) -> bool {
        self.background_page
    }

    fn is_tab_view(&self) -> bool {
        self.tab_view
    }
}

/// One capability probe.
struct Probe {
    kind: ContextKind,
    name: &'static str,
    matches: fn(&dyn HostCapabilities) -> bool,
}

fn probe_embedded_page(host: &dyn HostCapabilities) -> bool {
    host.has_extension_runtime()
        && !host.can_enumerate_views()
        && host
            .location_scheme()
            .is_some_and(|scheme| scheme.starts_with("http"))
}

fn probe_interactive_surface(host: &dyn HostCapabilities) -> bool {
    host.can_enumerate_views() && host.is_popup_view()
}

fn probe_coordinator(host: &dyn HostCapabilities) -> bool {
    host.is_background_page()
}

fn probe_settings_surface(host: &dyn HostCapabilities) -> bool {
    host.can_enumerate_views()
        && host.is_tab_view()
        && host
            .location_path()
            .is_some_and(|path| path.contains("options"))
}

/// Probes in priority order.
const PROBES: [Probe; 4] = [
    Probe {
        kind: ContextKind::EmbeddedPage,
        name: "embedded-page",
        matches: probe_embedded_page,
    },
    Probe {
        kind: ContextKind::InteractiveSurface,
        name: "popup-view",
        matches: probe_interactive_surface,
    },
    Probe {
        kind: ContextKind::Coordinator,
        name: "background-page",
        matches: probe_coordinator,
    },
    Probe {
        kind: ContextKind::SettingsSurface,
        name: "options-tab",
        matches: probe_settings_surface,
    },
];

/// Run the probes against `host`; the first match wins.
pub fn probe(host: &dyn HostCapabilities) -> Result<ContextKind, EnvironmentError> {
    for probe in &PROBES {
        if (probe.matches)(host) {
            debug!(probe = probe.name, kind = %probe.kind, "Capability probe matched");
            return Ok(probe.kind);
        }
    }
    Err(EnvironmentError::Unclassified)
}

/// Classifies the current context once and remembers the answer.
pub struct EnvironmentClassifier {
    explicit: Option<ContextKind>,
    host: Option<Arc<dyn HostCapabilities>>,
    resolved: OnceLock<ContextKind>,
}

impl EnvironmentClassifier {
    /// Classifier for a process that knows its kind up front.
    pub fn explicit(kind: ContextKind) -> Self {
        Self {
            explicit: Some(kind),
            host: None,
            resolved: OnceLock::new(),
        }
    }

    /// Classifier that has to probe the host.
    pub fn probing(host: Arc<dyn HostCapabilities>) -> Self {
        Self {
            explicit: None,
            host: Some(host),
            resolved: OnceLock::new(),
        }
    }

    /// Explicit kind if given, otherwise probe `host`.
    pub fn new(explicit: Option<ContextKind>, host: Option<Arc<dyn HostCapabilities>>) -> Self {
        Self {
            explicit,
            host,
            resolved: OnceLock::new(),
        }
    }

    /// The context kind. Only a successful classification is cached.
    pub fn classify(&self) -> Result<ContextKind, EnvironmentError> {
        if let Some(kind) = self.resolved.get() {
            return Ok(*kind);
        }

        let kind = match (self.explicit, &self.host) {
            (Some(kind), _) => kind,
            (None, Some(host)) => probe(host.as_ref())?,
            (None, None) => return Err(EnvironmentError::Unclassified),
        };

        let kind = *self.resolved.get_or_init(|| kind);
        info!(kind = %kind, "Execution context classified");
        Ok(kind)
    }
}
