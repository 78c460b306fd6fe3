use std::{collections::BTreeMap, fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::{
    error::{ClientError, TransportError},
    transport::Transport,
};

/// Body of `GET /versions`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ServerVersions {
    #[serde(default)]
    pub versions: Vec<String>,
    #[serde(default)]
    pub unstable_features: BTreeMap<String, bool>,
}

impl ServerVersions {
    pub fn has_unstable_feature(&self, flag: &str) -> bool {
        self.unstable_features.get(flag).copied().unwrap_or(false)
    }

    /// Whether any advertised spec version is at least `minimum` (`vX.Y`).
    pub fn supports_version(&self, minimum: &str) -> bool {
        let Some(minimum) = parse_spec_version(minimum) else {
            return false;
        };
        self.versions
            .iter()
            .filter_map(|version| parse_spec_version(version))
            .any(|version| version >= minimum)
    }

    pub fn support(&self, feature: Feature) -> ServerSupport {
        let stable_version = feature
            .stable_since()
            .is_some_and(|minimum| self.supports_version(minimum));
        let stable_flag = feature
            .stable_flag()
            .is_some_and(|flag| self.has_unstable_feature(flag));
        if stable_version || stable_flag {
            ServerSupport::Stable
        } else if self.has_unstable_feature(feature.unstable_flag()) {
            ServerSupport::Unstable
        } else {
            ServerSupport::Unsupported
        }
    }
}

/// Optional homeserver features the core gates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    DelayedEvents,
    RelationBasedRedactions,
    AccountDataDeletion,
}

impl Feature {
    pub fn unstable_flag(self) -> &'static str {
        match self {
            Feature::DelayedEvents => "org.matrix.msc4140",
            Feature::RelationBasedRedactions => "org.matrix.msc3912",
            Feature::AccountDataDeletion => "org.matrix.msc3391",
        }
    }

    /// First spec version carrying the stable endpoint, when there is one.
    pub fn stable_since(self) -> Option<&'static str> {
        match self {
            Feature::AccountDataDeletion => Some("v1.13"),
            Feature::DelayedEvents | Feature::RelationBasedRedactions => None,
        }
    }

    /// Flag advertising the stable endpoint, when one exists.
    pub fn stable_flag(self) -> Option<&'static str> {
        match self {
            Feature::DelayedEvents => None,
            Feature::RelationBasedRedactions => Some("org.matrix.msc3912.stable"),
            Feature::AccountDataDeletion => Some("org.matrix.msc3391.stable"),
        }
    }
}

fn parse_spec_version(version: &str) -> Option<(u32, u32)> {
    let (major, minor) = version.strip_prefix('v')?.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Feature::DelayedEvents => "delayed events",
            Feature::RelationBasedRedactions => "relation based redactions",
            Feature::AccountDataDeletion => "account data deletion",
        };
        write!(f, "{name} ({})", self.unstable_flag())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerSupport {
    Stable,
    Unstable,
    Unsupported,
}

impl ServerSupport {
    pub fn is_supported(self) -> bool {
        self != ServerSupport::Unsupported
    }
}

/// `/versions` fetched once per client and reused for every capability gate.
pub struct CapabilityCache {
    transport: Arc<dyn Transport>,
    versions: OnceCell<ServerVersions>,
}

impl CapabilityCache {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            versions: OnceCell::new(),
        }
    }

    /// Cached server versions, fetching them on first use.
    ///
    /// A homeserver answering 404 or 405 is treated as advertising nothing.
    pub async fn versions(&self) -> Result<&ServerVersions, ClientError> {
        self.versions
            .get_or_try_init(|| async {
                match self.transport.get_versions().await {
                    Ok(versions) => {
                        info!(versions = ?versions.versions, "fetched server versions");
                        Ok(versions)
                    }
                    Err(TransportError::Http {
                        status: 404 | 405, ..
                    }) => {
                        debug!("server has no /versions endpoint, assuming no features");
                        Ok(ServerVersions::default())
                    }
                    Err(err) => Err(ClientError::from(err)),
                }
            })
            .await
    }

    pub async fn support(&self, feature: Feature) -> Result<ServerSupport, ClientError> {
        Ok(self.versions().await?.support(feature))
    }

    /// Like [`Self::support`], but a missing feature is an `unsupported_by_server` error.
    pub async fn require(&self, feature: Feature) -> Result<ServerSupport, ClientError> {
        match self.support(feature).await? {
            ServerSupport::Unsupported => Err(ClientError::unsupported(feature.to_string())),
            support => Ok(support),
        }
    }
}
