//! Torrent source plugins for `source-add`.
//!
//! A source string (`magnet:…`, `archive:<id>`, a URL) is resolved by the
//! first plugin claiming it. Only the magnet plugin is functional today;
//! the archive.org plugin recognizes its scheme and reports itself as
//! unimplemented.

/// Source resolution failures.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("no plugin handles source {uri:?}")]
    Unrecognized { uri: String },

    #[error("{message}")]
    Unsupported { message: String },
}

/// A resolved source item the manager can act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceItem {
    Magnet { uri: String },
}

/// One way of turning a source string into torrents.
pub trait SourcePlugin: Send + Sync {
    fn name(&self) -> &'static str;

    fn can_handle(&self, uri: &str) -> bool;

    fn resolve(&self, uri: &str) -> Result<Vec<SourceItem>, SourceError>;
}

struct MagnetPlugin;

impl SourcePlugin for MagnetPlugin {
    fn name(&self) -> &'static str {
        "magnet"
    }

    fn can_handle(&self, uri: &str) -> bool {
        uri.starts_with("magnet:")
    }

    fn resolve(&self, uri: &str) -> Result<Vec<SourceItem>, SourceError> {
        Ok(vec![SourceItem::Magnet {
            uri: uri.to_string(),
        }])
    }
}

struct ArchiveOrgPlugin;

impl SourcePlugin for ArchiveOrgPlugin {
    fn name(&self) -> &'static str {
        "archive.org"
    }

    fn can_handle(&self, uri: &str) -> bool {
        uri.starts_with("archive:") || uri.contains("archive.org")
    }

    fn resolve(&self, _uri: &str) -> Result<Vec<SourceItem>, SourceError> {
        Err(SourceError::Unsupported {
            message: "archive.org sources are not implemented yet; use add-magnet or a .torrent file"
                .to_string(),
        })
    }
}

/// Ordered plugin registry.
pub struct SourceRegistry {
    plugins: Vec<Box<dyn SourcePlugin>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            plugins: vec![Box::new(MagnetPlugin), Box::new(ArchiveOrgPlugin)],
        }
    }

    /// Resolves a source string with the first plugin that claims it.
    pub fn resolve(&self, uri: &str) -> Result<Vec<SourceItem>, SourceError> {
        for plugin in &self.plugins {
            if plugin.can_handle(uri) {
                tracing::debug!(plugin = plugin.name(), uri, "resolving source");
                return plugin.resolve(uri);
            }
        }
        Err(SourceError::Unrecognized {
            uri: uri.to_string(),
        })
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magnet_sources_resolve() {
        let registry = SourceRegistry::new();
        let items = registry.resolve("magnet:?xt=urn:btih:abc").unwrap();
        assert_eq!(
            items,
            vec![SourceItem::Magnet {
                uri: "magnet:?xt=urn:btih:abc".to_string()
            }]
        );
    }

    #[test]
    fn archive_sources_are_recognized_but_unsupported() {
        let registry = SourceRegistry::new();
        assert!(matches!(
            registry.resolve("archive:some-item"),
            Err(SourceError::Unsupported { .. })
        ));
    }

    #[test]
    fn unknown_sources_are_rejected() {
        let registry = SourceRegistry::new();
        assert!(matches!(
            registry.resolve("ftp://nope"),
            Err(SourceError::Unrecognized { .. })
        ));
    }
}
