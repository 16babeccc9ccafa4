//! Source descriptors and configuration loading.
//!
//! Configuration produces the list of data-source descriptors handed to
//! `View::connect`. A descriptor is deliberately forgiving: URL validation
//! happens at connect time, where a bad source is skipped with a warning
//! rather than failing the whole session.

use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

use crate::error::{Result, ViewError};

bitflags::bitflags! {
    /// What a source is capable of beyond serving features.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SourceRoles: u8 {
        /// Source can serve the region's DNA.
        const SEQUENCE = 1 << 0;
        /// Source accepts edits written back to it.
        const WRITEBACK = 1 << 1;
    }
}

/// One configured data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceDescriptor {
    /// Source address, e.g. `acedb://annotator.example.org:23100/human`.
    pub url: String,
    /// Data format hint passed through to the worker.
    pub format: Option<String>,
    /// Per-request timeout hint, seconds. Enforced by the worker, never here.
    pub timeout_secs: Option<u64>,
    /// Protocol version hint.
    pub version: Option<String>,
    /// Styles this source is expected to need, requested up front.
    pub styles: Vec<String>,
    /// Restrict loading to these feature sets; empty means "everything".
    pub feature_sets: Vec<String>,
    /// Source can serve DNA for the region.
    pub sequence: bool,
    /// Source accepts writeback.
    pub writeback: bool,
}

impl Default for SourceDescriptor {
    fn default() -> Self {
        Self {
            url: String::new(),
            format: None,
            timeout_secs: None,
            version: None,
            styles: Vec::new(),
            feature_sets: Vec::new(),
            sequence: false,
            writeback: false,
        }
    }
}

impl SourceDescriptor {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn roles(&self) -> SourceRoles {
        let mut roles = SourceRoles::empty();
        if self.sequence {
            roles |= SourceRoles::SEQUENCE;
        }
        if self.writeback {
            roles |= SourceRoles::WRITEBACK;
        }
        roles
    }

    /// Parse and sanity-check the source URL.
    pub fn parse_url(&self) -> Result<Url> {
        let url = Url::parse(&self.url).map_err(|e| ViewError::InvalidSourceUrl {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        if url.scheme().is_empty() || !url.has_host() {
            return Err(ViewError::InvalidSourceUrl {
                url: self.url.clone(),
                reason: "missing scheme or host".to_string(),
            });
        }
        Ok(url)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default, rename = "source")]
    sources: Vec<SourceDescriptor>,
}

/// Load source descriptors from a TOML file of `[[source]]` tables.
pub fn load_sources(path: &Path) -> Result<Vec<SourceDescriptor>> {
    let text = std::fs::read_to_string(path)?;
    let parsed: ConfigFile = toml::from_str(&text)
        .map_err(|e| ViewError::Config(format!("could not parse '{}': {e}", path.display())))?;
    if parsed.sources.is_empty() {
        tracing::warn!(path = %path.display(), "source config contains no [[source]] tables");
    }
    Ok(parsed.sources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_roles_from_flags() {
        let mut desc = SourceDescriptor::new("acedb://host/db");
        assert_eq!(desc.roles(), SourceRoles::empty());
        desc.sequence = true;
        assert_eq!(desc.roles(), SourceRoles::SEQUENCE);
        desc.writeback = true;
        assert!(desc.roles().contains(SourceRoles::SEQUENCE | SourceRoles::WRITEBACK));
    }

    #[test]
    fn test_parse_url_rejects_malformed() {
        assert!(SourceDescriptor::new("acedb://host:23100/human")
            .parse_url()
            .is_ok());
        assert!(SourceDescriptor::new("not a url").parse_url().is_err());
        assert!(SourceDescriptor::new("file:///only/path").parse_url().is_err());
    }

    #[test]
    fn test_load_sources_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[[source]]
url = "acedb://annotator.example.org:23100/human"
sequence = true
feature_sets = ["genes", "repeats"]

[[source]]
url = "das://das.example.org/hg19"
timeout_secs = 120
"#
        )
        .unwrap();

        let sources = load_sources(file.path()).unwrap();
        assert_eq!(sources.len(), 2);
        assert!(sources[0].sequence);
        assert_eq!(sources[0].feature_sets, vec!["genes", "repeats"]);
        assert_eq!(sources[1].timeout_secs, Some(120));
    }

    #[test]
    fn test_load_sources_bad_toml_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[[source\nurl=").unwrap();
        let err = load_sources(file.path()).unwrap_err();
        assert!(matches!(err, ViewError::Config(_)));
    }
}
