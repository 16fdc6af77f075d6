use std::fmt;

/// Version reported by the managed server binary.
///
/// An all-empty value means "unknown"; probing never fails loudly.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ServerVersion {
    pub full: String,
    pub branch: String,
    pub version: String,
}

impl ServerVersion {
    pub fn is_unknown(&self) -> bool {
        self.full.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ServerStatus {
    pub can_download: bool,
    pub is_configured: bool,
    pub running: bool,
    pub version: ServerVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStage {
    Download,
    Unpack,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProgressEvent {
    pub stage: ProgressStage,
    pub percent: u8,
}

impl ProgressEvent {
    pub fn new(stage: ProgressStage, percent: u8) -> Self {
        Self {
            stage,
            percent: percent.min(100),
        }
    }
}

/// Routes progress events to one logical operation.
///
/// `kind` is a server branch (`stable`, `experimental`) or a mod name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ResourceKey {
    pub kind: String,
    pub version: String,
}

impl ResourceKey {
    pub fn new(kind: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind, self.version)
    }
}
