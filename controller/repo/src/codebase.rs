use serde::{Deserialize, Serialize};

/// Codebase metadata as served by the repo.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Codebase {
    /// The repo encodes versions as decimal strings.
    #[serde(default, with = "version")]
    pub version: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edit_files: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub erased_files: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub derived: Vec<String>,
}

/// A set of files written to one codebase and committed together.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch {
    pub base_path: String,
    pub items: Vec<BatchItem>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchItem {
    /// Directory within the codebase, e.g. `/config`.
    pub path: String,
    pub filename: String,
    pub content: String,
}

// === impl Codebase ===

impl Codebase {
    pub(crate) fn request(version: u64, base: Option<&str>) -> Self {
        Self {
            version,
            base: base.map(Into::into),
            ..Self::default()
        }
    }
}

// === impl Batch ===

impl Batch {
    pub fn new(base_path: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            items: Vec::new(),
        }
    }

    pub fn with_item(
        mut self,
        path: impl Into<String>,
        filename: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        self.items.push(BatchItem {
            path: path.into(),
            filename: filename.into(),
            content: content.into(),
        });
        self
    }
}

// === impl BatchItem ===

impl BatchItem {
    pub fn full_path(&self, base_path: &str) -> String {
        format!("{}{}/{}", base_path, self.path, self.filename)
    }
}

mod version {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(version: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(version)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(u64),
            String(String),
        }

        match Repr::deserialize(d)? {
            Repr::Number(n) => Ok(n),
            Repr::String(s) => s.parse().map_err(de::Error::custom),
        }
    }
}
