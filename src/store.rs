use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::matching::QueryMap;

/// The request side of a persisted matcher: what an incoming request must
/// equal for the stored response to be replayed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestDescriptor {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: QueryMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// The response side of a persisted matcher: which archive artifact to serve
/// and with what status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseDescriptor {
    pub name: String,
    #[serde(rename = "statusCode")]
    pub status_code: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Matcher {
    pub req: RequestDescriptor,
    pub res: ResponseDescriptor,
}

/// In-memory matcher sequence mirrored to a JSON document on disk, plus the
/// process-scoped tally of how many requests each artifact has satisfied.
///
/// The sequence is append-only and never reordered; every append rewrites the
/// whole document. Callers that mutate the store from concurrent tasks must
/// serialize access (the proxy holds it behind a mutex).
#[derive(Debug)]
pub struct MatcherStore {
    path: PathBuf,
    matchers: Vec<Matcher>,
    tallies: BTreeMap<String, u64>,
}

impl MatcherStore {
    /// Loads the matcher document at `path`. A missing file is the "no
    /// matchers yet" condition, not an error; anything else that prevents
    /// reading or parsing the document is.
    pub fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let matchers: Vec<Matcher> = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parse matcher document {}", path.display()))?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("read matcher document {}", path.display()));
            }
        };

        let tallies = matchers
            .iter()
            .map(|matcher| (matcher.res.name.clone(), 0))
            .collect();

        Ok(Self {
            path,
            matchers,
            tallies,
        })
    }

    pub fn len(&self) -> usize {
        self.matchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    pub fn matchers(&self) -> &[Matcher] {
        &self.matchers
    }

    /// First matcher satisfying `is_match` against `incoming`, in insertion
    /// order. Earlier-recorded matchers shadow later ones.
    pub fn find_match(
        &self,
        incoming: &RequestDescriptor,
        is_match: fn(&RequestDescriptor, &RequestDescriptor) -> bool,
    ) -> Option<&Matcher> {
        self.matchers
            .iter()
            .find(|matcher| is_match(incoming, &matcher.req))
    }

    /// Artifact names of all stored matchers, for the name generator's
    /// collision check.
    pub fn artifact_names(&self) -> impl Iterator<Item = &str> {
        self.matchers.iter().map(|matcher| matcher.res.name.as_str())
    }

    /// Appends to the in-memory sequence and rewrites the persisted document.
    pub fn append(&mut self, matcher: Matcher) -> anyhow::Result<()> {
        self.matchers.push(matcher);
        if let Err(err) = self.persist() {
            self.matchers.pop();
            return Err(err);
        }
        Ok(())
    }

    // Full rewrite through a temp file so a concurrent reader of the document
    // never observes a torn write. No cross-process guarantee.
    fn persist(&self) -> anyhow::Result<()> {
        let document = serde_json::to_vec_pretty(&self.matchers)
            .context("serialize matcher document")?;
        let tmp_path = temp_document_path(&self.path);
        fs::write(&tmp_path, document)
            .with_context(|| format!("write matcher document {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "replace matcher document {} with {}",
                self.path.display(),
                tmp_path.display()
            )
        })?;
        Ok(())
    }

    pub fn set_tally(&mut self, artifact_name: &str, count: u64) {
        self.tallies.insert(artifact_name.to_owned(), count);
    }

    pub fn increment_tally(&mut self, artifact_name: &str) {
        *self.tallies.entry(artifact_name.to_owned()).or_insert(0) += 1;
    }

    pub fn tally(&self, artifact_name: &str) -> u64 {
        self.tallies.get(artifact_name).copied().unwrap_or(0)
    }

    /// Artifact names that satisfied at least one request this process
    /// lifetime.
    pub fn matched_artifacts(&self) -> Vec<String> {
        self.tallies
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Artifact names loaded at startup that no request has used yet.
    pub fn unmatched_artifacts(&self) -> Vec<String> {
        self.tallies
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

fn temp_document_path(path: &Path) -> PathBuf {
    let mut file_name = path.file_name().unwrap_or_default().to_os_string();
    file_name.push(".tmp");
    path.with_file_name(file_name)
}
