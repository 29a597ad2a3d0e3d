//! Document store kept in memory and, when given a path, mirrored to a file
//! holding one JSON document per line.

use super::{Document, DocumentStore, Query, Sort, StoreResult};
use crate::domain::settings::StoreSettings;
use crate::error::StoreError;
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

pub struct JsonStore {
    docs: RwLock<Vec<Document>>,
    path: Option<PathBuf>,
    closed: AtomicBool,
}

impl JsonStore {
    pub fn in_memory() -> Self {
        Self {
            docs: RwLock::new(Vec::new()),
            path: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Open a file-backed store, loading existing documents if the file exists.
    pub async fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let docs = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => parse_lines(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        info!("Opened store {} with {} documents", path.display(), docs.len());

        Ok(Self {
            docs: RwLock::new(docs),
            path: Some(path),
            closed: AtomicBool::new(false),
        })
    }

    pub async fn from_settings(settings: &StoreSettings) -> StoreResult<Self> {
        match &settings.path {
            Some(path) => Self::open(path.clone()).await,
            None => Ok(Self::in_memory()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Persist `staged`, then make it the live collection. A failed flush
    /// leaves the live collection untouched.
    async fn commit(&self, live: &mut Vec<Document>, staged: Vec<Document>) -> StoreResult<()> {
        self.flush(&staged).await?;
        *live = staged;
        Ok(())
    }

    async fn flush(&self, docs: &[Document]) -> StoreResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut contents = String::new();
        for doc in docs {
            contents.push_str(&serde_json::to_string(doc)?);
            contents.push('\n');
        }

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!("Flushed {} documents to {}", docs.len(), path.display());
        Ok(())
    }
}

fn parse_lines(contents: &str) -> StoreResult<Vec<Document>> {
    let mut docs = Vec::new();
    for line in contents.lines().filter(|l| !l.trim().is_empty()) {
        if let Value::Object(doc) = serde_json::from_str::<Value>(line)? {
            docs.push(doc);
        }
    }
    Ok(docs)
}

#[async_trait]
impl DocumentStore for JsonStore {
    async fn insert(&self, mut doc: Document) -> StoreResult<Document> {
        self.ensure_open()?;
        if !doc.contains_key("_id") {
            doc.insert(
                "_id".to_string(),
                Value::String(uuid::Uuid::new_v4().simple().to_string()),
            );
        }

        let mut docs = self.docs.write().await;
        let mut staged = docs.clone();
        staged.push(doc.clone());
        self.commit(&mut docs, staged).await?;
        Ok(doc)
    }

    async fn find_one(&self, query: &Query) -> StoreResult<Option<Document>> {
        self.ensure_open()?;
        let docs = self.docs.read().await;
        Ok(docs.iter().find(|d| query.matches(d)).cloned())
    }

    async fn find(&self, query: &Query, sort: Option<&Sort>) -> StoreResult<Vec<Document>> {
        self.ensure_open()?;
        let docs = self.docs.read().await;
        let mut found: Vec<Document> = docs.iter().filter(|d| query.matches(d)).cloned().collect();
        if let Some(sort) = sort {
            found.sort_by(|a, b| sort.compare(a, b));
        }
        Ok(found)
    }

    async fn update_multi(&self, filter: &Query, patch: &Document) -> StoreResult<usize> {
        self.ensure_open()?;
        let mut docs = self.docs.write().await;
        let mut staged = docs.clone();
        let mut count = 0;
        for doc in staged.iter_mut().filter(|d| filter.matches(d)) {
            for (key, value) in patch {
                doc.insert(key.clone(), value.clone());
            }
            count += 1;
        }
        if count > 0 {
            self.commit(&mut docs, staged).await?;
        }
        Ok(count)
    }

    async fn remove_multi(&self, filter: &Query) -> StoreResult<usize> {
        self.ensure_open()?;
        let mut docs = self.docs.write().await;
        let staged: Vec<Document> = docs.iter().filter(|d| !filter.matches(d)).cloned().collect();
        let count = docs.len() - staged.len();
        if count > 0 {
            self.commit(&mut docs, staged).await?;
        }
        Ok(count)
    }

    async fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let docs = self.docs.read().await;
        self.flush(&docs).await
    }
}
