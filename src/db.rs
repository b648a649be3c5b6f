//! Object database: stored models and the documents training writes.
//!
//! The composer never looks inside a `ModelDocument`; only the matcher (which
//! loads descriptors and 3D points) and the writer touch the store.

use crate::Result;

use anyhow::{Context, bail};
use log::{debug, info};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

pub const METHOD: &str = "TOD";

/// A trained model, one per object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDocument {
    pub object_id: String,
    pub method: String,
    /// JSON string; opaque here.
    #[serde(default)]
    pub submethod: String,
    pub points: Vec<[f32; 3]>,
    pub descriptors: Vec<Vec<u8>>,
}

/// Connection description, parsed from the `db` JSON parameter.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DbParams {
    Memory {
        #[serde(default = "default_store")]
        name: String,
    },
    File {
        root: PathBuf,
    },
}

fn default_store() -> String {
    "default".to_string()
}

impl DbParams {
    /// `{}` (or an empty string) selects the default in-memory store.
    pub fn parse(json: &str) -> Result<Self> {
        if json.trim().is_empty() {
            return Ok(DbParams::Memory {
                name: default_store(),
            });
        }
        let value: serde_json::Value =
            serde_json::from_str(json).with_context(|| format!("invalid db JSON: {}", json))?;
        if value.as_object().is_some_and(|o| o.is_empty()) {
            return Ok(DbParams::Memory {
                name: default_store(),
            });
        }
        serde_json::from_value(value).with_context(|| format!("unsupported db parameters: {}", json))
    }
}

/// Which objects to load: the literal `"all"` or a JSON list of ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectSelection {
    All,
    Ids(Vec<String>),
}

impl ObjectSelection {
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        if trimmed == "all" || trimmed == "\"all\"" {
            return Ok(ObjectSelection::All);
        }
        let ids: Vec<String> = serde_json::from_str(trimmed)
            .with_context(|| format!("object_ids must be \"all\" or a JSON list, got {}", text))?;
        Ok(ObjectSelection::Ids(ids))
    }

    pub fn admits(&self, object_id: &str) -> bool {
        match self {
            ObjectSelection::All => true,
            ObjectSelection::Ids(ids) => ids.iter().any(|id| id == object_id),
        }
    }
}

pub trait ObjectDb {
    /// Models of `METHOD` for the selected objects, ordered by object id.
    fn load_models(&self, selection: &ObjectSelection) -> Result<Vec<ModelDocument>>;

    fn write_document(&mut self, doc: &ModelDocument) -> Result<()>;
}

pub fn open_db(json: &str) -> Result<Box<dyn ObjectDb>> {
    Ok(match DbParams::parse(json)? {
        DbParams::Memory { name } => Box::new(MemoryDb { name }),
        DbParams::File { root } => Box::new(FileDb { root }),
    })
}

thread_local! {
    static STORES: RefCell<BTreeMap<String, BTreeMap<String, ModelDocument>>> =
        RefCell::new(BTreeMap::new());
}

/// Named in-memory store, shared by every handle on the same thread.
pub struct MemoryDb {
    name: String,
}

impl ObjectDb for MemoryDb {
    fn load_models(&self, selection: &ObjectSelection) -> Result<Vec<ModelDocument>> {
        Ok(STORES.with(|stores| {
            stores
                .borrow()
                .get(&self.name)
                .map(|docs| {
                    docs.values()
                        .filter(|d| d.method == METHOD && selection.admits(&d.object_id))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        }))
    }

    fn write_document(&mut self, doc: &ModelDocument) -> Result<()> {
        STORES.with(|stores| {
            stores
                .borrow_mut()
                .entry(self.name.clone())
                .or_default()
                .insert(doc.object_id.clone(), doc.clone());
        });
        debug!("memory db {}: stored {}", self.name, doc.object_id);
        Ok(())
    }
}

/// One pretty-printed JSON document per object under `root`.
pub struct FileDb {
    root: PathBuf,
}

impl FileDb {
    fn path_for(&self, object_id: &str) -> Result<PathBuf> {
        let re = Regex::new(r"^[A-Za-z0-9_.-]+$")?;
        if !re.is_match(object_id) || object_id.starts_with('.') {
            bail!("object id {:?} cannot be used as a file name", object_id);
        }
        Ok(self.root.join(format!("{}.json", object_id)))
    }
}

impl ObjectDb for FileDb {
    fn load_models(&self, selection: &ObjectSelection) -> Result<Vec<ModelDocument>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut docs = Vec::new();
        for entry in fs::read_dir(&self.root)
            .with_context(|| format!("failed to list {}", self.root.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let text = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let doc: ModelDocument = serde_json::from_str(&text)
                .with_context(|| format!("invalid model document {}", path.display()))?;
            if doc.method == METHOD && selection.admits(&doc.object_id) {
                docs.push(doc);
            }
        }
        docs.sort_by(|a, b| a.object_id.cmp(&b.object_id));
        Ok(docs)
    }

    fn write_document(&mut self, doc: &ModelDocument) -> Result<()> {
        let path = self.path_for(&doc.object_id)?;
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create {}", self.root.display()))?;
        let text = serde_json::to_string_pretty(doc)?;
        fs::write(&path, text).with_context(|| format!("failed to write {}", path.display()))?;
        info!("wrote model {} to {}", doc.object_id, path.display());
        Ok(())
    }
}
