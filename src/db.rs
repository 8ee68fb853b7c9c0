//! Document database access layer.
//!
//! A thin wrapper over a document collection: insert encoded documents,
//! query them back, and lazily decode matches into structures with their
//! stored results. The store itself sits behind the [`DocumentStore`]
//! trait so the mapping logic is decoupled from any particular backend's
//! connection lifecycle; [`JsonlStore`] is the bundled file-backed
//! collection (one JSON document per line).
//!
//! No validation happens here beyond what the codec already performed, no
//! retries, no idempotence: inserting twice stores two documents, and any
//! store failure propagates to the caller.

use crate::atoms::AtomicStructure;
use crate::calculator::CalculationResult;
use crate::codec::{self, SerializationError};
use log::debug;
use serde_json::{Map, Value};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised by the access layer or its backing store.
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O failure talking to the backing collection.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A stored line is not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// A stored document failed to decode back into a structure.
    #[error("codec error: {0}")]
    Codec(#[from] SerializationError),
}

/// Access-layer result alias.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Identifier assigned to an inserted document.
pub type DocId = u64;

/// Equality filter on dotted key paths, e.g. `{"atoms.natoms": 2}`.
pub type Filter = Map<String, Value>;

/// Capability a backing document collection must provide.
///
/// A real document-store client implements this around its wire protocol;
/// the access layer composes over the trait instead of extending a client
/// type.
pub trait DocumentStore {
    /// Appends a document and returns its identifier. Calling twice with
    /// the same document inserts twice.
    fn insert(&mut self, doc: &Value) -> Result<DocId>;

    /// Returns a lazy, single-pass sequence of documents matching the
    /// filter. Re-issue the query to traverse again.
    fn find(&self, filter: &Filter) -> Result<Box<dyn Iterator<Item = Result<Value>>>>;
}

/// Looks up a dotted key path inside a document.
fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// True when every filter entry matches the document by equality.
pub fn matches(doc: &Value, filter: &Filter) -> bool {
    filter
        .iter()
        .all(|(path, expected)| lookup(doc, path) == Some(expected))
}

/// File-backed collection storing one JSON document per line.
pub struct JsonlStore {
    path: PathBuf,
    next_id: u64,
}

impl JsonlStore {
    /// Opens (or creates) a collection file, counting existing documents
    /// to continue the identifier sequence. A fresh collection exists on
    /// disk immediately, so queries against it match nothing instead of
    /// failing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        OpenOptions::new().create(true).append(true).open(&path)?;
        let next_id = BufReader::new(File::open(&path)?).lines().count() as u64;
        Ok(Self { path, next_id })
    }

    /// Path of the backing collection file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DocumentStore for JsonlStore {
    fn insert(&mut self, doc: &Value) -> Result<DocId> {
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        serde_json::to_writer(&mut file, doc)?;
        file.write_all(b"\n")?;
        let id = self.next_id;
        self.next_id += 1;
        debug!("inserted document {} into {}", id, self.path.display());
        Ok(id)
    }

    fn find(&self, filter: &Filter) -> Result<Box<dyn Iterator<Item = Result<Value>>>> {
        let file = File::open(&self.path)?;
        let filter = filter.clone();
        let iter = BufReader::new(file).lines().filter_map(move |line| {
            let line = match line {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            match serde_json::from_str::<Value>(&line) {
                Ok(doc) if matches(&doc, &filter) => Some(Ok(doc)),
                Ok(_) => None,
                Err(e) => Some(Err(e.into())),
            }
        });
        Ok(Box::new(iter))
    }
}

/// Access layer pairing a document store with the atoms-document codec.
pub struct AtomsDatabase<S: DocumentStore> {
    store: S,
}

impl<S: DocumentStore> AtomsDatabase<S> {
    /// Wraps a store handle.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Inserts an encoded document, merging extra key/value pairs first.
    /// Thin pass-through; no transaction or idempotence guarantee.
    pub fn write(&mut self, mut doc: Value, extra: &Map<String, Value>) -> Result<DocId> {
        if let Some(obj) = doc.as_object_mut() {
            for (key, value) in extra {
                obj.insert(key.clone(), value.clone());
            }
        }
        self.store.insert(&doc)
    }

    /// Raw query against the collection.
    pub fn find(&self, filter: &Filter) -> Result<Box<dyn Iterator<Item = Result<Value>>>> {
        self.store.find(filter)
    }

    /// Queries and lazily decodes each match into a structure and its
    /// stored result set. One pass; not restartable without re-querying.
    pub fn get_atoms(
        &self,
        filter: &Filter,
    ) -> Result<impl Iterator<Item = Result<(AtomicStructure, CalculationResult)>>> {
        let docs = self.store.find(filter)?;
        Ok(docs.map(|doc| {
            let doc = doc?;
            Ok(codec::decode(&doc)?)
        }))
    }
}
