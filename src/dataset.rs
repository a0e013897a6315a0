//! Labeled dataset loading.
//!
//! Reads evaluation examples from a JSON array (`.json`) or line-delimited
//! JSON (`.jsonl`). Each record carries an id, an input prompt, the expected
//! output and a free-form metadata map.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during dataset loading
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Dataset file not found: {0}")]
    NotFound(String),

    #[error("Dataset extension must be .json or .jsonl: {0}")]
    UnsupportedExtension(String),

    #[error("Invalid record on line {line}: {source}")]
    InvalidLine {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid dataset JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Duplicate example id: {0}")]
    DuplicateId(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A single labeled example
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetExample {
    /// Example identifier
    pub id: String,
    /// Prompt sent to the model
    #[serde(default)]
    pub input: String,
    /// Reference output
    #[serde(default)]
    pub expected_output: String,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl DatasetExample {
    /// Declared function/tool name used for schema lookup
    #[must_use]
    pub fn function_name(&self) -> Option<&str> {
        self.metadata
            .get("function_name")
            .and_then(serde_json::Value::as_str)
            .filter(|name| !name.is_empty())
    }
}

/// A loaded dataset
#[derive(Debug, Clone)]
pub struct Dataset {
    /// Source file
    pub path: PathBuf,
    /// All examples, in file order
    pub examples: Vec<DatasetExample>,
}

impl Dataset {
    /// Load a dataset from a `.json` or `.jsonl` file
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, has an unsupported extension,
    /// cannot be parsed, or repeats an example id.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DatasetError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(DatasetError::NotFound(path.display().to_string()));
        }

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase);
        let content = std::fs::read_to_string(path)?;

        let examples = match extension.as_deref() {
            Some("jsonl") => Self::parse_jsonl(&content)?,
            Some("json") => serde_json::from_str(&content)?,
            _ => {
                return Err(DatasetError::UnsupportedExtension(
                    path.display().to_string(),
                ))
            }
        };

        Self::from_examples(path, examples)
    }

    /// Build a dataset from in-memory examples
    ///
    /// # Errors
    ///
    /// Returns `DatasetError::DuplicateId` if two examples share an id.
    pub fn from_examples<P: AsRef<Path>>(
        path: P,
        examples: Vec<DatasetExample>,
    ) -> Result<Self, DatasetError> {
        let mut seen = BTreeSet::new();
        for example in &examples {
            if !seen.insert(example.id.as_str()) {
                return Err(DatasetError::DuplicateId(example.id.clone()));
            }
        }

        Ok(Self {
            path: path.as_ref().to_path_buf(),
            examples,
        })
    }

    fn parse_jsonl(content: &str) -> Result<Vec<DatasetExample>, DatasetError> {
        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line.trim()).map_err(|source| DatasetError::InvalidLine {
                    line: idx + 1,
                    source,
                })
            })
            .collect()
    }

    /// Get total number of examples
    #[must_use]
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    /// Check if dataset is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Get iterator over examples
    pub fn iter(&self) -> impl Iterator<Item = &DatasetExample> {
        self.examples.iter()
    }

    /// Compute statistics about the dataset
    #[must_use]
    pub fn stats(&self) -> DatasetStats {
        let function_names: BTreeSet<String> = self
            .examples
            .iter()
            .filter_map(DatasetExample::function_name)
            .map(String::from)
            .collect();

        DatasetStats {
            total_examples: self.examples.len(),
            examples_with_function: self
                .examples
                .iter()
                .filter(|e| e.function_name().is_some())
                .count(),
            function_names: function_names.into_iter().collect(),
        }
    }
}

/// Statistics about the dataset
#[derive(Debug, Clone)]
pub struct DatasetStats {
    /// Total number of examples
    pub total_examples: usize,
    /// Examples declaring a function/tool name
    pub examples_with_function: usize,
    /// Distinct declared function names, sorted
    pub function_names: Vec<String>,
}
