//! Process group identity.
//!
//! A process group is the durable logical identity of one database server process. Its ID
//! encodes the process class (including an optional location prefix) and a numeric index, and
//! survives replacement of the Pod backing it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ReconcileError;

/// The logical role of a database process.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessClass(String);

impl ProcessClass {
    pub fn new(class: impl Into<String>) -> Self {
        Self(class.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProcessClass {
    fn from(val: &str) -> Self {
        Self(val.into())
    }
}

/// A parsed process group ID of the form `[<prefix>-]<class>-<index>`.
///
/// A location prefix is folded into the class, so `dc1-storage-12` parses as class
/// `dc1-storage` with index `12`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessGroupId {
    class: ProcessClass,
    index: u32,
}

impl ProcessGroupId {
    /// Build the ID for a new process group, folding the optional location prefix into the class.
    pub fn new(prefix: Option<&str>, class: &ProcessClass, index: u32) -> Self {
        let class = match prefix {
            Some(prefix) if !prefix.is_empty() => ProcessClass(format!("{}-{}", prefix, class)),
            _ => class.clone(),
        };
        Self { class, index }
    }

    /// Parse a process group ID.
    pub fn parse(input: &str) -> Result<Self, ReconcileError> {
        let err = || ReconcileError::Parse(input.to_string());
        let (class, index) = input.rsplit_once('-').ok_or_else(err)?;
        if class.is_empty() || index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
            return Err(err());
        }
        let index = index.parse::<u32>().map_err(|_| err())?;
        Ok(Self {
            class: ProcessClass(class.into()),
            index,
        })
    }

    /// The class of this process group, including any location prefix.
    pub fn class(&self) -> &ProcessClass {
        &self.class
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Display for ProcessGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.class, self.index)
    }
}

impl FromStr for ProcessGroupId {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Derive the process group ID from a process ID.
///
/// A process ID carries one more numeric segment than its group (`storage-1-1` belongs to
/// `storage-1`). IDs without a trailing process number are returned unchanged.
pub fn process_group_id_from_process_id(process_id: &str) -> &str {
    let (head, tail) = match process_id.rsplit_once('-') {
        Some(parts) => parts,
        None => return process_id,
    };
    if tail.is_empty() || !tail.bytes().all(|b| b.is_ascii_digit()) {
        return process_id;
    }
    // Only drop the last segment when what remains is itself a full group ID.
    match head.rsplit_once('-') {
        Some((class, index)) if !class.is_empty() && !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()) => head,
        _ => process_id,
    }
}
