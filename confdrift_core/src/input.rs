use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown configuration type '{0}'")]
pub struct UnknownConfType(pub String);

/// The declared type of a configuration parameter. Decides which mutation and
/// constraint rules apply to its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ConfType {
    Int,
    Float,
    Bool,
    String,
    Port,
    Ip,
    DirPath,
    FilePath,
    Enum,
    Time,
    Size,
}

impl ConfType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfType::Int => "INT",
            ConfType::Float => "FLOAT",
            ConfType::Bool => "BOOL",
            ConfType::String => "STRING",
            ConfType::Port => "PORT",
            ConfType::Ip => "IP",
            ConfType::DirPath => "DIRPATH",
            ConfType::FilePath => "FILEPATH",
            ConfType::Enum => "ENUM",
            ConfType::Time => "TIME",
            ConfType::Size => "SIZE",
        }
    }

    /// Types whose values compare numerically (with an optional unit suffix).
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ConfType::Int | ConfType::Float | ConfType::Port | ConfType::Time | ConfType::Size
        )
    }

    pub fn is_path(&self) -> bool {
        matches!(self, ConfType::DirPath | ConfType::FilePath)
    }
}

impl FromStr for ConfType {
    type Err = UnknownConfType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = match s.trim().to_ascii_lowercase().as_str() {
            "int" | "integer" | "long" => ConfType::Int,
            "float" | "double" => ConfType::Float,
            "bool" | "boolean" => ConfType::Bool,
            "str" | "string" => ConfType::String,
            "port" => ConfType::Port,
            "ip" | "address" => ConfType::Ip,
            "dirpath" | "path" | "dir" => ConfType::DirPath,
            "filepath" | "file" => ConfType::FilePath,
            "enum" => ConfType::Enum,
            "time" | "duration" => ConfType::Time,
            "size" | "datasize" => ConfType::Size,
            _ => return Err(UnknownConfType(s.to_string())),
        };
        Ok(parsed)
    }
}

impl TryFrom<String> for ConfType {
    type Error = UnknownConfType;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ConfType> for String {
    fn from(value: ConfType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ConfType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single configuration parameter, the unit of mutation.
///
/// Equality and hashing are structural over `name`, `ty` and `value`; the
/// `mutated` flag is bookkeeping and does not take part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfItem {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ConfType,
    pub value: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub mutated: bool,
}

impl ConfItem {
    pub fn new(name: impl Into<String>, ty: ConfType, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty,
            value: value.into(),
            mutated: false,
        }
    }
}

impl PartialEq for ConfItem {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.ty == other.ty && self.value == other.value
    }
}

impl Eq for ConfItem {}

impl Hash for ConfItem {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.ty.hash(state);
        self.value.hash(state);
    }
}

impl fmt::Display for ConfItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})={}", self.name, self.ty, self.value)
    }
}

/// Anything the fuzzer can execute: an ordered list of configuration items.
pub trait Input: Clone + Send + Sync + fmt::Debug + 'static {
    fn items(&self) -> &[ConfItem];

    fn len(&self) -> usize {
        self.items().len()
    }

    fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    fn get(&self, index: usize) -> Option<&ConfItem> {
        self.items().get(index)
    }

    fn contains(&self, item: &ConfItem) -> bool {
        self.items().contains(item)
    }

    /// Returns the position and item carrying `name`, if present.
    fn find(&self, name: &str) -> Option<(usize, &ConfItem)> {
        self.items()
            .iter()
            .enumerate()
            .find(|(_, item)| item.name == name)
    }

    /// Canonical byte form, one `name\ttype\tvalue` line per item.
    fn as_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for item in self.items() {
            out.extend_from_slice(item.name.as_bytes());
            out.push(b'\t');
            out.extend_from_slice(item.ty.as_str().as_bytes());
            out.push(b'\t');
            out.extend_from_slice(item.value.as_bytes());
            out.push(b'\n');
        }
        out
    }

    fn fingerprint(&self) -> [u8; 16] {
        md5::compute(self.as_bytes()).0
    }
}

/// A full candidate configuration kept in the pool. Items are unique by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SeedItems")]
pub struct Seed {
    #[serde(default, rename = "item")]
    items: Vec<ConfItem>,
}

/// Wire form of a [`Seed`]; duplicates are dropped on the way in.
#[derive(Deserialize)]
struct SeedItems {
    #[serde(default, rename = "item")]
    items: Vec<ConfItem>,
}

impl From<SeedItems> for Seed {
    fn from(raw: SeedItems) -> Self {
        Self::from_items(raw.items)
    }
}

impl Seed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a seed, keeping the first occurrence of every name.
    pub fn from_items(items: impl IntoIterator<Item = ConfItem>) -> Self {
        let mut seed = Self::new();
        for item in items {
            seed.push(item);
        }
        seed
    }

    /// Appends `item` unless an item with the same name is already present.
    pub fn push(&mut self, item: ConfItem) -> bool {
        if self.find(&item.name).is_some() {
            return false;
        }
        self.items.push(item);
        true
    }

    /// Removes the first item structurally equal to `item`.
    pub fn remove(&mut self, item: &ConfItem) -> bool {
        match self.items.iter().position(|candidate| candidate == item) {
            Some(index) => {
                self.items.remove(index);
                true
            }
            None => false,
        }
    }
}

impl Input for Seed {
    fn items(&self) -> &[ConfItem] {
        &self.items
    }
}

impl From<Testcase> for Seed {
    fn from(testcase: Testcase) -> Self {
        let items = testcase.items.into_iter().map(|mut item| {
            item.mutated = false;
            item
        });
        Seed::from_items(items)
    }
}

/// One concrete configuration submitted for execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Testcase {
    items: Vec<ConfItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
}

impl Testcase {
    pub fn new(items: Vec<ConfItem>) -> Self {
        Self {
            items,
            file_path: None,
        }
    }

    pub fn into_items(self) -> Vec<ConfItem> {
        self.items
    }

    /// Items whose value differs from `defaults`. Items with no default
    /// always count as deviating.
    pub fn deviations<'a>(&'a self, defaults: &HashMap<String, String>) -> Vec<&'a ConfItem> {
        self.items
            .iter()
            .filter(|item| defaults.get(&item.name) != Some(&item.value))
            .collect()
    }

    pub fn mutated_items(&self) -> impl Iterator<Item = &ConfItem> {
        self.items.iter().filter(|item| item.mutated)
    }
}

impl Input for Testcase {
    fn items(&self) -> &[ConfItem] {
        &self.items
    }
}

impl From<&Seed> for Testcase {
    fn from(seed: &Seed) -> Self {
        Testcase::new(seed.items.clone())
    }
}
