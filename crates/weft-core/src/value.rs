//! Typed CWL values.
//!
//! CWL inputs and outputs arrive as JSON trees; this module converts them
//! into a tagged sum so the rest of the engine never touches untyped maps.
//! Unrecognised keys on File/Directory objects survive in `extra` and are
//! written back on serialization.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value as Json};
use std::collections::BTreeMap;
use std::path::Path;

/// A CWL runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum CwlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    File(Box<FileValue>),
    Directory(Box<DirectoryValue>),
    Array(Vec<CwlValue>),
    Record(BTreeMap<String, CwlValue>),
}

/// A CWL `File` object.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FileValue {
    pub location: Option<String>,
    pub path: Option<String>,
    pub basename: Option<String>,
    pub contents: Option<String>,
    pub checksum: Option<String>,
    pub size: Option<i64>,
    pub format: Option<String>,
    pub secondary_files: Vec<CwlValue>,
    /// Extension fields the engine does not interpret.
    pub extra: BTreeMap<String, Json>,
}

/// A CWL `Directory` object.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DirectoryValue {
    pub location: Option<String>,
    pub path: Option<String>,
    pub basename: Option<String>,
    pub listing: Vec<CwlValue>,
    pub extra: BTreeMap<String, Json>,
}

impl CwlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CwlValue::Null)
    }

    pub fn as_file(&self) -> Option<&FileValue> {
        match self {
            CwlValue::File(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_file_mut(&mut self) -> Option<&mut FileValue> {
        match self {
            CwlValue::File(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CwlValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Render the value the way it appears on a command line.
    pub fn to_argument_string(&self) -> String {
        match self {
            CwlValue::Null => "null".to_string(),
            CwlValue::Bool(b) => b.to_string(),
            CwlValue::Int(i) => i.to_string(),
            CwlValue::Float(f) => f.to_string(),
            CwlValue::String(s) => s.clone(),
            CwlValue::File(f) => f.path.clone().or_else(|| f.location.clone()).unwrap_or_default(),
            CwlValue::Directory(d) => d.path.clone().or_else(|| d.location.clone()).unwrap_or_default(),
            other => other.to_json().to_string(),
        }
    }

    /// Convert an untyped JSON tree into a typed value. Objects carrying
    /// `class: File` / `class: Directory` become the dedicated variants.
    pub fn from_json(json: Json) -> CwlValue {
        match json {
            Json::Null => CwlValue::Null,
            Json::Bool(b) => CwlValue::Bool(b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    CwlValue::Int(i)
                } else {
                    CwlValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Json::String(s) => CwlValue::String(s),
            Json::Array(items) => {
                CwlValue::Array(items.into_iter().map(CwlValue::from_json).collect())
            }
            Json::Object(map) => {
                let class = map.get("class").and_then(Json::as_str).map(str::to_owned);
                match class.as_deref() {
                    Some("File") => CwlValue::File(Box::new(FileValue::from_map(map))),
                    Some("Directory") => {
                        CwlValue::Directory(Box::new(DirectoryValue::from_map(map)))
                    }
                    _ => CwlValue::Record(
                        map.into_iter()
                            .map(|(k, v)| (k, CwlValue::from_json(v)))
                            .collect(),
                    ),
                }
            }
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            CwlValue::Null => Json::Null,
            CwlValue::Bool(b) => Json::Bool(*b),
            CwlValue::Int(i) => Json::from(*i),
            CwlValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            CwlValue::String(s) => Json::String(s.clone()),
            CwlValue::File(f) => f.to_json(),
            CwlValue::Directory(d) => d.to_json(),
            CwlValue::Array(items) => Json::Array(items.iter().map(CwlValue::to_json).collect()),
            CwlValue::Record(map) => Json::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

fn take_string(map: &mut Map<String, Json>, key: &str) -> Option<String> {
    map.remove(key).and_then(|v| match v {
        Json::String(s) => Some(s),
        _ => None,
    })
}

impl FileValue {
    fn from_map(mut map: Map<String, Json>) -> Self {
        map.remove("class");
        let secondary_files = map
            .remove("secondaryFiles")
            .and_then(|v| match v {
                Json::Array(items) => {
                    Some(items.into_iter().map(CwlValue::from_json).collect())
                }
                _ => None,
            })
            .unwrap_or_default();
        FileValue {
            location: take_string(&mut map, "location"),
            path: take_string(&mut map, "path"),
            basename: take_string(&mut map, "basename"),
            contents: take_string(&mut map, "contents"),
            checksum: take_string(&mut map, "checksum"),
            size: map.remove("size").and_then(|v| v.as_i64()),
            format: take_string(&mut map, "format"),
            secondary_files,
            extra: map.into_iter().collect(),
        }
    }

    pub fn to_json(&self) -> Json {
        let mut map = Map::new();
        map.insert("class".into(), Json::from("File"));
        if let Some(v) = &self.location {
            map.insert("location".into(), Json::from(v.clone()));
        }
        if let Some(v) = &self.path {
            map.insert("path".into(), Json::from(v.clone()));
        }
        if let Some(v) = &self.basename {
            map.insert("basename".into(), Json::from(v.clone()));
        }
        if let Some(v) = &self.contents {
            map.insert("contents".into(), Json::from(v.clone()));
        }
        if let Some(v) = &self.checksum {
            map.insert("checksum".into(), Json::from(v.clone()));
        }
        if let Some(v) = self.size {
            map.insert("size".into(), Json::from(v));
        }
        if let Some(v) = &self.format {
            map.insert("format".into(), Json::from(v.clone()));
        }
        if !self.secondary_files.is_empty() {
            map.insert(
                "secondaryFiles".into(),
                Json::Array(self.secondary_files.iter().map(CwlValue::to_json).collect()),
            );
        }
        for (k, v) in &self.extra {
            map.insert(k.clone(), v.clone());
        }
        Json::Object(map)
    }

    /// The on-disk source of this file: `path`, or `location` with a
    /// `file://` prefix stripped. Literal files (contents only) have none.
    pub fn source_path(&self) -> Option<String> {
        if let Some(p) = &self.path {
            return Some(p.clone());
        }
        self.location
            .as_ref()
            .map(|loc| loc.strip_prefix("file://").unwrap_or(loc).to_string())
    }

    /// Basename, falling back to the final component of the source path.
    pub fn effective_basename(&self) -> Option<String> {
        if let Some(b) = &self.basename {
            return Some(b.clone());
        }
        self.source_path().and_then(|p| {
            Path::new(&p)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        })
    }
}

impl DirectoryValue {
    fn from_map(mut map: Map<String, Json>) -> Self {
        map.remove("class");
        let listing = map
            .remove("listing")
            .and_then(|v| match v {
                Json::Array(items) => {
                    Some(items.into_iter().map(CwlValue::from_json).collect())
                }
                _ => None,
            })
            .unwrap_or_default();
        DirectoryValue {
            location: take_string(&mut map, "location"),
            path: take_string(&mut map, "path"),
            basename: take_string(&mut map, "basename"),
            listing,
            extra: map.into_iter().collect(),
        }
    }

    pub fn to_json(&self) -> Json {
        let mut map = Map::new();
        map.insert("class".into(), Json::from("Directory"));
        if let Some(v) = &self.location {
            map.insert("location".into(), Json::from(v.clone()));
        }
        if let Some(v) = &self.path {
            map.insert("path".into(), Json::from(v.clone()));
        }
        if let Some(v) = &self.basename {
            map.insert("basename".into(), Json::from(v.clone()));
        }
        if !self.listing.is_empty() {
            map.insert(
                "listing".into(),
                Json::Array(self.listing.iter().map(CwlValue::to_json).collect()),
            );
        }
        for (k, v) in &self.extra {
            map.insert(k.clone(), v.clone());
        }
        Json::Object(map)
    }

    pub fn source_path(&self) -> Option<String> {
        if let Some(p) = &self.path {
            return Some(p.clone());
        }
        self.location
            .as_ref()
            .map(|loc| loc.strip_prefix("file://").unwrap_or(loc).to_string())
    }

    pub fn effective_basename(&self) -> Option<String> {
        if let Some(b) = &self.basename {
            return Some(b.clone());
        }
        self.source_path().and_then(|p| {
            Path::new(&p)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        })
    }
}

impl Serialize for CwlValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CwlValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let json = Json::deserialize(deserializer)?;
        Ok(CwlValue::from_json(json))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_file_objects() {
        let value = CwlValue::from_json(json!({
            "class": "File",
            "location": "file:///data/in.txt",
            "size": 5,
            "x-custom": true,
        }));
        let file = value.as_file().unwrap();
        assert_eq!(file.source_path().as_deref(), Some("/data/in.txt"));
        assert_eq!(file.size, Some(5));
        assert_eq!(file.extra.get("x-custom"), Some(&json!(true)));
    }

    #[test]
    fn plain_objects_become_records() {
        let value = CwlValue::from_json(json!({"message": "hello"}));
        assert!(matches!(value, CwlValue::Record(_)));
    }

    #[test]
    fn round_trips_preserve_extensions() {
        let original = json!({
            "class": "File",
            "path": "/tmp/a.txt",
            "secondaryFiles": [{"class": "File", "path": "/tmp/a.txt.idx"}],
            "format": "http://edamontology.org/format_1964",
            "x-provenance": {"run": 3},
        });
        let round = CwlValue::from_json(original.clone()).to_json();
        assert_eq!(round, original);
    }

    #[test]
    fn effective_basename_falls_back_to_path() {
        let file = FileValue {
            location: Some("file:///data/reads.fastq".into()),
            ..Default::default()
        };
        assert_eq!(file.effective_basename().as_deref(), Some("reads.fastq"));
    }
}
