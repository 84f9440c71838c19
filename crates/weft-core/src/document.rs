//! CWL document model.
//!
//! These types are what the external parser/validator hands the engine:
//! a `CommandLineTool` per step plus the workflow graph in
//! [`crate::workflow`]. Requirements and hints stay untyped maps from
//! class name to body, with typed views for the classes the engine acts
//! on.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as Json;
use std::collections::BTreeMap;

use crate::value::CwlValue;

/// Requirement classes the engine honours.
pub const DOCKER_REQUIREMENT: &str = "DockerRequirement";
pub const INITIAL_WORK_DIR_REQUIREMENT: &str = "InitialWorkDirRequirement";
pub const INLINE_JAVASCRIPT_REQUIREMENT: &str = "InlineJavascriptRequirement";
pub const INPLACE_UPDATE_REQUIREMENT: &str = "InplaceUpdateRequirement";
pub const SHELL_COMMAND_REQUIREMENT: &str = "ShellCommandRequirement";

/// An untyped set of CWL requirements or hints, keyed by class name.
///
/// Accepts both serialized shapes: a list of `{class: ..., ...}` objects
/// or a map from class name to body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Requirements(BTreeMap<String, Json>);

impl Requirements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, class: impl Into<String>, body: Json) {
        self.0.insert(class.into(), body);
    }

    pub fn contains(&self, class: &str) -> bool {
        self.0.contains_key(class)
    }

    pub fn raw(&self, class: &str) -> Option<&Json> {
        self.0.get(class)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Deserialize the body of a requirement into its typed view.
    pub fn get<T: DeserializeOwned>(&self, class: &str) -> Option<T> {
        self.0
            .get(class)
            .and_then(|body| serde_json::from_value(body.clone()).ok())
    }

    pub fn docker(&self) -> Option<DockerRequirement> {
        self.get(DOCKER_REQUIREMENT)
    }

    pub fn initial_work_dir(&self) -> Option<InitialWorkDirRequirement> {
        self.get(INITIAL_WORK_DIR_REQUIREMENT)
    }

    pub fn inline_javascript(&self) -> Option<InlineJavascriptRequirement> {
        self.get(INLINE_JAVASCRIPT_REQUIREMENT)
    }

    pub fn inplace_update(&self) -> bool {
        self.get::<InplaceUpdateRequirement>(INPLACE_UPDATE_REQUIREMENT)
            .map(|r| r.inplace_update)
            .unwrap_or(false)
    }

    pub fn shell_command(&self) -> bool {
        self.contains(SHELL_COMMAND_REQUIREMENT)
    }
}

impl Serialize for Requirements {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Requirements {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let json = Json::deserialize(deserializer)?;
        let mut map = BTreeMap::new();
        match json {
            Json::Array(items) => {
                for item in items {
                    if let Json::Object(mut obj) = item {
                        if let Some(Json::String(class)) = obj.remove("class") {
                            map.insert(class, Json::Object(obj));
                        }
                    }
                }
            }
            Json::Object(obj) => {
                for (class, body) in obj {
                    map.insert(class, body);
                }
            }
            Json::Null => {}
            other => {
                return Err(serde::de::Error::custom(format!(
                    "requirements must be a list or map, got {other}"
                )));
            }
        }
        Ok(Requirements(map))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DockerRequirement {
    pub docker_pull: Option<String>,
    pub docker_image_id: Option<String>,
    pub docker_output_directory: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InitialWorkDirRequirement {
    /// Either a listing array or an expression string; resolved by the
    /// staging engine.
    pub listing: Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InlineJavascriptRequirement {
    pub expression_lib: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InplaceUpdateRequirement {
    pub inplace_update: bool,
}

/// The executable of a tool: a single word or argv prefix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum BaseCommand {
    Single(String),
    Multiple(Vec<String>),
}

impl Default for BaseCommand {
    fn default() -> Self {
        BaseCommand::Multiple(Vec::new())
    }
}

impl BaseCommand {
    pub fn argv(&self) -> Vec<String> {
        match self {
            BaseCommand::Single(s) => vec![s.clone()],
            BaseCommand::Multiple(v) => v.clone(),
        }
    }
}

/// A tool `arguments` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Argument {
    Literal(String),
    Binding(CommandLineBinding),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommandLineBinding {
    pub position: Option<i64>,
    pub prefix: Option<String>,
    pub separate: Option<bool>,
    pub item_separator: Option<String>,
    pub value_from: Option<String>,
    pub shell_quote: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInput {
    pub id: String,
    #[serde(rename = "type", default)]
    pub ty: Option<Json>,
    #[serde(default)]
    pub input_binding: Option<CommandLineBinding>,
    #[serde(default)]
    pub default: Option<CwlValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOutput {
    pub id: String,
    #[serde(rename = "type", default)]
    pub ty: Option<Json>,
    #[serde(default)]
    pub output_binding: Option<OutputBinding>,
}

impl ToolOutput {
    /// Whether the output captures the tool's stdout / stderr stream.
    pub fn is_stream(&self, stream: &str) -> bool {
        self.ty.as_ref().and_then(Json::as_str) == Some(stream)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutputBinding {
    pub glob: Option<String>,
    pub load_contents: Option<bool>,
    pub output_eval: Option<String>,
}

/// A CWL CommandLineTool as produced by the external parser.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommandLineTool {
    pub base_command: BaseCommand,
    pub arguments: Vec<Argument>,
    pub inputs: Vec<ToolInput>,
    pub outputs: Vec<ToolOutput>,
    pub requirements: Requirements,
    pub hints: Requirements,
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

impl CommandLineTool {
    /// Docker requirement from requirements or hints; the distinction
    /// matters for staging policy, where only `requirements` authorises
    /// absolute entrynames.
    pub fn docker_requirement(&self) -> Option<DockerRequirement> {
        self.requirements.docker().or_else(|| self.hints.docker())
    }

    pub fn output(&self, id: &str) -> Option<&ToolOutput> {
        self.outputs.iter().find(|o| o.id == id)
    }
}
