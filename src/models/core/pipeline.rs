//! # Pipeline Definition Model
//!
//! Named, versioned workflow specs. The definition content is authored as
//! YAML, validated at apply time (graph shape, placeholder references, type
//! back-propagation) and snapshotted into a run's `RunExtra` when a flow
//! starts.
//!
//! Exactly one version per name carries the `latest` flag; content is
//! immutable per version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::dag::{Dag, ROOT};
use crate::error::{EngineError, Result};
use crate::placeholder::{self, Namespace};

/// Value types a pipeline input/output/context can declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    #[default]
    String,
    Number,
    Bool,
    /// Staged through object storage with fetch/push commands
    File,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => write!(f, "string"),
            Self::Number => write!(f, "number"),
            Self::Bool => write!(f, "bool"),
            Self::File => write!(f, "file"),
        }
    }
}

/// A declared input, output or context value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueDef {
    pub name: String,
    #[serde(default)]
    pub kind: ValueKind,
    /// Literal or placeholder expression; None for values filled at run time
    #[serde(default)]
    pub value: Option<String>,
}

impl ValueDef {
    pub fn new(name: impl Into<String>, kind: ValueKind, value: Option<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            value,
        }
    }
}

/// Executor families a task can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    Container,
    Cluster,
    RemoteShell,
    /// Recursive: the task instantiates another pipeline as a nested DAG
    Pipeline,
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Container => write!(f, "container"),
            Self::Cluster => write!(f, "cluster"),
            Self::RemoteShell => write!(f, "remote_shell"),
            Self::Pipeline => write!(f, "pipeline"),
        }
    }
}

/// One task node of a pipeline definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDef {
    pub alias: String,
    #[serde(default)]
    pub needs: Vec<String>,
    pub executor: ExecutorKind,
    /// Container image, cluster job template, or `name:version` pipeline reference
    pub image: String,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<ValueDef>,
    #[serde(default)]
    pub outputs: Vec<ValueDef>,
    #[serde(default)]
    pub contexts: Vec<ValueDef>,
    /// Actuator selector tags; take precedence over pipeline tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Per-task timeout; engine default applies when absent
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// Versioned content of a pipeline definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PipelineContent {
    #[serde(default)]
    pub inputs: Vec<ValueDef>,
    #[serde(default)]
    pub outputs: Vec<ValueDef>,
    #[serde(default)]
    pub contexts: Vec<ValueDef>,
    /// Pipeline-level actuator selector tags
    #[serde(default)]
    pub tags: Vec<String>,
    pub tasks: Vec<TaskDef>,
}

impl PipelineContent {
    pub fn from_yaml(source: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(source)?)
    }

    pub fn task(&self, alias: &str) -> Option<&TaskDef> {
        self.tasks.iter().find(|task| task.alias == alias)
    }

    /// Build the dependency graph declared by the tasks
    pub fn build_dag(&self) -> Result<Dag> {
        let mut dag = Dag::new();
        for task in &self.tasks {
            dag.add_node(task.alias.clone())?;
        }
        for task in &self.tasks {
            dag.add_edge(&task.alias, task.needs.clone())?;
        }
        Ok(dag)
    }
}

/// Lookup used during validation to resolve sub-pipeline references
pub trait DefinitionLookup {
    /// Declared outputs of the referenced pipeline, if it exists
    fn pipeline_outputs(&self, image: &str) -> Option<Vec<ValueDef>>;
}

impl DefinitionLookup for HashMap<String, Vec<ValueDef>> {
    fn pipeline_outputs(&self, image: &str) -> Option<Vec<ValueDef>> {
        self.get(image).cloned()
    }
}

/// A named, versioned workflow spec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    pub version: String,
    pub namespace: String,
    pub latest: bool,
    pub content: PipelineContent,
    pub created_at: DateTime<Utc>,
}

impl PipelineDefinition {
    /// Validate the definition at apply time.
    ///
    /// Checks the graph shape, statically resolves every placeholder for
    /// segment-count correctness and referential existence, and
    /// back-propagates declared output types onto sub-pipeline tasks from the
    /// referenced pipeline's outputs. Returns the content with propagated
    /// types on success.
    pub fn validate(&self, lookup: &dyn DefinitionLookup) -> Result<PipelineContent> {
        let dag = self.content.build_dag()?;
        dag.check()?;

        let declared_inputs: HashSet<&str> = self
            .content
            .inputs
            .iter()
            .map(|v| v.name.as_str())
            .collect();
        let aliases: HashSet<&str> = self
            .content
            .tasks
            .iter()
            .map(|t| t.alias.as_str())
            .collect();

        let mut content = self.content.clone();
        for task in &mut content.tasks {
            if task.alias == ROOT {
                return Err(EngineError::validation(format!(
                    "task alias '{ROOT}' is reserved for the synthetic root"
                )));
            }

            let mut expressions: Vec<&Option<String>> = Vec::new();
            expressions.extend(task.inputs.iter().map(|v| &v.value));
            expressions.extend(task.contexts.iter().map(|v| &v.value));
            for command in &task.commands {
                Self::check_references(command, &declared_inputs, &aliases)?;
            }
            for value in expressions.into_iter().flatten() {
                Self::check_references(value, &declared_inputs, &aliases)?;
            }

            if task.executor == ExecutorKind::Pipeline {
                let Some(declared) = lookup.pipeline_outputs(&task.image) else {
                    return Err(EngineError::validation(format!(
                        "task {} references unknown pipeline '{}'",
                        task.alias, task.image
                    )));
                };
                // Type back-propagation: a sub-pipeline task's outputs carry
                // the kinds declared by the referenced pipeline.
                for output in &mut task.outputs {
                    let Some(source) = declared.iter().find(|d| d.name == output.name) else {
                        return Err(EngineError::validation(format!(
                            "task {} output '{}' does not exist on pipeline '{}'",
                            task.alias, output.name, task.image
                        )));
                    };
                    output.kind = source.kind;
                }
            }
        }

        for output in &content.outputs {
            if let Some(value) = &output.value {
                Self::check_references(value, &declared_inputs, &aliases)?;
            }
        }
        Ok(content)
    }

    fn check_references(
        expression: &str,
        declared_inputs: &HashSet<&str>,
        aliases: &HashSet<&str>,
    ) -> Result<()> {
        for occurrence in placeholder::scan(expression)? {
            match occurrence.namespace {
                Namespace::Inputs => {
                    let name = occurrence.segments[0].as_str();
                    if !declared_inputs.contains(name) {
                        return Err(EngineError::validation(format!(
                            "placeholder '{}' references undeclared input '{name}'",
                            occurrence.token
                        )));
                    }
                }
                Namespace::Outputs => {
                    let alias = occurrence.segments[0].as_str();
                    if !aliases.contains(alias) {
                        return Err(EngineError::validation(format!(
                            "placeholder '{}' references unknown task '{alias}'",
                            occurrence.token
                        )));
                    }
                }
                // Context names are populated dynamically by tasks; randoms
                // are minted at run time. Neither can be checked statically.
                Namespace::Contexts | Namespace::Randoms => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(alias: &str, needs: &[&str]) -> TaskDef {
        TaskDef {
            alias: alias.to_string(),
            needs: needs.iter().map(|s| s.to_string()).collect(),
            executor: ExecutorKind::Container,
            image: "busybox:latest".to_string(),
            commands: vec!["echo hello".to_string()],
            inputs: Vec::new(),
            outputs: Vec::new(),
            contexts: Vec::new(),
            tags: Vec::new(),
            timeout_seconds: None,
        }
    }

    fn empty_lookup() -> HashMap<String, Vec<ValueDef>> {
        HashMap::new()
    }

    fn definition(content: PipelineContent) -> PipelineDefinition {
        PipelineDefinition {
            name: "demo".to_string(),
            version: "v1".to_string(),
            namespace: "default".to_string(),
            latest: true,
            content,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn valid_definition_passes() {
        let def = definition(PipelineContent {
            inputs: vec![ValueDef::new("region", ValueKind::String, Some("eu".into()))],
            tasks: vec![task("build", &[ROOT]), task("test", &["build"])],
            ..Default::default()
        });
        assert!(def.validate(&empty_lookup()).is_ok());
    }

    #[test]
    fn undeclared_input_reference_is_rejected() {
        let mut bad = task("build", &[ROOT]);
        bad.commands = vec!["echo ${{ inputs.missing }}".to_string()];
        let def = definition(PipelineContent {
            tasks: vec![bad],
            ..Default::default()
        });
        let err = def.validate(&empty_lookup()).unwrap_err();
        assert!(err.to_string().contains("undeclared input"));
    }

    #[test]
    fn unknown_output_task_reference_is_rejected() {
        let mut bad = task("build", &[ROOT]);
        bad.inputs = vec![ValueDef::new(
            "dep",
            ValueKind::String,
            Some("${{ outputs.ghost.result }}".to_string()),
        )];
        let def = definition(PipelineContent {
            tasks: vec![bad],
            ..Default::default()
        });
        let err = def.validate(&empty_lookup()).unwrap_err();
        assert!(err.to_string().contains("unknown task"));
    }

    #[test]
    fn sub_pipeline_output_types_back_propagate() {
        let mut sub = task("deploy", &[ROOT]);
        sub.executor = ExecutorKind::Pipeline;
        sub.image = "release:v2".to_string();
        sub.outputs = vec![ValueDef::new("bundle", ValueKind::String, None)];

        let lookup = HashMap::from([(
            "release:v2".to_string(),
            vec![ValueDef::new("bundle", ValueKind::File, None)],
        )]);
        let def = definition(PipelineContent {
            tasks: vec![sub],
            ..Default::default()
        });
        let content = def.validate(&lookup).unwrap();
        assert_eq!(content.tasks[0].outputs[0].kind, ValueKind::File);
    }

    #[test]
    fn sub_pipeline_with_unknown_reference_is_rejected() {
        let mut sub = task("deploy", &[ROOT]);
        sub.executor = ExecutorKind::Pipeline;
        sub.image = "ghost:v0".to_string();
        let def = definition(PipelineContent {
            tasks: vec![sub],
            ..Default::default()
        });
        assert!(def.validate(&empty_lookup()).is_err());
    }

    #[test]
    fn yaml_content_round_trips() {
        let yaml = r#"
inputs:
  - name: region
    value: eu-west-1
tasks:
  - alias: build
    needs: [root]
    executor: container
    image: "builder:1"
    commands:
      - make all
"#;
        let content = PipelineContent::from_yaml(yaml).unwrap();
        assert_eq!(content.tasks.len(), 1);
        assert_eq!(content.tasks[0].alias, "build");
        assert_eq!(content.inputs[0].kind, ValueKind::String);
    }
}
