// ============================================================================
// File: qemu-runner/src/pipeline/spec.rs
// ----------------------------------------------------------------------------
// Concrete pipeline types for the QEMU engine
// ============================================================================

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::trait_def::{PipelineSecret, PipelineSpec, PipelineStep};

/// Pipeline spec: the instructions for one reproducible pipeline run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spec {
    /// Root path of the pipeline workspace
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub root: String,

    /// Pipeline settings
    #[serde(default)]
    pub settings: Settings,

    /// Files uploaded once, right after the machine comes online
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<File>,

    /// Steps in declaration order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
}

/// Pipeline settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Image name, resolved against the engine's image directory
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
}

/// A pipeline step: exactly one remote command invocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,

    /// Orchestrator decides what detaching means; carried through untouched
    #[serde(default)]
    pub detach: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Opaque error policy token
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub err_policy: String,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub environment: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<File>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Opaque run policy token
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub run_policy: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<Secret>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
}

/// A secret injected into a step's environment
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Environment variable that receives the secret
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub env: String,

    #[serde(default, with = "super::encoding", skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,

    /// Display concern for the orchestrator only
    #[serde(default)]
    pub mask: bool,
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("name", &self.name)
            .field("env", &self.env)
            .field("data", &"<redacted>")
            .field("mask", &self.mask)
            .finish()
    }
}

/// A file or directory to place inside the VM before a command runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,

    /// Permission bits; zero means "use the default"
    #[serde(default)]
    pub mode: u32,

    #[serde(default, with = "super::encoding", skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,

    #[serde(default)]
    pub is_dir: bool,
}

impl fmt::Display for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.path)
    }
}

/// Outcome of one step as reported to the orchestrator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepState {
    pub exit_code: i32,
    pub exited: bool,
}

impl StepState {
    /// A step that ran to completion with the given exit code
    pub fn exited(exit_code: i32) -> Self {
        Self {
            exit_code,
            exited: true,
        }
    }
}

impl PipelineSpec for Spec {
    type Step = Step;

    fn steps(&self) -> &[Step] {
        &self.steps
    }
}

impl PipelineStep for Step {
    type Secret = Secret;

    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> &[String] {
        &self.depends_on
    }

    fn environ(&self) -> &HashMap<String, String> {
        &self.environment
    }

    fn set_environ(&mut self, env: HashMap<String, String>) {
        self.environment = env;
    }

    fn err_policy(&self) -> &str {
        &self.err_policy
    }

    fn run_policy(&self) -> &str {
        &self.run_policy
    }

    fn secrets(&self) -> &[Secret] {
        &self.secrets
    }

    fn is_detached(&self) -> bool {
        self.detach
    }
}

impl PipelineSecret for Secret {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }

    fn is_masked(&self) -> bool {
        self.mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_from_json() {
        let spec: Spec = serde_json::from_str(
            r#"{
                "settings": {"image": "debian"},
                "files": [{"path": "/etc/netrc", "mode": 384, "data": "bWFjaGluZQ=="}],
                "steps": [{
                    "name": "build",
                    "command": "/bin/sh",
                    "args": ["-e", "/tmp/script.sh"],
                    "environment": {"CI": "true"},
                    "depends_on": ["clone"],
                    "secrets": [{"name": "token", "env": "TOKEN", "data": "czNjcjN0", "mask": true}],
                    "working_dir": "/drone/src"
                }]
            }"#,
        )
        .expect("valid spec json");

        assert_eq!(spec.settings.image, "debian");
        assert_eq!(spec.files[0].data, b"machine");
        assert_eq!(spec.files[0].mode, 0o600);
        assert_eq!(spec.step_len(), 1);

        let step = spec.step_at(0).expect("one step");
        assert_eq!(step.name(), "build");
        assert_eq!(step.dependencies(), ["clone".to_string()]);
        assert_eq!(step.secrets()[0].value(), "s3cr3t");
        assert!(step.secrets()[0].is_masked());
        assert!(!step.is_detached());
        assert!(spec.step_at(1).is_none());
    }

    #[test]
    fn secret_debug_hides_payload() {
        let secret = Secret {
            name: "token".to_string(),
            env: "TOKEN".to_string(),
            data: b"hunter2".to_vec(),
            mask: true,
        };
        let rendered = format!("{secret:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("TOKEN"));
    }

    #[test]
    fn set_environ_replaces_mapping() {
        let mut step = Step::default();
        step.set_environ(HashMap::from([("A".to_string(), "1".to_string())]));
        assert_eq!(step.environ().get("A").map(String::as_str), Some("1"));
    }

    #[test]
    fn file_payload_round_trips_as_base64() {
        let file = File {
            path: "/a".to_string(),
            data: vec![0, 159, 146, 150],
            ..File::default()
        };
        let json = serde_json::to_value(&file).expect("serialize");
        assert_eq!(json["data"], "AJ+Slg==");
    }
}
