//! # Placeholder Resolver
//!
//! The `${{ namespace.path }}` template language used to wire values between
//! pipeline inputs, run contexts, task outputs and random values. Resolution
//! is a single linear scan over the input string; every occurrence is
//! dispatched to the handler registered for its namespace.
//!
//! The same mechanism serves two callers: definition validation (handlers
//! that only check references exist) and job building (handlers that produce
//! concrete values).

use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

const OPEN: &str = "${{";
const CLOSE: &str = "}}";

/// Placeholder namespaces understood by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Contexts,
    Inputs,
    Outputs,
    Randoms,
}

impl Namespace {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "contexts" => Some(Self::Contexts),
            "inputs" => Some(Self::Inputs),
            "outputs" => Some(Self::Outputs),
            "randoms" => Some(Self::Randoms),
            _ => None,
        }
    }

    /// Number of path segments the namespace requires after its own name
    fn segment_count(&self) -> usize {
        match self {
            Self::Contexts | Self::Inputs => 1,
            Self::Outputs | Self::Randoms => 2,
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Contexts => write!(f, "contexts"),
            Self::Inputs => write!(f, "inputs"),
            Self::Outputs => write!(f, "outputs"),
            Self::Randoms => write!(f, "randoms"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlaceholderError {
    #[error("Unterminated placeholder starting at byte {position}")]
    Unterminated { position: usize },

    #[error("Malformed placeholder '{token}': {namespace} takes {expected} path segment(s), got {actual}")]
    Malformed {
        token: String,
        namespace: String,
        expected: usize,
        actual: usize,
    },

    #[error("Unresolvable placeholder '{token}': {message}")]
    Unresolvable { token: String, message: String },
}

impl PlaceholderError {
    pub fn unresolvable(token: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unresolvable {
            token: token.into(),
            message: message.into(),
        }
    }
}

/// One parsed `${{ ... }}` occurrence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occurrence {
    /// The full token, braces included, as written in the source string
    pub token: String,
    pub namespace: Namespace,
    /// Path segments after the namespace (1 for contexts/inputs, 2 for outputs/randoms)
    pub segments: Vec<String>,
}

/// Scan a string for placeholder occurrences, validating segment counts.
///
/// A token whose namespace is not one of the four known namespaces is not an
/// occurrence at all and is left for the caller to ignore; a known namespace
/// with the wrong number of segments is a hard error.
pub fn scan(input: &str) -> Result<Vec<Occurrence>, PlaceholderError> {
    let mut found = Vec::new();
    let mut rest = input;
    let mut offset = 0;

    while let Some(start) = rest.find(OPEN) {
        let after_open = start + OPEN.len();
        let Some(len) = rest[after_open..].find(CLOSE) else {
            return Err(PlaceholderError::Unterminated {
                position: offset + start,
            });
        };
        let inner = rest[after_open..after_open + len].trim();
        let token = rest[start..after_open + len + CLOSE.len()].to_string();

        let mut segments: Vec<&str> = inner.split('.').collect();
        let namespace = Namespace::parse(segments.remove(0));
        if let Some(namespace) = namespace {
            if segments.len() != namespace.segment_count() || segments.iter().any(|s| s.is_empty()) {
                return Err(PlaceholderError::Malformed {
                    token,
                    namespace: namespace.to_string(),
                    expected: namespace.segment_count(),
                    actual: segments.len(),
                });
            }
            found.push(Occurrence {
                token,
                namespace,
                segments: segments.into_iter().map(String::from).collect(),
            });
        }

        offset += after_open + len + CLOSE.len();
        rest = &input[offset..];
    }
    Ok(found)
}

type Handler<'a> = Box<dyn Fn(&Occurrence) -> Result<String, PlaceholderError> + Send + Sync + 'a>;

/// Placeholder resolver dispatching occurrences to per-namespace handlers.
///
/// Occurrences whose namespace has no registered handler are skipped and left
/// verbatim in the output.
#[derive(Default)]
pub struct Resolver<'a> {
    handlers: HashMap<Namespace, Handler<'a>>,
}

impl<'a> Resolver<'a> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for one namespace, replacing any previous one
    pub fn register<F>(mut self, namespace: Namespace, handler: F) -> Self
    where
        F: Fn(&Occurrence) -> Result<String, PlaceholderError> + Send + Sync + 'a,
    {
        self.handlers.insert(namespace, Box::new(handler));
        self
    }

    /// Substitute every resolvable occurrence in `input`
    pub fn resolve(&self, input: &str) -> Result<String, PlaceholderError> {
        let occurrences = scan(input)?;
        let mut output = input.to_string();
        for occurrence in &occurrences {
            let Some(handler) = self.handlers.get(&occurrence.namespace) else {
                continue;
            };
            let value = handler(occurrence)?;
            output = output.replace(&occurrence.token, &value);
        }
        Ok(output)
    }

    /// Resolve every value of a map, preserving keys
    pub fn resolve_map(
        &self,
        values: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>, PlaceholderError> {
        values
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.resolve(v)?)))
            .collect()
    }
}
