//! Structural task references.
//!
//! A task instance addresses its definition with a JSON-pointer-like path:
//! root tasks are `/do/{index}/{name}` and each nesting level appends the
//! container's body prefix (`/do`, `/composite/do` or `/for/do`) followed by
//! `/{index}/{name}`, e.g. `/do/1/review/composite/do/0/approve`.

use std::fmt;

use synapse_types::workflow::{TaskDefinition, TaskKind, TaskMap, WorkflowDefinition};

use super::definition::DefinitionError;

/// Container kinds that own a task body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerKind {
    Do,
    Composite,
    For,
}

impl ContainerKind {
    /// The container kind of a task, if it owns a body.
    pub fn of(kind: &TaskKind) -> Option<Self> {
        match kind {
            TaskKind::Do(_) => Some(ContainerKind::Do),
            TaskKind::Composite(_) => Some(ContainerKind::Composite),
            TaskKind::For(_) => Some(ContainerKind::For),
            _ => None,
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            ContainerKind::Do => "/do",
            ContainerKind::Composite => "/composite/do",
            ContainerKind::For => "/for/do",
        }
    }
}

/// One `{body}/{index}/{name}` step of a pointer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PointerStep {
    pub via: ContainerKind,
    pub index: usize,
    pub name: String,
}

/// Parsed task reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskPointer {
    steps: Vec<PointerStep>,
}

/// A pointer resolved against a definition.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedTask<'a> {
    pub name: &'a str,
    pub index: usize,
    pub definition: &'a TaskDefinition,
    /// The task map that owns the task.
    pub container: &'a TaskMap,
}

impl TaskPointer {
    /// Pointer to a top-level task.
    pub fn root(index: usize, name: impl Into<String>) -> Self {
        Self {
            steps: vec![PointerStep {
                via: ContainerKind::Do,
                index,
                name: name.into(),
            }],
        }
    }

    /// Pointer to a task inside this task's body.
    pub fn child(&self, via: ContainerKind, index: usize, name: impl Into<String>) -> Self {
        let mut steps = self.steps.clone();
        steps.push(PointerStep {
            via,
            index,
            name: name.into(),
        });
        Self { steps }
    }

    /// Pointer to the owning container task, `None` for top-level tasks.
    pub fn parent(&self) -> Option<Self> {
        if self.steps.len() <= 1 {
            return None;
        }
        Some(Self {
            steps: self.steps[..self.steps.len() - 1].to_vec(),
        })
    }

    pub fn depth(&self) -> usize {
        self.steps.len()
    }

    pub fn name(&self) -> &str {
        self.last().name.as_str()
    }

    pub fn index(&self) -> usize {
        self.last().index
    }

    fn last(&self) -> &PointerStep {
        // `parse` and the constructors never build an empty pointer.
        &self.steps[self.steps.len() - 1]
    }

    /// Parse a reference string.
    pub fn parse(reference: &str) -> Result<Self, DefinitionError> {
        let invalid = || DefinitionError::UnresolvedReference(reference.to_string());
        let rest = reference.strip_prefix('/').ok_or_else(invalid)?;
        let mut tokens = rest.split('/');
        let mut steps = Vec::new();

        while let Some(token) = tokens.next() {
            let via = match token {
                "do" => ContainerKind::Do,
                "composite" | "for" => {
                    if tokens.next() != Some("do") {
                        return Err(invalid());
                    }
                    if token == "composite" {
                        ContainerKind::Composite
                    } else {
                        ContainerKind::For
                    }
                }
                _ => return Err(invalid()),
            };
            if steps.is_empty() && via != ContainerKind::Do {
                return Err(invalid());
            }
            let index = tokens
                .next()
                .and_then(|t| t.parse::<usize>().ok())
                .ok_or_else(invalid)?;
            let name = tokens.next().filter(|n| !n.is_empty()).ok_or_else(invalid)?;
            steps.push(PointerStep {
                via,
                index,
                name: name.to_string(),
            });
        }

        if steps.is_empty() {
            return Err(invalid());
        }
        Ok(Self { steps })
    }

    /// Walk the definition down to the addressed task.
    pub fn resolve<'a>(&self, def: &'a WorkflowDefinition) -> Result<ResolvedTask<'a>, DefinitionError> {
        let unresolved = || DefinitionError::UnresolvedReference(self.to_string());
        let mut container = &def.tasks;
        let mut resolved: Option<ResolvedTask<'a>> = None;

        for step in &self.steps {
            if let Some(owner) = resolved {
                if ContainerKind::of(&owner.definition.kind) != Some(step.via) {
                    return Err(unresolved());
                }
                container = owner.definition.kind.body().ok_or_else(unresolved)?;
            }
            let (name, definition) = container.get_index(step.index).ok_or_else(unresolved)?;
            if name != step.name {
                return Err(unresolved());
            }
            resolved = Some(ResolvedTask {
                name,
                index: step.index,
                definition,
                container,
            });
        }

        resolved.ok_or_else(unresolved)
    }
}

impl fmt::Display for TaskPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for step in &self.steps {
            write!(f, "{}/{}/{}", step.via.prefix(), step.index, step.name)?;
        }
        Ok(())
    }
}
