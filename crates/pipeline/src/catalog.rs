//! Loads definitions from a Jenkins-style home directory.
//!
//! Layout: `<home>/jobs/<name>/config.xml`. The root element of each
//! `config.xml` decides what the node is:
//!
//! | Root element                                   | Node                      |
//! |------------------------------------------------|---------------------------|
//! | `flow-definition`                              | pipeline                  |
//! | `project`                                      | freestyle job             |
//! | `com.cloudbees.hudson.plugins.folder.Folder`   | folder, recurse into `jobs/` |
//!
//! Anything else is skipped. A node that cannot be read or parsed is logged
//! and skipped so one broken job does not hide the rest of the catalog.

use std::path::{Path, PathBuf};

use quick_xml::events::Event;
use quick_xml::Reader;
use tumbler_core::definition::{Definition, DefinitionKind};
use tumbler_core::error::CoreError;
use tumbler_core::path::JobPath;

/// Per-node configuration file name.
pub const CONFIG_FILE: &str = "config.xml";
/// Directory holding a home's (or folder's) child nodes.
pub const JOBS_DIR: &str = "jobs";

const PIPELINE_ROOT: &str = "flow-definition";
const JOB_ROOT: &str = "project";
const FOLDER_ROOT: &str = "com.cloudbees.hudson.plugins.folder.Folder";

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed XML in {}: {source}", path.display())]
    Xml {
        path: PathBuf,
        source: quick_xml::Error,
    },

    #[error("Invalid job name '{name}': {source}")]
    Path { name: String, source: CoreError },

    #[error("Catalog rejected by registry: {0}")]
    Registry(#[from] CoreError),

    #[error("Catalog load task failed: {0}")]
    Task(String),
}

/// What a single `config.xml` describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogNode {
    Definition {
        kind: DefinitionKind,
        description: Option<String>,
        script: String,
        disabled: bool,
    },
    Folder,
    /// Root element we do not know how to run.
    Unsupported(String),
}

/// Load every definition below `<home>/jobs`, in path order.
///
/// Fails only if the top-level jobs directory cannot be read.
pub fn load_dir(home: &Path) -> Result<Vec<Definition>, CatalogError> {
    let jobs_dir = home.join(JOBS_DIR);
    let mut definitions = Vec::new();
    walk(&jobs_dir, None, &mut definitions)?;
    definitions.sort_by(|a, b| a.path.cmp(&b.path));

    tracing::info!(
        home = %home.display(),
        definitions = definitions.len(),
        "Catalog loaded",
    );
    Ok(definitions)
}

fn walk(
    dir: &Path,
    parent: Option<&JobPath>,
    out: &mut Vec<Definition>,
) -> Result<(), CatalogError> {
    let entries = std::fs::read_dir(dir).map_err(|source| CatalogError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut children: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    children.sort();

    for child in children {
        let config = child.join(CONFIG_FILE);
        if !config.is_file() {
            tracing::debug!(dir = %child.display(), "No config.xml, skipping");
            continue;
        }

        let result = job_path(&child, parent).and_then(|path| {
            let node = read_node(&config)?;
            Ok((path, node))
        });

        match result {
            Ok((
                path,
                CatalogNode::Definition {
                    kind,
                    description,
                    script,
                    disabled,
                },
            )) => out.push(Definition {
                path,
                kind,
                description,
                script,
                disabled,
            }),
            Ok((path, CatalogNode::Folder)) => {
                let nested = child.join(JOBS_DIR);
                if nested.is_dir() {
                    if let Err(e) = walk(&nested, Some(&path), out) {
                        tracing::warn!(folder = %path, error = %e, "Skipping unreadable folder");
                    }
                }
            }
            Ok((path, CatalogNode::Unsupported(root))) => {
                tracing::warn!(%path, %root, "Skipping unsupported job type");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed catalog node");
            }
        }
    }
    Ok(())
}

fn job_path(dir: &Path, parent: Option<&JobPath>) -> Result<JobPath, CatalogError> {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let joined = match parent {
        Some(parent) => parent.join(&name),
        None => JobPath::parse(&name),
    };
    joined.map_err(|source| CatalogError::Path { name, source })
}

fn read_node(config: &Path) -> Result<CatalogNode, CatalogError> {
    let xml = std::fs::read_to_string(config).map_err(|source| CatalogError::Io {
        path: config.to_path_buf(),
        source,
    })?;
    parse_config(&xml).map_err(|source| CatalogError::Xml {
        path: config.to_path_buf(),
        source,
    })
}

/// Parse one `config.xml` document.
pub fn parse_config(xml: &str) -> Result<CatalogNode, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();

    let mut stack: Vec<String> = Vec::new();
    let mut root: Option<String> = None;
    let mut fields = Fields::default();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if root.is_none() {
                    root = Some(name.clone());
                }
                if name == "command" && matches!(stack.as_slice(), [.., b, _] if b == "builders") {
                    fields.commands.push(String::new());
                }
                stack.push(name);
            }
            Event::End(_) => {
                stack.pop();
            }
            Event::Empty(e) => {
                if root.is_none() {
                    root = Some(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                }
            }
            Event::Text(e) => {
                fields.push_text(&stack, &e.unescape()?);
            }
            Event::CData(e) => {
                fields.push_text(&stack, &String::from_utf8_lossy(&e.into_inner()));
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    let Fields {
        description,
        disabled,
        script,
        commands,
    } = fields;
    let root = root.unwrap_or_default();
    let description = Some(description.trim().to_string()).filter(|d| !d.is_empty());
    let disabled = disabled.trim().eq_ignore_ascii_case("true");

    let node = match root.as_str() {
        PIPELINE_ROOT => CatalogNode::Definition {
            kind: DefinitionKind::Pipeline,
            description,
            script: script.trim().to_string(),
            disabled,
        },
        JOB_ROOT => CatalogNode::Definition {
            kind: DefinitionKind::Job,
            description,
            script: commands
                .iter()
                .map(|c| c.trim())
                .filter(|c| !c.is_empty())
                .collect::<Vec<_>>()
                .join("\n"),
            disabled,
        },
        FOLDER_ROOT => CatalogNode::Folder,
        _ => CatalogNode::Unsupported(root),
    };
    Ok(node)
}

/// Text collected from the elements we care about.
#[derive(Default)]
struct Fields {
    description: String,
    disabled: String,
    script: String,
    commands: Vec<String>,
}

impl Fields {
    fn push_text(&mut self, stack: &[String], text: &str) {
        let path: Vec<&str> = stack.iter().map(String::as_str).collect();
        match path.as_slice() {
            [_, "description"] => self.description.push_str(text),
            [_, "disabled"] => self.disabled.push_str(text),
            [PIPELINE_ROOT, "definition", "script"] => self.script.push_str(text),
            [JOB_ROOT, "builders", _, "command"] => {
                if let Some(command) = self.commands.last_mut() {
                    command.push_str(text);
                }
            }
            _ => {}
        }
    }
}
