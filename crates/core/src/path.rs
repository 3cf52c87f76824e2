//! Hierarchical job/pipeline addressing.
//!
//! A [`JobPath`] is a slash-delimited identifier such as `team/build/deploy`.
//! Paths are normalized on parse (surrounding slashes stripped) so the same
//! definition is reachable as `/team/build/`, `team/build` or `/team/build`.
//! A final `*` segment turns the path into a wildcard pipeline pattern, which
//! is only meaningful as a registration key in the path registry.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Separator between path segments.
pub const PATH_SEPARATOR: char = '/';

/// Final segment marking a wildcard pipeline pattern.
pub const WILDCARD_SEGMENT: &str = "*";

/// Maximum number of segments in a path.
pub const MAX_SEGMENTS: usize = 32;

/// Maximum length of a single segment in characters.
pub const MAX_SEGMENT_LENGTH: usize = 128;

/// Pattern every non-wildcard segment must match.
pub const SEGMENT_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9._-]*$";

static SEGMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(SEGMENT_PATTERN).expect("valid regex"));

// ---------------------------------------------------------------------------
// JobPath
// ---------------------------------------------------------------------------

/// Validated, normalized job or pipeline path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobPath(String);

impl JobPath {
    /// Parse and normalize a raw path.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let trimmed = raw.trim().trim_matches(PATH_SEPARATOR);
        if trimmed.is_empty() {
            return Err(CoreError::Validation("Job path must not be empty".into()));
        }

        let segments: Vec<&str> = trimmed.split(PATH_SEPARATOR).collect();
        if segments.len() > MAX_SEGMENTS {
            return Err(CoreError::Validation(format!(
                "Job path exceeds maximum depth of {MAX_SEGMENTS} segments (got {})",
                segments.len()
            )));
        }

        let last = segments.len() - 1;
        for (idx, segment) in segments.iter().enumerate() {
            if *segment == WILDCARD_SEGMENT {
                if idx != last {
                    return Err(CoreError::Validation(format!(
                        "Wildcard is only allowed as the final segment: '{trimmed}'"
                    )));
                }
                if idx == 0 {
                    return Err(CoreError::Validation(
                        "A bare wildcard is not a valid job path".into(),
                    ));
                }
                continue;
            }
            validate_segment(segment)?;
        }

        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterate over the path segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(PATH_SEPARATOR)
    }

    /// Number of segments.
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// Last segment (the job or pipeline name).
    pub fn name(&self) -> &str {
        self.0
            .rsplit_once(PATH_SEPARATOR)
            .map_or(self.0.as_str(), |(_, name)| name)
    }

    /// Whether the path is a `prefix/*` registration pattern.
    pub fn is_wildcard(&self) -> bool {
        self.name() == WILDCARD_SEGMENT
    }

    /// The enclosing folder, or `None` for a top-level path.
    pub fn parent(&self) -> Option<JobPath> {
        self.0
            .rsplit_once(PATH_SEPARATOR)
            .map(|(parent, _)| Self(parent.to_string()))
    }

    /// Append a child segment.
    pub fn join(&self, segment: &str) -> Result<JobPath, CoreError> {
        Self::parse(&format!("{}{PATH_SEPARATOR}{segment}", self.0))
    }

    /// The `self/*` wildcard pattern rooted at this path.
    pub fn wildcard(&self) -> JobPath {
        Self(format!("{}{PATH_SEPARATOR}{WILDCARD_SEGMENT}", self.0))
    }

    /// Whether `self` lies strictly below `ancestor`.
    pub fn is_descendant_of(&self, ancestor: &JobPath) -> bool {
        self.0.len() > ancestor.0.len()
            && self.0.starts_with(ancestor.as_str())
            && self.0[ancestor.0.len()..].starts_with(PATH_SEPARATOR)
    }

    /// Proper ancestors from the nearest to the root.
    pub fn ancestors(&self) -> impl Iterator<Item = JobPath> + '_ {
        std::iter::successors(self.parent(), JobPath::parent)
    }
}

fn validate_segment(segment: &str) -> Result<(), CoreError> {
    if segment.is_empty() {
        return Err(CoreError::Validation(
            "Job path must not contain empty segments".into(),
        ));
    }
    if segment.len() > MAX_SEGMENT_LENGTH {
        return Err(CoreError::Validation(format!(
            "Path segment exceeds maximum length of {MAX_SEGMENT_LENGTH} characters (got {})",
            segment.len()
        )));
    }
    if !SEGMENT_RE.is_match(segment) {
        return Err(CoreError::Validation(format!(
            "Invalid path segment '{segment}'"
        )));
    }
    Ok(())
}

impl fmt::Display for JobPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobPath {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for JobPath {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<JobPath> for String {
    fn from(value: JobPath) -> Self {
        value.0
    }
}
