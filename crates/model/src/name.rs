use std::fmt;

use crate::Tags;

/// Shared representation of dotted paths, as used by group and metric
/// names.
type Path = Vec<String>;

fn fmt_path(f: &mut fmt::Formatter<'_>, path: &[String]) -> fmt::Result {
    for (i, seg) in path.iter().enumerate() {
        if i != 0 {
            write!(f, ".")?;
        }
        write!(f, "{seg}")?;
    }
    Ok(())
}

/// The path of a group, without its tags.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SimpleGroup(Path);

impl SimpleGroup {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SimpleGroup(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for SimpleGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_path(f, &self.0)
    }
}

/// The name of a metric within a group.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct MetricName(Path);

impl MetricName {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MetricName(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_path(f, &self.0)
    }
}

/// A fully qualified group: its path plus its tag set.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct GroupName {
    path: SimpleGroup,
    tags: Tags,
}

impl GroupName {
    pub fn new(path: SimpleGroup, tags: Tags) -> Self {
        GroupName { path, tags }
    }

    pub fn untagged(path: SimpleGroup) -> Self {
        GroupName {
            path,
            tags: Tags::default(),
        }
    }

    pub fn path(&self) -> &SimpleGroup {
        &self.path
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }
}

impl fmt::Display for GroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.path, self.tags)
    }
}
