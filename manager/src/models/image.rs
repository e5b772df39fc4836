//! Container image references

use std::fmt;

/// `repository[:tag]`, where the repository may carry a registry host and port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub repository: String,
    pub tag: Option<String>,
}

impl ImageRef {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        let last_slash = raw.rfind('/').map(|i| i + 1).unwrap_or(0);
        match raw[last_slash..].rfind(':') {
            Some(colon) => {
                let colon = last_slash + colon;
                Self {
                    repository: raw[..colon].to_string(),
                    tag: Some(raw[colon + 1..].to_string()).filter(|t| !t.is_empty()),
                }
            }
            None => Self {
                repository: raw.to_string(),
                tag: None,
            },
        }
    }

    /// The tag when it is a dotted numeric version such as `2.328.0`
    pub fn version(&self) -> Option<&str> {
        self.tag.as_deref().filter(|t| is_numeric_version(t))
    }

    /// Version used in derived image tags, `latest` when not numeric
    pub fn runner_version(&self) -> &str {
        self.version().unwrap_or("latest")
    }

    pub fn with_tag(&self, tag: &str) -> ImageRef {
        ImageRef {
            repository: self.repository.clone(),
            tag: Some(tag.to_string()),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tag {
            Some(tag) => write!(f, "{}:{}", self.repository, tag),
            None => f.write_str(&self.repository),
        }
    }
}

pub fn is_numeric_version(raw: &str) -> bool {
    raw.starts_with(|c: char| c.is_ascii_digit())
        && raw.chars().all(|c| c.is_ascii_digit() || c == '.')
}
