//! User segments and their platform-safe identifiers.
//!
//! A user segment is the identity under which one slice of the push/pull
//! work runs. Its registry username may contain characters that are not
//! allowed in Kubernetes object names or that read badly in queue keys, so
//! every segment carries a validated slug derived from the username.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Longest slug accepted. `test-registry-push-` plus the slug must fit in a
/// 63 character DNS-1123 label.
pub const MAX_SLUG_LEN: usize = 44;

/// A logical owner of one push queue and one pull queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserSegment {
    username: String,
    slug: String,
}

impl UserSegment {
    /// Creates a segment for `username`, deriving and validating its slug.
    ///
    /// The slug is the username lowercased, with every character outside
    /// `[a-z0-9-]` replaced by `-` and leading/trailing hyphens removed.
    pub fn new(username: impl Into<String>) -> Result<Self, ConfigError> {
        let username = username.into();
        let slug = slugify(&username);

        if slug.is_empty() {
            return Err(ConfigError::InvalidSegment {
                name: username,
                reason: "no alphanumeric characters".to_string(),
            });
        }
        if slug.len() > MAX_SLUG_LEN {
            return Err(ConfigError::InvalidSegment {
                name: username,
                reason: format!("slug '{}' exceeds {} characters", slug, MAX_SLUG_LEN),
            });
        }

        Ok(Self { username, slug })
    }

    /// The registry username, used for credentials.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The platform-safe identifier used in queue keys and job names.
    pub fn slug(&self) -> &str {
        &self.slug
    }
}

impl fmt::Display for UserSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.slug)
    }
}

fn slugify(name: &str) -> String {
    let mapped: String = name
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '-'
            }
        })
        .collect();

    mapped.trim_matches('-').to_string()
}

/// Builds segments from usernames and rejects slug collisions.
///
/// Two usernames such as `a_b` and `a-b` map to the same slug and would
/// share queues and job names.
pub fn segments_from_usernames<I, S>(usernames: I) -> Result<Vec<UserSegment>, ConfigError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut segments: Vec<UserSegment> = Vec::new();
    for name in usernames {
        let segment = UserSegment::new(name)?;
        if let Some(existing) = segments.iter().find(|s| s.slug == segment.slug) {
            return Err(ConfigError::InvalidSegment {
                name: segment.username,
                reason: format!(
                    "slug '{}' collides with user '{}'",
                    existing.slug, existing.username
                ),
            });
        }
        segments.push(segment);
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug_replaces_underscores() {
        let segment = UserSegment::new("a1b2_user_0").unwrap();
        assert_eq!(segment.slug(), "a1b2-user-0");
        assert_eq!(segment.username(), "a1b2_user_0");
    }

    #[test]
    fn test_slug_lowercases_and_trims() {
        let segment = UserSegment::new("__Perf.User__").unwrap();
        assert_eq!(segment.slug(), "perf-user");
    }

    #[test]
    fn test_empty_slug_rejected() {
        let err = UserSegment::new("___").unwrap_err();
        assert!(err.to_string().contains("no alphanumeric"));
    }

    #[test]
    fn test_long_slug_rejected() {
        let name = "u".repeat(MAX_SLUG_LEN + 1);
        assert!(UserSegment::new(name).is_err());

        let name = "u".repeat(MAX_SLUG_LEN);
        assert!(UserSegment::new(name).is_ok());
    }

    #[test]
    fn test_job_name_fits_label_limit() {
        let segment = UserSegment::new("x".repeat(MAX_SLUG_LEN)).unwrap();
        let name = format!("test-registry-push-{}", segment.slug());
        assert!(name.len() <= 63);
    }

    #[test]
    fn test_colliding_slugs_rejected() {
        let err = segments_from_usernames(["perf_user", "perf-user"]).unwrap_err();
        assert!(err.to_string().contains("collides"));

        let ok = segments_from_usernames(["perf_user_0", "perf_user_1"]).unwrap();
        assert_eq!(ok.len(), 2);
    }
}
