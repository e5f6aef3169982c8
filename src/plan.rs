//! Work item planning: which tags a run pushes and pulls, and for whom.

use crate::error::ConfigError;

/// Inputs that decide the tag list of a run.
#[derive(Debug, Clone, Default)]
pub struct TagPlan {
    /// Registry host the generated references point at.
    pub host: String,
    pub organization: String,
    /// Number of tags to generate.
    pub count: usize,
    /// Explicit comma-separated tag list; wins over everything else.
    pub explicit: Option<String>,
    pub skip_push: bool,
    /// Layer count of pre-seeded pull repositories.
    pub pull_layers: u32,
    /// Name prefix of pre-seeded pull repositories.
    pub pull_repo_prefix: Option<String>,
}

impl TagPlan {
    /// Repository that generated tags are pushed to.
    pub fn repository(&self) -> String {
        format!("repo_with_{}_tags", self.count)
    }

    /// Expands the plan into the work items of the run.
    ///
    /// 1. A non-empty explicit list is used as is.
    /// 2. With push skipped and a pull prefix and layer count set, tags of the
    ///    pre-seeded repositories: `<prefix>_layers_<layers>_tag_<i>`, `i` from 1.
    /// 3. Otherwise `<host>/<org>/repo_with_<count>_tags:<n>`, `n` from 0.
    pub fn items(&self) -> Vec<String> {
        let explicit = parse_list(self.explicit.as_deref().unwrap_or_default());
        if !explicit.is_empty() {
            return explicit;
        }

        let prefix = self
            .pull_repo_prefix
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty());
        if let (true, Some(prefix)) = (self.skip_push && self.pull_layers > 0, prefix) {
            return (1..=self.count)
                .map(|i| format!("{}_layers_{}_tag_{}", prefix, self.pull_layers, i))
                .collect();
        }

        let repository = self.repository();
        (0..self.count)
            .map(|n| format!("{}/{}/{}:{}", self.host, self.organization, repository, n))
            .collect()
    }
}

/// Splits a comma-separated list, dropping blanks.
pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Short prefix for generated names: the last four characters of the run id.
pub fn name_prefix(run_id: &str) -> String {
    let chars: Vec<char> = run_id.chars().collect();
    let start = chars.len().saturating_sub(4);
    chars[start..].iter().collect()
}

/// Usernames `<prefix>_user_<n>` for `n` in `0..count`.
pub fn generated_usernames(run_id: &str, count: usize) -> Vec<String> {
    let prefix = name_prefix(run_id);
    (0..count).map(|n| format!("{}_user_{}", prefix, n)).collect()
}

/// Usernames of the run's segments.
///
/// An explicit list wins; then `count` generated users; then the single
/// configured user.
pub fn plan_usernames(
    explicit: Option<&str>,
    count: Option<usize>,
    run_id: &str,
    default_user: Option<&str>,
) -> Result<Vec<String>, ConfigError> {
    let explicit = parse_list(explicit.unwrap_or_default());
    if !explicit.is_empty() {
        return Ok(explicit);
    }
    match count {
        Some(0) => Err(ConfigError::InvalidValue {
            key: "TEST_USER_COUNT",
            message: "must be at least 1".to_string(),
        }),
        Some(n) => Ok(generated_usernames(run_id, n)),
        None => default_user
            .filter(|u| !u.trim().is_empty())
            .map(|u| vec![u.trim().to_string()])
            .ok_or(ConfigError::Missing("QUAY_USERNAME")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> TagPlan {
        TagPlan {
            host: "quay.example.com".to_string(),
            organization: "perf".to_string(),
            count: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_generated_tags() {
        assert_eq!(
            plan().items(),
            vec![
                "quay.example.com/perf/repo_with_3_tags:0",
                "quay.example.com/perf/repo_with_3_tags:1",
                "quay.example.com/perf/repo_with_3_tags:2",
            ]
        );
    }

    #[test]
    fn test_explicit_tags_win() {
        let plan = TagPlan {
            explicit: Some(" a/b:1, ,a/b:2 ".to_string()),
            skip_push: true,
            pull_layers: 5,
            pull_repo_prefix: Some("seed".to_string()),
            ..plan()
        };
        assert_eq!(plan.items(), vec!["a/b:1", "a/b:2"]);
    }

    #[test]
    fn test_pre_seeded_pull_tags() {
        let plan = TagPlan {
            skip_push: true,
            pull_layers: 5,
            pull_repo_prefix: Some("seed".to_string()),
            ..plan()
        };
        assert_eq!(
            plan.items(),
            vec!["seed_layers_5_tag_1", "seed_layers_5_tag_2", "seed_layers_5_tag_3"]
        );
    }

    #[test]
    fn test_pre_seeded_needs_all_settings() {
        // Push not skipped: generated tags.
        let plan = TagPlan {
            pull_layers: 5,
            pull_repo_prefix: Some("seed".to_string()),
            ..plan()
        };
        assert!(plan.items()[0].starts_with("quay.example.com/"));

        // Blank prefix: generated tags.
        let plan = TagPlan {
            skip_push: true,
            pull_layers: 5,
            pull_repo_prefix: Some("  ".to_string()),
            ..plan
        };
        assert!(plan.items()[0].starts_with("quay.example.com/"));
    }

    #[test]
    fn test_zero_count() {
        let plan = TagPlan { count: 0, ..plan() };
        assert!(plan.items().is_empty());
    }

    #[test]
    fn test_usernames() {
        let run_id = "3f2a9c1e-0000-4000-8000-00000000ab12";
        assert_eq!(name_prefix(run_id), "ab12");
        assert_eq!(name_prefix("x"), "x");
        assert_eq!(
            generated_usernames(run_id, 2),
            vec!["ab12_user_0", "ab12_user_1"]
        );

        assert_eq!(
            plan_usernames(Some("u1,u2"), Some(5), run_id, Some("admin")).unwrap(),
            vec!["u1", "u2"]
        );
        assert_eq!(
            plan_usernames(None, Some(1), run_id, Some("admin")).unwrap(),
            vec!["ab12_user_0"]
        );
        assert_eq!(
            plan_usernames(None, None, run_id, Some("admin")).unwrap(),
            vec!["admin"]
        );
        assert!(plan_usernames(None, None, run_id, None).is_err());
        assert!(plan_usernames(None, Some(0), run_id, Some("admin")).is_err());
    }
}
