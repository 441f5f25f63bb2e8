//! The repository filter contract: visibility, archived/fork inclusion,
//! language, name regex, topics, and star range, applied as a conjunction.

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::RepoInfo;

/// Visibility filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Private,
    #[default]
    All,
}

/// Post-list repository filters. The empty filter passes everything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryFilters {
    /// Regex matched against the repository name.
    pub name_pattern: Option<String>,
    pub visibility: Visibility,
    pub include_archived: bool,
    pub include_forks: bool,
    /// Exact (case-insensitive) primary-language match.
    pub language: Option<String>,
    /// Repository must carry every listed topic.
    pub topics: Vec<String>,
    pub min_stars: Option<u64>,
    pub max_stars: Option<u64>,
}

impl Default for RepositoryFilters {
    fn default() -> Self {
        Self {
            name_pattern: None,
            visibility: Visibility::All,
            include_archived: true,
            include_forks: true,
            language: None,
            topics: Vec::new(),
            min_stars: None,
            max_stars: None,
        }
    }
}

/// Filter construction failures.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("invalid name pattern {pattern:?}: {source}")]
    BadPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("min_stars {min} exceeds max_stars {max}")]
    InvertedStarRange { min: u64, max: u64 },
}

impl RepositoryFilters {
    /// Compile the name regex once for a whole listing pass.
    pub fn compile(&self) -> Result<CompiledFilters, FilterError> {
        if let (Some(min), Some(max)) = (self.min_stars, self.max_stars) {
            if min > max {
                return Err(FilterError::InvertedStarRange { min, max });
            }
        }
        let name_regex = self
            .name_pattern
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| FilterError::BadPattern {
                    pattern: pattern.to_owned(),
                    source,
                })
            })
            .transpose()?;
        Ok(CompiledFilters {
            filters: self.clone(),
            name_regex,
        })
    }
}

/// A filter set with its regex compiled, ready to evaluate repositories.
#[derive(Debug, Clone)]
pub struct CompiledFilters {
    filters: RepositoryFilters,
    name_regex: Option<Regex>,
}

impl CompiledFilters {
    /// All conditions must hold.
    pub fn matches(&self, repo: &RepoInfo) -> bool {
        let f = &self.filters;

        match f.visibility {
            Visibility::Public if repo.private => return false,
            Visibility::Private if !repo.private => return false,
            _ => {}
        }
        if !f.include_archived && repo.archived {
            return false;
        }
        if !f.include_forks && repo.fork {
            return false;
        }
        if let Some(language) = &f.language {
            let matches_language = repo
                .language
                .as_deref()
                .is_some_and(|l| l.eq_ignore_ascii_case(language));
            if !matches_language {
                return false;
            }
        }
        if let Some(regex) = &self.name_regex {
            if !regex.is_match(&repo.name) {
                return false;
            }
        }
        if !f.topics.iter().all(|t| repo.topics.contains(t)) {
            return false;
        }
        if f.min_stars.is_some_and(|min| repo.stars < min) {
            return false;
        }
        if f.max_stars.is_some_and(|max| repo.stars > max) {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(name: &str) -> RepoInfo {
        RepoInfo {
            name: name.to_string(),
            clone_url: format!("https://github.com/acme/{name}.git"),
            ssh_url: format!("git@github.com:acme/{name}.git"),
            private: false,
            archived: false,
            fork: false,
            language: Some("Rust".to_string()),
            topics: vec!["cli".to_string(), "tooling".to_string()],
            stars: 120,
        }
    }

    #[test]
    fn empty_filter_passes_everything() {
        let compiled = RepositoryFilters::default().compile().unwrap();
        assert!(compiled.matches(&repo("anything")));

        let mut private_archived_fork = repo("odd");
        private_archived_fork.private = true;
        private_archived_fork.archived = true;
        private_archived_fork.fork = true;
        assert!(compiled.matches(&private_archived_fork));
    }

    #[test]
    fn visibility_filtering() {
        let mut filters = RepositoryFilters::default();
        filters.visibility = Visibility::Public;
        let compiled = filters.compile().unwrap();

        assert!(compiled.matches(&repo("open")));
        let mut secret = repo("secret");
        secret.private = true;
        assert!(!compiled.matches(&secret));

        let mut filters = RepositoryFilters::default();
        filters.visibility = Visibility::Private;
        let compiled = filters.compile().unwrap();
        assert!(!compiled.matches(&repo("open")));
        assert!(compiled.matches(&secret));
    }

    #[test]
    fn archived_and_fork_exclusion() {
        let filters = RepositoryFilters {
            include_archived: false,
            include_forks: false,
            ..Default::default()
        };
        let compiled = filters.compile().unwrap();

        assert!(compiled.matches(&repo("live")));

        let mut archived = repo("old");
        archived.archived = true;
        assert!(!compiled.matches(&archived));

        let mut fork = repo("copy");
        fork.fork = true;
        assert!(!compiled.matches(&fork));
    }

    #[test]
    fn language_is_case_insensitive_exact() {
        let filters = RepositoryFilters {
            language: Some("rust".to_string()),
            ..Default::default()
        };
        let compiled = filters.compile().unwrap();
        assert!(compiled.matches(&repo("r1")));

        let mut go_repo = repo("g1");
        go_repo.language = Some("Go".to_string());
        assert!(!compiled.matches(&go_repo));

        let mut no_language = repo("n1");
        no_language.language = None;
        assert!(!compiled.matches(&no_language));
    }

    #[test]
    fn name_regex_matching() {
        let filters = RepositoryFilters {
            name_pattern: Some("^api-".to_string()),
            ..Default::default()
        };
        let compiled = filters.compile().unwrap();
        assert!(compiled.matches(&repo("api-gateway")));
        assert!(!compiled.matches(&repo("web-frontend")));
    }

    #[test]
    fn invalid_regex_is_a_construction_error() {
        let filters = RepositoryFilters {
            name_pattern: Some("([unclosed".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            filters.compile(),
            Err(FilterError::BadPattern { .. })
        ));
    }

    #[test]
    fn topic_set_membership_requires_all() {
        let filters = RepositoryFilters {
            topics: vec!["cli".to_string()],
            ..Default::default()
        };
        assert!(filters.compile().unwrap().matches(&repo("r1")));

        let filters = RepositoryFilters {
            topics: vec!["cli".to_string(), "kubernetes".to_string()],
            ..Default::default()
        };
        assert!(!filters.compile().unwrap().matches(&repo("r1")));
    }

    #[test]
    fn star_range_is_inclusive() {
        let filters = RepositoryFilters {
            min_stars: Some(120),
            max_stars: Some(120),
            ..Default::default()
        };
        assert!(filters.compile().unwrap().matches(&repo("r1")));

        let filters = RepositoryFilters {
            min_stars: Some(121),
            ..Default::default()
        };
        assert!(!filters.compile().unwrap().matches(&repo("r1")));

        let filters = RepositoryFilters {
            max_stars: Some(119),
            ..Default::default()
        };
        assert!(!filters.compile().unwrap().matches(&repo("r1")));
    }

    #[test]
    fn inverted_star_range_is_rejected() {
        let filters = RepositoryFilters {
            min_stars: Some(100),
            max_stars: Some(10),
            ..Default::default()
        };
        assert!(matches!(
            filters.compile(),
            Err(FilterError::InvertedStarRange { min: 100, max: 10 })
        ));
    }

    #[test]
    fn conjunction_of_all_conditions() {
        let filters = RepositoryFilters {
            name_pattern: Some("^api".to_string()),
            visibility: Visibility::Public,
            include_archived: false,
            include_forks: false,
            language: Some("Rust".to_string()),
            topics: vec!["cli".to_string()],
            min_stars: Some(100),
            max_stars: Some(200),
        };
        let compiled = filters.compile().unwrap();

        assert!(compiled.matches(&repo("api-gateway")));

        // One failing condition is enough to reject.
        let mut too_few_stars = repo("api-gateway");
        too_few_stars.stars = 5;
        assert!(!compiled.matches(&too_few_stars));
    }
}
