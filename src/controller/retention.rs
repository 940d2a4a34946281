use crate::util::fs::FileInfo;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use std::time::Duration;

/// What a cleanup pass actually removed.
#[derive(Clone, Copy, Default, Debug)]
pub struct CleanupOutcome {
    pub files_removed: usize,
    pub bytes_freed: u64,
}

/// Age / count / total-size retention constraints shared by the recording
/// and snapshot sweeps. `None` disables the respective constraint.
#[derive(Clone, Copy, Default, Debug)]
pub struct RetentionPolicy {
    pub max_age: Option<Duration>,
    pub max_count: Option<usize>,
    pub max_size_bytes: Option<u64>,
}
impl RetentionPolicy {
    pub fn is_unbounded(&self) -> bool {
        self.max_age.is_none() && self.max_count.is_none() && self.max_size_bytes.is_none()
    }
}

/// Files to delete, oldest first, so that the remaining set satisfies all
/// three constraints. Pure planning, no filesystem access.
pub fn deletion_plan(
    files: &[FileInfo],
    now: DateTime<Utc>,
    policy: &RetentionPolicy,
) -> Vec<FileInfo> {
    if policy.is_unbounded() {
        return Vec::new();
    }

    let files = files
        .iter()
        .sorted_by_key(|file| file.modified)
        .collect::<Vec<_>>();

    let mut remaining_count = files.len();
    let mut remaining_size_bytes = files.iter().map(|file| file.size_bytes).sum::<u64>();

    let mut plan = Vec::new();
    for file in files {
        let too_old = match policy.max_age {
            Some(max_age) => {
                let age = (now - file.modified).to_std().unwrap_or(Duration::ZERO);
                age > max_age
            }
            None => false,
        };
        let too_many = match policy.max_count {
            Some(max_count) => remaining_count > max_count,
            None => false,
        };
        let too_large = match policy.max_size_bytes {
            Some(max_size_bytes) => remaining_size_bytes > max_size_bytes,
            None => false,
        };

        if !(too_old || too_many || too_large) {
            break;
        }

        remaining_count -= 1;
        remaining_size_bytes -= file.size_bytes;
        plan.push(file.clone());
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::{RetentionPolicy, deletion_plan};
    use crate::util::fs::FileInfo;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::{path::PathBuf, time::Duration};

    fn file_build(
        name: &str,
        age_secs: i64,
        size_bytes: u64,
    ) -> FileInfo {
        FileInfo {
            path: PathBuf::from(name),
            size_bytes,
            modified: Utc::now() - ChronoDuration::seconds(age_secs),
        }
    }

    #[test]
    fn unbounded_policy_plans_nothing() {
        let files = vec![file_build("a", 1000, 100), file_build("b", 10, 100)];
        let plan = deletion_plan(&files, Utc::now(), &RetentionPolicy::default());
        assert!(plan.is_empty());
    }

    #[test]
    fn age_constraint_removes_old_files_only() {
        let files = vec![
            file_build("old", 7200, 100),
            file_build("older", 9000, 100),
            file_build("fresh", 60, 100),
        ];

        let policy = RetentionPolicy {
            max_age: Some(Duration::from_secs(3600)),
            ..Default::default()
        };
        let plan = deletion_plan(&files, Utc::now(), &policy);

        let planned = plan
            .iter()
            .map(|file| file.path.to_str().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(planned, vec!["older", "old"]);
    }

    #[test]
    fn count_constraint_keeps_newest() {
        let files = vec![
            file_build("a", 300, 1),
            file_build("b", 200, 1),
            file_build("c", 100, 1),
        ];

        let policy = RetentionPolicy {
            max_count: Some(2),
            ..Default::default()
        };
        let plan = deletion_plan(&files, Utc::now(), &policy);

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].path.to_str().unwrap(), "a");
    }

    #[test]
    fn size_constraint_deletes_until_under_limit() {
        let files = vec![
            file_build("a", 400, 600),
            file_build("b", 300, 600),
            file_build("c", 200, 600),
        ];

        let policy = RetentionPolicy {
            max_size_bytes: Some(1000),
            ..Default::default()
        };
        let plan = deletion_plan(&files, Utc::now(), &policy);

        // removing the two oldest brings the total to 600 <= 1000
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].path.to_str().unwrap(), "a");
        assert_eq!(plan[1].path.to_str().unwrap(), "b");
    }

    #[test]
    fn all_constraints_combine() {
        let files = vec![
            file_build("a", 7200, 100),
            file_build("b", 60, 100),
            file_build("c", 30, 100),
        ];

        let policy = RetentionPolicy {
            max_age: Some(Duration::from_secs(3600)),
            max_count: Some(2),
            max_size_bytes: Some(250),
            ..Default::default()
        };
        let plan = deletion_plan(&files, Utc::now(), &policy);

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].path.to_str().unwrap(), "a");
    }
}
