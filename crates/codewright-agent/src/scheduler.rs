//! Conflict-aware scheduling: partitions a batch of tool calls into
//! ordered groups whose members are safe to run concurrently.
//!
//! Greedy first-fit over the pairwise conflict relation: correct (no
//! group ever contains a conflicting pair), deterministic, O(n²), and
//! intentionally not minimal in group count.

use codewright_core::Tool;

/// The scheduling-relevant facts about one call, derived from the tool's
/// capability methods. A tool that overrides nothing profiles as
/// `parallel_safe: false`, which never shares a group with anything.
#[derive(Debug, Clone, PartialEq)]
pub struct CallProfile {
    pub parallel_safe: bool,
    pub write: bool,
    pub path: Option<String>,
}

impl CallProfile {
    pub fn for_tool(tool: &dyn Tool, args: &serde_json::Value) -> Self {
        Self {
            parallel_safe: tool.is_parallel_safe(),
            write: tool.is_write_operation(),
            path: tool.file_path(args),
        }
    }
}

/// Whether two calls have a data hazard and must not share a group.
fn conflicts(a: &CallProfile, b: &CallProfile) -> bool {
    // Same file with a write on either side is a hazard; two
    // parallel-safe reads of one file are not.
    if let (Some(pa), Some(pb)) = (&a.path, &b.path)
        && pa == pb
        && (a.write || b.write)
    {
        return true;
    }
    if !a.parallel_safe && !b.parallel_safe {
        return true;
    }
    if (a.write && !b.parallel_safe) || (b.write && !a.parallel_safe) {
        return true;
    }
    false
}

/// Partition call indices into ordered groups. Groups execute strictly
/// in order; members of one group may run concurrently. Each call lands
/// in the first existing group containing no conflicting member, so
/// serialized writes to a file keep their submission order.
pub fn group_by_conflicts(profiles: &[CallProfile]) -> Vec<Vec<usize>> {
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for index in 0..profiles.len() {
        let placed = groups.iter_mut().find(|group| {
            group
                .iter()
                .all(|&member| !conflicts(&profiles[index], &profiles[member]))
        });
        match placed {
            Some(group) => group.push(index),
            None => groups.push(vec![index]),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn read(path: &str) -> CallProfile {
        CallProfile {
            parallel_safe: true,
            write: false,
            path: Some(path.to_string()),
        }
    }

    fn write(path: &str) -> CallProfile {
        CallProfile {
            parallel_safe: false,
            write: true,
            path: Some(path.to_string()),
        }
    }

    fn unknown() -> CallProfile {
        CallProfile {
            parallel_safe: false,
            write: false,
            path: None,
        }
    }

    fn group_of(groups: &[Vec<usize>], index: usize) -> usize {
        groups
            .iter()
            .position(|g| g.contains(&index))
            .expect("every index is grouped")
    }

    #[test]
    fn read_write_read_resolves_to_two_groups() {
        // [read(fileA), write(fileA), read(fileB)]
        let profiles = vec![read("fileA"), write("fileA"), read("fileB")];
        let groups = group_by_conflicts(&profiles);

        assert_eq!(groups.len(), 2);
        // write(fileA) never shares a group with read(fileA)
        assert_ne!(group_of(&groups, 0), group_of(&groups, 1));
        // the two reads share a group
        assert_eq!(group_of(&groups, 0), group_of(&groups, 2));
        // reads come first: the first call defines the earliest group
        assert_eq!(groups[0], vec![0, 2]);
        assert_eq!(groups[1], vec![1]);
    }

    #[test]
    fn parallel_safe_reads_share_even_on_the_same_file() {
        let profiles = vec![read("a.rs"), read("a.rs"), read("a.rs")];
        let groups = group_by_conflicts(&profiles);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0], vec![0, 1, 2]);
    }

    #[test]
    fn writes_to_the_same_file_serialize_in_submission_order() {
        let profiles = vec![write("a.rs"), write("a.rs"), write("a.rs")];
        let groups = group_by_conflicts(&profiles);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups, vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn writes_to_distinct_files_still_serialize_when_not_parallel_safe() {
        // Neither write is parallel-safe, so they conflict regardless of path.
        let profiles = vec![write("a.rs"), write("b.rs")];
        let groups = group_by_conflicts(&profiles);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn unknown_tools_never_share_a_group_with_anything_unsafe() {
        let profiles = vec![unknown(), unknown(), write("a.rs")];
        let groups = group_by_conflicts(&profiles);
        assert_eq!(groups.len(), 3);
    }

    #[test]
    fn undeclared_tool_may_share_with_a_parallel_safe_read() {
        // A tool with no capability declarations is not a write, and a
        // parallel-safe read conflicts only with writes on its file.
        let profiles = vec![read("a.rs"), unknown()];
        let groups = group_by_conflicts(&profiles);
        assert_eq!(groups.len(), 1);
    }

    #[test]
    fn write_does_not_conflict_with_safe_read_of_other_file() {
        let profiles = vec![write("a.rs"), read("b.rs")];
        let groups = group_by_conflicts(&profiles);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0], vec![0, 1]);
    }

    #[test]
    fn empty_batch_produces_no_groups() {
        assert!(group_by_conflicts(&[]).is_empty());
    }

    #[test]
    fn grouping_is_deterministic() {
        let profiles = vec![
            read("a"),
            write("a"),
            read("b"),
            write("b"),
            unknown(),
            read("a"),
        ];
        let first = group_by_conflicts(&profiles);
        for _ in 0..5 {
            assert_eq!(group_by_conflicts(&profiles), first);
        }
    }

    fn arbitrary_profile() -> impl Strategy<Value = CallProfile> {
        (
            any::<bool>(),
            any::<bool>(),
            proptest::option::of("[ab]"),
        )
            .prop_map(|(parallel_safe, write, path)| CallProfile {
                parallel_safe,
                write,
                path,
            })
    }

    proptest! {
        /// No group ever contains a conflicting pair, for any batch.
        #[test]
        fn no_group_contains_a_hazard(
            profiles in proptest::collection::vec(arbitrary_profile(), 0..12)
        ) {
            let groups = group_by_conflicts(&profiles);

            // every index appears exactly once
            let mut seen: Vec<usize> = groups.iter().flatten().copied().collect();
            seen.sort_unstable();
            prop_assert_eq!(seen, (0..profiles.len()).collect::<Vec<_>>());

            for group in &groups {
                for (i, &a) in group.iter().enumerate() {
                    for &b in &group[i + 1..] {
                        prop_assert!(
                            !conflicts(&profiles[a], &profiles[b]),
                            "calls {} and {} conflict but share a group",
                            a,
                            b
                        );
                    }
                }
            }
        }
    }
}
