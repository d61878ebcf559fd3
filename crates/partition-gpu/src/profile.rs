//! Partition size labels and the `mig -cgi` argument they expand to.

use std::collections::HashMap;

use error_stack::Report;

use crate::error::PartitionError;
use crate::error::PartitionResult;

/// GPU instance profile and how many instances of it fit on one GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionProfile {
    pub profile_id: &'static str,
    pub max_instances: usize,
}

/// Profile ids and instance counts per partition size label.
#[derive(Debug, Clone)]
pub struct PartitionProfiles {
    profiles: HashMap<&'static str, PartitionProfile>,
}

impl PartitionProfiles {
    /// Table for the 40GB and 80GB A100 class parts.
    pub fn builtin() -> Self {
        const TABLE: [(&str, &str, usize); 10] = [
            // 40GB
            ("1g.5gb", "19", 7),
            ("2g.10gb", "14", 3),
            ("3g.20gb", "9", 2),
            ("4g.20gb", "5", 1),
            ("7g.40gb", "0", 1),
            // 80GB
            ("1g.10gb", "19", 7),
            ("2g.20gb", "14", 3),
            ("3g.40gb", "9", 2),
            ("4g.40gb", "5", 1),
            ("7g.80gb", "0", 1),
        ];

        let profiles = TABLE
            .into_iter()
            .map(|(label, profile_id, max_instances)| {
                (
                    label,
                    PartitionProfile {
                        profile_id,
                        max_instances,
                    },
                )
            })
            .collect();
        Self { profiles }
    }

    pub fn get(&self, label: &str) -> Option<PartitionProfile> {
        self.profiles.get(label).copied()
    }

    /// Builds the plan for `label`. The empty label yields an empty plan.
    pub fn plan(&self, label: &str) -> PartitionResult<PartitionPlan> {
        if label.is_empty() {
            return Ok(PartitionPlan(String::new()));
        }

        let profile = self.get(label).ok_or_else(|| {
            Report::new(PartitionError::InvalidPartitionSize {
                label: label.to_string(),
            })
        })?;

        Ok(PartitionPlan(
            vec![profile.profile_id; profile.max_instances].join(","),
        ))
    }
}

/// Comma separated profile ids passed to `mig -cgi`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan(String);

impl PartitionPlan {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for PartitionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
