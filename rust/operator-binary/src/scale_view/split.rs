use std::collections::{BTreeMap, HashSet};

use snafu::{Snafu, ensure};

use crate::crd::{RisingWaveScaleViewSpec, ScalePolicy};

#[derive(Snafu, Debug, PartialEq, Eq)]
pub enum Error {
    #[snafu(display("split of {replicas} replicas summed up to {sum}"))]
    SumMismatch { replicas: i32, sum: i64 },

    #[snafu(display("group {group:?} appears more than once in the scale policy"))]
    DuplicateGroup { group: String },
}

/// Distributes `spec.replicas` over the groups of the scale policy.
///
/// Higher priorities are served first. Within one priority the groups are visited by
/// ascending `(maxReplicas, group)` and share the remaining replicas as evenly as their
/// limits allow. The result does not depend on the order of the policy entries.
pub fn split_replicas(spec: &RisingWaveScaleViewSpec) -> Result<BTreeMap<String, i32>, Error> {
    let mut buckets: BTreeMap<i32, Vec<&ScalePolicy>> = BTreeMap::new();
    let mut seen = HashSet::new();
    for policy in &spec.scale_policy {
        ensure!(
            seen.insert(policy.group.as_str()),
            DuplicateGroupSnafu {
                group: policy.group.clone()
            }
        );
        buckets.entry(policy.priority).or_default().push(policy);
    }

    let mut result = BTreeMap::new();
    let mut total_left = i64::from(spec.replicas);

    for bucket in buckets.values_mut().rev() {
        bucket.sort_by(|a, b| {
            max_replicas(a)
                .cmp(&max_replicas(b))
                .then_with(|| a.group.cmp(&b.group))
        });

        let len = bucket.len();
        for (i, policy) in bucket.iter().enumerate() {
            let assigned = if total_left <= 0 {
                0
            } else {
                let max = max_replicas(policy);
                let remaining = (len - i) as i64;
                if max * remaining <= total_left {
                    max
                } else {
                    (total_left + remaining - 1) / remaining
                }
            };
            total_left -= assigned;
            // Bounded by either max_replicas or spec.replicas, both of which fit.
            result.insert(policy.group.clone(), assigned as i32);
        }
    }

    let sum: i64 = result.values().map(|r| i64::from(*r)).sum();
    ensure!(
        sum == i64::from(spec.replicas) || (spec.replicas <= 0 && sum == 0),
        SumMismatchSnafu {
            replicas: spec.replicas,
            sum
        }
    );

    Ok(result)
}

fn max_replicas(policy: &ScalePolicy) -> i64 {
    i64::from(policy.max_replicas.unwrap_or(i32::MAX))
}
