//! Deterministic deep merge of the `leader` section over the `follower`
//! section: `follower ++ leader` semantics for sequences, override
//! semantics for scalars, recursive union for mappings.
//!
//! Kept as a free function so it is independently testable without
//! touching the filesystem.

use serde_yaml::Value;

/// Merges `leader` over `follower`, mirroring `mergo.Merge(&follower, leader,
/// mergo.WithOverride, mergo.WithAppendSlice)` from the original
/// implementation:
///
/// - scalars and mappings: `leader` overrides `follower` at matching key
///   paths, recursing into nested mappings;
/// - sequences at the same key path are concatenated `follower ++ leader`;
/// - keys present only in one side pass through unchanged.
pub fn merge_yaml(follower: &serde_yaml::Mapping, leader: &serde_yaml::Mapping) -> serde_yaml::Mapping {
    let mut out = follower.clone();

    for (key, leader_value) in leader {
        match out.get(key).cloned() {
            Some(follower_value) => {
                out.insert(key.clone(), merge_value(&follower_value, leader_value));
            }
            None => {
                out.insert(key.clone(), leader_value.clone());
            }
        }
    }

    out
}

fn merge_value(follower: &Value, leader: &Value) -> Value {
    match (follower, leader) {
        (Value::Mapping(f), Value::Mapping(l)) => Value::Mapping(merge_yaml(f, l)),
        (Value::Sequence(f), Value::Sequence(l)) => {
            let mut combined = f.clone();
            combined.extend(l.clone());
            Value::Sequence(combined)
        }
        // Scalar (or mismatched-type) leaves: leader overrides follower.
        (_, leader) => leader.clone(),
    }
}
