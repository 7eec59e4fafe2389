//! Derivative comparison and overlay of Kubernetes objects
//!
//! The API server defaults many fields the operator never sets (a service's
//! `clusterIP`, a pod's `terminationMessagePath`, ...). Comparing a freshly
//! built manifest with the observed object field by field would therefore
//! always report a difference. Instead the desired manifest is checked to be
//! *derivative* of the observed object: every field that is set on the
//! desired side must hold the same value on the observed side, while fields
//! that are unset on the desired side are ignored.
//!
//! Updates start from the observed object and overlay the desired fields on
//! top of it, so platform-assigned values survive the write.

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Whether `desired` is already represented within `observed`.
///
/// - null, empty strings, empty arrays and empty objects on the desired side
///   match anything
/// - objects match when every desired key matches the observed key
/// - arrays match element-wise; the desired array may be shorter
/// - values under `requests` and `limits` compare as resource quantities, so
///   `1000m` matches the `1` the API server stores
/// - everything else must be equal
pub fn is_derivative(desired: &Value, observed: &Value) -> bool {
    derivative_at(desired, observed, false)
}

fn derivative_at(desired: &Value, observed: &Value, quantities: bool) -> bool {
    match desired {
        Value::Null => true,
        Value::String(s) if s.is_empty() => true,
        Value::Array(items) if items.is_empty() => true,
        Value::Object(map) if map.is_empty() => true,
        Value::Object(desired_map) => match observed {
            Value::Object(observed_map) => desired_map.iter().all(|(key, value)| {
                derivative_at(
                    value,
                    observed_map.get(key).unwrap_or(&Value::Null),
                    quantities || is_quantity_map(key),
                )
            }),
            _ => false,
        },
        Value::Array(desired_items) => match observed {
            Value::Array(observed_items) => {
                desired_items.len() <= observed_items.len()
                    && desired_items
                        .iter()
                        .zip(observed_items)
                        .all(|(d, o)| derivative_at(d, o, false))
            }
            _ => false,
        },
        scalar if quantities => scalar == observed || same_quantity(scalar, observed),
        scalar => scalar == observed,
    }
}

fn is_quantity_map(key: &str) -> bool {
    matches!(key, "requests" | "limits")
}

fn same_quantity(desired: &Value, observed: &Value) -> bool {
    match (quantity_value(desired), quantity_value(observed)) {
        (Some(a), Some(b)) => {
            let scale = a.abs().max(b.abs()).max(f64::MIN_POSITIVE);
            (a - b).abs() / scale < 1e-9
        }
        _ => false,
    }
}

fn quantity_value(value: &Value) -> Option<f64> {
    match value {
        Value::String(s) => parse_quantity(s),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Numeric value of a Kubernetes quantity such as `500m`, `0.5Gi` or `1e3`
pub(crate) fn parse_quantity(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);
    if !number.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    let number: f64 = number.parse().ok()?;

    let multiplier = match suffix {
        "" => 1.0,
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024f64,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        exp if exp.starts_with(['e', 'E']) => 10f64.powi(exp[1..].parse::<i32>().ok()?),
        _ => return None,
    };
    Some(number * multiplier)
}

/// Overlay the fields set on `desired` onto `observed`.
///
/// Objects are merged key by key, arrays of equal length element by element
/// (keeping defaulted fields of list items such as containers), any other
/// value is replaced. Nulls on the desired side leave the observed value
/// untouched.
pub fn overlay(observed: &mut Value, desired: &Value) {
    match (observed, desired) {
        (_, Value::Null) => {}
        (Value::Object(observed_map), Value::Object(desired_map)) => {
            for (key, value) in desired_map {
                match observed_map.get_mut(key) {
                    Some(existing) => overlay(existing, value),
                    None if value.is_null() => {}
                    None => {
                        observed_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (Value::Array(observed_items), Value::Array(desired_items))
            if observed_items.len() == desired_items.len() =>
        {
            for (existing, value) in observed_items.iter_mut().zip(desired_items) {
                overlay(existing, value);
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}

/// Typed form of [`is_derivative`]
pub fn is_derivative_of<K: Serialize>(desired: &K, observed: &K) -> Result<bool> {
    Ok(is_derivative(
        &serde_json::to_value(desired)?,
        &serde_json::to_value(observed)?,
    ))
}

/// Typed form of [`overlay`]: a copy of `observed` carrying the desired fields
pub fn merge_onto<K: Serialize + DeserializeOwned>(observed: &K, desired: &K) -> Result<K> {
    let mut merged = serde_json::to_value(observed)?;
    overlay(&mut merged, &serde_json::to_value(desired)?);
    Ok(serde_json::from_value(merged)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Service, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use serde_json::json;

    #[test]
    fn test_defaulted_fields_are_ignored() {
        let desired = json!({ "spec": { "replicas": 3, "serviceName": "zero" } });
        let observed = json!({
            "spec": {
                "replicas": 3,
                "serviceName": "zero",
                "revisionHistoryLimit": 10
            },
            "status": { "readyReplicas": 1 }
        });
        assert!(is_derivative(&desired, &observed));
    }

    #[test]
    fn test_changed_scalar_is_a_difference() {
        let desired = json!({ "spec": { "replicas": 5 } });
        let observed = json!({ "spec": { "replicas": 3 } });
        assert!(!is_derivative(&desired, &observed));
    }

    #[test]
    fn test_missing_field_is_a_difference() {
        let desired = json!({ "spec": { "type": "NodePort" } });
        let observed = json!({ "spec": {} });
        assert!(!is_derivative(&desired, &observed));
    }

    #[test]
    fn test_empty_values_match_anything() {
        let desired = json!({ "a": "", "b": [], "c": {}, "d": null });
        let observed = json!({ "a": "x", "b": [1], "c": { "k": 1 } });
        assert!(is_derivative(&desired, &observed));
    }

    #[test]
    fn test_arrays_compare_as_prefix() {
        let observed = json!([{ "name": "a", "port": 1, "nodePort": 30001 }, { "name": "b" }]);
        assert!(is_derivative(&json!([{ "name": "a", "port": 1 }]), &observed));
        assert!(!is_derivative(&json!([{ "name": "a", "port": 2 }]), &observed));
        assert!(!is_derivative(
            &json!([{ "name": "a" }, { "name": "b" }, { "name": "c" }]),
            &observed
        ));
    }

    #[test]
    fn test_equivalent_quantities_match() {
        let desired = json!({ "resources": { "requests": { "cpu": "1000m", "memory": "0.5Gi" } } });
        let observed = json!({ "resources": { "requests": { "cpu": "1", "memory": "512Mi" } } });
        assert!(is_derivative(&desired, &observed));
    }

    #[test]
    fn test_claim_template_storage_matches_normalized_form() {
        let desired = json!({
            "volumeClaimTemplates": [{
                "spec": { "resources": { "requests": { "storage": "5120Mi" } } }
            }]
        });
        let observed = json!({
            "volumeClaimTemplates": [{
                "metadata": { "name": "datadir" },
                "spec": {
                    "accessModes": ["ReadWriteOnce"],
                    "resources": { "requests": { "storage": "5Gi" } }
                }
            }]
        });
        assert!(is_derivative(&desired, &observed));
    }

    #[test]
    fn test_different_quantities_are_a_difference() {
        let desired = json!({ "resources": { "limits": { "cpu": "1500m", "memory": "1Gi" } } });
        let observed = json!({ "resources": { "limits": { "cpu": "1500m", "memory": "1G" } } });
        assert!(!is_derivative(&desired, &observed));

        let desired = json!({ "resources": { "requests": { "cpu": "2" } } });
        let observed = json!({ "resources": { "requests": { "cpu": "1" } } });
        assert!(!is_derivative(&desired, &observed));
    }

    #[test]
    fn test_quantity_rules_stay_under_requests_and_limits() {
        let desired = json!({ "metadata": { "labels": { "size": "1000m" } } });
        let observed = json!({ "metadata": { "labels": { "size": "1" } } });
        assert!(!is_derivative(&desired, &observed));
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("250m"), Some(0.25));
        assert_eq!(parse_quantity("2Ki"), Some(2048.0));
        assert_eq!(parse_quantity("1.5G"), Some(1.5e9));
        assert_eq!(parse_quantity("1e3"), Some(1000.0));
        assert_eq!(parse_quantity("3"), Some(3.0));
        assert_eq!(parse_quantity("Gi"), None);
        assert_eq!(parse_quantity("12Qi"), None);
    }

    #[test]
    fn test_overlay_keeps_observed_only_fields() {
        let mut observed = json!({
            "metadata": { "name": "svc", "resourceVersion": "42" },
            "spec": {
                "clusterIP": "10.0.0.7",
                "ports": [{ "name": "grpc", "port": 5080, "nodePort": 31000 }]
            }
        });
        let desired = json!({
            "metadata": { "name": "svc", "labels": { "a": "b" } },
            "spec": { "ports": [{ "name": "grpc", "port": 5081 }], "type": "NodePort" }
        });

        overlay(&mut observed, &desired);

        assert_eq!(observed["metadata"]["resourceVersion"], "42");
        assert_eq!(observed["metadata"]["labels"]["a"], "b");
        assert_eq!(observed["spec"]["clusterIP"], "10.0.0.7");
        assert_eq!(observed["spec"]["type"], "NodePort");
        assert_eq!(observed["spec"]["ports"][0]["port"], 5081);
        assert_eq!(observed["spec"]["ports"][0]["nodePort"], 31000);
    }

    #[test]
    fn test_overlay_replaces_arrays_of_different_length() {
        let mut observed = json!({ "command": ["a", "b", "c"] });
        overlay(&mut observed, &json!({ "command": ["x"] }));
        assert_eq!(observed, json!({ "command": ["x"] }));
    }

    #[test]
    fn test_typed_merge_preserves_cluster_ip() {
        let observed = Service {
            metadata: ObjectMeta {
                name: Some("svc".to_string()),
                resource_version: Some("7".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some("10.0.0.9".to_string()),
                type_: Some("ClusterIP".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let desired = Service {
            metadata: ObjectMeta {
                name: Some("svc".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        assert!(!is_derivative_of(&desired, &observed).unwrap());
        let merged = merge_onto(&observed, &desired).unwrap();
        let spec = merged.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("10.0.0.9"));
        assert_eq!(spec.type_.as_deref(), Some("LoadBalancer"));
        assert_eq!(merged.metadata.resource_version.as_deref(), Some("7"));
    }
}
