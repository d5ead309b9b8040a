use serde_json::Value;

use crate::store::RequestDescriptor;

/// Query-parameter mapping keyed by parameter name. Values are JSON strings
/// for single parameters and JSON arrays for repeated parameters; iteration
/// order is insertion order.
pub type QueryMap = serde_json::Map<String, Value>;

/// Decides whether two query mappings are equivalent.
///
/// Key sets must be identical. Per shared key, two array values compare as
/// multisets (order-insensitive, duplicate-count-sensitive); an array never
/// equals a non-array; everything else compares by strict value equality,
/// so `"1"` and `1` are distinct.
pub fn query_dicts_match(a: &QueryMap, b: &QueryMap) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.iter().all(|(key, a_value)| {
        b.get(key)
            .is_some_and(|b_value| query_values_match(a_value, b_value))
    })
}

fn query_values_match(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Array(a_items), Value::Array(b_items)) => multisets_equal(a_items, b_items),
        (Value::Array(_), _) | (_, Value::Array(_)) => false,
        _ => a == b,
    }
}

fn multisets_equal(a: &[Value], b: &[Value]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut unclaimed: Vec<&Value> = b.iter().collect();
    for item in a {
        let Some(position) = unclaimed.iter().position(|candidate| *candidate == item) else {
            return false;
        };
        unclaimed.swap_remove(position);
    }
    true
}

/// Decides whether an incoming request descriptor matches a stored one:
/// identical method and path strings (no case or trailing-slash
/// normalization), equivalent query mappings, and deeply equal bodies.
/// Absent bodies on both sides count as equal.
pub fn requests_match(incoming: &RequestDescriptor, stored: &RequestDescriptor) -> bool {
    incoming.method == stored.method
        && incoming.path == stored.path
        && query_dicts_match(&incoming.query, &stored.query)
        && incoming.body == stored.body
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{query_dicts_match, requests_match, QueryMap};
    use crate::store::RequestDescriptor;

    fn query(value: serde_json::Value) -> QueryMap {
        let serde_json::Value::Object(map) = value else {
            panic!("query fixture must be a JSON object");
        };
        map
    }

    fn request(method: &str, path: &str, query_map: serde_json::Value) -> RequestDescriptor {
        RequestDescriptor {
            method: method.to_owned(),
            path: path.to_owned(),
            query: query(query_map),
            body: None,
        }
    }

    #[test]
    fn equal_dicts_match_regardless_of_key_order() {
        let a = query(json!({"postId": "1", "page": "2"}));
        let b = query(json!({"page": "2", "postId": "1"}));
        assert!(query_dicts_match(&a, &b));
        assert!(query_dicts_match(&b, &a));
    }

    #[test]
    fn every_dict_matches_itself() {
        let cases = [
            query(json!({})),
            query(json!({"a": "1"})),
            query(json!({"fq": ["a", "b"], "x": "y"})),
        ];
        for case in &cases {
            assert!(query_dicts_match(case, case));
        }
    }

    #[test]
    fn differing_key_sets_do_not_match() {
        let a = query(json!({"postId": "1"}));
        let b = query(json!({"postId": "1", "page": "2"}));
        assert!(!query_dicts_match(&a, &b));
        assert!(!query_dicts_match(&b, &a));
    }

    #[test]
    fn array_values_match_as_multisets() {
        let a = query(json!({"fq": ["a", "b"]}));
        let b = query(json!({"fq": ["b", "a"]}));
        assert!(query_dicts_match(&a, &b));
    }

    #[test]
    fn array_values_are_duplicate_count_sensitive() {
        let a = query(json!({"fq": ["a", "a"]}));
        let b = query(json!({"fq": ["a"]}));
        assert!(!query_dicts_match(&a, &b));
        assert!(!query_dicts_match(&b, &a));
    }

    #[test]
    fn array_never_equals_scalar() {
        let a = query(json!({"fq": ["a"]}));
        let b = query(json!({"fq": "a"}));
        assert!(!query_dicts_match(&a, &b));
        assert!(!query_dicts_match(&b, &a));
    }

    #[test]
    fn scalar_comparison_is_type_sensitive() {
        let a = query(json!({"postId": "1"}));
        let b = query(json!({"postId": 1}));
        assert!(!query_dicts_match(&a, &b));
    }

    #[test]
    fn matching_requires_identical_method_and_path() {
        let stored = request("GET", "/comments", json!({"postId": "1"}));

        assert!(requests_match(
            &request("GET", "/comments", json!({"postId": "1"})),
            &stored
        ));
        assert!(!requests_match(
            &request("POST", "/comments", json!({"postId": "1"})),
            &stored
        ));
        assert!(!requests_match(
            &request("GET", "/comments/", json!({"postId": "1"})),
            &stored
        ));
    }

    #[test]
    fn bodies_compare_deeply() {
        let mut stored = request("POST", "/comments", json!({}));
        stored.body = Some(json!({"hello": "world", "nested": {"a": [1, 2]}}));

        let mut incoming = stored.clone();
        assert!(requests_match(&incoming, &stored));

        incoming.body = Some(json!({"hello": "world", "nested": {"a": [2, 1]}}));
        assert!(!requests_match(&incoming, &stored));
    }

    #[test]
    fn body_presence_must_agree() {
        let stored = request("POST", "/comments", json!({}));
        let mut incoming = stored.clone();
        incoming.body = Some(json!({}));

        assert!(!requests_match(&incoming, &stored));
        assert!(!requests_match(&stored, &incoming));
    }
}
