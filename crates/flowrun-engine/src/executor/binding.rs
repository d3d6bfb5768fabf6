use serde_json::Value;

use flowrun_core::schema::Node;

use crate::state::Patch;

/// Turn an executor result into a Run State patch.
///
/// An object result contributes each declared generate field it contains.
/// Any other result is stored whole under every declared field. A node that
/// declares no fields gets the result under its own id.
pub fn bind_output(node: &Node, result: Value) -> Patch {
    let mut patch = Patch::new();

    if node.generate_fields.is_empty() {
        patch.insert(node.id.clone(), result);
        return patch;
    }

    if let Value::Object(obj) = &result {
        let matched: Vec<&String> = node
            .generate_fields
            .keys()
            .filter(|k| obj.contains_key(k.as_str()))
            .collect();
        if !matched.is_empty() {
            for key in matched {
                patch.insert(key.clone(), obj[key.as_str()].clone());
            }
            return patch;
        }
    }

    for key in node.generate_fields.keys() {
        patch.insert(key.clone(), result.clone());
    }
    patch
}

/// A patch as a JSON object, for event payloads.
pub fn patch_to_value(patch: &Patch) -> Value {
    Value::Object(patch.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowrun_core::schema::FieldKind;
    use serde_json::json;

    #[test]
    fn object_results_are_split_by_field() {
        let node = Node::llm("n", "x")
            .with_output("title", FieldKind::Text)
            .with_output("score", FieldKind::Number);
        let patch = bind_output(&node, json!({"title": "Hi", "score": 3, "extra": true}));
        assert_eq!(patch.len(), 2);
        assert_eq!(patch["title"], json!("Hi"));
        assert_eq!(patch["score"], json!(3));
    }

    #[test]
    fn scalar_results_fill_every_field() {
        let node = Node::llm("n", "x").with_output("answer", FieldKind::Text);
        let patch = bind_output(&node, json!("hello"));
        assert_eq!(patch["answer"], json!("hello"));
    }

    #[test]
    fn object_without_declared_keys_is_stored_whole() {
        let node = Node::http("n", "GET", "u").with_output("body", FieldKind::Object);
        let patch = bind_output(&node, json!({"id": 1}));
        assert_eq!(patch["body"], json!({"id": 1}));
    }

    #[test]
    fn undeclared_output_lands_under_node_id() {
        let node = Node::tool("fetch", "web_fetch", json!({}));
        let patch = bind_output(&node, json!([1, 2]));
        assert_eq!(patch["fetch"], json!([1, 2]));
    }
}
