//! JSON Schema checks for federation documents served to remote servers

use jsonschema::{Draft, JSONSchema};
use serde_json::Value;
use std::fs;
use std::path::Path;

/// Load a JSON schema from a file
pub fn load_schema(schema_path: &str) -> JSONSchema {
    let schema_content = fs::read_to_string(schema_path)
        .unwrap_or_else(|_| panic!("Failed to read schema file: {}", schema_path));
    
    let schema_json: Value = serde_json::from_str(&schema_content)
        .unwrap_or_else(|_| panic!("Failed to parse schema JSON: {}", schema_path));
    
    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&schema_json)
        .expect("Failed to compile schema")
}

/// Validate a JSON value against a schema
pub fn validate_against_schema(data: &Value, schema: &JSONSchema) -> Result<(), Vec<String>> {
    match schema.validate(data) {
        Ok(_) => Ok(()),
        Err(errors) => {
            let error_messages: Vec<String> = errors
                .map(|e| format!("{} at {}", e, e.instance_path))
                .collect();
            Err(error_messages)
        }
    }
}

/// Load schema from tests/schemas directory
pub fn load_test_schema(schema_name: &str) -> JSONSchema {
    let schema_path = format!("tests/schemas/{}.json", schema_name);
    load_schema(&schema_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn webfinger_schema_requires_subject_and_links() {
        let schema = load_test_schema("webfinger");

        let valid = json!({
            "subject": "acct:test@localhost",
            "links": [{"rel": "self", "type": "application/activity+json", "href": "http://localhost/u/test"}]
        });
        assert!(validate_against_schema(&valid, &schema).is_ok());

        let missing_links = json!({"subject": "acct:test@localhost"});
        assert!(validate_against_schema(&missing_links, &schema).is_err());
    }
}
