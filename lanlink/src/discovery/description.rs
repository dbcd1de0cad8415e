use std::collections::HashMap;
use std::path::Path;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use shared::types::ServiceFilter;
use super::{validate_filter, DiscoveryError};

/// A service instance to advertise, as written in a JSON description file:
///
/// ```json
/// {
///   "name": "edison-temperature",
///   "type": { "name": "zmq", "protocol": "tcp", "subtypes": ["cpuTemp"] },
///   "port": 5556,
///   "properties": { "unit": "celsius" }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescription {
    /// Instance name
    #[serde(rename = "name")]
    pub service_name: String,

    #[serde(rename = "type")]
    pub service_type: ServiceFilter,

    pub port: u16,

    /// Published as TXT records
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl ServiceDescription {
    /// Load a description from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DiscoveryError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| DiscoveryError::InvalidDescription {
            source_name: path.display().to_string(),
            reason: format!("can't read file: {}", e),
        })?;

        Self::from_json(&path.display().to_string(), &contents)
    }

    /// Parse and validate a description; `source_name` only labels errors
    pub fn from_json(source_name: &str, json: &str) -> Result<Self, DiscoveryError> {
        let invalid = |reason: String| DiscoveryError::InvalidDescription {
            source_name: source_name.to_string(),
            reason,
        };

        let description: ServiceDescription =
            serde_json::from_str(json).map_err(|e| invalid(format!("invalid JSON format: {}", e)))?;

        if description.service_name.trim().is_empty() {
            return Err(invalid("service name is empty".to_string()));
        }
        if description.port == 0 {
            return Err(invalid("port must be between 1 and 65535".to_string()));
        }
        validate_filter(&description.service_type).map_err(|e| invalid(e.to_string()))?;

        Ok(description)
    }

    /// Properties flattened to TXT key/value strings
    pub fn txt_records(&self) -> HashMap<String, String> {
        self.properties
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (key.clone(), value)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::types::Protocol;

    const TEMPERATURE: &str = r#"{
        "name": "edison-temperature",
        "type": { "name": "zmq", "protocol": "tcp", "subtypes": ["cpuTemp"] },
        "port": 5556,
        "properties": { "unit": "celsius", "rate": 2 }
    }"#;

    #[test]
    fn test_parse_description() {
        let description = ServiceDescription::from_json("temperature.json", TEMPERATURE).unwrap();

        assert_eq!(description.service_name, "edison-temperature");
        assert_eq!(
            description.service_type,
            ServiceFilter::new("zmq", Protocol::Tcp).with_subtype("cpuTemp")
        );
        assert_eq!(description.port, 5556);

        let txt = description.txt_records();
        assert_eq!(txt.get("unit").map(String::as_str), Some("celsius"));
        assert_eq!(txt.get("rate").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_properties_optional() {
        let description = ServiceDescription::from_json(
            "minimal.json",
            r#"{ "name": "m", "type": { "name": "zmq", "protocol": "udp" }, "port": 1 }"#,
        )
        .unwrap();

        assert!(description.service_type.subtypes.is_empty());
        assert!(description.txt_records().is_empty());
    }

    #[test]
    fn test_missing_and_mistyped_fields() {
        let cases = [
            r#"{ "type": { "name": "zmq", "protocol": "tcp" }, "port": 1 }"#,
            r#"{ "name": "m", "type": { "name": "zmq", "protocol": "sctp" }, "port": 1 }"#,
            r#"{ "name": "m", "type": { "name": "zmq", "protocol": "tcp" }, "port": "1" }"#,
            r#"{ "name": "m", "type": { "name": "zmq", "protocol": "tcp" }, "port": 0 }"#,
            r#"{ "name": "m", "type": { "name": "", "protocol": "tcp" }, "port": 1 }"#,
            r#"[1, 2]"#,
        ];

        for json in cases {
            match ServiceDescription::from_json("bad.json", json) {
                Err(DiscoveryError::InvalidDescription { source_name, .. }) => {
                    assert_eq!(source_name, "bad.json");
                }
                other => panic!("expected invalid description for {}, got {:?}", json, other),
            }
        }
    }

    #[test]
    fn test_load_missing_file() {
        let result = ServiceDescription::load("/nonexistent/lanlink/service.json");
        assert!(matches!(result, Err(DiscoveryError::InvalidDescription { .. })));
    }
}
