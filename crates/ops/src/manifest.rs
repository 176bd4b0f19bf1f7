//! Manifest rendering for dispatched deployments.

use fabrik_core::operation::OperationParams;
use fabrik_core::{FabrikError, FabrikResult};
use serde::Serialize;
use serde_json::Value;

pub trait ManifestGenerator: Send + Sync {
    fn generate(&self, deployment_name: &str, params: &OperationParams) -> FabrikResult<String>;
}

#[derive(Serialize)]
struct Manifest<'a> {
    name: &'a str,
    properties: Properties<'a>,
}

#[derive(Serialize)]
struct Properties<'a> {
    plan_id: &'a str,
    parameters: &'a Value,
    context: &'a Value,
}

/// Renders the deployment name and request parameters as a YAML document.
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlManifest;

impl ManifestGenerator for YamlManifest {
    fn generate(&self, deployment_name: &str, params: &OperationParams) -> FabrikResult<String> {
        let m = Manifest {
            name: deployment_name,
            properties: Properties { plan_id: &params.plan_id, parameters: &params.parameters, context: &params.context },
        };
        serde_yaml::to_string(&m).map_err(|e| FabrikError::InternalServerError(format!("rendering manifest: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_name_and_parameters() {
        let mut p = OperationParams::new("plan-1");
        p.parameters = json!({"size": "m"});
        let yaml = YamlManifest.generate("service-fabrik-0001-abc", &p).expect("render");
        let back: serde_yaml::Value = serde_yaml::from_str(&yaml).expect("parse");
        assert_eq!(back["name"].as_str(), Some("service-fabrik-0001-abc"));
        assert_eq!(back["properties"]["parameters"]["size"].as_str(), Some("m"));
        assert_eq!(back["properties"]["plan_id"].as_str(), Some("plan-1"));
    }
}
