//! Definition Parser
//!
//! Loads workflow definitions from YAML. A file holds either a single
//! definition or a `definitions:` list of them.

use std::fs;
use std::path::Path;

use log::{debug, info};
use serde::Deserialize;

use super::model::WorkflowDefinition;
use super::validator::validate_definition;
use crate::error::{EngineError, Result};

#[derive(Deserialize)]
#[serde(untagged)]
enum DefinitionFile {
    Many { definitions: Vec<WorkflowDefinition> },
    One(Box<WorkflowDefinition>),
}

/// Parses and validates definitions from YAML text.
pub fn parse_definitions(yaml: &str) -> Result<Vec<WorkflowDefinition>> {
    let parsed: DefinitionFile = serde_yaml::from_str(yaml).map_err(|e| {
        EngineError::Validation(format!(
            "Failed to parse workflow YAML: {}. Check the file format.",
            e
        ))
    })?;

    let mut definitions = match parsed {
        DefinitionFile::Many { definitions } => definitions,
        DefinitionFile::One(definition) => vec![*definition],
    };

    for definition in &mut definitions {
        validate_definition(definition)?;
    }

    Ok(definitions)
}

/// Loads workflow definitions from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use flowgate::workflow::load_definitions;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let definitions = load_definitions("workflows.yaml")?;
///     println!("Loaded {} definitions", definitions.len());
///     Ok(())
/// }
/// ```
pub fn load_definitions(path: impl AsRef<Path>) -> Result<Vec<WorkflowDefinition>> {
    let path = path.as_ref();
    info!("Loading workflow definitions from: {}", path.display());

    let yaml_content = fs::read_to_string(path).map_err(|e| {
        EngineError::Validation(format!(
            "Failed to read workflow file '{}': {}. Check that the file exists and is readable.",
            path.display(),
            e
        ))
    })?;

    debug!("YAML content loaded ({} bytes)", yaml_content.len());

    let definitions = parse_definitions(&yaml_content)?;
    info!(
        "Parsed {} definitions: {:?}",
        definitions.len(),
        definitions.iter().map(|d| d.label()).collect::<Vec<_>>()
    );
    Ok(definitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::StepType;
    use tempfile::tempdir;

    const ONBOARDING: &str = r#"
name: staff-onboarding
version: 2
displayName: Staff onboarding
category: staff
steps:
  - stepName: activate
    stepOrder: 3
    stepType: AUTOMATIC
    serviceEndpoint: identity:update-approval-status
  - stepName: validate
    stepOrder: 1
    stepType: AUTOMATIC
  - stepName: clinic-admin-review
    stepOrder: 2
    stepType: APPROVAL
    approvalRoles: [CLINIC_ADMIN]
    timeoutMinutes: 1440
"#;

    #[test]
    fn test_parse_single_definition() {
        let defs = parse_definitions(ONBOARDING).unwrap();
        assert_eq!(defs.len(), 1);

        let def = &defs[0];
        assert_eq!(def.version, 2);
        assert_eq!(def.steps[0].step_name, "validate");
        assert_eq!(def.steps[1].step_type, StepType::Approval);
        assert_eq!(def.steps[1].timeout_minutes, Some(1440));
    }

    #[test]
    fn test_parse_definition_list() {
        let yaml = r#"
definitions:
  - name: a
    steps:
      - { stepName: one, stepOrder: 1, stepType: AUTOMATIC }
  - name: b
    steps:
      - { stepName: notify, stepOrder: 1, stepType: NOTIFICATION, notificationTemplate: welcome }
"#;
        let defs = parse_definitions(yaml).unwrap();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[1].steps[0].notification_template.as_deref(), Some("welcome"));
    }

    #[test]
    fn test_parse_rejects_invalid_definition() {
        let yaml = r#"
name: broken
steps:
  - { stepName: review, stepOrder: 1, stepType: APPROVAL }
"#;
        let err = parse_definitions(yaml).unwrap_err();
        assert!(err.to_string().contains("approval roles"));
    }

    #[test]
    fn test_parse_rejects_bad_yaml() {
        let err = parse_definitions("name: [unclosed").unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_load_definitions_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("workflows.yaml");
        fs::write(&path, ONBOARDING).unwrap();

        let defs = load_definitions(&path).unwrap();
        assert_eq!(defs[0].name, "staff-onboarding");
    }

    #[test]
    fn test_load_missing_file() {
        let result = load_definitions("/nonexistent/workflows.yaml");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Failed to read"));
    }
}
