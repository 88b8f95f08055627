//! Workflow definition parsing, validation, and filesystem operations.
//!
//! Converts between YAML/JSON files and `WorkflowDefinition`, validates the
//! structural constraints every execution relies on (unique step IDs,
//! resolvable successor references), and lints authoring mistakes that are
//! legal but suspicious.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};

use parley_types::workflow::{StepKind, WorkflowDefinition};
use serde_json::Value;

use super::error::WorkflowError;
use super::variables::{condition_references, template_references};

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
///
/// Runs `validate_definition` after deserialization, so the returned value
/// is guaranteed to be structurally valid.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Parse a JSON string into a validated `WorkflowDefinition`.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_json::from_str(json).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(def).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Name is non-empty and contains only alphanumerics, hyphens, underscores
/// - At least one step exists
/// - Step IDs are non-empty and unique
/// - Every `next_step`, `true_step`/`false_step`, and option `next_step`
///   names an existing step
/// - CHOICE steps have a variable and at least one option, with unique values
/// - INPUT steps have a variable; ACTION steps name an action
/// - `settings.max_steps_per_turn` is >= 1 if set
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.name.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }
    if !def
        .name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(WorkflowError::ValidationError(format!(
            "workflow name '{}' contains invalid characters (only alphanumerics, hyphens, and underscores allowed)",
            def.name
        )));
    }

    if def.steps.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one step".to_string(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        if step.id.trim().is_empty() {
            return Err(WorkflowError::ValidationError(
                "step ID must not be empty".to_string(),
            ));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }
    }

    for step in &def.steps {
        for target in step.kind.references() {
            if !seen_ids.contains(target) {
                return Err(WorkflowError::ValidationError(format!(
                    "step '{}' references unknown step '{}'",
                    step.id, target
                )));
            }
        }

        match &step.kind {
            StepKind::Choice {
                variable, options, ..
            } => {
                require_variable(&step.id, variable)?;
                if options.is_empty() {
                    return Err(WorkflowError::ValidationError(format!(
                        "choice step '{}' must have at least one option",
                        step.id
                    )));
                }
                let mut values = HashSet::new();
                for opt in options {
                    if !values.insert(opt.value.as_str()) {
                        return Err(WorkflowError::ValidationError(format!(
                            "choice step '{}' has duplicate option value '{}'",
                            step.id, opt.value
                        )));
                    }
                }
            }
            StepKind::Input { variable, .. } => require_variable(&step.id, variable)?,
            StepKind::Action { action, .. } if action.trim().is_empty() => {
                return Err(WorkflowError::ValidationError(format!(
                    "action step '{}' must name an action",
                    step.id
                )));
            }
            _ => {}
        }
    }

    if def.settings.max_steps_per_turn == Some(0) {
        return Err(WorkflowError::ValidationError(
            "max_steps_per_turn must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn require_variable(step_id: &str, variable: &str) -> Result<(), WorkflowError> {
    if variable.trim().is_empty() {
        return Err(WorkflowError::ValidationError(format!(
            "step '{step_id}' must name a variable"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Lint
// ---------------------------------------------------------------------------

/// Authoring warnings for a structurally valid definition.
///
/// Reports references to variables that are neither declared nor written by
/// a CHOICE/INPUT step, conditions that will not parse (they evaluate to
/// false at runtime), and steps unreachable from the entry step. Never fails.
pub fn lint_definition(def: &WorkflowDefinition) -> Vec<String> {
    let mut warnings = Vec::new();

    let mut known: HashSet<&str> = def.variables.iter().map(|v| root(v)).collect();
    for step in &def.steps {
        if let StepKind::Choice { variable, .. } | StepKind::Input { variable, .. } = &step.kind {
            known.insert(root(variable));
        }
    }

    let check = |step_id: &str, path: &str, warnings: &mut Vec<String>| {
        if !known.contains(root(path)) {
            warnings.push(format!(
                "step '{step_id}' references undeclared variable '{path}'"
            ));
        }
    };

    for step in &def.steps {
        match &step.kind {
            StepKind::Message { content, .. } | StepKind::Input { content, .. } => {
                for path in template_references(content) {
                    check(&step.id, path, &mut warnings);
                }
            }
            StepKind::Choice {
                content, options, ..
            } => {
                let texts = std::iter::once(content.as_str())
                    .chain(options.iter().map(|o| o.text.as_str()));
                for text in texts {
                    for path in template_references(text) {
                        check(&step.id, path, &mut warnings);
                    }
                }
            }
            StepKind::Condition { condition, .. } => match condition_references(condition) {
                Ok(paths) => {
                    for path in paths {
                        check(&step.id, path, &mut warnings);
                    }
                }
                Err(e) => warnings.push(format!(
                    "step '{}' has a malformed condition that always evaluates to false: {e}",
                    step.id
                )),
            },
            StepKind::Action { params, .. } => {
                let mut strings = Vec::new();
                for value in params.values() {
                    collect_strings(value, &mut strings);
                }
                for s in strings {
                    for path in template_references(s) {
                        check(&step.id, path, &mut warnings);
                    }
                }
            }
        }
    }

    let reachable = reachable_steps(def);
    for step in &def.steps {
        if !reachable.contains(step.id.as_str()) {
            warnings.push(format!("step '{}' is unreachable", step.id));
        }
    }

    warnings
}

fn root(path: &str) -> &str {
    path.split('.').next().unwrap_or(path)
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

/// Step IDs reachable from the entry step.
fn reachable_steps(def: &WorkflowDefinition) -> HashSet<&str> {
    let mut seen = HashSet::new();
    let mut queue: VecDeque<&str> = def.first_step().map(|s| s.id.as_str()).into_iter().collect();
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        if let Some(step) = def.step(id) {
            queue.extend(step.kind.references());
        }
    }
    seen
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a `.yaml`/`.yml` or `.json` file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_workflow_json(&content),
        _ => parse_workflow_yaml(&content),
    }
}

/// Save a workflow definition to a YAML file.
///
/// Creates parent directories if they don't exist.
pub fn save_workflow_file(path: &Path, def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_workflow_yaml(def)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Discover all workflow files under `base_dir`.
///
/// Scans for `.yaml`, `.yml`, and `.json` files recursively. Files that fail
/// to parse or validate are skipped with a warning.
pub fn discover_workflows(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, WorkflowError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), WorkflowError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
            continue;
        }
        let is_workflow = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| matches!(e, "yaml" | "yml" | "json"));
        if !is_workflow {
            continue;
        }
        match load_workflow_file(&path) {
            Ok(def) => results.push((path, def)),
            Err(e) => tracing::warn!(?path, error = %e, "skipping invalid workflow file"),
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use parley_types::workflow::{ChoiceOption, WorkflowStep};
    use std::collections::HashMap;
    use uuid::Uuid;

    fn minimal_workflow(name: &str, steps: Vec<WorkflowStep>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            name: name.to_string(),
            description: None,
            trigger: None,
            steps,
            variables: vec![],
            settings: Default::default(),
        }
    }

    fn message(id: &str, content: &str, next: Option<&str>) -> WorkflowStep {
        WorkflowStep {
            id: id.to_string(),
            name: id.to_string(),
            kind: StepKind::Message {
                content: content.to_string(),
                next_step: next.map(String::from),
            },
        }
    }

    // -----------------------------------------------------------------------
    // Parsing
    // -----------------------------------------------------------------------

    #[test]
    fn test_parse_yaml_roundtrip() {
        let yaml = r#"
name: support-intake
description: Route a support request
trigger: { keyword: help }
variables: [topic, details]
steps:
  - id: topic
    type: CHOICE
    content: What do you need help with?
    variable: topic
    options:
      - { text: Billing, value: billing, next_step: details }
      - { text: Something else, value: other, next_step: details }
  - id: details
    type: INPUT
    content: Tell us more about {{topic}}
    variable: details
    next_step: file
  - id: file
    type: ACTION
    action: create_ticket
    params:
      topic: "{{topic}}"
      body: "{{details}}"
"#;
        let def = parse_workflow_yaml(yaml).expect("should parse");
        assert_eq!(def.name, "support-intake");
        assert_eq!(def.steps.len(), 3);

        let yaml2 = serialize_workflow_yaml(&def).expect("should serialize");
        let def2 = parse_workflow_yaml(&yaml2).expect("should re-parse");
        assert_eq!(def2.id, def.id);
        assert_eq!(def2.steps.len(), def.steps.len());
        assert_eq!(def2.variables, def.variables);
    }

    #[test]
    fn test_parse_json_definition() {
        let json = r#"{
            "name": "ping",
            "steps": [ { "id": "p", "type": "MESSAGE", "content": "pong" } ]
        }"#;
        let def = parse_workflow_json(json).expect("should parse");
        assert_eq!(def.steps[0].id, "p");
    }

    #[test]
    fn test_parse_rejects_unknown_step_type() {
        let yaml = r#"
name: bad
steps:
  - { id: a, type: TELEPORT }
"#;
        let err = parse_workflow_yaml(yaml).unwrap_err();
        assert!(matches!(err, WorkflowError::ParseError(_)), "got: {err}");
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    #[test]
    fn test_validation_rejects_duplicate_step_ids() {
        let def = minimal_workflow(
            "test-wf",
            vec![message("a", "x", None), message("a", "y", None)],
        );
        let msg = validate_definition(&def).unwrap_err().to_string();
        assert!(msg.contains("duplicate step ID"), "got: {msg}");
    }

    #[test]
    fn test_validation_rejects_dangling_references() {
        let def = minimal_workflow("test-wf", vec![message("a", "x", Some("nowhere"))]);
        let msg = validate_definition(&def).unwrap_err().to_string();
        assert!(msg.contains("unknown step 'nowhere'"), "got: {msg}");

        let yaml = r#"
name: branchy
steps:
  - { id: c, type: CONDITION, condition: "{{x}}", true_step: c, false_step: missing }
"#;
        let msg = parse_workflow_yaml(yaml).unwrap_err().to_string();
        assert!(msg.contains("unknown step 'missing'"), "got: {msg}");

        let yaml = r#"
name: choosy
steps:
  - id: pick
    type: CHOICE
    variable: v
    options:
      - { text: A, value: a, next_step: gone }
"#;
        let msg = parse_workflow_yaml(yaml).unwrap_err().to_string();
        assert!(msg.contains("unknown step 'gone'"), "got: {msg}");
    }

    #[test]
    fn test_validation_rejects_empty_workflow_and_bad_names() {
        let msg = validate_definition(&minimal_workflow("wf", vec![]))
            .unwrap_err()
            .to_string();
        assert!(msg.contains("at least one step"), "got: {msg}");

        let msg = validate_definition(&minimal_workflow("has spaces!", vec![message("a", "x", None)]))
            .unwrap_err()
            .to_string();
        assert!(msg.contains("invalid characters"), "got: {msg}");

        let msg = validate_definition(&minimal_workflow("", vec![message("a", "x", None)]))
            .unwrap_err()
            .to_string();
        assert!(msg.contains("must not be empty"), "got: {msg}");
    }

    #[test]
    fn test_validation_rejects_bad_choice_steps() {
        let choice = |options: Vec<ChoiceOption>| WorkflowStep {
            id: "pick".to_string(),
            name: String::new(),
            kind: StepKind::Choice {
                content: "Pick".to_string(),
                variable: "v".to_string(),
                options,
                next_step: None,
            },
        };
        let opt = |value: &str| ChoiceOption {
            text: value.to_uppercase(),
            value: value.to_string(),
            next_step: None,
        };

        let msg = validate_definition(&minimal_workflow("wf", vec![choice(vec![])]))
            .unwrap_err()
            .to_string();
        assert!(msg.contains("at least one option"), "got: {msg}");

        let msg = validate_definition(&minimal_workflow("wf", vec![choice(vec![opt("a"), opt("a")])]))
            .unwrap_err()
            .to_string();
        assert!(msg.contains("duplicate option value"), "got: {msg}");
    }

    #[test]
    fn test_validation_rejects_zero_step_ceiling() {
        let mut def = minimal_workflow("wf", vec![message("a", "x", None)]);
        def.settings.max_steps_per_turn = Some(0);
        let msg = validate_definition(&def).unwrap_err().to_string();
        assert!(msg.contains("max_steps_per_turn"), "got: {msg}");
    }

    #[test]
    fn test_validation_allows_cycles() {
        let def = minimal_workflow(
            "loop",
            vec![message("a", "x", Some("b")), message("b", "y", Some("a"))],
        );
        assert!(validate_definition(&def).is_ok());
    }

    // -----------------------------------------------------------------------
    // Lint
    // -----------------------------------------------------------------------

    #[test]
    fn test_lint_reports_undeclared_and_unreachable() {
        let mut params = HashMap::new();
        params.insert("to".to_string(), serde_json::json!({ "addr": "{{contact.email}}" }));
        let mut def = minimal_workflow(
            "lint-me",
            vec![
                message("a", "Hi {{name}} {{nickname}}", Some("act")),
                WorkflowStep {
                    id: "act".to_string(),
                    name: String::new(),
                    kind: StepKind::Action {
                        action: "notify".to_string(),
                        params,
                        next_step: Some("check".to_string()),
                    },
                },
                WorkflowStep {
                    id: "check".to_string(),
                    name: String::new(),
                    kind: StepKind::Condition {
                        condition: "{{x}} ==".to_string(),
                        true_step: None,
                        false_step: None,
                        next_step: None,
                    },
                },
                message("orphan", "never", None),
            ],
        );
        def.variables = vec!["name".to_string()];

        let warnings = lint_definition(&def);
        assert!(warnings.iter().any(|w| w.contains("'nickname'")), "{warnings:?}");
        assert!(warnings.iter().any(|w| w.contains("'contact.email'")), "{warnings:?}");
        assert!(!warnings.iter().any(|w| w.contains("'name'")), "{warnings:?}");
        assert!(warnings.iter().any(|w| w.contains("malformed condition")), "{warnings:?}");
        assert!(warnings.iter().any(|w| w.contains("'orphan' is unreachable")), "{warnings:?}");
    }

    #[test]
    fn test_lint_accepts_variables_written_by_steps() {
        let yaml = r#"
name: clean
steps:
  - { id: ask, type: INPUT, content: "Name?", variable: user.name, next_step: greet }
  - { id: greet, type: MESSAGE, content: "Hi {{user.name}}" }
"#;
        let def = parse_workflow_yaml(yaml).unwrap();
        assert!(lint_definition(&def).is_empty());
    }

    // -----------------------------------------------------------------------
    // Filesystem
    // -----------------------------------------------------------------------

    #[test]
    fn test_save_and_load_workflow_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workflows/test.yaml");

        let def = minimal_workflow("test-wf", vec![message("a", "x", None)]);
        save_workflow_file(&path, &def).expect("should save");

        let loaded = load_workflow_file(&path).expect("should load");
        assert_eq!(loaded.name, "test-wf");
        assert_eq!(loaded.id, def.id);
    }

    #[test]
    fn test_discover_workflows() {
        let dir = tempfile::tempdir().unwrap();

        let wf1 = minimal_workflow("wf-one", vec![message("a", "x", None)]);
        let wf2 = minimal_workflow("wf-two", vec![message("b", "y", None)]);
        save_workflow_file(&dir.path().join("wf1.yaml"), &wf1).unwrap();
        save_workflow_file(&dir.path().join("sub/wf2.yml"), &wf2).unwrap();
        std::fs::write(dir.path().join("not-a-workflow.yaml"), "key: value").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let found = discover_workflows(dir.path()).expect("should discover");
        assert_eq!(found.len(), 2, "should find exactly 2 valid workflows");
    }

    #[test]
    fn test_discover_nonexistent_dir() {
        let result = discover_workflows(Path::new("/nonexistent/path"));
        assert!(result.unwrap().is_empty());
    }
}
