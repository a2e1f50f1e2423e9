//! Script registry and `{{placeholder}}` substitution.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use protocol::config::{is_valid_identifier, ScriptDefinition};

use crate::error::ResolveError;
use crate::escape::{key_pattern, EscapedParams};

const REDACTED: &str = "'***'";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpectedMarkers {
    pub success: Vec<String>,
    pub failure: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// A validated script: the template is parsed once, when the registry is built.
#[derive(Debug, Clone)]
pub struct ScriptTemplate {
    id: String,
    segments: Vec<Segment>,
    placeholders: BTreeSet<String>,
    markers: ExpectedMarkers,
    secrets: BTreeSet<String>,
    timeout: Option<Duration>,
}

impl ScriptTemplate {
    pub fn compile(definition: &ScriptDefinition) -> Result<Self, ResolveError> {
        if !is_valid_identifier(&definition.id) {
            return Err(syntax_error(&definition.id, "script id must be [A-Za-z0-9_.-]+"));
        }
        let segments = parse_segments(&definition.id, &definition.template)?;
        let placeholders: BTreeSet<String> = segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Placeholder(name) => Some(name.clone()),
                Segment::Literal(_) => None,
            })
            .collect();
        for secret in &definition.secrets {
            if !placeholders.contains(secret) {
                return Err(syntax_error(
                    &definition.id,
                    &format!("secret {secret} is not a placeholder"),
                ));
            }
        }
        Ok(Self {
            id: definition.id.clone(),
            segments,
            placeholders,
            markers: ExpectedMarkers {
                success: definition.success_markers.clone(),
                failure: definition.failure_markers.clone(),
            },
            secrets: definition.secrets.iter().cloned().collect(),
            timeout: definition.timeout_secs.map(Duration::from_secs),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn markers(&self) -> &ExpectedMarkers {
        &self.markers
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.placeholders.iter().map(String::as_str)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

pub trait ScriptRegistry: Send + Sync {
    fn lookup(&self, script_id: &str) -> Option<&ScriptTemplate>;
}

#[derive(Debug, Default)]
pub struct StaticScriptRegistry {
    scripts: HashMap<String, ScriptTemplate>,
}

impl StaticScriptRegistry {
    pub fn from_definitions<'a, I>(definitions: I) -> Result<Self, ResolveError>
    where
        I: IntoIterator<Item = &'a ScriptDefinition>,
    {
        let mut scripts = HashMap::new();
        for definition in definitions {
            let template = ScriptTemplate::compile(definition)?;
            if scripts.insert(template.id.clone(), template).is_some() {
                return Err(syntax_error(&definition.id, "duplicate script id"));
            }
        }
        Ok(Self { scripts })
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

impl ScriptRegistry for StaticScriptRegistry {
    fn lookup(&self, script_id: &str) -> Option<&ScriptTemplate> {
        self.scripts.get(script_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    script_id: String,
    command_text: String,
    display_text: String,
    expected_markers: ExpectedMarkers,
    timeout: Option<Duration>,
}

impl ResolvedCommand {
    pub fn script_id(&self) -> &str {
        &self.script_id
    }

    pub fn command_text(&self) -> &str {
        &self.command_text
    }

    /// The command with secret values replaced; the only form fit for logs.
    pub fn display_text(&self) -> &str {
        &self.display_text
    }

    pub fn expected_markers(&self) -> &ExpectedMarkers {
        &self.expected_markers
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

pub fn resolve(
    registry: &dyn ScriptRegistry,
    script_id: &str,
    params: &EscapedParams,
) -> Result<ResolvedCommand, ResolveError> {
    let template = registry
        .lookup(script_id)
        .ok_or_else(|| ResolveError::UnknownScript {
            script_id: script_id.to_string(),
        })?;

    let mut command_text = String::new();
    let mut display_text = String::new();
    for segment in &template.segments {
        match segment {
            Segment::Literal(text) => {
                command_text.push_str(text);
                display_text.push_str(text);
            }
            Segment::Placeholder(name) => {
                let value = params
                    .get(name)
                    .ok_or_else(|| ResolveError::MissingParameter {
                        script_id: script_id.to_string(),
                        key: name.clone(),
                    })?;
                command_text.push_str(value.as_str());
                if template.secrets.contains(name) {
                    display_text.push_str(REDACTED);
                } else {
                    display_text.push_str(value.as_str());
                }
            }
        }
    }

    if let Some(key) = params
        .keys()
        .find(|key| !template.placeholders.contains(*key))
    {
        return Err(ResolveError::UnknownParameter {
            script_id: script_id.to_string(),
            key: key.to_string(),
        });
    }

    Ok(ResolvedCommand {
        script_id: template.id.clone(),
        command_text,
        display_text,
        expected_markers: template.markers.clone(),
        timeout: template.timeout,
    })
}

/// Shell quoting context at a point in the template text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quoting {
    Bare,
    Single,
    Double,
}

impl Quoting {
    fn advance(mut self, text: &str) -> Self {
        let mut chars = text.chars();
        while let Some(ch) = chars.next() {
            self = match (self, ch) {
                (Quoting::Single, '\'') => Quoting::Bare,
                (Quoting::Single, _) => Quoting::Single,
                (_, '\\') => {
                    chars.next();
                    self
                }
                (Quoting::Bare, '\'') => Quoting::Single,
                (Quoting::Bare, '"') => Quoting::Double,
                (Quoting::Double, '"') => Quoting::Bare,
                (state, _) => state,
            };
        }
        self
    }
}

/// Placeholders must sit outside any quotes.
fn parse_segments(script_id: &str, template: &str) -> Result<Vec<Segment>, ResolveError> {
    let mut segments = Vec::new();
    let mut quoting = Quoting::Bare;
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let literal = &rest[..start];
        if literal.contains("}}") {
            return Err(syntax_error(script_id, "unmatched closing braces"));
        }
        quoting = quoting.advance(literal);
        if quoting != Quoting::Bare {
            return Err(syntax_error(script_id, "placeholder inside quotes"));
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal.to_string()));
        }
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| syntax_error(script_id, "unterminated placeholder"))?;
        let name = after[..end].trim();
        if !key_pattern().is_match(name) {
            return Err(syntax_error(
                script_id,
                &format!("invalid placeholder name {name:?}"),
            ));
        }
        segments.push(Segment::Placeholder(name.to_string()));
        rest = &after[end + 2..];
    }
    if rest.contains("}}") {
        return Err(syntax_error(script_id, "unmatched closing braces"));
    }
    if quoting.advance(rest) != Quoting::Bare {
        return Err(syntax_error(script_id, "unterminated quote"));
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest.to_string()));
    }
    Ok(segments)
}

fn syntax_error(script_id: &str, message: &str) -> ResolveError {
    ResolveError::TemplateSyntax {
        script_id: script_id.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escape::escape;
    use std::collections::BTreeMap;

    fn definition(id: &str, template: &str) -> ScriptDefinition {
        ScriptDefinition {
            id: id.to_string(),
            template: template.to_string(),
            success_markers: vec!["OK".to_string()],
            failure_markers: Vec::new(),
            secrets: Vec::new(),
            timeout_secs: None,
        }
    }

    fn registry(definitions: &[ScriptDefinition]) -> StaticScriptRegistry {
        StaticScriptRegistry::from_definitions(definitions).expect("registry")
    }

    fn params(pairs: &[(&str, &str)]) -> EscapedParams {
        let raw: BTreeMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        escape(&raw).expect("escape")
    }

    #[test]
    fn substitutes_escaped_values() {
        let registry = registry(&[definition("install_x", "install-x --name {{ name }} --force")]);
        let resolved =
            resolve(&registry, "install_x", &params(&[("name", "my app")])).expect("resolve");
        assert_eq!(resolved.command_text(), "install-x --name 'my app' --force");
        assert_eq!(resolved.expected_markers().success, vec!["OK".to_string()]);
    }

    #[test]
    fn missing_parameter_is_reported() {
        let registry = registry(&[definition("install_x", "install-x {{name}} {{version}}")]);
        let err = resolve(&registry, "install_x", &params(&[("name", "a")])).unwrap_err();
        assert_eq!(
            err,
            ResolveError::MissingParameter {
                script_id: "install_x".to_string(),
                key: "version".to_string()
            }
        );
    }

    #[test]
    fn extra_parameter_is_not_dropped() {
        let registry = registry(&[definition("install_x", "install-x {{name}}")]);
        let err = resolve(
            &registry,
            "install_x",
            &params(&[("name", "a"), ("colour", "red")]),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ResolveError::UnknownParameter {
                script_id: "install_x".to_string(),
                key: "colour".to_string()
            }
        );
    }

    #[test]
    fn unknown_script_fails() {
        let registry = registry(&[]);
        let err = resolve(&registry, "nope", &params(&[])).unwrap_err();
        assert!(matches!(err, ResolveError::UnknownScript { .. }));
    }

    #[test]
    fn malformed_templates_fail_at_compile() {
        for template in ["echo {{name", "echo {{bad-name}}", "echo }} {{x}}", "echo {{x}} }}"] {
            let err = ScriptTemplate::compile(&definition("t", template)).unwrap_err();
            assert!(
                matches!(err, ResolveError::TemplateSyntax { .. }),
                "template {template:?} should be rejected"
            );
        }
    }

    #[test]
    fn placeholders_inside_quotes_are_rejected() {
        for template in [
            "printf '%s\\n' \"{{name}}\"",
            "echo '{{name}}'",
            "echo \"prefix {{name}} suffix\"",
            "echo \"it's\" '{{name}}",
            "echo 'open",
        ] {
            let err = ScriptTemplate::compile(&definition("t", template)).unwrap_err();
            assert!(
                matches!(err, ResolveError::TemplateSyntax { .. }),
                "template {template:?} should be rejected"
            );
        }
    }

    #[test]
    fn quotes_closed_before_placeholder_are_fine() {
        for template in [
            "printf '%s\\n' {{name}}",
            "echo \"a \\\" b\" {{name}}",
            "echo \\' {{name}}",
            "echo 'x'\"y\" {{name}} 'tail'",
        ] {
            let registry = registry(&[definition("t", template)]);
            resolve(&registry, "t", &params(&[("name", "v")]))
                .unwrap_or_else(|err| panic!("template {template:?}: {err}"));
        }
    }

    #[cfg(unix)]
    #[test]
    fn command_substitution_in_value_never_runs() {
        let registry = registry(&[definition("t", "printf '%s\\n' {{name}}")]);
        let resolved = resolve(
            &registry,
            "t",
            &params(&[("name", "$(echo INJECTED)")]),
        )
        .expect("resolve");
        let output = std::process::Command::new("sh")
            .arg("-c")
            .arg(resolved.command_text())
            .output()
            .expect("sh");
        assert_eq!(String::from_utf8_lossy(&output.stdout), "$(echo INJECTED)\n");
    }

    #[test]
    fn duplicate_scripts_are_rejected() {
        let err = StaticScriptRegistry::from_definitions(&[
            definition("a", "echo"),
            definition("a", "echo again"),
        ])
        .unwrap_err();
        assert!(matches!(err, ResolveError::TemplateSyntax { .. }));
    }

    #[test]
    fn secrets_are_redacted_in_display_text() {
        let mut script = definition("set_password", "chpasswd-wrapper {{user}} {{password}}");
        script.secrets = vec!["password".to_string()];
        let registry = registry(&[script]);
        let resolved = resolve(
            &registry,
            "set_password",
            &params(&[("user", "deploy"), ("password", "hunter2")]),
        )
        .expect("resolve");
        assert!(resolved.command_text().contains("'hunter2'"));
        assert!(!resolved.display_text().contains("hunter2"));
        assert_eq!(resolved.display_text(), "chpasswd-wrapper 'deploy' '***'");
    }

    #[test]
    fn hostile_name_stays_a_single_argument() {
        let registry = registry(&[definition("install_x", "{{name}} --version")]);
        let resolved = resolve(
            &registry,
            "install_x",
            &params(&[("name", "a\"; rm -rf /")]),
        )
        .expect("resolve");
        let tokens = shell_words::split(resolved.command_text()).expect("split");
        assert_eq!(tokens, vec!["a\"; rm -rf /".to_string(), "--version".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn posix_shell_sees_literal_program_name() {
        // `printf` stands in for the program so the argument can be observed.
        let registry = registry(&[definition("install_x", "printf '%s\\n' {{name}}")]);
        let resolved = resolve(
            &registry,
            "install_x",
            &params(&[("name", "a\"; rm -rf /")]),
        )
        .expect("resolve");
        let output = std::process::Command::new("sh")
            .arg("-c")
            .arg(resolved.command_text())
            .output()
            .expect("sh");
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout), "a\"; rm -rf /\n");
    }
}
