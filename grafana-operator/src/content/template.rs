//! Template source evaluation.
//!
//! Dashboard templates are rendered with the variables declared on the
//! resource; `import` paths resolve against the embedded template library
//! below. Compiled library templates are memoized inside the environment,
//! which lives as long as the resolver instance.

use std::collections::BTreeMap;

use minijinja::Environment;

const LIBRARY: &[(&str, &str)] = &[
    ("lib/panels.j2", include_str!("library/panels.j2")),
    ("lib/dashboard.j2", include_str!("library/dashboard.j2")),
];

pub(crate) struct TemplateEvaluator {
    env: Environment<'static>,
}

impl TemplateEvaluator {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_loader(|name| {
            Ok(LIBRARY
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, source)| source.to_string()))
        });
        Self { env }
    }

    pub fn render(
        &self,
        source: &str,
        vars: &BTreeMap<String, String>,
    ) -> Result<String, minijinja::Error> {
        self.env.render_str(source, vars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn renders_variables() {
        let evaluator = TemplateEvaluator::new();
        let rendered = evaluator
            .render(
                r#"{"title": "{{ title }}"}"#,
                &vars(&[("title", "Node stats")]),
            )
            .unwrap();
        assert_eq!(r#"{"title": "Node stats"}"#, rendered);
    }

    #[test]
    fn imports_resolve_against_the_library() {
        let evaluator = TemplateEvaluator::new();
        let source = r#"{% import "lib/panels.j2" as panels %}{{ panels.graph(title, expr) }}"#;
        let rendered = evaluator
            .render(
                source,
                &vars(&[("title", "CPU"), ("expr", "node_cpu_seconds_total")]),
            )
            .unwrap();
        let panel: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!("CPU", panel["title"]);
        assert_eq!("node_cpu_seconds_total", panel["targets"][0]["expr"]);
    }

    #[test]
    fn unknown_import_fails() {
        let evaluator = TemplateEvaluator::new();
        let source = r#"{% import "lib/missing.j2" as m %}{{ m.x() }}"#;
        assert!(evaluator.render(source, &vars(&[])).is_err());
    }
}
