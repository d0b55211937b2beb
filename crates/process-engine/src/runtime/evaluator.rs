//! Condition evaluation for sequence flows.

use crate::error::EngineResult;
use minijinja::Environment;
use serde_json::{Map, Value};
use std::fmt::Debug;

pub trait ExpressionEvaluator: Send + Sync + Debug {
    fn evaluate_condition(&self, expression: &str, variables: &Map<String, Value>)
        -> EngineResult<bool>;
}

/// Jinja-flavoured conditions: `amount > 100`, `{{ approved }}`,
/// `status == 'open' and retries < 3`.
pub struct MiniJinjaEvaluator {
    env: Environment<'static>,
}

impl MiniJinjaEvaluator {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(minijinja::UndefinedBehavior::Lenient);
        Self { env }
    }
}

impl Default for MiniJinjaEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for MiniJinjaEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiniJinjaEvaluator").finish()
    }
}

impl ExpressionEvaluator for MiniJinjaEvaluator {
    fn evaluate_condition(
        &self,
        expression: &str,
        variables: &Map<String, Value>,
    ) -> EngineResult<bool> {
        // Wrap condition in {{ }} if not already
        let template = if contains_template_syntax(expression) {
            expression.to_string()
        } else {
            format!("{{{{ {} }}}}", expression)
        };

        let rendered = self.env.render_str(&template, variables)?;
        let trimmed = rendered.trim().to_lowercase();
        Ok(matches!(trimmed.as_str(), "true" | "1" | "yes"))
    }
}

fn contains_template_syntax(s: &str) -> bool {
    (s.contains("{{") && s.contains("}}")) || (s.contains("{%") && s.contains("%}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_plain_expression() {
        let evaluator = MiniJinjaEvaluator::new();
        let variables = vars(json!({"amount": 150, "status": "open"}));
        assert!(evaluator.evaluate_condition("amount > 100", &variables).unwrap());
        assert!(!evaluator.evaluate_condition("amount > 200", &variables).unwrap());
        assert!(evaluator
            .evaluate_condition("status == 'open' and amount < 1000", &variables)
            .unwrap());
    }

    #[test]
    fn test_template_expression() {
        let evaluator = MiniJinjaEvaluator::new();
        let variables = vars(json!({"approved": true}));
        assert!(evaluator.evaluate_condition("{{ approved }}", &variables).unwrap());
    }

    #[test]
    fn test_missing_variable_is_false() {
        let evaluator = MiniJinjaEvaluator::new();
        assert!(!evaluator
            .evaluate_condition("approved", &Map::new())
            .unwrap());
    }

    #[test]
    fn test_syntax_error() {
        let evaluator = MiniJinjaEvaluator::new();
        let err = evaluator
            .evaluate_condition("amount >", &Map::new())
            .unwrap_err();
        assert_eq!(err.kind(), "expression");
    }
}
