use crate::scanner::{ScanFinding, SubMatch};
use rhai::{Dynamic, Engine, Scope, AST};
use serde::Serialize;
use thiserror::Error;

const MAX_OPERATIONS: u64 = 100_000;

/// Values bound into the quarantine expression for a single finding.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PolicyContext {
    #[serde(rename = "fullMatch")]
    pub full_match: ScanFinding,
    pub matches: Vec<SubMatch>,
}

impl PolicyContext {
    pub fn for_finding(finding: &ScanFinding) -> Self {
        PolicyContext {
            full_match: finding.clone(),
            matches: finding.sub_matches.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("expression error: {0}")]
    Compile(String),
    #[error("failed to bind policy context: {0}")]
    Bind(String),
    #[error("failed to run expression: {0}")]
    Eval(String),
    #[error("expression error: not a bool expression (returned {0})")]
    NotBool(String),
}

/// A compiled quarantine expression.
///
/// The expression sees `fullMatch` (the finding, with the backend's field
/// names) and `matches` (its sub-matches), e.g.
/// `fullMatch.score >= 70 || matches.some(|m| m.subscore > 80)`.
pub struct PolicyEvaluator {
    engine: Engine,
    ast: AST,
    expression: String,
}

impl PolicyEvaluator {
    /// Compile and type-check against an empty context; an expression that
    /// fails to compile, fails to run, or yields a non-bool is rejected.
    pub fn compile(expression: &str) -> Result<Self, PolicyError> {
        let mut engine = Engine::new();
        engine.set_strict_variables(true);
        engine.set_max_operations(MAX_OPERATIONS);

        let scope = bind(&PolicyContext::default())?;
        let ast = engine
            .compile_expression_with_scope(&scope, expression)
            .map_err(|e| PolicyError::Compile(e.to_string()))?;

        let evaluator = PolicyEvaluator {
            engine,
            ast,
            expression: expression.to_string(),
        };
        evaluator.evaluate(&PolicyContext::default())?;
        Ok(evaluator)
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn evaluate(&self, context: &PolicyContext) -> Result<bool, PolicyError> {
        let mut scope = bind(context)?;
        let value: Dynamic = self
            .engine
            .eval_ast_with_scope(&mut scope, &self.ast)
            .map_err(|e| PolicyError::Eval(e.to_string()))?;
        value
            .as_bool()
            .map_err(|type_name| PolicyError::NotBool(type_name.to_string()))
    }

    pub fn matches_finding(&self, finding: &ScanFinding) -> Result<bool, PolicyError> {
        self.evaluate(&PolicyContext::for_finding(finding))
    }
}

fn bind(context: &PolicyContext) -> Result<Scope<'static>, PolicyError> {
    let full_match = rhai::serde::to_dynamic(&context.full_match)
        .map_err(|e| PolicyError::Bind(e.to_string()))?;
    let matches = rhai::serde::to_dynamic(&context.matches)
        .map_err(|e| PolicyError::Bind(e.to_string()))?;

    let mut scope = Scope::new();
    scope.push_dynamic("fullMatch", full_match);
    scope.push_dynamic("matches", matches);
    Ok(scope)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(score: i64, subscores: &[i64]) -> ScanFinding {
        ScanFinding {
            level: "Alert".to_string(),
            score,
            sub_matches: subscores
                .iter()
                .map(|&subscore| SubMatch {
                    rule_name: format!("RULE_{subscore}"),
                    subscore,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_score_threshold() {
        let policy = PolicyEvaluator::compile("fullMatch.score > 50").unwrap();
        assert!(policy.matches_finding(&finding(80, &[])).unwrap());
        assert!(!policy.matches_finding(&finding(10, &[])).unwrap());
    }

    #[test]
    fn test_submatch_predicates() {
        let policy = PolicyEvaluator::compile(
            "matches.some(|m| m.subscore >= 75) && fullMatch.level == \"Alert\"",
        )
        .unwrap();
        assert!(policy.matches_finding(&finding(60, &[40, 80])).unwrap());
        assert!(!policy.matches_finding(&finding(60, &[40, 50])).unwrap());

        let policy = PolicyEvaluator::compile("matches.len() >= 2").unwrap();
        assert!(policy.matches_finding(&finding(0, &[1, 2])).unwrap());
    }

    #[test]
    fn test_context_fields_use_backend_names() {
        let policy =
            PolicyEvaluator::compile("fullMatch.context.sample_id == 42 && fullMatch.context.ext == \".js\"")
                .unwrap();
        let mut hit = finding(10, &[]);
        hit.context.sample_id = 42;
        hit.context.ext = ".js".to_string();
        assert!(policy.matches_finding(&hit).unwrap());
    }

    #[test]
    fn test_non_bool_expression_rejected() {
        assert!(matches!(
            PolicyEvaluator::compile("fullMatch.score + 1"),
            Err(PolicyError::NotBool(_))
        ));
    }

    #[test]
    fn test_syntax_error_rejected() {
        assert!(matches!(
            PolicyEvaluator::compile("fullMatch.score >"),
            Err(PolicyError::Compile(_))
        ));
    }

    #[test]
    fn test_unknown_variable_rejected() {
        assert!(PolicyEvaluator::compile("finding.score > 1").is_err());
    }

    #[test]
    fn test_statements_rejected() {
        assert!(PolicyEvaluator::compile("let x = 1; x == 1").is_err());
    }

    #[test]
    fn test_runtime_error_reported_per_finding() {
        // Short-circuits on the empty startup context, indexes past the end later.
        let policy =
            PolicyEvaluator::compile("fullMatch.score == 0 || matches[0].subscore > 50").unwrap();
        assert!(matches!(
            policy.matches_finding(&finding(80, &[])),
            Err(PolicyError::Eval(_))
        ));
        assert!(policy.matches_finding(&finding(80, &[60])).unwrap());
    }
}
