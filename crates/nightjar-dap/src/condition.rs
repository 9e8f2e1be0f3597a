//! Syntax validation for user-supplied conditions.
//!
//! Exception conditions are never evaluated locally. They are wrapped into a
//! one-argument function (see [`ConditionValidator::wrap`]) that the runtime
//! calls with the thrown value. The validator parses exactly that wrapped
//! source, so a condition is accepted here if and only if the runtime can
//! compile the function it will be asked to run.

use boa_ast::scope::Scope;
use boa_interner::Interner;
use boa_parser::{Parser, Source};

use crate::error::ConditionError;

pub const DEFAULT_IDENTIFIER: &str = "error";

#[derive(Debug, Clone)]
pub struct ConditionValidator {
    identifier: String,
}

impl Default for ConditionValidator {
    fn default() -> Self {
        Self::new(DEFAULT_IDENTIFIER)
    }
}

impl ConditionValidator {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Function declaration evaluated remotely with the thrown value as its only
    /// argument. The condition sits on its own lines so a trailing line comment
    /// cannot swallow the closing parenthesis.
    pub fn wrap(&self, condition: &str) -> String {
        format!(
            "function({}) {{ return !!(\n{}\n); }}",
            self.identifier, condition
        )
    }

    /// Check an exception condition without running it.
    pub fn validate(&self, condition: &str) -> Result<(), ConditionError> {
        // Parenthesised so the anonymous function parses as an expression.
        let source = format!("({});", self.wrap(condition));
        check_syntax(&source).map_err(|message| ConditionError::Syntax {
            condition: condition.to_string(),
            message,
        })
    }

    /// Check a line breakpoint condition, which the runtime evaluates as a
    /// plain expression in the paused frame.
    pub fn validate_expression(&self, condition: &str) -> Result<(), ConditionError> {
        let source = format!("(\n{condition}\n);");
        check_syntax(&source).map_err(|message| ConditionError::Syntax {
            condition: condition.to_string(),
            message,
        })
    }
}

fn check_syntax(source: &str) -> Result<(), String> {
    let mut interner = Interner::default();
    let mut parser = Parser::new(Source::from_bytes(source.as_bytes()));
    parser
        .parse_script(&Scope::new_global(), &mut interner)
        .map(|_| ())
        .map_err(|err| err.to_string())
}
