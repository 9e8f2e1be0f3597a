//! Exception breakpoint filters shared by every thread.
//!
//! The active [`FilterSet`] is immutable; [`ExceptionBreakpoints::set_filters`]
//! builds a new one and swaps it in atomically, so a pause decision always sees
//! one complete set.

use std::{future::Future, sync::Arc};

use nightjar_cdp::{CdpError, CdpSession, PauseOnExceptionsState, RemoteObject};
use parking_lot::RwLock;
use serde_json::Value;

use crate::{condition::ConditionValidator, internal::mark_internal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FilterId {
    /// Every thrown value, caught or not.
    All,
    /// Exceptions that escape every handler.
    Uncaught,
}

impl FilterId {
    pub fn parse(id: &str) -> Option<Self> {
        match id {
            "all" => Some(FilterId::All),
            "uncaught" => Some(FilterId::Uncaught),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterId::All => "all",
            FilterId::Uncaught => "uncaught",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FilterId::All => "Caught Exceptions",
            FilterId::Uncaught => "Uncaught Exceptions",
        }
    }

    fn matches(&self, uncaught: bool) -> bool {
        match self {
            FilterId::All => true,
            FilterId::Uncaught => uncaught,
        }
    }
}

/// One requested filter as received from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRequest {
    pub filter_id: String,
    pub condition: Option<String>,
}

impl FilterRequest {
    pub fn new(filter_id: impl Into<String>) -> Self {
        Self {
            filter_id: filter_id.into(),
            condition: None,
        }
    }

    pub fn with_condition(filter_id: impl Into<String>, condition: impl Into<String>) -> Self {
        Self {
            filter_id: filter_id.into(),
            condition: Some(condition.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveFilter {
    pub id: FilterId,
    pub condition: Option<String>,
    /// Function source sent to the runtime, present iff `condition` is.
    wrapped: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSet {
    filters: Vec<ActiveFilter>,
}

impl FilterSet {
    pub fn filters(&self) -> &[ActiveFilter] {
        &self.filters
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// What the runtime must pause on for this set to see every candidate.
    pub fn pause_state(&self) -> PauseOnExceptionsState {
        if self.filters.iter().any(|f| f.id == FilterId::All) {
            PauseOnExceptionsState::All
        } else if self.filters.is_empty() {
            PauseOnExceptionsState::None
        } else {
            PauseOnExceptionsState::Uncaught
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetFiltersOutcome {
    pub pause_state: PauseOnExceptionsState,
    /// One message per rejected condition, ready for an `output` event.
    pub diagnostics: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionDecision {
    Pause,
    Resume,
}

/// Remote evaluation of a wrapped condition against a thrown value.
pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(
        &self,
        wrapped: &str,
        thrown: &RemoteObject,
    ) -> impl Future<Output = Result<bool, EvaluationFailure>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvaluationFailure {
    /// The condition threw inside the runtime.
    Threw(String),
    /// The runtime could not be asked.
    Transport(String),
}

impl From<CdpError> for EvaluationFailure {
    fn from(err: CdpError) -> Self {
        EvaluationFailure::Transport(err.to_string())
    }
}

impl std::fmt::Display for EvaluationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvaluationFailure::Threw(message) => write!(f, "condition threw: {message}"),
            EvaluationFailure::Transport(message) => write!(f, "{message}"),
        }
    }
}

impl ConditionEvaluator for CdpSession {
    async fn evaluate(&self, wrapped: &str, thrown: &RemoteObject) -> Result<bool, EvaluationFailure> {
        let function = mark_internal(wrapped);
        let result = match &thrown.object_id {
            Some(object_id) => {
                self.call_function_on(
                    object_id,
                    &function,
                    vec![thrown.as_call_argument()],
                    true,
                    true,
                )
                .await?
            }
            None => {
                // Primitives have no object to call on; splice the literal in.
                let expression = mark_internal(&format!("({wrapped})({})", primitive_literal(thrown)));
                self.evaluate(&expression, true).await?
            }
        };

        if let Some(details) = result.exception_details {
            return Err(EvaluationFailure::Threw(details.display()));
        }
        Ok(matches!(result.result.value, Some(Value::Bool(true))))
    }
}

fn primitive_literal(value: &RemoteObject) -> String {
    if let Some(unserializable) = &value.unserializable_value {
        return unserializable.clone();
    }
    match &value.value {
        Some(value) => value.to_string(),
        None if value.kind == "undefined" => "undefined".to_string(),
        None => "null".to_string(),
    }
}

/// Process-wide exception filter configuration.
#[derive(Debug, Clone)]
pub struct ExceptionBreakpoints {
    active: Arc<RwLock<Arc<FilterSet>>>,
    validator: ConditionValidator,
}

impl ExceptionBreakpoints {
    pub fn new(validator: ConditionValidator) -> Self {
        Self {
            active: Arc::new(RwLock::new(Arc::new(FilterSet::default()))),
            validator,
        }
    }

    pub fn snapshot(&self) -> Arc<FilterSet> {
        self.active.read().clone()
    }

    /// Replace the active filters wholesale.
    ///
    /// A filter whose condition fails validation is left out of the new set
    /// entirely; its diagnostic is returned. Unknown filter ids are ignored.
    /// When a filter id is repeated, the last entry wins.
    pub fn set_filters(&self, requests: &[FilterRequest]) -> SetFiltersOutcome {
        let mut filters: Vec<ActiveFilter> = Vec::new();
        let mut diagnostics = Vec::new();

        for request in requests {
            let Some(id) = FilterId::parse(&request.filter_id) else {
                tracing::warn!(
                    target: "nightjar.dap",
                    filter = %request.filter_id,
                    "ignoring unknown exception filter"
                );
                continue;
            };
            filters.retain(|f| f.id != id);

            let condition = request
                .condition
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty());
            let Some(condition) = condition else {
                filters.push(ActiveFilter {
                    id,
                    condition: None,
                    wrapped: None,
                });
                continue;
            };

            match self.validator.validate(condition) {
                Ok(()) => filters.push(ActiveFilter {
                    id,
                    condition: Some(condition.to_string()),
                    wrapped: Some(self.validator.wrap(condition)),
                }),
                Err(err) => {
                    tracing::warn!(
                        target: "nightjar.dap",
                        filter = id.as_str(),
                        error = %err,
                        "exception filter disabled"
                    );
                    diagnostics.push(format!(
                        "{} breakpoint disabled. {err}\n",
                        id.label()
                    ));
                }
            }
        }

        filters.sort_by_key(|f| f.id);
        let set = FilterSet { filters };
        let pause_state = set.pause_state();
        *self.active.write() = Arc::new(set);

        SetFiltersOutcome {
            pause_state,
            diagnostics,
        }
    }

    /// Decide whether an exception pause should reach the client.
    ///
    /// Evaluation failures pause: a broken condition must not hide a real
    /// exception.
    pub async fn should_pause<E: ConditionEvaluator>(
        &self,
        uncaught: bool,
        thrown: &RemoteObject,
        evaluator: &E,
    ) -> ExceptionDecision {
        let set = self.snapshot();
        for filter in set.filters().iter().filter(|f| f.id.matches(uncaught)) {
            let Some(wrapped) = &filter.wrapped else {
                return ExceptionDecision::Pause;
            };
            match evaluator.evaluate(wrapped, thrown).await {
                Ok(true) => return ExceptionDecision::Pause,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(
                        target: "nightjar.dap",
                        filter = filter.id.as_str(),
                        error = %err,
                        "exception condition evaluation failed; pausing"
                    );
                    return ExceptionDecision::Pause;
                }
            }
        }
        ExceptionDecision::Resume
    }
}

impl Default for ExceptionBreakpoints {
    fn default() -> Self {
        Self::new(ConditionValidator::default())
    }
}
