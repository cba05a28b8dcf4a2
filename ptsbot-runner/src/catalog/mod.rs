// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test cases and the catalog they live in.
//!
//! A [`TestCase`] is immutable once built and shared across attempts and configurations
//! through an [`Arc`]. Test cases are built either programmatically with
//! [`TestCase::builder`] or loaded from TOML with [`Catalog::from_toml_str`].

mod loader;

use crate::{
    device::DeviceCommand,
    dispatch::HandlerRegistry,
    errors::{CatalogParseError, CatalogParseErrorKind, StepError},
    executor::StepContext,
    state::SharedState,
};
use debug_ignore::DebugIgnore;
use indexmap::{IndexMap, map::Entry};
use std::{collections::BTreeMap, fmt, sync::Arc};

/// A function run as a scripted step.
pub type LocalFn = Arc<dyn Fn(&mut StepContext<'_>) -> Result<(), StepError> + Send + Sync>;

/// A function producing the value returned for an edit callback.
pub type ProducerFn = Arc<dyn Fn(&SharedState) -> Option<String> + Send + Sync>;

/// A predicate over a callback description.
pub type PredicateFn = Arc<dyn Fn(&str, &SharedState) -> bool + Send + Sync>;

/// What a step does.
#[derive(Clone, Debug)]
pub enum StepAction {
    /// Send a command to the IUT.
    Device(DeviceCommand),

    /// Run a function on the main thread.
    Local {
        /// A short name, used in logs.
        name: String,

        /// The function to run.
        run: DebugIgnore<LocalFn>,
    },

    /// Run a function once the attempt has reached a terminal state, whatever the outcome.
    Cleanup {
        /// A short name, used in logs.
        name: String,

        /// The function to run.
        run: DebugIgnore<LocalFn>,
    },
}

/// A scripted step of a test case.
#[derive(Clone, Debug)]
pub struct Step {
    action: StepAction,
    before_callback: Option<u32>,
    after_callback: Option<u32>,
}

impl Step {
    /// A step sending `command` to the IUT.
    pub fn device(command: DeviceCommand) -> Self {
        Self::new(StepAction::Device(command))
    }

    /// A step running `run` on the main thread.
    pub fn local<F>(name: impl Into<String>, run: F) -> Self
    where
        F: Fn(&mut StepContext<'_>) -> Result<(), StepError> + Send + Sync + 'static,
    {
        Self::new(StepAction::Local {
            name: name.into(),
            run: DebugIgnore(Arc::new(run)),
        })
    }

    /// A cleanup step. Cleanup steps are run exactly once per attempt, after the attempt has
    /// reached a terminal state.
    pub fn cleanup<F>(name: impl Into<String>, run: F) -> Self
    where
        F: Fn(&mut StepContext<'_>) -> Result<(), StepError> + Send + Sync + 'static,
    {
        Self::new(StepAction::Cleanup {
            name: name.into(),
            run: DebugIgnore(Arc::new(run)),
        })
    }

    fn new(action: StepAction) -> Self {
        Self {
            action,
            before_callback: None,
            after_callback: None,
        }
    }

    /// Runs this step before callback `id` is answered: the listener receiving `id` holds it
    /// until this step has completed.
    pub fn before_callback(mut self, id: u32) -> Self {
        self.before_callback = Some(id);
        self
    }

    /// Runs this step only after callback `id` has been answered.
    pub fn after_callback(mut self, id: u32) -> Self {
        self.after_callback = Some(id);
        self
    }

    /// The action this step performs.
    pub fn action(&self) -> &StepAction {
        &self.action
    }

    /// The callback this step must precede, if any.
    pub fn before_callback_id(&self) -> Option<u32> {
        self.before_callback
    }

    /// The callback this step must follow, if any.
    pub fn after_callback_id(&self) -> Option<u32> {
        self.after_callback
    }

    /// Returns true if this step is ordered relative to a callback.
    pub fn is_constrained(&self) -> bool {
        self.before_callback.is_some() || self.after_callback.is_some()
    }

    /// Returns true if this is a cleanup step.
    pub fn is_cleanup(&self) -> bool {
        matches!(self.action, StepAction::Cleanup { .. })
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.action {
            StepAction::Device(command) => write!(f, "device `{command}`"),
            StepAction::Local { name, .. } => write!(f, "local `{name}`"),
            StepAction::Cleanup { name, .. } => write!(f, "cleanup `{name}`"),
        }
    }
}

/// The value returned for an edit callback.
#[derive(Clone, Debug)]
pub enum EditValue {
    /// A fixed value.
    Literal(String),

    /// A value computed from shared test state when the callback arrives. `None` means the
    /// value isn't available, which is a dispatch failure.
    Producer(DebugIgnore<ProducerFn>),
}

impl EditValue {
    /// Creates a producer.
    pub fn producer<F>(f: F) -> Self
    where
        F: Fn(&SharedState) -> Option<String> + Send + Sync + 'static,
    {
        Self::Producer(DebugIgnore(Arc::new(f)))
    }

    /// Produces the value.
    pub fn produce(&self, state: &SharedState) -> Option<String> {
        match self {
            Self::Literal(value) => Some(value.clone()),
            Self::Producer(f) => (f.0)(state),
        }
    }
}

/// A predicate that must hold over a callback's description for the test case to pass.
#[derive(Clone, Debug)]
pub enum VerifyPredicate {
    /// Every one of these strings must appear in the description.
    ContainsAll(Vec<String>),

    /// A custom predicate.
    Custom(DebugIgnore<PredicateFn>),
}

impl VerifyPredicate {
    /// Creates a custom predicate.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&str, &SharedState) -> bool + Send + Sync + 'static,
    {
        Self::Custom(DebugIgnore(Arc::new(f)))
    }

    /// Evaluates the predicate.
    pub fn check(&self, description: &str, state: &SharedState) -> bool {
        match self {
            Self::ContainsAll(needles) => needles
                .iter()
                .all(|needle| description.contains(needle.as_str())),
            Self::Custom(f) => (f.0)(description, state),
        }
    }
}

/// A tool test case started on a secondary session alongside the main one.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Companion {
    /// The index of the session to start it on (0 is the primary session).
    pub session: usize,

    /// The name of the tool test case.
    pub name: String,
}

/// A single qualification test case.
#[derive(Clone, Debug)]
pub struct TestCase {
    profile: String,
    name: String,
    steps: Vec<Step>,
    edit: BTreeMap<u32, EditValue>,
    verify: BTreeMap<u32, VerifyPredicate>,
    handlers: Option<Arc<HandlerRegistry>>,
    companions: Vec<Companion>,
}

impl TestCase {
    /// Starts building a test case.
    pub fn builder(profile: impl Into<String>, name: impl Into<String>) -> TestCaseBuilder {
        TestCaseBuilder {
            case: TestCase {
                profile: profile.into(),
                name: name.into(),
                steps: Vec::new(),
                edit: BTreeMap::new(),
                verify: BTreeMap::new(),
                handlers: None,
                companions: Vec::new(),
            },
        }
    }

    /// The unique identifier of this test case within a run: its qualification name.
    pub fn id(&self) -> &str {
        &self.name
    }

    /// The profile the test case belongs to, as the tool knows it.
    pub fn profile(&self) -> &str {
        &self.profile
    }

    /// The qualification name, e.g. `GATT/SR/GAR/BV-01-C`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Scripted steps in declared order, cleanup steps included.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// The edit value for callback `id`, if any.
    pub fn edit(&self, id: u32) -> Option<&EditValue> {
        self.edit.get(&id)
    }

    /// The verification predicate for callback `id`, if any.
    pub fn verify(&self, id: u32) -> Option<&VerifyPredicate> {
        self.verify.get(&id)
    }

    /// The generic handler registry, if any.
    pub fn handlers(&self) -> Option<&HandlerRegistry> {
        self.handlers.as_deref()
    }

    /// Companion runs on secondary sessions.
    pub fn companions(&self) -> &[Companion] {
        &self.companions
    }

    /// Returns true if `name` is this test case's name or one of its companions'.
    pub fn answers_to(&self, name: &str) -> bool {
        self.name == name || self.companions.iter().any(|companion| companion.name == name)
    }

    /// Callback ids that gate a step.
    pub fn gated_callbacks(&self) -> impl Iterator<Item = u32> + '_ {
        self.steps.iter().filter_map(Step::before_callback_id)
    }
}

/// Builds a [`TestCase`].
#[derive(Debug)]
pub struct TestCaseBuilder {
    case: TestCase,
}

impl TestCaseBuilder {
    /// Appends a step.
    pub fn step(mut self, step: Step) -> Self {
        self.case.steps.push(step);
        self
    }

    /// Appends several steps.
    pub fn steps(mut self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.case.steps.extend(steps);
        self
    }

    /// Answers callback `id` with `value`.
    pub fn edit(mut self, id: u32, value: EditValue) -> Self {
        self.case.edit.insert(id, value);
        self
    }

    /// Answers callback `id` with the result of `predicate`; a false result fails the case.
    pub fn verify(mut self, id: u32, predicate: VerifyPredicate) -> Self {
        self.case.verify.insert(id, predicate);
        self
    }

    /// Answers callbacks with no edit or verify entry from `handlers`.
    pub fn handlers(mut self, handlers: Arc<HandlerRegistry>) -> Self {
        self.case.handlers = Some(handlers);
        self
    }

    /// Starts the tool test case `name` on session `session` together with this one.
    pub fn companion(mut self, session: usize, name: impl Into<String>) -> Self {
        self.case.companions.push(Companion {
            session,
            name: name.into(),
        });
        self
    }

    /// Finishes building.
    pub fn build(self) -> TestCase {
        self.case
    }
}

/// An ordered set of test cases with unique ids.
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    cases: IndexMap<String, Arc<TestCase>>,
}

impl Catalog {
    /// Creates a catalog from test cases, rejecting duplicate ids.
    pub fn from_cases(
        cases: impl IntoIterator<Item = TestCase>,
    ) -> Result<Self, CatalogParseError> {
        let mut catalog = Self::default();
        for case in cases {
            catalog
                .insert(case)
                .map_err(|kind| CatalogParseError::new("test-case list", kind))?;
        }
        Ok(catalog)
    }

    pub(crate) fn insert(&mut self, case: TestCase) -> Result<(), CatalogParseErrorKind> {
        match self.cases.entry(case.id().to_owned()) {
            Entry::Occupied(entry) => Err(CatalogParseErrorKind::DuplicateTestCase {
                name: entry.key().clone(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(case));
                Ok(())
            }
        }
    }

    /// Returns the number of test cases.
    pub fn len(&self) -> usize {
        self.cases.len()
    }

    /// Returns true if the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// Looks up a test case by id.
    pub fn get(&self, id: &str) -> Option<&Arc<TestCase>> {
        self.cases.get(id)
    }

    /// Iterates over test cases in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<TestCase>> + '_ {
        self.cases.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_ids_are_rejected() {
        let error = Catalog::from_cases([
            TestCase::builder("GAP", "GAP/CONN/NCON/BV-01-C").build(),
            TestCase::builder("GAP", "GAP/CONN/NCON/BV-01-C").build(),
        ])
        .unwrap_err();
        assert!(matches!(
            error.kind(),
            CatalogParseErrorKind::DuplicateTestCase { name } if name == "GAP/CONN/NCON/BV-01-C"
        ));
    }

    #[test]
    fn builder() {
        let case = TestCase::builder("MESH", "MESH/NODE/CFG/BV-01-C")
            .step(Step::device(DeviceCommand::new("mesh_config_prov")))
            .step(Step::local("wait", |_| Ok(())).after_callback(13))
            .step(Step::local("bind", |_| Ok(())).before_callback(20))
            .step(Step::cleanup("reset", |_| Ok(())))
            .edit(5, EditValue::Literal("0001".to_owned()))
            .verify(6, VerifyPredicate::ContainsAll(vec!["0001".to_owned()]))
            .companion(1, "MESH/NODE/CFG/BV-01-C-LT2")
            .build();

        assert_eq!(case.id(), "MESH/NODE/CFG/BV-01-C");
        assert_eq!(case.steps().len(), 4);
        assert!(!case.steps()[0].is_constrained());
        assert!(case.steps()[1].is_constrained());
        assert!(case.steps()[3].is_cleanup());
        assert_eq!(case.gated_callbacks().collect::<Vec<_>>(), [20]);
        assert!(case.answers_to("MESH/NODE/CFG/BV-01-C-LT2"));
        assert!(!case.answers_to("MESH/NODE/CFG/BV-02-C"));

        let state = SharedState::new();
        assert_eq!(case.edit(5).unwrap().produce(&state).as_deref(), Some("0001"));
        assert!(case.verify(6).unwrap().check("address 0001", &state));
        assert!(!case.verify(6).unwrap().check("address 0002", &state));
    }

    #[test]
    fn step_display() {
        let step = Step::device(DeviceCommand::new("gap_set_conn"));
        assert_eq!(step.to_string(), "device `gap_set_conn`");
        assert_eq!(
            Step::cleanup("disconnect", |_| Ok(())).to_string(),
            "cleanup `disconnect`"
        );
    }
}
