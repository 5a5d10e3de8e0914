//! Build workflow: profile → plan → synthesize → execute → validate → approve.
//!
//! A [`Session`] is the validation and retry controller. It moves through
//! [`Phase`]s, retries synthesis until the output matches the interpreter's
//! reference or the retry budget is spent, and never approves on its own:
//! persisting a project always takes an operator [`Decision`].

use super::codegen::{SynthesisContext, Synthesizer};
use super::compare::{compare, compare_example, ValidationReport, EXAMPLE_SAMPLE_ROWS};
use super::interpreter::{interpret, Interpretation};
use super::parser::{compile_plan, plan_to_yaml};
use super::profile::{profile_table, FileProfile, ProfileLimits};
use super::project::{ApprovedBuild, ProjectStore};
use super::script::Script;
use super::sheet_io::{header_from_first_row, read_sheet};
use super::table::Table;
use super::types::{CompiledPlan, TransformPlan};
use crate::collaborator::{extract_plan, Collaborator, CollaboratorError, PlanRequest};
use crate::config::RegridSettings;
use crate::error::{RegridError, Result};
use crate::sandbox::{ExecutionResult, Executor};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Analyze,
    Plan,
    Codegen,
    Execute,
    ValidateOk,
    ValidateFail,
    Approved,
    Halted,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Analyze => "analyze",
            Self::Plan => "plan",
            Self::Codegen => "codegen",
            Self::Execute => "execute",
            Self::ValidateOk => "validate_ok",
            Self::ValidateFail => "validate_fail",
            Self::Approved => "approved",
            Self::Halted => "halted",
        };
        write!(f, "{}", s)
    }
}

/// Operator decision after a successful validation.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Persist under this project name.
    Approve { project: String },
    /// Replace the plan and go back to planning.
    EditPlan(TransformPlan),
    /// Synthesize again from the same plan.
    Regenerate,
}

/// Record of one synthesis attempt.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub number: u32,
    pub script_identity: String,
    pub error: Option<String>,
}

/// Knobs the controller reads from settings.
#[derive(Debug, Clone, Copy)]
pub struct WorkflowLimits {
    pub retry_budget: u32,
    pub compare_sample_rows: usize,
    pub profile: ProfileLimits,
}

impl From<&RegridSettings> for WorkflowLimits {
    fn from(s: &RegridSettings) -> Self {
        Self {
            retry_budget: s.retry_budget.max(1),
            compare_sample_rows: s.compare_sample_rows,
            profile: s.profile_limits(),
        }
    }
}

pub struct Session {
    phase: Phase,
    limits: WorkflowLimits,
    synthesizer: Arc<dyn Synthesizer>,
    executor: Executor,
    collaborator: Option<Arc<dyn Collaborator>>,

    input: Option<PathBuf>,
    raw: Option<Table>,
    profile: Option<FileProfile>,
    example: Option<(Table, FileProfile)>,
    instructions: String,
    plan_feedback: Vec<String>,
    plan: Option<CompiledPlan>,

    codegen_feedback: Vec<String>,
    attempts: Vec<Attempt>,
    script: Option<Script>,
    execution: Option<ExecutionResult>,
    report: Option<ValidationReport>,
    last_error: Option<String>,
}

impl Session {
    pub fn new(
        limits: WorkflowLimits,
        synthesizer: Arc<dyn Synthesizer>,
        executor: Executor,
        collaborator: Option<Arc<dyn Collaborator>>,
    ) -> Self {
        Self {
            phase: Phase::Analyze,
            limits,
            synthesizer,
            executor,
            collaborator,
            input: None,
            raw: None,
            profile: None,
            example: None,
            instructions: String::new(),
            plan_feedback: Vec::new(),
            plan: None,
            codegen_feedback: Vec::new(),
            attempts: Vec::new(),
            script: None,
            execution: None,
            report: None,
            last_error: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn profile(&self) -> Option<&FileProfile> {
        self.profile.as_ref()
    }

    pub fn example(&self) -> Option<&FileProfile> {
        self.example.as_ref().map(|(_, profile)| profile)
    }

    pub fn plan(&self) -> Option<&CompiledPlan> {
        self.plan.as_ref()
    }

    pub fn script(&self) -> Option<&Script> {
        self.script.as_ref()
    }

    pub fn report(&self) -> Option<&ValidationReport> {
        self.report.as_ref()
    }

    pub fn execution(&self) -> Option<&ExecutionResult> {
        self.execution.as_ref()
    }

    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn transition(&mut self, to: Phase) {
        if self.phase != to {
            tracing::info!(from = %self.phase, to = %to, "phase");
            self.phase = to;
        }
    }

    fn require(&self, allowed: &[Phase], operation: &str) -> Result<()> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(RegridError::Phase(format!(
                "cannot {} in phase {}",
                operation, self.phase
            )))
        }
    }

    fn reset_generation(&mut self) {
        self.codegen_feedback.clear();
        self.attempts.clear();
        self.script = None;
        self.execution = None;
        self.report = None;
        self.last_error = None;
    }

    // ========================================================================
    // ANALYZE → PLAN
    // ========================================================================

    /// Profile the first sheet of the input file.
    pub fn analyze(&mut self, path: &Path) -> Result<&FileProfile> {
        self.require(&[Phase::Analyze, Phase::Plan], "analyze")?;
        let data = read_sheet(path, None).map_err(RegridError::Profile)?;
        if data.table.is_empty() {
            return Err(RegridError::Profile(format!(
                "sheet '{}' of {} contains no data",
                data.sheet_name,
                path.display()
            )));
        }
        let profile = profile_table(
            &path.display().to_string(),
            &data.sheet_name,
            &data.sheet_names,
            &data.table,
            &self.limits.profile,
        );
        tracing::info!(file = %path.display(), rows = profile.total_rows, "analyzed");
        self.input = Some(path.to_path_buf());
        self.raw = Some(data.table);
        self.plan = None;
        self.plan_feedback.clear();
        self.reset_generation();
        self.transition(Phase::Plan);
        Ok(self.profile.insert(profile))
    }

    /// Load an example of the desired output. Its profile goes to the
    /// collaborator with plan requests and every script output is compared
    /// with it.
    pub fn set_example(&mut self, path: &Path) -> Result<&FileProfile> {
        self.require(&[Phase::Analyze, Phase::Plan], "set an example output")?;
        let data = read_sheet(path, None).map_err(RegridError::Profile)?;
        let profile = profile_table(
            &path.display().to_string(),
            &data.sheet_name,
            &data.sheet_names,
            &data.table,
            &self.limits.profile,
        );
        let example = header_from_first_row(data.table);
        if example.columns.is_empty() {
            return Err(RegridError::Profile(format!(
                "example output {} has no header row",
                path.display()
            )));
        }
        tracing::info!(file = %path.display(), rows = example.len(), "example output loaded");
        self.reset_generation();
        let (_, profile) = self.example.insert((example, profile));
        Ok(profile)
    }

    // ========================================================================
    // PLAN
    // ========================================================================

    /// Use an operator-written plan. Invalid plans leave the session in
    /// PLAN with every offending step listed.
    pub fn set_plan(&mut self, plan: TransformPlan) -> Result<&CompiledPlan> {
        self.require(&[Phase::Plan], "set a plan")?;
        let compiled =
            compile_plan(&plan, self.profile.as_ref()).map_err(RegridError::PlanSchema)?;
        self.reset_generation();
        tracing::info!(steps = compiled.steps.len(), declarative = compiled.is_declarative(), "plan accepted");
        Ok(self.plan.insert(compiled))
    }

    /// Ask the collaborator for a plan.
    pub async fn request_plan(&mut self, instructions: &str) -> Result<&CompiledPlan> {
        self.require(&[Phase::Plan], "request a plan")?;
        self.instructions = instructions.to_string();
        self.plan_feedback.clear();
        self.ask_for_plan(None).await
    }

    /// Ask the collaborator to revise the current plan.
    pub async fn revise_plan(&mut self, feedback: &str) -> Result<&CompiledPlan> {
        self.require(&[Phase::Plan], "revise the plan")?;
        let current = match &self.plan {
            Some(p) => Some(plan_to_yaml(&p.plan).map_err(RegridError::Store)?),
            None => None,
        };
        self.plan_feedback.push(feedback.to_string());
        self.ask_for_plan(current).await
    }

    async fn ask_for_plan(&mut self, current_plan: Option<String>) -> Result<&CompiledPlan> {
        let collaborator = self.collaborator.clone().ok_or_else(|| {
            CollaboratorError::Unavailable("no collaborator configured".to_string())
        })?;
        let profile = self
            .profile
            .clone()
            .ok_or_else(|| RegridError::Phase("no profile".to_string()))?;
        let mut request = PlanRequest::new(vec![profile.clone()], self.instructions.clone());
        request.feedback = self.plan_feedback.clone();
        request.current_plan = current_plan;
        request.example = self.example().cloned();
        let response = collaborator.author_plan(&request).await?;
        let compiled = extract_plan(&response, Some(&profile))?;
        self.reset_generation();
        tracing::info!(steps = compiled.steps.len(), "plan received from collaborator");
        Ok(self.plan.insert(compiled))
    }

    /// Interpret the plan on the analyzed input.
    pub fn preview(&self) -> Result<Interpretation> {
        let (Some(plan), Some(raw)) = (&self.plan, &self.raw) else {
            return Err(RegridError::Phase("preview needs an analyzed file and a plan".to_string()));
        };
        interpret(plan, raw.clone())
    }

    // ========================================================================
    // CODEGEN → EXECUTE → VALIDATE
    // ========================================================================

    /// Synthesize, execute and validate until the output matches or the
    /// retry budget is spent. Ends in VALIDATE_OK or HALTED.
    pub async fn generate(&mut self) -> Result<&ValidationReport> {
        self.require(&[Phase::Plan, Phase::Codegen], "generate")?;
        let entry_phase = self.phase;
        let (Some(plan), Some(raw), Some(input)) =
            (self.plan.clone(), self.raw.clone(), self.input.clone())
        else {
            return Err(RegridError::Phase("generate needs an analyzed file and a plan".to_string()));
        };

        // A failing declarative prefix is a plan problem, not a codegen one.
        let reference = interpret(&plan, raw.clone())?;
        let reference_table = (!reference.is_partial()).then_some(reference.table);
        let custom_steps = plan.custom_steps();

        loop {
            self.transition(Phase::Codegen);
            let ctx = SynthesisContext {
                input: Some(&raw),
                feedback: &self.codegen_feedback,
            };
            let script = match self.synthesizer.synthesize(&plan, &ctx).await {
                Ok(s) => s,
                Err(e) => {
                    self.transition(entry_phase);
                    return Err(e);
                }
            };

            self.transition(Phase::Execute);
            let number = self.attempts.len() as u32 + 1;
            tracing::info!(attempt = number, identity = %script.identity, "executing script");
            let (execution, failure) = match self.executor.execute(&script, &input, None).await {
                Ok(execution) => {
                    let failure = match (&execution.table, execution.to_error()) {
                        (_, Some(err)) => Some(err),
                        (Some(output), None) => {
                            let mut report = compare(
                                reference_table.as_ref(),
                                output,
                                self.limits.compare_sample_rows,
                                &custom_steps,
                            );
                            report.example = self
                                .example
                                .as_ref()
                                .map(|(example, _)| compare_example(example, output, EXAMPLE_SAMPLE_ROWS));
                            let matched = report.is_match();
                            self.report = Some(report.clone());
                            (!matched).then(|| RegridError::CodegenMismatch(Box::new(report)))
                        }
                        (None, None) => Some(RegridError::ExecutorRuntime {
                            code: execution.exit_code,
                            stderr: "no output table".to_string(),
                        }),
                    };
                    (Some(execution), failure)
                }
                // Spawn failures count as a failed attempt.
                Err(e) if e.is_retryable() => (None, Some(e)),
                Err(e) => {
                    tracing::warn!(error = %e, "script could not be executed");
                    self.transition(entry_phase);
                    return Err(e);
                }
            };

            self.attempts.push(Attempt {
                number,
                script_identity: script.identity.clone(),
                error: failure.as_ref().map(|e| e.to_string()),
            });
            self.script = Some(script);
            self.execution = execution;

            let Some(err) = failure else {
                self.last_error = None;
                self.transition(Phase::ValidateOk);
                return self
                    .report
                    .as_ref()
                    .ok_or_else(|| RegridError::Phase("no validation report".to_string()));
            };

            self.transition(Phase::ValidateFail);
            let detail = err.to_string();
            self.last_error = Some(detail.clone());
            if number >= self.limits.retry_budget {
                tracing::warn!(attempts = number, error = %detail, "retry budget exhausted");
                self.transition(Phase::Halted);
                return Err(err);
            }
            tracing::warn!(attempt = number, budget = self.limits.retry_budget, error = %detail, "validation failed, retrying");
            self.codegen_feedback
                .push(format!("attempt {} failed: {}", number, detail));
        }
    }

    // ========================================================================
    // Operator decision
    // ========================================================================

    /// Apply an operator decision. `Approve` returns the project directory.
    /// `EditPlan` is also accepted after the session halted.
    pub fn decide(&mut self, decision: Decision, store: &ProjectStore) -> Result<Option<PathBuf>> {
        match decision {
            Decision::Approve { project } => {
                self.require(&[Phase::ValidateOk], "approve")?;
                let (Some(plan), Some(script), Some(profile), Some(report)) =
                    (&self.plan, &self.script, &self.profile, &self.report)
                else {
                    return Err(RegridError::Phase("nothing to approve".to_string()));
                };
                let output = self
                    .execution
                    .as_ref()
                    .and_then(|e| e.table.as_ref())
                    .ok_or_else(|| RegridError::Phase("no validated output".to_string()))?;
                let dir = store.save(&ApprovedBuild {
                    name: &project,
                    plan,
                    script,
                    output,
                    profile,
                    report,
                })?;
                self.transition(Phase::Approved);
                Ok(Some(dir))
            }
            Decision::EditPlan(plan) => {
                self.require(&[Phase::ValidateOk, Phase::Halted], "edit the plan")?;
                self.transition(Phase::Plan);
                self.reset_generation();
                self.set_plan(plan)?;
                Ok(None)
            }
            Decision::Regenerate => {
                self.require(&[Phase::ValidateOk], "regenerate")?;
                self.reset_generation();
                self.transition(Phase::Codegen);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::parse_plan;
    use crate::core::sheet_io::write_table;
    use crate::provenance::hasher::hash_string;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Hands out prepared script bodies in order; the last one repeats.
    struct Scripted {
        bodies: Mutex<VecDeque<String>>,
        feedback_seen: Mutex<Vec<Vec<String>>>,
    }

    impl Scripted {
        fn new(bodies: &[String]) -> Arc<Self> {
            Arc::new(Self {
                bodies: Mutex::new(bodies.iter().cloned().collect()),
                feedback_seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.feedback_seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Synthesizer for Scripted {
        async fn synthesize(&self, _: &CompiledPlan, ctx: &SynthesisContext<'_>) -> Result<Script> {
            self.feedback_seen.lock().unwrap().push(ctx.feedback.to_vec());
            let mut bodies = self.bodies.lock().unwrap();
            let text = if bodies.len() > 1 {
                bodies.pop_front().unwrap_or_default()
            } else {
                bodies.front().cloned().unwrap_or_default()
            };
            Ok(Script {
                identity: hash_string(&text),
                text,
                lines: Vec::new(),
            })
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        input: PathBuf,
        good: String,
        wrong: String,
    }

    /// Input sheet plus two prebuilt workbooks: the expected output of
    /// `HEADER_PLAN` and a wrong one.
    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("stock.csv");
        std::fs::write(&input, "name,qty\nCola,3\nFanta,2\n").unwrap();
        let good_path = dir.path().join("good.xlsx");
        write_table(
            &good_path,
            &Table::from_strings(&["name", "qty"], &[&["Cola", "3"], &["Fanta", "2"]]),
        )
        .unwrap();
        let wrong_path = dir.path().join("wrong.xlsx");
        write_table(
            &wrong_path,
            &Table::from_strings(&["name", "qty"], &[&["Cola", "3"], &["Fanta", "20"]]),
        )
        .unwrap();
        Fixture {
            good: format!("cp '{}' \"$2\"\n", good_path.display()),
            wrong: format!("cp '{}' \"$2\"\n", wrong_path.display()),
            dir,
            input,
        }
    }

    const HEADER_PLAN: &str = "steps:\n  - {step: 1, action: set_header_row, params: {row_index: 0}}\n";

    fn session(synth: Arc<Scripted>, timeout: Duration) -> Session {
        let limits = WorkflowLimits::from(&RegridSettings::default());
        Session::new(
            limits,
            synth,
            Executor::new(timeout, Some(PathBuf::from("/bin/false"))),
            None,
        )
    }

    fn planned(synth: Arc<Scripted>, fx: &Fixture, timeout: Duration) -> Session {
        let mut s = session(synth, timeout);
        s.analyze(&fx.input).unwrap();
        s.set_plan(parse_plan(HEADER_PLAN).unwrap()).unwrap();
        s
    }

    #[tokio::test]
    async fn test_match_then_approve() {
        let fx = fixture();
        let mut s = planned(Scripted::new(&[fx.good.clone()]), &fx, Duration::from_secs(20));
        assert_eq!(s.phase(), Phase::Plan);
        let report = s.generate().await.unwrap();
        assert!(report.is_match());
        assert_eq!(s.phase(), Phase::ValidateOk);
        assert_eq!(s.attempts().len(), 1);

        let store = ProjectStore::new(fx.dir.path().join("projects"));
        let dir = s
            .decide(Decision::Approve { project: "stock".into() }, &store)
            .unwrap()
            .unwrap();
        assert!(dir.join("transform.sh").exists());
        assert_eq!(s.phase(), Phase::Approved);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_halts_with_last_error() {
        let fx = fixture();
        let synth = Scripted::new(&[fx.wrong.clone()]);
        let mut s = planned(synth.clone(), &fx, Duration::from_secs(20));
        let err = s.generate().await.unwrap_err();
        assert!(matches!(err, RegridError::CodegenMismatch(_)));
        assert!(err.to_string().contains("row 1 column 'qty': got '20', expected '2'"));
        assert_eq!(s.phase(), Phase::Halted);
        assert_eq!(s.attempts().len(), 3);
        assert_eq!(synth.calls(), 3);
        assert_eq!(s.last_error(), Some(err.to_string().as_str()));
        // Feedback grows with each failed attempt.
        let seen = synth.feedback_seen.lock().unwrap();
        assert_eq!(seen[0].len(), 0);
        assert_eq!(seen[2].len(), 2);
        assert!(seen[1][0].starts_with("attempt 1 failed"));
    }

    #[tokio::test]
    async fn test_timeout_then_recovery() {
        let fx = fixture();
        let spin = "while true; do sleep 0.1; done\n".to_string();
        let synth = Scripted::new(&[spin, fx.good.clone()]);
        let mut s = planned(synth.clone(), &fx, Duration::from_millis(500));
        let report = s.generate().await.unwrap();
        assert!(report.is_match());
        assert_eq!(s.attempts().len(), 2);
        assert!(s.attempts()[0]
            .error
            .as_ref()
            .unwrap()
            .contains("execution timeout"));
    }

    #[tokio::test]
    async fn test_runtime_failure_feedback() {
        let fx = fixture();
        let fail = "echo 'step 1 (promote_header) failed: boom' >&2; exit 1\n".to_string();
        let synth = Scripted::new(&[fail, fx.good.clone()]);
        let mut s = planned(synth.clone(), &fx, Duration::from_secs(20));
        s.generate().await.unwrap();
        let seen = synth.feedback_seen.lock().unwrap();
        assert!(seen[1][0].contains("boom"));
    }

    #[test]
    fn test_invalid_plan_stays_in_plan() {
        let fx = fixture();
        let mut s = session(Scripted::new(&[fx.good.clone()]), Duration::from_secs(5));
        s.analyze(&fx.input).unwrap();
        let bad = parse_plan(
            "steps:\n  - {step: 1, action: set_header_row, params: {row_index: 0}}\n  - {step: 2, action: rename_columns, params: {mapping: {price: cost}}}\n  - {step: 4, action: explode, params: {}}\n",
        )
        .unwrap();
        match s.set_plan(bad).unwrap_err() {
            RegridError::PlanSchema(issues) => assert!(issues.len() >= 2),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(s.phase(), Phase::Plan);
        assert!(s.plan().is_none());
    }

    #[tokio::test]
    async fn test_phase_guards() {
        let fx = fixture();
        let mut s = session(Scripted::new(&[fx.good.clone()]), Duration::from_secs(5));
        assert!(matches!(s.generate().await, Err(RegridError::Phase(_))));
        let store = ProjectStore::new(fx.dir.path());
        assert!(matches!(
            s.decide(Decision::Regenerate, &store),
            Err(RegridError::Phase(_))
        ));
        s.analyze(&fx.input).unwrap();
        assert!(matches!(s.generate().await, Err(RegridError::Phase(_))));
    }

    #[tokio::test]
    async fn test_unreadable_input_restores_phase() {
        let fx = fixture();
        let synth = Scripted::new(&[fx.good.clone()]);
        let mut s = planned(synth.clone(), &fx, Duration::from_secs(20));
        let saved = std::fs::read(&fx.input).unwrap();
        std::fs::remove_file(&fx.input).unwrap();

        let err = s.generate().await.unwrap_err();
        assert!(matches!(err, RegridError::Profile(_)), "{}", err);
        assert_eq!(s.phase(), Phase::Plan);
        assert!(s.attempts().is_empty());

        std::fs::write(&fx.input, saved).unwrap();
        assert!(s.generate().await.unwrap().is_match());
        assert_eq!(s.phase(), Phase::ValidateOk);
        assert_eq!(synth.calls(), 2);
    }

    #[tokio::test]
    async fn test_approve_existing_name_keeps_session() {
        let fx = fixture();
        let store = ProjectStore::new(fx.dir.path().join("projects"));
        let mut first = planned(Scripted::new(&[fx.good.clone()]), &fx, Duration::from_secs(20));
        first.generate().await.unwrap();
        first
            .decide(Decision::Approve { project: "stock".into() }, &store)
            .unwrap();

        let mut second = planned(Scripted::new(&[fx.good.clone()]), &fx, Duration::from_secs(20));
        second.generate().await.unwrap();
        let err = second
            .decide(Decision::Approve { project: "stock".into() }, &store)
            .unwrap_err();
        assert!(matches!(err, RegridError::Store(_)));
        assert_eq!(second.phase(), Phase::ValidateOk);
        let dir = second
            .decide(Decision::Approve { project: "stock-2".into() }, &store)
            .unwrap()
            .unwrap();
        assert!(dir.ends_with("stock-2"));
    }

    #[tokio::test]
    async fn test_collaborator_error_leaves_phase() {
        let fx = fixture();
        let mut s = session(Scripted::new(&[fx.good.clone()]), Duration::from_secs(5));
        s.analyze(&fx.input).unwrap();
        let err = s.request_plan("one row per product").await.unwrap_err();
        assert!(matches!(err, RegridError::Collaborator(_)));
        assert_eq!(s.phase(), Phase::Plan);
    }

    #[tokio::test]
    async fn test_regenerate_and_edit_plan() {
        let fx = fixture();
        let synth = Scripted::new(&[fx.good.clone()]);
        let mut s = planned(synth.clone(), &fx, Duration::from_secs(20));
        let store = ProjectStore::new(fx.dir.path().join("projects"));
        s.generate().await.unwrap();

        s.decide(Decision::Regenerate, &store).unwrap();
        assert_eq!(s.phase(), Phase::Codegen);
        assert!(s.attempts().is_empty());
        s.generate().await.unwrap();
        assert_eq!(synth.calls(), 2);

        let edited = parse_plan(
            "steps:\n  - {step: 1, action: set_header_row, params: {row_index: 0}}\n  - {step: 2, action: filter, params: {condition: {column: qty, op: gt, value: 2}}}\n",
        )
        .unwrap();
        s.decide(Decision::EditPlan(edited), &store).unwrap();
        assert_eq!(s.phase(), Phase::Plan);
        assert_eq!(s.plan().unwrap().steps.len(), 2);
        assert_eq!(s.preview().unwrap().table.len(), 1);
    }

    #[tokio::test]
    async fn test_custom_plan_is_partially_checked() {
        let fx = fixture();
        let mut s = session(Scripted::new(&[fx.wrong.clone()]), Duration::from_secs(20));
        s.analyze(&fx.input).unwrap();
        s.set_plan(
            parse_plan(
                "steps:\n  - {step: 1, action: set_header_row, params: {row_index: 0}}\n  - {step: 2, action: custom, params: {logic: scale quantities}}\n",
            )
            .unwrap(),
        )
        .unwrap();
        let report = s.generate().await.unwrap();
        assert!(report.is_partial());
        assert_eq!(s.phase(), Phase::ValidateOk);
    }

    const CUSTOM_PLAN: &str = "steps:\n  - {step: 1, action: set_header_row, params: {row_index: 0}}\n  - {step: 2, action: custom, params: {logic: scale quantities}}\n";

    #[tokio::test]
    async fn test_example_output_decides_custom_plan() {
        let fx = fixture();
        let example = fx.dir.path().join("example.csv");
        std::fs::write(&example, "Name,QTY\nCola,3\nFanta,2\n").unwrap();
        let synth = Scripted::new(&[fx.wrong.clone(), fx.good.clone()]);
        let mut s = session(synth.clone(), Duration::from_secs(20));
        s.analyze(&fx.input).unwrap();
        assert_eq!(s.set_example(&example).unwrap().total_rows, 3);
        s.set_plan(parse_plan(CUSTOM_PLAN).unwrap()).unwrap();

        let report = s.generate().await.unwrap();
        assert!(report.is_partial());
        assert!(report.example.as_ref().unwrap().agrees());
        assert_eq!(s.attempts().len(), 2);
        let seen = synth.feedback_seen.lock().unwrap();
        assert!(seen[1][0].contains("got '20', example has '2'"), "{:?}", seen[1]);
    }

    #[tokio::test]
    async fn test_example_output_is_advisory_with_full_reference() {
        let fx = fixture();
        let example = fx.dir.path().join("example.csv");
        std::fs::write(&example, "name,qty,price\nCola,3,1.5\n").unwrap();
        let synth = Scripted::new(&[fx.good.clone()]);
        let mut s = session(synth.clone(), Duration::from_secs(20));
        s.analyze(&fx.input).unwrap();
        s.set_example(&example).unwrap();
        s.set_plan(parse_plan(HEADER_PLAN).unwrap()).unwrap();

        let report = s.generate().await.unwrap();
        assert!(report.is_match());
        let example = report.example.as_ref().unwrap();
        assert_eq!(example.missing_columns, vec!["price"]);
        assert!(report.to_string().contains("example columns missing: price"));
        assert_eq!(synth.calls(), 1);
    }

    #[test]
    fn test_example_without_header_rejected() {
        let fx = fixture();
        let empty = fx.dir.path().join("empty.csv");
        std::fs::write(&empty, "").unwrap();
        let mut s = session(Scripted::new(&[fx.good.clone()]), Duration::from_secs(5));
        assert!(matches!(s.set_example(&empty), Err(RegridError::Profile(_))));
        assert!(s.example().is_none());
    }

    /// Answers plan requests with canned responses and records what it was asked.
    struct Canned {
        responses: Mutex<VecDeque<String>>,
        requests: Mutex<Vec<PlanRequest>>,
    }

    #[async_trait]
    impl Collaborator for Canned {
        async fn author_plan(&self, request: &PlanRequest) -> std::result::Result<String, CollaboratorError> {
            self.requests.lock().unwrap().push(request.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| CollaboratorError::Unavailable("no more answers".to_string()))
        }

        async fn author_step_code(
            &self,
            _: &crate::collaborator::CodeRequest,
        ) -> std::result::Result<String, CollaboratorError> {
            Err(CollaboratorError::Unavailable("plans only".to_string()))
        }
    }

    #[tokio::test]
    async fn test_request_then_revise_plan() {
        let fx = fixture();
        let canned = Arc::new(Canned {
            responses: Mutex::new(VecDeque::from(vec![
                format!("Here is the plan:\n```yaml\n{}```\n", HEADER_PLAN),
                "steps:\n  - {step: 1, action: set_header_row, params: {row_index: 0}}\n  - {step: 2, action: rename_columns, params: {mapping: {qty: quantity}}}\n".to_string(),
                "not a plan".to_string(),
            ])),
            requests: Mutex::new(Vec::new()),
        });
        let limits = WorkflowLimits::from(&RegridSettings::default());
        let mut s = Session::new(
            limits,
            Scripted::new(&[fx.good.clone()]),
            Executor::new(Duration::from_secs(5), Some(PathBuf::from("/bin/false"))),
            Some(canned.clone() as Arc<dyn Collaborator>),
        );
        s.analyze(&fx.input).unwrap();
        let example = fx.dir.path().join("example.csv");
        std::fs::write(&example, "name,quantity\nCola,3\n").unwrap();
        s.set_example(&example).unwrap();

        assert_eq!(s.request_plan("one row per product").await.unwrap().steps.len(), 1);
        let revised = s.revise_plan("call the column quantity").await.unwrap();
        assert_eq!(revised.steps.len(), 2);
        assert_eq!(s.preview().unwrap().table.columns, vec!["name", "quantity"]);

        let err = s.revise_plan("again").await.unwrap_err();
        assert!(matches!(err, RegridError::Collaborator(CollaboratorError::Malformed(_))));
        assert_eq!(s.plan().unwrap().steps.len(), 2);
        assert_eq!(s.phase(), Phase::Plan);

        let requests = canned.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert!(requests[0].current_plan.is_none());
        let sent = requests[0].example.as_ref().unwrap();
        assert!(sent.file_path.ends_with("example.csv"));
        assert_eq!(sent.total_rows, 2);
        assert_eq!(requests[1].instructions, "one row per product");
        assert_eq!(requests[1].feedback, vec!["call the column quantity"]);
        assert!(requests[1].current_plan.as_deref().unwrap().contains("set_header_row"));
    }
}
