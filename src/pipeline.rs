use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::curriculum::MatrixIndex;
use crate::error::Result;
use crate::history::{self, StudentHistory, STUDENT_CODE_COLUMNS};
use crate::parser::{self, DumpFormat, ParseOptions, ParseReport};
use crate::reconcile::{self, Plan, Reconciler};
use crate::store::DocumentStore;
use crate::translate;
use crate::writer::{self, WriteSummary, WriterOptions};

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub unit: String,
    pub students_file: PathBuf,
    pub enrollments_file: Option<PathBuf>,
    pub format: DumpFormat,
    pub strict_encoding: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedInputs {
    pub students: ParseReport,
    pub enrollments: Option<ParseReport>,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub plan: Plan,
    /// None for dry runs and for plans with nothing to write.
    pub write: Option<WriteSummary>,
}

pub fn lock_key(unit: &str) -> String {
    format!("{}:reconcile", reconcile::unit_slug(unit))
}

pub fn parse_inputs(config: &Config, request: &RunRequest) -> Result<ParsedInputs> {
    let options = ParseOptions {
        format: request.format,
        encoding: config.encoding,
        strict_encoding: request.strict_encoding,
        key_columns: STUDENT_CODE_COLUMNS.iter().map(|c| c.to_string()).collect(),
    };

    let students = parser::parse_file(&request.students_file, &options)?;
    info!(
        path = %request.students_file.display(),
        rows = students.rows.len(),
        skipped = students.skipped.len(),
        "parsed student dump"
    );

    let enrollments = match &request.enrollments_file {
        Some(path) => {
            let report = parser::parse_file(path, &options)?;
            info!(
                path = %path.display(),
                rows = report.rows.len(),
                skipped = report.skipped.len(),
                "parsed enrollment dump"
            );
            Some(report)
        }
        None => None,
    };

    Ok(ParsedInputs {
        students,
        enrollments,
    })
}

/// Build the plan for `unit` and, when `apply` is set, commit it. An apply
/// run holds the unit's run lock from before the store is read until the
/// write ends.
pub async fn execute(
    store: &dyn DocumentStore,
    config: &Config,
    unit: &str,
    inputs: &ParsedInputs,
    apply: bool,
) -> Result<RunOutcome> {
    config.validate()?;

    let matrices = match &config.matrix_file {
        Some(path) => Some(MatrixIndex::load(path)?),
        None => None,
    };

    let histories = match &inputs.enrollments {
        Some(report) => history::aggregate(&report.rows, unit, config.default_shift),
        None => Default::default(),
    };

    if !apply {
        let plan = build_plan(store, config, unit, inputs, &histories, matrices.as_ref()).await?;
        return Ok(RunOutcome { plan, write: None });
    }

    let key = lock_key(unit);
    let owner = Uuid::new_v4().to_string();
    store.acquire_lock(&key, &owner).await?;
    info!(lock = %key, owner = %owner, "run lock acquired");

    let outcome = plan_and_write(store, config, unit, inputs, &histories, matrices.as_ref()).await;

    if let Err(e) = store.release_lock(&key, &owner).await {
        warn!(lock = %key, error = %e, "failed to release run lock");
    }
    outcome
}

async fn plan_and_write(
    store: &dyn DocumentStore,
    config: &Config,
    unit: &str,
    inputs: &ParsedInputs,
    histories: &BTreeMap<String, StudentHistory>,
    matrices: Option<&MatrixIndex>,
) -> Result<RunOutcome> {
    let plan = build_plan(store, config, unit, inputs, histories, matrices).await?;
    if plan.is_empty() {
        return Ok(RunOutcome { plan, write: None });
    }
    let summary = writer::write_operations(store, &plan.operations, WriterOptions::from(config)).await;
    Ok(RunOutcome {
        plan,
        write: Some(summary),
    })
}

async fn build_plan(
    store: &dyn DocumentStore,
    config: &Config,
    unit: &str,
    inputs: &ParsedInputs,
    histories: &BTreeMap<String, StudentHistory>,
    matrices: Option<&MatrixIndex>,
) -> Result<Plan> {
    let snapshot = reconcile::load_snapshot(store, unit).await?;
    let mut reconciler = Reconciler::new(unit, config.status_policy());
    if let Some(m) = matrices {
        reconciler = reconciler.with_matrices(m);
    }
    let plan = reconciler.plan(&inputs.students.rows, histories, &snapshot);
    info!(
        operations = plan.operations.len(),
        created = plan.students_created,
        updated = plan.students_updated,
        deleted = plan.deletions.len(),
        mappings = translate::MAPPING_VERSION,
        "reconciliation plan ready"
    );
    Ok(plan)
}
