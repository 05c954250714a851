use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::curriculum::{self, MatrixIndex};
use crate::error::Result;
use crate::history::{self, StatusPolicy, StudentHistory, STUDENT_CODE_COLUMNS};
use crate::models::{Collection, EnrollmentEntry, GradeEntry, Operation, StoredStudent, StudentRecord};
use crate::parser::Row;
use crate::store::DocumentStore;

const NAME_COLUMNS: &[&str] = &["NOME", "NOME_ALUNO"];
const BIRTH_COLUMNS: &[&str] = &["DATA_NASCIMENTO", "DT_NASCIMENTO", "NASCIMENTO", "DT_NASC"];
const SEX_COLUMNS: &[&str] = &["SEXO"];
const NATIONALITY_COLUMNS: &[&str] = &["NACIONALIDADE"];
const ADDRESS_COLUMNS: &[&str] = &["ENDERECO", "LOGRADOURO"];
const NEIGHBORHOOD_COLUMNS: &[&str] = &["BAIRRO"];
const CITY_COLUMNS: &[&str] = &["CIDADE", "MUNICIPIO"];
const STATE_COLUMNS: &[&str] = &["UF", "ESTADO"];
const POSTAL_CODE_COLUMNS: &[&str] = &["CEP"];
const MOTHER_COLUMNS: &[&str] = &["NOME_MAE", "MAE"];
const FATHER_COLUMNS: &[&str] = &["NOME_PAI", "PAI"];
const PHONE_COLUMNS: &[&str] = &["TELEFONE", "FONE", "CELULAR", "TEL_RESPONSAVEL"];
const EMAIL_COLUMNS: &[&str] = &["EMAIL", "EMAIL_RESPONSAVEL"];

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ScopedKey {
    pub unit: String,
    pub business_code: String,
}

/// Lower-case ASCII slug used in canonical storage ids.
pub fn unit_slug(unit: &str) -> String {
    let slug: String = crate::translate::fold(unit)
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    slug.split('-')
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

pub fn canonical_id(unit: &str, business_code: &str) -> String {
    format!("{}_{}", unit_slug(unit), business_code.trim())
}

fn normalize_date(raw: &str) -> String {
    let raw = raw.trim();
    let date_part = raw.split_whitespace().next().unwrap_or(raw);
    for fmt in ["%d/%m/%Y", "%Y-%m-%d", "%d-%m-%Y", "%d.%m.%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(date_part, fmt) {
            return date.format("%Y-%m-%d").to_string();
        }
    }
    raw.to_string()
}

fn text(row: &Row, aliases: &[&str]) -> Option<String> {
    row.get_any(aliases).map(str::to_string)
}

/// Demographic fields of one legacy student row.
pub fn legacy_student(row: &Row, unit: &str) -> Option<StudentRecord> {
    let business_code = row.get_any(STUDENT_CODE_COLUMNS)?.to_string();
    Some(StudentRecord {
        business_code,
        unit: unit.to_string(),
        name: text(row, NAME_COLUMNS),
        birth_date: row.get_any(BIRTH_COLUMNS).map(normalize_date),
        sex: row.get_any(SEX_COLUMNS).map(|s| s.to_uppercase()),
        nationality: text(row, NATIONALITY_COLUMNS),
        address: text(row, ADDRESS_COLUMNS),
        neighborhood: text(row, NEIGHBORHOOD_COLUMNS),
        city: text(row, CITY_COLUMNS),
        state: row.get_any(STATE_COLUMNS).map(|s| s.to_uppercase()),
        postal_code: text(row, POSTAL_CODE_COLUMNS),
        mother_name: text(row, MOTHER_COLUMNS),
        father_name: text(row, FATHER_COLUMNS),
        guardian_phone: text(row, PHONE_COLUMNS),
        guardian_email: row.get_any(EMAIL_COLUMNS).map(|s| s.to_lowercase()),
        ..Default::default()
    })
}

fn fill(target: &mut Option<String>, value: &Option<String>) {
    if let Some(v) = value.as_ref().filter(|v| !v.trim().is_empty()) {
        *target = Some(v.clone());
    }
}

/// Copy every populated legacy field onto `target`; absent ones are left
/// alone.
fn overlay_demographics(target: &mut StudentRecord, legacy: &StudentRecord) {
    fill(&mut target.name, &legacy.name);
    fill(&mut target.birth_date, &legacy.birth_date);
    fill(&mut target.sex, &legacy.sex);
    fill(&mut target.nationality, &legacy.nationality);
    fill(&mut target.address, &legacy.address);
    fill(&mut target.neighborhood, &legacy.neighborhood);
    fill(&mut target.city, &legacy.city);
    fill(&mut target.state, &legacy.state);
    fill(&mut target.postal_code, &legacy.postal_code);
    fill(&mut target.mother_name, &legacy.mother_name);
    fill(&mut target.father_name, &legacy.father_name);
    fill(&mut target.guardian_phone, &legacy.guardian_phone);
    fill(&mut target.guardian_email, &legacy.guardian_email);
}

/// Year-keyed merge: legacy entries replace stored entries for the same year,
/// stored years the legacy data does not mention are kept.
fn merge_history(stored: &[EnrollmentEntry], legacy: &[EnrollmentEntry]) -> Vec<EnrollmentEntry> {
    let mut by_year: BTreeMap<String, EnrollmentEntry> = stored
        .iter()
        .map(|e| (e.year.clone(), e.clone()))
        .collect();
    for entry in legacy {
        by_year.insert(entry.year.clone(), entry.clone());
    }
    let mut merged: Vec<EnrollmentEntry> = by_year.into_values().collect();
    history::sort_history(&mut merged);
    merged
}

fn apply_history(target: &mut StudentRecord, legacy: Option<&StudentHistory>, policy: StatusPolicy) {
    if let Some(h) = legacy {
        target.enrollment_history = merge_history(&target.enrollment_history, &h.history);
        target.enrolled_years.extend(h.enrolled_years.iter().cloned());
    }
    target
        .enrolled_years
        .extend(target.enrollment_history.iter().map(|e| e.year.clone()));
    target.sync_snapshot();

    if target.admin_status.is_some() {
        return;
    }
    // Without any history there is nothing to infer from, so a stored status
    // is left untouched.
    if !target.enrollment_history.is_empty() || target.status.is_none() {
        target.status = Some(history::derive_status(&target.enrollment_history, None, policy));
    }
}

fn is_empty_value(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub storage_id: String,
    pub business_code: String,
    pub field: String,
    pub before: Value,
    pub after: Value,
}

/// Fields of `target` that differ from `stored`. Empty target values are
/// never emitted.
pub fn diff_fields(
    storage_id: &str,
    business_code: &str,
    stored: &Map<String, Value>,
    target: &Map<String, Value>,
) -> (Map<String, Value>, Vec<FieldChange>) {
    let mut fields = Map::new();
    let mut changes = Vec::new();
    for (key, after) in target {
        if is_empty_value(after) {
            continue;
        }
        let before = stored.get(key).cloned().unwrap_or(Value::Null);
        if &before == after {
            continue;
        }
        fields.insert(key.clone(), after.clone());
        changes.push(FieldChange {
            storage_id: storage_id.to_string(),
            business_code: business_code.to_string(),
            field: key.clone(),
            before,
            after: after.clone(),
        });
    }
    (fields, changes)
}

/// Top-level fields copied from the newest history entry.
const SNAPSHOT_FIELDS: &[&str] = &["gradeLevel", "gradeLevelCode", "shift", "schoolClass"];

/// Snapshot fields are derived from history, so when the newest entry has no
/// value for one of them the stored value is stale and gets cleared.
fn clear_stale_snapshot(
    storage_id: &str,
    business_code: &str,
    stored: &Map<String, Value>,
    target: &Map<String, Value>,
    fields: &mut Map<String, Value>,
    changes: &mut Vec<FieldChange>,
) {
    if target.get("enrollmentHistory").map_or(true, is_empty_value) {
        return;
    }
    for key in SNAPSHOT_FIELDS {
        if !target.get(*key).map_or(true, is_empty_value) {
            continue;
        }
        let Some(before) = stored.get(*key).filter(|v| !is_empty_value(v)) else {
            continue;
        };
        fields.insert(key.to_string(), Value::Null);
        changes.push(FieldChange {
            storage_id: storage_id.to_string(),
            business_code: business_code.to_string(),
            field: key.to_string(),
            before: before.clone(),
            after: Value::Null,
        });
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Deletion {
    pub collection: Collection,
    pub storage_id: String,
    pub business_code: String,
    pub survivor: String,
    pub before: Value,
}

#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub unit: String,
    pub operations: Vec<Operation>,
    pub changes: Vec<FieldChange>,
    pub deletions: Vec<Deletion>,
    pub students_created: usize,
    pub students_updated: usize,
    pub students_unchanged: usize,
    pub grades_created: usize,
    /// Enrollment codes with neither a student row nor a stored record.
    pub orphan_enrollments: Vec<String>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub students: Vec<StoredStudent>,
    /// Grade document ids per student storage id.
    pub grade_ids: BTreeMap<String, BTreeSet<String>>,
}

pub async fn load_snapshot(store: &dyn DocumentStore, unit: &str) -> Result<StoreSnapshot> {
    let students = store.students_in_unit(unit).await?;
    let ids: Vec<String> = students.iter().map(|s| s.storage_id.clone()).collect();
    let grade_ids = if ids.is_empty() {
        BTreeMap::new()
    } else {
        store.grade_ids_for(&ids).await?
    };
    debug!(unit, students = students.len(), "loaded store snapshot");
    Ok(StoreSnapshot {
        students,
        grade_ids,
    })
}

pub struct Reconciler<'a> {
    pub unit: &'a str,
    pub policy: StatusPolicy,
    pub matrices: Option<&'a MatrixIndex>,
}

impl<'a> Reconciler<'a> {
    pub fn new(unit: &'a str, policy: StatusPolicy) -> Self {
        Self {
            unit,
            policy,
            matrices: None,
        }
    }

    pub fn with_matrices(mut self, matrices: &'a MatrixIndex) -> Self {
        self.matrices = Some(matrices);
        self
    }

    fn key(&self, business_code: &str) -> ScopedKey {
        ScopedKey {
            unit: self.unit.to_string(),
            business_code: business_code.trim().to_string(),
        }
    }

    /// Pick the survivor among records sharing one scoped key. A record with
    /// the canonical id wins, otherwise the oldest one.
    fn resolve_duplicates<'s>(
        &self,
        key: &ScopedKey,
        mut matches: Vec<&'s StoredStudent>,
        snapshot: &StoreSnapshot,
        deletions: &mut Vec<Deletion>,
        ops: &mut Vec<Operation>,
    ) -> &'s StoredStudent {
        matches.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.storage_id.cmp(&b.storage_id))
        });
        if matches.len() == 1 {
            return matches[0];
        }

        let ids: Vec<&str> = matches.iter().map(|m| m.storage_id.as_str()).collect();
        warn!(
            unit = %key.unit,
            business_code = %key.business_code,
            ids = ?ids,
            "several stored records share one business key"
        );

        let canonical = canonical_id(&key.unit, &key.business_code);
        let survivor_idx = matches
            .iter()
            .position(|m| m.storage_id == canonical)
            .unwrap_or(0);
        let survivor = matches[survivor_idx];

        for (idx, dup) in matches.iter().enumerate() {
            if idx == survivor_idx {
                continue;
            }
            let before = Value::Object(dup.raw.clone());
            warn!(
                business_code = %key.business_code,
                storage_id = %dup.storage_id,
                survivor = %survivor.storage_id,
                before = %before,
                "deleting duplicate student record"
            );
            deletions.push(Deletion {
                collection: Collection::Students,
                storage_id: dup.storage_id.clone(),
                business_code: key.business_code.clone(),
                survivor: survivor.storage_id.clone(),
                before,
            });
            ops.push(Operation::Delete {
                collection: Collection::Students,
                id: dup.storage_id.clone(),
            });

            for grade_id in snapshot.grade_ids.get(&dup.storage_id).into_iter().flatten() {
                warn!(
                    storage_id = %grade_id,
                    student = %dup.storage_id,
                    "deleting grade document of duplicate student"
                );
                deletions.push(Deletion {
                    collection: Collection::Grades,
                    storage_id: grade_id.clone(),
                    business_code: key.business_code.clone(),
                    survivor: survivor.storage_id.clone(),
                    before: Value::Null,
                });
                ops.push(Operation::Delete {
                    collection: Collection::Grades,
                    id: grade_id.clone(),
                });
            }
        }
        survivor
    }

    fn grade_operations(
        &self,
        storage_id: &str,
        record: &StudentRecord,
        existing: Option<&BTreeSet<String>>,
    ) -> Vec<Operation> {
        let Some(current) = record.enrollment_history.first() else {
            return Vec::new();
        };
        curriculum::subjects_for(self.matrices, current)
            .into_iter()
            .filter_map(|subject| {
                let id = GradeEntry::document_id(storage_id, &subject, &current.year);
                if existing.is_some_and(|ids| ids.contains(&id)) {
                    return None;
                }
                let entry = GradeEntry::empty(storage_id, &subject, &current.year);
                let document = match serde_json::to_value(&entry) {
                    Ok(Value::Object(map)) => map,
                    _ => return None,
                };
                Some(Operation::Create {
                    collection: Collection::Grades,
                    id,
                    document,
                })
            })
            .collect()
    }

    /// Compute the write set for one unit. Deletions come first, then student
    /// writes, then grade documents.
    pub fn plan(
        &self,
        student_rows: &[Row],
        histories: &BTreeMap<String, StudentHistory>,
        snapshot: &StoreSnapshot,
    ) -> Plan {
        let mut plan = Plan {
            unit: self.unit.to_string(),
            ..Default::default()
        };

        let mut legacy: BTreeMap<ScopedKey, StudentRecord> = BTreeMap::new();
        for row in student_rows {
            let Some(record) = legacy_student(row, self.unit) else {
                continue;
            };
            let key = self.key(&record.business_code);
            match legacy.get_mut(&key) {
                Some(existing) => {
                    debug!(business_code = %key.business_code, line = row.line, "repeated student row, merging");
                    overlay_demographics(existing, &record);
                }
                None => {
                    legacy.insert(key, record);
                }
            }
        }

        let mut stored: BTreeMap<ScopedKey, Vec<&StoredStudent>> = BTreeMap::new();
        for s in &snapshot.students {
            if s.record.unit != self.unit {
                warn!(storage_id = %s.storage_id, unit = %s.record.unit, expected = %self.unit, "ignoring stored record from another unit");
                continue;
            }
            stored.entry(self.key(&s.record.business_code)).or_default().push(s);
        }

        let mut keys: BTreeSet<ScopedKey> = legacy.keys().cloned().collect();
        for code in histories.keys() {
            let key = self.key(code);
            if stored.contains_key(&key) {
                keys.insert(key);
            } else if !legacy.contains_key(&key) {
                plan.orphan_enrollments.push(code.clone());
            }
        }
        if !plan.orphan_enrollments.is_empty() {
            warn!(
                count = plan.orphan_enrollments.len(),
                "enrollment rows for students missing from both the student dump and the store"
            );
        }

        let mut deletes = Vec::new();
        let mut student_ops = Vec::new();
        let mut grade_ops = Vec::new();

        for key in keys {
            let legacy_record = legacy.get(&key);
            let legacy_history = histories.get(&key.business_code);

            match stored.remove(&key) {
                Some(matches) => {
                    let survivor = self.resolve_duplicates(&key, matches, snapshot, &mut plan.deletions, &mut deletes);

                    let mut target = survivor.record.clone();
                    if let Some(l) = legacy_record {
                        overlay_demographics(&mut target, l);
                    }
                    apply_history(&mut target, legacy_history, self.policy);

                    let target_doc = target.to_document();
                    let (mut fields, mut changes) = diff_fields(
                        &survivor.storage_id,
                        &key.business_code,
                        &survivor.raw,
                        &target_doc,
                    );
                    clear_stale_snapshot(
                        &survivor.storage_id,
                        &key.business_code,
                        &survivor.raw,
                        &target_doc,
                        &mut fields,
                        &mut changes,
                    );
                    if fields.is_empty() {
                        plan.students_unchanged += 1;
                    } else {
                        for c in &changes {
                            info!(
                                storage_id = %c.storage_id,
                                business_code = %c.business_code,
                                field = %c.field,
                                before = %c.before,
                                after = %c.after,
                                "field change"
                            );
                        }
                        plan.students_updated += 1;
                        plan.changes.extend(changes);
                        student_ops.push(Operation::Update {
                            collection: Collection::Students,
                            id: survivor.storage_id.clone(),
                            fields,
                        });
                    }

                    grade_ops.extend(self.grade_operations(
                        &survivor.storage_id,
                        &target,
                        snapshot.grade_ids.get(&survivor.storage_id),
                    ));
                }
                None => {
                    let Some(l) = legacy_record else {
                        continue;
                    };
                    let storage_id = canonical_id(self.unit, &key.business_code);
                    let mut record = l.clone();
                    apply_history(&mut record, legacy_history, self.policy);
                    info!(storage_id = %storage_id, business_code = %key.business_code, "new student");
                    plan.students_created += 1;
                    grade_ops.extend(self.grade_operations(
                        &storage_id,
                        &record,
                        snapshot.grade_ids.get(&storage_id),
                    ));
                    student_ops.push(Operation::Create {
                        collection: Collection::Students,
                        id: storage_id,
                        document: record.to_document(),
                    });
                }
            }
        }

        plan.grades_created = grade_ops.len();
        plan.operations = deletes;
        plan.operations.extend(student_ops);
        plan.operations.extend(grade_ops);
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Segment, Shift, Status};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    const POLICY: StatusPolicy = StatusPolicy {
        current_year: 2026,
        recent_window: 2,
    };

    fn row(cols: &[(&str, &str)]) -> Row {
        Row {
            table: None,
            line: 1,
            fields: cols.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    fn stored(id: &str, record: StudentRecord, secs: i64) -> StoredStudent {
        StoredStudent {
            storage_id: id.to_string(),
            created_at: Some(Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()),
            raw: record.to_document(),
            record,
        }
    }

    fn record(unit: &str, code: &str, name: Option<&str>) -> StudentRecord {
        StudentRecord {
            business_code: code.to_string(),
            unit: unit.to_string(),
            name: name.map(str::to_string),
            status: Some(Status::Inactive),
            ..Default::default()
        }
    }

    fn entry(year: &str, code: &str, segment: Segment) -> EnrollmentEntry {
        EnrollmentEntry {
            year: year.to_string(),
            unit: "Boa Vista".to_string(),
            grade_level: format!("grade {code}"),
            grade_level_code: Some(code.to_string()),
            segment: Some(segment),
            school_class: "A".to_string(),
            shift: Shift::Morning,
            shift_inferred: false,
            status: Status::Enrolled,
        }
    }

    #[test]
    fn canonical_ids_use_unit_slug() {
        assert_eq!(canonical_id("Boa Vista", "1001"), "boa-vista_1001");
        assert_eq!(canonical_id("Unidade São José / Centro", " 7 "), "unidade-sao-jose-centro_7");
    }

    #[test]
    fn legacy_dates_are_normalized() {
        let r = legacy_student(
            &row(&[("CODIGO", "1"), ("DATA_NASCIMENTO", "05/03/2012 00:00:00"), ("EMAIL", "A@X.COM")]),
            "u",
        )
        .unwrap();
        assert_eq!(r.birth_date.as_deref(), Some("2012-03-05"));
        assert_eq!(r.guardian_email.as_deref(), Some("a@x.com"));
    }

    #[test]
    fn empty_legacy_fields_never_clear_stored_values() {
        let mut current = record("Boa Vista", "1", Some("Ana Souza"));
        current.city = Some("Natal".to_string());
        let snapshot = StoreSnapshot {
            students: vec![stored("boa-vista_1", current, 0)],
            ..Default::default()
        };
        let rows = vec![row(&[("CODIGO", "1"), ("NOME", ""), ("CIDADE", "Parnamirim")])];
        let plan = Reconciler::new("Boa Vista", POLICY).plan(&rows, &BTreeMap::new(), &snapshot);

        assert_eq!(plan.students_updated, 1);
        assert_eq!(plan.changes.len(), 1);
        assert_eq!(plan.changes[0].field, "city");
        assert_eq!(plan.changes[0].before, json!("Natal"));
        match &plan.operations[0] {
            Operation::Update { fields, .. } => {
                assert!(!fields.contains_key("name"));
                assert_eq!(fields["city"], "Parnamirim");
            }
            other => panic!("unexpected operation {other:?}"),
        }
    }

    #[test]
    fn same_code_in_other_unit_is_not_matched() {
        let snapshot = StoreSnapshot {
            students: vec![stored("centro_1", record("Centro", "1", Some("Outra Pessoa")), 0)],
            ..Default::default()
        };
        let rows = vec![row(&[("CODIGO", "1"), ("NOME", "Ana Souza")])];
        let plan = Reconciler::new("Boa Vista", POLICY).plan(&rows, &BTreeMap::new(), &snapshot);
        assert_eq!(plan.students_created, 1);
        assert!(plan
            .operations
            .iter()
            .all(|op| op.id() != "centro_1"));
    }

    #[test]
    fn duplicates_keep_canonical_record_and_delete_the_rest() {
        let snapshot = StoreSnapshot {
            students: vec![
                stored("x9f3", record("Boa Vista", "1", Some("Ana")), 0),
                stored("boa-vista_1", record("Boa Vista", "1", Some("Ana")), 10),
                stored("k2l1", record("Boa Vista", "1", Some("Ana")), 20),
            ],
            grade_ids: [(
                "k2l1".to_string(),
                ["k2l1_matematica_2026".to_string()].into_iter().collect(),
            )]
            .into_iter()
            .collect(),
        };
        let rows = vec![row(&[("CODIGO", "1"), ("NOME", "Ana")])];
        let plan = Reconciler::new("Boa Vista", POLICY).plan(&rows, &BTreeMap::new(), &snapshot);

        let student_deletes: Vec<&Deletion> = plan
            .deletions
            .iter()
            .filter(|d| d.collection == Collection::Students)
            .collect();
        assert_eq!(student_deletes.len(), 2);
        assert!(student_deletes.iter().all(|d| d.survivor == "boa-vista_1"));
        assert!(student_deletes.iter().all(|d| d.before.is_object()));
        assert!(matches!(&plan.operations[0], Operation::Delete { id, .. } if id == "x9f3"));
        assert!(plan
            .operations
            .iter()
            .any(|op| matches!(op, Operation::Delete { id, .. } if id == "k2l1_matematica_2026")));
        assert!(plan.operations.iter().all(|op| op.id() != "boa-vista_1" || !matches!(op, Operation::Delete { .. })));
    }

    #[test]
    fn oldest_duplicate_survives_without_canonical_id() {
        let snapshot = StoreSnapshot {
            students: vec![
                stored("b", record("Boa Vista", "1", None), 5),
                stored("a", record("Boa Vista", "1", None), 1),
            ],
            ..Default::default()
        };
        let plan = Reconciler::new("Boa Vista", POLICY).plan(
            &[row(&[("CODIGO", "1")])],
            &BTreeMap::new(),
            &snapshot,
        );
        assert_eq!(plan.deletions.len(), 1);
        assert_eq!(plan.deletions[0].storage_id, "b");
        assert_eq!(plan.deletions[0].survivor, "a");
    }

    #[test]
    fn new_students_get_grades_except_early_childhood() {
        let histories: BTreeMap<String, StudentHistory> = [
            (
                "1".to_string(),
                StudentHistory {
                    business_code: "1".to_string(),
                    history: vec![entry("2026", "7A", Segment::ElementaryII)],
                    enrolled_years: ["2026".to_string()].into_iter().collect(),
                },
            ),
            (
                "2".to_string(),
                StudentHistory {
                    business_code: "2".to_string(),
                    history: vec![entry("2026", "N4", Segment::EarlyChildhood)],
                    enrolled_years: ["2026".to_string()].into_iter().collect(),
                },
            ),
        ]
        .into_iter()
        .collect();
        let rows = vec![row(&[("CODIGO", "1")]), row(&[("CODIGO", "2")])];
        let plan = Reconciler::new("Boa Vista", POLICY).plan(&rows, &histories, &StoreSnapshot::default());

        assert_eq!(plan.students_created, 2);
        let expected = curriculum::subjects_for_segment(Segment::ElementaryII).len();
        assert_eq!(plan.grades_created, expected);
        assert!(plan
            .operations
            .iter()
            .filter(|op| op.collection() == Collection::Grades)
            .all(|op| op.id().starts_with("boa-vista_1_")));

        let created = plan
            .operations
            .iter()
            .find_map(|op| match op {
                Operation::Create { id, document, .. } if id == "boa-vista_1" => Some(document),
                _ => None,
            })
            .unwrap();
        assert_eq!(created["gradeLevelCode"], "7A");
        assert_eq!(created["status"], "ENROLLED");
    }

    #[test]
    fn admin_status_is_never_rewritten() {
        let mut current = record("Boa Vista", "1", Some("Ana"));
        current.admin_status = Some(Status::Suspended);
        current.status = Some(Status::Suspended);
        let snapshot = StoreSnapshot {
            students: vec![stored("boa-vista_1", current, 0)],
            ..Default::default()
        };
        let histories: BTreeMap<String, StudentHistory> = [(
            "1".to_string(),
            StudentHistory {
                business_code: "1".to_string(),
                history: vec![entry("2020", "9A", Segment::ElementaryII)],
                enrolled_years: ["2020".to_string()].into_iter().collect(),
            },
        )]
        .into_iter()
        .collect();
        let plan = Reconciler::new("Boa Vista", POLICY).plan(&[], &histories, &snapshot);
        assert!(plan.changes.iter().all(|c| c.field != "status" && c.field != "adminStatus"));
        assert!(plan.changes.iter().any(|c| c.field == "enrollmentHistory"));
    }

    #[test]
    fn stored_history_years_are_preserved() {
        let mut current = record("Boa Vista", "1", Some("Ana"));
        current.enrollment_history = vec![entry("2022", "5A", Segment::ElementaryI)];
        current.enrolled_years = ["2022".to_string()].into_iter().collect();
        let snapshot = StoreSnapshot {
            students: vec![stored("boa-vista_1", current, 0)],
            ..Default::default()
        };
        let histories: BTreeMap<String, StudentHistory> = [(
            "1".to_string(),
            StudentHistory {
                business_code: "1".to_string(),
                history: vec![entry("2025", "8A", Segment::ElementaryII)],
                enrolled_years: ["2025".to_string()].into_iter().collect(),
            },
        )]
        .into_iter()
        .collect();
        let plan = Reconciler::new("Boa Vista", POLICY).plan(&[], &histories, &snapshot);
        let Operation::Update { fields, .. } = &plan.operations[0] else {
            panic!("expected an update");
        };
        let years: Vec<&str> = fields["enrollmentHistory"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["year"].as_str().unwrap())
            .collect();
        assert_eq!(years, vec!["2025", "2022"]);
        assert_eq!(fields["gradeLevelCode"], "8A");
        assert_eq!(fields["enrolledYears"], json!(["2022", "2025"]));
    }

    #[test]
    fn enrollments_without_any_student_are_reported() {
        let histories: BTreeMap<String, StudentHistory> = [(
            "99".to_string(),
            StudentHistory {
                business_code: "99".to_string(),
                history: vec![entry("2026", "7A", Segment::ElementaryII)],
                enrolled_years: ["2026".to_string()].into_iter().collect(),
            },
        )]
        .into_iter()
        .collect();
        let plan = Reconciler::new("Boa Vista", POLICY).plan(&[], &histories, &StoreSnapshot::default());
        assert!(plan.is_empty());
        assert_eq!(plan.orphan_enrollments, vec!["99".to_string()]);
    }

    #[test]
    fn snapshot_fields_follow_newest_entry_even_when_empty() {
        let mut current = record("Boa Vista", "1", Some("Ana"));
        current.enrollment_history = vec![EnrollmentEntry {
            school_class: "B".to_string(),
            ..entry("2024", "6A", Segment::ElementaryII)
        }];
        current.enrolled_years = ["2024".to_string()].into_iter().collect();
        current.sync_snapshot();
        let stored_doc = stored("boa-vista_1", current, 0);
        let snapshot = StoreSnapshot {
            students: vec![stored_doc.clone()],
            ..Default::default()
        };
        let special = EnrollmentEntry {
            year: "2026".to_string(),
            unit: "Boa Vista".to_string(),
            grade_level: "Turma Especial".to_string(),
            grade_level_code: None,
            segment: None,
            school_class: String::new(),
            shift: Shift::Morning,
            shift_inferred: false,
            status: Status::Enrolled,
        };
        let histories: BTreeMap<String, StudentHistory> = [(
            "1".to_string(),
            StudentHistory {
                business_code: "1".to_string(),
                history: vec![special],
                enrolled_years: ["2026".to_string()].into_iter().collect(),
            },
        )]
        .into_iter()
        .collect();

        let reconciler = Reconciler::new("Boa Vista", POLICY);
        let plan = reconciler.plan(&[], &histories, &snapshot);
        let Operation::Update { fields, .. } = &plan.operations[0] else {
            panic!("expected an update");
        };
        assert_eq!(fields["gradeLevel"], "Turma Especial");
        assert_eq!(fields["gradeLevelCode"], Value::Null);
        assert_eq!(fields["schoolClass"], Value::Null);
        assert!(plan
            .changes
            .iter()
            .any(|c| c.field == "schoolClass" && c.before == json!("B")));

        let mut raw = stored_doc.raw.clone();
        for (k, v) in fields {
            raw.insert(k.clone(), v.clone());
        }
        let applied = StoredStudent {
            storage_id: "boa-vista_1".to_string(),
            created_at: stored_doc.created_at,
            record: StudentRecord::from_document(&raw).unwrap(),
            raw,
        };
        let again = reconciler.plan(
            &[],
            &histories,
            &StoreSnapshot {
                students: vec![applied],
                ..Default::default()
            },
        );
        assert!(again.is_empty(), "{:?}", again.operations);
    }

    #[test]
    fn grades_are_created_for_older_latest_enrollment() {
        let histories: BTreeMap<String, StudentHistory> = [(
            "1".to_string(),
            StudentHistory {
                business_code: "1".to_string(),
                history: vec![entry("2019", "3A", Segment::ElementaryI)],
                enrolled_years: ["2019".to_string()].into_iter().collect(),
            },
        )]
        .into_iter()
        .collect();
        let plan = Reconciler::new("Boa Vista", POLICY).plan(
            &[row(&[("CODIGO", "1")])],
            &histories,
            &StoreSnapshot::default(),
        );
        let expected = curriculum::subjects_for_segment(Segment::ElementaryI).len();
        assert_eq!(plan.grades_created, expected);
        assert!(plan
            .operations
            .iter()
            .filter(|op| op.collection() == Collection::Grades)
            .all(|op| op.id().ends_with("_2019")));
    }
}
