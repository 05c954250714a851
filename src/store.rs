use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::error;

use crate::error::{Error, Result};
use crate::models::{Collection, Operation, StoredStudent, StudentRecord};

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// All student documents whose `unit` field equals `unit`, oldest first.
    async fn students_in_unit(&self, unit: &str) -> Result<Vec<StoredStudent>>;

    /// Existing grade document ids, grouped by student id.
    async fn grade_ids_for(&self, student_ids: &[String]) -> Result<BTreeMap<String, BTreeSet<String>>>;

    /// Apply every operation or none of them.
    async fn apply_chunk(&self, ops: &[Operation]) -> Result<()>;

    /// Fails with [`Error::LockHeld`] when another owner holds `key`.
    async fn acquire_lock(&self, key: &str, owner: &str) -> Result<()>;

    async fn release_lock(&self, key: &str, owner: &str) -> Result<()>;

    /// Drop a lock regardless of owner.
    async fn force_unlock(&self, key: &str) -> Result<bool>;
}

/// Decode one stored student. A document that does not fit the record shape
/// is logged and left out so the rest of the unit can still be reconciled.
pub fn stored_student(
    storage_id: String,
    created_at: Option<DateTime<Utc>>,
    raw: Map<String, Value>,
) -> Option<StoredStudent> {
    match StudentRecord::from_document(&raw) {
        Ok(record) => Some(StoredStudent {
            storage_id,
            created_at,
            record,
            raw,
        }),
        Err(e) => {
            error!(
                storage_id = %storage_id,
                error = %e,
                document = %serde_json::Value::Object(raw),
                "skipping unreadable student document"
            );
            None
        }
    }
}

#[derive(Debug, Clone)]
struct StoredDoc {
    created_at: DateTime<Utc>,
    data: Map<String, Value>,
}

#[derive(Debug, Default, Clone)]
struct MemoryState {
    students: BTreeMap<String, StoredDoc>,
    grades: BTreeMap<String, StoredDoc>,
    locks: HashMap<String, String>,
}

/// In-process store used by tests and dry runs against fixtures.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    failures: Mutex<u32>,
    chunks: Mutex<Vec<usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert_student(&self, id: &str, record: &StudentRecord, created_at: DateTime<Utc>) {
        self.state().students.insert(
            id.to_string(),
            StoredDoc {
                created_at,
                data: record.to_document(),
            },
        );
    }

    pub fn insert_student_doc(&self, id: &str, data: Map<String, Value>, created_at: DateTime<Utc>) {
        self.state()
            .students
            .insert(id.to_string(), StoredDoc { created_at, data });
    }

    pub fn insert_grade(&self, id: &str, data: Map<String, Value>) {
        self.state().grades.insert(
            id.to_string(),
            StoredDoc {
                created_at: Utc::now(),
                data,
            },
        );
    }

    pub fn student(&self, id: &str) -> Option<Map<String, Value>> {
        self.state().students.get(id).map(|d| d.data.clone())
    }

    pub fn student_ids(&self) -> Vec<String> {
        self.state().students.keys().cloned().collect()
    }

    pub fn grade_ids(&self) -> Vec<String> {
        self.state().grades.keys().cloned().collect()
    }

    pub fn lock_owner(&self, key: &str) -> Option<String> {
        self.state().locks.get(key).cloned()
    }

    /// Make the next `n` chunk applications fail with a store error.
    pub fn fail_next_chunks(&self, n: u32) {
        *self.failures.lock().unwrap_or_else(|e| e.into_inner()) = n;
    }

    /// Sizes of the chunks applied so far.
    pub fn applied_chunks(&self) -> Vec<usize> {
        self.chunks.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

fn apply_to(state: &mut MemoryState, op: &Operation) {
    let now = Utc::now();
    let docs = match op.collection() {
        Collection::Students => &mut state.students,
        Collection::Grades => &mut state.grades,
    };
    match op {
        Operation::Create { id, document, .. } => {
            let created_at = docs.get(id).map(|d| d.created_at).unwrap_or(now);
            docs.insert(
                id.clone(),
                StoredDoc {
                    created_at,
                    data: document.clone(),
                },
            );
        }
        Operation::Update { id, fields, .. } => {
            let doc = docs.entry(id.clone()).or_insert_with(|| StoredDoc {
                created_at: now,
                data: Map::new(),
            });
            for (k, v) in fields {
                doc.data.insert(k.clone(), v.clone());
            }
        }
        Operation::Delete { id, .. } => {
            docs.remove(id);
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn students_in_unit(&self, unit: &str) -> Result<Vec<StoredStudent>> {
        let state = self.state();
        let mut found: Vec<(&String, &StoredDoc)> = state
            .students
            .iter()
            .filter(|(_, d)| d.data.get("unit").and_then(Value::as_str) == Some(unit))
            .collect();
        found.sort_by(|a, b| a.1.created_at.cmp(&b.1.created_at).then_with(|| a.0.cmp(b.0)));
        Ok(found
            .into_iter()
            .filter_map(|(id, d)| stored_student(id.clone(), Some(d.created_at), d.data.clone()))
            .collect())
    }

    async fn grade_ids_for(&self, student_ids: &[String]) -> Result<BTreeMap<String, BTreeSet<String>>> {
        let wanted: BTreeSet<&str> = student_ids.iter().map(String::as_str).collect();
        let state = self.state();
        let mut out: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (id, doc) in &state.grades {
            if let Some(student) = doc.data.get("studentId").and_then(Value::as_str) {
                if wanted.contains(student) {
                    out.entry(student.to_string()).or_default().insert(id.clone());
                }
            }
        }
        Ok(out)
    }

    async fn apply_chunk(&self, ops: &[Operation]) -> Result<()> {
        {
            let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::Store("injected chunk failure".to_string()));
            }
        }
        let mut state = self.state();
        let mut next = state.clone();
        for op in ops {
            apply_to(&mut next, op);
        }
        *state = next;
        self.chunks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ops.len());
        Ok(())
    }

    async fn acquire_lock(&self, key: &str, owner: &str) -> Result<()> {
        let mut state = self.state();
        if let Some(holder) = state.locks.get(key).filter(|h| h.as_str() != owner) {
            return Err(Error::LockHeld {
                key: key.to_string(),
                owner: holder.clone(),
            });
        }
        state.locks.insert(key.to_string(), owner.to_string());
        Ok(())
    }

    async fn release_lock(&self, key: &str, owner: &str) -> Result<()> {
        let mut state = self.state();
        if state.locks.get(key).map(String::as_str) == Some(owner) {
            state.locks.remove(key);
        }
        Ok(())
    }

    async fn force_unlock(&self, key: &str) -> Result<bool> {
        Ok(self.state().locks.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => Map::new(),
        }
    }

    #[tokio::test]
    async fn students_are_scoped_by_unit() {
        let store = MemoryStore::new();
        store.insert_student_doc("a_1", doc(json!({"businessCode": "1", "unit": "a"})), Utc::now());
        store.insert_student_doc("b_1", doc(json!({"businessCode": "1", "unit": "b"})), Utc::now());
        let found = store.students_in_unit("a").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].storage_id, "a_1");
    }

    #[tokio::test]
    async fn unreadable_student_documents_are_skipped() {
        let store = MemoryStore::new();
        store.insert_student_doc("u_9", doc(json!({"businessCode": 9, "unit": "U"})), Utc::now());
        store.insert_student_doc("u_1", doc(json!({"businessCode": "1", "unit": "U", "status": "MYSTERY"})), Utc::now());
        store.insert_student_doc("u_2", doc(json!({"businessCode": "2", "unit": "U"})), Utc::now());
        let found = store.students_in_unit("U").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].storage_id, "u_2");
    }

    #[tokio::test]
    async fn updates_merge_fields() {
        let store = MemoryStore::new();
        store.insert_student_doc("a_1", doc(json!({"businessCode": "1", "unit": "a", "name": "Ana"})), Utc::now());
        store
            .apply_chunk(&[Operation::Update {
                collection: Collection::Students,
                id: "a_1".to_string(),
                fields: doc(json!({"city": "Natal"})),
            }])
            .await
            .unwrap();
        let stored = store.student("a_1").unwrap();
        assert_eq!(stored["name"], "Ana");
        assert_eq!(stored["city"], "Natal");
    }

    #[tokio::test]
    async fn failed_chunk_changes_nothing() {
        let store = MemoryStore::new();
        store.fail_next_chunks(1);
        let op = Operation::Create {
            collection: Collection::Grades,
            id: "g1".to_string(),
            document: doc(json!({"studentId": "a_1"})),
        };
        assert!(store.apply_chunk(&[op.clone()]).await.is_err());
        assert!(store.grade_ids().is_empty());
        store.apply_chunk(&[op]).await.unwrap();
        let ids = store.grade_ids_for(&["a_1".to_string()]).await.unwrap();
        assert_eq!(ids["a_1"].len(), 1);
    }

    #[tokio::test]
    async fn lock_is_exclusive_per_key() {
        let store = MemoryStore::new();
        store.acquire_lock("a:reconcile", "run-1").await.unwrap();
        let err = store.acquire_lock("a:reconcile", "run-2").await.unwrap_err();
        assert!(matches!(err, Error::LockHeld { .. }));
        store.acquire_lock("b:reconcile", "run-2").await.unwrap();
        store.release_lock("a:reconcile", "run-1").await.unwrap();
        store.acquire_lock("a:reconcile", "run-2").await.unwrap();
        assert!(store.force_unlock("a:reconcile").await.unwrap());
    }
}
