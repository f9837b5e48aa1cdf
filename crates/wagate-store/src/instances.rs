use chrono::Utc;
use serde::Serialize;
use tracing::instrument;

use wagate_core::{ConnectionStatus, InstanceId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const COLUMNS: &str = "id, name, api_key, webhook_url, transcription_enabled, typing_delay_min,
                       typing_delay_max, status, phone, created_at, updated_at";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub name: String,
    pub api_key: String,
    pub webhook_url: Option<String>,
    pub transcription_enabled: bool,
    pub typing_delay_min: u32,
    pub typing_delay_max: u32,
    pub status: ConnectionStatus,
    pub phone: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Clone, Debug)]
pub struct NewInstance {
    pub name: String,
    pub api_key: String,
    pub transcription_enabled: bool,
    pub typing_delay_min: u32,
    pub typing_delay_max: u32,
}

/// Full replacement of the tunable settings of an instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstanceConfigUpdate {
    pub transcription_enabled: bool,
    pub typing_delay_min: u32,
    pub typing_delay_max: u32,
}

#[derive(Clone)]
pub struct InstanceRepo {
    db: Database,
}

impl InstanceRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a new instance. Fails with `Conflict` if the name or key is taken.
    #[instrument(skip(self, new), fields(instance = %new.name))]
    pub fn create(&self, new: &NewInstance) -> Result<InstanceRecord, StoreError> {
        let id = InstanceId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO instances (id, name, api_key, transcription_enabled, typing_delay_min,
                                        typing_delay_max, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'disconnected', ?7, ?7)",
                rusqlite::params![
                    id.as_str(),
                    new.name,
                    new.api_key,
                    new.transcription_enabled,
                    new.typing_delay_min,
                    new.typing_delay_max,
                    now,
                ],
            )?;

            Ok(InstanceRecord {
                id,
                name: new.name.clone(),
                api_key: new.api_key.clone(),
                webhook_url: None,
                transcription_enabled: new.transcription_enabled,
                typing_delay_min: new.typing_delay_min,
                typing_delay_max: new.typing_delay_max,
                status: ConnectionStatus::Disconnected,
                phone: None,
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(instance_id = %id))]
    pub fn get(&self, id: &InstanceId) -> Result<InstanceRecord, StoreError> {
        self.query_one("id", id.as_str())?
            .ok_or_else(|| StoreError::NotFound(format!("instance {id}")))
    }

    #[instrument(skip(self))]
    pub fn get_by_name(&self, name: &str) -> Result<Option<InstanceRecord>, StoreError> {
        self.query_one("name", name)
    }

    /// All instances, oldest first.
    pub fn list(&self) -> Result<Vec<InstanceRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM instances ORDER BY created_at ASC, id ASC"
            ))?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_instance(row)?);
            }
            Ok(results)
        })
    }

    /// Like `list`, but a row that fails to decode is returned as an error in
    /// its slot instead of failing the whole query.
    pub fn list_each(&self) -> Result<Vec<Result<InstanceRecord, StoreError>>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM instances ORDER BY created_at ASC, id ASC"
            ))?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_instance(row));
            }
            Ok(results)
        })
    }

    /// Idempotent: deleting an unknown id is not an error.
    #[instrument(skip(self), fields(instance_id = %id))]
    pub fn delete(&self, id: &InstanceId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM instances WHERE id = ?1", [id.as_str()])?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(instance_id = %id))]
    pub fn update_webhook(&self, id: &InstanceId, url: Option<&str>) -> Result<(), StoreError> {
        self.update(id, "webhook_url = ?1", rusqlite::params![url])
    }

    #[instrument(skip(self), fields(instance_id = %id))]
    pub fn update_config(&self, id: &InstanceId, config: &InstanceConfigUpdate) -> Result<(), StoreError> {
        self.update(
            id,
            "transcription_enabled = ?1, typing_delay_min = ?2, typing_delay_max = ?3",
            rusqlite::params![
                config.transcription_enabled,
                config.typing_delay_min,
                config.typing_delay_max
            ],
        )
    }

    #[instrument(skip(self), fields(instance_id = %id, status = %status))]
    pub fn update_status(
        &self,
        id: &InstanceId,
        status: ConnectionStatus,
        phone: Option<&str>,
    ) -> Result<(), StoreError> {
        self.update(
            id,
            "status = ?1, phone = ?2",
            rusqlite::params![status.as_str(), phone],
        )
    }

    #[instrument(skip(self, api_key), fields(instance_id = %id))]
    pub fn update_api_key(&self, id: &InstanceId, api_key: &str) -> Result<(), StoreError> {
        self.update(id, "api_key = ?1", rusqlite::params![api_key])
    }

    fn query_one(&self, column: &'static str, value: &str) -> Result<Option<InstanceRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM instances WHERE {column} = ?1"))?;
            let mut rows = stmt.query([value])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_instance(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Runs `UPDATE instances SET <assignments>, updated_at = ? WHERE id = ?`.
    /// Assignment placeholders must be numbered from ?1.
    fn update(
        &self,
        id: &InstanceId,
        assignments: &str,
        params: &[&dyn rusqlite::types::ToSql],
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let n = params.len();
        let sql = format!(
            "UPDATE instances SET {assignments}, updated_at = ?{} WHERE id = ?{}",
            n + 1,
            n + 2
        );
        let mut all: Vec<&dyn rusqlite::types::ToSql> = params.to_vec();
        all.push(&now);
        let id_str = id.as_str();
        all.push(&id_str);

        self.db.with_conn(|conn| {
            let changed = conn.execute(&sql, all.as_slice())?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("instance {id}")));
            }
            Ok(())
        })
    }
}

fn row_to_instance(row: &rusqlite::Row<'_>) -> Result<InstanceRecord, StoreError> {
    let status: String = row_helpers::get(row, 7, "instances", "status")?;

    Ok(InstanceRecord {
        id: InstanceId::from_raw(row_helpers::get::<String>(row, 0, "instances", "id")?),
        name: row_helpers::get(row, 1, "instances", "name")?,
        api_key: row_helpers::get(row, 2, "instances", "api_key")?,
        webhook_url: row_helpers::get_opt(row, 3, "instances", "webhook_url")?,
        transcription_enabled: row_helpers::get_flag(row, 4, "instances", "transcription_enabled")?,
        typing_delay_min: row_helpers::get(row, 5, "instances", "typing_delay_min")?,
        typing_delay_max: row_helpers::get(row, 6, "instances", "typing_delay_max")?,
        status: row_helpers::parse_enum(&status, "instances", "status")?,
        phone: row_helpers::get_opt(row, 8, "instances", "phone")?,
        created_at: row_helpers::get(row, 9, "instances", "created_at")?,
        updated_at: row_helpers::get(row, 10, "instances", "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> InstanceRepo {
        InstanceRepo::new(Database::in_memory().unwrap())
    }

    fn new_instance(name: &str) -> NewInstance {
        NewInstance {
            name: name.into(),
            api_key: format!("key-{name}"),
            transcription_enabled: true,
            typing_delay_min: 1000,
            typing_delay_max: 3000,
        }
    }

    #[test]
    fn create_and_get() {
        let repo = repo();
        let created = repo.create(&new_instance("s1")).unwrap();
        assert!(created.id.as_str().starts_with("inst_"));
        assert_eq!(created.status, ConnectionStatus::Disconnected);

        let fetched = repo.get(&created.id).unwrap();
        assert_eq!(fetched, created);
    }

    #[test]
    fn duplicate_name_conflicts() {
        let repo = repo();
        repo.create(&new_instance("s1")).unwrap();
        let mut dup = new_instance("s1");
        dup.api_key = "other".into();
        assert!(matches!(repo.create(&dup), Err(StoreError::Conflict(_))));
    }

    #[test]
    fn get_by_name_absent_is_none() {
        let repo = repo();
        assert!(repo.get_by_name("ghost").unwrap().is_none());
        repo.create(&new_instance("s1")).unwrap();
        assert_eq!(repo.get_by_name("s1").unwrap().unwrap().name, "s1");
    }

    #[test]
    fn get_unknown_id_is_not_found() {
        let repo = repo();
        let err = repo.get(&InstanceId::from_raw("inst_missing")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn list_preserves_creation_order() {
        let repo = repo();
        for name in ["a", "b", "c"] {
            repo.create(&new_instance(name)).unwrap();
        }
        let names: Vec<_> = repo.list().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn update_status_and_phone() {
        let repo = repo();
        let rec = repo.create(&new_instance("s1")).unwrap();
        repo.update_status(&rec.id, ConnectionStatus::Connected, Some("5511999999999"))
            .unwrap();

        let fetched = repo.get(&rec.id).unwrap();
        assert_eq!(fetched.status, ConnectionStatus::Connected);
        assert_eq!(fetched.phone.as_deref(), Some("5511999999999"));

        repo.update_status(&rec.id, ConnectionStatus::Disconnected, None).unwrap();
        assert_eq!(repo.get(&rec.id).unwrap().phone, None);
    }

    #[test]
    fn update_webhook_set_and_clear() {
        let repo = repo();
        let rec = repo.create(&new_instance("s1")).unwrap();
        repo.update_webhook(&rec.id, Some("http://hooks.local/in")).unwrap();
        assert_eq!(
            repo.get(&rec.id).unwrap().webhook_url.as_deref(),
            Some("http://hooks.local/in")
        );
        repo.update_webhook(&rec.id, None).unwrap();
        assert!(repo.get(&rec.id).unwrap().webhook_url.is_none());
    }

    #[test]
    fn update_config_replaces_all_fields() {
        let repo = repo();
        let rec = repo.create(&new_instance("s1")).unwrap();
        let config = InstanceConfigUpdate {
            transcription_enabled: false,
            typing_delay_min: 200,
            typing_delay_max: 400,
        };
        repo.update_config(&rec.id, &config).unwrap();

        let fetched = repo.get(&rec.id).unwrap();
        assert!(!fetched.transcription_enabled);
        assert_eq!((fetched.typing_delay_min, fetched.typing_delay_max), (200, 400));
    }

    #[test]
    fn update_unknown_is_not_found() {
        let repo = repo();
        let err = repo
            .update_webhook(&InstanceId::from_raw("inst_missing"), None)
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn api_key_rotation_persists() {
        let repo = repo();
        let rec = repo.create(&new_instance("s1")).unwrap();
        repo.update_api_key(&rec.id, "fresh").unwrap();
        assert_eq!(repo.get(&rec.id).unwrap().api_key, "fresh");
    }

    #[test]
    fn delete_is_idempotent() {
        let repo = repo();
        let rec = repo.create(&new_instance("s1")).unwrap();
        repo.delete(&rec.id).unwrap();
        repo.delete(&rec.id).unwrap();
        assert!(repo.get_by_name("s1").unwrap().is_none());
    }

    #[test]
    fn corrupt_status_surfaces_as_corrupt_row() {
        let repo = repo();
        let rec = repo.create(&new_instance("s1")).unwrap();
        repo.db
            .with_conn(|conn| {
                conn.execute("UPDATE instances SET status = 'paired' WHERE id = ?1", [rec.id.as_str()])?;
                Ok(())
            })
            .unwrap();
        assert!(matches!(
            repo.get(&rec.id),
            Err(StoreError::CorruptRow { column: "status", .. })
        ));
    }

    #[test]
    fn list_each_isolates_bad_rows() {
        let repo = repo();
        let good = repo.create(&new_instance("good")).unwrap();
        let bad = repo.create(&new_instance("bad")).unwrap();
        repo.db
            .with_conn(|conn| {
                conn.execute("UPDATE instances SET status = '???' WHERE id = ?1", [bad.id.as_str()])?;
                Ok(())
            })
            .unwrap();

        assert!(repo.list().is_err());
        let rows = repo.list_each().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(rows[0].as_ref().unwrap().id, good.id);
    }
}
