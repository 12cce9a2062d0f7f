use crate::entities::{command, remediation};
use crate::error::{Result, StorageError};
use crate::Store;
use async_trait::async_trait;
use autorem_common::types::{CommandRecord, Remediation, Status};
use chrono::DateTime;
use migration::{Migrator, MigratorTrait};
use sea_orm::ActiveValue::{NotSet, Set};
use sea_orm::{
    ColumnTrait, Condition, ConnectOptions, Database, DatabaseConnection, EntityTrait,
    IdenStatic, Iterable, QueryFilter,
};
use std::collections::HashMap;
use std::time::Duration;

/// SeaORM-backed [`Store`] over the `remediations` and `commands` tables.
pub struct SqlStore {
    db: DatabaseConnection,
}

impl SqlStore {
    /// Connects and runs all pending migrations.
    pub async fn connect(url: &str, connect_timeout: Duration) -> anyhow::Result<SqlStore> {
        let mut opts = ConnectOptions::new(url.to_owned());
        opts.connect_timeout(connect_timeout);
        let db = Database::connect(opts).await?;
        Migrator::up(&db, None).await?;
        tracing::info!("initialized remediation store");
        Ok(SqlStore { db })
    }
}

fn remediation_to_active(rem: &Remediation) -> Result<remediation::ActiveModel> {
    Ok(remediation::ActiveModel {
        id: if rem.id == 0 { NotSet } else { Set(rem.id) },
        status: Set(rem.status as i16),
        incident_name: Set(rem.incident_name.clone()),
        incident_id: Set(rem.incident_id),
        entities: Set(serde_json::to_string(&rem.entities)?),
        start_time: Set(rem.start_time.timestamp()),
        end_time: Set(rem.end_time.map(|t| t.timestamp())),
        task_id: Set(rem.task_id.clone()),
        attempts: Set(rem.attempts),
    })
}

fn remediation_from_model(model: remediation::Model) -> Result<Remediation> {
    Ok(Remediation {
        id: model.id,
        status: Status::from_i16(model.status)
            .ok_or(StorageError::InvalidStatus(model.status))?,
        incident_name: model.incident_name,
        incident_id: model.incident_id,
        entities: serde_json::from_str(&model.entities)?,
        start_time: DateTime::from_timestamp(model.start_time, 0).unwrap_or_default(),
        end_time: model.end_time.and_then(|t| DateTime::from_timestamp(t, 0)),
        task_id: model.task_id,
        attempts: model.attempts,
    })
}

fn command_to_active(cmd: &CommandRecord) -> command::ActiveModel {
    command::ActiveModel {
        id: if cmd.id == 0 { NotSet } else { Set(cmd.id) },
        remediation_id: Set(cmd.remediation_id),
        command: Set(cmd.command.clone()),
        retcode: Set(cmd.retcode),
        runtime: Set(cmd.runtime),
        logs: Set(cmd.logs.clone()),
        results: Set(cmd.results.clone()),
    }
}

fn command_from_model(model: command::Model) -> CommandRecord {
    CommandRecord {
        id: model.id,
        remediation_id: model.remediation_id,
        command: model.command,
        retcode: model.retcode,
        runtime: model.runtime,
        logs: model.logs,
        results: model.results,
    }
}

/// Builds an AND-equality condition from query-string params, resolving
/// each key against the entity's column set.
fn equality_condition<C>(table: &str, params: &HashMap<String, String>) -> Result<Condition>
where
    C: ColumnTrait + IdenStatic + Iterable,
{
    let mut cond = Condition::all();
    for (key, value) in params {
        let column = C::iter()
            .find(|c| c.as_str() == key)
            .ok_or_else(|| StorageError::UnknownColumn {
                table: table.to_string(),
                column: key.clone(),
            })?;
        if let Ok(number) = value.parse::<i64>() {
            cond = cond.add(column.eq(number));
        } else {
            cond = cond.add(column.eq(value.as_str()));
        }
    }
    Ok(cond)
}

#[async_trait]
impl Store for SqlStore {
    async fn new_remediation(&self, rem: &Remediation) -> Result<i64> {
        let model = remediation_to_active(rem)?;
        let res = remediation::Entity::insert(model).exec(&self.db).await?;
        Ok(res.last_insert_id)
    }

    async fn update_remediation(&self, rem: &Remediation) -> Result<()> {
        if rem.id == 0 {
            return Err(StorageError::NotFound {
                entity: "remediation",
                id: 0,
            });
        }
        let model = remediation_to_active(rem)?;
        remediation::Entity::update(model).exec(&self.db).await?;
        Ok(())
    }

    async fn remediations_by_incident(&self, incident_id: i64) -> Result<Vec<Remediation>> {
        let rows = remediation::Entity::find()
            .filter(remediation::Column::IncidentId.eq(incident_id))
            .all(&self.db)
            .await?;
        rows.into_iter().map(remediation_from_model).collect()
    }

    async fn remediations_by_entity(
        &self,
        incident_name: &str,
        entities: &[String],
    ) -> Result<Vec<Remediation>> {
        let rows = remediation::Entity::find()
            .filter(remediation::Column::IncidentName.eq(incident_name))
            .all(&self.db)
            .await?;
        // Entity containment is checked here rather than in SQL: the
        // column is a JSON-encoded array and candidate sets per alert
        // name are small.
        let mut out = Vec::new();
        for row in rows {
            let rem = remediation_from_model(row)?;
            if entities.iter().all(|e| rem.entities.contains(e)) {
                out.push(rem);
            }
        }
        Ok(out)
    }

    async fn new_command(&self, cmd: &CommandRecord) -> Result<i64> {
        let model = command_to_active(cmd);
        let res = command::Entity::insert(model).exec(&self.db).await?;
        Ok(res.last_insert_id)
    }

    async fn query(
        &self,
        table: &str,
        params: &HashMap<String, String>,
    ) -> Result<Vec<serde_json::Value>> {
        match table {
            "remediations" => {
                let cond = equality_condition::<remediation::Column>(table, params)?;
                let rows = remediation::Entity::find()
                    .filter(cond)
                    .all(&self.db)
                    .await?;
                rows.into_iter()
                    .map(|m| Ok(serde_json::to_value(remediation_from_model(m)?)?))
                    .collect()
            }
            "commands" => {
                let cond = equality_condition::<command::Column>(table, params)?;
                let rows = command::Entity::find().filter(cond).all(&self.db).await?;
                rows.into_iter()
                    .map(|m| Ok(serde_json::to_value(command_from_model(m))?))
                    .collect()
            }
            other => Err(StorageError::UnknownTable(other.to_string())),
        }
    }

    async fn close(&self) -> Result<()> {
        self.db.clone().close().await?;
        Ok(())
    }
}
