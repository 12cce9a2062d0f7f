use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "remediations")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub status: i16,
    pub incident_name: String,
    pub incident_id: i64,
    /// JSON-encoded array of entity strings.
    #[sea_orm(column_type = "Text")]
    pub entities: String,
    /// Unix seconds.
    pub start_time: i64,
    /// Unix seconds; null while the remediation is still active.
    pub end_time: Option<i64>,
    pub task_id: String,
    pub attempts: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
