use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "commands")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub remediation_id: i64,
    #[sea_orm(column_type = "Text")]
    pub command: String,
    pub retcode: i32,
    /// Wall-clock runtime in seconds.
    pub runtime: i64,
    /// Captured stderr.
    #[sea_orm(column_type = "Text")]
    pub logs: String,
    /// Captured stdout, or the executor error string.
    #[sea_orm(column_type = "Text")]
    pub results: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
