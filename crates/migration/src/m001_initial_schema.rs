use sea_orm_migration::prelude::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m001_initial_schema"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Remediations::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Remediations::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Remediations::Status)
                            .small_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Remediations::IncidentName)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Remediations::IncidentId)
                            .big_integer()
                            .not_null(),
                    )
                    // JSON-encoded array of entity strings
                    .col(
                        ColumnDef::new(Remediations::Entities)
                            .text()
                            .not_null()
                            .default("[]"),
                    )
                    .col(
                        ColumnDef::new(Remediations::StartTime)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Remediations::EndTime).big_integer())
                    .col(
                        ColumnDef::new(Remediations::TaskId)
                            .string()
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(Remediations::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_remediations_incident_id")
                    .table(Remediations::Table)
                    .col(Remediations::IncidentId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_remediations_incident_name")
                    .table(Remediations::Table)
                    .col(Remediations::IncidentName)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Commands::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Commands::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Commands::RemediationId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Commands::Command).text().not_null())
                    .col(ColumnDef::new(Commands::Retcode).integer().not_null())
                    .col(ColumnDef::new(Commands::Runtime).big_integer().not_null())
                    .col(ColumnDef::new(Commands::Logs).text().not_null())
                    .col(ColumnDef::new(Commands::Results).text().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_commands_remediation_id")
                    .table(Commands::Table)
                    .col(Commands::RemediationId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Commands::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Remediations::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(Iden)]
enum Remediations {
    Table,
    Id,
    Status,
    IncidentName,
    IncidentId,
    Entities,
    StartTime,
    EndTime,
    TaskId,
    Attempts,
}

#[derive(Iden)]
enum Commands {
    Table,
    Id,
    RemediationId,
    Command,
    Retcode,
    Runtime,
    Logs,
    Results,
}
