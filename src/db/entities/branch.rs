//! Branch entity (one row per repository branch, soft-deleted on removal)

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "branches")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub repo_id: i64,
    pub name: String,        // relative to refs/heads/
    pub commit_id: String,   // 40-char hex SHA1
    pub commit_message: String,
    pub commit_time: i64,
    pub pusher_id: i64,
    pub is_deleted: bool,
    pub deleted_by_id: Option<i64>,
    pub deleted_unix: Option<i64>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::repository::Entity",
        from = "Column::RepoId",
        to = "super::repository::Column::Id"
    )]
    Repository,
}

impl Related<super::repository::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Repository.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
