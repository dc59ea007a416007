use sea_orm::entity::prelude::*;

use super::template;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "template_days")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub template_id: i64,
    pub day_number: i32,
    pub task_order: i32,
    pub title: String,
    pub description: Option<String>,
    pub is_required: bool,
}

#[derive(Copy, Clone, Debug, EnumIter)]
pub enum Relation {
    Template,
}

impl RelationTrait for Relation {
    fn def(&self) -> RelationDef {
        match self {
            Self::Template => Entity::belongs_to(template::Entity)
                .from(Column::TemplateId)
                .to(template::Column::Id)
                .into(),
        }
    }
}

impl Related<template::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Template.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
