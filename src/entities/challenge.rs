use sea_orm::entity::prelude::*;
use serde::Serialize;

use super::{daily_log, day_task, template};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize)]
#[sea_orm(table_name = "challenges")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_id: String,
    pub template_id: Option<i64>,
    pub title: String,
    pub mode: String,
    pub status: String,
    pub start_date: Date,
    pub end_date: Option<Date>,
    pub duration_days: i32,
    pub current_day: i32,
    pub streak_count: i32,
    pub achievement_rate: i32,
    pub last_check_date: Option<Date>,
    pub restart_count: i32,
    pub extension_count: i32,
    pub review: Option<String>,
    pub ai_summary: Option<String>,
    pub color: String,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter)]
pub enum Relation {
    Template,
    DayTask,
    DailyLog,
}

impl RelationTrait for Relation {
    fn def(&self) -> RelationDef {
        match self {
            Self::Template => Entity::belongs_to(template::Entity)
                .from(Column::TemplateId)
                .to(template::Column::Id)
                .into(),
            Self::DayTask => Entity::has_many(day_task::Entity).into(),
            Self::DailyLog => Entity::has_many(daily_log::Entity).into(),
        }
    }
}

impl Related<template::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Template.def()
    }
}

impl Related<day_task::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DayTask.def()
    }
}

impl Related<daily_log::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DailyLog.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
