pub mod challenge;
pub mod daily_log;
pub mod day_task;
pub mod event;
pub mod event_user;
pub mod invitation;
pub mod template;
pub mod template_day;
