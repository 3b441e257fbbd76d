pub mod notification;
pub mod processed_event;
