pub mod ack;
pub mod decoder;
pub mod dispatcher;
pub mod guard;
pub mod live;
pub mod writer;
