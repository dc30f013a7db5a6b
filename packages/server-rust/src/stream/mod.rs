//! Task stream plumbing: bus, accepters, dispatch, dedup.

pub mod accepter;
pub mod bus;
pub mod dedup;
pub mod dispatcher;

pub use accepter::{
    register_accepter, AcceptContext, AccepterFactory, AccepterTable, HandlerError, TaskAccepter,
};
pub use bus::StreamBus;
pub use dedup::RecentMessageSet;
pub use dispatcher::{PollReport, TaskDispatcher};
