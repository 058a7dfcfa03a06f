//! Messages on the comm bus and the flow control that orders them.

pub mod msg_tracker;
pub mod msgs;

pub use msg_tracker::MsgTracker;
pub use msgs::PsMsg;
