pub mod debug;
pub mod dmrd;
pub mod ipsc;
pub mod rewrite;

pub use dmrd::{DmrdDecodeError, DmrdPacket};
pub use rewrite::{Rule, RuleResult};
