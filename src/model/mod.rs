//! Change record, domain table identity and dependency hierarchy (C2).

pub mod change;
pub mod hierarchy;
pub mod table;

pub use change::{Change, Op};
pub use hierarchy::{dependency_level, order_for_apply};
pub use table::Table;
