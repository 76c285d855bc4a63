mod query;
mod target;
mod user;

pub use query::{Bound, Direction, FieldFilter, FilterOperator, LimitType, OrderBy, Query};
pub use target::{Target, TargetData, TargetId, TargetPurpose};
pub use user::User;
