mod array_value;
mod bytes_value;
mod map_value;
mod value;

pub use array_value::ArrayValue;
pub use bytes_value::BytesValue;
pub use map_value::MapValue;
pub use value::{compare_values, values_equal, FirestoreValue, ValueKind};
