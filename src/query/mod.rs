pub mod resolver;

pub use resolver::{is_truncated_query, QueryResolver, TRUNCATED_QUERY_LEN};
