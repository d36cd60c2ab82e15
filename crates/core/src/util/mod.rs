pub mod time_source;

mod local_addr;

pub use local_addr::{is_local_target, lan_address};
