pub mod activity;
pub mod common;
pub mod conflicts;
pub mod history;
pub mod next_id;
pub mod record;
pub mod status;
pub mod sync;
