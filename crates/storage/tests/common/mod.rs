pub mod fixtures;
pub mod mocks;

#[allow(unused_imports)]
pub use fixtures::{entry_json, session_url};
#[allow(unused_imports)]
pub use mocks::InstrumentedStore;
