pub mod fixture;
pub mod queue_assertions;
pub mod test_harness;

pub use fixture::Fixture;
pub use mock_news::{NewsBuilder, DEFAULT_TIMESTAMP};
pub use queue_assertions::{wait_until, QueueAssertions};
pub use test_harness::TestHarness;
