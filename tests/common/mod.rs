//! Shared helpers for the integration suites.

use converge::test_utils;

/// Register fixture types and wire up test logging.
pub fn setup() {
    test_utils::init_test_logging(None);
    test_utils::register_fixtures().expect("fixture registration");
}

/// Register the bundled plugins as well.
#[allow(dead_code)]
pub fn setup_with_plugins() {
    setup();
    converge::plugins::register_all().expect("plugin registration");
}
