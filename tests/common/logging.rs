use tracing_subscriber::EnvFilter;
use tracing_subscriber::FmtSubscriber;

/// the #[traced_test] decorator does not work well with integration
/// tests because each test modules runs in its own crate, and the
/// decorator macro filters out events from ssp_ps.
///
/// A solution is to NOT use #[traced_test] and instead call this
/// method at start of each test.
pub fn tracing_logger() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("self=debug,ssp_ps=info"));
    let subscriber = FmtSubscriber::builder()
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .with_env_filter(env_filter)
        .with_thread_ids(true)
        .with_thread_names(true)
        .finish();

    // fails when another test of this binary already installed one.
    let _result = tracing::subscriber::set_global_default(subscriber);
}
