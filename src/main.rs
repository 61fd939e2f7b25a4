use std::time::Duration;

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let outcome = runtime.block_on(toolproxy::run());
    // A pending stdin read would otherwise hold shutdown open.
    runtime.shutdown_timeout(Duration::from_secs(1));
    outcome
}
