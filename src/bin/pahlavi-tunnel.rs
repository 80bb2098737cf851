use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

fn main() -> anyhow::Result<()> {
    let tunables: &'static pahlavi_tunnel::config::Tunables =
        Box::leak(Box::new(pahlavi_tunnel::config::Tunables::from_env()));

    tracing_subscriber::registry()
        .with(fmt::layer().compact())
        .with(
            EnvFilter::builder()
                .with_default_directive(format!("pahlavi_tunnel={}", tunables.log_level).parse()?)
                .from_env_lossy(),
        )
        .init();

    pahlavi_tunnel::raise_nofile_limit(tunables.nofile_target);
    let nofile_soft = pahlavi_tunnel::current_nofile_soft();

    let stop: &'static pahlavi_tunnel::stop::StopSignal =
        Box::leak(Box::new(pahlavi_tunnel::stop::StopSignal::new()));
    pahlavi_tunnel::install_signal_handler(stop)?;

    let bootstrapped = pahlavi_tunnel::bootstrap::bootstrap(tunables, nofile_soft)?;

    smolscale::block_on(pahlavi_tunnel::run_role(bootstrapped, tunables, stop))
}
